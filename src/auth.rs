// auth.rs - Session management against the remote auth endpoints
//
// Consumes the magic-code + guest flow: request a code, verify it (or sign
// in as a guest), hold the session token for the sync channel, and persist
// the session in store metadata so it survives restart. Credential issuance
// itself lives on the server.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{watch, Notify, RwLock};

use crate::store::Store;
use crate::{Error, Result};

const TOKEN_KEY: &str = "auth.token";
const USER_KEY: &str = "auth.user";

/// The signed-in user as seen by this client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    pub email: Option<String>,
    #[serde(default)]
    pub guest: bool,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    token: String,
    user: AuthUser,
}

pub struct AuthClient {
    app_id: String,
    base_url: String,
    http: reqwest::Client,
    store: Store,
    /// Shared with the sync client, which sends it in the init frame
    token: Arc<RwLock<Option<String>>>,
    session_changed: Arc<Notify>,
    user_tx: watch::Sender<Option<AuthUser>>,
}

impl AuthClient {
    pub(crate) fn new(
        app_id: String,
        base_url: String,
        store: Store,
        token: Arc<RwLock<Option<String>>>,
        session_changed: Arc<Notify>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        let (user_tx, _) = watch::channel(None);
        Ok(Self {
            app_id,
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            store,
            token,
            session_changed,
            user_tx,
        })
    }

    /// Reactive view of the signed-in user
    pub fn current_user(&self) -> watch::Receiver<Option<AuthUser>> {
        self.user_tx.subscribe()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.token.read().await.is_some()
    }

    /// The current session token, for callers talking to other services
    pub async fn session_token(&self) -> Result<String> {
        self.token
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::NotAuthenticated("No active session".to_string()))
    }

    /// Reload a persisted session from store metadata
    pub(crate) async fn restore_session(&self) -> Result<()> {
        let Some(token) = self.store.metadata_get(TOKEN_KEY).await? else {
            return Ok(());
        };
        if token.is_empty() {
            return Ok(());
        }

        let user = match self.store.metadata_get(USER_KEY).await? {
            Some(raw) if !raw.is_empty() => serde_json::from_str(&raw).ok(),
            _ => None,
        };
        let user = user.or_else(|| claims_user(&token));

        *self.token.write().await = Some(token);
        self.user_tx.send_replace(user);
        tracing::info!("Restored persisted session");
        Ok(())
    }

    /// Ask the server to email a one-time code
    pub async fn send_magic_code(&self, email: &str) -> Result<()> {
        let url = format!("{}/auth/magic-code", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({"appId": self.app_id, "email": email}))
            .send()
            .await
            .map_err(|e| Error::Network(format!("Magic code request failed: {}", e)))?;

        check_auth_status(response).await?;
        tracing::info!("Magic code sent to {}", email);
        Ok(())
    }

    /// Exchange a received code for a session
    pub async fn verify_magic_code(&self, email: &str, code: &str) -> Result<AuthUser> {
        let url = format!("{}/auth/verify", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({"appId": self.app_id, "email": email, "code": code}))
            .send()
            .await
            .map_err(|e| Error::Network(format!("Verify request failed: {}", e)))?;

        let session: SessionResponse = check_auth_status(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::Auth(format!("Failed to parse session response: {}", e)))?;
        self.install_session(session).await
    }

    /// Anonymous session with a server-minted guest identity
    pub async fn sign_in_as_guest(&self) -> Result<AuthUser> {
        let url = format!("{}/auth/guest", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({"appId": self.app_id}))
            .send()
            .await
            .map_err(|e| Error::Network(format!("Guest sign-in request failed: {}", e)))?;

        let session: SessionResponse = check_auth_status(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::Auth(format!("Failed to parse session response: {}", e)))?;
        self.install_session(session).await
    }

    /// Drop the session locally; the remote revoke is best-effort
    pub async fn sign_out(&self) -> Result<()> {
        if let Some(token) = self.token.read().await.clone() {
            let url = format!("{}/auth/signout", self.base_url);
            if let Err(e) = self.http.post(&url).bearer_auth(token).send().await {
                tracing::debug!("Sign-out request failed, clearing locally: {}", e);
            }
        }

        self.store.metadata_set(TOKEN_KEY, "").await?;
        self.store.metadata_set(USER_KEY, "").await?;
        *self.token.write().await = None;
        self.user_tx.send_replace(None);
        self.session_changed.notify_waiters();
        tracing::info!("Signed out");
        Ok(())
    }

    async fn install_session(&self, session: SessionResponse) -> Result<AuthUser> {
        self.store.metadata_set(TOKEN_KEY, &session.token).await?;
        self.store
            .metadata_set(USER_KEY, &serde_json::to_string(&session.user)?)
            .await?;
        *self.token.write().await = Some(session.token);
        self.user_tx.send_replace(Some(session.user.clone()));
        // The sync channel re-handshakes with the new token
        self.session_changed.notify_waiters();

        tracing::info!("Signed in as {}", session.user.id);
        Ok(session.user)
    }
}

async fn check_auth_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    if status.is_client_error() {
        Err(Error::Auth(format!("{}: {}", status, body)))
    } else {
        Err(Error::Network(format!("{}: {}", status, body)))
    }
}

/// Decode the claims segment of a JWT without verifying the signature.
/// Only used to rebuild the local user view when the snapshot is missing;
/// the server is the one that actually checks the token.
fn claims_user(token: &str) -> Option<AuthUser> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    Some(AuthUser {
        id: claims.get("sub")?.as_str()?.to_string(),
        email: claims
            .get("email")
            .and_then(|v| v.as_str())
            .map(String::from),
        guest: claims
            .get("guest")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;

    fn auth_client(store: Store) -> AuthClient {
        AuthClient::new(
            "app-test".to_string(),
            "http://localhost:1".to_string(),
            store,
            Arc::new(RwLock::new(None)),
            Arc::new(Notify::new()),
        )
        .unwrap()
    }

    fn fake_jwt(claims: serde_json::Value) -> String {
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        format!(
            "{}.{}.{}",
            engine.encode(r#"{"alg":"none"}"#),
            engine.encode(claims.to_string()),
            engine.encode("sig")
        )
    }

    #[test]
    fn test_claims_user_decodes_subject() {
        let token = fake_jwt(json!({"sub": "u1", "email": "e@x", "guest": false}));
        let user = claims_user(&token).unwrap();
        assert_eq!(user.id, "u1");
        assert_eq!(user.email.as_deref(), Some("e@x"));
        assert!(!user.guest);

        assert!(claims_user("garbage").is_none());
    }

    #[tokio::test]
    async fn test_restore_session_from_metadata() {
        let store = Store::with_backend(Arc::new(MemoryBackend::new()));
        store.metadata_set(TOKEN_KEY, "the-token").await.unwrap();
        store
            .metadata_set(
                USER_KEY,
                &serde_json::to_string(&AuthUser {
                    id: "u1".to_string(),
                    email: None,
                    guest: true,
                })
                .unwrap(),
            )
            .await
            .unwrap();

        let auth = auth_client(store);
        auth.restore_session().await.unwrap();

        assert!(auth.is_authenticated().await);
        assert_eq!(auth.session_token().await.unwrap(), "the-token");
        let user = auth.current_user().borrow().clone().unwrap();
        assert_eq!(user.id, "u1");
        assert!(user.guest);
    }

    #[tokio::test]
    async fn test_sign_out_clears_session_without_network() {
        let store = Store::with_backend(Arc::new(MemoryBackend::new()));
        let auth = auth_client(store.clone());

        // No token, so no remote call happens
        auth.sign_out().await.unwrap();
        assert!(!auth.is_authenticated().await);
        assert!(matches!(
            auth.session_token().await,
            Err(Error::NotAuthenticated(_))
        ));

        // Restore treats the cleared markers as signed out
        auth.restore_session().await.unwrap();
        assert!(!auth.is_authenticated().await);
    }
}
