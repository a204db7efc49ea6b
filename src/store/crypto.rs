// store/crypto.rs - At-rest encryption for stored triple values
//
// AES-256-GCM over the serialized JSON value column when the client is
// configured with encrypted_storage. Stored format is
// "enc:v1:<nonce_hex>:<ciphertext_hex>"; values without the prefix are
// read back as plaintext so an existing database can be opened after the
// option is turned on.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use crate::{Error, Result};

const ENCRYPTED_PREFIX: &str = "enc:v1:";

static ENCRYPTION_KEY: OnceLock<[u8; 32]> = OnceLock::new();

/// Key derivation: `EMBERBASE_ENCRYPTION_KEY` env override when long
/// enough, otherwise machine identity (hostname, username, home dir)
/// hashed with a static application salt. Keeps a copied database file
/// from being readable elsewhere without being real key management.
fn derive_key() -> [u8; 32] {
    let mut hasher = Sha256::new();

    if let Ok(key) = std::env::var("EMBERBASE_ENCRYPTION_KEY") {
        if key.len() >= 32 {
            hasher.update(key.as_bytes());
            return hasher.finalize().into();
        }
        tracing::warn!("EMBERBASE_ENCRYPTION_KEY too short (need 32+ chars), using machine key");
    }

    hasher.update(b"emberbase-store-v1");
    if let Ok(host) = hostname::get() {
        hasher.update(host.to_string_lossy().as_bytes());
    }
    if let Ok(user) = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .or_else(|_| std::env::var("LOGNAME"))
    {
        hasher.update(user.as_bytes());
    }
    if let Some(home) = dirs::home_dir() {
        hasher.update(home.to_string_lossy().as_bytes());
    }
    hasher.finalize().into()
}

fn key() -> &'static [u8; 32] {
    ENCRYPTION_KEY.get_or_init(derive_key)
}

/// Encrypt one serialized value column
pub fn encrypt(plaintext: &str) -> Result<String> {
    let cipher = Aes256Gcm::new(key().into());
    let nonce_bytes: [u8; 12] = rand::random();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

    Ok(format!(
        "{}{}:{}",
        ENCRYPTED_PREFIX,
        hex::encode(nonce_bytes),
        hex::encode(ciphertext)
    ))
}

/// Decrypt one stored value column; plaintext passes through untouched
pub fn decrypt(stored: &str) -> Result<String> {
    let Some(body) = stored.strip_prefix(ENCRYPTED_PREFIX) else {
        return Ok(stored.to_string());
    };

    let (nonce_hex, ciphertext_hex) = body
        .split_once(':')
        .ok_or_else(|| Error::Crypto("Invalid encrypted format".to_string()))?;

    let nonce_bytes = hex::decode(nonce_hex)
        .map_err(|e| Error::Crypto(format!("Invalid nonce hex: {}", e)))?;
    if nonce_bytes.len() != 12 {
        return Err(Error::Crypto(format!(
            "Invalid nonce length: expected 12, got {}",
            nonce_bytes.len()
        )));
    }
    let ciphertext = hex::decode(ciphertext_hex)
        .map_err(|e| Error::Crypto(format!("Invalid ciphertext hex: {}", e)))?;

    let cipher = Aes256Gcm::new(key().into());
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
        .map_err(|e| Error::Crypto(format!("Decryption failed: {}", e)))?;

    String::from_utf8(plaintext)
        .map_err(|e| Error::Crypto(format!("Invalid UTF-8 in decrypted value: {}", e)))
}
