// client.rs - Client handle and subsystem wiring
//
// EmberClient owns the store, the transaction engine, the subscription
// pump, and (when enabled) the background sync task. It is created
// explicitly and owned by its caller; there is no process-level singleton.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{watch, Notify, RwLock};
use tokio::task::JoinHandle;

use crate::auth::{AuthClient, AuthUser};
use crate::config::{EmberConfig, Validator};
use crate::live::{Subscription, SubscriptionManager};
use crate::query::{Query, QueryCache, QueryEngine};
use crate::store::Store;
use crate::sync::{SyncClient, SyncState};
use crate::tx::{Operation, Transaction, TransactionEngine, TxResult};
use crate::{Error, Result};

pub struct EmberClient {
    app_id: String,
    store: Store,
    engine: Arc<TransactionEngine>,
    query_engine: QueryEngine,
    cache: Arc<QueryCache>,
    subscriptions: Arc<SubscriptionManager>,
    auth: Arc<AuthClient>,
    sync: Option<Arc<SyncClient>>,
    /// Stand-in connectivity signal for sync-disabled clients
    offline: watch::Sender<bool>,
    pump: JoinHandle<()>,
    sync_task: Option<JoinHandle<()>>,
}

impl EmberClient {
    /// Initialize a client for one app
    ///
    /// Opens (and migrates) the store, starts the subscription pump, and
    /// spawns the sync client unless `sync_enabled` is off.
    pub async fn init(app_id: impl Into<String>, mut config: EmberConfig) -> Result<Self> {
        let app_id = app_id.into();

        if config.verbose_logging {
            // Best-effort: the embedding application may already have one
            let _ = tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
                )
                .try_init();
        }

        let store = Store::open(&config).await?;
        let validator: Option<Arc<Validator>> = config.validator.take().map(Arc::from);
        let engine = Arc::new(TransactionEngine::new(store.clone(), validator));
        let query_engine = QueryEngine::new(store.clone());
        let cache = Arc::new(QueryCache::new(
            config.max_cached_queries,
            config.max_cache_size,
        ));
        let subscriptions = SubscriptionManager::new(query_engine.clone());
        let pump = subscriptions.start(engine.subscribe_changes(), Some(cache.clone()));

        let token = Arc::new(RwLock::new(None));
        let session_changed = Arc::new(Notify::new());
        let auth = Arc::new(AuthClient::new(
            app_id.clone(),
            config.base_url.clone(),
            store.clone(),
            token.clone(),
            session_changed.clone(),
        )?);
        auth.restore_session().await?;

        let (sync, sync_task) = if config.sync_enabled {
            let sync = Arc::new(SyncClient::new(
                app_id.clone(),
                config.base_url.clone(),
                config.reconnect_delay,
                engine.clone(),
                token,
                session_changed,
            ));
            let task = tokio::spawn(sync.clone().run());
            (Some(sync), Some(task))
        } else {
            tracing::info!("Sync disabled, running purely local");
            (None, None)
        };

        let (offline, _) = watch::channel(false);

        tracing::info!("emberbase client initialized for app {}", app_id);
        Ok(Self {
            app_id,
            store,
            engine,
            query_engine,
            cache,
            subscriptions,
            auth,
            sync,
            offline,
            pump,
            sync_task,
        })
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Apply a transaction built from the given operations.
    ///
    /// The local apply is synchronous with this call; shipping to the
    /// server happens in the background and never fails the caller.
    pub async fn transact(&self, operations: Vec<Operation>) -> Result<TxResult> {
        if operations.is_empty() {
            return Err(Error::InvalidInput(
                "Transaction has no operations".to_string(),
            ));
        }
        self.engine.apply(Transaction::new(operations)).await
    }

    /// One-shot query evaluation
    pub async fn query(&self, query: &Query) -> Result<Vec<Value>> {
        let key = query.cache_key();
        if let Some(rows) = self.cache.get(&key).await {
            return Ok(rows);
        }
        let rows = self.query_engine.execute(query).await?;
        self.cache.put(key, rows.clone()).await;
        Ok(rows)
    }

    /// Live query; the handle starts in Loading and tracks every relevant
    /// change until dropped
    pub fn subscribe(&self, query: Query) -> Subscription {
        self.subscriptions.subscribe(query)
    }

    pub fn auth(&self) -> &AuthClient {
        &self.auth
    }

    pub fn current_user(&self) -> watch::Receiver<Option<AuthUser>> {
        self.auth.current_user()
    }

    /// True iff the sync channel is Ready
    pub fn connection_status(&self) -> watch::Receiver<bool> {
        match &self.sync {
            Some(sync) => sync.online(),
            None => self.offline.subscribe(),
        }
    }

    /// Full sync state machine; None when sync is disabled
    pub fn sync_state(&self) -> Option<watch::Receiver<SyncState>> {
        self.sync.as_ref().map(|s| s.state())
    }

    /// Locally applied transactions not yet acknowledged by the server
    pub async fn pending_count(&self) -> Result<usize> {
        Ok(self.store.pending_transactions().await?.len())
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Drop all local state (triples, transactions, session)
    pub async fn clear(&self) -> Result<()> {
        self.store.clear().await?;
        self.cache.invalidate_all().await;
        Ok(())
    }

    /// Stop background tasks; pending transactions stay in the log and
    /// ship on the next start
    pub async fn shutdown(self) {
        if let Some(sync) = &self.sync {
            sync.shutdown();
        }
        if let Some(task) = self.sync_task {
            let _ = task.await;
        }
        self.pump.abort();
        tracing::info!("emberbase client shut down");
    }
}
