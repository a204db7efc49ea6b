// sync/mod.rs - Duplex sync client
//
// Maintains one persistent WebSocket to the server. On entering Ready the
// pending queue flushes in timestamp order; acks mark transactions synced;
// inbound transactions apply through the transaction engine under status
// synced, so echoes of our own transactions are no-ops. Every failure path
// funnels into exponential backoff with jitter.

pub mod protocol;

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::store::{Store, TransactionRecord};
use crate::tx::{OpKind, Transaction, TransactionEngine, TxStatus};
use crate::{Error, Result};

use protocol::{Frame, INIT_ACK_ID};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(90);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Draining,
    Backoff,
}

/// How a connection ended when it was not an error
enum ConnectionEnd {
    /// Shutdown requested; do not reconnect
    Shutdown,
    /// Remote closed or the session changed; reconnect without backoff growth
    Reconnect,
}

pub struct SyncClient {
    app_id: String,
    base_url: String,
    reconnect_delay: Duration,
    store: Store,
    engine: Arc<TransactionEngine>,
    token: Arc<RwLock<Option<String>>>,
    /// Fired by the auth layer on sign-in/sign-out; forces a fresh handshake
    session_changed: Arc<Notify>,
    state_tx: watch::Sender<SyncState>,
    online_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
}

impl SyncClient {
    pub fn new(
        app_id: String,
        base_url: String,
        reconnect_delay: Duration,
        engine: Arc<TransactionEngine>,
        token: Arc<RwLock<Option<String>>>,
        session_changed: Arc<Notify>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SyncState::Disconnected);
        let (online_tx, _) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            app_id,
            base_url,
            reconnect_delay,
            store: engine.store().clone(),
            engine,
            token,
            session_changed,
            state_tx,
            online_tx,
            shutdown_tx,
        }
    }

    /// Full state machine, for diagnostics
    pub fn state(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    /// The connectivity signal: true iff Ready, transitions deduplicated
    pub fn online(&self) -> watch::Receiver<bool> {
        self.online_tx.subscribe()
    }

    /// Stop the run loop; in-flight sends are cancelled
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn set_state(&self, state: SyncState) {
        self.state_tx.send_replace(state);
        let online = state == SyncState::Ready;
        self.online_tx.send_if_modified(|current| {
            if *current != online {
                *current = online;
                true
            } else {
                false
            }
        });
    }

    /// Connection supervisor; runs until shutdown
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(SyncState::Connecting);
            match self.connect_and_stream(&mut shutdown).await {
                Ok(ConnectionEnd::Shutdown) => break,
                Ok(ConnectionEnd::Reconnect) => {
                    attempt = 0;
                    tracing::info!("Sync connection closed, reconnecting");
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    tracing::warn!("Sync connection error (attempt {}): {}", attempt, e);
                }
            }

            self.set_state(SyncState::Backoff);
            let delay = with_jitter(backoff_delay(self.reconnect_delay, attempt));
            tracing::debug!("Reconnecting in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.session_changed.notified() => {}
                _ = shutdown.changed() => {}
            }
        }

        self.set_state(SyncState::Disconnected);
    }

    async fn connect_and_stream(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ConnectionEnd> {
        let url = self.websocket_url()?;
        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| Error::Network("WebSocket connect timed out".to_string()))??;

        tracing::info!("Sync channel connected: {}", url);
        self.set_state(SyncState::Authenticating);
        let (mut write, mut read) = ws.split();

        let token = self.token.read().await.clone();
        write
            .send(
                Frame::Init {
                    app_id: self.app_id.clone(),
                    token,
                }
                .to_message()?,
            )
            .await?;

        let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => return Frame::parse(&text),
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(Error::Network(
                            "Connection closed during handshake".to_string(),
                        ))
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        })
        .await
        .map_err(|_| Error::Network("Handshake timed out".to_string()))??;

        match handshake {
            Frame::Ack { tx_id } if tx_id == INIT_ACK_ID => {}
            Frame::Error { code, message } => {
                return Err(Error::Auth(format!("Init rejected ({}): {}", code, message)))
            }
            other => {
                return Err(Error::Protocol(format!(
                    "Unexpected handshake frame: {:?}",
                    other
                )))
            }
        }

        self.set_state(SyncState::Ready);
        self.flush_pending(&mut write).await?;

        let pending = self.engine.pending_signal();
        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_heard = Instant::now();

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(message)) => {
                        last_heard = Instant::now();
                        if let Some(end) = self.handle_message(message, &mut write).await? {
                            return Ok(end);
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(ConnectionEnd::Reconnect),
                },
                _ = ping_interval.tick() => {
                    if last_heard.elapsed() > HEALTH_TIMEOUT {
                        return Err(Error::Network("Health check timed out".to_string()));
                    }
                    write.send(Message::Ping(Vec::new())).await?;
                }
                _ = pending.notified() => {
                    self.flush_pending(&mut write).await?;
                }
                _ = self.session_changed.notified() => {
                    tracing::info!("Session changed, re-authenticating sync channel");
                    return Ok(ConnectionEnd::Reconnect);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.set_state(SyncState::Draining);
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(ConnectionEnd::Shutdown);
                    }
                }
            }
        }
    }

    async fn handle_message(
        &self,
        message: Message,
        write: &mut WsSink,
    ) -> Result<Option<ConnectionEnd>> {
        match message {
            Message::Text(text) => {
                self.handle_frame(Frame::parse(&text)?).await?;
                Ok(None)
            }
            Message::Ping(data) => {
                write.send(Message::Pong(data)).await?;
                Ok(None)
            }
            Message::Close(_) => Ok(Some(ConnectionEnd::Reconnect)),
            _ => Ok(None),
        }
    }

    async fn handle_frame(&self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Ack { tx_id } if tx_id == INIT_ACK_ID => Ok(()),
            Frame::Ack { tx_id } => {
                if let Err(e) = self.store.set_transaction_status(&tx_id, TxStatus::Synced).await {
                    tracing::warn!("Ack for unknown transaction {}: {}", tx_id, e);
                } else {
                    tracing::debug!("Transaction {} acknowledged", tx_id);
                }
                Ok(())
            }
            Frame::Tx {
                tx_id,
                operations,
                timestamp,
            } => {
                let tx = Transaction::remote(tx_id.clone(), operations, timestamp);
                match self.engine.apply(tx).await {
                    Ok(_) => Ok(()),
                    // Storage failures poison the session; domain failures
                    // only poison that transaction
                    Err(e @ Error::Storage(_)) => Err(e),
                    Err(e) => {
                        tracing::warn!("Dropping remote transaction {}: {}", tx_id, e);
                        Ok(())
                    }
                }
            }
            Frame::Error { code, message } => {
                tracing::warn!("Server error frame ({}): {}", code, message);
                Ok(())
            }
            Frame::Init { .. } | Frame::Transact { .. } => Err(Error::Protocol(
                "Outbound frame received on inbound channel".to_string(),
            )),
        }
    }

    /// Ship every pending transaction, oldest first. Re-sending an already
    /// applied transaction is safe: the engine is idempotent by txId.
    async fn flush_pending(&self, write: &mut WsSink) -> Result<()> {
        let pending = self.store.pending_transactions().await?;
        let clean = self.quarantine_corrupt(pending).await?;
        if clean.is_empty() {
            return Ok(());
        }

        tracing::info!("Flushing {} pending transactions", clean.len());
        for record in clean {
            write
                .send(
                    Frame::Transact {
                        tx_id: record.id,
                        operations: record.operations,
                    }
                    .to_message()?,
                )
                .await?;
        }
        Ok(())
    }

    /// Quarantine pending transactions whose delete targets a list-shaped
    /// entity id. Those ids come from an old serialization bug; shipping
    /// them would wedge the queue, so they fail instead.
    async fn quarantine_corrupt(
        &self,
        pending: Vec<TransactionRecord>,
    ) -> Result<Vec<TransactionRecord>> {
        let mut clean = Vec::with_capacity(pending.len());
        for record in pending {
            let corrupt = record.operations.iter().any(|op| {
                op.kind == OpKind::Delete
                    && op.entity_id.starts_with('[')
                    && op.entity_id.ends_with(']')
            });
            if corrupt {
                tracing::warn!(
                    "Quarantining transaction {} with list-shaped delete id",
                    record.id
                );
                self.store
                    .set_transaction_status(&record.id, TxStatus::Failed)
                    .await?;
            } else {
                clean.push(record);
            }
        }
        Ok(clean)
    }

    fn websocket_url(&self) -> Result<String> {
        let base = self.base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else if base.starts_with("ws://") || base.starts_with("wss://") {
            base.to_string()
        } else {
            return Err(Error::Config(format!(
                "Unsupported base url: {}",
                self.base_url
            )));
        };
        Ok(format!("{}/sync", ws_base))
    }
}

/// wait = min(cap, base * 2^(attempt-1)); attempt 0 means no failure yet
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    if attempt == 0 {
        return base.min(MAX_BACKOFF);
    }
    let exp = attempt.min(16) - 1;
    base.saturating_mul(2u32.saturating_pow(exp)).min(MAX_BACKOFF)
}

/// +-25% so a fleet of clients does not reconnect in lockstep
fn with_jitter(delay: Duration) -> Duration {
    use rand::Rng;
    let factor: f64 = 1.0 + rand::thread_rng().gen_range(-0.25..0.25);
    delay.mul_f64(factor.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;
    use crate::tx::TxChunk;
    use serde_json::json;

    #[test]
    fn test_backoff_growth_and_cap() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 5), Duration::from_secs(16));
        assert_eq!(backoff_delay(base, 30), MAX_BACKOFF);
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let delay = Duration::from_secs(10);
        for _ in 0..50 {
            let jittered = with_jitter(delay);
            assert!(jittered >= Duration::from_millis(7_400));
            assert!(jittered <= Duration::from_millis(12_600));
        }
    }

    fn sync_client(base_url: &str, engine: Arc<TransactionEngine>) -> SyncClient {
        SyncClient::new(
            "app-test".to_string(),
            base_url.to_string(),
            Duration::from_millis(20),
            engine,
            Arc::new(RwLock::new(None)),
            Arc::new(Notify::new()),
        )
    }

    fn memory_engine() -> Arc<TransactionEngine> {
        let store = Store::with_backend(Arc::new(MemoryBackend::new()));
        Arc::new(TransactionEngine::new(store, None))
    }

    #[test]
    fn test_websocket_url_mapping() {
        let engine = memory_engine();
        let client = sync_client("https://api.example.com/", engine.clone());
        assert_eq!(client.websocket_url().unwrap(), "wss://api.example.com/sync");

        let client = sync_client("http://127.0.0.1:9000", engine.clone());
        assert_eq!(client.websocket_url().unwrap(), "ws://127.0.0.1:9000/sync");

        let client = sync_client("ftp://nope", engine);
        assert!(client.websocket_url().is_err());
    }

    /// In-process WebSocket server that acks init and every transact frame.
    /// When `echo` is set it also bounces each transaction back as a tx
    /// frame before acking, like the real server does to its subscribers.
    async fn spawn_ack_server(echo: bool) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Text(text) => match Frame::parse(&text).unwrap() {
                        Frame::Init { .. } => {
                            let ack = Frame::Ack {
                                tx_id: INIT_ACK_ID.to_string(),
                            };
                            ws.send(ack.to_message().unwrap()).await.unwrap();
                        }
                        Frame::Transact { tx_id, operations } => {
                            if echo {
                                let tx = Frame::Tx {
                                    tx_id: tx_id.clone(),
                                    operations: operations.clone(),
                                    timestamp: chrono::Utc::now(),
                                };
                                ws.send(tx.to_message().unwrap()).await.unwrap();
                            }
                            let ack = Frame::Ack { tx_id };
                            ws.send(ack.to_message().unwrap()).await.unwrap();
                        }
                        _ => {}
                    },
                    Message::Ping(data) => {
                        ws.send(Message::Pong(data)).await.unwrap();
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });
        (addr, handle)
    }

    async fn wait_until_drained(store: &Store) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if store.pending_transactions().await.unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pending queue never drained");
    }

    #[tokio::test]
    async fn test_offline_transactions_flush_on_reconnect() {
        let engine = memory_engine();
        let store = engine.store().clone();

        // Offline: three local transactions stay pending
        for i in 0..3 {
            let op = TxChunk::new("todos")
                .id(format!("t{}", i))
                .add(json!({"n": i}))
                .unwrap();
            engine.apply(Transaction::new(vec![op])).await.unwrap();
        }
        assert_eq!(store.pending_transactions().await.unwrap().len(), 3);
        let triples_before = store.triple_count().await.unwrap();

        let (addr, server) = spawn_ack_server(false).await;
        let client = Arc::new(sync_client(&format!("http://{}", addr), engine));
        let mut online = client.online();
        let run = tokio::spawn(client.clone().run());

        tokio::time::timeout(Duration::from_secs(5), async {
            while !*online.borrow() {
                online.changed().await.unwrap();
            }
        })
        .await
        .expect("never came online");

        wait_until_drained(&store).await;

        // All three acked, local state untouched
        assert_eq!(store.triple_count().await.unwrap(), triples_before);
        client.shutdown();
        let _ = run.await;
        server.abort();
        assert!(!*client.online().borrow());
    }

    #[tokio::test]
    async fn test_remote_echo_is_a_no_op() {
        let engine = memory_engine();
        let store = engine.store().clone();

        let op = TxChunk::new("todos")
            .id("t1")
            .add(json!({"text": "A"}))
            .unwrap();
        engine.apply(Transaction::new(vec![op])).await.unwrap();
        let triples_before = store.triple_count().await.unwrap();

        // Drain the local apply's change batch, then watch for more
        let mut changes = engine.subscribe_changes();
        while changes.try_recv().is_ok() {}

        let (addr, server) = spawn_ack_server(true).await;
        let client = Arc::new(sync_client(&format!("http://{}", addr), engine));
        let run = tokio::spawn(client.clone().run());

        wait_until_drained(&store).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The echoed transaction produced no new triples and no new events
        assert_eq!(store.triple_count().await.unwrap(), triples_before);
        assert!(changes.try_recv().is_err());

        client.shutdown();
        let _ = run.await;
        server.abort();
    }

    #[tokio::test]
    async fn test_rejected_init_backs_off() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            if let Some(Ok(Message::Text(_))) = ws.next().await {
                let nack = Frame::Error {
                    code: "auth".to_string(),
                    message: "bad token".to_string(),
                };
                ws.send(nack.to_message().unwrap()).await.unwrap();
            }
        });

        let engine = memory_engine();
        let client = Arc::new(sync_client(&format!("http://{}", addr), engine));
        let mut state = client.state();
        let run = tokio::spawn(client.clone().run());

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if *state.borrow() == SyncState::Backoff {
                    break;
                }
                state.changed().await.unwrap();
            }
        })
        .await
        .expect("never reached backoff");
        assert!(!*client.online().borrow());

        client.shutdown();
        let _ = run.await;
        server.abort();
    }

    #[tokio::test]
    async fn test_corruption_guard_quarantines_list_shaped_delete_ids() {
        let engine = memory_engine();
        let store = engine.store().clone();

        let good = TxChunk::new("todos").id("t1").delete();
        engine
            .apply(Transaction::new(vec![good]))
            .await
            .unwrap();

        // A delete whose entity id looks like a serialized list
        let bad = TxChunk::new("todos").id(r#"["a","b"]"#).delete();
        let bad_tx = Transaction::new(vec![bad]);
        let bad_id = bad_tx.id.clone();
        engine.apply(bad_tx).await.unwrap();

        let client = sync_client("http://localhost:1", engine);
        let pending = store.pending_transactions().await.unwrap();
        assert_eq!(pending.len(), 2);

        let clean = client.quarantine_corrupt(pending).await.unwrap();
        assert_eq!(clean.len(), 1);
        assert_ne!(clean[0].id, bad_id);

        // The quarantined transaction is failed and never fetched again
        let pending = store.pending_transactions().await.unwrap();
        assert_eq!(pending.len(), 1);
    }
}
