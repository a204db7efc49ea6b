// live/mod.rs - Reactive query subscriptions
//
// A subscription pairs a query with its current result and a watch channel.
// A background pump consumes change batches from the transaction engine,
// re-evaluates the subscriptions a batch could affect, and publishes only
// results that structurally differ from the cached ones. Dropping the
// handle unsubscribes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::query::{Query, QueryCache, QueryEngine};
use crate::tx::ChangeBatch;
use serde_json::Value;

/// What a subscriber currently sees
#[derive(Debug, Clone, PartialEq)]
pub enum LiveResult {
    /// Initial state, before the first evaluation completes
    Loading,
    /// Evaluated rows; an empty result is a success, not loading
    Success(Vec<Value>),
    Error(String),
}

struct SubEntry {
    query: Query,
    last: Option<Vec<Value>>,
    sender: watch::Sender<LiveResult>,
}

type Registry = Arc<RwLock<HashMap<Uuid, SubEntry>>>;

/// Live handle to one subscribed query
///
/// The current result is always available through [`Subscription::current`];
/// [`Subscription::next`] waits for the following one. Dropping the handle
/// releases all retained state.
pub struct Subscription {
    id: Uuid,
    receiver: watch::Receiver<LiveResult>,
    registry: Weak<RwLock<HashMap<Uuid, SubEntry>>>,
}

impl Subscription {
    pub fn current(&self) -> LiveResult {
        self.receiver.borrow().clone()
    }

    /// Wait for the next published result; None once the client is gone
    pub async fn next(&mut self) -> Option<LiveResult> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    /// A raw watch receiver for select!-style consumers
    pub fn watch(&self) -> watch::Receiver<LiveResult> {
        self.receiver.clone()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut registry) = registry.write() {
                registry.remove(&self.id);
            }
        }
    }
}

/// Owns the subscription registry and the change pump
pub struct SubscriptionManager {
    registry: Registry,
    engine: QueryEngine,
}

impl SubscriptionManager {
    pub fn new(engine: QueryEngine) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(RwLock::new(HashMap::new())),
            engine,
        })
    }

    /// Register a query; the handle starts in Loading and receives the
    /// first evaluation as soon as it completes
    pub fn subscribe(self: &Arc<Self>, query: Query) -> Subscription {
        let id = Uuid::new_v4();
        let (sender, receiver) = watch::channel(LiveResult::Loading);

        {
            let mut registry = self.registry.write().expect("registry poisoned");
            registry.insert(
                id,
                SubEntry {
                    query: query.clone(),
                    last: None,
                    sender,
                },
            );
        }

        let manager = self.clone();
        tokio::spawn(async move {
            manager.evaluate_and_publish(id, &query).await;
        });

        Subscription {
            id,
            receiver,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.registry.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Spawn the pump consuming change batches from the engine
    pub fn start(
        self: &Arc<Self>,
        mut changes: broadcast::Receiver<ChangeBatch>,
        cache: Option<Arc<QueryCache>>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(batch) => {
                        if let Some(cache) = &cache {
                            cache.invalidate_all().await;
                        }
                        manager.on_batch(&batch).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(
                            "Subscription pump lagged by {} change batches, refreshing everything",
                            n
                        );
                        if let Some(cache) = &cache {
                            cache.invalidate_all().await;
                        }
                        manager.refresh_all().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn on_batch(&self, batch: &ChangeBatch) {
        let affected: Vec<(Uuid, Query)> = {
            let registry = self.registry.read().expect("registry poisoned");
            registry
                .iter()
                .filter(|(_, entry)| is_affected(&entry.query, batch))
                .map(|(id, entry)| (*id, entry.query.clone()))
                .collect()
        };
        for (id, query) in affected {
            self.evaluate_and_publish(id, &query).await;
        }
    }

    async fn refresh_all(&self) {
        let all: Vec<(Uuid, Query)> = {
            let registry = self.registry.read().expect("registry poisoned");
            registry
                .iter()
                .map(|(id, entry)| (*id, entry.query.clone()))
                .collect()
        };
        for (id, query) in all {
            self.evaluate_and_publish(id, &query).await;
        }
    }

    async fn evaluate_and_publish(&self, id: Uuid, query: &Query) {
        let outcome = self.engine.execute(query).await;

        let mut registry = self.registry.write().expect("registry poisoned");
        let Some(entry) = registry.get_mut(&id) else {
            // Unsubscribed while we were evaluating
            return;
        };
        match outcome {
            Ok(rows) => {
                if entry.last.as_ref() != Some(&rows) {
                    entry.last = Some(rows.clone());
                    let _ = entry.sender.send(LiveResult::Success(rows));
                }
            }
            Err(e) => {
                entry.last = None;
                let _ = entry.sender.send(LiveResult::Error(e.to_string()));
            }
        }
    }
}

/// Could this batch change the subscription's result?
///
/// Type match, id match, or a fully unfiltered query. Correctness over
/// selectivity: a false positive costs one re-evaluation.
fn is_affected(query: &Query, batch: &ChangeBatch) -> bool {
    if query.entity_type.is_none() && query.entity_id.is_none() {
        return true;
    }
    batch.events.iter().any(|event| {
        query.entity_id.as_deref() == Some(event.entity_id.as_str())
            || query.entity_type.as_deref() == Some(event.entity_type.as_str())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryBackend, Store};
    use crate::tx::{Transaction, TransactionEngine, TxChunk};
    use serde_json::json;

    struct Rig {
        tx: TransactionEngine,
        manager: Arc<SubscriptionManager>,
        _pump: JoinHandle<()>,
    }

    fn rig() -> Rig {
        let store = Store::with_backend(Arc::new(MemoryBackend::new()));
        let tx = TransactionEngine::new(store.clone(), None);
        let manager = SubscriptionManager::new(QueryEngine::new(store));
        let pump = manager.start(tx.subscribe_changes(), None);
        Rig {
            tx,
            manager,
            _pump: pump,
        }
    }

    async fn add_todo(tx: &TransactionEngine, id: &str, text: &str) {
        let op = TxChunk::new("todos")
            .id(id)
            .add(json!({"text": text}))
            .unwrap();
        tx.apply(Transaction::new(vec![op])).await.unwrap();
    }

    #[tokio::test]
    async fn test_loading_then_first_result() {
        let rig = rig();
        let mut sub = rig.manager.subscribe(Query::of("todos"));
        assert_eq!(sub.current(), LiveResult::Loading);

        let first = sub.next().await.unwrap();
        assert_eq!(first, LiveResult::Success(vec![]));
    }

    #[tokio::test]
    async fn test_commit_publishes_updated_result_once() {
        let rig = rig();
        let mut sub = rig.manager.subscribe(Query::of("todos"));
        assert_eq!(sub.next().await.unwrap(), LiveResult::Success(vec![]));

        add_todo(&rig.tx, "t1", "A").await;

        let updated = sub.next().await.unwrap();
        let LiveResult::Success(rows) = updated else {
            panic!("expected success");
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["text"], json!("A"));

        // Exactly one publication per transaction
        assert!(!sub.watch().has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_unrelated_type_not_notified() {
        let rig = rig();
        let mut sub = rig.manager.subscribe(Query::of("todos"));
        assert_eq!(sub.next().await.unwrap(), LiveResult::Success(vec![]));

        let op = TxChunk::new("notes")
            .id("n1")
            .add(json!({"body": "x"}))
            .unwrap();
        rig.tx.apply(Transaction::new(vec![op])).await.unwrap();

        // Give the pump a chance to run, then confirm nothing arrived
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!sub.watch().has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_identical_result_is_not_republished() {
        let rig = rig();
        let mut sub = rig
            .manager
            .subscribe(Query::of("todos").filter(json!({"text": "A"})).unwrap());
        assert_eq!(sub.next().await.unwrap(), LiveResult::Success(vec![]));

        // A todos write that leaves this query's result empty
        add_todo(&rig.tx, "t1", "B").await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!sub.watch().has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_query_error_surfaces_in_stream() {
        let rig = rig();
        add_todo(&rig.tx, "t1", "A").await;

        let mut sub = rig
            .manager
            .subscribe(Query::of("todos").filter(json!({"n": {"$bogus": 1}})).unwrap());

        let result = sub.next().await.unwrap();
        assert!(matches!(result, LiveResult::Error(_)));
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let rig = rig();
        let sub = rig.manager.subscribe(Query::of("todos"));
        assert_eq!(rig.manager.subscription_count(), 1);
        drop(sub);
        assert_eq!(rig.manager.subscription_count(), 0);
    }
}
