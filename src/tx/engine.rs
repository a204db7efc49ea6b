// tx/engine.rs - Transaction application
//
// The single write path. Local and remote transactions both come through
// apply(): idempotency check, lookup-reference resolution, atomic batch
// write, then a post-commit change broadcast. Mutations serialize on the
// writer lock; readers see committed state only.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{broadcast, Mutex, Notify};

use super::{as_lookup, OpKind, Operation, Transaction, TxResult, TxStatus};
use crate::config::Validator;
use crate::store::{Store, TransactionRecord, Triple, TripleWrite, TYPE_ATTR};
use crate::{Error, Result};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// One observed mutation of the triple log
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeKind {
    Added,
    Retracted,
}

/// A change to a single (entity, attribute) as seen by subscribers
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub entity_type: String,
    pub entity_id: String,
    pub attribute: String,
    pub value: Value,
    pub tx_id: String,
}

/// Every change event of one transaction, in application order.
///
/// Broadcasting whole batches is what keeps a transaction's changes
/// contiguous for subscribers.
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    pub tx_id: String,
    pub events: Vec<ChangeEvent>,
}

/// Applies transactions against the store and fans out change batches
pub struct TransactionEngine {
    store: Store,
    validator: Option<Arc<Validator>>,
    writer: Mutex<()>,
    changes: broadcast::Sender<ChangeBatch>,
    pending: Arc<Notify>,
}

impl TransactionEngine {
    pub fn new(store: Store, validator: Option<Arc<Validator>>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            store,
            validator,
            writer: Mutex::new(()),
            changes,
            pending: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Change batches, one per applied transaction
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeBatch> {
        self.changes.subscribe()
    }

    /// Signalled whenever a locally committed transaction lands (the sync
    /// client waits on this to flush the pending queue)
    pub fn pending_signal(&self) -> Arc<Notify> {
        self.pending.clone()
    }

    /// Apply one transaction atomically.
    ///
    /// A transaction id already present in the log is a no-op; this is the
    /// sole defense against duplicate application, so remote echoes of our
    /// own transactions fall out here.
    pub async fn apply(&self, tx: Transaction) -> Result<TxResult> {
        let _guard = self.writer.lock().await;

        if self.store.transaction_exists(&tx.id).await? {
            tracing::debug!("Transaction {} already applied, skipping", tx.id);
            let status = match tx.status {
                TxStatus::Pending => TxStatus::Committed,
                other => other,
            };
            return Ok(TxResult {
                tx_id: tx.id,
                status,
            });
        }

        let operations = self.resolve_lookups(tx.operations.clone()).await?;
        self.validate(&operations)?;

        let status = match tx.status {
            TxStatus::Pending => TxStatus::Committed,
            other => other,
        };

        let mut view = TxView::new(&self.store);
        let mut writes = Vec::new();
        let mut events = Vec::new();
        for op in &operations {
            self.plan_operation(op, &tx, &mut view, &mut writes, &mut events)
                .await?;
        }

        let record = TransactionRecord {
            id: tx.id.clone(),
            timestamp: tx.timestamp,
            status,
            operations,
        };
        self.store.apply_batch(&record, &writes).await?;

        tracing::debug!(
            "Applied transaction {} ({} writes, {} events)",
            record.id,
            writes.len(),
            events.len()
        );

        if !events.is_empty() {
            // Send only after the log write committed; no subscribers is fine
            let _ = self.changes.send(ChangeBatch {
                tx_id: record.id.clone(),
                events,
            });
        }
        if status == TxStatus::Committed {
            // notify_one keeps a permit when nobody is waiting yet, so a
            // commit racing the sync client's select loop is not lost
            self.pending.notify_one();
        }

        Ok(TxResult {
            tx_id: record.id,
            status,
        })
    }

    fn validate(&self, operations: &[Operation]) -> Result<()> {
        let Some(validator) = &self.validator else {
            return Ok(());
        };
        for op in operations {
            if let Some(data) = &op.data {
                for (attribute, value) in data {
                    validator(&op.entity_type, attribute, value)
                        .map_err(Error::InvalidInput)?;
                }
            }
        }
        Ok(())
    }

    /// Rewrite every lookup reference in operation data to a literal id
    async fn resolve_lookups(&self, operations: Vec<Operation>) -> Result<Vec<Operation>> {
        let mut resolved = Vec::with_capacity(operations.len());
        for mut op in operations {
            if let Some(data) = op.data.take() {
                let mut out = Map::new();
                for (attribute, value) in data {
                    out.insert(attribute, self.resolve_value(value).await?);
                }
                op.data = Some(out);
            }
            resolved.push(op);
        }
        Ok(resolved)
    }

    async fn resolve_value(&self, value: Value) -> Result<Value> {
        if let Some((ty, attr, needle)) = as_lookup(&value) {
            return self.resolve_reference(&ty, &attr, &needle).await.map(Value::String);
        }
        // Lookups may sit one level deep inside reference lists
        if let Value::Array(items) = value {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match as_lookup(&item) {
                    Some((ty, attr, needle)) => out.push(Value::String(
                        self.resolve_reference(&ty, &attr, &needle).await?,
                    )),
                    None => out.push(item),
                }
            }
            return Ok(Value::Array(out));
        }
        Ok(value)
    }

    async fn resolve_reference(&self, ty: &str, attr: &str, needle: &Value) -> Result<String> {
        let of_type: std::collections::HashSet<String> = self
            .store
            .entity_ids_of_type(ty)
            .await?
            .into_iter()
            .collect();
        let candidates = self.store.triples_for_attribute(attr).await?;
        for triple in candidates {
            if &triple.value == needle && of_type.contains(&triple.entity_id) {
                return Ok(triple.entity_id);
            }
        }
        Err(Error::LookupFailed(format!(
            "No {} with {} = {}",
            ty, attr, needle
        )))
    }

    async fn plan_operation(
        &self,
        op: &Operation,
        tx: &Transaction,
        view: &mut TxView<'_>,
        writes: &mut Vec<TripleWrite>,
        events: &mut Vec<ChangeEvent>,
    ) -> Result<()> {
        match op.kind {
            OpKind::Add => {
                let mut data = op.data.clone().unwrap_or_default();
                data.insert(
                    TYPE_ATTR.to_string(),
                    Value::String(op.entity_type.clone()),
                );
                for (attribute, value) in data {
                    self.plan_insert(op, tx, view, writes, events, attribute, value);
                }
            }
            OpKind::Update => {
                let data = op.data.clone().unwrap_or_default();
                for (attribute, value) in data {
                    self.plan_replace(op, tx, view, writes, events, attribute, value)
                        .await?;
                }
            }
            OpKind::Merge => {
                let data = op.data.clone().unwrap_or_default();
                let current = view.materialize(&op.entity_id).await?;
                for (attribute, incoming) in data {
                    let prior = current.get(&attribute);
                    let merged = match prior {
                        Some(existing) => crate::value::deep_merge(existing, &incoming),
                        None => incoming,
                    };
                    // Only structurally changed attributes produce writes
                    if prior != Some(&merged) {
                        self.plan_replace(op, tx, view, writes, events, attribute, merged)
                            .await?;
                    }
                }
            }
            OpKind::Delete => {
                let live = view.live(&op.entity_id).await?;
                if !live.is_empty() {
                    writes.push(TripleWrite::RetractEntity {
                        entity_id: op.entity_id.clone(),
                    });
                    // One retraction per triple so subscribers see
                    // field-level removal
                    for triple in live {
                        view.retract(&op.entity_id, &triple.attribute, &triple.value);
                        events.push(self.event(op, tx, ChangeKind::Retracted, triple.attribute, triple.value));
                    }
                }
            }
            OpKind::Link => {
                let data = op.data.clone().unwrap_or_default();
                for (attribute, value) in data {
                    self.plan_insert(op, tx, view, writes, events, attribute, value);
                }
            }
            OpKind::Unlink | OpKind::Retract => {
                let data = op.data.clone().unwrap_or_default();
                for (attribute, value) in data {
                    let matched = view.live_matching(&op.entity_id, &attribute, &value).await?;
                    if !matched.is_empty() {
                        writes.push(TripleWrite::RetractValue {
                            entity_id: op.entity_id.clone(),
                            attribute: attribute.clone(),
                            value: value.clone(),
                        });
                        for triple in matched {
                            view.retract(&op.entity_id, &triple.attribute, &triple.value);
                            events.push(self.event(
                                op,
                                tx,
                                ChangeKind::Retracted,
                                triple.attribute,
                                triple.value,
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn plan_insert(
        &self,
        op: &Operation,
        tx: &Transaction,
        view: &mut TxView<'_>,
        writes: &mut Vec<TripleWrite>,
        events: &mut Vec<ChangeEvent>,
        attribute: String,
        value: Value,
    ) {
        let triple = Triple {
            entity_id: op.entity_id.clone(),
            attribute: attribute.clone(),
            value: value.clone(),
            tx_id: tx.id.clone(),
            created_at: tx.timestamp,
            retracted: false,
        };
        view.insert(triple.clone());
        writes.push(TripleWrite::Insert(triple));
        events.push(self.event(op, tx, ChangeKind::Added, attribute, value));
    }

    /// Retract any live triples on the attribute, then insert the new value
    async fn plan_replace(
        &self,
        op: &Operation,
        tx: &Transaction,
        view: &mut TxView<'_>,
        writes: &mut Vec<TripleWrite>,
        events: &mut Vec<ChangeEvent>,
        attribute: String,
        value: Value,
    ) -> Result<()> {
        let priors = view.live_for_attribute(&op.entity_id, &attribute).await?;
        if !priors.is_empty() {
            writes.push(TripleWrite::RetractAttribute {
                entity_id: op.entity_id.clone(),
                attribute: attribute.clone(),
            });
            for prior in priors {
                view.retract(&op.entity_id, &prior.attribute, &prior.value);
                events.push(self.event(op, tx, ChangeKind::Retracted, prior.attribute, prior.value));
            }
        }
        self.plan_insert(op, tx, view, writes, events, attribute, value);
        Ok(())
    }

    fn event(
        &self,
        op: &Operation,
        tx: &Transaction,
        kind: ChangeKind,
        attribute: String,
        value: Value,
    ) -> ChangeEvent {
        ChangeEvent {
            kind,
            entity_type: op.entity_type.clone(),
            entity_id: op.entity_id.clone(),
            attribute,
            value,
            tx_id: tx.id.clone(),
        }
    }
}

/// Working view of entity state inside one transaction.
///
/// Operations later in the transaction see the effects of earlier ones,
/// even though nothing has hit the store yet.
struct TxView<'a> {
    store: &'a Store,
    cache: HashMap<String, Vec<Triple>>,
}

impl<'a> TxView<'a> {
    fn new(store: &'a Store) -> Self {
        Self {
            store,
            cache: HashMap::new(),
        }
    }

    async fn load(&mut self, entity_id: &str) -> Result<&mut Vec<Triple>> {
        if !self.cache.contains_key(entity_id) {
            let triples = self.store.triples_for_entity(entity_id).await?;
            self.cache.insert(entity_id.to_string(), triples);
        }
        Ok(self.cache.get_mut(entity_id).expect("just inserted"))
    }

    async fn live(&mut self, entity_id: &str) -> Result<Vec<Triple>> {
        let triples = self.load(entity_id).await?;
        Ok(triples.iter().filter(|t| !t.retracted).cloned().collect())
    }

    async fn live_for_attribute(
        &mut self,
        entity_id: &str,
        attribute: &str,
    ) -> Result<Vec<Triple>> {
        Ok(self
            .live(entity_id)
            .await?
            .into_iter()
            .filter(|t| t.attribute == attribute)
            .collect())
    }

    async fn live_matching(
        &mut self,
        entity_id: &str,
        attribute: &str,
        value: &Value,
    ) -> Result<Vec<Triple>> {
        Ok(self
            .live_for_attribute(entity_id, attribute)
            .await?
            .into_iter()
            .filter(|t| &t.value == value)
            .collect())
    }

    /// Current attribute map of the entity (oldest write first, newest wins)
    async fn materialize(&mut self, entity_id: &str) -> Result<Map<String, Value>> {
        let mut map = Map::new();
        for triple in self.live(entity_id).await? {
            map.insert(triple.attribute, triple.value);
        }
        Ok(map)
    }

    fn insert(&mut self, triple: Triple) {
        self.cache
            .entry(triple.entity_id.clone())
            .or_default()
            .push(triple);
    }

    fn retract(&mut self, entity_id: &str, attribute: &str, value: &Value) {
        if let Some(triples) = self.cache.get_mut(entity_id) {
            for t in triples.iter_mut() {
                if t.attribute == attribute && &t.value == value && !t.retracted {
                    t.retracted = true;
                }
            }
        }
    }
}
