// store/memory.rs - In-memory storage backend
//
// Mirrors the sqlite backend's semantics over plain vectors guarded by one
// RwLock; the backend-level write lock is what makes apply_batch atomic.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::backend::{StorageBackend, TripleWrite};
use super::{TransactionRecord, Triple, TYPE_ATTR};
use crate::tx::TxStatus;
use crate::{Error, Result};

#[derive(Default)]
struct MemoryState {
    triples: Vec<Triple>,
    transactions: Vec<TransactionRecord>,
    metadata: HashMap<String, String>,
}

/// Storage backend with no persistence, used when the client is configured
/// for memory storage and throughout the test suite
#[derive(Default)]
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn apply_batch(
        &self,
        record: &TransactionRecord,
        writes: &[TripleWrite],
    ) -> Result<()> {
        let mut state = self.state.write().await;

        match state.transactions.iter_mut().find(|t| t.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => state.transactions.push(record.clone()),
        }

        for write in writes {
            match write {
                TripleWrite::Insert(triple) => {
                    let replaced = state.triples.iter_mut().find(|t| {
                        t.entity_id == triple.entity_id
                            && t.attribute == triple.attribute
                            && t.value == triple.value
                            && t.tx_id == triple.tx_id
                    });
                    match replaced {
                        Some(existing) => *existing = triple.clone(),
                        None => state.triples.push(triple.clone()),
                    }
                }
                TripleWrite::RetractEntity { entity_id } => {
                    for t in state
                        .triples
                        .iter_mut()
                        .filter(|t| &t.entity_id == entity_id && !t.retracted)
                    {
                        t.retracted = true;
                    }
                }
                TripleWrite::RetractAttribute {
                    entity_id,
                    attribute,
                } => {
                    for t in state.triples.iter_mut().filter(|t| {
                        &t.entity_id == entity_id && &t.attribute == attribute && !t.retracted
                    }) {
                        t.retracted = true;
                    }
                }
                TripleWrite::RetractValue {
                    entity_id,
                    attribute,
                    value,
                } => {
                    for t in state.triples.iter_mut().filter(|t| {
                        &t.entity_id == entity_id
                            && &t.attribute == attribute
                            && &t.value == value
                            && !t.retracted
                    }) {
                        t.retracted = true;
                    }
                }
            }
        }

        Ok(())
    }

    async fn triples_for_entity(&self, entity_id: &str) -> Result<Vec<Triple>> {
        let state = self.state.read().await;
        Ok(state
            .triples
            .iter()
            .filter(|t| t.entity_id == entity_id)
            .cloned()
            .collect())
    }

    async fn triples_for_attribute(&self, attribute: &str) -> Result<Vec<Triple>> {
        let state = self.state.read().await;
        Ok(state
            .triples
            .iter()
            .filter(|t| t.attribute == attribute && !t.retracted)
            .cloned()
            .collect())
    }

    async fn entity_ids_of_type(&self, entity_type: &str) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let mut ids: Vec<String> = state
            .triples
            .iter()
            .filter(|t| {
                t.attribute == TYPE_ATTR
                    && !t.retracted
                    && t.value.as_str() == Some(entity_type)
            })
            .map(|t| t.entity_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn all_entity_ids(&self) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let mut ids: Vec<String> = state
            .triples
            .iter()
            .filter(|t| !t.retracted)
            .map(|t| t.entity_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn transaction_exists(&self, tx_id: &str) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state.transactions.iter().any(|t| t.id == tx_id))
    }

    async fn pending_transactions(&self) -> Result<Vec<TransactionRecord>> {
        let state = self.state.read().await;
        let mut pending: Vec<TransactionRecord> = state
            .transactions
            .iter()
            .filter(|t| t.status != TxStatus::Synced && t.status != TxStatus::Failed)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps
        pending.sort_by_key(|t| t.timestamp);
        Ok(pending)
    }

    async fn set_transaction_status(&self, tx_id: &str, status: TxStatus) -> Result<()> {
        let mut state = self.state.write().await;
        let record = state
            .transactions
            .iter_mut()
            .find(|t| t.id == tx_id)
            .ok_or_else(|| Error::Storage(format!("Unknown transaction: {}", tx_id)))?;
        record.status = status;
        Ok(())
    }

    async fn metadata_get(&self, key: &str) -> Result<Option<String>> {
        let state = self.state.read().await;
        Ok(state.metadata.get(key).cloned())
    }

    async fn metadata_set(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.metadata.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn triple_count(&self) -> Result<u64> {
        let state = self.state.read().await;
        Ok(state.triples.len() as u64)
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state.write().await;
        *state = MemoryState::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn triple(entity: &str, attr: &str, value: serde_json::Value, tx: &str) -> Triple {
        Triple {
            entity_id: entity.to_string(),
            attribute: attr.to_string(),
            value,
            tx_id: tx.to_string(),
            created_at: Utc::now(),
            retracted: false,
        }
    }

    fn record(id: &str) -> TransactionRecord {
        TransactionRecord {
            id: id.to_string(),
            timestamp: Utc::now(),
            status: TxStatus::Committed,
            operations: vec![],
        }
    }

    #[tokio::test]
    async fn test_matches_sqlite_semantics() {
        let backend = MemoryBackend::new();
        backend
            .apply_batch(
                &record("tx1"),
                &[
                    TripleWrite::Insert(triple("t1", TYPE_ATTR, json!("todos"), "tx1")),
                    TripleWrite::Insert(triple("t1", "done", json!(false), "tx1")),
                ],
            )
            .await
            .unwrap();

        assert_eq!(
            backend.entity_ids_of_type("todos").await.unwrap(),
            vec!["t1".to_string()]
        );
        assert_eq!(backend.all_entity_ids().await.unwrap(), vec!["t1".to_string()]);

        backend
            .apply_batch(
                &record("tx2"),
                &[TripleWrite::RetractEntity {
                    entity_id: "t1".to_string(),
                }],
            )
            .await
            .unwrap();

        assert!(backend.all_entity_ids().await.unwrap().is_empty());
        // Rows survive retraction
        assert_eq!(backend.triple_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reinsert_same_tuple_replaces() {
        let backend = MemoryBackend::new();
        let t = triple("t1", "text", json!("A"), "tx1");
        backend
            .apply_batch(&record("tx1"), &[TripleWrite::Insert(t.clone())])
            .await
            .unwrap();
        backend
            .apply_batch(&record("tx1"), &[TripleWrite::Insert(t)])
            .await
            .unwrap();
        assert_eq!(backend.triple_count().await.unwrap(), 1);
    }
}
