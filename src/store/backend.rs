// store/backend.rs - Storage backend seam

use async_trait::async_trait;
use serde_json::Value;

use super::{TransactionRecord, Triple};
use crate::tx::TxStatus;
use crate::Result;

/// One write inside an atomic batch
///
/// Retraction never removes rows; it flips the `retracted` flag on the
/// rows the selector matches.
#[derive(Debug, Clone)]
pub enum TripleWrite {
    Insert(Triple),
    /// Retract every live triple of the entity
    RetractEntity { entity_id: String },
    /// Retract live triples of one attribute of the entity
    RetractAttribute {
        entity_id: String,
        attribute: String,
    },
    /// Retract the live triple carrying exactly this value
    RetractValue {
        entity_id: String,
        attribute: String,
        value: Value,
    },
}

/// Durable storage for triples, transaction records, and metadata.
///
/// `apply_batch` is the only write path for triples and MUST be atomic:
/// either the record and every write land, or nothing does.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn apply_batch(&self, record: &TransactionRecord, writes: &[TripleWrite])
        -> Result<()>;

    async fn triples_for_entity(&self, entity_id: &str) -> Result<Vec<Triple>>;

    async fn triples_for_attribute(&self, attribute: &str) -> Result<Vec<Triple>>;

    async fn entity_ids_of_type(&self, entity_type: &str) -> Result<Vec<String>>;

    async fn all_entity_ids(&self) -> Result<Vec<String>>;

    async fn transaction_exists(&self, tx_id: &str) -> Result<bool>;

    async fn pending_transactions(&self) -> Result<Vec<TransactionRecord>>;

    async fn set_transaction_status(&self, tx_id: &str, status: TxStatus) -> Result<()>;

    async fn metadata_get(&self, key: &str) -> Result<Option<String>>;

    async fn metadata_set(&self, key: &str, value: &str) -> Result<()>;

    async fn triple_count(&self) -> Result<u64>;

    async fn clear(&self) -> Result<()>;
}
