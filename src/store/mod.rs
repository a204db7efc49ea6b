// store/mod.rs - Persistent triple log
//
// Three logical tables: triples, transactions, metadata. The triple log is
// append-only; retraction flips a flag and nothing is ever physically
// deleted. Everything is reachable through the StorageBackend trait so the
// sqlite and in-memory implementations are interchangeable.

mod backend;
pub mod crypto;
mod memory;
mod migrations;
mod sqlite;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{EmberConfig, StorageKind};
use crate::tx::{Operation, TxStatus};
use crate::Result;

pub use backend::{StorageBackend, TripleWrite};
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// Reserved attribute storing the entity type
pub const TYPE_ATTR: &str = "__type";

/// The atomic durable unit: one (entity, attribute, value) assertion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Triple {
    pub entity_id: String,
    pub attribute: String,
    pub value: Value,
    pub tx_id: String,
    pub created_at: DateTime<Utc>,
    pub retracted: bool,
}

/// Durable record of an applied transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub status: TxStatus,
    pub operations: Vec<Operation>,
}

/// Facade over the selected storage backend
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn StorageBackend>,
}

impl Store {
    /// Open the store described by the config
    pub async fn open(config: &EmberConfig) -> Result<Self> {
        let backend: Arc<dyn StorageBackend> = match config.storage_backend {
            StorageKind::Memory => Arc::new(MemoryBackend::new()),
            StorageKind::Sqlite => {
                let backend =
                    SqliteBackend::open(config.sqlite_path(), config.encrypted_storage).await?;
                Arc::new(backend)
            }
        };
        Ok(Self { backend })
    }

    /// Wrap an existing backend (tests, embedders with custom storage)
    pub fn with_backend(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Insert a transaction record and apply its triple writes atomically
    pub async fn apply_batch(
        &self,
        record: &TransactionRecord,
        writes: &[TripleWrite],
    ) -> Result<()> {
        self.backend.apply_batch(record, writes).await
    }

    /// All triples of one entity, oldest first
    pub async fn triples_for_entity(&self, entity_id: &str) -> Result<Vec<Triple>> {
        self.backend.triples_for_entity(entity_id).await
    }

    /// All non-retracted triples carrying one attribute
    pub async fn triples_for_attribute(&self, attribute: &str) -> Result<Vec<Triple>> {
        self.backend.triples_for_attribute(attribute).await
    }

    /// Distinct ids of live entities with `__type = entity_type`
    pub async fn entity_ids_of_type(&self, entity_type: &str) -> Result<Vec<String>> {
        self.backend.entity_ids_of_type(entity_type).await
    }

    /// Distinct ids of all live entities
    pub async fn all_entity_ids(&self) -> Result<Vec<String>> {
        self.backend.all_entity_ids().await
    }

    pub async fn transaction_exists(&self, tx_id: &str) -> Result<bool> {
        self.backend.transaction_exists(tx_id).await
    }

    /// Non-synced, non-failed transactions in timestamp order
    pub async fn pending_transactions(&self) -> Result<Vec<TransactionRecord>> {
        self.backend.pending_transactions().await
    }

    pub async fn set_transaction_status(&self, tx_id: &str, status: TxStatus) -> Result<()> {
        self.backend.set_transaction_status(tx_id, status).await
    }

    pub async fn metadata_get(&self, key: &str) -> Result<Option<String>> {
        self.backend.metadata_get(key).await
    }

    pub async fn metadata_set(&self, key: &str, value: &str) -> Result<()> {
        self.backend.metadata_set(key, value).await
    }

    /// Total number of triples, retracted included
    pub async fn triple_count(&self) -> Result<u64> {
        self.backend.triple_count().await
    }

    /// Drop all stored state
    pub async fn clear(&self) -> Result<()> {
        self.backend.clear().await
    }
}
