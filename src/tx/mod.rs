// tx/mod.rs - Transaction and operation model

mod builder;
pub mod engine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub use builder::{tx, TxChunk};
pub use engine::{ChangeBatch, ChangeEvent, ChangeKind, TransactionEngine};

/// The kind of mutation an operation performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    /// Insert fresh triples from `data`
    Add,
    /// Retract the prior value of each touched attribute, then insert
    Update,
    /// Deep-merge `data` into the entity, writing only changed attributes
    Merge,
    /// Retract every non-retracted triple of the entity
    Delete,
    /// Insert a reference-valued triple
    Link,
    /// Retract a reference-valued triple
    Unlink,
    /// Per-(attribute, value) retraction
    Retract,
}

/// A single mutation against one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(rename = "op")]
    pub kind: OpKind,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(rename = "id")]
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

/// Lifecycle status of a transaction
///
/// `Pending` on creation, `Committed` once applied locally, `Synced` once
/// the remote acknowledged it. `Failed` is terminal and never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Committed,
    Failed,
    Synced,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Committed => "committed",
            TxStatus::Failed => "failed",
            TxStatus::Synced => "synced",
        }
    }

    pub fn parse(s: &str) -> Option<TxStatus> {
        match s {
            "pending" => Some(TxStatus::Pending),
            "committed" => Some(TxStatus::Committed),
            "failed" => Some(TxStatus::Failed),
            "synced" => Some(TxStatus::Synced),
            _ => None,
        }
    }
}

/// An ordered set of operations applied atomically under one id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub operations: Vec<Operation>,
    pub timestamp: DateTime<Utc>,
    pub status: TxStatus,
}

impl Transaction {
    /// Create a fresh pending transaction with a v4 id
    pub fn new(operations: Vec<Operation>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            operations,
            timestamp: Utc::now(),
            status: TxStatus::Pending,
        }
    }

    /// Rebuild a transaction received from the remote (server-assigned id)
    pub fn remote(id: String, operations: Vec<Operation>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            operations,
            timestamp,
            status: TxStatus::Synced,
        }
    }
}

/// What `transact` hands back to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxResult {
    pub tx_id: String,
    pub status: TxStatus,
}

const LOOKUP_KEY: &str = "$lookup";

/// Build a lookup reference for use inside operation data.
///
/// Resolved to the id of the unique entity of `entity_type` whose
/// `attribute` equals `value` before the transaction applies; an
/// unresolvable reference fails the whole transaction.
pub fn lookup(entity_type: &str, attribute: &str, value: impl Into<Value>) -> Value {
    serde_json::json!({
        LOOKUP_KEY: {
            "type": entity_type,
            "attribute": attribute,
            "value": value.into(),
        }
    })
}

/// Decompose a value previously built by [`lookup`]
pub(crate) fn as_lookup(value: &Value) -> Option<(String, String, Value)> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    let inner = obj.get(LOOKUP_KEY)?.as_object()?;
    Some((
        inner.get("type")?.as_str()?.to_string(),
        inner.get("attribute")?.as_str()?.to_string(),
        inner.get("value")?.clone(),
    ))
}
