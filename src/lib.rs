// lib.rs - Main library entry point
//
// emberbase is a local-first reactive triple store. Data lives in a durable
// entity-attribute-value log, queries evaluate continuously against the
// materialized view, and a background sync client replays local transactions
// to the remote server and merges remote ones back in.

pub mod auth;
mod client;
mod config;
mod error;
pub mod live;
pub mod query;
pub mod store;
pub mod sync;
pub mod tx;
mod value;

pub use auth::{AuthClient, AuthUser};
pub use client::EmberClient;
pub use config::{EmberConfig, StorageKind, Validator};
pub use error::{Error, Result};
pub use live::{LiveResult, Subscription};
pub use query::Query;
pub use sync::SyncState;
pub use tx::{lookup, Operation, TxChunk, TxResult, TxStatus};
