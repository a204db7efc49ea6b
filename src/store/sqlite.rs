// store/sqlite.rs - SQLite storage backend

use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use super::backend::{StorageBackend, TripleWrite};
use super::{crypto, migrations, TransactionRecord, Triple, TYPE_ATTR};
use crate::tx::{Operation, TxStatus};
use crate::{Error, Result};

/// Durable triple log on SQLite
///
/// Uses WAL mode for concurrent readers. With `encrypted` set, the value
/// column is AES-GCM encrypted, which forces value matching (type lookups,
/// exact retraction) off SQL and into Rust.
pub struct SqliteBackend {
    pool: SqlitePool,
    encrypted: bool,
}

impl SqliteBackend {
    /// Open (and migrate) the database at `path`, or an in-memory one
    pub async fn open(path: Option<PathBuf>, encrypted: bool) -> Result<Self> {
        let db_url = match &path {
            Some(p) => {
                if let Some(parent) = p.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                format!("sqlite:{}", p.display())
            }
            None => "sqlite::memory:".to_string(),
        };

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            // Write-Ahead Logging for better concurrency
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        // An in-memory database exists per connection, so the pool must
        // never open a second one or rotate the first away.
        let in_memory = path.is_none();
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        migrations::run(&pool).await?;

        Ok(Self { pool, encrypted })
    }

    /// In-memory database, plaintext values
    pub async fn in_memory() -> Result<Self> {
        Self::open(None, false).await
    }

    fn encode_value(&self, value: &Value) -> Result<String> {
        let text = serde_json::to_string(value)?;
        if self.encrypted {
            crypto::encrypt(&text)
        } else {
            Ok(text)
        }
    }

    fn decode_value(&self, stored: &str) -> Result<Value> {
        let text = if self.encrypted {
            crypto::decrypt(stored)?
        } else {
            stored.to_string()
        };
        serde_json::from_str(&text).map_err(Error::from)
    }

    fn row_to_triple(
        &self,
        (entity_id, attribute, value, tx_id, created_at, retracted): TripleRow,
    ) -> Result<Triple> {
        Ok(Triple {
            entity_id,
            attribute,
            value: self.decode_value(&value)?,
            tx_id,
            created_at: parse_timestamp(&created_at)?,
            retracted: retracted != 0,
        })
    }
}

type TripleRow = (String, String, String, String, String, i64);

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("Bad stored timestamp {:?}: {}", raw, e)))
}

fn record_row(
    (id, timestamp, status, data): (String, String, String, String),
) -> Result<TransactionRecord> {
    let operations: Vec<Operation> = serde_json::from_str(&data)?;
    let status = TxStatus::parse(&status)
        .ok_or_else(|| Error::Storage(format!("Unknown transaction status {:?}", status)))?;
    Ok(TransactionRecord {
        id,
        timestamp: parse_timestamp(&timestamp)?,
        status,
        operations,
    })
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn apply_batch(
        &self,
        record: &TransactionRecord,
        writes: &[TripleWrite],
    ) -> Result<()> {
        let data = serde_json::to_string(&record.operations)?;
        let mut dbtx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO transactions (id, timestamp, status, synced, data)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(record.timestamp.to_rfc3339())
        .bind(record.status.as_str())
        .bind(record.status == TxStatus::Synced)
        .bind(&data)
        .execute(&mut *dbtx)
        .await?;

        for write in writes {
            match write {
                TripleWrite::Insert(triple) => {
                    sqlx::query(
                        r#"
                        INSERT OR REPLACE INTO triples
                            (entity_id, attribute, value, tx_id, created_at, retracted)
                        VALUES (?, ?, ?, ?, ?, 0)
                        "#,
                    )
                    .bind(&triple.entity_id)
                    .bind(&triple.attribute)
                    .bind(self.encode_value(&triple.value)?)
                    .bind(&triple.tx_id)
                    .bind(triple.created_at.to_rfc3339())
                    .execute(&mut *dbtx)
                    .await?;
                }
                TripleWrite::RetractEntity { entity_id } => {
                    sqlx::query(
                        "UPDATE triples SET retracted = 1 WHERE entity_id = ? AND retracted = 0",
                    )
                    .bind(entity_id)
                    .execute(&mut *dbtx)
                    .await?;
                }
                TripleWrite::RetractAttribute {
                    entity_id,
                    attribute,
                } => {
                    sqlx::query(
                        r#"
                        UPDATE triples SET retracted = 1
                        WHERE entity_id = ? AND attribute = ? AND retracted = 0
                        "#,
                    )
                    .bind(entity_id)
                    .bind(attribute)
                    .execute(&mut *dbtx)
                    .await?;
                }
                TripleWrite::RetractValue {
                    entity_id,
                    attribute,
                    value,
                } => {
                    if self.encrypted {
                        // Ciphertext is nonce-randomized, so the match runs
                        // over decrypted candidates and targets rowids.
                        let rows: Vec<(i64, String)> = sqlx::query_as(
                            r#"
                            SELECT rowid, value FROM triples
                            WHERE entity_id = ? AND attribute = ? AND retracted = 0
                            "#,
                        )
                        .bind(entity_id)
                        .bind(attribute)
                        .fetch_all(&mut *dbtx)
                        .await?;

                        for (rowid, stored) in rows {
                            if &self.decode_value(&stored)? == value {
                                sqlx::query("UPDATE triples SET retracted = 1 WHERE rowid = ?")
                                    .bind(rowid)
                                    .execute(&mut *dbtx)
                                    .await?;
                            }
                        }
                    } else {
                        sqlx::query(
                            r#"
                            UPDATE triples SET retracted = 1
                            WHERE entity_id = ? AND attribute = ? AND value = ? AND retracted = 0
                            "#,
                        )
                        .bind(entity_id)
                        .bind(attribute)
                        .bind(serde_json::to_string(value)?)
                        .execute(&mut *dbtx)
                        .await?;
                    }
                }
            }
        }

        dbtx.commit().await?;
        Ok(())
    }

    async fn triples_for_entity(&self, entity_id: &str) -> Result<Vec<Triple>> {
        let rows: Vec<TripleRow> = sqlx::query_as(
            r#"
            SELECT entity_id, attribute, value, tx_id, created_at, retracted
            FROM triples
            WHERE entity_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| self.row_to_triple(r)).collect()
    }

    async fn triples_for_attribute(&self, attribute: &str) -> Result<Vec<Triple>> {
        let rows: Vec<TripleRow> = sqlx::query_as(
            r#"
            SELECT entity_id, attribute, value, tx_id, created_at, retracted
            FROM triples
            WHERE attribute = ? AND retracted = 0
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(attribute)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| self.row_to_triple(r)).collect()
    }

    async fn entity_ids_of_type(&self, entity_type: &str) -> Result<Vec<String>> {
        if self.encrypted {
            let triples = self.triples_for_attribute(TYPE_ATTR).await?;
            let mut ids: Vec<String> = triples
                .into_iter()
                .filter(|t| t.value.as_str() == Some(entity_type))
                .map(|t| t.entity_id)
                .collect();
            ids.sort();
            ids.dedup();
            return Ok(ids);
        }

        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT entity_id FROM triples
            WHERE attribute = ? AND retracted = 0 AND value = ?
            ORDER BY entity_id
            "#,
        )
        .bind(TYPE_ATTR)
        .bind(serde_json::to_string(&Value::String(entity_type.to_string()))?)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn all_entity_ids(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT entity_id FROM triples WHERE retracted = 0 ORDER BY entity_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn transaction_exists(&self, tx_id: &str) -> Result<bool> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM transactions WHERE id = ?")
            .bind(tx_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0 > 0)
    }

    async fn pending_transactions(&self) -> Result<Vec<TransactionRecord>> {
        let rows: Vec<(String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT id, timestamp, status, data FROM transactions
            WHERE status NOT IN ('synced', 'failed')
            ORDER BY timestamp ASC, rowid ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(record_row).collect()
    }

    async fn set_transaction_status(&self, tx_id: &str, status: TxStatus) -> Result<()> {
        sqlx::query("UPDATE transactions SET status = ?, synced = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(status == TxStatus::Synced)
            .bind(tx_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn metadata_get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    async fn metadata_set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn triple_count(&self) -> Result<u64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM triples")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0 as u64)
    }

    async fn clear(&self) -> Result<()> {
        let mut dbtx = self.pool.begin().await?;
        sqlx::query("DELETE FROM triples").execute(&mut *dbtx).await?;
        sqlx::query("DELETE FROM transactions").execute(&mut *dbtx).await?;
        sqlx::query("DELETE FROM metadata").execute(&mut *dbtx).await?;
        dbtx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn triple(entity: &str, attr: &str, value: Value, tx: &str) -> Triple {
        Triple {
            entity_id: entity.to_string(),
            attribute: attr.to_string(),
            value,
            tx_id: tx.to_string(),
            created_at: Utc::now(),
            retracted: false,
        }
    }

    fn record(id: &str, status: TxStatus) -> TransactionRecord {
        TransactionRecord {
            id: id.to_string(),
            timestamp: Utc::now(),
            status,
            operations: vec![],
        }
    }

    #[tokio::test]
    async fn test_apply_batch_inserts_and_reads_back() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        backend
            .apply_batch(
                &record("tx1", TxStatus::Committed),
                &[
                    TripleWrite::Insert(triple("t1", TYPE_ATTR, json!("todos"), "tx1")),
                    TripleWrite::Insert(triple("t1", "text", json!("A"), "tx1")),
                ],
            )
            .await
            .unwrap();

        let triples = backend.triples_for_entity("t1").await.unwrap();
        assert_eq!(triples.len(), 2);
        assert!(backend.transaction_exists("tx1").await.unwrap());
        assert_eq!(
            backend.entity_ids_of_type("todos").await.unwrap(),
            vec!["t1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_retraction_flips_flag_without_deleting() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        backend
            .apply_batch(
                &record("tx1", TxStatus::Committed),
                &[TripleWrite::Insert(triple("t1", "text", json!("A"), "tx1"))],
            )
            .await
            .unwrap();
        backend
            .apply_batch(
                &record("tx2", TxStatus::Committed),
                &[TripleWrite::RetractAttribute {
                    entity_id: "t1".to_string(),
                    attribute: "text".to_string(),
                }],
            )
            .await
            .unwrap();

        let triples = backend.triples_for_entity("t1").await.unwrap();
        assert_eq!(triples.len(), 1);
        assert!(triples[0].retracted);
        assert_eq!(backend.triple_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retract_value_targets_exact_triple() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        backend
            .apply_batch(
                &record("tx1", TxStatus::Committed),
                &[
                    TripleWrite::Insert(triple("t1", "tag", json!("a"), "tx1")),
                    TripleWrite::Insert(triple("t1", "tag", json!("b"), "tx1")),
                ],
            )
            .await
            .unwrap();
        backend
            .apply_batch(
                &record("tx2", TxStatus::Committed),
                &[TripleWrite::RetractValue {
                    entity_id: "t1".to_string(),
                    attribute: "tag".to_string(),
                    value: json!("a"),
                }],
            )
            .await
            .unwrap();

        let live: Vec<_> = backend
            .triples_for_entity("t1")
            .await
            .unwrap()
            .into_iter()
            .filter(|t| !t.retracted)
            .collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].value, json!("b"));
    }

    #[tokio::test]
    async fn test_pending_transactions_order_and_marking() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        let mut first = record("tx-a", TxStatus::Committed);
        first.timestamp = Utc::now() - chrono::Duration::seconds(10);
        let second = record("tx-b", TxStatus::Committed);

        backend.apply_batch(&second, &[]).await.unwrap();
        backend.apply_batch(&first, &[]).await.unwrap();

        let pending = backend.pending_transactions().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, "tx-a");
        assert_eq!(pending[1].id, "tx-b");

        backend
            .set_transaction_status("tx-a", TxStatus::Synced)
            .await
            .unwrap();
        backend
            .set_transaction_status("tx-b", TxStatus::Failed)
            .await
            .unwrap();
        assert!(backend.pending_transactions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_metadata_upsert() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        assert_eq!(backend.metadata_get("token").await.unwrap(), None);
        backend.metadata_set("token", "abc").await.unwrap();
        backend.metadata_set("token", "def").await.unwrap();
        assert_eq!(
            backend.metadata_get("token").await.unwrap(),
            Some("def".to_string())
        );
    }

    #[tokio::test]
    async fn test_encrypted_values_round_trip() {
        let backend = SqliteBackend {
            pool: SqliteBackend::in_memory().await.unwrap().pool,
            encrypted: true,
        };
        backend
            .apply_batch(
                &record("tx1", TxStatus::Committed),
                &[
                    TripleWrite::Insert(triple("t1", TYPE_ATTR, json!("notes"), "tx1")),
                    TripleWrite::Insert(triple("t1", "body", json!("secret"), "tx1")),
                ],
            )
            .await
            .unwrap();

        // Values decode transparently and type lookup still works
        let triples = backend.triples_for_entity("t1").await.unwrap();
        assert!(triples.iter().any(|t| t.value == json!("secret")));
        assert_eq!(
            backend.entity_ids_of_type("notes").await.unwrap(),
            vec!["t1".to_string()]
        );

        // Exact-value retraction decrypts to match
        backend
            .apply_batch(
                &record("tx2", TxStatus::Committed),
                &[TripleWrite::RetractValue {
                    entity_id: "t1".to_string(),
                    attribute: "body".to_string(),
                    value: json!("secret"),
                }],
            )
            .await
            .unwrap();
        let live: Vec<_> = backend
            .triples_for_entity("t1")
            .await
            .unwrap()
            .into_iter()
            .filter(|t| !t.retracted && t.attribute == "body")
            .collect();
        assert!(live.is_empty());
    }
}
