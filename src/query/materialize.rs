// query/materialize.rs - Entity materialization
//
// An entity is the fold of its non-retracted triples: attribute -> latest
// value, with the implicit id field. An entity with no live triples has
// ceased to exist and materializes to nothing.

use serde_json::{Map, Value};

use crate::store::Store;
use crate::Result;

/// Materialize one entity, or None when no live triples remain
pub async fn materialize_entity(
    store: &Store,
    entity_id: &str,
) -> Result<Option<Map<String, Value>>> {
    let triples = store.triples_for_entity(entity_id).await?;

    let mut map = Map::new();
    for triple in triples {
        if !triple.retracted {
            // Triples arrive oldest first, so the newest write wins
            map.insert(triple.attribute, triple.value);
        }
    }
    if map.is_empty() {
        return Ok(None);
    }

    // The entity id always wins over a stored "id" attribute
    map.insert("id".to_string(), Value::String(entity_id.to_string()));
    Ok(Some(map))
}

/// Materialize a candidate set, dropping entities that no longer exist
pub async fn materialize_entities(
    store: &Store,
    entity_ids: &[String],
) -> Result<Vec<Map<String, Value>>> {
    let mut entities = Vec::with_capacity(entity_ids.len());
    for id in entity_ids {
        if let Some(entity) = materialize_entity(store, id).await? {
            entities.push(entity);
        }
    }
    Ok(entities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryBackend, TransactionRecord, Triple, TripleWrite};
    use crate::tx::TxStatus;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    async fn store_with(writes: Vec<TripleWrite>) -> Store {
        let store = Store::with_backend(Arc::new(MemoryBackend::new()));
        let record = TransactionRecord {
            id: "tx1".to_string(),
            timestamp: Utc::now(),
            status: TxStatus::Committed,
            operations: vec![],
        };
        store.apply_batch(&record, &writes).await.unwrap();
        store
    }

    fn insert(entity: &str, attr: &str, value: Value) -> TripleWrite {
        TripleWrite::Insert(Triple {
            entity_id: entity.to_string(),
            attribute: attr.to_string(),
            value,
            tx_id: "tx1".to_string(),
            created_at: Utc::now(),
            retracted: false,
        })
    }

    #[tokio::test]
    async fn test_latest_value_wins() {
        let store = store_with(vec![
            insert("t1", "text", json!("old")),
            insert("t1", "text", json!("new")),
        ])
        .await;

        let entity = materialize_entity(&store, "t1").await.unwrap().unwrap();
        assert_eq!(entity["text"], json!("new"));
        assert_eq!(entity["id"], json!("t1"));
    }

    #[tokio::test]
    async fn test_fully_retracted_entity_is_gone() {
        let store = store_with(vec![insert("t1", "text", json!("A"))]).await;
        let record = TransactionRecord {
            id: "tx2".to_string(),
            timestamp: Utc::now(),
            status: TxStatus::Committed,
            operations: vec![],
        };
        store
            .apply_batch(
                &record,
                &[TripleWrite::RetractEntity {
                    entity_id: "t1".to_string(),
                }],
            )
            .await
            .unwrap();

        assert!(materialize_entity(&store, "t1").await.unwrap().is_none());
    }
}
