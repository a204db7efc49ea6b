// tx/builder.rs - Explicit transaction builder
//
// Callers describe mutations as chunks instead of hand-assembling
// operation JSON: tx("todos").id("t1").update(json!({"completed": true}))

use serde_json::{Map, Value};
use uuid::Uuid;

use super::{OpKind, Operation};
use crate::{Error, Result};

/// Builder for operations against one entity
///
/// A chunk is bound to an entity type and (optionally) an id; each finishing
/// method produces one [`Operation`]. Chunks without an id mint a fresh one,
/// which is how new entities get created.
#[derive(Debug, Clone)]
pub struct TxChunk {
    entity_type: String,
    entity_id: Option<String>,
}

impl TxChunk {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: None,
        }
    }

    /// Bind the chunk to an existing entity id
    pub fn id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    fn entity_id(&self) -> String {
        self.entity_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    fn data_op(&self, kind: OpKind, data: Value) -> Result<Operation> {
        let Value::Object(mut map) = data else {
            return Err(Error::InvalidInput(format!(
                "{:?} data must be a JSON object",
                kind
            )));
        };
        // An unbound chunk adopts an "id" field from the data; the
        // materializer reinstates id on read, so it is not stored twice
        let entity_id = match (&self.entity_id, map.remove("id")) {
            (None, Some(Value::String(id))) => id,
            (_, _) => self.entity_id(),
        };
        Ok(Operation {
            kind,
            entity_type: self.entity_type.clone(),
            entity_id,
            data: Some(map),
        })
    }

    /// Insert fresh attributes
    pub fn add(&self, data: Value) -> Result<Operation> {
        self.data_op(OpKind::Add, data)
    }

    /// Replace the current value of each attribute in `data`
    pub fn update(&self, data: Value) -> Result<Operation> {
        self.data_op(OpKind::Update, data)
    }

    /// Deep-merge `data` into the entity
    pub fn merge(&self, data: Value) -> Result<Operation> {
        self.data_op(OpKind::Merge, data)
    }

    /// Retract every attribute of the entity
    pub fn delete(&self) -> Operation {
        Operation {
            kind: OpKind::Delete,
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id(),
            data: None,
        }
    }

    /// Reference another entity (or list of entities) by id
    pub fn link(&self, attribute: impl Into<String>, target: Value) -> Operation {
        let mut data = Map::new();
        data.insert(attribute.into(), target);
        Operation {
            kind: OpKind::Link,
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id(),
            data: Some(data),
        }
    }

    /// Remove a reference previously created with link
    pub fn unlink(&self, attribute: impl Into<String>, target: Value) -> Operation {
        let mut data = Map::new();
        data.insert(attribute.into(), target);
        Operation {
            kind: OpKind::Unlink,
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id(),
            data: Some(data),
        }
    }

    /// Retract one exact (attribute, value) pair
    pub fn retract(&self, attribute: impl Into<String>, value: Value) -> Operation {
        let mut data = Map::new();
        data.insert(attribute.into(), value);
        Operation {
            kind: OpKind::Retract,
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id(),
            data: Some(data),
        }
    }
}

/// Shorthand: `tx("todos").id("t1")`
pub fn tx(entity_type: impl Into<String>) -> TxChunk {
    TxChunk::new(entity_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_add_minting_and_bound_ids() {
        let minted = TxChunk::new("todos").add(json!({"text": "A"})).unwrap();
        assert_eq!(minted.kind, OpKind::Add);
        assert!(!minted.entity_id.is_empty());

        let bound = TxChunk::new("todos")
            .id("t1")
            .update(json!({"completed": true}))
            .unwrap();
        assert_eq!(bound.entity_id, "t1");
        assert_eq!(bound.data.as_ref().unwrap()["completed"], json!(true));
    }

    #[test]
    fn test_id_field_in_data_binds_the_entity() {
        let op = TxChunk::new("todos")
            .add(json!({"id": "t1", "text": "A"}))
            .unwrap();
        assert_eq!(op.entity_id, "t1");
        // id travels as the entity id, not as a stored attribute
        assert!(!op.data.as_ref().unwrap().contains_key("id"));
    }

    #[test]
    fn test_non_object_data_rejected() {
        let err = TxChunk::new("todos").add(json!([1, 2, 3])).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_link_shapes() {
        let op = TxChunk::new("posts").id("p1").link("tags", json!(["a", "b"]));
        assert_eq!(op.kind, OpKind::Link);
        assert_eq!(op.data.unwrap()["tags"], json!(["a", "b"]));
    }
}
