// query/mod.rs - Declarative query shape

mod cache;
mod engine;
mod filter;
mod materialize;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

pub use cache::QueryCache;
pub use engine::QueryEngine;
pub use materialize::{materialize_entities, materialize_entity};

/// A declarative query over the materialized entity view
///
/// Everything is optional: an empty query returns every entity in the log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Query {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_by: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_by: Option<Vec<String>>,
}

impl Query {
    /// Query all entities of one type
    pub fn of(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: Some(entity_type.into()),
            ..Default::default()
        }
    }

    /// Query one entity by id
    pub fn entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Filter clause; must be a JSON object
    pub fn filter(mut self, where_clause: Value) -> Result<Self> {
        let Value::Object(map) = where_clause else {
            return Err(Error::InvalidInput("where must be a JSON object".to_string()));
        };
        self.where_clause = Some(map);
        Ok(self)
    }

    /// Ordering: "field", "field desc", {field: dir}, or a list of maps
    pub fn order_by(mut self, order_by: impl Into<Value>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn aggregate(mut self, aggregate: Value) -> Result<Self> {
        let Value::Object(map) = aggregate else {
            return Err(Error::InvalidInput(
                "aggregate must be a JSON object".to_string(),
            ));
        };
        self.aggregate = Some(map);
        Ok(self)
    }

    pub fn group_by(mut self, fields: Vec<String>) -> Self {
        self.group_by = Some(fields);
        self
    }

    /// Canonical form used as the cache key
    pub fn cache_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Sort direction of one ordering key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    fn parse(s: &str) -> Result<Direction> {
        match s {
            "asc" => Ok(Direction::Asc),
            "desc" => Ok(Direction::Desc),
            other => Err(Error::InvalidInput(format!(
                "Unknown sort direction: {}",
                other
            ))),
        }
    }
}

/// Flatten the accepted orderBy shapes into (field, direction) keys,
/// left-major
pub(crate) fn parse_order_by(order_by: &Value) -> Result<Vec<(String, Direction)>> {
    match order_by {
        Value::String(s) => {
            let mut parts = s.split_whitespace();
            let field = parts
                .next()
                .ok_or_else(|| Error::InvalidInput("Empty orderBy".to_string()))?;
            let direction = match parts.next() {
                Some(dir) => Direction::parse(dir)?,
                None => Direction::Asc,
            };
            if parts.next().is_some() {
                return Err(Error::InvalidInput(format!("Malformed orderBy: {:?}", s)));
            }
            Ok(vec![(field.to_string(), direction)])
        }
        Value::Object(map) => map
            .iter()
            .map(|(field, dir)| {
                let dir = dir
                    .as_str()
                    .ok_or_else(|| {
                        Error::InvalidInput(format!("orderBy direction for {} must be a string", field))
                    })
                    .and_then(Direction::parse)?;
                Ok((field.clone(), dir))
            })
            .collect(),
        Value::Array(items) => {
            let mut keys = Vec::new();
            for item in items {
                keys.extend(parse_order_by(item)?);
            }
            Ok(keys)
        }
        other => Err(Error::InvalidInput(format!(
            "Unsupported orderBy shape: {}",
            other
        ))),
    }
}
