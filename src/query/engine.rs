// query/engine.rs - Query evaluation
//
// Candidate selection -> materialize -> filter -> aggregate | (sort,
// paginate). Evaluation is CPU-bound and synchronous apart from the store
// reads; it always runs against committed state.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::{Map, Value};

use super::filter;
use super::materialize::materialize_entities;
use super::{parse_order_by, Direction, Query};
use crate::store::Store;
use crate::value::{reparse, sort_compare, string_form};
use crate::{Error, Result};

#[derive(Clone)]
pub struct QueryEngine {
    store: Store,
}

impl QueryEngine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Evaluate a query to its result rows
    ///
    /// Entity rows are attribute maps; aggregate rows carry the aggregate
    /// keys (and group-key fields when grouping).
    pub async fn execute(&self, query: &Query) -> Result<Vec<Value>> {
        // Candidate selection: id beats type beats everything
        let candidates: Vec<String> = if let Some(id) = &query.entity_id {
            vec![id.clone()]
        } else if let Some(ty) = &query.entity_type {
            self.store.entity_ids_of_type(ty).await?
        } else {
            self.store.all_entity_ids().await?
        };

        let mut entities = materialize_entities(&self.store, &candidates).await?;

        if let Some(clause) = &query.where_clause {
            let mut kept = Vec::with_capacity(entities.len());
            for entity in entities {
                if filter::matches(&entity, clause)? {
                    kept.push(entity);
                }
            }
            entities = kept;
        }

        if let Some(aggregate) = &query.aggregate {
            return aggregate_rows(&entities, aggregate, query.group_by.as_deref());
        }

        if let Some(order_by) = &query.order_by {
            let keys = parse_order_by(order_by)?;
            // Stable sort so later keys only break ties of earlier ones
            entities.sort_by(|a, b| compare_entities(a, b, &keys));
        }

        let offset = query.offset.unwrap_or(0);
        let iter = entities.into_iter().skip(offset);
        let rows: Vec<Map<String, Value>> = match query.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        };
        Ok(rows.into_iter().map(Value::Object).collect())
    }
}

fn compare_entities(
    a: &Map<String, Value>,
    b: &Map<String, Value>,
    keys: &[(String, Direction)],
) -> Ordering {
    for (field, direction) in keys {
        let av = a.get(field).unwrap_or(&Value::Null);
        let bv = b.get(field).unwrap_or(&Value::Null);
        let ord = match direction {
            Direction::Asc => sort_compare(av, bv),
            Direction::Desc => sort_compare(av, bv).reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Aggregation; pagination never applies to groups
fn aggregate_rows(
    entities: &[Map<String, Value>],
    aggregate: &Map<String, Value>,
    group_by: Option<&[String]>,
) -> Result<Vec<Value>> {
    let fields = match group_by {
        Some(fields) if !fields.is_empty() => fields,
        _ => {
            let refs: Vec<&Map<String, Value>> = entities.iter().collect();
            return Ok(vec![Value::Object(compute_aggregates(&refs, aggregate)?)]);
        }
    };

    // Partition on the joined string forms, keeping first-appearance order
    let mut order: Vec<(String, Vec<String>)> = Vec::new();
    let mut groups: HashMap<String, Vec<&Map<String, Value>>> = HashMap::new();
    for entity in entities {
        let parts: Vec<String> = fields
            .iter()
            .map(|f| string_form(entity.get(f).unwrap_or(&Value::Null)))
            .collect();
        let key = parts.join("|");
        if !groups.contains_key(&key) {
            order.push((key.clone(), parts));
        }
        groups.entry(key).or_default().push(entity);
    }

    let mut rows = Vec::with_capacity(order.len());
    for (key, parts) in order {
        let mut row = compute_aggregates(&groups[&key], aggregate)?;
        for (field, part) in fields.iter().zip(parts) {
            row.insert(field.clone(), reparse(&part));
        }
        rows.push(Value::Object(row));
    }
    Ok(rows)
}

fn compute_aggregates(
    entities: &[&Map<String, Value>],
    aggregate: &Map<String, Value>,
) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    for (kind, operand) in aggregate {
        let field = operand.as_str().ok_or_else(|| {
            Error::InvalidInput(format!("Aggregate {} takes a field name", kind))
        })?;
        match kind.as_str() {
            "count" => {
                let n = if field == "*" {
                    entities.len()
                } else {
                    entities
                        .iter()
                        .filter(|e| !matches!(e.get(field), None | Some(Value::Null)))
                        .count()
                };
                out.insert("count".to_string(), Value::from(n as u64));
            }
            "sum" | "avg" => {
                // Non-numeric values are skipped, not an error
                let nums: Vec<f64> = entities
                    .iter()
                    .filter_map(|e| e.get(field).and_then(Value::as_f64))
                    .collect();
                let sum: f64 = nums.iter().sum();
                let value = if kind == "sum" {
                    sum
                } else if nums.is_empty() {
                    0.0
                } else {
                    sum / nums.len() as f64
                };
                out.insert(kind.clone(), number_value(value));
            }
            "min" | "max" => {
                let mut values: Vec<&Value> = entities
                    .iter()
                    .filter_map(|e| e.get(field))
                    .filter(|v| !v.is_null())
                    .collect();
                if values.is_empty() {
                    continue; // omitted on empty input
                }
                values.sort_by(|a, b| sort_compare(a, b));
                let picked = if kind == "min" {
                    values[0]
                } else {
                    values[values.len() - 1]
                };
                out.insert(kind.clone(), picked.clone());
            }
            other => {
                return Err(Error::InvalidInput(format!("Unknown aggregate: {}", other)));
            }
        }
    }
    Ok(out)
}

/// Integral results stay integers so counts and int sums read naturally
fn number_value(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Value::from(f as i64)
    } else {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}
