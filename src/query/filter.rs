// query/filter.rs - Where-clause evaluation
//
// A where clause is a map combined with implicit AND. Value positions hold
// either a literal (equality) or an operator map; $or / $and / $not
// combine sub-clauses.

use std::cmp::Ordering;

use regex::Regex;
use serde_json::{Map, Value};

use crate::value::partial_compare;
use crate::{Error, Result};

const OPERATORS: &[&str] = &[
    ">", "$gt", ">=", "$gte", "<", "$lt", "<=", "$lte", "!=", "$ne", "in", "$in", "not_in",
    "$nin", "$like", "$ilike", "$isNull", "$exists", "$contains", "$size", "$not",
];

fn is_operator(key: &str) -> bool {
    OPERATORS.contains(&key)
}

/// Does the entity satisfy the clause?
pub fn matches(entity: &Map<String, Value>, clause: &Map<String, Value>) -> Result<bool> {
    for (key, condition) in clause {
        let hit = match key.as_str() {
            "$or" => {
                let mut any = false;
                for sub in subclauses(condition)? {
                    if matches(entity, sub)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$and" => {
                let mut all = true;
                for sub in subclauses(condition)? {
                    if !matches(entity, sub)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$not" => {
                let Value::Object(sub) = condition else {
                    return Err(Error::InvalidInput(
                        "$not takes a sub-clause object".to_string(),
                    ));
                };
                !matches(entity, sub)?
            }
            field => eval_predicate(entity.get(field), condition)?,
        };
        if !hit {
            return Ok(false);
        }
    }
    Ok(true)
}

/// $or / $and accept a single sub-clause or a list of them
fn subclauses(condition: &Value) -> Result<Vec<&Map<String, Value>>> {
    match condition {
        Value::Object(map) => Ok(vec![map]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_object().ok_or_else(|| {
                    Error::InvalidInput("Logical operands must be objects".to_string())
                })
            })
            .collect(),
        other => Err(Error::InvalidInput(format!(
            "Logical operator takes objects, got: {}",
            other
        ))),
    }
}

/// Evaluate one value-position condition against a field
///
/// An object condition is an operator map when any key is an operator or
/// `$`-prefixed; a `$`-key that is no known operator is a caller mistake
/// and surfaces as such rather than silently comparing as a literal.
fn eval_predicate(field: Option<&Value>, condition: &Value) -> Result<bool> {
    if let Value::Object(map) = condition {
        let looks_like_operators = map
            .keys()
            .any(|k| is_operator(k) || k.starts_with('$'));
        if !map.is_empty() && looks_like_operators {
            for (op, operand) in map {
                if !eval_operator(field, op, operand)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }
    }
    // Literal equality; a missing field never equals a literal
    Ok(field == Some(condition))
}

fn eval_operator(field: Option<&Value>, op: &str, operand: &Value) -> Result<bool> {
    let ordered = |want: &[Ordering]| -> bool {
        field
            .and_then(|f| partial_compare(f, operand))
            .map(|ord| want.contains(&ord))
            .unwrap_or(false)
    };

    match op {
        ">" | "$gt" => Ok(ordered(&[Ordering::Greater])),
        ">=" | "$gte" => Ok(ordered(&[Ordering::Greater, Ordering::Equal])),
        "<" | "$lt" => Ok(ordered(&[Ordering::Less])),
        "<=" | "$lte" => Ok(ordered(&[Ordering::Less, Ordering::Equal])),
        "!=" | "$ne" => Ok(field.unwrap_or(&Value::Null) != operand),
        "in" | "$in" => {
            let list = membership_list(op, operand)?;
            Ok(field.map(|f| list.contains(f)).unwrap_or(false))
        }
        "not_in" | "$nin" => {
            let list = membership_list(op, operand)?;
            Ok(!list.contains(field.unwrap_or(&Value::Null)))
        }
        "$like" => Ok(glob_match(field, operand, false)?),
        "$ilike" => Ok(glob_match(field, operand, true)?),
        "$isNull" => {
            let want_null = operand_bool(op, operand)?;
            let is_null = matches!(field, None | Some(Value::Null));
            Ok(is_null == want_null)
        }
        "$exists" => {
            let want_present = operand_bool(op, operand)?;
            let present = !matches!(field, None | Some(Value::Null));
            Ok(present == want_present)
        }
        "$contains" => Ok(match field {
            Some(Value::Array(items)) => items.contains(operand),
            Some(Value::String(s)) => operand.as_str().map(|sub| s.contains(sub)).unwrap_or(false),
            _ => false,
        }),
        "$size" => {
            let len = match field {
                Some(Value::Array(items)) => Some(items.len()),
                Some(Value::String(s)) => Some(s.chars().count()),
                _ => None,
            };
            let want = operand.as_u64().ok_or_else(|| {
                Error::InvalidInput("$size takes a non-negative number".to_string())
            })?;
            Ok(len.map(|l| l as u64 == want).unwrap_or(false))
        }
        "$not" => Ok(!eval_predicate(field, operand)?),
        other => Err(Error::InvalidInput(format!("Unknown operator: {}", other))),
    }
}

fn membership_list<'a>(op: &str, operand: &'a Value) -> Result<&'a Vec<Value>> {
    operand
        .as_array()
        .ok_or_else(|| Error::InvalidInput(format!("{} takes a list", op)))
}

fn operand_bool(op: &str, operand: &Value) -> Result<bool> {
    operand
        .as_bool()
        .ok_or_else(|| Error::InvalidInput(format!("{} takes a boolean", op)))
}

/// `%` is the only wildcard and maps to `.*`; everything else is literal
fn glob_match(field: Option<&Value>, operand: &Value, case_insensitive: bool) -> Result<bool> {
    let Some(pattern) = operand.as_str() else {
        return Err(Error::InvalidInput("$like takes a string pattern".to_string()));
    };
    let Some(Value::String(subject)) = field else {
        return Ok(false);
    };

    let body = regex::escape(pattern).replace('%', ".*");
    let full = if case_insensitive {
        format!("(?i)^{}$", body)
    } else {
        format!("^{}$", body)
    };
    let re = Regex::new(&full)
        .map_err(|e| Error::InvalidInput(format!("Bad glob pattern {:?}: {}", pattern, e)))?;
    Ok(re.is_match(subject))
}
