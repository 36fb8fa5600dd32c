/*
    sort.rs - Value ordering and sort specifications

    Values of different JSON types order by type bracket:
    null < numbers < strings < objects < arrays < booleans.
    Documents that compare equal on every sort key fall back to `_id`.
*/

use crate::core_doc::document::{lookup_path, Document, ID_FIELD};
use crate::core_doc::errors::{DocError, DocResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Sort direction of one key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Ordered list of sort keys
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SortSpec {
    keys: Vec<(String, SortDirection)>,
}

impl SortSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asc(mut self, field: impl Into<String>) -> Self {
        self.keys.push((field.into(), SortDirection::Asc));
        self
    }

    pub fn desc(mut self, field: impl Into<String>) -> Self {
        self.keys.push((field.into(), SortDirection::Desc));
        self
    }

    pub fn keys(&self) -> &[(String, SortDirection)] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Parse `{"a": 1, "b": -1}` or `[["a", "asc"], ["b", "desc"]]`
    pub fn from_value(value: &Value) -> DocResult<Self> {
        let mut spec = SortSpec::new();
        match value {
            Value::Null => {}
            Value::Object(map) => {
                for (field, dir) in map {
                    spec.keys.push((field.clone(), parse_direction(dir)?));
                }
            }
            Value::Array(items) => {
                for item in items {
                    match item {
                        Value::String(field) => spec.keys.push((field.clone(), SortDirection::Asc)),
                        Value::Array(pair) if pair.len() == 2 => {
                            let field = pair[0]
                                .as_str()
                                .ok_or_else(|| DocError::InvalidSort(format!("bad sort key {}", pair[0])))?;
                            spec.keys.push((field.to_string(), parse_direction(&pair[1])?));
                        }
                        other => {
                            return Err(DocError::InvalidSort(format!("bad sort entry {}", other)));
                        }
                    }
                }
            }
            other => return Err(DocError::InvalidSort(format!("unsupported sort {}", other))),
        }
        Ok(spec)
    }

    /// Canonical form; keeps key order
    pub fn to_value(&self) -> Value {
        Value::Array(
            self.keys
                .iter()
                .map(|(field, dir)| {
                    let d = match dir {
                        SortDirection::Asc => 1,
                        SortDirection::Desc => -1,
                    };
                    Value::Array(vec![Value::String(field.clone()), Value::from(d)])
                })
                .collect(),
        )
    }

    /// Compare two documents under this sort
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for (field, dir) in &self.keys {
            let left = lookup_path(a, field).unwrap_or(&Value::Null);
            let right = lookup_path(b, field).unwrap_or(&Value::Null);
            let ord = compare_values(left, right);
            let ord = match dir {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        let left = a.get(ID_FIELD).unwrap_or(&Value::Null);
        let right = b.get(ID_FIELD).unwrap_or(&Value::Null);
        compare_values(left, right)
    }
}

fn parse_direction(value: &Value) -> DocResult<SortDirection> {
    match value {
        Value::Number(n) if n.as_f64().map(|f| f < 0.0).unwrap_or(false) => Ok(SortDirection::Desc),
        Value::Number(_) => Ok(SortDirection::Asc),
        Value::String(s) if s.eq_ignore_ascii_case("asc") || s.eq_ignore_ascii_case("ascending") => {
            Ok(SortDirection::Asc)
        }
        Value::String(s) if s.eq_ignore_ascii_case("desc") || s.eq_ignore_ascii_case("descending") => {
            Ok(SortDirection::Desc)
        }
        other => Err(DocError::InvalidSort(format!("bad sort direction {}", other))),
    }
}

fn type_bracket(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order over JSON values
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let (ta, tb) = (type_bracket(a), type_bracket(b));
    if ta != tb {
        return ta.cmp(&tb);
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                let ord = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

/// Equality that treats `1` and `1.0` as the same number
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Ordering::Equal,
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, v)| y.get(k).map(|w| values_equal(v, w)).unwrap_or(false))
        }
        _ => a == b,
    }
}
