/*
    mutator.rs - Update operators

    Applies Mongo-style mutators to documents. A mutator is either a set of
    operators (`{"$set": {...}, "$inc": {...}}`) or a replacement document
    with no operator keys. Mixing the two is rejected, as is any attempt to
    change `_id`.
*/

use crate::core_doc::document::{lookup_path, top_level, Document, ID_FIELD};
use crate::core_doc::errors::{DocError, DocResult};
use crate::core_doc::selector::Selector;
use crate::core_doc::sort::{compare_values, values_equal};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Operator names of a mutator, in document order
pub fn operators(mutator: &Value) -> Vec<&str> {
    mutator
        .as_object()
        .map(|m| m.keys().filter(|k| k.starts_with('$')).map(String::as_str).collect())
        .unwrap_or_default()
}

/// True when the mutator is empty or carries any non-operator key
pub fn is_replacement(mutator: &Value) -> bool {
    match mutator.as_object() {
        Some(m) => m.is_empty() || m.keys().any(|k| !k.starts_with('$')),
        None => true,
    }
}

/// Top-level field names touched by a mutator
pub fn mutator_fields(mutator: &Value) -> BTreeSet<String> {
    let mut fields = BTreeSet::new();
    let Some(map) = mutator.as_object() else {
        return fields;
    };
    for (key, arg) in map {
        if !key.starts_with('$') {
            if key != ID_FIELD {
                fields.insert(top_level(key).to_string());
            }
            continue;
        }
        if let Some(args) = arg.as_object() {
            for (path, value) in args {
                fields.insert(top_level(path).to_string());
                if key == "$rename" {
                    if let Some(target) = value.as_str() {
                        fields.insert(top_level(target).to_string());
                    }
                }
            }
        }
    }
    fields
}

/// Apply a mutator in place. `inserting` enables `$setOnInsert`.
pub fn apply_mutator(doc: &mut Document, mutator: &Value, inserting: bool) -> DocResult<()> {
    let map = mutator
        .as_object()
        .ok_or_else(|| DocError::InvalidMutator(format!("expected an object, got {}", mutator)))?;

    let op_count = map.keys().filter(|k| k.starts_with('$')).count();
    if op_count == 0 {
        return replace(doc, map);
    }
    if op_count != map.len() {
        return Err(DocError::InvalidMutator(
            "cannot mix update operators and plain fields".to_string(),
        ));
    }

    for (op, arg) in map {
        let args = arg
            .as_object()
            .ok_or_else(|| DocError::InvalidMutator(format!("{} expects an object", op)))?;
        for (path, value) in args {
            if top_level(path) == ID_FIELD {
                return Err(DocError::InvalidMutator(format!("{} cannot modify {}", op, ID_FIELD)));
            }
            apply_operator(doc, op, path, value, inserting)?;
        }
    }
    Ok(())
}

fn replace(doc: &mut Document, replacement: &Map<String, Value>) -> DocResult<()> {
    if let (Some(new_id), Some(old_id)) = (replacement.get(ID_FIELD), doc.get(ID_FIELD)) {
        if !values_equal(new_id, old_id) {
            return Err(DocError::InvalidMutator(format!("cannot change {}", ID_FIELD)));
        }
    }
    let id = doc.remove(ID_FIELD);
    doc.clear();
    if let Some(id) = id {
        doc.insert(ID_FIELD.to_string(), id);
    }
    for (k, v) in replacement {
        if k != ID_FIELD {
            doc.insert(k.clone(), v.clone());
        }
    }
    Ok(())
}

fn apply_operator(doc: &mut Document, op: &str, path: &str, arg: &Value, inserting: bool) -> DocResult<()> {
    match op {
        "$set" => set_path(doc, path, arg.clone()),
        "$setOnInsert" => {
            if inserting {
                set_path(doc, path, arg.clone())?;
            }
            Ok(())
        }
        "$unset" => {
            remove_path(doc, path);
            Ok(())
        }
        "$inc" => {
            let current = lookup_path(doc, path).cloned().unwrap_or(Value::from(0));
            let next = arithmetic(&current, arg, op, i64::checked_add, |a, b| a + b)?;
            set_path(doc, path, next)
        }
        "$mul" => {
            let current = lookup_path(doc, path).cloned().unwrap_or(Value::from(0));
            let next = arithmetic(&current, arg, op, i64::checked_mul, |a, b| a * b)?;
            set_path(doc, path, next)
        }
        "$min" | "$max" => {
            let wanted = if op == "$min" { Ordering::Less } else { Ordering::Greater };
            let replace = match lookup_path(doc, path) {
                None => true,
                Some(current) => compare_values(arg, current) == wanted,
            };
            if replace {
                set_path(doc, path, arg.clone())?;
            }
            Ok(())
        }
        "$rename" => {
            let target = arg
                .as_str()
                .ok_or_else(|| DocError::InvalidMutator("$rename target must be a string".to_string()))?;
            if top_level(target) == ID_FIELD {
                return Err(DocError::InvalidMutator(format!("$rename cannot target {}", ID_FIELD)));
            }
            if let Some(value) = remove_path(doc, path) {
                set_path(doc, target, value)?;
            }
            Ok(())
        }
        "$push" | "$pushAll" => {
            let items = match (op, arg) {
                ("$pushAll", Value::Array(items)) => items.clone(),
                ("$pushAll", _) => {
                    return Err(DocError::InvalidMutator("$pushAll expects an array".to_string()))
                }
                (_, value) => each_or_single(value),
            };
            with_array(doc, path, op, |array| array.extend(items))
        }
        "$addToSet" => {
            let items = each_or_single(arg);
            with_array(doc, path, op, |array| {
                for item in items {
                    if !array.iter().any(|existing| values_equal(existing, &item)) {
                        array.push(item);
                    }
                }
            })
        }
        "$pop" => {
            let from_front = arg.as_f64().map(|n| n < 0.0).unwrap_or(false);
            if lookup_path(doc, path).is_none() {
                return Ok(());
            }
            with_array(doc, path, op, |array| {
                if array.is_empty() {
                    return;
                }
                if from_front {
                    array.remove(0);
                } else {
                    array.pop();
                }
            })
        }
        "$pull" => {
            if lookup_path(doc, path).is_none() {
                return Ok(());
            }
            with_array(doc, path, op, |array| array.retain(|item| !pull_matches(item, arg)))
        }
        "$pullAll" => {
            let items = arg
                .as_array()
                .ok_or_else(|| DocError::InvalidMutator("$pullAll expects an array".to_string()))?
                .clone();
            if lookup_path(doc, path).is_none() {
                return Ok(());
            }
            with_array(doc, path, op, |array| {
                array.retain(|item| !items.iter().any(|p| values_equal(item, p)))
            })
        }
        "$bit" => {
            let current = match lookup_path(doc, path) {
                None => 0,
                Some(v) => v
                    .as_i64()
                    .ok_or_else(|| DocError::InvalidMutator("$bit target must be an integer".to_string()))?,
            };
            let ops = arg
                .as_object()
                .ok_or_else(|| DocError::InvalidMutator("$bit expects {and|or|xor: n}".to_string()))?;
            let mut result = current;
            for (kind, operand) in ops {
                let operand = operand
                    .as_i64()
                    .ok_or_else(|| DocError::InvalidMutator("$bit operand must be an integer".to_string()))?;
                result = match kind.as_str() {
                    "and" => result & operand,
                    "or" => result | operand,
                    "xor" => result ^ operand,
                    other => {
                        return Err(DocError::InvalidMutator(format!("unknown $bit operation {}", other)))
                    }
                };
            }
            set_path(doc, path, Value::from(result))
        }
        other => Err(DocError::InvalidMutator(format!("unknown operator {}", other))),
    }
}

fn each_or_single(arg: &Value) -> Vec<Value> {
    if let Some(each) = arg.as_object().and_then(|m| m.get("$each")).and_then(Value::as_array) {
        return each.clone();
    }
    vec![arg.clone()]
}

fn pull_matches(item: &Value, cond: &Value) -> bool {
    match cond {
        Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) => {
            let mut wrapper = Map::new();
            wrapper.insert("v".to_string(), item.clone());
            let mut sel = Map::new();
            sel.insert("v".to_string(), cond.clone());
            Selector::new(Value::Object(sel)).matches(&wrapper)
        }
        Value::Object(_) => match item {
            Value::Object(inner) => Selector::new(cond.clone()).matches(inner),
            _ => false,
        },
        other => values_equal(item, other),
    }
}

fn arithmetic(
    current: &Value,
    arg: &Value,
    op: &str,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> DocResult<Value> {
    let (Value::Number(a), Value::Number(b)) = (current, arg) else {
        return Err(DocError::InvalidMutator(format!("{} requires numeric values", op)));
    };
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(r) = int_op(x, y) {
            return Ok(Value::from(r));
        }
    }
    let (x, y) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
    Number::from_f64(float_op(x, y))
        .map(Value::Number)
        .ok_or_else(|| DocError::InvalidMutator(format!("{} produced a non-finite number", op)))
}

fn with_array(doc: &mut Document, path: &str, op: &str, f: impl FnOnce(&mut Vec<Value>)) -> DocResult<()> {
    let mut array = match lookup_path(doc, path) {
        None => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(_) => {
            return Err(DocError::InvalidMutator(format!("{} target {} is not an array", op, path)))
        }
    };
    f(&mut array);
    set_path(doc, path, Value::Array(array))
}

/// Set a dotted path, creating intermediate objects
pub fn set_path(doc: &mut Document, path: &str, value: Value) -> DocResult<()> {
    let parts: Vec<&str> = path.split('.').collect();
    let (last, parents) = parts
        .split_last()
        .ok_or_else(|| DocError::InvalidMutator("empty field path".to_string()))?;

    let mut current = doc;
    for part in parents {
        let next = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = match next {
            Value::Object(map) => map,
            _ => {
                return Err(DocError::InvalidMutator(format!(
                    "cannot descend into non-object field {} of {}",
                    part, path
                )))
            }
        };
    }
    current.insert(last.to_string(), value);
    Ok(())
}

/// Remove a dotted path, returning the old value
pub fn remove_path(doc: &mut Document, path: &str) -> Option<Value> {
    let parts: Vec<&str> = path.split('.').collect();
    let (last, parents) = parts.split_last()?;
    let mut current = doc;
    for part in parents {
        current = current.get_mut(*part)?.as_object_mut()?;
    }
    current.remove(*last)
}
