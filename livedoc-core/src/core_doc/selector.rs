/*
    selector.rs - In-memory query matcher

    Interprets Mongo-style selectors directly against JSON documents.
    Paths may be dotted and traverse arrays; a field condition matches an
    array field when it matches the array itself or any of its elements.

    Operators outside the supported set make the selector non-evaluable:
    `matches` then returns false and the pub/sub driver must not be used.
*/

use crate::core_doc::document::{DocId, Document, ID_FIELD};
use crate::core_doc::sort::{compare_values, values_equal};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

const FIELD_OPERATORS: &[&str] = &[
    "$eq", "$ne", "$gt", "$gte", "$lt", "$lte", "$in", "$nin", "$exists", "$not", "$size", "$all",
];

const LOGICAL_OPERATORS: &[&str] = &["$and", "$or", "$nor"];

/// A document selector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub struct Selector(Value);

impl Default for Selector {
    fn default() -> Self {
        Selector(Value::Object(Map::new()))
    }
}

impl Selector {
    /// Wrap a selector value; a bare string or number selects by id
    pub fn new(value: Value) -> Self {
        match value {
            Value::String(_) | Value::Number(_) => {
                let mut map = Map::new();
                map.insert(ID_FIELD.to_string(), value);
                Selector(Value::Object(map))
            }
            Value::Null => Selector::default(),
            other => Selector(other),
        }
    }

    /// Matches every document
    pub fn all() -> Self {
        Selector::default()
    }

    /// Matches exactly one id
    pub fn for_id(id: &DocId) -> Self {
        Selector::new(id.to_value())
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Does this document satisfy the selector?
    pub fn matches(&self, doc: &Document) -> bool {
        match &self.0 {
            Value::Object(sel) => match_object(sel, doc),
            _ => false,
        }
    }

    /// True when every operator can be evaluated by [`Selector::matches`]
    pub fn is_locally_evaluable(&self) -> bool {
        match &self.0 {
            Value::Object(sel) => evaluable_object(sel),
            _ => false,
        }
    }

    /// Id of the single document this selector targets, if it is an id selector
    pub fn single_id(&self) -> Option<DocId> {
        let sel = self.0.as_object()?;
        if sel.len() != 1 {
            return None;
        }
        let cond = sel.get(ID_FIELD)?;
        match cond {
            Value::Object(ops) if ops.len() == 1 => ops.get("$eq").and_then(DocId::from_value),
            other => DocId::from_value(other),
        }
    }

    /// Ids targeted by `{_id: x}` or `{_id: {$in: [...]}}`
    pub fn ids(&self) -> Option<Vec<DocId>> {
        if let Some(id) = self.single_id() {
            return Some(vec![id]);
        }
        let sel = self.0.as_object()?;
        if sel.len() != 1 {
            return None;
        }
        let ops = sel.get(ID_FIELD)?.as_object()?;
        if ops.len() != 1 {
            return None;
        }
        let list = ops.get("$in")?.as_array()?;
        list.iter().map(DocId::from_value).collect()
    }
}

impl From<Value> for Selector {
    fn from(value: Value) -> Self {
        Selector::new(value)
    }
}

impl From<Selector> for Value {
    fn from(selector: Selector) -> Self {
        selector.0
    }
}

fn is_operator_object(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn match_object(sel: &Map<String, Value>, doc: &Document) -> bool {
    sel.iter().all(|(key, cond)| match key.as_str() {
        "$and" => sub_selectors(cond).map(|subs| subs.iter().all(|s| match_object(s, doc))).unwrap_or(false),
        "$or" => sub_selectors(cond).map(|subs| subs.iter().any(|s| match_object(s, doc))).unwrap_or(false),
        "$nor" => sub_selectors(cond).map(|subs| !subs.iter().any(|s| match_object(s, doc))).unwrap_or(false),
        "$comment" => true,
        k if k.starts_with('$') => false,
        path => {
            let mut values = Vec::new();
            let parts: Vec<&str> = path.split('.').collect();
            collect_path(doc, &parts, &mut values);
            match_field(&values, cond)
        }
    })
}

fn sub_selectors(cond: &Value) -> Option<Vec<&Map<String, Value>>> {
    let items = cond.as_array()?;
    if items.is_empty() {
        return None;
    }
    items.iter().map(|v| v.as_object()).collect()
}

fn collect_path<'a>(current: &'a Map<String, Value>, parts: &[&str], out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = parts.split_first() else {
        return;
    };
    if let Some(next) = current.get(*head) {
        descend(next, rest, out);
    }
}

fn descend<'a>(value: &'a Value, parts: &[&str], out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = parts.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Value::Object(map) => collect_path(map, parts, out),
        Value::Array(items) => {
            if let Ok(idx) = head.parse::<usize>() {
                if let Some(item) = items.get(idx) {
                    descend(item, rest, out);
                }
            } else {
                for item in items {
                    if let Value::Object(map) = item {
                        collect_path(map, parts, out);
                    }
                }
            }
        }
        _ => {}
    }
}

/// Candidate values for comparisons: each value plus the elements of arrays
fn expanded<'a>(values: &[&'a Value]) -> Vec<&'a Value> {
    let mut out = Vec::with_capacity(values.len());
    for v in values {
        out.push(*v);
        if let Value::Array(items) = v {
            out.extend(items.iter());
        }
    }
    out
}

fn equals_any(values: &[&Value], target: &Value) -> bool {
    if values.is_empty() {
        return target.is_null();
    }
    expanded(values).iter().any(|v| values_equal(v, target))
}

fn compare_any(values: &[&Value], target: &Value, accept: fn(Ordering) -> bool) -> bool {
    expanded(values).iter().any(|v| {
        std::mem::discriminant(*v) == std::mem::discriminant(target) && accept(compare_values(v, target))
    })
}

fn match_field(values: &[&Value], cond: &Value) -> bool {
    let ops = match cond {
        Value::Object(ops) if is_operator_object(cond) => ops,
        _ => return equals_any(values, cond),
    };
    ops.iter().all(|(op, arg)| match op.as_str() {
        "$eq" => equals_any(values, arg),
        "$ne" => !equals_any(values, arg),
        "$gt" => compare_any(values, arg, |o| o == Ordering::Greater),
        "$gte" => compare_any(values, arg, |o| o != Ordering::Less),
        "$lt" => compare_any(values, arg, |o| o == Ordering::Less),
        "$lte" => compare_any(values, arg, |o| o != Ordering::Greater),
        "$in" => arg
            .as_array()
            .map(|list| list.iter().any(|a| equals_any(values, a)))
            .unwrap_or(false),
        "$nin" => arg
            .as_array()
            .map(|list| !list.iter().any(|a| equals_any(values, a)))
            .unwrap_or(false),
        "$exists" => truthy(arg) == !values.is_empty(),
        "$not" => !match_field(values, arg),
        "$size" => values.iter().any(|v| match (v, arg.as_u64()) {
            (Value::Array(items), Some(n)) => items.len() as u64 == n,
            _ => false,
        }),
        "$all" => arg
            .as_array()
            .map(|list| !list.is_empty() && list.iter().all(|a| equals_any(values, a)))
            .unwrap_or(false),
        _ => false,
    })
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        _ => true,
    }
}

fn evaluable_object(sel: &Map<String, Value>) -> bool {
    sel.iter().all(|(key, cond)| {
        if LOGICAL_OPERATORS.contains(&key.as_str()) {
            return sub_selectors(cond).map(|subs| subs.into_iter().all(evaluable_object)).unwrap_or(false);
        }
        if key == "$comment" {
            return true;
        }
        if key.starts_with('$') {
            return false;
        }
        evaluable_condition(cond)
    })
}

fn evaluable_condition(cond: &Value) -> bool {
    match cond {
        Value::Object(ops) if is_operator_object(cond) => ops.iter().all(|(op, arg)| {
            FIELD_OPERATORS.contains(&op.as_str()) && (op != "$not" || evaluable_condition(arg))
        }),
        Value::Object(map) => !map.keys().any(|k| k.starts_with('$')),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    fn sel(v: Value) -> Selector {
        Selector::new(v)
    }

    #[test]
    fn test_deserialized_bare_id_is_normalized() {
        let selector: Selector = serde_json::from_value(json!("a")).unwrap();
        assert_eq!(selector.single_id(), Some(DocId::from("a")));
        assert_eq!(serde_json::to_value(&selector).unwrap(), json!({"_id": "a"}));

        let selector: Selector = serde_json::from_str("null").unwrap();
        assert_eq!(selector, Selector::all());
    }

    #[test]
    fn test_equality_and_empty() {
        let d = doc(json!({"_id": "a", "x": 1, "tags": ["red", "blue"]}));
        assert!(Selector::all().matches(&d));
        assert!(sel(json!({"x": 1})).matches(&d));
        assert!(sel(json!({"x": 1.0})).matches(&d));
        assert!(!sel(json!({"x": 2})).matches(&d));
        assert!(sel(json!({"tags": "red"})).matches(&d));
        assert!(sel(json!({"tags": ["red", "blue"]})).matches(&d));
        assert!(sel(json!({"missing": null})).matches(&d));
    }

    #[test]
    fn test_comparisons() {
        let d = doc(json!({"_id": "a", "n": 5, "s": "m"}));
        assert!(sel(json!({"n": {"$gt": 4, "$lte": 5}})).matches(&d));
        assert!(!sel(json!({"n": {"$lt": 5}})).matches(&d));
        assert!(!sel(json!({"n": {"$gt": "a"}})).matches(&d));
        assert!(sel(json!({"s": {"$gte": "a"}})).matches(&d));
        assert!(sel(json!({"n": {"$ne": 4}})).matches(&d));
    }

    #[test]
    fn test_set_operators() {
        let d = doc(json!({"_id": "a", "n": 5, "tags": ["x", "y"]}));
        assert!(sel(json!({"n": {"$in": [1, 5]}})).matches(&d));
        assert!(sel(json!({"n": {"$nin": [1, 2]}})).matches(&d));
        assert!(sel(json!({"tags": {"$all": ["y", "x"]}})).matches(&d));
        assert!(sel(json!({"tags": {"$size": 2}})).matches(&d));
        assert!(sel(json!({"n": {"$exists": true}})).matches(&d));
        assert!(sel(json!({"z": {"$exists": false}})).matches(&d));
        assert!(sel(json!({"n": {"$not": {"$gt": 10}}})).matches(&d));
    }

    #[test]
    fn test_logical_operators() {
        let d = doc(json!({"_id": "a", "n": 5}));
        assert!(sel(json!({"$or": [{"n": 1}, {"n": 5}]})).matches(&d));
        assert!(!sel(json!({"$and": [{"n": 5}, {"n": 6}]})).matches(&d));
        assert!(sel(json!({"$nor": [{"n": 1}]})).matches(&d));
        assert!(!sel(json!({"$or": []})).matches(&d));
    }

    #[test]
    fn test_dotted_paths_through_arrays() {
        let d = doc(json!({"_id": "a", "items": [{"qty": 1}, {"qty": 9}], "meta": {"owner": "u1"}}));
        assert!(sel(json!({"items.qty": 9})).matches(&d));
        assert!(sel(json!({"items.1.qty": {"$gt": 5}})).matches(&d));
        assert!(sel(json!({"meta.owner": "u1"})).matches(&d));
        assert!(!sel(json!({"meta.owner.x": "u1"})).matches(&d));
    }

    #[test]
    fn test_local_evaluability() {
        assert!(sel(json!({"a": 1, "$or": [{"b": {"$in": [1]}}]})).is_locally_evaluable());
        assert!(!sel(json!({"$where": "this.a > 1"})).is_locally_evaluable());
        assert!(!sel(json!({"a": {"$regex": "^x"}})).is_locally_evaluable());
        assert!(!sel(json!({"loc": {"$near": [0, 0]}})).is_locally_evaluable());
        assert!(!sel(json!({"a": {"$not": {"$regex": "x"}}})).is_locally_evaluable());
        assert!(!sel(json!({"$where": "1"})).matches(&doc(json!({"_id": "a"}))));
    }

    #[test]
    fn test_id_selectors() {
        assert_eq!(sel(json!("abc")).single_id(), Some(DocId::from("abc")));
        assert_eq!(sel(json!({"_id": "abc"})).single_id(), Some(DocId::from("abc")));
        assert_eq!(sel(json!({"_id": {"$eq": "abc"}})).single_id(), Some(DocId::from("abc")));
        assert_eq!(sel(json!({"_id": "abc", "x": 1})).single_id(), None);
        assert_eq!(sel(json!({"x": 1})).single_id(), None);
        assert_eq!(
            sel(json!({"_id": {"$in": ["a", "b"]}})).ids(),
            Some(vec![DocId::from("a"), DocId::from("b")])
        );
        assert!(sel(json!("abc")).matches(&doc(json!({"_id": "abc"}))));
    }

    proptest! {
        #[test]
        fn prop_not_eq_is_ne(value in -50i64..50, other in -50i64..50) {
            let d = doc(json!({"_id": "p", "v": value}));
            let negated = sel(json!({"v": {"$not": {"$eq": other}}})).matches(&d);
            let ne = sel(json!({"v": {"$ne": other}})).matches(&d);
            prop_assert_eq!(negated, ne);
        }

        #[test]
        fn prop_range_partition(value in -100i64..100, pivot in -100i64..100) {
            let d = doc(json!({"_id": "p", "v": value}));
            let below = sel(json!({"v": {"$lt": pivot}})).matches(&d);
            let at_or_above = sel(json!({"v": {"$gte": pivot}})).matches(&d);
            prop_assert!(below != at_or_above);
        }
    }
}
