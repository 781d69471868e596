//! QueryEngine: evaluates whether a document matches a restricted
//! MongoDB-style filter document.
//!
//! Modeled after a parameter-object/result-object dispatch style
//! (`syncstorage-db-common`): the engine takes plain data in (`Document`,
//! filter `DocValue`) and returns plain data out (`bool`), with validation
//! run as a separate, explicit pass before any matching. Logical operators
//! are evaluated first; remaining keys are treated as an implicit
//! conjunction, matching MongoDB's own behavior.

use std::collections::{BTreeMap, HashSet};

use blobdb_common::document::get_path;
use blobdb_common::{DbError, DbResult, DocValue, Document};

pub const DEFAULT_MAX_NESTED_DEPTH: u32 = 10;

#[derive(Clone, Debug)]
pub struct QueryEngineConfig {
    pub max_nested_depth: u32,
    pub supported_operators: HashSet<String>,
    pub logical_operators: HashSet<String>,
}

impl Default for QueryEngineConfig {
    fn default() -> Self {
        QueryEngineConfig {
            max_nested_depth: DEFAULT_MAX_NESTED_DEPTH,
            supported_operators: ["$eq", "$gt", "$lt", "$and", "$or"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            logical_operators: ["$and", "$or"].iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Validation pipeline: input typing, depth, operator inventory, operator
/// value shape. All three passes must succeed before any matching is
/// attempted.
pub fn validate_filter(filter: &DocValue, config: &QueryEngineConfig) -> DbResult<()> {
    match filter {
        DocValue::Object(_) => {}
        _ => {
            return Err(DbError::invalid_query(
                "filter must be a non-null, non-array, non-string mapping",
            ))
        }
    }
    validate_value(filter, config, 0)
}

fn validate_value(value: &DocValue, config: &QueryEngineConfig, depth: u32) -> DbResult<()> {
    if depth > config.max_nested_depth {
        return Err(DbError::invalid_query(format!(
            "filter nesting exceeds configured maximum of {}",
            config.max_nested_depth
        )));
    }
    match value {
        DocValue::Object(map) => {
            for (key, sub_value) in map {
                if key.starts_with('$') {
                    if !config.supported_operators.contains(key) {
                        return Err(DbError::invalid_query(format!(
                            "unsupported query operator: {key}"
                        )));
                    }
                    if config.logical_operators.contains(key) {
                        match sub_value {
                            DocValue::Array(items) => {
                                for item in items {
                                    validate_value(item, config, depth + 1)?;
                                }
                            }
                            _ => {
                                return Err(DbError::invalid_query(format!(
                                    "{key} requires an array of subqueries"
                                )))
                            }
                        }
                        continue;
                    }
                }
                validate_value(sub_value, config, depth + 1)?;
            }
            Ok(())
        }
        DocValue::Array(items) => {
            for item in items {
                validate_value(item, config, depth + 1)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Recursive-descent matcher. Top-level (and any nested subquery's)
/// logical operators are evaluated first; remaining keys are processed as
/// an implicit conjunction of field clauses, short-circuiting on the first
/// failed clause.
pub fn matches_document(
    doc: &Document,
    filter: &DocValue,
    config: &QueryEngineConfig,
) -> DbResult<bool> {
    let map = filter
        .as_object()
        .ok_or_else(|| DbError::invalid_query("filter must be an object"))?;
    matches_map(doc, map, config)
}

fn matches_map(
    doc: &Document,
    filter: &BTreeMap<String, DocValue>,
    config: &QueryEngineConfig,
) -> DbResult<bool> {
    for (key, value) in filter {
        match key.as_str() {
            "$and" => {
                let items = value.as_array().expect("validated: $and is an array");
                for item in items {
                    if !matches_subquery(doc, item, config)? {
                        return Ok(false);
                    }
                }
            }
            "$or" => {
                let items = value.as_array().expect("validated: $or is an array");
                if items.is_empty() {
                    // $or over an empty array matches nothing.
                    return Ok(false);
                }
                let mut any = false;
                for item in items {
                    if matches_subquery(doc, item, config)? {
                        any = true;
                        break;
                    }
                }
                if !any {
                    return Ok(false);
                }
            }
            _ => {
                if !field_matches(doc, key, value, config)? {
                    return Ok(false);
                }
            }
        }
    }
    Ok(true)
}

fn matches_subquery(doc: &Document, value: &DocValue, config: &QueryEngineConfig) -> DbResult<bool> {
    let map = value
        .as_object()
        .ok_or_else(|| DbError::invalid_query("subquery must be an object"))?;
    matches_map(doc, map, config)
}

fn field_matches(
    doc: &Document,
    field_path: &str,
    clause: &DocValue,
    _config: &QueryEngineConfig,
) -> DbResult<bool> {
    let actual = get_path(doc, field_path).cloned().unwrap_or(DocValue::Null);
    match clause {
        DocValue::Object(ops) if is_operator_object(ops) => {
            for (op, operand) in ops {
                let ok = match op.as_str() {
                    "$eq" => compare_eq(&actual, operand),
                    "$gt" => compare_gt(&actual, operand),
                    "$lt" => compare_lt(&actual, operand),
                    other => {
                        return Err(DbError::invalid_query(format!(
                            "unsupported field operator: {other}"
                        )))
                    }
                };
                if !ok {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        direct => Ok(compare_eq(&actual, direct)),
    }
}

/// A plain non-date non-array map whose keys begin with `$`. An empty map
/// is treated as an operator object with zero constraints (vacuously
/// true), matching `$and: []`'s vacuous-truth convention.
fn is_operator_object(map: &BTreeMap<String, DocValue>) -> bool {
    map.keys().all(|k| k.starts_with('$'))
}

/// `$eq` value semantics, reused by `blobdb-update`'s `$pull`
/// operator-object predicate form.
pub fn compare_eq(actual: &DocValue, expected: &DocValue) -> bool {
    match (actual, expected) {
        (DocValue::Timestamp(a), DocValue::Timestamp(b)) => a == b,
        (DocValue::Null, DocValue::Null) => true,
        (DocValue::Array(items), other) if !matches!(other, DocValue::Array(_)) => {
            items.iter().any(|item| compare_eq(item, other))
        }
        (DocValue::Array(a), DocValue::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| compare_eq(x, y))
        }
        (DocValue::Object(a), DocValue::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).map_or(false, |bv| compare_eq(v, bv)))
        }
        (DocValue::Number(a), DocValue::Number(b)) => a == b,
        (DocValue::Bool(a), DocValue::Bool(b)) => a == b,
        (DocValue::String(a), DocValue::String(b)) => a == b,
        _ => false,
    }
}

/// `$lt`/`$gt` ordering: both sides non-null, same-typed primitives
/// compare natively, dates compare by epoch, cross-type comparisons are
/// always false.
pub fn compare_lt(a: &DocValue, b: &DocValue) -> bool {
    match (a, b) {
        (DocValue::Timestamp(x), DocValue::Timestamp(y)) => x < y,
        (DocValue::Number(x), DocValue::Number(y)) => x < y,
        (DocValue::String(x), DocValue::String(y)) => x < y,
        (DocValue::Bool(x), DocValue::Bool(y)) => !*x && *y,
        _ => false,
    }
}

pub fn compare_gt(a: &DocValue, b: &DocValue) -> bool {
    match (a, b) {
        (DocValue::Timestamp(x), DocValue::Timestamp(y)) => x > y,
        (DocValue::Number(x), DocValue::Number(y)) => x > y,
        (DocValue::String(x), DocValue::String(y)) => x > y,
        (DocValue::Bool(x), DocValue::Bool(y)) => *x && !*y,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn doc(fields: &[(&str, DocValue)]) -> Document {
        fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn obj(fields: &[(&str, DocValue)]) -> DocValue {
        let map: BTreeMap<String, DocValue> =
            fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        DocValue::Object(map)
    }

    #[test]
    fn empty_filter_matches_all() {
        let config = QueryEngineConfig::default();
        let d = doc(&[("a", DocValue::Number(1.0))]);
        let filter = obj(&[]);
        assert!(matches_document(&d, &filter, &config).unwrap());
    }

    #[test]
    fn implicit_conjunction_of_field_clauses() {
        let config = QueryEngineConfig::default();
        let d = doc(&[("a", DocValue::Number(1.0)), ("b", DocValue::Number(2.0))]);
        let filter = obj(&[("a", DocValue::Number(1.0)), ("b", DocValue::Number(3.0))]);
        assert!(!matches_document(&d, &filter, &config).unwrap());
    }

    #[test]
    fn or_semantics_scenario() {
        let config = QueryEngineConfig::default();
        let docs = [
            doc(&[("a", DocValue::Number(1.0))]),
            doc(&[("b", DocValue::Number(2.0))]),
            doc(&[("a", DocValue::Number(1.0)), ("b", DocValue::Number(2.0))]),
            doc(&[("a", DocValue::Number(3.0)), ("b", DocValue::Number(3.0))]),
        ];
        let filter = obj(&[(
            "$or",
            DocValue::Array(vec![
                obj(&[("a", DocValue::Number(1.0))]),
                obj(&[("b", DocValue::Number(2.0))]),
            ]),
        )]);
        let matched: Vec<bool> = docs
            .iter()
            .map(|d| matches_document(d, &filter, &config).unwrap())
            .collect();
        assert_eq!(matched, vec![true, true, true, false]);
    }

    #[test]
    fn and_empty_matches_all_or_empty_matches_none() {
        let config = QueryEngineConfig::default();
        let d = doc(&[("a", DocValue::Number(1.0))]);
        let and_empty = obj(&[("$and", DocValue::Array(vec![]))]);
        let or_empty = obj(&[("$or", DocValue::Array(vec![]))]);
        assert!(matches_document(&d, &and_empty, &config).unwrap());
        assert!(!matches_document(&d, &or_empty, &config).unwrap());
    }

    #[test]
    fn dot_path_field_access() {
        let config = QueryEngineConfig::default();
        let mut nested = BTreeMap::new();
        nested.insert("b".to_string(), DocValue::Number(5.0));
        let mut top = Document::new();
        top.insert("a".to_string(), DocValue::Object(nested));
        let filter = obj(&[("a.b", DocValue::Number(5.0))]);
        assert!(matches_document(&top, &filter, &config).unwrap());
    }

    #[test]
    fn comparison_operators() {
        let config = QueryEngineConfig::default();
        let d = doc(&[("n", DocValue::Number(5.0))]);
        let gt = obj(&[("n", obj(&[("$gt", DocValue::Number(3.0))]))]);
        let lt = obj(&[("n", obj(&[("$lt", DocValue::Number(3.0))]))]);
        assert!(matches_document(&d, &gt, &config).unwrap());
        assert!(!matches_document(&d, &lt, &config).unwrap());
    }

    #[test]
    fn array_contains_semantics_for_eq() {
        let config = QueryEngineConfig::default();
        let d = doc(&[(
            "tags",
            DocValue::Array(vec![DocValue::from("a"), DocValue::from("b")]),
        )]);
        let filter = obj(&[("tags", DocValue::from("a"))]);
        assert!(matches_document(&d, &filter, &config).unwrap());
    }

    #[test]
    fn rejects_unsupported_operator() {
        let config = QueryEngineConfig::default();
        let filter = obj(&[("a", obj(&[("$ne", DocValue::Number(1.0))]))]);
        let err = validate_filter(&filter, &config).unwrap_err();
        assert!(err.is_invalid_query());
    }

    #[test]
    fn rejects_excessive_depth() {
        let config = QueryEngineConfig {
            max_nested_depth: 1,
            ..QueryEngineConfig::default()
        };
        let filter = obj(&[("a", obj(&[("b", DocValue::Number(1.0))]))]);
        let err = validate_filter(&filter, &config).unwrap_err();
        assert!(err.is_invalid_query());
    }

    #[test]
    fn rejects_non_array_and_shape() {
        let config = QueryEngineConfig::default();
        let filter = obj(&[("$and", DocValue::Number(1.0))]);
        let err = validate_filter(&filter, &config).unwrap_err();
        assert!(err.is_invalid_query());
    }
}
