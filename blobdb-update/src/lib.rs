//! UpdateEngine: applies a restricted MongoDB-style update-operator
//! document to a target document.
//!
//! Operators are dispatched by name over dot-paths rather than a
//! string-keyed table of closures. `$pull`'s operator-object and subquery
//! predicate forms reuse `blobdb-query`'s comparison helpers and matcher
//! directly rather than duplicating comparison logic.

use std::collections::BTreeMap;

use blobdb_common::document::get_path;
use blobdb_common::{DbError, DbResult, DocValue, Document, ID_FIELD};
use blobdb_query::{compare_eq, compare_gt, compare_lt, matches_document, QueryEngineConfig};

pub const SUPPORTED_OPERATORS: &[&str] = &[
    "$set",
    "$unset",
    "$inc",
    "$mul",
    "$min",
    "$max",
    "$push",
    "$pull",
    "$addToSet",
];

const PROTECTED_SEGMENTS: &[&str] = &["__proto__", "constructor", "prototype"];

/// Validate that an update document only names supported operators, each
/// mapping dot-paths to operands. Does not validate operand shapes, which
/// surface as `InvalidQuery` during `apply_update` instead.
pub fn validate_update_document(update: &Document) -> DbResult<()> {
    for (op, operand_map) in update {
        if !SUPPORTED_OPERATORS.contains(&op.as_str()) {
            return Err(DbError::invalid_query(format!(
                "unsupported update operator: {op}"
            )));
        }
        if operand_map.as_object().is_none() {
            return Err(DbError::invalid_query(format!(
                "{op} requires an object mapping paths to operands"
            )));
        }
    }
    Ok(())
}

/// Apply `update` to a deep clone of `doc`, returning the mutated clone.
/// The original is never mutated in place, so any `Err` return means `doc`
/// was left untouched.
pub fn apply_update(
    doc: &Document,
    update: &Document,
    query_config: &QueryEngineConfig,
) -> DbResult<Document> {
    validate_update_document(update)?;
    let mut working: Document = doc.clone();

    for (op, operand_map) in update {
        let operands = operand_map.as_object().expect("validated above");
        for (path, operand) in operands {
            let segments: Vec<&str> = path.split('.').collect();
            validate_path(&segments)?;
            match op.as_str() {
                "$set" => set_path(&mut working, &segments, operand.clone()),
                "$unset" => {
                    unset_path(&mut working, &segments);
                }
                "$inc" => apply_inc(&mut working, &segments, operand, |cur, delta| cur + delta)?,
                "$mul" => apply_inc(&mut working, &segments, operand, |cur, factor| cur * factor)?,
                "$min" => apply_min_max(&mut working, &segments, operand, true)?,
                "$max" => apply_min_max(&mut working, &segments, operand, false)?,
                "$push" => apply_push(&mut working, &segments, operand, false)?,
                "$addToSet" => apply_push(&mut working, &segments, operand, true)?,
                "$pull" => apply_pull(&mut working, &segments, operand, query_config)?,
                other => return Err(DbError::invalid_query(format!("unsupported update operator: {other}"))),
            }
        }
    }

    Ok(working)
}

fn validate_path(segments: &[&str]) -> DbResult<()> {
    if segments.first() == Some(&ID_FIELD) {
        return Err(DbError::invalid_query("_id is immutable and cannot be targeted by update operators"));
    }
    for segment in segments {
        if PROTECTED_SEGMENTS.contains(segment) {
            return Err(DbError::invalid_query(format!(
                "path segment '{segment}' is not allowed"
            )));
        }
    }
    Ok(())
}

fn set_path(doc: &mut Document, segments: &[&str], value: DocValue) {
    set_path_rec(doc, segments, value);
}

fn set_path_rec(map: &mut BTreeMap<String, DocValue>, segments: &[&str], value: DocValue) {
    if segments.len() == 1 {
        map.insert(segments[0].to_string(), value);
        return;
    }
    let entry = map
        .entry(segments[0].to_string())
        .or_insert_with(|| DocValue::Object(BTreeMap::new()));
    if !matches!(entry, DocValue::Object(_)) {
        *entry = DocValue::Object(BTreeMap::new());
    }
    if let DocValue::Object(inner) = entry {
        set_path_rec(inner, &segments[1..], value);
    }
}

fn unset_path(doc: &mut Document, segments: &[&str]) -> bool {
    unset_path_rec(doc, segments)
}

fn unset_path_rec(map: &mut BTreeMap<String, DocValue>, segments: &[&str]) -> bool {
    if segments.len() == 1 {
        return map.remove(segments[0]).is_some();
    }
    match map.get_mut(segments[0]) {
        Some(DocValue::Object(inner)) => unset_path_rec(inner, &segments[1..]),
        _ => false,
    }
}

fn numeric_at(doc: &Document, segments: &[&str]) -> DbResult<f64> {
    let path = segments.join(".");
    match get_path(doc, &path) {
        None => Ok(0.0),
        Some(DocValue::Number(n)) => Ok(*n),
        Some(_) => Err(DbError::invalid_query(format!(
            "cannot apply numeric update to non-numeric field '{path}'"
        ))),
    }
}

fn apply_inc(
    doc: &mut Document,
    segments: &[&str],
    operand: &DocValue,
    combine: impl Fn(f64, f64) -> f64,
) -> DbResult<()> {
    let delta = operand
        .as_f64()
        .ok_or_else(|| DbError::invalid_query("$inc/$mul operand must be numeric"))?;
    let current = numeric_at(doc, segments)?;
    set_path_rec(doc, segments, DocValue::Number(combine(current, delta)));
    Ok(())
}

fn apply_min_max(doc: &mut Document, segments: &[&str], operand: &DocValue, is_min: bool) -> DbResult<()> {
    let path = segments.join(".");
    match get_path(doc, &path) {
        None => set_path_rec(doc, segments, operand.clone()),
        Some(current) => {
            let should_write = if is_min {
                compare_lt(operand, current)
            } else {
                compare_gt(operand, current)
            };
            if should_write {
                set_path_rec(doc, segments, operand.clone());
            }
        }
    }
    Ok(())
}

fn operand_values(operand: &DocValue) -> Vec<DocValue> {
    match operand {
        DocValue::Object(map) if map.len() == 1 && map.contains_key("$each") => {
            match map.get("$each") {
                Some(DocValue::Array(items)) => items.clone(),
                _ => vec![],
            }
        }
        other => vec![other.clone()],
    }
}

fn apply_push(doc: &mut Document, segments: &[&str], operand: &DocValue, set_semantics: bool) -> DbResult<()> {
    let path = segments.join(".");
    let mut items = match get_path(doc, &path) {
        None => Vec::new(),
        Some(DocValue::Array(items)) => items.clone(),
        Some(_) => {
            return Err(DbError::invalid_query(format!(
                "cannot push onto non-array field '{path}'"
            )))
        }
    };
    for candidate in operand_values(operand) {
        if set_semantics && items.iter().any(|existing| existing == &candidate) {
            continue;
        }
        items.push(candidate);
    }
    set_path_rec(doc, segments, DocValue::Array(items));
    Ok(())
}

fn is_operator_object(map: &BTreeMap<String, DocValue>) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$'))
}

fn pull_matches(item: &DocValue, predicate: &DocValue, query_config: &QueryEngineConfig) -> DbResult<bool> {
    match predicate {
        DocValue::Object(map) if is_operator_object(map) => {
            for (op, operand) in map {
                let ok = match op.as_str() {
                    "$eq" => compare_eq(item, operand),
                    "$gt" => compare_gt(item, operand),
                    "$lt" => compare_lt(item, operand),
                    other => {
                        return Err(DbError::invalid_query(format!(
                            "unsupported $pull predicate operator: {other}"
                        )))
                    }
                };
                if !ok {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        DocValue::Object(map) => match item {
            DocValue::Object(inner) => {
                matches_document(inner, &DocValue::Object(map.clone()), query_config)
            }
            _ => Ok(false),
        },
        scalar => Ok(item == scalar),
    }
}

fn apply_pull(
    doc: &mut Document,
    segments: &[&str],
    predicate: &DocValue,
    query_config: &QueryEngineConfig,
) -> DbResult<()> {
    let path = segments.join(".");
    let items = match get_path(doc, &path) {
        None => return Ok(()),
        Some(DocValue::Array(items)) => items.clone(),
        Some(_) => {
            return Err(DbError::invalid_query(format!(
                "cannot pull from non-array field '{path}'"
            )))
        }
    };
    let mut kept = Vec::with_capacity(items.len());
    for item in items {
        if !pull_matches(&item, predicate, query_config)? {
            kept.push(item);
        }
    }
    set_path_rec(doc, segments, DocValue::Array(kept));
    Ok(())
}
