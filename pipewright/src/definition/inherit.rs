//! `extends` resolution.
//!
//! Merging happens on the raw document tree before substitution, so a child
//! can override a parent setting that the parent's own markers refer to.

use serde_json::Value;
use tracing::warn;

use crate::errors::{codes, ErrorInfo, PipelineValidationError, Result};

/// Top-level mapping fields merged key-by-key like `settings`.
const DEEP_MERGED: [&str; 5] = [
    "settings",
    "success_criteria",
    "notifications",
    "metrics",
    "quality_gates",
];

/// Recursively merges `overlay` onto `base`. Mappings merge, everything
/// else (including sequences) is replaced by the overlay.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Merges a child document onto its already-resolved parent.
pub fn merge_documents(parent: Value, child: Value) -> Result<Value> {
    let Value::Object(mut merged) = parent else {
        return Err(PipelineValidationError::coded(codes::INVALID, "Parent document is not a mapping").into());
    };
    let Value::Object(child) = child else {
        return Err(PipelineValidationError::coded(codes::INVALID, "Child document is not a mapping").into());
    };
    let child_name = child
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("<unnamed>")
        .to_string();

    // Name and description always come from the child.
    merged.remove("description");
    merged.remove("extends");

    for (key, value) in child {
        match key.as_str() {
            "extends" => {}
            "stages" => {
                let parent_stages = match merged.remove("stages") {
                    Some(Value::Array(stages)) => stages,
                    _ => Vec::new(),
                };
                let child_stages = match value {
                    Value::Array(stages) => stages,
                    other => {
                        // Let typed validation report the shape error.
                        merged.insert("stages".into(), other);
                        continue;
                    }
                };
                let stages = merge_stages(&child_name, parent_stages, child_stages)?;
                merged.insert("stages".into(), Value::Array(stages));
            }
            k if DEEP_MERGED.contains(&k) => match merged.get_mut(k) {
                Some(existing) => deep_merge(existing, value),
                None => {
                    merged.insert(k.to_string(), value);
                }
            },
            _ => {
                merged.insert(key, value);
            }
        }
    }

    Ok(Value::Object(merged))
}

fn stage_id(stage: &Value) -> Option<&str> {
    stage.get("id").and_then(Value::as_str)
}

fn is_override(stage: &Value) -> bool {
    stage.get("override").and_then(Value::as_bool).unwrap_or(false)
}

fn merge_stages(pipeline: &str, parent: Vec<Value>, child: Vec<Value>) -> Result<Vec<Value>> {
    let mut stages = parent;

    for mut stage in child {
        let override_requested = is_override(&stage);
        if let Value::Object(map) = &mut stage {
            map.remove("override");
        }

        let existing = stage_id(&stage)
            .and_then(|id| stages.iter().position(|s| stage_id(s) == Some(id)));

        match (existing, override_requested) {
            (Some(idx), true) => deep_merge(&mut stages[idx], stage),
            (Some(_), false) => {
                let id = stage_id(&stage).unwrap_or_default().to_string();
                return Err(PipelineValidationError::new(format!(
                    "Stage '{id}' in '{pipeline}' redefines an inherited stage without `override: true`"
                ))
                .with_stages(vec![id.clone()])
                .with_error_info(
                    ErrorInfo::new(codes::CONFLICT, "Inherited stage redefined")
                        .with_fix_hint("Set `override: true` to merge onto the parent stage, or rename it.")
                        .with_context_entry("stage", id),
                )
                .into());
            }
            (None, true) => {
                warn!(
                    pipeline = %pipeline,
                    stage = stage_id(&stage).unwrap_or_default(),
                    "Override has no parent stage; appending"
                );
                stages.push(stage);
            }
            (None, false) => stages.push(stage),
        }
    }

    Ok(stages)
}

/// Rewrites the condition of every `enabled: false` stage to `false`.
pub fn apply_disabled(doc: &mut Value) {
    let Some(Value::Array(stages)) = doc.get_mut("stages") else {
        return;
    };
    for stage in stages {
        if let Value::Object(map) = stage {
            if map.get("enabled") == Some(&Value::Bool(false)) {
                map.insert("condition".into(), Value::Bool(false));
            }
        }
    }
}

/// Returns the `extends` target of a raw document, if any.
pub fn extends_of(doc: &Value) -> Option<String> {
    doc.get("extends").and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn parent() -> Value {
        json!({
            "name": "base",
            "version": "1.0",
            "description": "base pipeline",
            "settings": {"language": "en", "images": {"enabled": true, "count": 4}},
            "stages": [
                {"id": "outline", "agent": "outliner"},
                {"id": "write", "agent": "writer", "config": {"model": "small", "words": 1000}}
            ],
            "quality_gates": {"min_words": 500}
        })
    }

    #[test]
    fn test_deep_merge_replaces_sequences() {
        let mut base = json!({"a": {"b": 1, "c": [1, 2]}, "d": 1});
        deep_merge(&mut base, json!({"a": {"c": [3]}, "e": 2}));
        assert_eq!(base, json!({"a": {"b": 1, "c": [3]}, "d": 1, "e": 2}));
    }

    #[test]
    fn test_override_merges_onto_parent_stage() {
        let child = json!({
            "name": "premium",
            "extends": "base",
            "settings": {"images": {"count": 8}},
            "stages": [
                {"id": "write", "override": true, "config": {"model": "large"}},
                {"id": "publish", "agent": "publisher"}
            ]
        });

        let merged = merge_documents(parent(), child).unwrap();
        assert_eq!(merged["name"], "premium");
        assert_eq!(merged.get("description"), None);
        assert_eq!(merged.get("extends"), None);
        assert_eq!(merged["version"], "1.0");
        assert_eq!(
            merged["settings"],
            json!({"language": "en", "images": {"enabled": true, "count": 8}})
        );
        assert_eq!(merged["quality_gates"], json!({"min_words": 500}));

        let stages = merged["stages"].as_array().unwrap();
        assert_eq!(stages.len(), 3);
        assert_eq!(
            stages[1],
            json!({"id": "write", "agent": "writer", "config": {"model": "large", "words": 1000}})
        );
        assert_eq!(stages[2]["id"], "publish");
    }

    #[test]
    fn test_redefinition_without_override_conflicts() {
        let child = json!({"name": "c", "stages": [{"id": "write", "agent": "other"}]});
        let err = merge_documents(parent(), child).unwrap_err();
        assert_eq!(err.code(), codes::CONFLICT);
    }

    #[test]
    fn test_orphan_override_is_appended() {
        let child = json!({"name": "c", "stages": [{"id": "extra", "agent": "x", "override": true}]});
        let merged = merge_documents(parent(), child).unwrap();
        let stages = merged["stages"].as_array().unwrap();
        assert_eq!(stages.len(), 3);
        assert_eq!(stages[2], json!({"id": "extra", "agent": "x"}));
    }

    #[test]
    fn test_disabled_stage_keeps_node_with_false_condition() {
        let child = json!({"name": "c", "stages": [{"id": "write", "override": true, "enabled": false}]});
        let mut merged = merge_documents(parent(), child).unwrap();
        apply_disabled(&mut merged);
        let write = &merged["stages"][1];
        assert_eq!(write["condition"], json!(false));
        assert_eq!(write["agent"], "writer");
    }

    #[test]
    fn test_extends_of() {
        assert_eq!(extends_of(&json!({"extends": "base"})), Some("base".into()));
        assert_eq!(extends_of(&json!({})), None);
    }
}
