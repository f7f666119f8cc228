//! Definition document parsing.
//!
//! Documents are parsed in two steps: first into a generic JSON tree, which
//! inheritance and substitution operate on, then into typed structs.

use serde_json::Value;
use std::path::Path;

use super::types::PipelineDefinition;
use crate::errors::{codes, ErrorInfo, PipelineValidationError, Result};

/// Parses YAML (or JSON) text into a document tree.
pub fn parse_document(text: &str, source: &str) -> Result<Value> {
    if text.trim().is_empty() {
        return Err(PipelineValidationError::coded(
            codes::PARSE,
            format!("Empty definition document: {source}"),
        )
        .into());
    }

    let doc: Value = serde_yaml::from_str(text).map_err(|e| {
        PipelineValidationError::new(format!("Invalid YAML in {source}: {e}")).with_error_info(
            ErrorInfo::new(codes::PARSE, "Definition could not be parsed")
                .with_context_entry("source", source),
        )
    })?;

    if !doc.is_object() {
        return Err(PipelineValidationError::coded(
            codes::PARSE,
            format!("Definition {source} must be a mapping at the top level"),
        )
        .into());
    }
    Ok(doc)
}

/// Reads and parses a document from disk.
pub fn parse_document_file(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)?;
    parse_document(&text, &path.display().to_string())
}

/// Converts a resolved document tree into a typed definition.
pub fn into_definition(doc: Value) -> Result<PipelineDefinition> {
    serde_json::from_value(doc).map_err(|e| {
        let msg = e.to_string();
        let message = match extract_missing_field(&msg) {
            Some(field) => format!("Missing required field: {field}"),
            None => format!("Invalid definition: {msg}"),
        };
        PipelineValidationError::coded(codes::INVALID, message).into()
    })
}

/// Parses a self-contained document (no `extends`, no substitution).
pub fn parse_definition(text: &str) -> Result<PipelineDefinition> {
    into_definition(parse_document(text, "<inline>")?)
}

fn extract_missing_field(error_message: &str) -> Option<&str> {
    let marker = "missing field `";
    let start = error_message.find(marker)? + marker.len();
    let rest = &error_message[start..];
    let end = rest.find('`')?;
    Some(&rest[..end])
}
