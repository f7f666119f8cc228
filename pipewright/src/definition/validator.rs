//! Definition validation and implicit-dependency inference.

use std::collections::HashSet;

use super::types::PipelineDefinition;
use crate::errors::{codes, ErrorInfo, PipelineValidationError, Result};

/// Returns true if `s` is a valid definition or stage identifier.
#[must_use]
pub fn is_valid_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Structural checks that do not depend on the dependency graph.
pub fn validate_structure(def: &PipelineDefinition) -> Result<()> {
    if def.name.trim().is_empty() {
        return Err(PipelineValidationError::coded(codes::INVALID, "Pipeline name cannot be empty").into());
    }

    if def.stages.is_empty() {
        return Err(PipelineValidationError::new(format!(
            "Pipeline '{}' must have at least one stage",
            def.name
        ))
        .with_error_info(
            ErrorInfo::new(codes::EMPTY, "Pipeline has no stages")
                .with_fix_hint("Add at least one entry under `stages`."),
        )
        .into());
    }

    let mut seen = HashSet::new();
    for stage in &def.stages {
        if !is_valid_identifier(&stage.id) {
            return Err(invalid_stage(
                &stage.id,
                format!(
                    "Invalid stage id '{}': only letters, digits, '_' and '-' are allowed",
                    stage.id
                ),
            ));
        }
        if !seen.insert(stage.id.as_str()) {
            return Err(PipelineValidationError::new(format!(
                "Duplicate stage id '{}' in pipeline '{}'",
                stage.id, def.name
            ))
            .with_stages(vec![stage.id.clone()])
            .with_error_info(
                ErrorInfo::new(codes::DUPLICATE_ID, "Stage IDs must be unique")
                    .with_context_entry("stage", stage.id.clone()),
            )
            .into());
        }
        if stage.agent.trim().is_empty() {
            return Err(invalid_stage(&stage.id, format!("Stage '{}' has an empty agent", stage.id)));
        }
        if stage.timeout == Some(0) {
            return Err(invalid_stage(
                &stage.id,
                format!("Stage '{}' has a zero timeout", stage.id),
            ));
        }
        if stage.cache_ttl == Some(0) {
            return Err(invalid_stage(
                &stage.id,
                format!("Stage '{}' has a zero cache_ttl", stage.id),
            ));
        }
        if stage.parallel_with.iter().any(|p| *p == stage.id) {
            return Err(invalid_stage(
                &stage.id,
                format!("Stage '{}' lists itself in parallel_with", stage.id),
            ));
        }
        if let Some(both) = stage
            .parallel_with
            .iter()
            .find(|p| stage.dependencies().contains(*p))
        {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' both depends on and runs in parallel with '{both}'",
                stage.id
            ))
            .with_stages(vec![stage.id.clone(), both.clone()])
            .with_error_info(ErrorInfo::new(codes::INVALID, "Contradictory ordering"))
            .into());
        }
    }

    Ok(())
}

fn invalid_stage(id: &str, message: String) -> crate::errors::PipewrightError {
    PipelineValidationError::coded(codes::INVALID, message)
        .with_stages(vec![id.to_string()])
        .into()
}

/// Fills in `depends_on` for stages that did not declare it.
///
/// Such a stage depends on the nearest preceding required stage. Stages
/// linked to it through `parallel_with` are skipped, since depending on a
/// declared parallel peer would make the two unschedulable together.
pub fn infer_dependencies(def: &mut PipelineDefinition) {
    for idx in 0..def.stages.len() {
        if def.stages[idx].depends_on.is_some() {
            continue;
        }
        let current = &def.stages[idx];
        let inferred: Vec<String> = def.stages[..idx]
            .iter()
            .rev()
            .find(|prev| prev.required && !prev.is_parallel_with(current))
            .map(|prev| vec![prev.id.clone()])
            .unwrap_or_default();
        def.stages[idx].depends_on = Some(inferred);
    }
}

/// Every `depends_on` / `parallel_with` reference must name a stage.
pub fn validate_references(def: &PipelineDefinition) -> Result<()> {
    let ids: HashSet<&str> = def.stage_ids().collect();

    for stage in &def.stages {
        let refs = stage
            .dependencies()
            .iter()
            .map(|d| (d, "depends_on"))
            .chain(stage.parallel_with.iter().map(|p| (p, "parallel_with")));

        for (target, field) in refs {
            if !ids.contains(target.as_str()) {
                return Err(PipelineValidationError::new(format!(
                    "Stage '{}' {field} unknown stage '{target}'",
                    stage.id
                ))
                .with_stages(vec![stage.id.clone(), target.clone()])
                .with_error_info(
                    ErrorInfo::new(codes::MISSING_REF, "Reference to an undefined stage")
                        .with_fix_hint(format!("Define stage '{target}' or remove the reference."))
                        .with_context_entry("stage", stage.id.clone())
                        .with_context_entry("missing", target.clone()),
                )
                .into());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::types::Stage;
    use crate::errors::PipewrightError;
    use pretty_assertions::assert_eq;

    fn def(stages: Vec<Stage>) -> PipelineDefinition {
        PipelineDefinition::new("p", stages)
    }

    #[test]
    fn test_identifiers() {
        assert!(is_valid_identifier("ebook-premium_2"));
        assert!(!is_valid_identifier("../etc/passwd"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("a b"));
    }

    #[test]
    fn test_empty_pipeline() {
        let err = validate_structure(&def(vec![])).unwrap_err();
        assert_eq!(err.code(), codes::EMPTY);
    }

    #[test]
    fn test_duplicate_ids() {
        let err = validate_structure(&def(vec![Stage::new("a", "x"), Stage::new("a", "y")]))
            .unwrap_err();
        assert_eq!(err.code(), codes::DUPLICATE_ID);
        let PipewrightError::Validation(e) = err else { panic!() };
        assert_eq!(e.stages, vec!["a".to_string()]);
    }

    #[test]
    fn test_contradictory_ordering() {
        let b = Stage::new("b", "x").with_depends_on(&["a"]).with_parallel(&["a"]);
        let err = validate_structure(&def(vec![Stage::new("a", "x"), b])).unwrap_err();
        assert!(err.to_string().contains("both depends on and runs in parallel"));
    }

    #[test]
    fn test_inference_skips_optional_and_parallel_peers() {
        let mut d = def(vec![
            Stage::new("a", "x"),
            Stage::new("b", "x").optional(),
            Stage::new("c", "x"),
            Stage::new("d", "x").with_parallel(&["c"]),
            Stage::new("e", "x").with_depends_on(&[]),
        ]);
        infer_dependencies(&mut d);
        let deps: Vec<_> = d.stages.iter().map(|s| s.dependencies().to_vec()).collect();
        assert_eq!(
            deps,
            vec![
                vec![],
                vec!["a".to_string()],
                vec!["a".to_string()],
                vec!["a".to_string()],
                vec![],
            ]
        );
    }

    #[test]
    fn test_missing_reference() {
        let d = def(vec![Stage::new("a", "x").with_depends_on(&["ghost"])]);
        let err = validate_references(&d).unwrap_err();
        assert_eq!(err.code(), codes::MISSING_REF);
        assert!(err.to_string().contains("ghost"));

        let d = def(vec![Stage::new("a", "x").with_parallel(&["ghost"])]);
        assert_eq!(validate_references(&d).unwrap_err().code(), codes::MISSING_REF);
    }
}
