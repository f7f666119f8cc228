//! Pipeline definition data model.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// A named, versioned pipeline document after inheritance and substitution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDefinition {
    /// Pipeline name.
    pub name: String,
    /// Document version. Numbers in the source are stringified.
    #[serde(default = "default_version", deserialize_with = "string_or_number")]
    pub version: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Parent definition name. Always `None` once resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    /// Pipeline-wide options.
    #[serde(default)]
    pub settings: Map<String, Value>,
    /// Stages in declaration order.
    #[serde(default)]
    pub stages: Vec<Stage>,
    /// Conditions the run must satisfy to count as successful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_criteria: Option<Value>,
    /// Notification targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<Value>,
    /// Metric declarations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
    /// Quality gate declarations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_gates: Option<Value>,
}

impl PipelineDefinition {
    /// A definition with default version and no settings.
    #[must_use]
    pub fn new(name: impl Into<String>, stages: Vec<Stage>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            description: None,
            extends: None,
            settings: Map::new(),
            stages,
            success_criteria: None,
            notifications: None,
            metrics: None,
            quality_gates: None,
        }
    }

    /// Looks up a stage by ID.
    #[must_use]
    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Stage IDs in declaration order.
    pub fn stage_ids(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|s| s.id.as_str())
    }
}

/// One unit of work bound to an external agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Stage {
    /// Unique ID within the pipeline.
    pub id: String,
    /// Opaque agent identifier.
    pub agent: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Explicit dependencies. `None` means "infer from document order".
    #[serde(default)]
    pub depends_on: Option<Vec<String>>,
    /// Stages allowed to run concurrently with this one.
    #[serde(default)]
    pub parallel_with: Vec<String>,
    /// Options handed to the agent.
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Memoise the agent result.
    #[serde(default)]
    pub cache: bool,
    /// Explicit cache key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    /// Cache TTL in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl: Option<u64>,
    /// Additional attempts after the first failure.
    #[serde(default)]
    pub retries: u32,
    /// Per-attempt timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// When false, failure does not abort the run.
    #[serde(default = "default_true")]
    pub required: bool,
    /// Boolean expression; the stage is skipped when it is false.
    #[serde(
        default,
        deserialize_with = "condition_expr",
        skip_serializing_if = "Option::is_none"
    )]
    pub condition: Option<String>,
    /// When false the stage stays in the graph with a `false` condition.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Merge onto the parent stage with the same ID.
    #[serde(default, rename = "override")]
    pub override_parent: bool,
    /// Resources locked for the duration of the agent call.
    #[serde(default)]
    pub locks: Vec<String>,
}

impl Stage {
    /// Creates a stage with default options.
    #[must_use]
    pub fn new(id: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent: agent.into(),
            description: None,
            depends_on: None,
            parallel_with: Vec::new(),
            config: Map::new(),
            cache: false,
            cache_key: None,
            cache_ttl: None,
            retries: 0,
            timeout: None,
            required: true,
            condition: None,
            enabled: true,
            override_parent: false,
            locks: Vec::new(),
        }
    }

    /// Sets explicit dependencies.
    #[must_use]
    pub fn with_depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = Some(deps.iter().map(ToString::to_string).collect());
        self
    }

    /// Sets `parallel_with`.
    #[must_use]
    pub fn with_parallel(mut self, peers: &[&str]) -> Self {
        self.parallel_with = peers.iter().map(ToString::to_string).collect();
        self
    }

    /// Marks the stage optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Effective dependencies (empty when none were declared or inferred).
    #[must_use]
    pub fn dependencies(&self) -> &[String] {
        self.depends_on.as_deref().unwrap_or_default()
    }

    /// Per-attempt timeout.
    #[must_use]
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }

    /// Whether `other` is linked to this stage through `parallel_with`
    /// in either direction.
    #[must_use]
    pub fn is_parallel_with(&self, other: &Stage) -> bool {
        self.parallel_with.iter().any(|p| *p == other.id)
            || other.parallel_with.iter().any(|p| *p == self.id)
    }
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_true() -> bool {
    true
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or number, got {other}"
        ))),
    }
}

fn condition_expr<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "condition must be an expression string or boolean, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stage_defaults() {
        let stage: Stage = serde_json::from_value(json!({"id": "a", "agent": "writer"})).unwrap();
        assert!(stage.required);
        assert!(stage.enabled);
        assert!(!stage.cache);
        assert_eq!(stage.retries, 0);
        assert_eq!(stage.depends_on, None);
        assert!(stage.dependencies().is_empty());
    }

    #[test]
    fn test_explicit_empty_depends_on_is_kept() {
        let stage: Stage =
            serde_json::from_value(json!({"id": "a", "agent": "w", "depends_on": []})).unwrap();
        assert_eq!(stage.depends_on, Some(vec![]));
    }

    #[test]
    fn test_condition_accepts_booleans() {
        let stage: Stage =
            serde_json::from_value(json!({"id": "a", "agent": "w", "condition": false})).unwrap();
        assert_eq!(stage.condition.as_deref(), Some("false"));
    }

    #[test]
    fn test_numeric_version_is_stringified() {
        let def: PipelineDefinition = serde_json::from_value(json!({
            "name": "p", "version": 2, "stages": [{"id": "a", "agent": "w"}]
        }))
        .unwrap();
        assert_eq!(def.version, "2");
    }

    #[test]
    fn test_unknown_stage_field_is_rejected() {
        let err = serde_json::from_value::<Stage>(json!({"id": "a", "agent": "w", "depend_on": ["x"]}))
            .unwrap_err();
        assert!(err.to_string().contains("depend_on"));
    }

    #[test]
    fn test_parallel_relation_is_symmetric() {
        let a = Stage::new("a", "w").with_parallel(&["b"]);
        let b = Stage::new("b", "w");
        assert!(a.is_parallel_with(&b));
        assert!(b.is_parallel_with(&a));
    }
}
