//! `${ expr }` substitution over a document tree.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;
use tracing::debug;

use crate::expr::{self, Scope};

fn marker() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| Regex::new(r"\$\{([^{}]*)\}").expect("valid regex"))
}

/// Builds the load-time lookup scope.
#[must_use]
pub fn load_scope(variables: &Map<String, Value>, settings: &Value, now: DateTime<Utc>) -> Scope {
    Scope::new()
        .with_root("variables", Value::Object(variables.clone()))
        .with_root("settings", settings.clone())
        .with_root("timestamp", Value::String(now.to_rfc3339()))
        .with_root("date", Value::String(now.format("%Y-%m-%d").to_string()))
        .with_env()
}

/// Substitutes every marker in every string value of `doc`.
///
/// Mapping keys are left alone. Markers that fail to evaluate stay verbatim.
pub fn substitute(doc: &mut Value, scope: &Scope) {
    match doc {
        Value::String(s) => {
            if let Some(replacement) = substitute_str(s, scope) {
                *doc = replacement;
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| substitute(v, scope)),
        Value::Object(map) => map.values_mut().for_each(|v| substitute(v, scope)),
        _ => {}
    }
}

/// Returns the replacement for `s`, or `None` when nothing changed.
///
/// A string that is exactly one marker yields the typed result; otherwise
/// each marker is replaced by its string rendering.
pub fn substitute_str(s: &str, scope: &Scope) -> Option<Value> {
    let re = marker();
    if !re.is_match(s) {
        return None;
    }

    if let Some(caps) = re.captures(s) {
        if caps.get(0).is_some_and(|m| m.start() == 0 && m.end() == s.len()) {
            let src = caps.get(1).map_or("", |m| m.as_str());
            return match expr::evaluate(src, scope) {
                Ok(value) => Some(value),
                Err(e) => {
                    debug!(marker = %s, error = %e, "Leaving marker verbatim");
                    None
                }
            };
        }
    }

    let mut changed = false;
    let out = re.replace_all(s, |caps: &regex::Captures<'_>| {
        let whole = caps.get(0).map_or("", |m| m.as_str());
        let src = caps.get(1).map_or("", |m| m.as_str());
        match expr::evaluate(src, scope) {
            Ok(value) => {
                changed = true;
                expr::render(&value)
            }
            Err(e) => {
                debug!(marker = %whole, error = %e, "Leaving marker verbatim");
                whole.to_string()
            }
        }
    });
    changed.then(|| Value::String(out.into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn scope() -> Scope {
        let vars = json!({"topic": "rust", "chapters": 12});
        let now = DateTime::parse_from_rfc3339("2024-05-06T07:08:09Z")
            .unwrap()
            .with_timezone(&Utc);
        load_scope(
            vars.as_object().unwrap(),
            &json!({"language": "en"}),
            now,
        )
    }

    #[test]
    fn test_whole_marker_is_typed() {
        assert_eq!(substitute_str("${variables.chapters}", &scope()), Some(json!(12)));
        assert_eq!(substitute_str("${chapters > 10}", &scope()), Some(json!(true)));
    }

    #[test]
    fn test_embedded_markers_are_rendered() {
        assert_eq!(
            substitute_str("A book on ${topic} in ${settings.language} (${date})", &scope()),
            Some(json!("A book on rust in en (2024-05-06)"))
        );
    }

    #[test]
    fn test_failures_stay_verbatim() {
        assert_eq!(substitute_str("${variables.nope}", &scope()), None);
        assert_eq!(
            substitute_str("${topic} costs ${price}", &scope()),
            Some(json!("rust costs ${price}"))
        );
        assert_eq!(substitute_str("plain text", &scope()), None);
    }

    #[test]
    fn test_substitute_walks_the_tree_but_not_keys() {
        let mut doc = json!({
            "${topic}": "key untouched",
            "stages": [{"config": {"title": "${topic}", "n": "${chapters}"}}],
            "when": "${stages.a.status == 'succeeded'}"
        });
        substitute(&mut doc, &scope());
        assert_eq!(
            doc,
            json!({
                "${topic}": "key untouched",
                "stages": [{"config": {"title": "rust", "n": 12}}],
                "when": "${stages.a.status == 'succeeded'}"
            })
        );
    }

    #[test]
    fn test_defaults_via_or() {
        assert_eq!(
            substitute_str("${variables.lang || 'en'}", &scope()),
            Some(json!("en"))
        );
    }
}
