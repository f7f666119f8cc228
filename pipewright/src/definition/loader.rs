//! Definition loading and the process-lifetime loader cache.

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::inherit::{apply_disabled, extends_of, merge_documents};
use super::parser::{into_definition, parse_document};
use super::substitute::{load_scope, substitute};
use super::types::PipelineDefinition;
use super::validator::{infer_dependencies, is_valid_identifier, validate_references, validate_structure};
use crate::cache::canonical_json;
use crate::config::DefinitionsConfig;
use crate::errors::{codes, CycleDetectedError, NotFoundError, PipelineValidationError, Result};
use crate::plan::{compile_plan, ExecutionPlan};

const EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

/// A fully resolved definition together with its compiled plan.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPipeline {
    /// The merged, substituted and validated definition.
    pub definition: PipelineDefinition,
    /// The compiled execution plan.
    pub plan: ExecutionPlan,
    /// Files read to produce it, child first.
    pub sources: Vec<PathBuf>,
}

/// Resolves an already-merged document: substitution, validation,
/// dependency inference and plan compilation.
pub fn resolve_document(mut doc: Value, variables: &Map<String, Value>) -> Result<ResolvedPipeline> {
    if let Value::Object(map) = &mut doc {
        map.remove("extends");
    }
    let now = Utc::now();

    // Settings may themselves use markers; resolve them first so other
    // fields see the substituted values. Every string goes through exactly
    // one pass, so settings stay out of the document's pass.
    let raw_settings = match &mut doc {
        Value::Object(map) => map.remove("settings"),
        _ => None,
    }
    .unwrap_or_else(|| Value::Object(Map::new()));
    let mut settings = raw_settings.clone();
    substitute(&mut settings, &load_scope(variables, &raw_settings, now));

    substitute(&mut doc, &load_scope(variables, &settings, now));
    if let Value::Object(map) = &mut doc {
        map.insert("settings".into(), settings);
    }
    apply_disabled(&mut doc);

    let mut definition = into_definition(doc)?;
    validate_structure(&definition)?;
    infer_dependencies(&mut definition);
    validate_references(&definition)?;
    let plan = compile_plan(&definition)?;

    Ok(ResolvedPipeline {
        definition,
        plan,
        sources: Vec::new(),
    })
}

/// Resolves a self-contained document given as text.
///
/// Documents using `extends` need a [`DefinitionLoader`] to find the parent.
pub fn resolve_str(text: &str, variables: &Map<String, Value>) -> Result<ResolvedPipeline> {
    let doc = parse_document(text, "<inline>")?;
    if let Some(parent) = extends_of(&doc) {
        return Err(PipelineValidationError::coded(
            codes::INVALID,
            format!("Inline definition extends '{parent}'; load it through a DefinitionLoader"),
        )
        .into());
    }
    resolve_document(doc, variables)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    name: String,
    variables: String,
}

#[derive(Debug, Clone)]
struct CachedPipeline {
    pipeline: Arc<ResolvedPipeline>,
    /// (path, sha256) of every file in the extends chain.
    fingerprints: Vec<(PathBuf, String)>,
}

/// Loads named definitions from a list of search paths.
///
/// Results are cached by `(name, variables)`. A cache hit re-hashes every
/// file in the entry's `extends` chain and reloads on any change.
#[derive(Debug, Default)]
pub struct DefinitionLoader {
    search_paths: Vec<PathBuf>,
    cache: DashMap<CacheKey, CachedPipeline>,
}

impl DefinitionLoader {
    /// Creates a loader over the given search paths, probed in order.
    #[must_use]
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self {
            search_paths,
            cache: DashMap::new(),
        }
    }

    /// Creates a loader from configuration.
    #[must_use]
    pub fn from_config(config: &DefinitionsConfig) -> Self {
        Self::new(config.search_paths.clone())
    }

    /// The configured search paths.
    #[must_use]
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Finds the file for `name`.
    pub fn locate(&self, name: &str) -> Result<PathBuf> {
        if !is_valid_identifier(name) {
            return Err(PipelineValidationError::coded(
                codes::INVALID,
                format!("Invalid definition name '{name}': only letters, digits, '_' and '-' are allowed"),
            )
            .into());
        }

        let mut searched = Vec::new();
        for dir in &self.search_paths {
            for ext in EXTENSIONS {
                let candidate = dir.join(format!("{name}.{ext}"));
                if candidate.is_file() {
                    return Ok(candidate);
                }
                searched.push(candidate.display().to_string());
            }
        }
        Err(NotFoundError::new("definition", name).with_searched(searched).into())
    }

    /// Loads, resolves and plans the named definition.
    pub fn load(&self, name: &str, variables: &Map<String, Value>) -> Result<Arc<ResolvedPipeline>> {
        let key = CacheKey {
            name: name.to_string(),
            variables: canonical_json(&Value::Object(variables.clone())),
        };

        if let Some(entry) = self.cache.get(&key) {
            if fingerprints_match(&entry.fingerprints) {
                debug!(pipeline = %name, "Definition cache hit");
                return Ok(Arc::clone(&entry.pipeline));
            }
        }
        // Either a miss or a stale entry.
        self.cache.remove(&key);

        let mut fingerprints = Vec::new();
        let mut chain = Vec::new();
        let doc = self.resolve_chain(name, &mut chain, &mut fingerprints)?;
        let mut resolved = resolve_document(doc, variables)?;
        resolved.sources = fingerprints.iter().map(|(p, _)| p.clone()).collect();

        info!(
            pipeline = %name,
            stages = resolved.definition.stages.len(),
            batches = resolved.plan.batches.len(),
            "Definition loaded"
        );

        let pipeline = Arc::new(resolved);
        self.cache.insert(
            key,
            CachedPipeline {
                pipeline: Arc::clone(&pipeline),
                fingerprints,
            },
        );
        Ok(pipeline)
    }

    fn resolve_chain(
        &self,
        name: &str,
        chain: &mut Vec<String>,
        fingerprints: &mut Vec<(PathBuf, String)>,
    ) -> Result<Value> {
        if let Some(pos) = chain.iter().position(|n| n == name) {
            let mut path = chain[pos..].to_vec();
            path.push(name.to_string());
            return Err(CycleDetectedError::new("extends chain", path).into());
        }

        let path = self.locate(name)?;
        let bytes = std::fs::read(&path)?;
        fingerprints.push((path.clone(), sha256_hex(&bytes)));
        let text = String::from_utf8_lossy(&bytes);
        let mut doc = parse_document(&text, &path.display().to_string())?;
        // A document without a name is known by the name it was loaded under.
        if let Value::Object(map) = &mut doc {
            map.entry("name").or_insert_with(|| Value::String(name.to_string()));
        }

        let Some(parent) = extends_of(&doc) else {
            return Ok(doc);
        };
        chain.push(name.to_string());
        let parent_doc = self.resolve_chain(&parent, chain, fingerprints)?;
        chain.pop();
        debug!(child = %name, parent = %parent, "Merging inherited definition");
        merge_documents(parent_doc, doc)
    }

    /// Drops every cached entry for `name`.
    pub fn invalidate(&self, name: &str) {
        self.cache.retain(|key, _| key.name != name);
    }

    /// Drops all cached entries.
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Number of cached entries.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn fingerprints_match(fingerprints: &[(PathBuf, String)]) -> bool {
    fingerprints.iter().all(|(path, hash)| file_hash(path).as_deref() == Some(hash.as_str()))
}

fn file_hash(path: &Path) -> Option<String> {
    std::fs::read(path).ok().map(|b| sha256_hex(&b))
}
