//! Pipeline definitions: data model, parsing, inheritance, substitution,
//! validation and loading.
//!
//! A definition goes through these steps on load:
//!
//! 1. Parse the named YAML document into a generic tree.
//! 2. Resolve `extends` recursively and merge child onto parent.
//! 3. Substitute `${ expr }` markers.
//! 4. Deserialize into [`PipelineDefinition`] and validate its structure.
//! 5. Infer implicit dependencies.
//! 6. Validate `depends_on` / `parallel_with` references.
//! 7. Compile the [`ExecutionPlan`](crate::plan::ExecutionPlan).

mod inherit;
mod loader;
mod parser;
mod substitute;
mod types;
mod validator;

pub use inherit::{deep_merge, merge_documents};
pub use loader::{resolve_document, resolve_str, DefinitionLoader, ResolvedPipeline};
pub use parser::{parse_definition, parse_document, parse_document_file};
pub use substitute::{load_scope, substitute, substitute_str};
pub use types::{PipelineDefinition, Stage};
pub use validator::{infer_dependencies, is_valid_identifier, validate_references, validate_structure};
