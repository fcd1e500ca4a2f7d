//! Post-processing core turning chatty model output into one policy-checked
//! SQL statement.
//!
//! The crate is split along the stages a compile request walks through:
//! [`extract`] isolates the statement from prose and markup, [`relocate`]
//! repairs JOIN clauses emitted after `WHERE`, [`validate`] parses the result
//! with `sqlparser` and derives the policy facts, and [`pipeline`] glues the
//! three together with the single limit retry. [`schema`] holds the YAML backed
//! table catalog that supplies the allow-list and the prompt text.
//!
//! Everything except [`schema::SchemaRegistry`] is a pure function over
//! request scoped data and can be called from any number of tasks at once.

pub mod dialect;
pub mod extract;
pub mod pipeline;
pub mod relocate;
pub mod schema;
pub mod validate;

pub use dialect::Dialect;
pub use extract::extract_sql;
pub use pipeline::{CompileError, CompilePipeline, CompiledSql};
pub use relocate::move_joins_before_where;
pub use schema::{CatalogSnapshot, SchemaError, SchemaRegistry};
pub use validate::{validate_sql, AstValidator, SqlValidator, ValidationReport};
