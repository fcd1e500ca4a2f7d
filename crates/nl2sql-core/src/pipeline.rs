//! Extract → relocate → validate, with one bounded limit retry.

use std::collections::BTreeSet;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::{
    dialect::Dialect,
    extract::extract_sql,
    relocate::move_joins_before_where,
    validate::{AstValidator, SqlValidator, ValidationReport},
};

/// Terminal outcomes of a compile run. Policy failures are not errors; they
/// travel inside the [`ValidationReport`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("no SQL could be extracted from model output")]
    EmptyExtraction,
}

/// Final statement and the report that belongs to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompiledSql {
    pub sql: String,
    pub report: ValidationReport,
    /// Set when the terminator-stripped retry candidate replaced the first attempt.
    pub retry_adopted: bool,
}

/// Orchestrates the post-processing stages for one model response.
///
/// The row limit bound is part of the pipeline itself so that every
/// validation call, retries included, sees the same configured maximum.
#[derive(Debug, Clone)]
pub struct CompilePipeline<V = AstValidator> {
    validator: V,
    limit_max: u64,
}

impl CompilePipeline<AstValidator> {
    pub fn new(limit_max: u64) -> Self {
        Self::with_validator(AstValidator, limit_max)
    }
}

impl<V> CompilePipeline<V>
where
    V: SqlValidator,
{
    pub fn with_validator(validator: V, limit_max: u64) -> Self {
        Self {
            validator,
            limit_max,
        }
    }

    pub fn limit_max(&self) -> u64 {
        self.limit_max
    }

    /// Runs the full pipeline over `raw` model output.
    ///
    /// When the first attempt parses as a read-only query but fails only the
    /// limit check, the statement is validated once more without its trailing
    /// `;`. The retry candidate is kept only if it parses and passes the limit
    /// check; otherwise the first attempt is returned unchanged.
    #[instrument(skip_all, fields(dialect = %dialect, limit_max = self.limit_max))]
    pub fn compile(
        &self,
        raw: &str,
        dialect: Dialect,
        allowed_tables: &BTreeSet<String>,
    ) -> Result<CompiledSql, CompileError> {
        let extracted = extract_sql(raw);
        if extracted.trim().is_empty() {
            warn!(raw_len = raw.len(), "model output contained no SQL candidate");
            return Err(CompileError::EmptyExtraction);
        }
        debug!(sql = %extracted, "extracted candidate statement");

        let sql = move_joins_before_where(&extracted);
        debug!(sql = %sql, "repositioned candidate statement");

        let report = self
            .validator
            .validate(&sql, dialect, allowed_tables, self.limit_max);

        if report.parse_ok && report.select_only && !report.limit_ok {
            let trimmed = sql.trim_end();
            let candidate = trimmed.strip_suffix(';').unwrap_or(trimmed).trim_end();
            let retry = self
                .validator
                .validate(candidate, dialect, allowed_tables, self.limit_max);

            if retry.parse_ok && retry.limit_ok {
                info!("limit check passed once the trailing terminator was removed");
                return Ok(CompiledSql {
                    sql: candidate.to_string(),
                    report: retry,
                    retry_adopted: true,
                });
            }
            debug!("retry without terminator did not satisfy the limit check");
        }

        Ok(CompiledSql {
            sql,
            report,
            retry_adopted: false,
        })
    }
}
