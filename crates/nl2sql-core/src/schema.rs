//! File backed schema catalog: allowed tables, default dialect and the schema
//! text rendered into model prompts.
//!
//! The registry re-reads its YAML file when the modification time changes.
//! Request handlers never read it directly during a compile run; they take a
//! [`CatalogSnapshot`] up front so a concurrent reload cannot change the
//! allow-list halfway through a request.

use std::{
    collections::BTreeSet,
    fs, io,
    path::{Path, PathBuf},
    time::SystemTime,
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;
use thiserror::Error;
use tracing::info;

const DEFAULT_DIALECT: &str = "mysql";
const DEFAULT_TIMEZONE: &str = "UTC";

/// Errors raised while loading the schema file.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read schema file {0}: {1}")]
    Io(PathBuf, io::Error),
    #[error("invalid schema document {0}: {1}")]
    Yaml(PathBuf, serde_yaml::Error),
}

/// On-disk schema document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDocument {
    #[serde(default = "default_dialect")]
    pub dialect: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub tables: Vec<TableSpec>,
    #[serde(default)]
    pub joins: Vec<JoinSpec>,
}

fn default_dialect() -> String {
    DEFAULT_DIALECT.to_string()
}

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}

impl Default for SchemaDocument {
    fn default() -> Self {
        Self {
            dialect: default_dialect(),
            timezone: default_timezone(),
            tables: Vec::new(),
            joins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Column name to free text. Anything other than a mapping is ignored.
    #[serde(default)]
    pub columns_description: Option<YamlValue>,
}

/// Documented join path between two `table.column` references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinSpec {
    #[serde(default)]
    pub left: Option<String>,
    #[serde(default)]
    pub right: Option<String>,
}

impl SchemaDocument {
    pub fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let mut document: SchemaDocument = serde_yaml::from_str(contents)?;
        document.dialect = document.dialect.to_lowercase();
        Ok(document)
    }

    /// Names of every table that declares one.
    pub fn table_names(&self) -> BTreeSet<String> {
        self.tables
            .iter()
            .filter_map(|table| table.name.clone())
            .filter(|name| !name.is_empty())
            .collect()
    }

    /// Compact text form of the schema placed into the model prompt.
    pub fn render_for_prompt(&self) -> String {
        let mut lines = vec![
            format!("dialect: {}", self.dialect),
            format!("timezone: {}", self.timezone),
            "tables:".to_string(),
        ];

        for table in &self.tables {
            let Some(name) = table.name.as_deref().filter(|name| !name.is_empty()) else {
                continue;
            };
            lines.push(format!("  - {}({})", name, table.columns.join(", ")));

            if let Some(description) = table.description.as_deref().filter(|d| !d.is_empty()) {
                lines.push(format!("    # {description}"));
            }

            if let Some(YamlValue::Mapping(columns)) = &table.columns_description {
                for (column, text) in columns {
                    let text = yaml_text(text).replace('\n', " ");
                    lines.push(format!("    # {}: {}", yaml_text(column), text));
                }
            }
        }

        let joins: Vec<(&str, &str)> = self
            .joins
            .iter()
            .filter_map(|join| Some((join.left.as_deref()?, join.right.as_deref()?)))
            .filter(|(left, right)| !left.is_empty() && !right.is_empty())
            .collect();
        if !joins.is_empty() {
            lines.push("joins:".to_string());
            for (left, right) in joins {
                lines.push(format!("  - {left} = {right}"));
            }
        }

        lines.join("\n")
    }
}

fn yaml_text(value: &YamlValue) -> String {
    match value {
        YamlValue::String(text) => text.clone(),
        YamlValue::Number(number) => number.to_string(),
        YamlValue::Bool(flag) => flag.to_string(),
        YamlValue::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|text| text.trim().to_string())
            .unwrap_or_default(),
    }
}

/// Immutable per-request view of the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogSnapshot {
    pub dialect: String,
    pub tables: BTreeSet<String>,
    pub prompt: String,
}

#[derive(Debug, Default)]
struct LoadedSchema {
    modified: Option<SystemTime>,
    document: SchemaDocument,
    tables: BTreeSet<String>,
}

/// Schema catalog bound to one YAML file.
#[derive(Debug)]
pub struct SchemaRegistry {
    path: PathBuf,
    state: RwLock<LoadedSchema>,
}

impl SchemaRegistry {
    /// Loads the catalog at `path`. A missing file leaves the catalog empty
    /// until it appears; unreadable or malformed files are errors.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SchemaError> {
        let registry = Self {
            path: path.into(),
            state: RwLock::new(LoadedSchema::default()),
        };
        registry.reload_if_changed(true)?;
        Ok(registry)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-reads the file when its modification time differs from the one
    /// last loaded (or unconditionally with `force`). Returns whether the
    /// catalog was replaced.
    pub fn reload_if_changed(&self, force: bool) -> Result<bool, SchemaError> {
        let modified = match fs::metadata(&self.path) {
            Ok(meta) => meta.modified().ok(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(SchemaError::Io(self.path.clone(), err)),
        };

        if !force && modified.is_some() && self.state.read().modified == modified {
            return Ok(false);
        }

        let contents =
            fs::read_to_string(&self.path).map_err(|err| SchemaError::Io(self.path.clone(), err))?;
        let document = SchemaDocument::parse(&contents)
            .map_err(|err| SchemaError::Yaml(self.path.clone(), err))?;
        let tables = document.table_names();

        info!(
            path = %self.path.display(),
            dialect = %document.dialect,
            tables = tables.len(),
            "schema catalog loaded"
        );

        *self.state.write() = LoadedSchema {
            modified,
            document,
            tables,
        };
        Ok(true)
    }

    pub fn dialect(&self) -> String {
        self.state.read().document.dialect.clone()
    }

    pub fn tables(&self) -> BTreeSet<String> {
        self.state.read().tables.clone()
    }

    /// Copies everything a compile request needs under a single read lock.
    pub fn snapshot(&self) -> CatalogSnapshot {
        let state = self.state.read();
        CatalogSnapshot {
            dialect: state.document.dialect.clone(),
            tables: state.tables.clone(),
            prompt: state.document.render_for_prompt(),
        }
    }
}
