//! Closed set of SQL grammars the validator knows how to parse.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlparser::dialect::{
    Dialect as ParserDialect, GenericDialect, MySqlDialect, PostgreSqlDialect,
};

/// SQL grammar used when parsing a candidate statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Postgres,
    MySql,
    Generic,
}

impl Dialect {
    /// Maps a free-form dialect tag (request field or schema file value).
    /// Unknown tags fall back to the dialect agnostic grammar.
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Dialect::Postgres,
            "mysql" => Dialect::MySql,
            _ => Dialect::Generic,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::MySql => "mysql",
            Dialect::Generic => "generic",
        }
    }

    pub(crate) fn parser_dialect(&self) -> Box<dyn ParserDialect> {
        match self {
            Dialect::Postgres => Box::new(PostgreSqlDialect {}),
            Dialect::MySql => Box::new(MySqlDialect {}),
            Dialect::Generic => Box::new(GenericDialect {}),
        }
    }
}

impl Default for Dialect {
    fn default() -> Self {
        Dialect::Generic
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_aliases_share_a_profile() {
        assert_eq!(Dialect::from_tag("postgres"), Dialect::Postgres);
        assert_eq!(Dialect::from_tag(" PostgreSQL "), Dialect::Postgres);
    }

    #[test]
    fn unknown_tags_are_generic() {
        assert_eq!(Dialect::from_tag("MySQL"), Dialect::MySql);
        assert_eq!(Dialect::from_tag("sqlite"), Dialect::Generic);
        assert_eq!(Dialect::from_tag(""), Dialect::Generic);
    }
}
