use once_cell::sync::Lazy;
use regex::Regex;
use sea_orm::DbBackend;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{WriterError, WriterResult};

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("identifier regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    SqlServer,
    Postgres,
    MySql,
    Sqlite,
}

/// Upsert strategy shared by the members of a dialect family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialectFamily {
    /// `MERGE ... OUTPUT $action`
    Merge,
    /// `INSERT ... ON CONFLICT`
    OnConflict,
    /// `INSERT ... ON DUPLICATE KEY UPDATE`
    DuplicateKey,
}

impl Dialect {
    pub fn family(&self) -> DialectFamily {
        match self {
            Dialect::SqlServer => DialectFamily::Merge,
            Dialect::Postgres | Dialect::Sqlite => DialectFamily::OnConflict,
            Dialect::MySql => DialectFamily::DuplicateKey,
        }
    }

    pub fn from_backend(backend: DbBackend) -> Self {
        match backend {
            DbBackend::Postgres => Dialect::Postgres,
            DbBackend::MySql => Dialect::MySql,
            DbBackend::Sqlite => Dialect::Sqlite,
        }
    }

    /// Quotes a validated identifier; schema-qualified names are quoted per part.
    pub fn quote(&self, identifier: &str) -> WriterResult<String> {
        validate_identifier(identifier)?;
        Ok(identifier
            .split('.')
            .map(|part| match self {
                Dialect::SqlServer => format!("[{}]", part),
                Dialect::MySql => format!("`{}`", part),
                Dialect::Postgres | Dialect::Sqlite => format!("\"{}\"", part),
            })
            .collect::<Vec<_>>()
            .join("."))
    }

    /// Bind placeholder for the 1-based parameter `index`.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", index),
            Dialect::SqlServer => format!("@P{}", index),
            Dialect::MySql | Dialect::Sqlite => "?".to_string(),
        }
    }

    /// Text type used when casting keys for comparison.
    pub fn text_type(&self) -> &'static str {
        match self {
            Dialect::SqlServer => "NVARCHAR(MAX)",
            Dialect::MySql => "CHAR",
            Dialect::Postgres | Dialect::Sqlite => "TEXT",
        }
    }

    /// `CAST(col AS text)` for a quoted column.
    pub fn cast_to_text(&self, quoted: &str) -> String {
        format!("CAST({} AS {})", quoted, self.text_type())
    }

    pub fn supports_native_json(&self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Dialect::SqlServer => "sqlserver",
            Dialect::Postgres => "postgres",
            Dialect::MySql => "mysql",
            Dialect::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Dialect {
    type Err = WriterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlserver" | "mssql" => Ok(Dialect::SqlServer),
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "mysql" | "mariadb" => Ok(Dialect::MySql),
            "sqlite" => Ok(Dialect::Sqlite),
            other => Err(WriterError::UnsupportedDialect(other.to_string())),
        }
    }
}

pub fn validate_identifier(identifier: &str) -> WriterResult<()> {
    if IDENTIFIER.is_match(identifier) {
        Ok(())
    } else {
        Err(WriterError::InvalidIdentifier(identifier.to_string()))
    }
}
