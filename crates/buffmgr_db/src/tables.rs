//! Configurable table naming.
//!
//! Table names come from configuration, so they are validated as plain SQL
//! identifiers before being interpolated into statements.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};

/// A table reference with an optional schema (attached database) qualifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawTableRef")]
pub struct TableRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub table: String,
}

/// Accepted on input: either `{schema, table}` or `"schema.table"` / `"table"`.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawTableRef {
    Flat(String),
    Object {
        #[serde(default)]
        schema: Option<String>,
        table: String,
    },
}

impl From<RawTableRef> for TableRef {
    fn from(raw: RawTableRef) -> Self {
        match raw {
            RawTableRef::Flat(name) => TableRef::parse(&name),
            RawTableRef::Object { schema, table } => TableRef {
                schema: schema.filter(|s| !s.is_empty()),
                table,
            },
        }
    }
}

impl TableRef {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            schema: None,
            table: table.into(),
        }
    }

    pub fn in_schema(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            table: table.into(),
        }
    }

    /// Split a flat `"schema.table"` or `"table"` name.
    pub fn parse(name: &str) -> Self {
        match name.trim().split_once('.') {
            Some((schema, table)) if !schema.is_empty() => Self::in_schema(schema, table),
            Some((_, table)) => Self::new(table),
            None => Self::new(name.trim()),
        }
    }

    /// Name usable in FROM/INSERT/CREATE TABLE.
    pub fn qualified(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.table),
            None => self.table.clone(),
        }
    }

    /// Unqualified name; SQLite requires this form in REFERENCES and CREATE INDEX ... ON.
    pub fn bare(&self) -> &str {
        &self.table
    }

    /// Index name carrying the schema prefix SQLite expects in CREATE INDEX.
    pub fn index_name(&self, suffix: &str) -> String {
        match &self.schema {
            Some(schema) => format!("{}.idx_{}_{}", schema, self.table, suffix),
            None => format!("idx_{}_{}", self.table, suffix),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(schema) = &self.schema {
            validate_identifier(schema)?;
        }
        validate_identifier(&self.table)
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.qualified())
    }
}

/// Names of the two tables backing the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableNames {
    #[serde(default = "default_file_table")]
    pub file: TableRef,
    #[serde(default = "default_event_table")]
    pub event: TableRef,
}

fn default_file_table() -> TableRef {
    TableRef::new("files")
}

fn default_event_table() -> TableRef {
    TableRef::new("file_events")
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            file: default_file_table(),
            event: default_event_table(),
        }
    }
}

impl TableNames {
    pub fn validate(&self) -> Result<()> {
        self.file.validate()?;
        self.event.validate()?;
        if self.file.schema != self.event.schema {
            return Err(StoreError::invalid_config(format!(
                "file table '{}' and event table '{}' must live in the same schema",
                self.file, self.event
            )));
        }
        if self.file.table == self.event.table {
            return Err(StoreError::invalid_config(format!(
                "file and event tables must differ (both '{}')",
                self.file.table
            )));
        }
        Ok(())
    }
}

fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(StoreError::invalid_config(format!(
            "invalid table identifier: '{}'",
            name
        )))
    }
}
