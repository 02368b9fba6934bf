//! Table and column identifiers for the client record table.
//!
//! The table name and schema qualifier are runtime configuration, so the
//! table is addressed through sea-query aliases rather than a diesel `table!`.

use sea_query::{Alias, Iden, IntoTableRef, TableRef};

use super::pool::DbPool;
use crate::store::{StoreError, StoreResult};

/// Default schema qualifier.
pub const DEFAULT_SCHEMA: &str = "dbo";
/// Default table name.
pub const DEFAULT_TABLE: &str = "brute";

/// Longest identifier accepted (PostgreSQL's limit).
const MAX_IDENTIFIER_LEN: usize = 63;

/// Columns of the client record table.
#[derive(Iden, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientColumn {
    Id,
    Count,
    FirstRequest,
    LastRequest,
    Expires,
}

impl ClientColumn {
    /// All columns, in select order.
    pub const ALL: [ClientColumn; 5] = [
        ClientColumn::Id,
        ClientColumn::Count,
        ClientColumn::FirstRequest,
        ClientColumn::LastRequest,
        ClientColumn::Expires,
    ];

    /// Column name in storage.
    pub const fn storage_name(self) -> &'static str {
        match self {
            ClientColumn::Id => "id",
            ClientColumn::Count => "count",
            ClientColumn::FirstRequest => "first_request",
            ClientColumn::LastRequest => "last_request",
            ClientColumn::Expires => "expires",
        }
    }

    /// Field name in the public record shape.
    pub const fn public_name(self) -> &'static str {
        match self {
            ClientColumn::Id => "id",
            ClientColumn::Count => "count",
            ClientColumn::FirstRequest => "firstRequest",
            ClientColumn::LastRequest => "lastRequest",
            ClientColumn::Expires => "expires",
        }
    }
}

/// Check that a table or schema name is a plain SQL identifier.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= MAX_IDENTIFIER_LEN
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Location of the client record table: name plus optional schema qualifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientTable {
    schema: Option<String>,
    name: String,
}

impl Default for ClientTable {
    fn default() -> Self {
        Self {
            schema: Some(DEFAULT_SCHEMA.to_string()),
            name: DEFAULT_TABLE.to_string(),
        }
    }
}

impl ClientTable {
    /// Create a table location, validating both identifiers.
    pub fn new(schema: Option<&str>, name: &str) -> StoreResult<Self> {
        if !is_valid_identifier(name) {
            return Err(StoreError::Config(format!("Invalid table name: '{}'", name)));
        }
        if let Some(schema) = schema {
            if !is_valid_identifier(schema) {
                return Err(StoreError::Config(format!(
                    "Invalid schema name: '{}'",
                    schema
                )));
            }
        }
        Ok(Self {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Schema qualifier as used by the given backend.
    ///
    /// A SQLite file is a single namespace, so the qualifier is dropped there.
    pub fn effective_schema(&self, pool: &DbPool) -> Option<&str> {
        if pool.is_sqlite() {
            None
        } else {
            self.schema()
        }
    }

    /// Table reference for sea-query statements.
    pub fn table_ref(&self, pool: &DbPool) -> TableRef {
        match self.effective_schema(pool) {
            Some(schema) => (Alias::new(schema), Alias::new(&self.name)).into_table_ref(),
            None => Alias::new(&self.name).into_table_ref(),
        }
    }

    /// Name of the index over `expires`.
    pub fn expires_index(&self) -> String {
        format!("idx_{}_expires", self.name)
    }

    /// Dotted name for logs.
    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.name),
            None => self.name.clone(),
        }
    }
}
