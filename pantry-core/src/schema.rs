//! Local relational schema.
//!
//! The store only needs to know which tables and columns exist, so it can
//! refuse records from a peer running a different schema.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::change::{ChangeRecord, Column};

/// A record references a schema object that does not exist locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictResolutionError {
    UnknownTable { table: String },
    UnknownColumn { table: String, column: String },
}

impl std::fmt::Display for ConflictResolutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownTable { table } => write!(f, "Schema mismatch: unknown table {table}"),
            Self::UnknownColumn { table, column } => {
                write!(f, "Schema mismatch: unknown column {table}.{column}")
            }
        }
    }
}

impl std::error::Error for ConflictResolutionError {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    tables: BTreeMap<String, BTreeSet<String>>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style table registration.
    pub fn table<I, S>(mut self, name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_table(name, columns);
        self
    }

    pub fn add_table<I, S>(&mut self, name: impl Into<String>, columns: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cols = columns.into_iter().map(Into::into).collect();
        self.tables.insert(name.into(), cols);
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn columns(&self, table: &str) -> Option<impl Iterator<Item = &str>> {
        self.tables.get(table).map(|cols| cols.iter().map(String::as_str))
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Check that the table and column of `record` exist.
    pub fn validate(&self, record: &ChangeRecord) -> Result<(), ConflictResolutionError> {
        self.check(&record.table, &record.column)
    }

    pub fn check(&self, table: &str, column: &Column) -> Result<(), ConflictResolutionError> {
        let cols = self
            .tables
            .get(table)
            .ok_or_else(|| ConflictResolutionError::UnknownTable {
                table: table.to_string(),
            })?;
        match column {
            Column::Row => Ok(()),
            Column::Named(name) if cols.contains(name) => Ok(()),
            Column::Named(name) => Err(ConflictResolutionError::UnknownColumn {
                table: table.to_string(),
                column: name.clone(),
            }),
        }
    }
}
