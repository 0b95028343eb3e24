// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! SQL-backed data resources.
//!
//! The database is an opaque capability behind [`SqlStorage`]: execute the
//! desc's access command, get back a fully buffered [`QueryResult`]. The
//! reader then serves that buffer batch-by-batch — SQL sources are always
//! read in one shot, there is no streaming cursor.

use async_trait::async_trait;
use veil_types::{PpcError, SqlConnectionOption};

use crate::batch::{DataBatch, DataSchema};

/// A fully buffered query result: one `DataBatch` per column (column-wise)
/// or per row (row-wise).
#[derive(Debug, Default)]
pub struct QueryResult {
    pub column_names: Vec<String>,
    pub batches: Vec<DataBatch>,
}

/// The opaque SQL capability.
#[async_trait]
pub trait SqlStorage: Send + Sync {
    /// Execute `command` against the connection described by `option` and
    /// buffer the full result set column-wise.
    async fn execute(
        &self,
        option: &SqlConnectionOption,
        command: &str,
    ) -> Result<QueryResult, PpcError>;
}

/// Serves a buffered query result as line batches.
#[derive(Debug)]
pub struct SqlResultReader {
    batches: Vec<DataBatch>,
    cursor: usize,
    parse_by_column: bool,
}

impl SqlResultReader {
    pub fn new(result: QueryResult, parse_by_column: bool) -> Self {
        SqlResultReader {
            batches: result.batches,
            cursor: 0,
            parse_by_column,
        }
    }

    /// Return the next buffered batch. The size parameter is ignored — SQL
    /// results are pre-buffered, so every batch is an "all remaining" read.
    pub fn next(&mut self, _size: i64, _schema: DataSchema) -> Result<Option<DataBatch>, PpcError> {
        if self.cursor >= self.batches.len() {
            return Ok(None);
        }
        let batch = std::mem::replace(
            &mut self.batches[self.cursor],
            DataBatch::new(DataSchema::Bytes),
        );
        self.cursor += 1;
        Ok(Some(batch))
    }

    pub fn capacity(&self) -> u64 {
        self.batches.len() as u64
    }

    pub fn column_size(&self) -> u64 {
        if self.parse_by_column {
            self.batches.len() as u64
        } else {
            1
        }
    }
}

// ── In-memory storage ─────────────────────────────────────────────────────────

/// An in-process SQL double serving canned results, keyed by command.
#[derive(Default)]
pub struct MemorySqlStorage {
    results: std::sync::Mutex<std::collections::HashMap<String, Vec<Vec<String>>>>,
}

impl MemorySqlStorage {
    pub fn insert(&self, command: &str, columns: Vec<Vec<String>>) {
        self.results
            .lock()
            .unwrap()
            .insert(command.to_string(), columns);
    }
}

#[async_trait]
impl SqlStorage for MemorySqlStorage {
    async fn execute(
        &self,
        _option: &SqlConnectionOption,
        command: &str,
    ) -> Result<QueryResult, PpcError> {
        let columns = self
            .results
            .lock()
            .unwrap()
            .get(command)
            .cloned()
            .ok_or_else(|| PpcError::LoadDataFailed(format!("no result for `{command}`")))?;
        Ok(QueryResult {
            column_names: (0..columns.len()).map(|i| format!("col{i}")).collect(),
            batches: columns
                .into_iter()
                .map(DataBatch::from_strings)
                .collect(),
        })
    }
}

// ── MySQL storage (feature = "mysql") ─────────────────────────────────────────

#[cfg(feature = "mysql")]
pub use mysql::MysqlStorage;

#[cfg(feature = "mysql")]
mod mysql {
    use super::*;
    use crate::batch::DataValue;
    use sqlx::mysql::MySqlPoolOptions;
    use sqlx::{Column, Row};

    /// Buffers result sets from a MySQL server via sqlx.
    #[derive(Default)]
    pub struct MysqlStorage;

    #[async_trait]
    impl SqlStorage for MysqlStorage {
        async fn execute(
            &self,
            option: &SqlConnectionOption,
            command: &str,
        ) -> Result<QueryResult, PpcError> {
            let url = format!(
                "mysql://{}:{}@{}:{}/{}",
                option.user, option.password, option.host, option.port, option.database
            );
            let pool = MySqlPoolOptions::new()
                .max_connections(1)
                .connect(&url)
                .await
                .map_err(|e| PpcError::LoadDataFailed(e.to_string()))?;
            let rows = sqlx::query(command)
                .fetch_all(&pool)
                .await
                .map_err(|e| PpcError::LoadDataFailed(e.to_string()))?;

            let mut result = QueryResult::default();
            let Some(first) = rows.first() else {
                return Ok(result);
            };
            for column in first.columns() {
                result.column_names.push(column.name().to_string());
                result.batches.push(DataBatch::new(DataSchema::Bytes));
            }
            for row in &rows {
                for (index, batch) in result.batches.iter_mut().enumerate() {
                    let value: Vec<u8> = row
                        .try_get::<String, _>(index)
                        .map(String::into_bytes)
                        .or_else(|_| row.try_get::<Vec<u8>, _>(index))
                        .map_err(|e| PpcError::LoadDataFailed(e.to_string()))?;
                    batch.append(DataValue::Bytes(value));
                }
            }
            Ok(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_storage_serves_columns() {
        let storage = MemorySqlStorage::default();
        storage.insert(
            "select id from users",
            vec![vec!["alice".into(), "bob".into()]],
        );
        let result = storage
            .execute(&SqlConnectionOption::default(), "select id from users")
            .await
            .unwrap();
        let mut reader = SqlResultReader::new(result, true);
        assert_eq!(reader.column_size(), 1);
        let batch = reader.next(-1, DataSchema::String).unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.as_str(1), Some("bob"));
        assert!(reader.next(-1, DataSchema::String).unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_command_is_a_load_failure() {
        let storage = MemorySqlStorage::default();
        let err = storage
            .execute(&SqlConnectionOption::default(), "select 1")
            .await
            .unwrap_err();
        assert!(matches!(err, PpcError::LoadDataFailed(_)));
    }
}
