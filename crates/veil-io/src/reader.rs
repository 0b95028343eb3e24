// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The closed reader union engines consume.

use veil_types::{DataResourceType, PpcError};

use crate::batch::{DataBatch, DataSchema};
use crate::file::FileLineReader;
use crate::hdfs::HdfsLineReader;
use crate::sql::SqlResultReader;

/// A line reader over one of the three supported backends.
#[derive(Debug)]
pub enum LineReader {
    File(FileLineReader),
    Hdfs(HdfsLineReader),
    Sql(SqlResultReader),
}

impl LineReader {
    /// Decode up to `size` rows (`-1` = all remaining; required for SQL).
    /// `None` once the source is exhausted.
    pub fn next(&mut self, size: i64, schema: DataSchema) -> Result<Option<DataBatch>, PpcError> {
        match self {
            LineReader::File(reader) => reader.next(size, schema),
            LineReader::Hdfs(reader) => reader.next(size, schema),
            LineReader::Sql(reader) => reader.next(size, schema),
        }
    }

    /// The full underlying bytes without line splitting.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, PpcError> {
        match self {
            LineReader::File(reader) => reader.read_bytes(),
            LineReader::Hdfs(reader) => reader.read_bytes(),
            LineReader::Sql(_) => Err(PpcError::UnsupportedDataResource(
                "sql sources do not support raw byte reads".into(),
            )),
        }
    }

    /// Source length in bytes (files) or buffered batches (SQL).
    pub fn capacity(&self) -> u64 {
        match self {
            LineReader::File(reader) => reader.capacity(),
            LineReader::Hdfs(reader) => reader.capacity(),
            LineReader::Sql(reader) => reader.capacity(),
        }
    }

    pub fn column_size(&self) -> u64 {
        match self {
            LineReader::File(_) | LineReader::Hdfs(_) => 1,
            LineReader::Sql(reader) => reader.column_size(),
        }
    }

    pub fn resource_type(&self) -> DataResourceType {
        match self {
            LineReader::File(_) => DataResourceType::File,
            LineReader::Hdfs(_) => DataResourceType::Hdfs,
            LineReader::Sql(_) => DataResourceType::Sql,
        }
    }

    /// SQL sources buffer the whole result set, so they are read in one
    /// `next(-1)` call and the task is finished after the first batch.
    pub fn is_one_shot(&self) -> bool {
        matches!(self, LineReader::Sql(_))
    }

    /// Release backend resources early. Dropping does the same.
    pub fn clean(&mut self) {}
}
