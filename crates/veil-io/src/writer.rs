// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The closed writer union engines emit results through.

use veil_types::{DataResourceType, FileInfo, PpcError};

use crate::batch::{DataBatch, DataSchema};
use crate::file::FileLineWriter;
use crate::hdfs::HdfsLineWriter;

/// A line writer over one of the supported output backends.
pub enum LineWriter {
    File(FileLineWriter),
    Hdfs(HdfsLineWriter),
}

impl LineWriter {
    /// Serialize every element of `batch` followed by `splitter`. The
    /// schema argument must match the batch's own schema.
    pub fn write_line(
        &mut self,
        batch: &DataBatch,
        schema: DataSchema,
        splitter: &str,
    ) -> Result<(), PpcError> {
        if batch.schema() != schema {
            return Err(PpcError::UnsupportedDataSchema);
        }
        match self {
            LineWriter::File(writer) => writer.write_line(batch, splitter),
            LineWriter::Hdfs(writer) => writer.write_line(batch, splitter),
        }
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), PpcError> {
        match self {
            LineWriter::File(writer) => writer.write_bytes(data),
            LineWriter::Hdfs(writer) => writer.write_bytes(data),
        }
    }

    pub fn flush(&mut self) -> Result<(), PpcError> {
        match self {
            LineWriter::File(writer) => writer.flush(),
            LineWriter::Hdfs(writer) => writer.flush(),
        }
    }

    pub fn close(&mut self) -> Result<(), PpcError> {
        match self {
            LineWriter::File(writer) => writer.close(),
            LineWriter::Hdfs(writer) => writer.close(),
        }
    }

    /// Publish the finished output (remote backends) and record `FileInfo`.
    pub fn upload(&mut self) -> Result<(), PpcError> {
        match self {
            LineWriter::File(writer) => writer.upload(),
            LineWriter::Hdfs(writer) => writer.upload(),
        }
    }

    pub fn file_info(&self) -> Option<FileInfo> {
        match self {
            LineWriter::File(writer) => writer.file_info().cloned(),
            LineWriter::Hdfs(writer) => writer.file_info().cloned(),
        }
    }

    pub fn resource_type(&self) -> DataResourceType {
        match self {
            LineWriter::File(_) => DataResourceType::File,
            LineWriter::Hdfs(_) => DataResourceType::Hdfs,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            LineWriter::File(writer) => writer.path(),
            LineWriter::Hdfs(writer) => writer.path(),
        }
    }

    /// Release backend resources early. Dropping does the same.
    pub fn clean(&mut self) {}
}
