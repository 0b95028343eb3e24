// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Resolves `DataResourceDesc`s to readers and writers.

use std::sync::Arc;

use tracing::info;
use veil_types::{DataResourceDesc, DataResourceType, PpcError};

use crate::batch::DataSchema;
use crate::file::{FileLineReader, FileLineWriter};
use crate::hdfs::{HdfsClient, HdfsLineReader, HdfsLineWriter, DEFAULT_HDFS_BUFFER_SIZE};
use crate::reader::LineReader;
use crate::sql::{SqlResultReader, SqlStorage};
use crate::writer::LineWriter;

/// Loads readers/writers for the backends configured on this node. Backends
/// that were not configured reject their resource type with
/// `UnsupportedDataResource`.
pub struct DataResourceLoader {
    hdfs: Option<Arc<dyn HdfsClient>>,
    sql: Option<Arc<dyn SqlStorage>>,
    /// 0 = the file reader's default.
    mmap_granularity: u64,
    hdfs_buffer_size: u64,
    line_splitter: u8,
}

impl DataResourceLoader {
    pub fn new(hdfs: Option<Arc<dyn HdfsClient>>, sql: Option<Arc<dyn SqlStorage>>) -> Self {
        DataResourceLoader {
            hdfs,
            sql,
            mmap_granularity: 0,
            hdfs_buffer_size: DEFAULT_HDFS_BUFFER_SIZE,
            line_splitter: b'\n',
        }
    }

    pub fn with_mmap_granularity(mut self, granularity: u64) -> Self {
        self.mmap_granularity = granularity;
        self
    }

    pub fn with_hdfs_buffer_size(mut self, buffer_size: u64) -> Self {
        self.hdfs_buffer_size = buffer_size;
        self
    }

    pub async fn load_reader(
        &self,
        desc: &DataResourceDesc,
        _schema: DataSchema,
    ) -> Result<LineReader, PpcError> {
        match desc.resource_type {
            DataResourceType::File => Ok(LineReader::File(FileLineReader::open(
                &desc.path,
                self.mmap_granularity,
                self.line_splitter,
            )?)),
            DataResourceType::Hdfs => {
                let client = self.hdfs.clone().ok_or_else(|| {
                    PpcError::UnsupportedDataResource("no hdfs backend configured".into())
                })?;
                Ok(LineReader::Hdfs(HdfsLineReader::open(
                    client,
                    &desc.path,
                    self.hdfs_buffer_size,
                    self.line_splitter,
                )?))
            }
            DataResourceType::Sql => {
                let storage = self.sql.clone().ok_or_else(|| {
                    PpcError::UnsupportedDataResource("no sql backend configured".into())
                })?;
                let option = desc.sql_option.clone().ok_or_else(|| {
                    PpcError::InvalidParam("sql resource without connection option".into())
                })?;
                let result = storage.execute(&option, &desc.access_command).await?;
                info!(command = %desc.access_command, columns = result.batches.len(),
                      "buffered sql result");
                Ok(LineReader::Sql(SqlResultReader::new(result, true)))
            }
        }
    }

    pub fn load_writer(
        &self,
        desc: &DataResourceDesc,
        truncate: bool,
    ) -> Result<LineWriter, PpcError> {
        match desc.resource_type {
            DataResourceType::File => Ok(LineWriter::File(FileLineWriter::create(
                &desc.path, truncate,
            )?)),
            DataResourceType::Hdfs => {
                let client = self.hdfs.clone().ok_or_else(|| {
                    PpcError::UnsupportedDataResource("no hdfs backend configured".into())
                })?;
                Ok(LineWriter::Hdfs(HdfsLineWriter::create(
                    client, &desc.path, truncate,
                )?))
            }
            DataResourceType::Sql => Err(PpcError::UnsupportedDataResource(
                "sql resources cannot be written".into(),
            )),
        }
    }

    /// Reject an output desc whose target already exists. Callers that did
    /// not opt into overwriting run this before any writer is created.
    pub fn ensure_output_absent(&self, desc: &DataResourceDesc) -> Result<(), PpcError> {
        let exists = match desc.resource_type {
            DataResourceType::File => std::path::Path::new(&desc.path).exists(),
            DataResourceType::Hdfs => match &self.hdfs {
                Some(client) => client.exists(&desc.path)?,
                None => false,
            },
            DataResourceType::Sql => false,
        };
        if exists {
            return Err(PpcError::OpenFileLineWriter(format!(
                "output {} already exists",
                desc.path
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hdfs::MemoryHdfs;
    use crate::sql::MemorySqlStorage;
    use veil_types::SqlConnectionOption;

    #[tokio::test]
    async fn dispatches_by_resource_type() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("in.csv");
        std::fs::write(&file_path, "a\nb\n").unwrap();

        let hdfs = Arc::new(MemoryHdfs::new(vec!["dn1".into()], 1024));
        hdfs.insert("/remote/in.csv", b"c\nd\n".to_vec());
        let sql = Arc::new(MemorySqlStorage::default());
        sql.insert("select x", vec![vec!["e".into(), "f".into()]]);

        let loader = DataResourceLoader::new(Some(hdfs), Some(sql));

        let mut desc = DataResourceDesc::file(file_path.display().to_string());
        let mut reader = loader.load_reader(&desc, DataSchema::Bytes).await.unwrap();
        assert_eq!(reader.next(-1, DataSchema::Bytes).unwrap().unwrap().len(), 2);

        desc = DataResourceDesc {
            resource_type: DataResourceType::Hdfs,
            path: "/remote/in.csv".into(),
            ..Default::default()
        };
        reader = loader.load_reader(&desc, DataSchema::Bytes).await.unwrap();
        assert!(reader.is_one_shot() == false);
        assert_eq!(reader.next(-1, DataSchema::Bytes).unwrap().unwrap().len(), 2);

        desc = DataResourceDesc {
            resource_type: DataResourceType::Sql,
            access_command: "select x".into(),
            sql_option: Some(SqlConnectionOption::default()),
            ..Default::default()
        };
        reader = loader.load_reader(&desc, DataSchema::String).await.unwrap();
        assert!(reader.is_one_shot());
        assert_eq!(reader.column_size(), 1);
    }

    #[tokio::test]
    async fn unconfigured_backend_is_rejected() {
        let loader = DataResourceLoader::new(None, None);
        let desc = DataResourceDesc {
            resource_type: DataResourceType::Hdfs,
            path: "/remote/in.csv".into(),
            ..Default::default()
        };
        let err = loader.load_reader(&desc, DataSchema::Bytes).await.unwrap_err();
        assert!(matches!(err, PpcError::UnsupportedDataResource(_)));
    }

    #[tokio::test]
    async fn existing_output_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.csv");
        std::fs::write(&out, "old").unwrap();
        let loader = DataResourceLoader::new(None, None);
        let desc = DataResourceDesc::file(out.display().to_string());
        assert!(loader.ensure_output_absent(&desc).is_err());
        assert!(loader.load_writer(&desc, false).is_err());
        assert!(loader.load_writer(&desc, true).is_ok());
    }
}
