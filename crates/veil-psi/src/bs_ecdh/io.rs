// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! File plumbing of one browser-assisted task: the input reader plus three
//! append-only sinks — result, partner index, and the evidence log that
//! lets an external auditor replay the run.

use tracing::info;
use veil_io::{DataBatch, DataResourceLoader, DataSchema, LineReader, LineWriter};
use veil_types::{DataResource, FileInfo, PpcError};

use super::messages::{EVIDENCE_FILE_SUFFIX, INDEX_FILE_SUFFIX};

pub struct BsEcdhIo {
    task_id: String,
    reader: std::sync::Mutex<Option<LineReader>>,
    result_writer: std::sync::Mutex<Option<LineWriter>>,
    index_writer: std::sync::Mutex<Option<LineWriter>>,
    evidence_writer: std::sync::Mutex<Option<LineWriter>>,
}

impl BsEcdhIo {
    /// Open the reader and all writers up front so path problems surface
    /// before any cipher work is spent.
    pub async fn prepare(
        task_id: &str,
        loader: &DataResourceLoader,
        resource: &DataResource,
        enable_audit: bool,
        enable_output_exists: bool,
    ) -> Result<Self, PpcError> {
        info!(task = task_id, "preparing io for browser-assisted task");
        let input = resource
            .desc
            .as_ref()
            .ok_or(PpcError::NotSpecifyInputDataResource)?;
        let output = resource
            .output_desc
            .as_ref()
            .ok_or(PpcError::NotSpecifyOutputDataResource)?;

        let reader = loader.load_reader(input, DataSchema::String).await?;

        let result_writer = loader.load_writer(output, enable_output_exists)?;
        let mut index_desc = output.clone();
        index_desc.path = format!("{}{INDEX_FILE_SUFFIX}", output.path);
        let index_writer = loader.load_writer(&index_desc, enable_output_exists)?;
        let evidence_writer = if enable_audit {
            let mut evidence_desc = output.clone();
            evidence_desc.path = format!("{}{EVIDENCE_FILE_SUFFIX}", output.path);
            Some(loader.load_writer(&evidence_desc, enable_output_exists)?)
        } else {
            None
        };

        Ok(BsEcdhIo {
            task_id: task_id.to_string(),
            reader: std::sync::Mutex::new(Some(reader)),
            result_writer: std::sync::Mutex::new(Some(result_writer)),
            index_writer: std::sync::Mutex::new(Some(index_writer)),
            evidence_writer: std::sync::Mutex::new(evidence_writer),
        })
    }

    /// Load the whole input; browser-assisted runs never batch.
    pub fn load_inputs(&self) -> Result<DataBatch, PpcError> {
        let mut guard = self.reader.lock().unwrap();
        let reader = guard
            .as_mut()
            .ok_or_else(|| PpcError::LoadDataFailed("input reader is gone".into()))?;
        let batch = reader
            .next(-1, DataSchema::String)?
            .unwrap_or_else(|| DataBatch::new(DataSchema::String));
        info!(task = %self.task_id, inputs = batch.len(), "inputs loaded");
        Ok(batch)
    }

    pub fn append_evidence(&self, tag: &str, value: &str) -> Result<(), PpcError> {
        self.append_evidences(tag, std::slice::from_ref(&value.to_string()))
    }

    /// One tag line followed by the payload lines.
    pub fn append_evidences(&self, tag: &str, values: &[String]) -> Result<(), PpcError> {
        let mut guard = self.evidence_writer.lock().unwrap();
        let Some(writer) = guard.as_mut() else {
            return Ok(());
        };
        info!(task = %self.task_id, tag, lines = values.len(), "appending evidence");
        let mut batch = DataBatch::from_strings([tag]);
        writer.write_line(&batch, DataSchema::String, "\n")?;
        batch = DataBatch::from_strings(values.iter().cloned());
        writer.write_line(&batch, DataSchema::String, "\n")?;
        writer.flush()
    }

    pub fn save_results(&self, results: &[String]) -> Result<Option<FileInfo>, PpcError> {
        info!(task = %self.task_id, rows = results.len(), "saving results");
        let mut guard = self.result_writer.lock().unwrap();
        let writer = guard
            .as_mut()
            .ok_or_else(|| PpcError::OpenFileLineWriter("result writer is gone".into()))?;
        let batch = DataBatch::from_strings(results.iter().cloned());
        writer.write_line(&batch, DataSchema::String, "\n")?;
        writer.flush()?;
        writer.upload()?;
        Ok(writer.file_info())
    }

    pub fn save_indexes(&self, indexes: &[String]) -> Result<Option<FileInfo>, PpcError> {
        info!(task = %self.task_id, rows = indexes.len(), "saving partner indexes");
        let mut guard = self.index_writer.lock().unwrap();
        let writer = guard
            .as_mut()
            .ok_or_else(|| PpcError::OpenFileLineWriter("index writer is gone".into()))?;
        let batch = DataBatch::from_strings(indexes.iter().cloned());
        writer.write_line(&batch, DataSchema::String, "\n")?;
        writer.flush()?;
        writer.upload()?;
        Ok(writer.file_info())
    }

    pub fn upload_evidence(&self) -> Result<Option<FileInfo>, PpcError> {
        let mut guard = self.evidence_writer.lock().unwrap();
        let Some(writer) = guard.as_mut() else {
            return Ok(None);
        };
        writer.flush()?;
        writer.upload()?;
        Ok(writer.file_info())
    }

    pub fn clean(&self) {
        if let Some(reader) = self.reader.lock().unwrap().as_mut() {
            reader.clean();
        }
        for slot in [&self.result_writer, &self.index_writer, &self.evidence_writer] {
            if let Some(writer) = slot.lock().unwrap().as_mut() {
                writer.clean();
            }
        }
    }
}
