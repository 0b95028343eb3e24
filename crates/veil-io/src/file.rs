// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Local-file line I/O: a windowed mmap reader and a buffered writer.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use memmap2::MmapOptions;
use tracing::debug;
use veil_types::{FileInfo, PpcError};

use crate::batch::{DataBatch, DataSchema};
use crate::parser::{BlockData, BlockLineReader, BlockParser, BlockSource};

/// Sentinel granularity selecting the built-in mmap window of
/// 500 * 1024 pages (≈2 GiB on 4 KiB pages).
pub const DEFAULT_MMAP_GRANULARITY: u64 = 0;

fn page_size() -> u64 {
    // SAFETY: sysconf with a valid name has no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}

// ── Reader ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct FileBlocks {
    file: File,
    length: u64,
    mmap_granularity: u64,
}

impl BlockSource for FileBlocks {
    fn next_block(&mut self, offset: u64) -> Result<Option<BlockParser>, PpcError> {
        if offset >= self.length {
            return Ok(None);
        }
        // Windows are only allocated once the previous one is fully consumed,
        // so `offset` is always a multiple of the granularity here — which
        // keeps the mmap offset page-aligned.
        let len = std::cmp::min(self.mmap_granularity, self.length - offset);
        // SAFETY: the file is opened read-only and lives as long as the map.
        let map = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(len as usize)
                .map(&self.file)
                .map_err(|e| PpcError::MmapFailed(e.to_string()))?
        };
        debug!(offset, len, "mapped file window");
        Ok(Some(BlockParser::new(BlockData::Mapped(map))))
    }
}

/// Streams a local file as line batches through fixed-size mmap windows.
///
/// The same file must not be written while a reader is open on it.
#[derive(Debug)]
pub struct FileLineReader {
    inner: BlockLineReader<FileBlocks>,
    path: String,
}

impl FileLineReader {
    /// Open `path` with the given window size. `granularity` of 0 selects
    /// the default (500 * 1024 pages); any other value must be a multiple of
    /// the system page size.
    pub fn open(
        path: impl AsRef<Path>,
        granularity: u64,
        splitter: u8,
    ) -> Result<Self, PpcError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let page = page_size();
        let granularity = if granularity == DEFAULT_MMAP_GRANULARITY {
            500 * 1024 * page
        } else {
            granularity
        };
        if granularity % page != 0 {
            return Err(PpcError::InvalidMmapGranularity(format!(
                "{granularity} is not a multiple of the page size {page}"
            )));
        }
        if !path_ref.exists() {
            return Err(PpcError::OpenFileFailed(format!("{path_display} not exist")));
        }
        if path_ref.is_dir() {
            return Err(PpcError::OpenFileFailed(format!(
                "{path_display} is a directory, only file content can be loaded"
            )));
        }
        let file = File::open(path_ref)
            .map_err(|e| PpcError::OpenFileFailed(format!("{path_display}: {e}")))?;
        let length = file
            .metadata()
            .map_err(|e| PpcError::OpenFileFailed(format!("{path_display}: {e}")))?
            .len();
        debug!(path = %path_display, length, granularity, "opened file reader");
        Ok(FileLineReader {
            inner: BlockLineReader::new(
                FileBlocks {
                    file,
                    length,
                    mmap_granularity: granularity,
                },
                length,
                splitter,
            ),
            path: path_display,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn next(&mut self, size: i64, schema: DataSchema) -> Result<Option<DataBatch>, PpcError> {
        self.inner.next(size, schema)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, PpcError> {
        self.inner.read_bytes()
    }

    pub fn capacity(&self) -> u64 {
        self.inner.capacity()
    }
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Appends serialized batches to a local file.
///
/// Parent directories are created on demand. Opening an existing output is
/// an error unless truncation was requested.
#[derive(Debug)]
pub struct FileLineWriter {
    path: String,
    out: Option<std::io::BufWriter<File>>,
    file_info: Option<FileInfo>,
}

impl FileLineWriter {
    pub fn create(path: impl AsRef<Path>, truncate: bool) -> Result<Self, PpcError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        if path_ref.exists() && !truncate {
            return Err(PpcError::OpenFileLineWriter(format!(
                "{path_display} already exists"
            )));
        }
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| PpcError::OpenFileLineWriter(format!("{path_display}: {e}")))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path_ref)
            .map_err(|e| PpcError::OpenFileLineWriter(format!("{path_display}: {e}")))?;
        Ok(FileLineWriter {
            path: path_display,
            out: Some(std::io::BufWriter::new(file)),
            file_info: None,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn write_line(
        &mut self,
        batch: &DataBatch,
        splitter: &str,
    ) -> Result<(), PpcError> {
        let Some(out) = self.out.as_mut() else {
            return Err(PpcError::OpenFileLineWriter(format!(
                "{} is already closed",
                self.path
            )));
        };
        for index in 0..batch.len() {
            let bytes = batch.to_bytes(index)?;
            out.write_all(&bytes)?;
            if !splitter.is_empty() {
                out.write_all(splitter.as_bytes())?;
            }
        }
        Ok(())
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), PpcError> {
        let Some(out) = self.out.as_mut() else {
            return Err(PpcError::OpenFileLineWriter(format!(
                "{} is already closed",
                self.path
            )));
        };
        out.write_all(data)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), PpcError> {
        if let Some(out) = self.out.as_mut() {
            out.flush()?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), PpcError> {
        if let Some(mut out) = self.out.take() {
            out.flush()?;
        }
        Ok(())
    }

    /// Local files have nothing to publish; the hook just records the path.
    pub fn upload(&mut self) -> Result<(), PpcError> {
        if self.file_info.is_none() {
            self.file_info = Some(FileInfo {
                path: self.path.clone(),
                ..Default::default()
            });
        }
        Ok(())
    }

    pub fn file_info(&self) -> Option<&FileInfo> {
        self.file_info.as_ref()
    }
}

impl Drop for FileLineWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::DataValue;

    fn write_fixture(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> String {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path.display().to_string()
    }

    #[test]
    fn rejects_unaligned_granularity() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(&dir, "in.txt", b"a\n");
        let err = FileLineReader::open(&path, 1000, b'\n').unwrap_err();
        assert!(matches!(err, PpcError::InvalidMmapGranularity(_)));
    }

    #[test]
    fn missing_file_fails_to_open() {
        let err = FileLineReader::open("/definitely/not/here.csv", 0, b'\n').unwrap_err();
        assert!(matches!(err, PpcError::OpenFileFailed(_)));
    }

    #[test]
    fn reads_batches_of_requested_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(&dir, "in.txt", b"a\nb\nc\nd\ne\n");
        let mut reader = FileLineReader::open(&path, 0, b'\n').unwrap();
        let first = reader.next(2, DataSchema::Bytes).unwrap().unwrap();
        assert_eq!(first.len(), 2);
        let rest = reader.next(-1, DataSchema::Bytes).unwrap().unwrap();
        assert_eq!(rest.len(), 3);
        assert!(reader.next(1, DataSchema::Bytes).unwrap().is_none());
    }

    #[test]
    fn line_straddling_window_boundary_is_stitched() {
        let page = super::page_size();
        let dir = tempfile::tempdir().unwrap();
        // one window holds exactly `page` bytes; put the boundary inside the
        // second line, at every interesting distance from the line start
        for boundary_backoff in [1, 2, 7] {
            let mut content = Vec::new();
            let first_len = page as usize - boundary_backoff - 1;
            content.extend(std::iter::repeat(b'x').take(first_len));
            content.push(b'\n');
            content.extend_from_slice(b"abcdefghij\n");
            content.extend_from_slice(b"tail");
            let path = write_fixture(&dir, &format!("straddle{boundary_backoff}.txt"), &content);
            let mut reader = FileLineReader::open(&path, page, b'\n').unwrap();
            let batch = reader.next(-1, DataSchema::String).unwrap().unwrap();
            assert_eq!(batch.len(), 3);
            assert_eq!(batch.as_str(0).unwrap().len(), first_len);
            assert_eq!(batch.as_str(1), Some("abcdefghij"));
            // last line lacks a terminator and is still returned
            assert_eq!(batch.as_str(2), Some("tail"));
        }
    }

    #[test]
    fn writer_roundtrip_and_exclusive_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/result.txt");
        let mut writer = FileLineWriter::create(&path, false).unwrap();
        let mut batch = DataBatch::new(DataSchema::Bytes);
        batch.append(DataValue::Bytes(b"bob".to_vec()));
        batch.append(DataValue::Bytes(b"carol".to_vec()));
        writer.write_line(&batch, "\n").unwrap();
        writer.flush().unwrap();
        writer.close().unwrap();

        let mut reader = FileLineReader::open(&path, 0, b'\n').unwrap();
        let read = reader.next(-1, DataSchema::Bytes).unwrap().unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read.as_bytes(0), Some(&b"bob"[..]));
        assert_eq!(read.as_bytes(1), Some(&b"carol"[..]));

        // the path now exists, so a second writer without truncation fails
        let err = FileLineWriter::create(&path, false).unwrap_err();
        assert!(matches!(err, PpcError::OpenFileLineWriter(_)));
        assert!(FileLineWriter::create(&path, true).is_ok());
    }
}
