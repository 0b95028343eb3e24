// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Block-aware HDFS line I/O.
//!
//! The filesystem itself is an opaque capability behind [`HdfsClient`] (the
//! production client wraps libhdfs; tests use [`MemoryHdfs`]). The reader
//! owns the block/host iteration strategy: it resolves the block-host map at
//! open time, connects to one host per block with the block size as the read
//! hint, and pulls heap buffers of `buffer_size` bytes via repeated short
//! reads.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};
use veil_types::{FileInfo, PpcError};

use crate::batch::{DataBatch, DataSchema};
use crate::parser::{BlockData, BlockLineReader, BlockParser, BlockSource};

/// Default pull-buffer size for block reads.
pub const DEFAULT_HDFS_BUFFER_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HdfsFileInfo {
    pub size: u64,
    pub block_size: u64,
}

/// Sequential reads from one block connection.
pub trait HdfsRead: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, PpcError>;
}

/// Sequential writes to one output stream.
pub trait HdfsWrite: Send {
    fn write_all(&mut self, data: &[u8]) -> Result<(), PpcError>;
    fn flush(&mut self) -> Result<(), PpcError>;
    fn close(&mut self) -> Result<(), PpcError>;
}

/// The opaque filesystem capability. Mirrors the slice of libhdfs the node
/// actually uses.
pub trait HdfsClient: Send + Sync {
    fn file_info(&self, path: &str) -> Result<HdfsFileInfo, PpcError>;
    /// Host lists per block, in block order.
    fn block_hosts(&self, path: &str) -> Result<Vec<Vec<String>>, PpcError>;
    /// Open a read connection on `host` positioned at `offset`, with
    /// `read_hint` advertising how much the caller intends to pull.
    fn open_read(
        &self,
        host: &str,
        path: &str,
        offset: u64,
        read_hint: u64,
    ) -> Result<Box<dyn HdfsRead>, PpcError>;
    fn create(&self, path: &str, overwrite: bool) -> Result<Box<dyn HdfsWrite>, PpcError>;
    fn exists(&self, path: &str) -> Result<bool, PpcError>;
    fn mkdirs(&self, path: &str) -> Result<(), PpcError>;
    /// Publish a finished output file and return its upload metadata.
    fn publish(&self, path: &str) -> Result<FileInfo, PpcError>;
}

// ── Reader ────────────────────────────────────────────────────────────────────

struct HdfsBlocks {
    client: Arc<dyn HdfsClient>,
    path: String,
    length: u64,
    block_size: u64,
    hosts: Vec<Vec<String>>,
    buffer_size: u64,
    current_block: usize,
    current_host: usize,
    file_offset: u64,
    connection: Option<Box<dyn HdfsRead>>,
}

impl std::fmt::Debug for HdfsBlocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HdfsBlocks")
            .field("path", &self.path)
            .field("length", &self.length)
            .field("block_size", &self.block_size)
            .field("buffer_size", &self.buffer_size)
            .field("current_block", &self.current_block)
            .field("current_host", &self.current_host)
            .field("file_offset", &self.file_offset)
            .finish()
    }
}

impl HdfsBlocks {
    fn open_block_connection(&mut self) -> Result<(), PpcError> {
        let hosts = self.hosts.get(self.current_block).ok_or_else(|| {
            PpcError::HdfsOpenMetaInfoFailed(format!(
                "{}: no hosts for block {}",
                self.path, self.current_block
            ))
        })?;
        // Try every host of the block in order, the first one included.
        while self.current_host < hosts.len() {
            let host = &hosts[self.current_host];
            match self
                .client
                .open_read(host, &self.path, self.file_offset, self.block_size)
            {
                Ok(connection) => {
                    debug!(
                        host,
                        block = self.current_block,
                        offset = self.file_offset,
                        "opened hdfs block connection"
                    );
                    self.connection = Some(connection);
                    return Ok(());
                }
                Err(e) => {
                    warn!(host, block = self.current_block, error = %e,
                          "hdfs host unreachable, trying next");
                    self.current_host += 1;
                }
            }
        }
        Err(PpcError::OpenFileFailed(format!(
            "{}: no reachable host for block {}",
            self.path, self.current_block
        )))
    }
}

impl BlockSource for HdfsBlocks {
    fn next_block(&mut self, _offset: u64) -> Result<Option<BlockParser>, PpcError> {
        loop {
            if self.file_offset >= self.length {
                return Ok(None);
            }
            let block_end = std::cmp::min(
                self.length,
                (self.current_block as u64 + 1) * self.block_size,
            );
            if self.file_offset >= block_end {
                self.connection = None;
                self.current_block += 1;
                self.current_host = 0;
                continue;
            }
            if self.connection.is_none() {
                self.open_block_connection()?;
            }
            let want = std::cmp::min(self.buffer_size, block_end - self.file_offset) as usize;
            let mut buffer = vec![0u8; want];
            let mut filled = 0;
            let connection = self.connection.as_mut().expect("connection opened above");
            while filled < buffer.len() {
                let n = connection.read(&mut buffer[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                return Err(PpcError::HdfsReadDataFailed(format!(
                    "{}: empty read at offset {} (block {})",
                    self.path, self.file_offset, self.current_block
                )));
            }
            buffer.truncate(filled);
            self.file_offset += filled as u64;
            return Ok(Some(BlockParser::new(BlockData::Heap(buffer))));
        }
    }
}

/// Streams an HDFS file as line batches. Parsing rules are identical to the
/// local-file reader.
#[derive(Debug)]
pub struct HdfsLineReader {
    inner: BlockLineReader<HdfsBlocks>,
}

impl HdfsLineReader {
    pub fn open(
        client: Arc<dyn HdfsClient>,
        path: &str,
        buffer_size: u64,
        splitter: u8,
    ) -> Result<Self, PpcError> {
        let info = client.file_info(path)?;
        let hosts = client
            .block_hosts(path)
            .map_err(|e| PpcError::HdfsOpenMetaInfoFailed(e.to_string()))?;
        debug!(path, size = info.size, blocks = hosts.len(), "opened hdfs reader");
        let blocks = HdfsBlocks {
            client,
            path: path.to_string(),
            length: info.size,
            block_size: info.block_size.max(1),
            hosts,
            buffer_size: buffer_size.max(1),
            current_block: 0,
            current_host: 0,
            file_offset: 0,
            connection: None,
        };
        Ok(HdfsLineReader {
            inner: BlockLineReader::new(blocks, info.size, splitter),
        })
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

/// Writes an output file into HDFS and publishes it on `upload()`.
pub struct HdfsLineWriter {
    client: Arc<dyn HdfsClient>,
    path: String,
    out: Option<Box<dyn HdfsWrite>>,
    file_info: Option<FileInfo>,
}

impl HdfsLineWriter {
    pub fn create(
        client: Arc<dyn HdfsClient>,
        path: &str,
        truncate: bool,
    ) -> Result<Self, PpcError> {
        if client.exists(path)? && !truncate {
            return Err(PpcError::OpenFileLineWriter(format!(
                "{path} already exists"
            )));
        }
        if let Some((parent, _)) = path.rsplit_once('/') {
            if !parent.is_empty() {
                client.mkdirs(parent)?;
            }
        }
        let out = client.create(path, truncate)?;
        Ok(HdfsLineWriter {
            client,
            path: path.to_string(),
            out: Some(out),
            file_info: None,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn write_line(&mut self, batch: &DataBatch, splitter: &str) -> Result<(), PpcError> {
        let Some(out) = self.out.as_mut() else {
            return Err(PpcError::HdfsWriteDataFailed(format!(
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
            return Err(PpcError::HdfsWriteDataFailed(format!(
                "{} is already closed",
                self.path
            )));
        };
        out.write_all(data)
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
            out.close()?;
        }
        Ok(())
    }

    /// Publish the finished file and capture its `FileInfo`.
    pub fn upload(&mut self) -> Result<(), PpcError> {
        self.close()?;
        self.file_info = Some(self.client.publish(&self.path)?);
        Ok(())
    }

    pub fn file_info(&self) -> Option<&FileInfo> {
        self.file_info.as_ref()
    }
}

// ── In-memory client ──────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryHdfsState {
    files: HashMap<String, Vec<u8>>,
    dirs: Vec<String>,
    /// Hosts that refuse connections, for failover tests.
    dead_hosts: Vec<String>,
    /// `(block, host)` pairs in the order connections were opened.
    opened: Vec<(usize, String)>,
}

/// An in-process HDFS double: same block/host surface, backed by a map.
pub struct MemoryHdfs {
    state: Arc<Mutex<MemoryHdfsState>>,
    hosts: Vec<String>,
    block_size: u64,
}

impl MemoryHdfs {
    pub fn new(hosts: Vec<String>, block_size: u64) -> Self {
        MemoryHdfs {
            state: Arc::new(Mutex::new(MemoryHdfsState::default())),
            hosts,
            block_size: block_size.max(1),
        }
    }

    pub fn insert(&self, path: &str, content: Vec<u8>) {
        self.state.lock().unwrap().files.insert(path.into(), content);
    }

    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn kill_host(&self, host: &str) {
        self.state.lock().unwrap().dead_hosts.push(host.into());
    }

    /// Connections opened so far, as `(block, host)` pairs.
    pub fn opened_connections(&self) -> Vec<(usize, String)> {
        self.state.lock().unwrap().opened.clone()
    }
}

struct MemoryRead {
    content: Vec<u8>,
    pos: usize,
}

impl HdfsRead for MemoryRead {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, PpcError> {
        let remaining = self.content.len().saturating_sub(self.pos);
        // short reads on purpose, to exercise the pull loop
        let n = remaining.min(buf.len()).min(1024);
        buf[..n].copy_from_slice(&self.content[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

struct MemoryWrite {
    state: Arc<Mutex<MemoryHdfsState>>,
    path: String,
    buffer: Vec<u8>,
}

impl HdfsWrite for MemoryWrite {
    fn write_all(&mut self, data: &[u8]) -> Result<(), PpcError> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), PpcError> {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(self.path.clone(), self.buffer.clone());
        Ok(())
    }

    fn close(&mut self) -> Result<(), PpcError> {
        self.flush()
    }
}

impl HdfsClient for MemoryHdfs {
    fn file_info(&self, path: &str) -> Result<HdfsFileInfo, PpcError> {
        let state = self.state.lock().unwrap();
        let content = state
            .files
            .get(path)
            .ok_or_else(|| PpcError::OpenFileFailed(format!("{path} not exist")))?;
        Ok(HdfsFileInfo {
            size: content.len() as u64,
            block_size: self.block_size,
        })
    }

    fn block_hosts(&self, path: &str) -> Result<Vec<Vec<String>>, PpcError> {
        let info = self.file_info(path)?;
        let blocks = info.size.div_ceil(self.block_size).max(1) as usize;
        Ok(vec![self.hosts.clone(); blocks])
    }

    fn open_read(
        &self,
        host: &str,
        path: &str,
        offset: u64,
        _read_hint: u64,
    ) -> Result<Box<dyn HdfsRead>, PpcError> {
        let mut state = self.state.lock().unwrap();
        if state.dead_hosts.iter().any(|h| h == host) {
            return Err(PpcError::OpenFileFailed(format!("{host} is unreachable")));
        }
        let content = state
            .files
            .get(path)
            .ok_or_else(|| PpcError::OpenFileFailed(format!("{path} not exist")))?
            .clone();
        let block = (offset / self.block_size) as usize;
        state.opened.push((block, host.to_string()));
        Ok(Box::new(MemoryRead {
            content: content[offset.min(content.len() as u64) as usize..].to_vec(),
            pos: 0,
        }))
    }

    fn create(&self, path: &str, overwrite: bool) -> Result<Box<dyn HdfsWrite>, PpcError> {
        if self.exists(path)? && !overwrite {
            return Err(PpcError::HdfsWriteDataFailed(format!(
                "{path} already exists"
            )));
        }
        Ok(Box::new(MemoryWrite {
            state: Arc::clone(&self.state),
            path: path.to_string(),
            buffer: Vec::new(),
        }))
    }

    fn exists(&self, path: &str) -> Result<bool, PpcError> {
        Ok(self.state.lock().unwrap().files.contains_key(path))
    }

    fn mkdirs(&self, path: &str) -> Result<(), PpcError> {
        self.state.lock().unwrap().dirs.push(path.to_string());
        Ok(())
    }

    fn publish(&self, path: &str) -> Result<FileInfo, PpcError> {
        let size = self
            .content(path)
            .map(|c| c.len())
            .ok_or_else(|| PpcError::HdfsWriteDataFailed(format!("{path} not written")))?;
        Ok(FileInfo {
            path: path.to_string(),
            biz_seq_no: String::new(),
            file_id: format!("mem-{path}"),
            file_md5: format!("{size:08x}"),
        })
    }
}
