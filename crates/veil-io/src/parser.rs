// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Line scanning over read windows, shared by the file and HDFS readers.
//!
//! A reader pulls fixed-size blocks from its backend (an mmap window or a
//! heap buffer filled from a remote block) and walks them with a
//! [`BlockParser`]. The parser treats the line splitter as a terminator,
//! drops `'\r'`, and collapses runs of terminators so empty lines never
//! become elements.

use veil_types::PpcError;

use crate::batch::{DataBatch, DataSchema, DataValue};

const IGNORED_DELIMITER: u8 = b'\r';

/// How a single `read_line` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LineEnd {
    /// A terminator was found and the block has more data.
    More,
    /// A terminator was found and it consumed the rest of the block.
    BlockFinished,
    /// The block ended mid-line; the line continues in the next block.
    BlockFinishedWithoutDelimiter,
}

#[derive(Debug)]
pub(crate) enum BlockData {
    Mapped(memmap2::Mmap),
    Heap(Vec<u8>),
}

impl BlockData {
    fn bytes(&self) -> &[u8] {
        match self {
            BlockData::Mapped(map) => map,
            BlockData::Heap(buf) => buf,
        }
    }
}

/// A cursor over one block of raw bytes.
#[derive(Debug)]
pub(crate) struct BlockParser {
    data: BlockData,
    pos: usize,
}

impl BlockParser {
    pub(crate) fn new(data: BlockData) -> Self {
        BlockParser { data, pos: 0 }
    }

    pub(crate) fn exhausted(&self) -> bool {
        self.pos >= self.data.bytes().len()
    }

    /// Read one line starting at the cursor. Returns the consumed byte count
    /// (line plus any terminator run), the line content, and how the read
    /// ended. `None` when the block is exhausted.
    pub(crate) fn read_line(&mut self, splitter: u8) -> Option<(u64, Vec<u8>, LineEnd)> {
        let bytes = self.data.bytes();
        if self.pos >= bytes.len() {
            return None;
        }
        let start = self.pos;
        let mut cursor = start;
        while cursor < bytes.len() && bytes[cursor] != splitter && bytes[cursor] != IGNORED_DELIMITER
        {
            cursor += 1;
        }
        let line = bytes[start..cursor].to_vec();
        let mut found_delimiter = false;
        while cursor < bytes.len()
            && (bytes[cursor] == splitter || bytes[cursor] == IGNORED_DELIMITER)
        {
            found_delimiter = true;
            cursor += 1;
        }
        self.pos = cursor;
        let end = if cursor < bytes.len() {
            LineEnd::More
        } else if found_delimiter {
            LineEnd::BlockFinished
        } else {
            LineEnd::BlockFinishedWithoutDelimiter
        };
        Some(((cursor - start) as u64, line, end))
    }

    /// Append the unread remainder of the block to `out` without parsing.
    pub(crate) fn read_all(&mut self, out: &mut Vec<u8>) -> u64 {
        let bytes = self.data.bytes();
        let consumed = bytes.len() - self.pos;
        out.extend_from_slice(&bytes[self.pos..]);
        self.pos = bytes.len();
        consumed as u64
    }
}

/// Supplies consecutive blocks of the underlying source.
pub(crate) trait BlockSource {
    /// The next block starting at the given logical offset, or `None` when
    /// the source is drained.
    fn next_block(&mut self, offset: u64) -> Result<Option<BlockParser>, PpcError>;
}

/// The batched line-reading core shared by the file and HDFS readers.
///
/// Tracks a logical read pointer across blocks and stitches lines that
/// straddle a block boundary: the partial tail of block *k* is appended as
/// an element, and the first line of block *k+1* is merged into it instead
/// of becoming a new element.
#[derive(Debug)]
pub(crate) struct BlockLineReader<S> {
    source: S,
    splitter: u8,
    length: u64,
    offset: u64,
    current: Option<BlockParser>,
    pending_append: bool,
}

impl<S: BlockSource> BlockLineReader<S> {
    pub(crate) fn new(source: S, length: u64, splitter: u8) -> Self {
        BlockLineReader {
            source,
            splitter,
            length,
            offset: 0,
            current: None,
            pending_append: false,
        }
    }

    pub(crate) fn capacity(&self) -> u64 {
        self.length
    }

    pub(crate) fn finished(&self) -> bool {
        self.offset >= self.length
    }

    fn allocate_block(&mut self) -> Result<bool, PpcError> {
        if self.finished() {
            return Ok(false);
        }
        if let Some(parser) = &self.current {
            if !parser.exhausted() {
                return Ok(true);
            }
        }
        self.current = self.source.next_block(self.offset)?;
        Ok(self.current.is_some())
    }

    /// Decode up to `size` rows (`-1` = all remaining) under `schema`.
    /// Returns `None` once the source is exhausted.
    pub(crate) fn next(
        &mut self,
        size: i64,
        schema: DataSchema,
    ) -> Result<Option<DataBatch>, PpcError> {
        if !matches!(schema, DataSchema::String | DataSchema::Bytes) {
            return Err(PpcError::UnsupportedDataSchema);
        }
        if self.finished() {
            return Ok(None);
        }
        if size != -1 && size <= 0 {
            return Err(PpcError::InvalidParam(
                "the read-size parameter must be -1 or positive".into(),
            ));
        }
        let mut batch = DataBatch::new(schema);
        let mut remaining = if size == -1 { i64::MAX } else { size };
        // Keep pulling blocks while rows are still wanted, or while the last
        // row is incomplete — a returned batch never ends mid-line except at
        // end of input.
        while (remaining > 0 || self.pending_append) && self.allocate_block()? {
            remaining -= self.read_block_lines(&mut batch, remaining)? as i64;
        }
        Ok(Some(batch))
    }

    fn read_block_lines(
        &mut self,
        batch: &mut DataBatch,
        max_rows: i64,
    ) -> Result<u64, PpcError> {
        let mut parser = self
            .current
            .take()
            .expect("allocate_block guarantees a current parser");
        let mut rows: u64 = 0;
        let mut block_done = false;
        while (rows as i64) < max_rows || self.pending_append {
            let Some((consumed, line, end)) = parser.read_line(self.splitter) else {
                block_done = true;
                break;
            };
            self.offset += consumed;
            if self.pending_append {
                self.pending_append = false;
                batch.append_to_line(&line);
            } else {
                rows += 1;
                match batch.schema() {
                    DataSchema::String => {
                        batch.append(DataValue::Str(String::from_utf8_lossy(&line).into_owned()))
                    }
                    _ => batch.append(DataValue::Bytes(line)),
                }
            }
            match end {
                LineEnd::More => {}
                LineEnd::BlockFinished => {
                    block_done = true;
                    break;
                }
                LineEnd::BlockFinishedWithoutDelimiter => {
                    self.pending_append = true;
                    block_done = true;
                    break;
                }
            }
        }
        if !block_done {
            self.current = Some(parser);
        }
        Ok(rows)
    }

    /// Drain the remaining bytes verbatim, without line splitting.
    pub(crate) fn read_bytes(&mut self) -> Result<Vec<u8>, PpcError> {
        let mut result = Vec::new();
        while self.allocate_block()? {
            let mut parser = self
                .current
                .take()
                .expect("allocate_block guarantees a current parser");
            self.offset += parser.read_all(&mut result);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OneShot(Option<Vec<u8>>);

    impl BlockSource for OneShot {
        fn next_block(&mut self, _offset: u64) -> Result<Option<BlockParser>, PpcError> {
            Ok(self.0.take().map(|b| BlockParser::new(BlockData::Heap(b))))
        }
    }

    #[test]
    fn parses_lines_and_collapses_terminator_runs() {
        let data = b"alice\nbob\r\n\ncarol".to_vec();
        let len = data.len() as u64;
        let mut reader = BlockLineReader::new(OneShot(Some(data)), len, b'\n');
        let batch = reader.next(-1, DataSchema::String).unwrap().unwrap();
        let rows: Vec<_> = (0..batch.len()).map(|i| batch.as_str(i).unwrap()).collect();
        assert_eq!(rows, ["alice", "bob", "carol"]);
        assert!(reader.finished());
        assert!(reader.next(-1, DataSchema::String).unwrap().is_none());
    }

    #[test]
    fn trailing_line_without_terminator_is_returned() {
        let data = b"x\ny".to_vec();
        let len = data.len() as u64;
        let mut reader = BlockLineReader::new(OneShot(Some(data)), len, b'\n');
        let batch = reader.next(10, DataSchema::Bytes).unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.as_bytes(1), Some(&b"y"[..]));
    }
}
