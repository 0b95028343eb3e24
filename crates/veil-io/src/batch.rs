// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Schema-tagged element batches flowing between readers, engines and
//! writers.

use veil_types::PpcError;

/// Element schema of a batch. Readers decode under a schema; writers encode
/// back to bytes under the same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSchema {
    String,
    Bytes,
    Sint,
    Uint,
    Double,
    Float,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    Str(String),
    Bytes(Vec<u8>),
    Sint(i64),
    Uint(u64),
    Double(f64),
    Float(f32),
}

impl DataValue {
    fn heap_bytes(&self) -> u64 {
        match self {
            DataValue::Str(s) => s.len() as u64,
            DataValue::Bytes(b) => b.len() as u64,
            DataValue::Sint(_) | DataValue::Uint(_) | DataValue::Double(_) => 8,
            DataValue::Float(_) => 4,
        }
    }
}

/// An ordered sequence of uniformly-typed elements.
///
/// Tracks the total byte capacity of its elements so caches can account for
/// memory and apply back-pressure without walking the data.
#[derive(Debug, Clone)]
pub struct DataBatch {
    schema: DataSchema,
    data: Vec<DataValue>,
    capacity_bytes: u64,
}

impl DataBatch {
    pub fn new(schema: DataSchema) -> Self {
        DataBatch {
            schema,
            data: Vec::new(),
            capacity_bytes: 0,
        }
    }

    pub fn from_bytes(rows: Vec<Vec<u8>>) -> Self {
        let mut batch = DataBatch::new(DataSchema::Bytes);
        for row in rows {
            batch.append(DataValue::Bytes(row));
        }
        batch
    }

    pub fn from_strings<I, S>(rows: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut batch = DataBatch::new(DataSchema::String);
        for row in rows {
            batch.append(DataValue::Str(row.into()));
        }
        batch
    }

    pub fn schema(&self) -> DataSchema {
        self.schema
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn append(&mut self, value: DataValue) {
        self.capacity_bytes += value.heap_bytes();
        self.data.push(value);
    }

    /// Extend the last element in place. Readers use this to stitch a line
    /// that straddles two read windows back together.
    pub fn append_to_line(&mut self, tail: &[u8]) {
        self.capacity_bytes += tail.len() as u64;
        match self.data.last_mut() {
            Some(DataValue::Str(s)) => s.push_str(&String::from_utf8_lossy(tail)),
            Some(DataValue::Bytes(b)) => b.extend_from_slice(tail),
            _ => self.data.push(match self.schema {
                DataSchema::String => DataValue::Str(String::from_utf8_lossy(tail).into_owned()),
                _ => DataValue::Bytes(tail.to_vec()),
            }),
        }
    }

    pub fn get(&self, index: usize) -> Option<&DataValue> {
        self.data.get(index)
    }

    pub fn as_str(&self, index: usize) -> Option<&str> {
        match self.data.get(index) {
            Some(DataValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self, index: usize) -> Option<&[u8]> {
        match self.data.get(index) {
            Some(DataValue::Bytes(b)) => Some(b),
            _ => None,
        }
    }

    /// Serialize the element at `index` to its byte representation under the
    /// batch schema.
    pub fn to_bytes(&self, index: usize) -> Result<Vec<u8>, PpcError> {
        let value = self
            .data
            .get(index)
            .ok_or_else(|| PpcError::InvalidParam(format!("element index {index} out of range")))?;
        Ok(match value {
            DataValue::Str(s) => s.clone().into_bytes(),
            DataValue::Bytes(b) => b.clone(),
            DataValue::Sint(v) => v.to_string().into_bytes(),
            DataValue::Uint(v) => v.to_string().into_bytes(),
            DataValue::Double(v) => v.to_string().into_bytes(),
            DataValue::Float(v) => v.to_string().into_bytes(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataValue> {
        self.data.iter()
    }

    /// Drop all elements, keeping the schema. Used when releasing memory
    /// ahead of the surrounding cache entry.
    pub fn clear(&mut self) {
        self.data = Vec::new();
        self.capacity_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_tracks_element_bytes() {
        let mut batch = DataBatch::new(DataSchema::Bytes);
        batch.append(DataValue::Bytes(vec![1, 2, 3]));
        batch.append(DataValue::Bytes(vec![4, 5]));
        assert_eq!(batch.capacity_bytes(), 5);
        batch.append_to_line(&[6, 7]);
        assert_eq!(batch.capacity_bytes(), 7);
        assert_eq!(batch.as_bytes(1), Some(&[4, 5, 6, 7][..]));
    }

    #[test]
    fn append_to_line_extends_strings() {
        let mut batch = DataBatch::from_strings(["hel"]);
        batch.append_to_line(b"lo");
        assert_eq!(batch.as_str(0), Some("hello"));
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn to_bytes_serializes_by_schema() {
        let mut batch = DataBatch::new(DataSchema::Uint);
        batch.append(DataValue::Uint(42));
        assert_eq!(batch.to_bytes(0).unwrap(), b"42");
        assert!(batch.to_bytes(7).is_err());
    }
}
