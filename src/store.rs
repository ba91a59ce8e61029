//! Append-only array storage consumed by the chunk scheduler.
//!
//! [`ArrayStore`] is the seam to an on-disk engine; [`MemoryStore`] keeps everything
//! in memory and is what the tests and Python bindings use.

use std::collections::HashMap;
use std::ops::Range;

use ndarray::{s, Array2, ArrayView2, Axis};
use serde_json::Value;

use crate::error::{Error, Result};

/// Element layout of a stored array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayKind {
    /// 2D float32 with a fixed row count, growing along columns (time).
    Float32 { rows: usize },
    /// 1D int64 (timestamps).
    Int64,
    /// 1D uint8 (particle tags).
    UInt8,
}

/// Creation parameters for a stored array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArraySpec {
    pub kind: ArrayKind,
    /// Length of one storage chunk along the growing axis.
    pub chunk_len: usize,
}

/// Data appended to an array.
#[derive(Debug, Clone, Copy)]
pub enum ArrayChunk<'a> {
    Float32(ArrayView2<'a, f32>),
    Int64(&'a [i64]),
    UInt8(&'a [u8]),
}

/// Growable named arrays plus small JSON attributes.
pub trait ArrayStore {
    fn exists(&self, name: &str) -> bool;

    /// Create an empty array. Fails with [`Error::AlreadyExists`] unless `overwrite`.
    fn create(&mut self, name: &str, spec: ArraySpec, overwrite: bool) -> Result<()>;

    fn append(&mut self, name: &str, chunk: ArrayChunk<'_>) -> Result<()>;

    /// Length along the growing axis.
    fn len(&self, name: &str) -> Result<usize>;

    fn chunk_len(&self, name: &str) -> Result<usize>;

    /// Columns `cols` of a float32 array.
    fn read_f32(&self, name: &str, cols: Range<usize>) -> Result<Array2<f32>>;

    fn read_i64(&self, name: &str) -> Result<Vec<i64>>;

    fn read_u8(&self, name: &str) -> Result<Vec<u8>>;

    fn attr(&self, key: &str) -> Option<Value>;

    fn set_attr(&mut self, key: &str, value: Value) -> Result<()>;

    /// Make all appended data durable.
    fn flush(&mut self) -> Result<()>;
}

#[derive(Debug, Clone)]
enum StoredData {
    Float32(Array2<f32>),
    Int64(Vec<i64>),
    UInt8(Vec<u8>),
}

#[derive(Debug, Clone)]
struct StoredArray {
    chunk_len: usize,
    data: StoredData,
}

/// In-memory [`ArrayStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    arrays: HashMap<String, StoredArray>,
    attrs: HashMap<String, Value>,
    flushes: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `flush` calls so far.
    pub fn flush_count(&self) -> usize {
        self.flushes
    }

    /// Names of every stored array, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.arrays.keys().cloned().collect();
        names.sort();
        names
    }

    fn get(&self, name: &str) -> Result<&StoredArray> {
        self.arrays
            .get(name)
            .ok_or_else(|| Error::MissingArtifact(name.to_string()))
    }
}

impl ArrayStore for MemoryStore {
    fn exists(&self, name: &str) -> bool {
        self.arrays.contains_key(name)
    }

    fn create(&mut self, name: &str, spec: ArraySpec, overwrite: bool) -> Result<()> {
        if self.exists(name) && !overwrite {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        if spec.chunk_len == 0 {
            return Err(Error::InvalidParam("chunk_len must be > 0".into()));
        }
        let data = match spec.kind {
            ArrayKind::Float32 { rows } => StoredData::Float32(Array2::zeros((rows, 0))),
            ArrayKind::Int64 => StoredData::Int64(Vec::new()),
            ArrayKind::UInt8 => StoredData::UInt8(Vec::new()),
        };
        self.arrays.insert(
            name.to_string(),
            StoredArray {
                chunk_len: spec.chunk_len,
                data,
            },
        );
        Ok(())
    }

    fn append(&mut self, name: &str, chunk: ArrayChunk<'_>) -> Result<()> {
        let arr = self
            .arrays
            .get_mut(name)
            .ok_or_else(|| Error::MissingArtifact(name.to_string()))?;
        match (&mut arr.data, chunk) {
            (StoredData::Float32(a), ArrayChunk::Float32(v)) => {
                if a.nrows() != v.nrows() {
                    return Err(Error::Shape(format!(
                        "{name}: appending {} rows to an array of {} rows",
                        v.nrows(),
                        a.nrows()
                    )));
                }
                a.append(Axis(1), v).map_err(|e| Error::Shape(e.to_string()))
            }
            (StoredData::Int64(a), ArrayChunk::Int64(v)) => {
                a.extend_from_slice(v);
                Ok(())
            }
            (StoredData::UInt8(a), ArrayChunk::UInt8(v)) => {
                a.extend_from_slice(v);
                Ok(())
            }
            _ => Err(Error::Shape(format!("{name}: element type mismatch"))),
        }
    }

    fn len(&self, name: &str) -> Result<usize> {
        Ok(match &self.get(name)?.data {
            StoredData::Float32(a) => a.ncols(),
            StoredData::Int64(v) => v.len(),
            StoredData::UInt8(v) => v.len(),
        })
    }

    fn chunk_len(&self, name: &str) -> Result<usize> {
        Ok(self.get(name)?.chunk_len)
    }

    fn read_f32(&self, name: &str, cols: Range<usize>) -> Result<Array2<f32>> {
        match &self.get(name)?.data {
            StoredData::Float32(a) => {
                if cols.start > cols.end || cols.end > a.ncols() {
                    return Err(Error::Shape(format!(
                        "{name}: columns {}..{} out of {}",
                        cols.start,
                        cols.end,
                        a.ncols()
                    )));
                }
                Ok(a.slice(s![.., cols]).to_owned())
            }
            _ => Err(Error::Shape(format!("{name} is not a float32 array"))),
        }
    }

    fn read_i64(&self, name: &str) -> Result<Vec<i64>> {
        match &self.get(name)?.data {
            StoredData::Int64(v) => Ok(v.clone()),
            _ => Err(Error::Shape(format!("{name} is not an int64 array"))),
        }
    }

    fn read_u8(&self, name: &str) -> Result<Vec<u8>> {
        match &self.get(name)?.data {
            StoredData::UInt8(v) => Ok(v.clone()),
            _ => Err(Error::Shape(format!("{name} is not a uint8 array"))),
        }
    }

    fn attr(&self, key: &str) -> Option<Value> {
        self.attrs.get(key).cloned()
    }

    fn set_attr(&mut self, key: &str, value: Value) -> Result<()> {
        self.attrs.insert(key.to_string(), value);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }
}
