use super::PlanError;
use crate::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use tessera_core::{volume, ChunkGrid, DataType, Shape};

/// Location of an array in a chunk store.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum StoreRef {
    /// Storage is allocated by the executor right before the producing node runs.
    Unallocated,

    /// Key understood by the chunk store that holds the array.
    Key(String),
}

impl StoreRef {
    pub fn key(&self) -> Option<&str> {
        match self {
            StoreRef::Unallocated => None,
            StoreRef::Key(key) => Some(key),
        }
    }

    pub fn is_allocated(&self) -> bool {
        matches!(self, StoreRef::Key(_))
    }
}

impl fmt::Display for StoreRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreRef::Unallocated => f.write_str("<unallocated>"),
            StoreRef::Key(key) => f.write_str(key),
        }
    }
}

/// Metadata of a chunked n-dimensional array.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct ArrayDescriptor {
    shape: Shape,
    dtype: DataType,
    chunks: Shape,
    store: StoreRef,
}

impl ArrayDescriptor {
    /// Create a descriptor. Every chunk extent must be positive and no larger than the
    /// corresponding array extent (an axis of length zero admits a chunk extent of one).
    pub fn new(
        shape: &[u64],
        dtype: DataType,
        chunks: &[u64],
        store: StoreRef,
    ) -> Result<Self, PlanError> {
        if shape.len() != chunks.len() {
            return Err(PlanError::GraphValidation(format!(
                "chunking {:?} has a different rank than shape {:?}",
                chunks, shape
            )));
        }

        for (&s, &c) in zip(shape, chunks) {
            if c == 0 || c > max(s, 1) {
                return Err(PlanError::GraphValidation(format!(
                    "invalid chunking {:?} for shape {:?}",
                    chunks, shape
                )));
            }
        }

        Ok(Self {
            shape: shape.iter().copied().collect(),
            dtype,
            chunks: chunks.iter().copied().collect(),
            store,
        })
    }

    /// Descriptor of an array that has no storage yet.
    pub fn unallocated(shape: &[u64], dtype: DataType, chunks: &[u64]) -> Result<Self, PlanError> {
        Self::new(shape, dtype, chunks, StoreRef::Unallocated)
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn chunks(&self) -> &[u64] {
        &self.chunks
    }

    pub fn store(&self) -> &StoreRef {
        &self.store
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn grid(&self) -> ChunkGrid {
        ChunkGrid::new(&self.shape, &self.chunks)
    }

    pub fn num_blocks(&self) -> Shape {
        self.grid().num_blocks()
    }

    pub fn num_chunks(&self) -> u64 {
        self.grid().num_chunks()
    }

    /// Size in bytes of a nominal (full) chunk.
    pub fn chunk_nbytes(&self) -> u64 {
        volume(&self.chunks) * self.dtype.size_in_bytes() as u64
    }

    /// Size in bytes of the entire array.
    pub fn nbytes(&self) -> u64 {
        volume(&self.shape) * self.dtype.size_in_bytes() as u64
    }

    pub fn with_store(&self, store: StoreRef) -> Self {
        Self {
            store,
            ..self.clone()
        }
    }

    pub fn with_chunks(&self, chunks: &[u64]) -> Result<Self, PlanError> {
        Self::new(&self.shape, self.dtype, chunks, self.store.clone())
    }
}
