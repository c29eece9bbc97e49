use super::{chunk_nbytes_at, store_key, ChunkStore, StoreError};
use crate::prelude::*;
use crate::types::StoreRef;
use crossbeam::atomic::AtomicCell;
use std::sync::Arc;
use tessera_core::{ChunkCoord, ChunkGrid, DataType, Shape};

struct MemoryArray {
    shape: Shape,
    dtype: DataType,
    chunks: Shape,
    data: HashMap<ChunkCoord, Arc<Vec<u8>>>,
    num_writes: u64,
}

/// Chunk store that keeps every chunk in process memory. Mostly useful for tests and small
/// local computations.
#[derive(Default)]
pub struct MemoryStore {
    next_id: AtomicCell<u64>,
    arrays: Mutex<HashMap<String, MemoryArray>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        default()
    }

    /// Number of chunks of the array that have been written at least once.
    pub fn num_chunks_written(&self, store: &StoreRef) -> Result<usize> {
        let key = store_key(store)?;
        let arrays = self.arrays.lock();
        let array = arrays
            .get(key)
            .ok_or_else(|| StoreError::ArrayNotFound(key.to_string()))?;

        Ok(array.data.len())
    }

    /// Number of chunk writes to the array, including overwrites.
    pub fn num_writes(&self, store: &StoreRef) -> Result<u64> {
        let key = store_key(store)?;
        let arrays = self.arrays.lock();
        let array = arrays
            .get(key)
            .ok_or_else(|| StoreError::ArrayNotFound(key.to_string()))?;

        Ok(array.num_writes)
    }
}

impl ChunkStore for MemoryStore {
    fn create_array(&self, shape: &[u64], dtype: DataType, chunks: &[u64]) -> Result<StoreRef> {
        let key = format!("memory://array-{}", self.next_id.get_and_increment());
        trace!("creating {} with shape {:?} chunks {:?}", key, shape, chunks);

        self.arrays.lock().insert(
            key.clone(),
            MemoryArray {
                shape: shape.iter().copied().collect(),
                dtype,
                chunks: chunks.iter().copied().collect(),
                data: default(),
                num_writes: 0,
            },
        );

        Ok(StoreRef::Key(key))
    }

    fn read_chunk(&self, store: &StoreRef, coord: &[u64]) -> Result<Vec<u8>> {
        let key = store_key(store)?;
        let arrays = self.arrays.lock();
        let array = arrays
            .get(key)
            .ok_or_else(|| StoreError::ArrayNotFound(key.to_string()))?;

        let chunk = array
            .data
            .get(coord)
            .ok_or_else(|| StoreError::ChunkNotFound {
                key: key.to_string(),
                coord: coord.to_vec(),
            })?;

        Ok(chunk.as_ref().clone())
    }

    fn write_chunk(&self, store: &StoreRef, coord: &[u64], data: &[u8]) -> Result {
        let key = store_key(store)?;
        let mut arrays = self.arrays.lock();
        let array = arrays
            .get_mut(key)
            .ok_or_else(|| StoreError::ArrayNotFound(key.to_string()))?;

        if !ChunkGrid::new(&array.shape, &array.chunks).contains_coord(coord) {
            return Err(StoreError::InvalidCoord {
                key: key.to_string(),
                coord: coord.to_vec(),
            }
            .into());
        }

        let expected = chunk_nbytes_at(&array.shape, array.dtype, &array.chunks, coord);
        if data.len() as u64 != expected {
            return Err(StoreError::InvalidSize {
                key: key.to_string(),
                coord: coord.to_vec(),
                expected,
                actual: data.len() as u64,
            }
            .into());
        }

        array
            .data
            .insert(coord.iter().copied().collect(), Arc::new(data.to_vec()));
        array.num_writes += 1;
        Ok(())
    }
}
