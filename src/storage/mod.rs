//! Chunk storage: where arrays live between tasks.
mod directory;
mod memory;

pub use self::directory::DirectoryStore;
pub use self::memory::MemoryStore;

use crate::prelude::*;
use crate::types::{ArrayDescriptor, StoreRef};
use crate::worker::copy_region;
use std::io;
use tessera_core::{decode_elements, encode_elements, volume, DataType, Element, Region};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error: {0}")]
    IO(#[from] io::Error),

    #[error("array {0:?} does not exist")]
    ArrayNotFound(String),

    #[error("chunk {coord:?} of array {key:?} has not been written")]
    ChunkNotFound { key: String, coord: Vec<u64> },

    #[error("chunk {coord:?} is outside the chunk grid of array {key:?}")]
    InvalidCoord { key: String, coord: Vec<u64> },

    #[error("chunk {coord:?} of array {key:?} has {actual} bytes, expected {expected}")]
    InvalidSize {
        key: String,
        coord: Vec<u64>,
        expected: u64,
        actual: u64,
    },

    #[error("array has no storage allocated")]
    Unallocated,
}

/// Persistent storage for chunked arrays. Writes to distinct chunks of the same array may
/// happen concurrently, and a chunk read after it has been written returns the written bytes.
pub trait ChunkStore: Send + Sync {
    /// Allocate storage for a new, empty array.
    fn create_array(&self, shape: &[u64], dtype: DataType, chunks: &[u64]) -> Result<StoreRef>;

    fn read_chunk(&self, store: &StoreRef, coord: &[u64]) -> Result<Vec<u8>>;

    /// Write (or replace) the chunk at `coord`.
    fn write_chunk(&self, store: &StoreRef, coord: &[u64], data: &[u8]) -> Result;
}

/// Name of the chunk at `coord`, e.g. `1.0.2`. The single chunk of a rank-zero array is `0`.
pub fn chunk_key(coord: &[u64]) -> String {
    if coord.is_empty() {
        "0".to_string()
    } else {
        coord.iter().join(".")
    }
}

pub(crate) fn store_key(store: &StoreRef) -> Result<&str, StoreError> {
    store.key().ok_or(StoreError::Unallocated)
}

/// Size in bytes of the chunk at `coord`, taking the clipped chunks along the array edge into
/// account.
pub fn chunk_nbytes_at(shape: &[u64], dtype: DataType, chunks: &[u64], coord: &[u64]) -> u64 {
    let region = tessera_core::ChunkGrid::new(shape, chunks).chunk_region(coord);
    region.volume() * dtype.size_in_bytes() as u64
}

/// Allocate storage for `descriptor` (if needed) and write `values`, given in row-major order,
/// chunk by chunk. Returns the descriptor with its storage reference.
pub fn write_array<T: Element>(
    store: &dyn ChunkStore,
    descriptor: &ArrayDescriptor,
    values: &[T],
) -> Result<ArrayDescriptor> {
    if descriptor.dtype() != T::DATA_TYPE {
        bail!(
            "cannot write {} values to an array of {}",
            T::DATA_TYPE,
            descriptor.dtype()
        );
    }

    if values.len() as u64 != volume(descriptor.shape()) {
        bail!(
            "expected {} values for shape {:?}, found {}",
            volume(descriptor.shape()),
            descriptor.shape(),
            values.len()
        );
    }

    let descriptor = match descriptor.store() {
        StoreRef::Unallocated => {
            let store_ref =
                store.create_array(descriptor.shape(), descriptor.dtype(), descriptor.chunks())?;
            descriptor.with_store(store_ref)
        }
        StoreRef::Key(_) => descriptor.clone(),
    };

    let item_size = T::DATA_TYPE.size_in_bytes();
    let full = encode_elements(values);
    let whole = Region::from_extents(descriptor.shape());
    let grid = descriptor.grid();

    for coord in grid.coords() {
        let region = grid.chunk_region(&coord);
        let mut buffer = vec![0; region.volume() as usize * item_size];

        copy_region(
            &full,
            &whole,
            &mut buffer,
            &region,
            &region,
            item_size,
        );

        store.write_chunk(descriptor.store(), &coord, &buffer)?;
    }

    Ok(descriptor)
}

/// Read an entire array into memory in row-major order.
pub fn read_array<T: Element>(store: &dyn ChunkStore, descriptor: &ArrayDescriptor) -> Result<Vec<T>> {
    if descriptor.dtype() != T::DATA_TYPE {
        bail!(
            "cannot read {} values from an array of {}",
            T::DATA_TYPE,
            descriptor.dtype()
        );
    }

    let item_size = T::DATA_TYPE.size_in_bytes();
    let whole = Region::from_extents(descriptor.shape());
    let mut full = vec![0; whole.volume() as usize * item_size];
    let grid = descriptor.grid();

    for coord in grid.coords() {
        let region = grid.chunk_region(&coord);
        let chunk = store.read_chunk(descriptor.store(), &coord)?;

        if chunk.len() as u64 != region.volume() * item_size as u64 {
            bail!(
                "chunk {:?} has {} bytes, expected {}",
                coord,
                chunk.len(),
                region.volume() * item_size as u64
            );
        }

        copy_region(&chunk, &region, &mut full, &whole, &region, item_size);
    }

    Ok(decode_elements(&full))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_chunk_key() {
        assert_eq!(chunk_key(&[]), "0");
        assert_eq!(chunk_key(&[1, 0, 2]), "1.0.2");
    }

    #[test]
    fn test_chunk_nbytes_at() {
        assert_eq!(chunk_nbytes_at(&[3, 3], DataType::I64, &[2, 2], &[0, 0]), 32);
        assert_eq!(chunk_nbytes_at(&[3, 3], DataType::I64, &[2, 2], &[1, 0]), 16);
        assert_eq!(chunk_nbytes_at(&[3, 3], DataType::I64, &[2, 2], &[1, 1]), 8);
    }

    #[test]
    fn test_write_read_array() {
        let store = MemoryStore::new();
        let desc = ArrayDescriptor::unallocated(&[3, 5], DataType::I32, &[2, 2]).unwrap();
        let values = (0..15).collect_vec();

        let desc = write_array(&store, &desc, &values).unwrap();
        assert!(desc.store().is_allocated());
        assert_eq!(read_array::<i32>(&store, &desc).unwrap(), values);

        // Chunk (1, 2) holds the single element at row 2, column 4.
        let chunk = store.read_chunk(desc.store(), &[1, 2]).unwrap();
        assert_eq!(decode_elements::<i32>(&chunk), vec![14]);

        let chunk = store.read_chunk(desc.store(), &[0, 1]).unwrap();
        assert_eq!(decode_elements::<i32>(&chunk), vec![2, 3, 7, 8]);

        assert!(write_array(&store, &desc, &[1.0f32]).is_err());
        assert!(read_array::<i64>(&store, &desc).is_err());
    }
}
