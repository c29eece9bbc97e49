use super::{volume, ChunkCoord, PointInRegionIter, Region, Shape};
use crate::util::div_ceil;
use serde::{Deserialize, Serialize};
use std::cmp::min;

/// Regular partitioning of an array of `shape` into chunks of `chunks`. Chunks along the upper
/// edge of an axis may be smaller than the nominal chunk size.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct ChunkGrid {
    shape: Shape,
    chunks: Shape,
}

impl ChunkGrid {
    /// # Panics
    /// Panics if the ranks differ or any chunk extent is zero.
    pub fn new(shape: &[u64], chunks: &[u64]) -> Self {
        assert_eq!(shape.len(), chunks.len(), "rank mismatch");
        assert!(chunks.iter().all(|&c| c > 0), "chunk extents must be positive");

        Self {
            shape: shape.iter().copied().collect(),
            chunks: chunks.iter().copied().collect(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn chunks(&self) -> &[u64] {
        &self.chunks
    }

    /// Number of chunks along each axis.
    pub fn num_blocks(&self) -> Shape {
        self.shape
            .iter()
            .zip(&self.chunks)
            .map(|(&s, &c)| div_ceil(s, c))
            .collect()
    }

    /// Total number of chunks in this grid.
    pub fn num_chunks(&self) -> u64 {
        volume(&self.num_blocks())
    }

    /// Number of elements in a nominal (non-edge) chunk.
    pub fn chunk_volume(&self) -> u64 {
        volume(&self.chunks)
    }

    /// Region of the array covered by the chunk at `coord`.
    pub fn chunk_region(&self, coord: &[u64]) -> Region {
        assert_eq!(coord.len(), self.ndim());
        let mut lo = Shape::with_capacity(self.ndim());
        let mut hi = Shape::with_capacity(self.ndim());

        for i in 0..self.ndim() {
            let start = coord[i] * self.chunks[i];
            lo.push(start);
            hi.push(min(start + self.chunks[i], self.shape[i]));
        }

        Region::from_bounds(lo, hi)
    }

    /// Iterate over every chunk coordinate in row-major order.
    pub fn coords(&self) -> PointInRegionIter {
        Region::from_extents(&self.num_blocks()).points()
    }

    /// The range of chunk coordinates that overlap the given region of the array.
    pub fn blocks_overlapping(&self, region: &Region) -> Region {
        assert_eq!(region.ndim(), self.ndim());
        let mut lo = Shape::with_capacity(self.ndim());
        let mut hi = Shape::with_capacity(self.ndim());

        for i in 0..self.ndim() {
            if region.low()[i] >= region.high()[i] {
                lo.push(0);
                hi.push(0);
            } else {
                lo.push(region.low()[i] / self.chunks[i]);
                hi.push(div_ceil(region.high()[i], self.chunks[i]));
            }
        }

        Region::from_bounds(lo, hi)
    }

    /// Largest number of chunks of this grid that overlap any single chunk of `other`. Both grids
    /// must describe the same shape. Since overlaps are independent per axis, this is the product
    /// of the per-axis maxima.
    pub fn max_blocks_per_chunk_of(&self, other: &ChunkGrid) -> u64 {
        assert_eq!(self.shape, other.shape, "grids describe different shapes");
        let mut total = 1;

        for i in 0..self.ndim() {
            let mut axis_max = 0;
            let mut start = 0;

            while start < self.shape[i] {
                let end = min(start + other.chunks[i], self.shape[i]);
                let first = start / self.chunks[i];
                let last = div_ceil(end, self.chunks[i]);
                axis_max = axis_max.max(last - first);
                start = end;
            }

            total *= axis_max;
        }

        total
    }

    pub fn contains_coord(&self, coord: &[u64]) -> bool {
        coord.len() == self.ndim() && coord.iter().zip(self.num_blocks()).all(|(&c, n)| c < n)
    }

    pub fn to_coord(coord: &[u64]) -> ChunkCoord {
        coord.iter().copied().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn test_num_blocks() {
        let grid = ChunkGrid::new(&[3, 3], &[2, 2]);
        assert_eq!(grid.num_blocks().to_vec(), vec![2, 2]);
        assert_eq!(grid.num_chunks(), 4);
        assert_eq!(grid.chunk_volume(), 4);

        let grid = ChunkGrid::new(&[], &[]);
        assert_eq!(grid.num_chunks(), 1);
    }

    #[test]
    fn test_chunk_region() {
        let grid = ChunkGrid::new(&[3, 5], &[2, 2]);
        assert_eq!(
            grid.chunk_region(&[1, 2]),
            Region::from_bounds(smallvec![2, 4], smallvec![3, 5])
        );
        assert!(grid.contains_coord(&[1, 2]));
        assert!(!grid.contains_coord(&[2, 0]));
    }

    #[test]
    fn test_overlap() {
        let source = ChunkGrid::new(&[10, 10], &[10, 1]);
        let target = ChunkGrid::new(&[10, 10], &[1, 10]);

        let region = target.chunk_region(&[3, 0]);
        assert_eq!(
            source.blocks_overlapping(&region),
            Region::from_bounds(smallvec![0, 0], smallvec![1, 10])
        );
        assert_eq!(source.max_blocks_per_chunk_of(&target), 10);
        assert_eq!(target.max_blocks_per_chunk_of(&source), 10);

        // Misaligned chunks overlap up to two blocks per axis.
        let a = ChunkGrid::new(&[9], &[3]);
        let b = ChunkGrid::new(&[9], &[2]);
        assert_eq!(a.max_blocks_per_chunk_of(&b), 2);
        assert_eq!(b.max_blocks_per_chunk_of(&a), 2);
    }
}
