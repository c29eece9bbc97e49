//! Geometry of chunked arrays: shapes, rectangular regions and regular chunk grids.
mod grid;
mod region;

pub use self::grid::*;
pub use self::region::*;

use smallvec::SmallVec;

/// Inline capacity for shapes and coordinates. Arrays of higher rank spill to the heap.
pub const INLINE_DIMS: usize = 4;

/// Extents of an array (or of a chunk) along each axis.
pub type Shape = SmallVec<[u64; INLINE_DIMS]>;

/// Coordinates of a chunk within a chunk grid.
pub type ChunkCoord = SmallVec<[u64; INLINE_DIMS]>;

/// Product of all extents. The empty product (rank 0) equals one.
pub fn volume(extents: &[u64]) -> u64 {
    extents.iter().product()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_volume() {
        assert_eq!(volume(&[]), 1);
        assert_eq!(volume(&[3, 4]), 12);
        assert_eq!(volume(&[3, 0, 2]), 0);
    }
}
