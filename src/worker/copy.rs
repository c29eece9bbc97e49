use tessera_core::{Region, Shape};

/// Copy the elements inside `region` from `src` to `dst`. Both buffers hold elements of
/// `item_size` bytes in row-major order: `src` covers `src_bounds` and `dst` covers
/// `dst_bounds`, and all three regions are expressed in the same (array) coordinates.
///
/// # Panics
/// Panics if `region` does not lie within both bounds or if a buffer is too small.
pub fn copy_region(
    src: &[u8],
    src_bounds: &Region,
    dst: &mut [u8],
    dst_bounds: &Region,
    region: &Region,
    item_size: usize,
) {
    assert!(src_bounds.contains(region), "{:?} not in {:?}", region, src_bounds);
    assert!(dst_bounds.contains(region), "{:?} not in {:?}", region, dst_bounds);

    if region.is_empty() {
        return;
    }

    let ndim = region.ndim();
    if ndim == 0 {
        dst[..item_size].copy_from_slice(&src[..item_size]);
        return;
    }

    let src_strides = row_major_strides(&src_bounds.extents());
    let dst_strides = row_major_strides(&dst_bounds.extents());
    let row_len = (region.high()[ndim - 1] - region.low()[ndim - 1]) as usize * item_size;

    // One point per contiguous row along the last axis.
    let lo: Shape = region.low().iter().copied().collect();
    let mut hi: Shape = region.high().iter().copied().collect();
    hi[ndim - 1] = lo[ndim - 1] + 1;

    for p in Region::from_bounds(lo, hi).points() {
        let s = offset(&p, src_bounds, &src_strides) * item_size;
        let d = offset(&p, dst_bounds, &dst_strides) * item_size;
        dst[d..d + row_len].copy_from_slice(&src[s..s + row_len]);
    }
}

fn row_major_strides(extents: &[u64]) -> Shape {
    let mut strides: Shape = extents.iter().map(|_| 1).collect();

    for i in (0..extents.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * extents[i + 1];
    }

    strides
}

fn offset(point: &[u64], bounds: &Region, strides: &[u64]) -> usize {
    point
        .iter()
        .zip(bounds.low())
        .zip(strides)
        .map(|((&p, &lo), &s)| (p - lo) * s)
        .sum::<u64>() as usize
}
