use super::{volume, ChunkCoord, Shape};
use crate::prelude::reversed;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::cmp::{max, min};
use std::fmt::{self, Debug};
use std::iter::FusedIterator;

/// Axis aligned box of arbitrary rank.
///
/// This box is defined by a lower bound (inclusive) and an upper bound (exclusive) along each
/// axis. The upper bound is exclusive to allow zero-volume boxes to be defined as the lower bound
/// equalling the upper bound.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    lo: Shape,
    hi: Shape,
}

impl Region {
    /// Returns a region having lower bounds `lo` and upper bounds `hi`.
    ///
    /// # Panics
    /// Panics if the ranks differ or if `lo[i] > hi[i]` for any `i`.
    pub fn from_bounds(lo: Shape, hi: Shape) -> Self {
        assert_eq!(lo.len(), hi.len(), "rank mismatch");
        assert!(
            lo.iter().zip(&hi).all(|(l, h)| l <= h),
            "invalid bounds {:?}..{:?}",
            lo,
            hi
        );

        Self { lo, hi }
    }

    /// Returns the region `0..extents[0], 0..extents[1], ...`.
    pub fn from_extents(extents: &[u64]) -> Self {
        Self {
            lo: extents.iter().map(|_| 0).collect(),
            hi: extents.iter().copied().collect(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.lo.len()
    }

    pub fn low(&self) -> &[u64] {
        &self.lo
    }

    pub fn high(&self) -> &[u64] {
        &self.hi
    }

    /// The size along each axis.
    pub fn extents(&self) -> Shape {
        self.lo.iter().zip(&self.hi).map(|(l, h)| h - l).collect()
    }

    pub fn volume(&self) -> u64 {
        volume(&self.extents())
    }

    /// Returns true if this region contains no points.
    pub fn is_empty(&self) -> bool {
        self.lo.iter().zip(&self.hi).any(|(l, h)| l == h)
    }

    /// Returns `true` if all points represented by `other` lie within this region.
    pub fn contains(&self, other: &Region) -> bool {
        assert_eq!(self.ndim(), other.ndim());
        let mut contains = true;

        for i in 0..self.ndim() {
            contains &= (other.lo[i] >= self.lo[i]) & (other.hi[i] <= self.hi[i]);
        }

        contains
    }

    /// Returns the region representing the points which lie in both regions, or `None` if the
    /// two regions do not intersect.
    pub fn intersection(&self, other: &Region) -> Option<Region> {
        assert_eq!(self.ndim(), other.ndim());
        let lo: Shape = zip_with(&self.lo, &other.lo, max);
        let hi: Shape = zip_with(&self.hi, &other.hi, min);

        if lo.iter().zip(&hi).all(|(l, h)| l < h) {
            Some(Region { lo, hi })
        } else {
            None
        }
    }

    pub fn intersects(&self, other: &Region) -> bool {
        self.intersection(other).is_some()
    }

    /// Translate this region such that `origin` becomes the zero point.
    ///
    /// # Panics
    /// Panics if `origin` does not lie at or below the lower bound on every axis.
    pub fn relative_to(&self, origin: &[u64]) -> Region {
        Region {
            lo: zip_with(&self.lo, origin, |a, b| a - b),
            hi: zip_with(&self.hi, origin, |a, b| a - b),
        }
    }

    /// Iterate over all points in this region in row-major order (last axis fastest).
    pub fn points(&self) -> PointInRegionIter {
        PointInRegionIter {
            exhausted: self.is_empty(),
            cursor: self.lo.clone(),
            bounds: self.clone(),
        }
    }
}

fn zip_with<F: Fn(u64, u64) -> u64>(a: &[u64], b: &[u64], f: F) -> Shape {
    a.iter().zip(b).map(|(&x, &y)| f(x, y)).collect()
}

impl Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("Region");

        for i in 0..self.ndim() {
            f.field(&(&self.lo[i]..&self.hi[i]));
        }

        f.finish()
    }
}

impl IntoIterator for &Region {
    type Item = ChunkCoord;
    type IntoIter = PointInRegionIter;

    fn into_iter(self) -> Self::IntoIter {
        self.points()
    }
}

#[derive(Debug, Clone)]
pub struct PointInRegionIter {
    exhausted: bool,
    cursor: ChunkCoord,
    bounds: Region,
}

impl PointInRegionIter {
    fn checked_count(&self) -> Option<usize> {
        if self.exhausted {
            return Some(0);
        }

        let mut count = 1u64;
        let mut line_size = 1u64;

        for i in reversed(0..self.bounds.ndim()) {
            let remaining = self.bounds.hi[i] - self.cursor[i] - 1;
            count = u64::checked_add(count, u64::checked_mul(remaining, line_size)?)?;
            line_size = u64::checked_mul(line_size, self.bounds.hi[i] - self.bounds.lo[i])?;
        }

        usize::try_from(count).ok()
    }
}

impl Iterator for PointInRegionIter {
    type Item = ChunkCoord;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        let current = self.cursor.clone();
        for i in reversed(0..self.bounds.ndim()) {
            self.cursor[i] += 1;

            if self.cursor[i] < self.bounds.hi[i] {
                return Some(current);
            }

            self.cursor[i] = self.bounds.lo[i];
        }

        self.exhausted = true;
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.checked_count() {
            Some(c) => (c, Some(c)),
            None => (usize::MAX, None),
        }
    }
}

impl FusedIterator for PointInRegionIter {}
