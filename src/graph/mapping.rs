use crate::prelude::*;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tessera_core::{volume, ChunkCoord, Region, INLINE_DIMS};

/// How one axis of an input array relates to the output block grid.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum AxisMap {
    /// The input block index along this axis equals the output block index along the given
    /// output axis.
    Output(usize),

    /// Every block along this axis contributes to each output block (a contraction).
    Contract,

    /// The axis holds a single block that is shared by every output block.
    Broadcast,
}

/// Maps an output chunk coordinate to the set of input chunks it reads. There is one entry per
/// axis of the input array.
///
/// An input axis that has exactly one block always resolves to block zero, which makes
/// broadcasting along that axis implicit.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct BlockMapping {
    axes: SmallVec<[AxisMap; INLINE_DIMS]>,
}

impl BlockMapping {
    pub fn new(axes: impl IntoIterator<Item = AxisMap>) -> Self {
        Self {
            axes: axes.into_iter().collect(),
        }
    }

    /// Input axis `i` maps to output axis `i`.
    pub fn identity(ndim: usize) -> Self {
        Self::new((0..ndim).map(AxisMap::Output))
    }

    /// Build a mapping from index labels, one character per axis. Input labels that appear in
    /// the output map to that output axis, all others are contracted.
    ///
    /// # Examples
    /// ```
    /// # use tessera::graph::{AxisMap, BlockMapping};
    /// let m = BlockMapping::from_labels("ik", "ij").unwrap();
    /// assert_eq!(m.axes(), &[AxisMap::Output(0), AxisMap::Contract]);
    /// ```
    pub fn from_labels(output: &str, input: &str) -> Result<Self> {
        let output = output.chars().collect_vec();
        if output.iter().unique().count() != output.len() {
            bail!("duplicate output label in {:?}", output);
        }

        Ok(Self::new(input.chars().map(|label| {
            match output.iter().position(|&c| c == label) {
                Some(axis) => AxisMap::Output(axis),
                None => AxisMap::Contract,
            }
        })))
    }

    pub fn axes(&self) -> &[AxisMap] {
        &self.axes
    }

    /// Rank of the input array this mapping applies to.
    pub fn ndim(&self) -> usize {
        self.axes.len()
    }

    /// Check that this mapping is consistent with an input block grid and an output block grid.
    pub fn validate(&self, input_blocks: &[u64], output_blocks: &[u64]) -> Result {
        if input_blocks.len() != self.ndim() {
            bail!(
                "mapping {:?} has rank {} but input has rank {}",
                self.axes,
                self.ndim(),
                input_blocks.len()
            );
        }

        for (axis, (map, &n)) in enumerate(zip(&self.axes, input_blocks)) {
            match *map {
                AxisMap::Output(i) => {
                    let expected = match output_blocks.get(i) {
                        Some(&e) => e,
                        None => bail!("axis {} maps to non-existing output axis {}", axis, i),
                    };

                    if n != expected && n != 1 {
                        bail!(
                            "input axis {} has {} blocks but output axis {} has {} blocks",
                            axis,
                            n,
                            i,
                            expected
                        );
                    }
                }
                AxisMap::Broadcast if n > 1 => {
                    bail!("broadcast axis {} has {} blocks", axis, n);
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// The block coordinates of the input that are read for output block `coord`.
    pub fn resolve(&self, coord: &[u64], input_blocks: &[u64]) -> Region {
        let mut lo = ChunkCoord::with_capacity(self.ndim());
        let mut hi = ChunkCoord::with_capacity(self.ndim());

        for (map, &n) in zip(&self.axes, input_blocks) {
            let (start, end) = match *map {
                _ if n <= 1 => (0, n),
                AxisMap::Output(i) => (coord[i], coord[i] + 1),
                AxisMap::Contract => (0, n),
                AxisMap::Broadcast => (0, 1),
            };

            lo.push(start);
            hi.push(end);
        }

        Region::from_bounds(lo, hi)
    }

    /// Number of input blocks read for a single output block.
    pub fn blocks_per_output(&self, input_blocks: &[u64]) -> u64 {
        let extents = zip(&self.axes, input_blocks)
            .map(|(map, &n)| match map {
                AxisMap::Contract => n,
                _ => min(n, 1),
            })
            .collect_vec();

        volume(&extents)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use AxisMap::*;

    #[test]
    fn test_from_labels() {
        let m = BlockMapping::from_labels("ji", "ij").unwrap();
        assert_eq!(m.axes(), &[Output(1), Output(0)]);

        let m = BlockMapping::from_labels("i", "ij").unwrap();
        assert_eq!(m.axes(), &[Output(0), Contract]);
        assert!(BlockMapping::from_labels("ii", "i").is_err());
    }

    #[test]
    fn test_validate() {
        let m = BlockMapping::identity(2);
        assert!(m.validate(&[2, 3], &[2, 3]).is_ok());
        assert!(m.validate(&[1, 3], &[2, 3]).is_ok());
        assert!(m.validate(&[2, 2], &[2, 3]).is_err());
        assert!(m.validate(&[2], &[2, 3]).is_err());

        let m = BlockMapping::new(vec![Output(2)]);
        assert!(m.validate(&[2], &[2, 3]).is_err());
    }

    #[test]
    fn test_resolve() {
        let m = BlockMapping::new(vec![Output(0), Contract]);
        let region = m.resolve(&[1, 4], &[3, 5]);
        let points = region.points().map(|p| p.to_vec()).collect_vec();
        assert_eq!(points, (0..5u64).map(|j| vec![1, j]).collect_vec());
        assert_eq!(m.blocks_per_output(&[3, 5]), 5);

        // Single-block axes resolve to block zero.
        let m = BlockMapping::identity(2);
        let points = m.resolve(&[1, 1], &[1, 2]).points().map(|p| p.to_vec()).collect_vec();
        assert_eq!(points, vec![vec![0, 1]]);
        assert_eq!(m.blocks_per_output(&[1, 2]), 1);
    }
}
