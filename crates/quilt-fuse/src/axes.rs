//! Per-tensor axis roles.

use quilt_graph::{DataLayout, Shape};

/// Physical positions of the batch, channel and fuse axes of one rank-4
/// tensor.
///
/// Graph inputs start from the configured layout; transposes move the
/// roles around.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AxisMap {
    /// Batch axis.
    pub batch: usize,
    /// Channel axis.
    pub channel: usize,
    /// Fuse axes, indexed by tile-grid dimension.
    pub fuse: [usize; 2],
}

impl AxisMap {
    /// Roles after `Transpose { perm }` (`out[i] = in[perm[i]]`).
    #[must_use]
    pub fn permuted(&self, perm: &[usize]) -> Option<Self> {
        let position = |axis: usize| perm.iter().position(|&p| p == axis);
        Some(Self {
            batch: position(self.batch)?,
            channel: position(self.channel)?,
            fuse: [position(self.fuse[0])?, position(self.fuse[1])?],
        })
    }

    /// Transpose permutation taking this layout to `[N, C, F0, F1]`.
    #[must_use]
    pub const fn canonical_perm(&self) -> [usize; 4] {
        [self.batch, self.channel, self.fuse[0], self.fuse[1]]
    }

    /// Transpose permutation taking `[N, C, F0, F1]` back to this layout.
    #[must_use]
    pub fn from_canonical_perm(&self) -> [usize; 4] {
        let mut perm = [0; 4];
        for (canonical, &axis) in self.canonical_perm().iter().enumerate() {
            perm[axis] = canonical;
        }
        perm
    }

    /// For each fuse axis, the index into `layout.spatial` naming the same
    /// physical axis, or `None` if the operator's layout assigns roles
    /// differently.
    #[must_use]
    pub fn spatial_order(&self, layout: &DataLayout) -> Option<[usize; 2]> {
        if layout.batch != self.batch || layout.channel != self.channel {
            return None;
        }
        let find = |axis: usize| layout.spatial.iter().position(|&s| s == axis);
        Some([find(self.fuse[0])?, find(self.fuse[1])?])
    }

    /// Per-sample extents along the fuse axes.
    #[must_use]
    pub fn sample_extent(&self, shape: &Shape) -> [usize; 2] {
        [shape[self.fuse[0]], shape[self.fuse[1]]]
    }

    /// Whether a tensor of `shape` broadcasts against this layout without
    /// varying along the batch or fuse axes. Shapes align to the right, as in
    /// elementwise broadcasting against a rank-4 tensor.
    #[must_use]
    pub fn is_sample_invariant(&self, shape: &Shape) -> bool {
        if shape.rank() > 4 {
            return false;
        }
        let offset = 4 - shape.rank();
        [self.batch, self.fuse[0], self.fuse[1]]
            .iter()
            .all(|&axis| axis < offset || shape[axis - offset] == 1)
    }
}

/// Whether `perm` is the identity.
pub(crate) fn is_identity(perm: &[usize]) -> bool {
    perm.iter().enumerate().all(|(i, &p)| i == p)
}
