//! Reductions.

use super::FusedPlan;

/// A reduction may mix samples, so it always reads batched data. A canvas
/// input is de-fused first.
pub(super) const fn plan() -> Option<FusedPlan> {
    None
}
