//! Constant padding.

use quilt_graph::{Operation, PadParams};
use smallvec::smallvec;

use super::{canvas_operand, FusedPlan};
use crate::context::FusionContext;
use crate::tiling::{GapFill, GapRule};

/// Zero padding runs on the canvas, carving its cells out of the gap.
/// Padding the batch axis or padding with anything but zero keeps the
/// batched semantics.
pub(super) fn plan(ctx: &FusionContext<'_>, op: &Operation, params: &PadParams) -> Option<FusedPlan> {
    if params.value != 0.0 {
        return None;
    }
    let map = canvas_operand(ctx, op.inputs[0])?;
    if params.front[map.batch] != 0 || params.back[map.batch] != 0 {
        return None;
    }
    let rules = std::array::from_fn(|f| {
        if ctx.grid.is_tiled(f) {
            let axis = map.fuse[f];
            GapRule::Pad {
                total: params.front[axis] + params.back[axis],
            }
        } else {
            GapRule::Identity
        }
    });
    Some(FusedPlan {
        rules,
        gapped: smallvec![0],
    })
}

/// Gap cells of the output are gap cells of the (masked) input.
pub(super) const fn fill() -> GapFill {
    GapFill::Zeroed
}
