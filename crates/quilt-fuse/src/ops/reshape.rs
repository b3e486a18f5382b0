//! Reshape.

use quilt_graph::{OpKind, Operation, TensorId};
use smallvec::smallvec;

use super::FusedPlan;
use crate::context::FusionContext;
use crate::FusionResult;

/// Only a reshape that keeps the shape can stay on the canvas. Anything
/// else reinterprets the per-sample layout and needs batched data.
pub(super) fn plan(ctx: &FusionContext<'_>, op: &Operation) -> Option<FusedPlan> {
    let x = op.inputs[0];
    let same = ctx.cloned.shape(x) == ctx.cloned.shape(op.output());
    (ctx.is_canvas(x) && same).then(|| FusedPlan::pointwise(smallvec![0]))
}

/// The reshape as emitted on the canvas: its target is the canvas shape.
pub(super) fn canvas_kind(ctx: &FusionContext<'_>, y: TensorId) -> FusionResult<OpKind> {
    Ok(OpKind::Reshape {
        shape: ctx.gap_infer_shape(y)?.to_vec(),
    })
}
