//! Concatenation.

use quilt_graph::{OpId, Operation};

use super::FusedPlan;
use crate::context::FusionContext;
use crate::tiling::GapFill;
use crate::FusionWarning;

/// Concatenation runs on the canvas along the channel axis only, with
/// every input on (or tileable onto) a canvas of the same layout.
pub(super) fn plan(ctx: &mut FusionContext<'_>, op_id: OpId, op: &Operation, axis: usize) -> Option<FusedPlan> {
    if !op.inputs.iter().any(|&t| ctx.is_canvas(t)) {
        return None;
    }
    let reason = match ctx.axis_map(op.output()) {
        None => Some("output is not rank 4".to_owned()),
        Some(map) if axis != map.channel => {
            Some(format!("axis {axis} is not the channel axis {}", map.channel))
        }
        Some(map) => op.inputs.iter().enumerate().find_map(|(i, &x)| {
            let on_canvas = ctx.is_canvas(x) || ctx.is_tileable(x);
            (!on_canvas || ctx.axis_map(x) != Some(map))
                .then(|| format!("input {i} cannot share the canvas layout"))
        }),
    };
    if let Some(reason) = reason {
        ctx.warn(FusionWarning::UnbalancedBranches {
            op: op_id,
            kind: "concat",
            reason,
        });
        return None;
    }
    Some(FusedPlan::pointwise((0..op.inputs.len()).collect()))
}

pub(super) fn fill(inputs: &[GapFill]) -> GapFill {
    if inputs.iter().all(|f| *f == GapFill::Zeroed) {
        GapFill::Zeroed
    } else {
        GapFill::Dirty
    }
}
