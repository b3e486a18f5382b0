//! Elementwise binary operators.

use quilt_graph::{BinaryKind, OpId, OpKind, Operation};
use smallvec::SmallVec;
use tracing::debug;

use super::FusedPlan;
use crate::context::FusionContext;
use crate::tiling::GapFill;
use crate::FusionWarning;

/// A binary operator runs on the canvas when at least one input already
/// does and every other input is either the same kind of canvas tensor
/// (or can be tiled into one) or a per-channel broadcast operand.
///
/// A division whose divisor lives on the canvas stays batched: the
/// divisor's gap cells are zero, and the resulting infinities and NaNs
/// survive masking.
pub(super) fn plan(ctx: &mut FusionContext<'_>, op_id: OpId, op: &Operation) -> Option<FusedPlan> {
    if !op.inputs.iter().any(|&t| ctx.is_canvas(t)) {
        return None;
    }
    let y = op.output();
    let out_shape = ctx.cloned.shape(y).clone();
    let Some(map) = ctx.axis_map(y) else {
        unbalanced(ctx, op_id, format!("output shape {out_shape} is not rank 4"));
        return None;
    };

    let mut gapped = SmallVec::new();
    for (i, &x) in op.inputs.iter().enumerate() {
        let shape = ctx.cloned.shape(x);
        let aligned = shape == &out_shape && ctx.axis_map(x) == Some(map);
        if aligned && (ctx.is_canvas(x) || ctx.is_tileable(x)) {
            gapped.push(i);
        } else if !ctx.is_canvas(x) && map.is_sample_invariant(shape) {
            // Broadcast operand, read as is.
        } else {
            let reason = format!("input {i} of shape {shape} does not match canvas operand {out_shape}");
            unbalanced(ctx, op_id, reason);
            return None;
        }
    }
    if matches!(op.kind, OpKind::Binary { kind: BinaryKind::Div }) && gapped.contains(&1) {
        debug!(op = ?op_id, "divisor on the canvas, keeping division batched");
        return None;
    }
    Some(FusedPlan::pointwise(gapped))
}

fn unbalanced(ctx: &mut FusionContext<'_>, op: OpId, reason: String) {
    ctx.warn(FusionWarning::UnbalancedBranches {
        op,
        kind: "binary",
        reason,
    });
}

/// Gap fill of the result. `broadcast` is set when an operand is read
/// without gaps, so its values land in the gap cells too.
pub(super) fn fill(kind: BinaryKind, inputs: &[GapFill], broadcast: bool) -> GapFill {
    let zeroed = |f: &GapFill| *f == GapFill::Zeroed;
    let result = match kind {
        BinaryKind::Add | BinaryKind::Sub | BinaryKind::Max | BinaryKind::Min => {
            !broadcast && inputs.iter().all(zeroed)
        }
        BinaryKind::Mul => inputs.iter().any(zeroed),
        BinaryKind::Div => false,
    };
    if result {
        GapFill::Zeroed
    } else {
        GapFill::Dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::testing::{analyzed, plan_of};
    use crate::FusionOptions;
    use quilt_graph::{DType, Graph, OpKind, PadParams, TensorAttr, TensorId, TensorSpec};

    fn padded(g: &mut Graph, x: TensorId) -> TensorId {
        let pad = OpKind::Pad(PadParams {
            front: vec![0, 0, 1, 1],
            back: vec![0, 0, 1, 1],
            value: 0.0,
        });
        g.emit(pad, &[x], TensorAttr::Transient).unwrap()
    }

    fn add() -> OpKind {
        OpKind::Binary { kind: BinaryKind::Add }
    }

    #[test]
    fn test_fill_rules() {
        use GapFill::{Dirty, Zeroed};
        assert_eq!(fill(BinaryKind::Add, &[Zeroed, Zeroed], false), Zeroed);
        assert_eq!(fill(BinaryKind::Add, &[Zeroed], true), Dirty);
        assert_eq!(fill(BinaryKind::Mul, &[Zeroed], true), Zeroed);
        assert_eq!(fill(BinaryKind::Mul, &[Dirty, Zeroed], false), Zeroed);
        assert_eq!(fill(BinaryKind::Div, &[Zeroed, Zeroed], false), Dirty);
    }

    #[test]
    fn test_canvas_with_tileable_and_broadcast() {
        let mut g = Graph::new();
        let x = g.create_tensor(TensorSpec::new(DType::F32, [4, 2, 6, 6], TensorAttr::Input));
        let other = g.create_tensor(TensorSpec::new(DType::F32, [4, 2, 8, 8], TensorAttr::Input));
        let bias = g.create_constant_values(DType::F32, [2, 1, 1], &[1.0, 2.0]).unwrap();
        let p = padded(&mut g, x);
        let sum = g.emit(add(), &[p, other], TensorAttr::Transient).unwrap();
        let biased = g.emit(add(), &[sum, bias], TensorAttr::Output).unwrap();

        let ctx = analyzed(&g, &FusionOptions::default());
        assert_eq!(plan_of(&ctx, sum).unwrap().gapped.as_slice(), &[0, 1]);
        assert_eq!(plan_of(&ctx, biased).unwrap().gapped.as_slice(), &[0]);
        assert!(ctx.warnings.is_empty());
    }

    #[test]
    fn test_mismatched_operand_is_unbalanced() {
        let mut g = Graph::new();
        let x = g.create_tensor(TensorSpec::new(DType::F32, [4, 2, 6, 6], TensorAttr::Input));
        let row = g.create_constant_values(DType::F32, [8], &[1.0; 8]).unwrap();
        let p = padded(&mut g, x);
        let y = g.emit(add(), &[p, row], TensorAttr::Output).unwrap();

        let ctx = analyzed(&g, &FusionOptions::default());
        assert!(plan_of(&ctx, y).is_none());
        assert!(matches!(
            ctx.warnings.as_slice(),
            [FusionWarning::UnbalancedBranches { kind: "binary", .. }]
        ));
    }

    #[test]
    fn test_division_by_canvas_stays_batched() {
        let mut g = Graph::new();
        let x = g.create_tensor(TensorSpec::new(DType::F32, [4, 2, 6, 6], TensorAttr::Input));
        let other = g.create_tensor(TensorSpec::new(DType::F32, [4, 2, 8, 8], TensorAttr::Input));
        let scale = g.create_constant_values(DType::F32, [2, 1, 1], &[2.0, 4.0]).unwrap();
        let p = padded(&mut g, x);
        let div = OpKind::Binary { kind: BinaryKind::Div };
        let by_input = g.emit(div.clone(), &[p, other], TensorAttr::Output).unwrap();
        let by_canvas = g.emit(div.clone(), &[other, p], TensorAttr::Output).unwrap();
        let by_scale = g.emit(div, &[p, scale], TensorAttr::Output).unwrap();

        let ctx = analyzed(&g, &FusionOptions::default());
        assert!(plan_of(&ctx, by_input).is_none());
        assert!(plan_of(&ctx, by_canvas).is_none());
        assert_eq!(plan_of(&ctx, by_scale).unwrap().gapped.as_slice(), &[0]);
        assert!(ctx.warnings.is_empty());
    }

    #[test]
    fn test_batched_inputs_stay_batched() {
        let mut g = Graph::new();
        let x = g.create_tensor(TensorSpec::new(DType::F32, [4, 2, 6, 6], TensorAttr::Input));
        let y = g.emit(add(), &[x, x], TensorAttr::Output).unwrap();
        let ctx = analyzed(&g, &FusionOptions::default());
        assert!(plan_of(&ctx, y).is_none());
        assert!(ctx.warnings.is_empty());
    }
}
