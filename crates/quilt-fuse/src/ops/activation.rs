//! Pointwise activations.

use quilt_graph::{ActivationKind, Operation};
use smallvec::smallvec;

use super::FusedPlan;
use crate::context::FusionContext;
use crate::tiling::GapFill;

/// Activations follow their input onto the canvas.
pub(super) fn plan(ctx: &FusionContext<'_>, op: &Operation) -> Option<FusedPlan> {
    ctx.is_canvas(op.inputs[0])
        .then(|| FusedPlan::pointwise(smallvec![0]))
}

/// Zero gaps stay zero only if `f(0) == 0`.
pub(super) fn fill(func: ActivationKind, input: GapFill) -> GapFill {
    if input == GapFill::Zeroed && func.preserves_zero() {
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
    use quilt_graph::{Conv2dParams, DType, Graph, OpKind, TensorAttr, TensorSpec};

    #[test]
    fn test_fill() {
        assert_eq!(fill(ActivationKind::Relu, GapFill::Zeroed), GapFill::Zeroed);
        assert_eq!(fill(ActivationKind::Sigmoid, GapFill::Zeroed), GapFill::Dirty);
        assert_eq!(fill(ActivationKind::Tanh, GapFill::Dirty), GapFill::Dirty);
    }

    #[test]
    fn test_follows_input_placement() {
        let relu = OpKind::Activation {
            func: ActivationKind::Relu,
        };
        let mut g = Graph::new();
        let x = g.create_tensor(TensorSpec::new(DType::F32, [4, 1, 6, 6], TensorAttr::Input));
        let direct = g.emit(relu.clone(), &[x], TensorAttr::Output).unwrap();
        let w = g.create_constant_values(DType::F32, [1, 1, 1, 1], &[2.0]).unwrap();
        let c = g
            .emit(OpKind::Conv2d(Conv2dParams::default()), &[x, w], TensorAttr::Transient)
            .unwrap();
        let after_conv = g.emit(relu, &[c], TensorAttr::Output).unwrap();

        let ctx = analyzed(&g, &FusionOptions::default());
        assert!(plan_of(&ctx, direct).is_none());
        assert!(plan_of(&ctx, after_conv).is_some());
    }
}
