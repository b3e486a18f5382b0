//! Axis permutation.

use quilt_graph::{Operation, TensorId};
use smallvec::smallvec;

use super::FusedPlan;
use crate::axes::AxisMap;
use crate::context::FusionContext;

/// A transposed canvas is still a canvas, with its axis roles permuted.
pub(super) fn plan(ctx: &FusionContext<'_>, op: &Operation) -> Option<FusedPlan> {
    ctx.is_canvas(op.inputs[0])
        .then(|| FusedPlan::pointwise(smallvec![0]))
}

pub(super) fn output_axis_map(ctx: &FusionContext<'_>, x: TensorId, perm: &[usize]) -> Option<AxisMap> {
    ctx.axis_map(x)?.permuted(perm)
}

#[cfg(test)]
mod tests {
    use super::super::testing::{analyzed, plan_of};
    use crate::axes::AxisMap;
    use crate::FusionOptions;
    use quilt_graph::{DType, Graph, OpKind, PadParams, TensorAttr, TensorSpec};

    #[test]
    fn test_permutes_axis_map_on_canvas() {
        let mut g = Graph::new();
        let x = g.create_tensor(TensorSpec::new(DType::F32, [4, 2, 6, 6], TensorAttr::Input));
        let pad = OpKind::Pad(PadParams {
            front: vec![0, 0, 1, 1],
            back: vec![0, 0, 1, 1],
            value: 0.0,
        });
        let p = g.emit(pad, &[x], TensorAttr::Transient).unwrap();
        let t = g
            .emit(OpKind::Transpose { perm: vec![0, 2, 3, 1] }, &[p], TensorAttr::Output)
            .unwrap();

        let ctx = analyzed(&g, &FusionOptions::default());
        assert!(plan_of(&ctx, t).is_some());
        let ct = ctx.try_cloned_of(t).unwrap();
        assert_eq!(
            ctx.axis_map(ct),
            Some(AxisMap {
                batch: 0,
                channel: 3,
                fuse: [1, 2],
            })
        );
    }
}
