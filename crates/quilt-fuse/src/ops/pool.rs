//! Pooling.

use quilt_graph::{Operation, Pool2dParams};
use smallvec::smallvec;

use super::{canvas_operand, FusedPlan, WindowParams};
use crate::context::FusionContext;

/// Unpadded pooling runs on the canvas under the same layout conditions as
/// convolution. Padded pooling ignores padded cells, which a zero gap
/// cannot imitate.
pub(super) fn plan(ctx: &FusionContext<'_>, op: &Operation, params: &Pool2dParams) -> Option<FusedPlan> {
    if params.pad != [[0, 0]; 2] {
        return None;
    }
    let map = canvas_operand(ctx, op.inputs[0])?;
    let order = map.spatial_order(&params.layout)?;
    Some(FusedPlan {
        rules: WindowParams::pool(params).rules(ctx, op, map, order),
        gapped: smallvec![0],
    })
}

#[cfg(test)]
mod tests {
    use super::super::testing::{analyzed, plan_of};
    use crate::tiling::GapRule;
    use crate::FusionOptions;
    use quilt_graph::{DType, DataLayout, Graph, OpKind, Pool2dParams, PoolKind, TensorAttr, TensorSpec};

    fn pool(pad: usize) -> OpKind {
        OpKind::Pool2d(Pool2dParams {
            kind: PoolKind::Max,
            kernel: [2, 2],
            stride: [2, 2],
            pad: [[pad, pad]; 2],
            layout: DataLayout::NCHW,
        })
    }

    #[test]
    fn test_unpadded_pool_fuses() {
        let mut g = Graph::new();
        let x = g.create_tensor(TensorSpec::new(DType::F32, [6, 2, 8, 8], TensorAttr::Input));
        let y = g.emit(pool(0), &[x], TensorAttr::Output).unwrap();
        let ctx = analyzed(&g, &FusionOptions::default());
        let plan = plan_of(&ctx, y).expect("pool should fuse");
        assert!(matches!(plan.rules[0], GapRule::Window(w) if w.stride == 2 && w.output == 4));
        assert!(matches!(plan.rules[1], GapRule::Window(_)));
    }

    #[test]
    fn test_padded_pool_stays_batched() {
        let mut g = Graph::new();
        let x = g.create_tensor(TensorSpec::new(DType::F32, [4, 2, 8, 8], TensorAttr::Input));
        let y = g.emit(pool(1), &[x], TensorAttr::Output).unwrap();
        let ctx = analyzed(&g, &FusionOptions::default());
        assert!(plan_of(&ctx, y).is_none());
    }
}
