//! Convolution.

use quilt_graph::{Conv2dParams, Operation};
use smallvec::smallvec;

use super::{canvas_operand, FusedPlan, WindowParams};
use crate::context::FusionContext;

/// A convolution runs on the canvas when its data input is (or can be
/// tiled onto) a canvas laid out the way the convolution expects.
/// Weights and bias stay batched.
pub(super) fn plan(ctx: &FusionContext<'_>, op: &Operation, params: &Conv2dParams) -> Option<FusedPlan> {
    let x = op.inputs[0];
    if op.inputs[1..].iter().any(|&t| ctx.is_canvas(t)) {
        return None;
    }
    let map = canvas_operand(ctx, x)?;
    let order = map.spatial_order(&params.layout)?;
    let window = WindowParams::conv(params, ctx.cloned.shape(op.inputs[1]));
    Some(FusedPlan {
        rules: window.rules(ctx, op, map, order),
        gapped: smallvec![0],
    })
}

#[cfg(test)]
mod tests {
    use super::super::testing::{analyzed, plan_of};
    use crate::tiling::{GapRule, Window};
    use crate::{FusionAxisConfig, FusionOptions};
    use quilt_graph::{Conv2dParams, DType, DataLayout, Graph, OpKind, TensorAttr, TensorId, TensorSpec};

    fn conv_graph(layout: DataLayout, shape: [usize; 4]) -> (Graph, TensorId) {
        let mut g = Graph::new();
        let x = g.create_tensor(TensorSpec::new(DType::F32, shape, TensorAttr::Input));
        let w = g
            .create_constant_values(DType::F32, [2, 3, 3, 3], &[0.5; 54])
            .unwrap();
        let conv = OpKind::Conv2d(Conv2dParams {
            pad: [[1, 1], [1, 1]],
            layout,
            ..Conv2dParams::default()
        });
        let y = g.emit(conv, &[x, w], TensorAttr::Output).unwrap();
        (g, y)
    }

    #[test]
    fn test_tileable_input_fuses() {
        let (g, y) = conv_graph(DataLayout::NCHW, [4, 3, 8, 8]);
        let ctx = analyzed(&g, &FusionOptions::default());
        let plan = plan_of(&ctx, y).expect("conv should fuse");
        assert_eq!(plan.gapped.as_slice(), &[0]);
        assert_eq!(
            plan.rules[0],
            GapRule::Window(Window {
                kernel: 3,
                stride: 1,
                dilation: 1,
                pad: [1, 1],
                input: 8,
                output: 8,
            })
        );
    }

    #[test]
    fn test_layout_mismatch_stays_batched() {
        let (g, y) = conv_graph(DataLayout::NHWC, [4, 8, 8, 3]);
        let ctx = analyzed(&g, &FusionOptions::default());
        assert!(plan_of(&ctx, y).is_none());

        let nhwc = FusionOptions::default().with_axes(FusionAxisConfig::NHWC);
        let ctx = analyzed(&g, &nhwc);
        assert!(plan_of(&ctx, y).is_some());
    }

    #[test]
    fn test_single_sample_never_fuses() {
        let (g, y) = conv_graph(DataLayout::NCHW, [1, 3, 8, 8]);
        let ctx = analyzed(&g, &FusionOptions::default());
        assert!(plan_of(&ctx, y).is_none());
    }
}
