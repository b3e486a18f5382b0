//! Per-operator fusion strategies.
//!
//! Every supported operator kind decides, once, whether it runs on the
//! canvas ([`Plan::Fused`]) or keeps its batched semantics
//! ([`Plan::Batched`]). A fused plan carries one [`GapRule`] per grid
//! dimension and the input positions whose data lives on the canvas.
//!
//! ```text
//!   plan      decided on first visit during gap inference
//!   rules     drive the forward/backward gap fixpoint
//!   rewrite   emits the operator into the fused graph
//! ```

mod activation;
mod binary;
mod concat;
mod conv;
mod pad;
mod pool;
mod reduce;
mod reshape;
mod transpose;

use quilt_graph::{Conv2dParams, OpId, OpKind, Operation, Pool2dParams, TensorAttr, TensorId};
use smallvec::{smallvec, SmallVec};
use tracing::trace;

use crate::adapter;
use crate::axes::AxisMap;
use crate::context::FusionContext;
use crate::tiling::{GapFill, GapRule, Window};
use crate::{FusionError, FusionResult};

/// How one cloned operation is rewritten.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Plan {
    /// Original semantics on batched data. Canvas inputs are de-fused first.
    Batched,
    /// Runs once on the canvas.
    Fused(FusedPlan),
}

impl Plan {
    /// Whether the operation runs on the canvas.
    #[must_use]
    pub const fn is_fused(&self) -> bool {
        matches!(self, Self::Fused(_))
    }
}

/// Gap behaviour of a fused operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FusedPlan {
    /// Gap rule per grid dimension. Untiled dimensions use
    /// [`GapRule::Identity`].
    pub rules: [GapRule; 2],
    /// Input positions that are, or get tiled onto, the canvas. Every other
    /// input is read in batched form.
    pub gapped: SmallVec<[usize; 3]>,
}

impl FusedPlan {
    /// Plan for operators that leave the gap alone.
    #[must_use]
    pub fn pointwise(gapped: SmallVec<[usize; 3]>) -> Self {
        Self {
            rules: [GapRule::Identity; 2],
            gapped,
        }
    }

    /// Whether the canvas form of `input` must be masked before this
    /// operation reads it.
    fn needs_mask(&self, ctx: &FusionContext<'_>, input: TensorId) -> FusionResult<bool> {
        if !ctx.is_canvas(input) || ctx.fill(input)? == GapFill::Zeroed {
            return Ok(false);
        }
        let gap = ctx.gap(input)?;
        Ok((0..2).any(|f| ctx.grid.is_tiled(f) && self.rules[f].reads_gap() && gap[f] > 0))
    }
}

/// Decide the plan of a cloned operation. The output's axis map must
/// already be recorded.
pub(crate) fn plan(ctx: &mut FusionContext<'_>, op_id: OpId, op: &Operation) -> FusionResult<Plan> {
    if !ctx.fusion_enabled() {
        return Ok(Plan::Batched);
    }
    let fused = match &op.kind {
        OpKind::Conv2d(p) => conv::plan(ctx, op, p),
        OpKind::Pool2d(p) => pool::plan(ctx, op, p),
        OpKind::Pad(p) => pad::plan(ctx, op, p),
        OpKind::Activation { .. } => activation::plan(ctx, op),
        OpKind::Binary { .. } => binary::plan(ctx, op_id, op),
        OpKind::Reduce { .. } => reduce::plan(),
        OpKind::Transpose { .. } => transpose::plan(ctx, op),
        OpKind::Reshape { .. } => reshape::plan(ctx, op),
        OpKind::Concat { axis } => concat::plan(ctx, op_id, op, *axis),
        OpKind::Slice { .. } | OpKind::Softmax { .. } => None,
    };
    trace!(op = ?op_id, kind = op.kind.name(), fused = fused.is_some(), "planned");
    Ok(fused.map_or(Plan::Batched, Plan::Fused))
}

/// Axis roles of an operation's output.
///
/// Transposes permute their input's roles and identity reshapes keep them.
/// Other operators follow their first canvas input, then their first
/// rank-4 input, then the configured layout.
pub(crate) fn output_axis_map(ctx: &FusionContext<'_>, op: &Operation) -> Option<AxisMap> {
    let y = op.output();
    if ctx.cloned.shape(y).rank() != 4 {
        return None;
    }
    let x = op.inputs[0];
    let inherited = match &op.kind {
        OpKind::Transpose { perm } => transpose::output_axis_map(ctx, x, perm),
        OpKind::Reshape { .. } if ctx.cloned.shape(x) == ctx.cloned.shape(y) => ctx.axis_map(x),
        OpKind::Reshape { .. } => None,
        _ => op
            .inputs
            .iter()
            .find(|&&t| ctx.is_canvas(t))
            .or_else(|| op.inputs.iter().find(|&&t| ctx.axis_map(t).is_some()))
            .and_then(|&t| ctx.axis_map(t)),
    };
    Some(inherited.unwrap_or_else(|| ctx.axes.axis_map()))
}

/// Axis map of `x` if it is on, or can be tiled onto, the canvas.
fn canvas_operand(ctx: &FusionContext<'_>, x: TensorId) -> Option<AxisMap> {
    if ctx.is_canvas(x) || ctx.is_tileable(x) {
        ctx.axis_map(x)
    } else {
        None
    }
}

/// Sliding-window parameters indexed like `DataLayout::spatial`.
struct WindowParams {
    kernel: [usize; 2],
    stride: [usize; 2],
    dilation: [usize; 2],
    pad: [[usize; 2]; 2],
}

impl WindowParams {
    fn conv(p: &Conv2dParams, weight: &[usize]) -> Self {
        Self {
            kernel: [weight[2], weight[3]],
            stride: p.stride,
            dilation: p.dilation,
            pad: p.pad,
        }
    }

    fn pool(p: &Pool2dParams) -> Self {
        Self {
            kernel: p.kernel,
            stride: p.stride,
            dilation: [1, 1],
            pad: p.pad,
        }
    }

    /// Gap rules for a window op from `x` to `y`. `order[f]` names the
    /// layout's spatial slot holding fuse axis `f`.
    fn rules(&self, ctx: &FusionContext<'_>, op: &Operation, map: AxisMap, order: [usize; 2]) -> [GapRule; 2] {
        let x = ctx.cloned.shape(op.inputs[0]);
        let y = ctx.cloned.shape(op.output());
        std::array::from_fn(|f| {
            if !ctx.grid.is_tiled(f) {
                return GapRule::Identity;
            }
            let j = order[f];
            let axis = map.fuse[f];
            GapRule::Window(Window {
                kernel: self.kernel[j],
                stride: self.stride[j],
                dilation: self.dilation[j],
                pad: self.pad[j],
                input: x[axis],
                output: y[axis],
            })
        })
    }
}

/// Fill of a sliding-window output: windows straddling tile edges write
/// arbitrary values into every non-empty gap.
fn window_fill(ctx: &FusionContext<'_>, y: TensorId) -> FusionResult<GapFill> {
    let gap = ctx.gap(y)?;
    let dirty = (0..2).any(|f| ctx.grid.is_tiled(f) && gap[f] > 0);
    Ok(if dirty { GapFill::Dirty } else { GapFill::Zeroed })
}

/// Fill of a gapped input as the operation sees it.
fn input_fill(ctx: &FusionContext<'_>, x: TensorId) -> FusionResult<GapFill> {
    if ctx.is_canvas(x) {
        ctx.fill(x)
    } else {
        // Tiling pads with zeros.
        Ok(GapFill::Zeroed)
    }
}

fn output_fill(ctx: &FusionContext<'_>, op: &Operation, plan: &FusedPlan) -> FusionResult<GapFill> {
    let y = op.output();
    let fills = plan
        .gapped
        .iter()
        .map(|&i| input_fill(ctx, op.inputs[i]))
        .collect::<FusionResult<SmallVec<[GapFill; 3]>>>()?;
    Ok(match &op.kind {
        OpKind::Conv2d(_) | OpKind::Pool2d(_) => window_fill(ctx, y)?,
        OpKind::Pad(_) => pad::fill(),
        OpKind::Activation { func } => activation::fill(*func, fills[0]),
        OpKind::Binary { kind } => binary::fill(*kind, &fills, plan.gapped.len() < op.inputs.len()),
        OpKind::Concat { .. } => concat::fill(&fills),
        OpKind::Transpose { .. } | OpKind::Reshape { .. } => fills[0],
        OpKind::Reduce { .. } | OpKind::Slice { .. } | OpKind::Softmax { .. } => GapFill::Dirty,
    })
}

/// Emit one cloned operation into the fused graph according to its plan.
pub(crate) fn rewrite(ctx: &mut FusionContext<'_>, op_id: OpId) -> FusionResult<()> {
    let op = ctx.cloned.try_op(op_id)?.clone();
    let y = op.output();
    let attr = match ctx.cloned.spec(y).attr {
        TensorAttr::Output => TensorAttr::Output,
        _ => TensorAttr::Transient,
    };

    match ctx.plan(op_id)?.clone() {
        Plan::Batched => {
            let inputs = op
                .inputs
                .iter()
                .map(|&x| adapter::batched_form(ctx, x))
                .collect::<FusionResult<SmallVec<[TensorId; 3]>>>()?;
            let fy = ctx.fused.emit(op.kind.clone(), &inputs, attr)?;
            check_shape(ctx, y, fy, ctx.cloned.shape(y).clone())?;
            ctx.insert_fused(y, fy)?;
            ctx.record_proportion(fy, 1.0)?;
            ctx.counters.batched_ops += 1;
            trace!(op = ?op_id, kind = op.kind.name(), "kept batched");
        }
        Plan::Fused(plan) => {
            let mut inputs: SmallVec<[TensorId; 3]> = smallvec![];
            for (i, &x) in op.inputs.iter().enumerate() {
                let fx = if plan.gapped.contains(&i) {
                    let mask = plan.needs_mask(ctx, x)?;
                    adapter::canvas_form(ctx, x, mask)?
                } else {
                    adapter::batched_form(ctx, x)?
                };
                inputs.push(fx);
            }
            let kind = match &op.kind {
                OpKind::Reshape { .. } => reshape::canvas_kind(ctx, y)?,
                other => other.clone(),
            };
            let fy = ctx.fused.emit(kind, &inputs, TensorAttr::Transient)?;
            check_shape(ctx, y, fy, ctx.gap_infer_shape(y)?.clone())?;

            let fill = output_fill(ctx, &op, &plan)?;
            ctx.set_fill(y, fill)?;
            ctx.insert_fused(y, fy)?;
            let proportion = ctx.canvas_proportion(y)?;
            ctx.record_proportion(fy, proportion)?;
            ctx.counters.fused_ops += 1;
            trace!(op = ?op_id, kind = op.kind.name(), ?fill, "fused onto canvas");

            if attr == TensorAttr::Output {
                adapter::defuse(ctx, y, TensorAttr::Output)?;
            }
        }
    }
    Ok(())
}

fn check_shape(
    ctx: &FusionContext<'_>,
    cloned: TensorId,
    fused: TensorId,
    expected: quilt_graph::Shape,
) -> FusionResult<()> {
    let found = ctx.fused.shape(fused);
    if *found != expected {
        return Err(FusionError::CanvasMismatch {
            tensor: cloned,
            expected,
            found: found.clone(),
        });
    }
    Ok(())
}
