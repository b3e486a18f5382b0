//! # quilt-fuse
//!
//! Batch fusion for tensor dataflow graphs.
//!
//! The pass takes a graph whose tensors carry a batch of `N` independent
//! samples and rewrites it so that the samples sit side by side on one
//! enlarged spatial canvas. Zero-filled gaps between tiles keep
//! convolutions and pools from reading across sample boundaries.
//!
//! # Overview
//!
//! The `N` samples are laid out on a `t0 x t1` grid, where `t0 * t1 = N`
//! and the factors are as close to `sqrt(N)` as possible. Tile `i` along
//! a fuse axis starts at `i * (s + g)` for sample extent `s` and gap `g`.
//! Every tensor gets the smallest gap that keeps each operator downstream
//! of it correct.
//!
//! # Pipeline
//!
//! ```text
//!  source Graph
//!       │
//!       ▼
//! ┌───────────┐     ┌──────────────┐     ┌───────────┐
//! │  Cloning  │ ──▶ │     Gap      │ ──▶ │ Rewriting │
//! │ re-batch  │     │  Inference   │     │ + adapters│
//! └───────────┘     └──────────────┘     └───────────┘
//!                     forward queue            │
//!                     backward raise           ▼
//!                                         FusedGraph
//! ```
//!
//! Operators that cannot run on the canvas keep their batched semantics;
//! the rewrite inserts tiling and de-fuse adapters at the boundaries.
//!
//! # Example
//!
//! ```
//! use quilt_fuse::batch_fuse;
//! use quilt_graph::{ActivationKind, DType, Graph, OpKind, TensorAttr, TensorSpec};
//!
//! let mut g = Graph::new();
//! let x = g.create_tensor(TensorSpec::new(DType::F32, [4, 3, 8, 8], TensorAttr::Input));
//! let relu = OpKind::Activation { func: ActivationKind::Relu };
//! let y = g.emit(relu, &[x], TensorAttr::Output).unwrap();
//!
//! let fused = batch_fuse(&g, 4).unwrap();
//! assert!(fused.is_complete());
//! assert_eq!(fused.report.tiles, [2, 2]);
//! assert_eq!(fused.graph.shape(fused.io_map[&y]).dims(), &[4, 3, 8, 8]);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::similar_names)]

mod adapter;
mod axes;
mod clone;
mod context;
mod error;
mod infer;
mod ops;
mod options;
mod report;
mod tiling;

use std::collections::VecDeque;

use quilt_graph::{Graph, Shape, TensorId};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, info, instrument};

pub use axes::AxisMap;
pub use clone::GraphCloner;
pub use context::{Counters, FusionContext, Placement};
pub use error::{FusionError, FusionResult, FusionWarning};
pub use infer::GapInferenceEngine;
pub use ops::{FusedPlan, Plan};
pub use options::{FusionAxisConfig, FusionOptions};
pub use report::FusionReport;
pub use tiling::{closest_factors, GapFill, GapRule, TileGrid, Window};

/// Phases of the pass, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FusionPhase {
    /// Copying and re-batching the source graph.
    Cloning,
    /// Computing placements and gaps.
    GapInference,
    /// Emitting the fused graph.
    Rewriting,
}

impl FusionPhase {
    /// Get a human-readable name for this phase.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cloning => "cloning",
            Self::GapInference => "gap_inference",
            Self::Rewriting => "rewriting",
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Runs the pass with fixed options.
#[derive(Clone, Debug, Default)]
pub struct BatchFuser {
    options: FusionOptions,
}

impl BatchFuser {
    /// Fuser using `options`.
    #[must_use]
    pub fn new(options: FusionOptions) -> Self {
        Self { options }
    }

    /// The options this fuser runs with.
    #[must_use]
    pub fn options(&self) -> &FusionOptions {
        &self.options
    }

    /// Fuse the batch of `source` onto a canvas.
    ///
    /// The source graph is not modified.
    #[instrument(skip_all, fields(tensors = source.num_tensors(), ops = source.num_ops()))]
    pub fn fuse(&self, source: &Graph) -> FusionResult<FusedGraph> {
        let mut ctx = FusionContext::new(source, &self.options)?;
        info!(
            tiles = ctx.grid.count(),
            grid = ?ctx.grid.factors(),
            "starting batch fusion"
        );

        for phase in [FusionPhase::Cloning, FusionPhase::GapInference, FusionPhase::Rewriting] {
            debug!(phase = phase.name(), "phase start");
            match phase {
                FusionPhase::Cloning => GraphCloner::new(&mut ctx).run()?,
                FusionPhase::GapInference => GapInferenceEngine::new(&mut ctx).run()?,
                FusionPhase::Rewriting => rewrite_graph(&mut ctx)?,
            }
        }

        let fused = FusedGraph::collect(ctx)?;
        info!(
            fused_ops = fused.report.counters.fused_ops,
            batched_ops = fused.report.counters.batched_ops,
            adapters = fused.report.adapters(),
            warnings = fused.report.warnings.len(),
            complete = fused.is_complete(),
            "batch fusion complete"
        );
        Ok(fused)
    }
}

/// Fuse `source` with `tile_count` samples and default options.
pub fn batch_fuse(source: &Graph, tile_count: usize) -> FusionResult<FusedGraph> {
    BatchFuser::new(FusionOptions::default().with_tile_count(tile_count)).fuse(source)
}

/// Emit every cloned operation into the fused graph, in the order its
/// inputs become available.
#[instrument(skip_all)]
fn rewrite_graph(ctx: &mut FusionContext<'_>) -> FusionResult<()> {
    ctx.reset_visited();
    let mut queue = VecDeque::new();

    let seeds: Vec<TensorId> = ctx
        .cloned
        .inputs()
        .iter()
        .copied()
        .chain(ctx.cloned.constants())
        .collect();
    for t in seeds {
        let tensor = ctx.cloned.tensor(t);
        let (spec, data, name) = (tensor.spec.clone(), tensor.data.clone(), tensor.name.clone());
        let fused = match data {
            Some(data) => ctx.fused.create_constant(spec, data)?,
            None => ctx.fused.create_tensor(spec),
        };
        if let Some(name) = name {
            ctx.fused.set_name(fused, name)?;
        }
        ctx.insert_fused(t, fused)?;
        ctx.record_proportion(fused, 1.0)?;
        queue.push_back(t);
    }

    while let Some(t) = queue.pop_front() {
        let consumers = ctx.cloned.consumers(t).to_vec();
        for op in consumers {
            let ready = ctx
                .cloned
                .op(op)
                .inputs
                .iter()
                .all(|&x| ctx.try_fused_of(x).is_some());
            if ready && ctx.visit(op) {
                ops::rewrite(ctx, op)?;
                queue.push_back(ctx.cloned.op(op).output());
            }
        }
    }
    debug!(
        fused_ops = ctx.counters.fused_ops,
        batched_ops = ctx.counters.batched_ops,
        "rewrite complete"
    );
    Ok(())
}

// ============================================================================
// Result
// ============================================================================

/// Where one source tensor ended up.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TensorFusion {
    /// Batched or canvas.
    pub placement: Placement,
    /// Inferred gap per grid dimension.
    pub gap: [usize; 2],
    /// Shape of the tensor on the canvas, or its batched shape.
    pub canvas_shape: Shape,
    /// Fused tensor in its natural placement.
    pub fused: Option<TensorId>,
    /// Batched copy of a canvas tensor, if one was needed.
    pub defused: Option<TensorId>,
    /// Share of the natural form's spatial extent that holds sample data.
    pub proportion: Option<f64>,
}

/// Output of the pass.
#[derive(Clone, Debug)]
pub struct FusedGraph {
    /// The rewritten graph.
    pub graph: Graph,
    /// Source graph inputs and outputs to their fused counterparts.
    pub io_map: FxHashMap<TensorId, TensorId>,
    /// What the pass did.
    pub report: FusionReport,
    info: FxHashMap<TensorId, TensorFusion>,
    missing: Vec<TensorId>,
}

impl FusedGraph {
    fn collect(mut ctx: FusionContext<'_>) -> FusionResult<Self> {
        let source = ctx.source;
        let mut io_map = FxHashMap::default();
        let mut missing = Vec::new();

        for &input in source.inputs() {
            let cloned = ctx.cloned_of(input)?;
            io_map.insert(input, ctx.fused_of(cloned)?);
        }
        for &output in source.outputs() {
            let Some(cloned) = ctx.try_cloned_of(output) else {
                missing.push(output);
                continue;
            };
            let fused = match ctx.defused_of(cloned) {
                Some(batched) => Some(batched),
                None if !ctx.is_canvas(cloned) => ctx.try_fused_of(cloned),
                None => None,
            };
            if let Some(fused) = fused {
                if let Some(name) = &source.tensor(output).name {
                    ctx.fused.set_name(fused, name.clone())?;
                }
                io_map.insert(output, fused);
            } else {
                missing.push(output);
            }
        }

        let mut info = FxHashMap::default();
        for (id, _) in source.tensors() {
            let Some(cloned) = ctx.try_cloned_of(id) else {
                continue;
            };
            let (Some(placement), Ok(gap)) = (ctx.try_placement(cloned), ctx.gap(cloned)) else {
                continue;
            };
            let fused = ctx.try_fused_of(cloned);
            info.insert(
                id,
                TensorFusion {
                    placement,
                    gap,
                    canvas_shape: ctx.gap_infer_shape(cloned)?.clone(),
                    fused,
                    defused: ctx.defused_of(cloned),
                    proportion: fused.and_then(|t| ctx.proportion(t)),
                },
            );
        }

        let report = FusionReport {
            tile_count: ctx.grid.count(),
            tiles: ctx.grid.factors(),
            counters: ctx.counters,
            warnings: std::mem::take(&mut ctx.warnings),
        };
        Ok(Self {
            graph: ctx.fused,
            io_map,
            report,
            info,
            missing,
        })
    }

    /// Whether every source output has a fused counterpart.
    ///
    /// Outputs downstream of an unsupported operator are missing.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// Source outputs without a fused counterpart.
    #[must_use]
    pub fn missing_outputs(&self) -> &[TensorId] {
        &self.missing
    }

    /// Inferred gap of a source tensor.
    #[must_use]
    pub fn gap(&self, source: TensorId) -> Option<[usize; 2]> {
        self.info.get(&source).map(|t| t.gap)
    }

    /// Fusion details of a source tensor that was cloned.
    #[must_use]
    pub fn tensor_info(&self, source: TensorId) -> Option<&TensorFusion> {
        self.info.get(&source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quilt_graph::{ActivationKind, DType, OpKind, TensorAttr, TensorSpec};

    fn relu_graph(batch: usize) -> (Graph, TensorId, TensorId) {
        let mut g = Graph::new();
        let x = g.create_tensor(TensorSpec::new(DType::F32, [batch, 2, 4, 4], TensorAttr::Input));
        g.set_name(x, "x").unwrap();
        let relu = OpKind::Activation {
            func: ActivationKind::Relu,
        };
        let y = g.emit(relu, &[x], TensorAttr::Output).unwrap();
        g.set_name(y, "y").unwrap();
        (g, x, y)
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(FusionPhase::Cloning.name(), "cloning");
        assert_eq!(FusionPhase::GapInference.name(), "gap_inference");
        assert_eq!(FusionPhase::Rewriting.name(), "rewriting");
    }

    #[test]
    fn test_io_map_covers_inputs_and_outputs() {
        let (g, x, y) = relu_graph(4);
        let fused = batch_fuse(&g, 4).unwrap();
        assert!(fused.is_complete());

        let fx = fused.io_map[&x];
        let fy = fused.io_map[&y];
        assert_eq!(fused.graph.inputs(), &[fx]);
        assert_eq!(fused.graph.outputs(), &[fy]);
        assert_eq!(fused.graph.tensor(fy).name.as_deref(), Some("y"));
        assert_eq!(fused.graph.shape(fy), &Shape::from([4, 2, 4, 4]));
    }

    #[test]
    fn test_relu_on_batched_input_stays_batched() {
        // Activations follow their input; a graph input is batched.
        let (g, _, y) = relu_graph(4);
        let fused = batch_fuse(&g, 4).unwrap();
        let info = fused.tensor_info(y).unwrap();
        assert_eq!(info.placement, Placement::Batched);
        assert_eq!(info.proportion, Some(1.0));
        assert_eq!(fused.report.counters.batched_ops, 1);
        assert_eq!(fused.report.adapters(), 0);
    }

    #[test]
    fn test_single_sample_is_identity() {
        let (g, x, _) = relu_graph(1);
        let fused = BatchFuser::default().fuse(&g).unwrap();
        assert_eq!(fused.report.tile_count, 1);
        assert_eq!(fused.report.tiles, [1, 1]);
        assert_eq!(fused.graph.num_ops(), g.num_ops());
        assert_eq!(fused.gap(x), Some([0, 0]));
    }
}
