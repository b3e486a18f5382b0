//! Shared state of one run of the pass.
//!
//! Three graphs are alive at once: the caller's source graph (read only),
//! the cloned working copy that gap inference annotates, and the fused
//! graph the rewrite builds. Tables keyed by cloned tensors link them.

use quilt_graph::{Graph, OpId, Shape, TensorId};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

use crate::axes::AxisMap;
use crate::ops::Plan;
use crate::tiling::{GapFill, TileGrid};
use crate::{FusionAxisConfig, FusionError, FusionOptions, FusionResult, FusionWarning};

/// Where a tensor's data lives in the fused graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// One sample per batch index, as in the source graph.
    Batched,
    /// All samples tiled onto one canvas.
    Canvas,
}

/// Counters reported at the end of the pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    /// Backward walks triggered during gap inference.
    pub backward_passes: usize,
    /// Operator visits during gap inference.
    pub forward_visits: usize,
    /// Operators rewritten onto the canvas.
    pub fused_ops: usize,
    /// Operators rewritten with their original batched semantics.
    pub batched_ops: usize,
    /// Tiling adapters inserted.
    pub tile_adapters: usize,
    /// De-fuse adapters inserted.
    pub defuse_adapters: usize,
    /// Masking adapters inserted.
    pub masks: usize,
}

/// Insert into a write-once table.
fn insert_once<K, V>(
    table: &mut FxHashMap<K, V>,
    name: &'static str,
    key: K,
    value: V,
) -> FusionResult<()>
where
    K: Copy + Eq + std::hash::Hash + std::fmt::Debug,
{
    if table.contains_key(&key) {
        return Err(FusionError::DuplicateEntry {
            table: name,
            key: format!("{key:?}"),
        });
    }
    table.insert(key, value);
    Ok(())
}

/// Mutable state threaded through cloning, gap inference and rewriting.
pub struct FusionContext<'s> {
    /// The caller's graph.
    pub source: &'s Graph,
    /// Working copy, re-batched to the tile count.
    pub cloned: Graph,
    /// The graph being built.
    pub fused: Graph,
    /// Axis roles of graph inputs.
    pub axes: FusionAxisConfig,
    /// Sample arrangement.
    pub grid: TileGrid,
    /// Backward-pass cap.
    pub max_backward_passes: usize,
    /// Soft failures so far.
    pub warnings: Vec<FusionWarning>,
    /// Counters so far.
    pub counters: Counters,

    clone_tensor_map: FxHashMap<TensorId, TensorId>,
    tensor_map: FxHashMap<TensorId, TensorId>,
    forward_gap: FxHashMap<TensorId, [usize; 2]>,
    gap_infer_shape: FxHashMap<TensorId, Shape>,
    proportion: FxHashMap<TensorId, f64>,
    placement: FxHashMap<TensorId, Placement>,
    axis_maps: FxHashMap<TensorId, AxisMap>,
    plans: FxHashMap<OpId, Plan>,
    fill: FxHashMap<TensorId, GapFill>,
    tiled: FxHashMap<TensorId, TensorId>,
    defused: FxHashMap<TensorId, TensorId>,
    masked: FxHashMap<TensorId, TensorId>,
    visited: FxHashSet<OpId>,
}

impl<'s> FusionContext<'s> {
    /// Fresh context for `source`.
    ///
    /// The tile count is the requested one, or else the batch extent of the
    /// first rank-4 graph input.
    pub fn new(source: &'s Graph, options: &FusionOptions) -> FusionResult<Self> {
        options.validate()?;
        let count = options.tile_count.unwrap_or_else(|| source_batch(source, &options.axes));
        Ok(Self {
            source,
            cloned: Graph::new(),
            fused: Graph::new(),
            axes: options.axes,
            grid: TileGrid::new(count),
            max_backward_passes: options.max_backward_passes,
            warnings: Vec::new(),
            counters: Counters::default(),
            clone_tensor_map: FxHashMap::default(),
            tensor_map: FxHashMap::default(),
            forward_gap: FxHashMap::default(),
            gap_infer_shape: FxHashMap::default(),
            proportion: FxHashMap::default(),
            placement: FxHashMap::default(),
            axis_maps: FxHashMap::default(),
            plans: FxHashMap::default(),
            fill: FxHashMap::default(),
            tiled: FxHashMap::default(),
            defused: FxHashMap::default(),
            masked: FxHashMap::default(),
            visited: FxHashSet::default(),
        })
    }

    /// Whether any operator can go onto a canvas.
    #[must_use]
    pub fn fusion_enabled(&self) -> bool {
        self.grid.count() > 1
    }

    // ----- source -> cloned -----

    pub(crate) fn insert_clone(&mut self, source: TensorId, cloned: TensorId) -> FusionResult<()> {
        insert_once(&mut self.clone_tensor_map, "clone_tensor", source, cloned)
    }

    /// Clone of a source tensor, if it was cloned.
    #[must_use]
    pub fn try_cloned_of(&self, source: TensorId) -> Option<TensorId> {
        self.clone_tensor_map.get(&source).copied()
    }

    pub(crate) fn cloned_of(&self, source: TensorId) -> FusionResult<TensorId> {
        self.try_cloned_of(source)
            .ok_or_else(|| FusionError::missing_tensor("clone_tensor", source))
    }

    // ----- cloned -> fused -----

    pub(crate) fn insert_fused(&mut self, cloned: TensorId, fused: TensorId) -> FusionResult<()> {
        insert_once(&mut self.tensor_map, "tensor", cloned, fused)
    }

    /// Fused tensor holding a cloned tensor in its natural placement.
    #[must_use]
    pub fn try_fused_of(&self, cloned: TensorId) -> Option<TensorId> {
        self.tensor_map.get(&cloned).copied()
    }

    pub(crate) fn fused_of(&self, cloned: TensorId) -> FusionResult<TensorId> {
        self.try_fused_of(cloned)
            .ok_or_else(|| FusionError::missing_tensor("tensor", cloned))
    }

    // ----- adapter caches -----

    pub(crate) fn tiled_of(&self, cloned: TensorId) -> Option<TensorId> {
        self.tiled.get(&cloned).copied()
    }

    pub(crate) fn insert_tiled(&mut self, cloned: TensorId, fused: TensorId) -> FusionResult<()> {
        insert_once(&mut self.tiled, "tiled", cloned, fused)
    }

    /// De-fused form of a canvas tensor, once the rewrite has built it.
    #[must_use]
    pub fn defused_of(&self, cloned: TensorId) -> Option<TensorId> {
        self.defused.get(&cloned).copied()
    }

    pub(crate) fn insert_defused(&mut self, cloned: TensorId, fused: TensorId) -> FusionResult<()> {
        insert_once(&mut self.defused, "defused", cloned, fused)
    }

    pub(crate) fn masked_of(&self, cloned: TensorId) -> Option<TensorId> {
        self.masked.get(&cloned).copied()
    }

    pub(crate) fn insert_masked(&mut self, cloned: TensorId, fused: TensorId) -> FusionResult<()> {
        insert_once(&mut self.masked, "masked", cloned, fused)
    }

    // ----- gaps and shapes -----

    /// Current gap of a cloned tensor.
    pub fn gap(&self, cloned: TensorId) -> FusionResult<[usize; 2]> {
        self.forward_gap
            .get(&cloned)
            .copied()
            .ok_or_else(|| FusionError::missing_tensor("forward_gap", cloned))
    }

    /// Raise the gap of `cloned` to at least `gap`, refreshing its
    /// gap-inferred shape. Returns whether anything changed.
    pub(crate) fn merge_gap(&mut self, cloned: TensorId, gap: [usize; 2]) -> bool {
        let old = self.forward_gap.get(&cloned).copied();
        let merged = match old {
            Some(old) => [old[0].max(gap[0]), old[1].max(gap[1])],
            None => gap,
        };
        if old == Some(merged) {
            return false;
        }
        self.forward_gap.insert(cloned, merged);
        let shape = self.canvas_shape(cloned, merged);
        self.gap_infer_shape.insert(cloned, shape);
        true
    }

    /// Gap-inferred shape of a cloned tensor: its canvas shape if it is, or
    /// could be tiled onto, a canvas; its cloned shape otherwise.
    pub fn gap_infer_shape(&self, cloned: TensorId) -> FusionResult<&Shape> {
        self.gap_infer_shape
            .get(&cloned)
            .ok_or_else(|| FusionError::missing_tensor("gap_infer_shape", cloned))
    }

    /// Shape of `cloned` on a canvas with `gap`.
    #[must_use]
    pub fn canvas_shape(&self, cloned: TensorId, gap: [usize; 2]) -> Shape {
        let shape = self.cloned.shape(cloned);
        let Some(map) = self.axis_map(cloned) else {
            return shape.clone();
        };
        if shape[map.batch] != self.grid.count() {
            return shape.clone();
        }
        let mut canvas = shape.with_dim(map.batch, 1);
        for f in 0..2 {
            let extent = self.grid.canvas_extent(f, shape[map.fuse[f]], gap[f]);
            canvas = canvas.with_dim(map.fuse[f], extent);
        }
        canvas
    }

    pub(crate) fn record_proportion(&mut self, fused: TensorId, value: f64) -> FusionResult<()> {
        insert_once(&mut self.proportion, "proportion", fused, value)
    }

    /// Share of a fused tensor's spatial extent that holds sample data.
    #[must_use]
    pub fn proportion(&self, fused: TensorId) -> Option<f64> {
        self.proportion.get(&fused).copied()
    }

    /// Proportion of a cloned tensor placed on a canvas with its current gap.
    pub(crate) fn canvas_proportion(&self, cloned: TensorId) -> FusionResult<f64> {
        let gap = self.gap(cloned)?;
        let map = self
            .axis_map(cloned)
            .ok_or_else(|| FusionError::missing_tensor("axis_map", cloned))?;
        let extent = map.sample_extent(self.cloned.shape(cloned));
        Ok(self.grid.proportion(extent, gap))
    }

    // ----- placement and layout -----

    pub(crate) fn set_placement(&mut self, cloned: TensorId, placement: Placement) -> FusionResult<()> {
        insert_once(&mut self.placement, "placement", cloned, placement)
    }

    /// Placement decided during gap inference.
    #[must_use]
    pub fn try_placement(&self, cloned: TensorId) -> Option<Placement> {
        self.placement.get(&cloned).copied()
    }

    pub(crate) fn placement(&self, cloned: TensorId) -> FusionResult<Placement> {
        self.try_placement(cloned)
            .ok_or_else(|| FusionError::missing_tensor("placement", cloned))
    }

    pub(crate) fn is_canvas(&self, cloned: TensorId) -> bool {
        self.try_placement(cloned) == Some(Placement::Canvas)
    }

    pub(crate) fn set_axis_map(&mut self, cloned: TensorId, map: Option<AxisMap>) -> FusionResult<()> {
        match map {
            Some(map) => insert_once(&mut self.axis_maps, "axis_map", cloned, map),
            None => Ok(()),
        }
    }

    /// Axis roles of a rank-4 cloned tensor.
    #[must_use]
    pub fn axis_map(&self, cloned: TensorId) -> Option<AxisMap> {
        self.axis_maps.get(&cloned).copied()
    }

    /// Whether a batched tensor can be tiled onto a canvas.
    #[must_use]
    pub fn is_tileable(&self, cloned: TensorId) -> bool {
        self.fusion_enabled()
            && self.try_placement(cloned) == Some(Placement::Batched)
            && self
                .axis_map(cloned)
                .is_some_and(|map| self.cloned.shape(cloned)[map.batch] == self.grid.count())
    }

    // ----- plans and fill -----

    pub(crate) fn insert_plan(&mut self, op: OpId, plan: Plan) -> FusionResult<()> {
        insert_once(&mut self.plans, "plan", op, plan)
    }

    pub(crate) fn try_plan(&self, op: OpId) -> Option<&Plan> {
        self.plans.get(&op)
    }

    pub(crate) fn plan(&self, op: OpId) -> FusionResult<&Plan> {
        self.try_plan(op).ok_or_else(|| FusionError::missing_op("plan", op))
    }

    pub(crate) fn set_fill(&mut self, cloned: TensorId, fill: GapFill) -> FusionResult<()> {
        insert_once(&mut self.fill, "fill", cloned, fill)
    }

    pub(crate) fn fill(&self, cloned: TensorId) -> FusionResult<GapFill> {
        self.fill
            .get(&cloned)
            .copied()
            .ok_or_else(|| FusionError::missing_tensor("fill", cloned))
    }

    // ----- traversal -----

    /// Mark an operation visited. Returns `false` if it already was.
    pub(crate) fn visit(&mut self, op: OpId) -> bool {
        self.visited.insert(op)
    }

    pub(crate) fn reset_visited(&mut self) {
        self.visited.clear();
    }

    pub(crate) fn warn(&mut self, warning: FusionWarning) {
        tracing::warn!(%warning, "fusion warning");
        self.warnings.push(warning);
    }
}

/// Batch extent of the first rank-4 graph input, or 1.
fn source_batch(source: &Graph, axes: &FusionAxisConfig) -> usize {
    source
        .inputs()
        .iter()
        .map(|&t| source.shape(t))
        .find(|s| s.rank() == 4)
        .map_or(1, |s| s[axes.batch])
}

#[cfg(test)]
mod tests {
    use super::*;
    use quilt_graph::{DType, TensorAttr, TensorSpec};

    fn context(source: &Graph) -> FusionContext<'_> {
        FusionContext::new(source, &FusionOptions::default()).unwrap()
    }

    fn source() -> Graph {
        let mut g = Graph::new();
        g.create_tensor(TensorSpec::new(DType::F32, [4, 3, 8, 8], TensorAttr::Input));
        g
    }

    #[test]
    fn test_tile_count_from_first_input() {
        let g = source();
        let ctx = context(&g);
        assert_eq!(ctx.grid.count(), 4);
        assert_eq!(ctx.grid.factors(), [2, 2]);
        assert!(ctx.fusion_enabled());
    }

    #[test]
    fn test_write_once_tables() {
        let g = source();
        let mut ctx = context(&g);
        let x = g.inputs()[0];
        ctx.insert_clone(x, x).unwrap();
        assert!(matches!(
            ctx.insert_clone(x, x),
            Err(FusionError::DuplicateEntry { table: "clone_tensor", .. })
        ));
    }

    #[test]
    fn test_missing_lookup() {
        let g = source();
        let ctx = context(&g);
        let x = g.inputs()[0];
        assert!(matches!(
            ctx.gap(x),
            Err(FusionError::LookupViolation { table: "forward_gap", .. })
        ));
        assert!(ctx.fused_of(x).is_err());
    }

    #[test]
    fn test_merge_gap_is_monotone() {
        let g = source();
        let mut ctx = context(&g);
        let x = ctx
            .cloned
            .create_tensor(TensorSpec::new(DType::F32, [4, 3, 8, 8], TensorAttr::Input));
        let map = ctx.axes.axis_map();
        ctx.set_axis_map(x, Some(map)).unwrap();
        assert!(ctx.merge_gap(x, [0, 0]));
        assert!(ctx.merge_gap(x, [2, 1]));
        assert!(!ctx.merge_gap(x, [1, 1]));
        assert_eq!(ctx.gap(x).unwrap(), [2, 1]);
        assert_eq!(ctx.gap_infer_shape(x).unwrap(), &Shape::from([1, 3, 18, 17]));
    }
}
