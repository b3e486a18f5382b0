//! Gap inference.
//!
//! A forward worklist visits operations once all their inputs are placed.
//! The first visit decides the operation's plan; every visit pushes gaps
//! through its rules. When an operation needs more gap than an input
//! carries, a backward walk raises that input and, through the producers'
//! backward rules, everything upstream of it until it reaches batched
//! tensors, which can take any gap when they are tiled.
//!
//! ```text
//!   inputs, constants ──► forward queue ──► visit(op) ──► output gap
//!                              ▲                │
//!                              │           need > gap?
//!                              │                ▼
//!                              └──────── backward raise
//! ```

use std::collections::VecDeque;

use quilt_graph::{OpId, TensorId};
use smallvec::SmallVec;
use tracing::{debug, instrument};

use crate::context::{FusionContext, Placement};
use crate::ops::{self, FusedPlan, Plan};
use crate::{FusionError, FusionResult};

/// Computes every cloned tensor's placement, gap and canvas shape.
pub struct GapInferenceEngine<'a, 's> {
    ctx: &'a mut FusionContext<'s>,
    queue: VecDeque<TensorId>,
}

impl<'a, 's> GapInferenceEngine<'a, 's> {
    /// Engine over `ctx`, which must hold the cloned graph.
    pub fn new(ctx: &'a mut FusionContext<'s>) -> Self {
        Self {
            ctx,
            queue: VecDeque::new(),
        }
    }

    /// Run to the fixpoint.
    #[instrument(skip_all, fields(tiles = ?self.ctx.grid.factors()))]
    pub fn run(mut self) -> FusionResult<()> {
        let seeds: Vec<TensorId> = self
            .ctx
            .cloned
            .inputs()
            .iter()
            .copied()
            .chain(self.ctx.cloned.constants())
            .collect();
        let config = self.ctx.axes.axis_map();
        for t in seeds {
            let map = (self.ctx.cloned.shape(t).rank() == 4).then_some(config);
            self.ctx.set_axis_map(t, map)?;
            self.ctx.set_placement(t, Placement::Batched)?;
            self.ctx.merge_gap(t, [0, 0]);
            self.queue.push_back(t);
        }

        while let Some(t) = self.queue.pop_front() {
            let consumers = self.ctx.cloned.consumers(t).to_vec();
            for op in consumers {
                if self.is_ready(op) {
                    self.visit(op)?;
                }
            }
        }
        debug!(
            backward_passes = self.ctx.counters.backward_passes,
            visits = self.ctx.counters.forward_visits,
            "gap inference converged"
        );
        Ok(())
    }

    fn is_ready(&self, op: OpId) -> bool {
        self.ctx
            .cloned
            .op(op)
            .inputs
            .iter()
            .all(|&t| self.ctx.try_placement(t).is_some())
    }

    fn visit(&mut self, op_id: OpId) -> FusionResult<()> {
        self.ctx.counters.forward_visits += 1;
        let op = self.ctx.cloned.try_op(op_id)?.clone();
        let y = op.output();

        let first = self.ctx.try_plan(op_id).is_none();
        if first {
            let map = ops::output_axis_map(self.ctx, &op);
            self.ctx.set_axis_map(y, map)?;
            let plan = ops::plan(self.ctx, op_id, &op)?;
            let placement = if plan.is_fused() {
                Placement::Canvas
            } else {
                Placement::Batched
            };
            self.ctx.set_placement(y, placement)?;
            self.ctx.insert_plan(op_id, plan)?;
        }

        let out_gap = match self.ctx.plan(op_id)?.clone() {
            Plan::Batched => [0, 0],
            Plan::Fused(plan) => self.forward_step(&op.inputs, y, &plan)?,
        };
        let changed = self.ctx.merge_gap(y, out_gap);
        if first || changed {
            debug!(tensor = ?y, gap = ?self.ctx.gap(y)?, "forward");
            self.queue.push_back(y);
        }
        Ok(())
    }

    /// Reconcile the gaps around one fused operation and return its output
    /// gap. Inputs whose gap is too small are raised.
    fn forward_step(&mut self, inputs: &[TensorId], y: TensorId, plan: &FusedPlan) -> FusionResult<[usize; 2]> {
        let gapped: SmallVec<[TensorId; 3]> = plan.gapped.iter().map(|&i| inputs[i]).collect();
        let current = self.ctx.gap(y).ok();

        let mut need = [0; 2];
        for f in 0..2 {
            if !self.ctx.grid.is_tiled(f) {
                continue;
            }
            let rule = plan.rules[f];
            for &x in &gapped {
                need[f] = need[f].max(rule.admissible(self.ctx.gap(x)?[f]));
            }
            if let Some(current) = current {
                if rule.forward(need[f]) < current[f] {
                    need[f] = rule.backward(current[f]);
                }
            }
        }

        let mut raised = false;
        for &x in &gapped {
            let gap = self.ctx.gap(x)?;
            if gap[0] < need[0] || gap[1] < need[1] {
                if !raised {
                    raised = true;
                    self.count_backward_pass()?;
                }
                self.raise(x, need)?;
            }
        }

        let mut out = [0; 2];
        for f in 0..2 {
            if self.ctx.grid.is_tiled(f) {
                out[f] = plan.rules[f].forward(need[f]);
            }
        }
        Ok(out)
    }

    fn count_backward_pass(&mut self) -> FusionResult<()> {
        self.ctx.counters.backward_passes += 1;
        let limit = self.ctx.max_backward_passes;
        if self.ctx.counters.backward_passes > limit {
            return Err(FusionError::FixpointDiverged { limit });
        }
        Ok(())
    }

    /// Raise `start` to at least `gap`, walking producers of canvas tensors
    /// upstream. Every tensor that changes is re-queued.
    fn raise(&mut self, start: TensorId, gap: [usize; 2]) -> FusionResult<()> {
        let mut stack = vec![(start, gap)];
        while let Some((t, gap)) = stack.pop() {
            if !self.ctx.merge_gap(t, gap) {
                continue;
            }
            let merged = self.ctx.gap(t)?;
            debug!(tensor = ?t, gap = ?merged, "backward");
            self.queue.push_back(t);
            if self.ctx.placement(t)? == Placement::Batched {
                continue;
            }
            let producer = self
                .ctx
                .cloned
                .producer(t)
                .ok_or_else(|| FusionError::missing_tensor("producer", t))?;
            let Plan::Fused(plan) = self.ctx.plan(producer)?.clone() else {
                continue;
            };
            let want = [plan.rules[0].backward(merged[0]), plan.rules[1].backward(merged[1])];
            let inputs = &self.ctx.cloned.op(producer).inputs;
            stack.extend(plan.gapped.iter().map(|&i| (inputs[i], want)));
        }
        Ok(())
    }
}
