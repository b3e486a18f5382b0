//! Cloning the source graph into the working copy.

use std::collections::VecDeque;

use quilt_graph::{OpId, OpKind, TensorAttr, TensorId};
use tracing::{debug, instrument};

use crate::context::FusionContext;
use crate::{FusionResult, FusionWarning};

/// Copies the source graph into [`FusionContext::cloned`], re-batching it to
/// the tile count.
///
/// Operators outside the supported set are left out, together with
/// everything that depends on them.
pub struct GraphCloner<'a, 's> {
    ctx: &'a mut FusionContext<'s>,
    /// Batch extent of the source graph.
    source_batch: Option<usize>,
}

impl<'a, 's> GraphCloner<'a, 's> {
    /// Cloner writing into `ctx`.
    pub fn new(ctx: &'a mut FusionContext<'s>) -> Self {
        let axes = ctx.axes;
        let source = ctx.source;
        let source_batch = source
            .inputs()
            .iter()
            .map(|&t| source.shape(t))
            .find(|s| s.rank() == 4)
            .map(|s| s[axes.batch]);
        Self { ctx, source_batch }
    }

    /// Clone every reachable supported operation.
    #[instrument(skip_all, fields(tiles = self.ctx.grid.count()))]
    pub fn run(mut self) -> FusionResult<()> {
        let source = self.ctx.source;
        let mut queue = VecDeque::new();

        for &input in source.inputs() {
            let spec = source.spec(input);
            let shape = if spec.shape.rank() == 4 {
                spec.shape.with_dim(self.ctx.axes.batch, self.ctx.grid.count())
            } else {
                spec.shape.clone()
            };
            let cloned = self.ctx.cloned.create_tensor(spec.with_shape(shape));
            self.copy_name(input, cloned)?;
            self.ctx.insert_clone(input, cloned)?;
            queue.push_back(input);
        }
        for constant in source.constants() {
            let tensor = source.tensor(constant);
            let data = tensor.data.clone().unwrap_or_default();
            let cloned = self.ctx.cloned.create_constant(tensor.spec.clone(), data)?;
            self.copy_name(constant, cloned)?;
            self.ctx.insert_clone(constant, cloned)?;
            queue.push_back(constant);
        }

        while let Some(tensor) = queue.pop_front() {
            for &op in source.consumers(tensor) {
                if let Some(out) = self.clone_op(op)? {
                    queue.push_back(out);
                }
            }
        }
        debug!(
            ops = self.ctx.cloned.num_ops(),
            skipped = self.ctx.warnings.len(),
            "cloned source graph"
        );
        Ok(())
    }

    /// Clone `op` if all its inputs are cloned and it was not seen before.
    /// Returns the source output to continue from.
    fn clone_op(&mut self, op_id: OpId) -> FusionResult<Option<TensorId>> {
        let source = self.ctx.source;
        let op = source.try_op(op_id)?;
        let Some(inputs) = op
            .inputs
            .iter()
            .map(|&t| self.ctx.try_cloned_of(t))
            .collect::<Option<Vec<_>>>()
        else {
            return Ok(None);
        };
        if !self.ctx.visit(op_id) {
            return Ok(None);
        }

        let kind = match &op.kind {
            OpKind::Slice { .. } | OpKind::Softmax { .. } => {
                self.ctx.warn(FusionWarning::UnsupportedOperator {
                    op: op_id,
                    kind: op.kind.name(),
                });
                return Ok(None);
            }
            OpKind::Reshape { shape } => OpKind::Reshape {
                shape: self.rebatch_target(shape),
            },
            other => other.clone(),
        };

        let out = op.output();
        let attr = match source.spec(out).attr {
            TensorAttr::Output => TensorAttr::Output,
            _ => TensorAttr::Transient,
        };
        let cloned = self.ctx.cloned.emit(kind, &inputs, attr)?;
        self.copy_name(out, cloned)?;
        self.ctx.insert_clone(out, cloned)?;
        Ok(Some(out))
    }

    /// Replace the batch entry of a reshape target when re-batching.
    fn rebatch_target(&self, target: &[usize]) -> Vec<usize> {
        let batch = self.ctx.axes.batch;
        let count = self.ctx.grid.count();
        let mut target = target.to_vec();
        if let (Some(old), Some(entry)) = (self.source_batch, target.get_mut(batch)) {
            if *entry == old {
                *entry = count;
            }
        }
        target
    }

    fn copy_name(&mut self, source: TensorId, cloned: TensorId) -> FusionResult<()> {
        if let Some(name) = &self.ctx.source.tensor(source).name {
            self.ctx.cloned.set_name(cloned, name.clone())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FusionOptions;
    use quilt_graph::{ActivationKind, DType, Graph, Idx, Shape, TensorSpec};

    fn relu() -> OpKind {
        OpKind::Activation {
            func: ActivationKind::Relu,
        }
    }

    #[test]
    fn test_clone_preserves_structure() {
        let mut g = Graph::new();
        let x = g.create_tensor(TensorSpec::new(DType::F32, [4, 3, 8, 8], TensorAttr::Input));
        let y = g.emit(relu(), &[x], TensorAttr::Output).unwrap();
        g.set_name(y, "y").unwrap();

        let mut ctx = FusionContext::new(&g, &FusionOptions::default()).unwrap();
        GraphCloner::new(&mut ctx).run().unwrap();

        assert_eq!(ctx.cloned.num_ops(), 1);
        let cy = ctx.try_cloned_of(y).unwrap();
        assert_eq!(ctx.cloned.shape(cy), &Shape::from([4, 3, 8, 8]));
        assert_eq!(ctx.cloned.tensor(cy).name.as_deref(), Some("y"));
        assert_eq!(ctx.cloned.outputs(), &[cy]);
    }

    #[test]
    fn test_rebatch_to_tile_count() {
        let mut g = Graph::new();
        let x = g.create_tensor(TensorSpec::new(DType::F32, [1, 2, 4, 4], TensorAttr::Input));
        let r = g
            .emit(
                OpKind::Reshape {
                    shape: vec![1, 32],
                },
                &[x],
                TensorAttr::Output,
            )
            .unwrap();

        let options = FusionOptions::default().with_tile_count(6);
        let mut ctx = FusionContext::new(&g, &options).unwrap();
        GraphCloner::new(&mut ctx).run().unwrap();

        let cx = ctx.try_cloned_of(x).unwrap();
        let cr = ctx.try_cloned_of(r).unwrap();
        assert_eq!(ctx.cloned.shape(cx), &Shape::from([6, 2, 4, 4]));
        assert_eq!(ctx.cloned.shape(cr), &Shape::from([6, 32]));
    }

    #[test]
    fn test_unsupported_operator_stops_cloning() {
        let mut g = Graph::new();
        let x = g.create_tensor(TensorSpec::new(DType::F32, [2, 3, 4, 4], TensorAttr::Input));
        let s = g
            .emit(OpKind::Softmax { axis: 1 }, &[x], TensorAttr::Transient)
            .unwrap();
        let y = g.emit(relu(), &[s], TensorAttr::Output).unwrap();
        let z = g.emit(relu(), &[x], TensorAttr::Output).unwrap();

        let mut ctx = FusionContext::new(&g, &FusionOptions::default()).unwrap();
        GraphCloner::new(&mut ctx).run().unwrap();

        assert!(ctx.try_cloned_of(s).is_none());
        assert!(ctx.try_cloned_of(y).is_none());
        assert!(ctx.try_cloned_of(z).is_some());
        assert_eq!(
            ctx.warnings,
            vec![FusionWarning::UnsupportedOperator {
                op: OpId::new(0),
                kind: "softmax",
            }]
        );
    }
}
