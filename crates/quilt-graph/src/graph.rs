//! Tensors, operations and the graph that owns them.

use std::collections::VecDeque;

use quilt_index::IndexVec;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{DType, GraphError, GraphResult, OpId, OpKind, Quantization, Shape, TensorId};

/// Role of a tensor within its graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorAttr {
    /// Fed by the caller.
    Input,
    /// Read back by the caller.
    Output,
    /// Carries data fixed at build time.
    Constant,
    /// Intermediate value.
    Transient,
}

/// Static description of a tensor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorSpec {
    /// Element type.
    pub dtype: DType,
    /// Shape.
    pub shape: Shape,
    /// Role in the graph.
    pub attr: TensorAttr,
    /// Quantization parameters, if quantized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quant: Option<Quantization>,
}

impl TensorSpec {
    /// Create an unquantized spec.
    pub fn new(dtype: DType, shape: impl Into<Shape>, attr: TensorAttr) -> Self {
        Self {
            dtype,
            shape: shape.into(),
            attr,
            quant: None,
        }
    }

    /// Attach quantization parameters.
    #[must_use]
    pub fn with_quant(mut self, quant: Quantization) -> Self {
        self.quant = Some(quant);
        self
    }

    /// The same spec with another attribute.
    #[must_use]
    pub fn with_attr(&self, attr: TensorAttr) -> Self {
        Self {
            attr,
            ..self.clone()
        }
    }

    /// The same spec with another shape.
    #[must_use]
    pub fn with_shape(&self, shape: Shape) -> Self {
        Self {
            shape,
            ..self.clone()
        }
    }

    /// Storage size in bytes.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.shape.num_elements() * self.dtype.size_bytes()
    }
}

/// A tensor node.
#[derive(Clone, Debug)]
pub struct Tensor {
    /// Optional human-readable name.
    pub name: Option<String>,
    /// Spec.
    pub spec: TensorSpec,
    /// Element bytes for constants.
    pub data: Option<Vec<u8>>,
    producer: Option<OpId>,
    consumers: Vec<OpId>,
}

impl Tensor {
    /// The operation producing this tensor, if any.
    #[must_use]
    pub fn producer(&self) -> Option<OpId> {
        self.producer
    }

    /// Operations reading this tensor, in binding order.
    #[must_use]
    pub fn consumers(&self) -> &[OpId] {
        &self.consumers
    }
}

/// An operation node.
#[derive(Clone, Debug)]
pub struct Operation {
    /// Kind and parameters.
    pub kind: OpKind,
    /// Ordered inputs.
    pub inputs: SmallVec<[TensorId; 3]>,
    /// Outputs. Every current kind has exactly one.
    pub outputs: SmallVec<[TensorId; 1]>,
}

impl Operation {
    /// The single output.
    #[must_use]
    pub fn output(&self) -> TensorId {
        self.outputs[0]
    }
}

/// A tensor dataflow graph.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    tensors: IndexVec<TensorId, Tensor>,
    ops: IndexVec<OpId, Operation>,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
}

impl Graph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tensor without data.
    ///
    /// Input and output tensors are registered as graph inputs/outputs in
    /// creation order.
    pub fn create_tensor(&mut self, spec: TensorSpec) -> TensorId {
        let attr = spec.attr;
        let id = self.tensors.push(Tensor {
            name: None,
            spec,
            data: None,
            producer: None,
            consumers: Vec::new(),
        });
        match attr {
            TensorAttr::Input => self.inputs.push(id),
            TensorAttr::Output => self.outputs.push(id),
            TensorAttr::Constant | TensorAttr::Transient => {}
        }
        id
    }

    /// Create a constant tensor holding `data` (little-endian element bytes).
    pub fn create_constant(&mut self, spec: TensorSpec, data: Vec<u8>) -> GraphResult<TensorId> {
        let spec = spec.with_attr(TensorAttr::Constant);
        if data.len() != spec.byte_size() {
            return Err(GraphError::DataSize {
                expected: spec.byte_size(),
                got: data.len(),
            });
        }
        let id = self.create_tensor(spec);
        self.tensors[id].data = Some(data);
        Ok(id)
    }

    /// Create a constant from `f32` values encoded as `dtype`.
    pub fn create_constant_values(
        &mut self,
        dtype: DType,
        shape: impl Into<Shape>,
        values: &[f32],
    ) -> GraphResult<TensorId> {
        let spec = TensorSpec::new(dtype, shape, TensorAttr::Constant);
        self.create_constant(spec, dtype.encode(values))
    }

    /// Give a tensor a name.
    pub fn set_name(&mut self, id: TensorId, name: impl Into<String>) -> GraphResult<()> {
        self.tensor_mut(id)?.name = Some(name.into());
        Ok(())
    }

    /// Mark a tensor as a graph output.
    pub fn set_output(&mut self, id: TensorId) -> GraphResult<()> {
        let tensor = self.tensor_mut(id)?;
        match tensor.spec.attr {
            TensorAttr::Input | TensorAttr::Constant => return Err(GraphError::NotWritable(id)),
            TensorAttr::Output => return Ok(()),
            TensorAttr::Transient => tensor.spec.attr = TensorAttr::Output,
        }
        self.outputs.push(id);
        Ok(())
    }

    /// Bind an operation to existing tensors.
    ///
    /// The output tensor must be unproduced, and its shape must match what
    /// [`OpKind::infer_shape`] computes for the inputs.
    pub fn add_op(
        &mut self,
        kind: OpKind,
        inputs: &[TensorId],
        outputs: &[TensorId],
    ) -> GraphResult<OpId> {
        if outputs.len() != 1 {
            return Err(crate::invalid(
                kind.name(),
                format!("expected one output, got {}", outputs.len()),
            ));
        }
        let out = outputs[0];
        let inferred = self.infer_output_shape(&kind, inputs)?;
        let target = self.try_tensor(out)?;
        match target.spec.attr {
            TensorAttr::Input | TensorAttr::Constant => return Err(GraphError::NotWritable(out)),
            TensorAttr::Output | TensorAttr::Transient => {}
        }
        if target.producer.is_some() {
            return Err(GraphError::AlreadyProduced(out));
        }
        if target.spec.shape != inferred {
            return Err(GraphError::ShapeMismatch {
                op: kind.name(),
                expected: inferred,
                got: target.spec.shape.clone(),
            });
        }

        let id = self.ops.next_index();
        for &input in inputs {
            let consumers = &mut self.tensors[input].consumers;
            if !consumers.contains(&id) {
                consumers.push(id);
            }
        }
        self.tensors[out].producer = Some(id);
        self.ops.push(Operation {
            kind,
            inputs: inputs.iter().copied().collect(),
            outputs: outputs.iter().copied().collect(),
        });
        Ok(id)
    }

    /// Create the output tensor by shape inference and bind the operation.
    ///
    /// The output inherits dtype and quantization from the first input.
    pub fn emit(
        &mut self,
        kind: OpKind,
        inputs: &[TensorId],
        attr: TensorAttr,
    ) -> GraphResult<TensorId> {
        let shape = self.infer_output_shape(&kind, inputs)?;
        let first = &self.try_tensor(inputs[0])?.spec;
        let spec = TensorSpec {
            dtype: first.dtype,
            shape,
            attr,
            quant: first.quant,
        };
        let out = self.create_tensor(spec);
        self.add_op(kind, inputs, &[out])?;
        Ok(out)
    }

    /// Run shape inference for `kind` over existing tensors.
    pub fn infer_output_shape(&self, kind: &OpKind, inputs: &[TensorId]) -> GraphResult<Shape> {
        if inputs.is_empty() {
            return Err(crate::invalid(kind.name(), "operation has no inputs"));
        }
        let shapes = inputs
            .iter()
            .map(|&t| self.try_tensor(t).map(|t| &t.spec.shape))
            .collect::<GraphResult<SmallVec<[&Shape; 3]>>>()?;
        kind.infer_shape(&shapes)
    }

    /// Get a tensor.
    ///
    /// # Panics
    ///
    /// Panics if `id` belongs to another graph.
    #[must_use]
    pub fn tensor(&self, id: TensorId) -> &Tensor {
        &self.tensors[id]
    }

    /// Get a tensor, or an error if `id` is unknown.
    pub fn try_tensor(&self, id: TensorId) -> GraphResult<&Tensor> {
        self.tensors.get(id).ok_or(GraphError::UnknownTensor(id))
    }

    fn tensor_mut(&mut self, id: TensorId) -> GraphResult<&mut Tensor> {
        self.tensors.get_mut(id).ok_or(GraphError::UnknownTensor(id))
    }

    /// Get an operation.
    ///
    /// # Panics
    ///
    /// Panics if `id` belongs to another graph.
    #[must_use]
    pub fn op(&self, id: OpId) -> &Operation {
        &self.ops[id]
    }

    /// Get an operation, or an error if `id` is unknown.
    pub fn try_op(&self, id: OpId) -> GraphResult<&Operation> {
        self.ops.get(id).ok_or(GraphError::UnknownOp(id))
    }

    /// Spec of a tensor.
    #[must_use]
    pub fn spec(&self, id: TensorId) -> &TensorSpec {
        &self.tensors[id].spec
    }

    /// Shape of a tensor.
    #[must_use]
    pub fn shape(&self, id: TensorId) -> &Shape {
        &self.tensors[id].spec.shape
    }

    /// The producer of a tensor, if any.
    #[must_use]
    pub fn producer(&self, id: TensorId) -> Option<OpId> {
        self.tensors.get(id).and_then(Tensor::producer)
    }

    /// The consumers of a tensor.
    #[must_use]
    pub fn consumers(&self, id: TensorId) -> &[OpId] {
        self.tensors.get(id).map_or(&[][..], Tensor::consumers)
    }

    /// Graph inputs in creation order.
    #[must_use]
    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    /// Graph outputs in creation order.
    #[must_use]
    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    /// Constant tensors in creation order.
    pub fn constants(&self) -> impl Iterator<Item = TensorId> + '_ {
        self.tensors
            .iter_enumerated()
            .filter(|(_, t)| t.spec.attr == TensorAttr::Constant)
            .map(|(id, _)| id)
    }

    /// All tensors with their handles.
    pub fn tensors(&self) -> impl Iterator<Item = (TensorId, &Tensor)> {
        self.tensors.iter_enumerated()
    }

    /// All operations with their handles, in binding order.
    pub fn ops(&self) -> impl Iterator<Item = (OpId, &Operation)> {
        self.ops.iter_enumerated()
    }

    /// Number of tensors.
    #[must_use]
    pub fn num_tensors(&self) -> usize {
        self.tensors.len()
    }

    /// Number of operations.
    #[must_use]
    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    /// Operations in dependency order.
    ///
    /// Operations on a cycle, or downstream of a tensor that is neither
    /// produced nor an input or constant, are left out.
    #[must_use]
    pub fn topological_order(&self) -> Vec<OpId> {
        let mut pending: IndexVec<OpId, usize> = self
            .ops
            .iter()
            .map(|op| {
                op.inputs
                    .iter()
                    .filter(|&&t| self.tensors[t].producer.is_some())
                    .count()
            })
            .collect();
        let mut queue: VecDeque<OpId> = pending
            .iter_enumerated()
            .filter(|(_, &n)| n == 0)
            .map(|(id, _)| id)
            .collect();
        let mut order = Vec::with_capacity(self.ops.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for &out in &self.ops[id].outputs {
                for &consumer in &self.tensors[out].consumers {
                    let inputs = &self.ops[consumer].inputs;
                    // An input listed twice still decrements once per slot.
                    let hits = inputs.iter().filter(|&&t| t == out).count();
                    pending[consumer] -= hits;
                    if pending[consumer] == 0 {
                        queue.push_back(consumer);
                    }
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActivationKind, BinaryKind, Conv2dParams, Idx};

    fn input(g: &mut Graph, shape: [usize; 4]) -> TensorId {
        g.create_tensor(TensorSpec::new(DType::F32, shape, TensorAttr::Input))
    }

    #[test]
    fn test_emit_tracks_edges() {
        let mut g = Graph::new();
        let x = input(&mut g, [2, 3, 4, 4]);
        let y = g
            .emit(
                OpKind::Activation {
                    func: ActivationKind::Relu,
                },
                &[x],
                TensorAttr::Transient,
            )
            .unwrap();
        let z = g
            .emit(OpKind::Binary { kind: BinaryKind::Add }, &[x, y], TensorAttr::Output)
            .unwrap();

        assert_eq!(g.consumers(x).len(), 2);
        assert_eq!(g.producer(z), Some(OpId::new(1)));
        assert_eq!(g.outputs(), &[z]);
        assert_eq!(g.shape(z), &Shape::from([2, 3, 4, 4]));
        assert_eq!(g.topological_order(), vec![OpId::new(0), OpId::new(1)]);
    }

    #[test]
    fn test_add_op_rejects_wrong_shape() {
        let mut g = Graph::new();
        let x = input(&mut g, [1, 3, 8, 8]);
        let w = g
            .create_constant_values(DType::F32, [4, 3, 3, 3], &[0.0; 108])
            .unwrap();
        let out = g.create_tensor(TensorSpec::new(DType::F32, [1, 4, 8, 8], TensorAttr::Output));
        let err = g
            .add_op(OpKind::Conv2d(Conv2dParams::default()), &[x, w], &[out])
            .unwrap_err();
        assert!(matches!(err, GraphError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_cannot_produce_twice() {
        let mut g = Graph::new();
        let x = input(&mut g, [1, 1, 2, 2]);
        let relu = OpKind::Activation {
            func: ActivationKind::Relu,
        };
        let y = g.emit(relu.clone(), &[x], TensorAttr::Transient).unwrap();
        assert_eq!(
            g.add_op(relu, &[x], &[y]).unwrap_err(),
            GraphError::AlreadyProduced(y)
        );
    }

    #[test]
    fn test_constant_size_checked() {
        let mut g = Graph::new();
        let err = g
            .create_constant_values(DType::F32, [2, 2], &[1.0, 2.0])
            .unwrap_err();
        assert_eq!(err, GraphError::DataSize { expected: 16, got: 8 });
        assert_eq!(g.constants().count(), 0);
    }
}
