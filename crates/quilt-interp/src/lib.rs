//! Reference evaluator for quilt graphs.
//!
//! Evaluates every operation in dependency order over plain `f32` buffers.
//! Integer tensors are evaluated on their stored values without applying
//! quantization, which is enough to compare a graph against a rewritten
//! copy of itself. Nothing here is tuned for speed.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod kernels;

use quilt_graph::{Graph, GraphError, OpKind, Shape, TensorAttr, TensorId};
use rustc_hash::FxHashMap;
use tracing::trace;

/// A dense row-major tensor value.
#[derive(Clone, Debug, PartialEq)]
pub struct Value {
    /// Shape.
    pub shape: Shape,
    /// Elements, row-major.
    pub data: Vec<f32>,
}

impl Value {
    /// Create a value, checking that `data` fills `shape`.
    pub fn new(shape: impl Into<Shape>, data: Vec<f32>) -> EvalResult<Self> {
        let shape = shape.into();
        if shape.num_elements() != data.len() {
            return Err(EvalError::DataLength {
                shape,
                len: data.len(),
            });
        }
        Ok(Self { shape, data })
    }
}

/// Errors raised during evaluation.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum EvalError {
    /// A graph input was not fed.
    #[error("no value fed for input {0:?}")]
    MissingFeed(TensorId),

    /// Buffer length does not match a shape.
    #[error("{len} elements do not fill shape {shape}")]
    DataLength {
        /// The shape.
        shape: Shape,
        /// Buffer length.
        len: usize,
    },

    /// A constant tensor has no data.
    #[error("constant {0:?} has no data")]
    MissingData(TensorId),

    /// An operation read a tensor that was never computed.
    #[error("tensor {0:?} was read before it was computed")]
    Unevaluated(TensorId),

    /// Underlying graph error.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Result type for evaluation.
pub type EvalResult<T> = Result<T, EvalError>;

/// Evaluates one graph.
#[derive(Debug)]
pub struct Evaluator<'g> {
    graph: &'g Graph,
    values: FxHashMap<TensorId, Value>,
}

impl<'g> Evaluator<'g> {
    /// Create an evaluator with no inputs fed yet.
    #[must_use]
    pub fn new(graph: &'g Graph) -> Self {
        Self {
            graph,
            values: FxHashMap::default(),
        }
    }

    /// Feed a graph input.
    pub fn feed(&mut self, tensor: TensorId, data: Vec<f32>) -> EvalResult<()> {
        let shape = self.graph.try_tensor(tensor)?.spec.shape.clone();
        self.values.insert(tensor, Value::new(shape, data)?);
        Ok(())
    }

    /// Evaluate every operation.
    pub fn run(&mut self) -> EvalResult<()> {
        let graph = self.graph;
        for &input in graph.inputs() {
            if !self.values.contains_key(&input) {
                return Err(EvalError::MissingFeed(input));
            }
        }
        for id in graph.constants() {
            let tensor = graph.tensor(id);
            let bytes = tensor.data.as_ref().ok_or(EvalError::MissingData(id))?;
            let data = tensor.spec.dtype.decode(bytes)?;
            self.values
                .insert(id, Value::new(tensor.spec.shape.clone(), data)?);
        }
        for op_id in graph.topological_order() {
            let op = graph.op(op_id);
            let inputs = op
                .inputs
                .iter()
                .map(|t| self.values.get(t).ok_or(EvalError::Unevaluated(*t)))
                .collect::<EvalResult<Vec<&Value>>>()?;
            let out_shape = graph.shape(op.output()).clone();
            trace!(op = ?op_id, kind = op.kind.name(), shape = %out_shape, "evaluating");
            let data = compute(&op.kind, &inputs, &out_shape);
            let value = Value::new(out_shape, data)?;
            self.values.insert(op.output(), value);
        }
        Ok(())
    }

    /// The value of a tensor after [`run`](Self::run).
    #[must_use]
    pub fn value(&self, tensor: TensorId) -> Option<&Value> {
        self.values.get(&tensor)
    }

    /// Values of the graph outputs, in output order.
    pub fn outputs(&self) -> EvalResult<Vec<&Value>> {
        self.graph
            .outputs()
            .iter()
            .map(|t| self.values.get(t).ok_or(EvalError::Unevaluated(*t)))
            .collect()
    }
}

/// Feed `inputs`, run the graph, and return every computed value.
pub fn evaluate(
    graph: &Graph,
    inputs: impl IntoIterator<Item = (TensorId, Vec<f32>)>,
) -> EvalResult<FxHashMap<TensorId, Value>> {
    let mut eval = Evaluator::new(graph);
    for (tensor, data) in inputs {
        eval.feed(tensor, data)?;
    }
    eval.run()?;
    Ok(eval.values)
}

fn compute(kind: &OpKind, inputs: &[&Value], out: &Shape) -> Vec<f32> {
    let x = inputs[0];
    match kind {
        OpKind::Conv2d(p) => kernels::conv2d(p, x, inputs[1], inputs.get(2).copied(), out),
        OpKind::Pool2d(p) => kernels::pool2d(p, x, out),
        OpKind::Pad(p) => kernels::pad(p, x, out),
        OpKind::Activation { func } => x.data.iter().map(|&v| func.apply(v)).collect(),
        OpKind::Binary { kind } => kernels::binary(*kind, x, inputs[1], out),
        OpKind::Reduce {
            kind,
            axes,
            keep_dims,
        } => kernels::reduce(*kind, axes, *keep_dims, x, out),
        OpKind::Transpose { perm } => kernels::transpose(perm, x, out),
        OpKind::Reshape { .. } => x.data.clone(),
        OpKind::Concat { axis } => kernels::concat(*axis, inputs, out),
        OpKind::Slice { begin, .. } => kernels::slice(begin, x, out),
        OpKind::Softmax { axis } => kernels::softmax(*axis, x),
    }
}

/// Whether `tensor` is something [`Evaluator::feed`] accepts.
#[must_use]
pub fn is_feedable(graph: &Graph, tensor: TensorId) -> bool {
    graph
        .try_tensor(tensor)
        .is_ok_and(|t| t.spec.attr == TensorAttr::Input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quilt_graph::{
        ActivationKind, BinaryKind, Conv2dParams, DType, PadParams, Pool2dParams, PoolKind,
        ReduceKind, TensorSpec,
    };

    fn input(g: &mut Graph, shape: &[usize]) -> TensorId {
        g.create_tensor(TensorSpec::new(DType::F32, shape, TensorAttr::Input))
    }

    fn iota(n: usize) -> Vec<f32> {
        (0..n).map(|i| i as f32).collect()
    }

    #[test]
    fn test_conv_identity_kernel() {
        let mut g = Graph::new();
        let x = input(&mut g, &[1, 1, 3, 3]);
        let mut k = vec![0.0; 9];
        k[4] = 1.0;
        let w = g.create_constant_values(DType::F32, [1, 1, 3, 3], &k).unwrap();
        let conv = OpKind::Conv2d(Conv2dParams {
            pad: [[1, 1], [1, 1]],
            ..Conv2dParams::default()
        });
        let y = g.emit(conv, &[x, w], TensorAttr::Output).unwrap();

        let values = evaluate(&g, [(x, iota(9))]).unwrap();
        assert_eq!(values[&y].data, iota(9));
    }

    #[test]
    fn test_conv_sums_window_with_bias() {
        let mut g = Graph::new();
        let x = input(&mut g, &[1, 1, 2, 2]);
        let w = g.create_constant_values(DType::F32, [1, 1, 2, 2], &[1.0; 4]).unwrap();
        let b = g.create_constant_values(DType::F32, [1], &[10.0]).unwrap();
        let y = g
            .emit(OpKind::Conv2d(Conv2dParams::default()), &[x, w, b], TensorAttr::Output)
            .unwrap();
        let values = evaluate(&g, [(x, vec![1.0, 2.0, 3.0, 4.0])]).unwrap();
        assert_eq!(values[&y].data, vec![20.0]);
    }

    #[test]
    fn test_max_pool() {
        let mut g = Graph::new();
        let x = input(&mut g, &[1, 1, 4, 4]);
        let pool = OpKind::Pool2d(Pool2dParams {
            kind: PoolKind::Max,
            kernel: [2, 2],
            stride: [2, 2],
            pad: [[0, 0]; 2],
            layout: quilt_graph::DataLayout::NCHW,
        });
        let y = g.emit(pool, &[x], TensorAttr::Output).unwrap();
        let values = evaluate(&g, [(x, iota(16))]).unwrap();
        assert_eq!(values[&y].data, vec![5.0, 7.0, 13.0, 15.0]);
    }

    #[test]
    fn test_pad_then_relu() {
        let mut g = Graph::new();
        let x = input(&mut g, &[1, 2]);
        let pad = OpKind::Pad(PadParams {
            front: vec![0, 1],
            back: vec![0, 2],
            value: -1.0,
        });
        let p = g.emit(pad, &[x], TensorAttr::Transient).unwrap();
        let y = g
            .emit(
                OpKind::Activation {
                    func: ActivationKind::Relu,
                },
                &[p],
                TensorAttr::Output,
            )
            .unwrap();
        let values = evaluate(&g, [(x, vec![3.0, -4.0])]).unwrap();
        assert_eq!(values[&p].data, vec![-1.0, 3.0, -4.0, -1.0, -1.0]);
        assert_eq!(values[&y].data, vec![0.0, 3.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_broadcast_binary() {
        let mut g = Graph::new();
        let x = input(&mut g, &[2, 3]);
        let c = g.create_constant_values(DType::F32, [3], &[1.0, 2.0, 3.0]).unwrap();
        let y = g
            .emit(OpKind::Binary { kind: BinaryKind::Mul }, &[x, c], TensorAttr::Output)
            .unwrap();
        let values = evaluate(&g, [(x, vec![1.0; 6])]).unwrap();
        assert_eq!(values[&y].data, vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_reduce_transpose_concat_slice() {
        let mut g = Graph::new();
        let x = input(&mut g, &[2, 3]);
        let r = g
            .emit(
                OpKind::Reduce {
                    kind: ReduceKind::Sum,
                    axes: vec![1],
                    keep_dims: false,
                },
                &[x],
                TensorAttr::Output,
            )
            .unwrap();
        let t = g
            .emit(OpKind::Transpose { perm: vec![1, 0] }, &[x], TensorAttr::Output)
            .unwrap();
        let c = g
            .emit(OpKind::Concat { axis: 0 }, &[x, x], TensorAttr::Output)
            .unwrap();
        let s = g
            .emit(
                OpKind::Slice {
                    begin: vec![1, 1],
                    size: vec![1, 2],
                },
                &[x],
                TensorAttr::Output,
            )
            .unwrap();
        let values = evaluate(&g, [(x, iota(6))]).unwrap();
        assert_eq!(values[&r].data, vec![3.0, 12.0]);
        assert_eq!(values[&t].data, vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
        assert_eq!(values[&c].data.len(), 12);
        assert_eq!(values[&s].data, vec![4.0, 5.0]);
    }

    #[test]
    fn test_missing_feed() {
        let mut g = Graph::new();
        let x = input(&mut g, &[1]);
        let mut eval = Evaluator::new(&g);
        assert_eq!(eval.run(), Err(EvalError::MissingFeed(x)));
        assert!(is_feedable(&g, x));
    }
}
