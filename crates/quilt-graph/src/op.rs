//! Operator kinds, their parameters, and output shape inference.

use serde::{Deserialize, Serialize};

use crate::{invalid, GraphResult, Shape};

/// Positions of the batch, channel and two spatial axes of a rank-4 tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataLayout {
    /// Batch axis.
    pub batch: usize,
    /// Channel axis.
    pub channel: usize,
    /// Spatial axes, in kernel order (kernel height, kernel width).
    pub spatial: [usize; 2],
}

impl DataLayout {
    /// `[N, C, H, W]`.
    pub const NCHW: Self = Self {
        batch: 0,
        channel: 1,
        spatial: [2, 3],
    };

    /// `[N, H, W, C]`.
    pub const NHWC: Self = Self {
        batch: 0,
        channel: 3,
        spatial: [1, 2],
    };

    /// Whether the four positions are distinct axes of a rank-4 tensor.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let axes = [self.batch, self.channel, self.spatial[0], self.spatial[1]];
        let mut seen = [false; 4];
        for a in axes {
            if a >= 4 || seen[a] {
                return false;
            }
            seen[a] = true;
        }
        true
    }
}

impl Default for DataLayout {
    fn default() -> Self {
        Self::NCHW
    }
}

const fn ones() -> [usize; 2] {
    [1, 1]
}

/// 2-D convolution. Inputs: data, weight `[O, I, KH, KW]`, optional bias `[O]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conv2dParams {
    /// Stride per spatial axis.
    #[serde(default = "ones")]
    pub stride: [usize; 2],
    /// Dilation per spatial axis.
    #[serde(default = "ones")]
    pub dilation: [usize; 2],
    /// `[front, back]` zero padding per spatial axis.
    #[serde(default)]
    pub pad: [[usize; 2]; 2],
    /// Data layout of input and output.
    #[serde(default)]
    pub layout: DataLayout,
}

impl Default for Conv2dParams {
    fn default() -> Self {
        Self {
            stride: ones(),
            dilation: ones(),
            pad: [[0, 0]; 2],
            layout: DataLayout::NCHW,
        }
    }
}

/// Pooling reduction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// Maximum over the window.
    Max,
    /// Mean over the in-bounds part of the window.
    Avg,
}

/// 2-D pooling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool2dParams {
    /// Reduction applied over each window.
    pub kind: PoolKind,
    /// Window size per spatial axis.
    pub kernel: [usize; 2],
    /// Stride per spatial axis.
    #[serde(default = "ones")]
    pub stride: [usize; 2],
    /// `[front, back]` padding per spatial axis. Padded cells are ignored.
    #[serde(default)]
    pub pad: [[usize; 2]; 2],
    /// Data layout of input and output.
    #[serde(default)]
    pub layout: DataLayout,
}

/// Constant padding on every axis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PadParams {
    /// Cells added before each axis.
    pub front: Vec<usize>,
    /// Cells added after each axis.
    pub back: Vec<usize>,
    /// Fill value.
    #[serde(default)]
    pub value: f32,
}

/// Pointwise activation function.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    /// `max(x, 0)`.
    Relu,
    /// `min(max(x, 0), 6)`.
    Relu6,
    /// `1 / (1 + e^-x)`.
    Sigmoid,
    /// Hyperbolic tangent.
    Tanh,
    /// `x` if positive, else `alpha * x`.
    LeakyRelu {
        /// Negative slope.
        alpha: f32,
    },
}

impl ActivationKind {
    /// Evaluate the function at `x`.
    #[must_use]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Self::Relu => x.max(0.0),
            Self::Relu6 => x.clamp(0.0, 6.0),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Tanh => x.tanh(),
            Self::LeakyRelu { alpha } => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
        }
    }

    /// Whether `f(0) == 0`.
    #[must_use]
    pub const fn preserves_zero(self) -> bool {
        !matches!(self, Self::Sigmoid)
    }
}

/// Elementwise binary operator with numpy-style broadcasting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryKind {
    /// `a + b`.
    Add,
    /// `a - b`.
    Sub,
    /// `a * b`.
    Mul,
    /// `a / b`.
    Div,
    /// `max(a, b)`.
    Max,
    /// `min(a, b)`.
    Min,
}

impl BinaryKind {
    /// Evaluate the operator.
    #[must_use]
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
            Self::Max => a.max(b),
            Self::Min => a.min(b),
        }
    }
}

/// Reduction operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceKind {
    /// Sum.
    Sum,
    /// Arithmetic mean.
    Mean,
    /// Maximum.
    Max,
    /// Minimum.
    Min,
    /// Product.
    Prod,
}

/// The kind of an operation, with its parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpKind {
    /// 2-D convolution.
    Conv2d(Conv2dParams),
    /// 2-D pooling.
    Pool2d(Pool2dParams),
    /// Constant padding.
    Pad(PadParams),
    /// Pointwise activation.
    Activation {
        /// The function.
        func: ActivationKind,
    },
    /// Elementwise binary operator.
    Binary {
        /// The operator.
        kind: BinaryKind,
    },
    /// Reduction over axes.
    Reduce {
        /// The reduction.
        kind: ReduceKind,
        /// Axes to reduce.
        axes: Vec<usize>,
        /// Keep reduced axes with extent 1.
        #[serde(default)]
        keep_dims: bool,
    },
    /// Axis permutation: `out[i] = in[perm[i]]`.
    Transpose {
        /// The permutation.
        perm: Vec<usize>,
    },
    /// Reinterpret the row-major data with a new shape.
    Reshape {
        /// Target shape.
        shape: Vec<usize>,
    },
    /// Concatenation along an axis.
    Concat {
        /// The axis.
        axis: usize,
    },
    /// Contiguous sub-block.
    Slice {
        /// Start per axis.
        begin: Vec<usize>,
        /// Extent per axis.
        size: Vec<usize>,
    },
    /// Softmax along an axis.
    Softmax {
        /// The axis.
        axis: usize,
    },
}

/// Output extent of a sliding window over one axis, or `None` if the
/// window does not fit even once.
///
/// `out = (size + front + back - ((kernel - 1) * dilation + 1)) / stride + 1`
#[must_use]
pub fn window_output(
    size: usize,
    kernel: usize,
    stride: usize,
    dilation: usize,
    pad: [usize; 2],
) -> Option<usize> {
    if kernel == 0 || stride == 0 || dilation == 0 {
        return None;
    }
    let effective = (kernel - 1) * dilation + 1;
    let padded = size + pad[0] + pad[1];
    padded
        .checked_sub(effective)
        .map(|reach| reach / stride + 1)
}

impl OpKind {
    /// Short name used in diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Conv2d(_) => "conv2d",
            Self::Pool2d(_) => "pool2d",
            Self::Pad(_) => "pad",
            Self::Activation { .. } => "activation",
            Self::Binary { .. } => "binary",
            Self::Reduce { .. } => "reduce",
            Self::Transpose { .. } => "transpose",
            Self::Reshape { .. } => "reshape",
            Self::Concat { .. } => "concat",
            Self::Slice { .. } => "slice",
            Self::Softmax { .. } => "softmax",
        }
    }

    /// Infer the output shape from the input shapes.
    pub fn infer_shape(&self, inputs: &[&Shape]) -> GraphResult<Shape> {
        let name = self.name();
        let arity_ok = match self {
            Self::Conv2d(_) => matches!(inputs.len(), 2 | 3),
            Self::Binary { .. } => inputs.len() == 2,
            Self::Concat { .. } => !inputs.is_empty(),
            _ => inputs.len() == 1,
        };
        if !arity_ok {
            return Err(invalid(name, format!("unexpected input count {}", inputs.len())));
        }
        let x = inputs[0];

        match self {
            Self::Conv2d(p) => infer_conv(p, inputs),
            Self::Pool2d(p) => {
                check_layout(name, &p.layout, x)?;
                let mut out = x.clone();
                for j in 0..2 {
                    let axis = p.layout.spatial[j];
                    let o = window_output(x[axis], p.kernel[j], p.stride[j], 1, p.pad[j])
                        .ok_or_else(|| invalid(name, format!("window does not fit axis {axis}")))?;
                    out = out.with_dim(axis, o);
                }
                Ok(out)
            }
            Self::Pad(p) => {
                if p.front.len() != x.rank() || p.back.len() != x.rank() {
                    return Err(invalid(name, format!("pad lists must have rank {}", x.rank())));
                }
                Ok(Shape::new(
                    x.iter()
                        .zip(p.front.iter().zip(&p.back))
                        .map(|(d, (f, b))| d + f + b),
                ))
            }
            Self::Activation { .. } => Ok(x.clone()),
            Self::Binary { .. } => broadcast(name, x, inputs[1]),
            Self::Reduce {
                axes, keep_dims, ..
            } => {
                let mut reduced = vec![false; x.rank()];
                for &a in axes {
                    if a >= x.rank() || reduced[a] {
                        return Err(invalid(name, format!("bad reduction axis {a}")));
                    }
                    reduced[a] = true;
                }
                let dims = x.iter().zip(&reduced).filter_map(|(&d, &r)| match (r, *keep_dims) {
                    (false, _) => Some(d),
                    (true, true) => Some(1),
                    (true, false) => None,
                });
                Ok(Shape::new(dims))
            }
            Self::Transpose { perm } => {
                if !is_permutation(perm, x.rank()) {
                    return Err(invalid(name, format!("{perm:?} is not a permutation of rank {}", x.rank())));
                }
                Ok(x.permuted(perm))
            }
            Self::Reshape { shape } => {
                let target = Shape::from(shape.as_slice());
                if target.num_elements() != x.num_elements() {
                    return Err(invalid(
                        name,
                        format!("cannot reshape {x} ({} elements) to {target}", x.num_elements()),
                    ));
                }
                Ok(target)
            }
            Self::Concat { axis } => {
                let axis = *axis;
                if axis >= x.rank() {
                    return Err(invalid(name, format!("axis {axis} out of range")));
                }
                let mut total = 0;
                for s in inputs {
                    let compatible = s.rank() == x.rank()
                        && s.iter().zip(x.iter()).enumerate().all(|(i, (a, b))| i == axis || a == b);
                    if !compatible {
                        return Err(invalid(name, format!("cannot concatenate {s} with {x} on axis {axis}")));
                    }
                    total += s[axis];
                }
                Ok(x.with_dim(axis, total))
            }
            Self::Slice { begin, size } => {
                if begin.len() != x.rank() || size.len() != x.rank() {
                    return Err(invalid(name, format!("begin/size must have rank {}", x.rank())));
                }
                for i in 0..x.rank() {
                    if size[i] == 0 || begin[i] + size[i] > x[i] {
                        return Err(invalid(name, format!("slice {}+{} exceeds axis {i} of {x}", begin[i], size[i])));
                    }
                }
                Ok(Shape::from(size.as_slice()))
            }
            Self::Softmax { axis } => {
                if *axis >= x.rank() {
                    return Err(invalid(name, format!("axis {axis} out of range")));
                }
                Ok(x.clone())
            }
        }
    }
}

fn check_layout(name: &'static str, layout: &DataLayout, x: &Shape) -> GraphResult<()> {
    if x.rank() != 4 {
        return Err(invalid(name, format!("expected a rank-4 input, got {x}")));
    }
    if !layout.is_valid() {
        return Err(invalid(name, format!("invalid data layout {layout:?}")));
    }
    Ok(())
}

fn infer_conv(p: &Conv2dParams, inputs: &[&Shape]) -> GraphResult<Shape> {
    let name = "conv2d";
    let (x, w) = (inputs[0], inputs[1]);
    check_layout(name, &p.layout, x)?;
    if w.rank() != 4 {
        return Err(invalid(name, format!("weight must be [O, I, KH, KW], got {w}")));
    }
    if w[1] != x[p.layout.channel] {
        return Err(invalid(
            name,
            format!("weight expects {} input channels, data has {}", w[1], x[p.layout.channel]),
        ));
    }
    if let Some(bias) = inputs.get(2) {
        if bias.dims() != [w[0]] {
            return Err(invalid(name, format!("bias must be [{}], got {bias}", w[0])));
        }
    }
    let mut out = x.with_dim(p.layout.channel, w[0]);
    for j in 0..2 {
        let axis = p.layout.spatial[j];
        let o = window_output(x[axis], w[2 + j], p.stride[j], p.dilation[j], p.pad[j])
            .ok_or_else(|| invalid(name, format!("kernel does not fit axis {axis}")))?;
        out = out.with_dim(axis, o);
    }
    Ok(out)
}

fn broadcast(name: &'static str, a: &Shape, b: &Shape) -> GraphResult<Shape> {
    let rank = a.rank().max(b.rank());
    let mut dims = vec![1; rank];
    for (i, d) in dims.iter_mut().enumerate() {
        let da = (i + a.rank()).checked_sub(rank).map_or(1, |j| a[j]);
        let db = (i + b.rank()).checked_sub(rank).map_or(1, |j| b[j]);
        *d = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return Err(invalid(name, format!("cannot broadcast {a} with {b}"))),
        };
    }
    Ok(Shape::from(dims))
}

fn is_permutation(perm: &[usize], rank: usize) -> bool {
    if perm.len() != rank {
        return false;
    }
    let mut seen = vec![false; rank];
    perm.iter().all(|&p| p < rank && !std::mem::replace(&mut seen[p], true))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv(stride: usize, pad: usize) -> OpKind {
        OpKind::Conv2d(Conv2dParams {
            stride: [stride; 2],
            pad: [[pad, pad]; 2],
            ..Conv2dParams::default()
        })
    }

    #[test]
    fn test_window_output() {
        assert_eq!(window_output(8, 3, 1, 1, [1, 1]), Some(8));
        assert_eq!(window_output(8, 3, 2, 1, [1, 1]), Some(4));
        assert_eq!(window_output(8, 3, 1, 2, [0, 0]), Some(4));
        assert_eq!(window_output(2, 5, 1, 1, [0, 0]), None);
    }

    #[test]
    fn test_conv_shape() {
        let x = Shape::from([4, 3, 8, 8]);
        let w = Shape::from([16, 3, 3, 3]);
        assert_eq!(conv(1, 1).infer_shape(&[&x, &w]).unwrap(), Shape::from([4, 16, 8, 8]));
        assert_eq!(conv(2, 0).infer_shape(&[&x, &w]).unwrap(), Shape::from([4, 16, 3, 3]));

        let bad = Shape::from([16, 4, 3, 3]);
        assert!(conv(1, 1).infer_shape(&[&x, &bad]).is_err());
    }

    #[test]
    fn test_conv_nhwc_layout() {
        let kind = OpKind::Conv2d(Conv2dParams {
            layout: DataLayout::NHWC,
            ..Conv2dParams::default()
        });
        let x = Shape::from([2, 10, 6, 3]);
        let w = Shape::from([5, 3, 3, 1]);
        assert_eq!(kind.infer_shape(&[&x, &w]).unwrap(), Shape::from([2, 8, 6, 5]));
    }

    #[test]
    fn test_broadcast() {
        let kind = OpKind::Binary { kind: BinaryKind::Add };
        let a = Shape::from([4, 3, 8, 8]);
        let b = Shape::from([3, 1, 1]);
        assert_eq!(kind.infer_shape(&[&a, &b]).unwrap(), a);
        let c = Shape::from([2, 8]);
        assert!(kind.infer_shape(&[&a, &c]).is_err());
    }

    #[test]
    fn test_reduce_shapes() {
        let x = Shape::from([4, 3, 2, 1]);
        let keep = OpKind::Reduce {
            kind: ReduceKind::Sum,
            axes: vec![1, 2],
            keep_dims: true,
        };
        assert_eq!(keep.infer_shape(&[&x]).unwrap(), Shape::from([4, 1, 1, 1]));
        let drop = OpKind::Reduce {
            kind: ReduceKind::Sum,
            axes: vec![1, 2],
            keep_dims: false,
        };
        assert_eq!(drop.infer_shape(&[&x]).unwrap(), Shape::from([4, 1]));
    }

    #[test]
    fn test_transpose_rejects_non_permutation() {
        let x = Shape::from([1, 2, 3]);
        let bad = OpKind::Transpose { perm: vec![0, 0, 1] };
        assert!(bad.infer_shape(&[&x]).is_err());
        let good = OpKind::Transpose { perm: vec![2, 0, 1] };
        assert_eq!(good.infer_shape(&[&x]).unwrap(), Shape::from([3, 1, 2]));
    }

    #[test]
    fn test_slice_and_concat() {
        let x = Shape::from([1, 3, 18, 18]);
        let slice = OpKind::Slice {
            begin: vec![0, 0, 10, 0],
            size: vec![1, 3, 8, 8],
        };
        let s = slice.infer_shape(&[&x]).unwrap();
        assert_eq!(s, Shape::from([1, 3, 8, 8]));
        let concat = OpKind::Concat { axis: 0 };
        assert_eq!(concat.infer_shape(&[&s, &s, &s]).unwrap(), Shape::from([3, 3, 8, 8]));
    }

    #[test]
    fn test_serde_tagging() {
        let json = r#"{"op":"pool2d","kind":"max","kernel":[2,2],"stride":[2,2]}"#;
        let kind: OpKind = serde_json::from_str(json).unwrap();
        match kind {
            OpKind::Pool2d(p) => {
                assert_eq!(p.kernel, [2, 2]);
                assert_eq!(p.pad, [[0, 0]; 2]);
                assert_eq!(p.layout, DataLayout::NCHW);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
