//! Naive operator kernels.

use quilt_graph::{BinaryKind, Conv2dParams, PadParams, Pool2dParams, PoolKind, ReduceKind, Shape};
use smallvec::SmallVec;

use crate::Value;

type Index = SmallVec<[usize; 6]>;

fn unravel(mut flat: usize, shape: &[usize]) -> Index {
    let mut idx: Index = SmallVec::from_elem(0, shape.len());
    for axis in (0..shape.len()).rev() {
        idx[axis] = flat % shape[axis];
        flat /= shape[axis];
    }
    idx
}

fn ravel(idx: &[usize], strides: &[usize]) -> usize {
    idx.iter().zip(strides).map(|(i, s)| i * s).sum()
}

/// Position `o * stride + k * dilation - front`, if it lands inside `0..size`.
fn window_source(o: usize, k: usize, stride: usize, dilation: usize, front: usize, size: usize) -> Option<usize> {
    (o * stride + k * dilation)
        .checked_sub(front)
        .filter(|&p| p < size)
}

pub(crate) fn conv2d(
    p: &Conv2dParams,
    x: &Value,
    w: &Value,
    bias: Option<&Value>,
    out: &Shape,
) -> Vec<f32> {
    let layout = p.layout;
    let x_strides = x.shape.strides();
    let w_strides = w.shape.strides();
    let in_channels = w.shape[1];
    let kernel = [w.shape[2], w.shape[3]];
    let [s0, s1] = layout.spatial;

    (0..out.num_elements())
        .map(|flat| {
            let o_idx = unravel(flat, out);
            let oc = o_idx[layout.channel];
            let mut acc = bias.map_or(0.0, |b| b.data[oc]);
            let mut x_idx = o_idx.clone();
            for c in 0..in_channels {
                x_idx[layout.channel] = c;
                for k0 in 0..kernel[0] {
                    let Some(i0) = window_source(o_idx[s0], k0, p.stride[0], p.dilation[0], p.pad[0][0], x.shape[s0]) else {
                        continue;
                    };
                    x_idx[s0] = i0;
                    for k1 in 0..kernel[1] {
                        let Some(i1) = window_source(o_idx[s1], k1, p.stride[1], p.dilation[1], p.pad[1][0], x.shape[s1]) else {
                            continue;
                        };
                        x_idx[s1] = i1;
                        let wv = w.data[ravel(&[oc, c, k0, k1], &w_strides)];
                        acc += x.data[ravel(&x_idx, &x_strides)] * wv;
                    }
                }
            }
            acc
        })
        .collect()
}

pub(crate) fn pool2d(p: &Pool2dParams, x: &Value, out: &Shape) -> Vec<f32> {
    let x_strides = x.shape.strides();
    let [s0, s1] = p.layout.spatial;

    (0..out.num_elements())
        .map(|flat| {
            let o_idx = unravel(flat, out);
            let mut x_idx = o_idx.clone();
            let mut acc = match p.kind {
                PoolKind::Max => f32::NEG_INFINITY,
                PoolKind::Avg => 0.0,
            };
            let mut count = 0usize;
            for k0 in 0..p.kernel[0] {
                let Some(i0) = window_source(o_idx[s0], k0, p.stride[0], 1, p.pad[0][0], x.shape[s0]) else {
                    continue;
                };
                x_idx[s0] = i0;
                for k1 in 0..p.kernel[1] {
                    let Some(i1) = window_source(o_idx[s1], k1, p.stride[1], 1, p.pad[1][0], x.shape[s1]) else {
                        continue;
                    };
                    x_idx[s1] = i1;
                    let v = x.data[ravel(&x_idx, &x_strides)];
                    acc = match p.kind {
                        PoolKind::Max => acc.max(v),
                        PoolKind::Avg => acc + v,
                    };
                    count += 1;
                }
            }
            match p.kind {
                PoolKind::Avg if count > 0 => acc / count as f32,
                _ => acc,
            }
        })
        .collect()
}

pub(crate) fn pad(p: &PadParams, x: &Value, out: &Shape) -> Vec<f32> {
    let mut data = vec![p.value; out.num_elements()];
    let out_strides = out.strides();
    for (flat, &v) in x.data.iter().enumerate() {
        let mut idx = unravel(flat, &x.shape);
        for (i, f) in idx.iter_mut().zip(&p.front) {
            *i += f;
        }
        data[ravel(&idx, &out_strides)] = v;
    }
    data
}

/// Map an output index to the flat position of a broadcast operand.
fn broadcast_source(o_idx: &[usize], operand: &Shape, strides: &[usize]) -> usize {
    let offset = o_idx.len() - operand.rank();
    (0..operand.rank())
        .map(|i| {
            let pos = if operand[i] == 1 { 0 } else { o_idx[offset + i] };
            pos * strides[i]
        })
        .sum()
}

pub(crate) fn binary(kind: BinaryKind, a: &Value, b: &Value, out: &Shape) -> Vec<f32> {
    let a_strides = a.shape.strides();
    let b_strides = b.shape.strides();
    (0..out.num_elements())
        .map(|flat| {
            let idx = unravel(flat, out);
            let va = a.data[broadcast_source(&idx, &a.shape, &a_strides)];
            let vb = b.data[broadcast_source(&idx, &b.shape, &b_strides)];
            kind.apply(va, vb)
        })
        .collect()
}

pub(crate) fn reduce(
    kind: ReduceKind,
    axes: &[usize],
    keep_dims: bool,
    x: &Value,
    out: &Shape,
) -> Vec<f32> {
    let init = match kind {
        ReduceKind::Sum | ReduceKind::Mean => 0.0,
        ReduceKind::Prod => 1.0,
        ReduceKind::Max => f32::NEG_INFINITY,
        ReduceKind::Min => f32::INFINITY,
    };
    let mut acc = vec![init; out.num_elements()];
    let out_strides = out.strides();
    let count: usize = axes.iter().map(|&a| x.shape[a]).product();

    for (flat, &v) in x.data.iter().enumerate() {
        let idx = unravel(flat, &x.shape);
        let kept: Index = idx
            .iter()
            .enumerate()
            .filter_map(|(axis, &i)| match (axes.contains(&axis), keep_dims) {
                (false, _) => Some(i),
                (true, true) => Some(0),
                (true, false) => None,
            })
            .collect();
        let slot = &mut acc[ravel(&kept, &out_strides)];
        *slot = match kind {
            ReduceKind::Sum | ReduceKind::Mean => *slot + v,
            ReduceKind::Prod => *slot * v,
            ReduceKind::Max => slot.max(v),
            ReduceKind::Min => slot.min(v),
        };
    }
    if kind == ReduceKind::Mean && count > 0 {
        for v in &mut acc {
            *v /= count as f32;
        }
    }
    acc
}

pub(crate) fn transpose(perm: &[usize], x: &Value, out: &Shape) -> Vec<f32> {
    let x_strides = x.shape.strides();
    (0..out.num_elements())
        .map(|flat| {
            let o_idx = unravel(flat, out);
            let mut x_idx: Index = SmallVec::from_elem(0, perm.len());
            for (i, &p) in perm.iter().enumerate() {
                x_idx[p] = o_idx[i];
            }
            x.data[ravel(&x_idx, &x_strides)]
        })
        .collect()
}

pub(crate) fn concat(axis: usize, inputs: &[&Value], out: &Shape) -> Vec<f32> {
    let mut data = vec![0.0; out.num_elements()];
    let out_strides = out.strides();
    let mut offset = 0;
    for input in inputs {
        for (flat, &v) in input.data.iter().enumerate() {
            let mut idx = unravel(flat, &input.shape);
            idx[axis] += offset;
            data[ravel(&idx, &out_strides)] = v;
        }
        offset += input.shape[axis];
    }
    data
}

pub(crate) fn slice(begin: &[usize], x: &Value, out: &Shape) -> Vec<f32> {
    let x_strides = x.shape.strides();
    (0..out.num_elements())
        .map(|flat| {
            let mut idx = unravel(flat, out);
            for (i, b) in idx.iter_mut().zip(begin) {
                *i += b;
            }
            x.data[ravel(&idx, &x_strides)]
        })
        .collect()
}

pub(crate) fn softmax(axis: usize, x: &Value) -> Vec<f32> {
    let len = x.shape[axis];
    let inner: usize = x.shape.dims()[axis + 1..].iter().product();
    let outer: usize = x.shape.dims()[..axis].iter().product();
    let mut data = x.data.clone();
    for o in 0..outer {
        for i in 0..inner {
            let at = |k: usize| (o * len + k) * inner + i;
            let max = (0..len).map(|k| x.data[at(k)]).fold(f32::NEG_INFINITY, f32::max);
            let sum: f32 = (0..len).map(|k| (x.data[at(k)] - max).exp()).sum();
            for k in 0..len {
                data[at(k)] = (x.data[at(k)] - max).exp() / sum;
            }
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unravel_ravel() {
        let shape = [2, 3, 4];
        let strides = [12, 4, 1];
        for flat in 0..24 {
            assert_eq!(ravel(&unravel(flat, &shape), &strides), flat);
        }
    }

    #[test]
    fn test_window_source_bounds() {
        assert_eq!(window_source(0, 0, 1, 1, 1, 4), None);
        assert_eq!(window_source(0, 1, 1, 1, 1, 4), Some(0));
        assert_eq!(window_source(3, 2, 1, 1, 1, 4), None);
        assert_eq!(window_source(1, 1, 2, 2, 0, 8), Some(4));
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let x = Value::new([2, 3], vec![1.0, 2.0, 3.0, 0.0, 0.0, 0.0]).unwrap();
        let y = softmax(1, &x);
        let first: f32 = y[..3].iter().sum();
        assert!((first - 1.0).abs() < 1e-6);
        assert!((y[3] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_softmax_over_middle_axis() {
        // [2, 2, 3]: each (outer, inner) column of two values sums to one.
        let x = Value::new([2, 2, 3], (0..12).map(|i| i as f32).collect()).unwrap();
        let y = softmax(1, &x);
        for o in 0..2 {
            for i in 0..3 {
                let sum = y[o * 6 + i] + y[o * 6 + 3 + i];
                assert!((sum - 1.0).abs() < 1e-6);
                assert!(y[o * 6 + 3 + i] > y[o * 6 + i]);
            }
        }
    }
}
