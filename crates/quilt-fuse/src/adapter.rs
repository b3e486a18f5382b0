//! Operator sequences inserted between batched and canvas data.
//!
//! Tiling (batched to canvas), shown for a `[N, C, F0, F1]` tensor on a
//! `t0 x t1` grid with per-sample extents `s` and gaps `g`:
//!
//! ```text
//!   pad back      [N, C, P0, P1]           P = s + g
//!   reshape       [t1, t0, C, P0, P1]
//!   transpose     [C, t0, P0, t1, P1]      perm [2, 1, 3, 0, 4]
//!   reshape       [1, C, t0*P0, t1*P1]
//!   slice         [1, C, E0, E1]           drops the trailing gap
//! ```
//!
//! Tensors in another layout are transposed to `[N, C, F0, F1]` first and
//! back afterwards. De-fusing slices every tile out of the canvas and
//! concatenates the tiles along the batch axis. Masking multiplies a canvas
//! by a constant that is one on tiles and zero on gaps.

use quilt_graph::{DType, OpKind, PadParams, Quantization, TensorAttr, TensorId, TensorSpec};
use tracing::debug;

use crate::axes::{is_identity, AxisMap};
use crate::context::FusionContext;
use crate::{FusionError, FusionResult};

/// The fused tensor holding `x` in batched form, de-fusing it if it lives
/// on a canvas.
pub(crate) fn batched_form(ctx: &mut FusionContext<'_>, x: TensorId) -> FusionResult<TensorId> {
    if ctx.is_canvas(x) {
        defuse(ctx, x, TensorAttr::Transient)
    } else {
        ctx.fused_of(x)
    }
}

/// The fused tensor holding `x` on a canvas, tiling it if it is batched and
/// masking its gaps if asked to.
pub(crate) fn canvas_form(ctx: &mut FusionContext<'_>, x: TensorId, mask: bool) -> FusionResult<TensorId> {
    if !ctx.is_canvas(x) {
        return tile(ctx, x);
    }
    if mask {
        return masked(ctx, x);
    }
    ctx.fused_of(x)
}

fn axis_map(ctx: &FusionContext<'_>, x: TensorId) -> FusionResult<AxisMap> {
    ctx.axis_map(x)
        .ok_or_else(|| FusionError::missing_tensor("axis_map", x))
}

fn emit(ctx: &mut FusionContext<'_>, kind: OpKind, input: TensorId) -> FusionResult<TensorId> {
    Ok(ctx.fused.emit(kind, &[input], TensorAttr::Transient)?)
}

/// Tile batched `x` onto a canvas with its inferred gap.
fn tile(ctx: &mut FusionContext<'_>, x: TensorId) -> FusionResult<TensorId> {
    if let Some(canvas) = ctx.tiled_of(x) {
        return Ok(canvas);
    }
    let map = axis_map(ctx, x)?;
    let gap = ctx.gap(x)?;
    let [t0, t1] = ctx.grid.factors();
    let shape = ctx.cloned.shape(x).clone();
    let channels = shape[map.channel];
    let padded = [shape[map.fuse[0]] + gap[0], shape[map.fuse[1]] + gap[1]];
    let mut cur = ctx.fused_of(x)?;

    if gap != [0, 0] {
        let mut back = vec![0; 4];
        back[map.fuse[0]] = gap[0];
        back[map.fuse[1]] = gap[1];
        let pad = OpKind::Pad(PadParams {
            front: vec![0; 4],
            back,
            value: 0.0,
        });
        cur = emit(ctx, pad, cur)?;
    }
    let to_canonical = map.canonical_perm();
    if !is_identity(&to_canonical) {
        cur = emit(ctx, OpKind::Transpose { perm: to_canonical.to_vec() }, cur)?;
    }
    cur = emit(
        ctx,
        OpKind::Reshape {
            shape: vec![t1, t0, channels, padded[0], padded[1]],
        },
        cur,
    )?;
    cur = emit(ctx, OpKind::Transpose { perm: vec![2, 1, 3, 0, 4] }, cur)?;
    cur = emit(
        ctx,
        OpKind::Reshape {
            shape: vec![1, channels, t0 * padded[0], t1 * padded[1]],
        },
        cur,
    )?;
    if gap != [0, 0] {
        let extent = [
            ctx.grid.canvas_extent(0, shape[map.fuse[0]], gap[0]),
            ctx.grid.canvas_extent(1, shape[map.fuse[1]], gap[1]),
        ];
        let slice = OpKind::Slice {
            begin: vec![0; 4],
            size: vec![1, channels, extent[0], extent[1]],
        };
        cur = emit(ctx, slice, cur)?;
    }
    let from_canonical = map.from_canonical_perm();
    if !is_identity(&from_canonical) {
        cur = emit(ctx, OpKind::Transpose { perm: from_canonical.to_vec() }, cur)?;
    }

    let expected = ctx.gap_infer_shape(x)?.clone();
    let found = ctx.fused.shape(cur).clone();
    if found != expected {
        return Err(FusionError::CanvasMismatch {
            tensor: x,
            expected,
            found,
        });
    }
    let proportion = ctx.canvas_proportion(x)?;
    ctx.record_proportion(cur, proportion)?;
    ctx.insert_tiled(x, cur)?;
    ctx.counters.tile_adapters += 1;
    debug!(tensor = ?x, ?gap, canvas = %found, "tiled");
    Ok(cur)
}

/// Slice every tile of canvas `y` and concatenate the tiles along the batch
/// axis. The first call for `y` decides the attribute of the result.
pub(crate) fn defuse(ctx: &mut FusionContext<'_>, y: TensorId, attr: TensorAttr) -> FusionResult<TensorId> {
    if let Some(batched) = ctx.defused_of(y) {
        return Ok(batched);
    }
    let map = axis_map(ctx, y)?;
    let gap = ctx.gap(y)?;
    let canvas = ctx.fused_of(y)?;
    let shape = ctx.cloned.shape(y).clone();
    let extent = map.sample_extent(&shape);
    let size = shape.with_dim(map.batch, 1).to_vec();

    let mut tiles = Vec::with_capacity(ctx.grid.count());
    for sample in 0..ctx.grid.count() {
        let origin = ctx.grid.tile_origin(sample, extent, gap);
        let mut begin = vec![0; shape.rank()];
        begin[map.fuse[0]] = origin[0];
        begin[map.fuse[1]] = origin[1];
        let slice = OpKind::Slice {
            begin,
            size: size.clone(),
        };
        tiles.push(emit(ctx, slice, canvas)?);
    }
    let batched = ctx
        .fused
        .emit(OpKind::Concat { axis: map.batch }, &tiles, attr)?;

    if *ctx.fused.shape(batched) != shape {
        return Err(FusionError::CanvasMismatch {
            tensor: y,
            expected: shape,
            found: ctx.fused.shape(batched).clone(),
        });
    }
    ctx.record_proportion(batched, 1.0)?;
    ctx.insert_defused(y, batched)?;
    ctx.counters.defuse_adapters += 1;
    debug!(tensor = ?y, tiles = tiles.len(), "de-fused");
    Ok(batched)
}

/// Multiply canvas `x` by its tile mask.
fn masked(ctx: &mut FusionContext<'_>, x: TensorId) -> FusionResult<TensorId> {
    if let Some(masked) = ctx.masked_of(x) {
        return Ok(masked);
    }
    let map = axis_map(ctx, x)?;
    let gap = ctx.gap(x)?;
    let canvas = ctx.fused_of(x)?;
    let canvas_shape = ctx.fused.shape(canvas).clone();
    let dtype = ctx.fused.spec(canvas).dtype;
    let extent = map.sample_extent(ctx.cloned.shape(x));

    let values = tile_mask(&canvas_shape, map, extent, gap);
    let mut mask_shape = vec![1; 4];
    mask_shape[map.fuse[0]] = canvas_shape[map.fuse[0]];
    mask_shape[map.fuse[1]] = canvas_shape[map.fuse[1]];
    let mut spec = TensorSpec::new(dtype, mask_shape, TensorAttr::Constant);
    if matches!(dtype, DType::U8 | DType::I8) {
        spec = spec.with_quant(Quantization::IDENTITY);
    }
    let mask = ctx.fused.create_constant(spec, dtype.encode(&values))?;
    let out = ctx.fused.emit(
        OpKind::Binary {
            kind: quilt_graph::BinaryKind::Mul,
        },
        &[canvas, mask],
        TensorAttr::Transient,
    )?;

    let proportion = ctx.canvas_proportion(x)?;
    ctx.record_proportion(out, proportion)?;
    ctx.insert_masked(x, out)?;
    ctx.counters.masks += 1;
    debug!(tensor = ?x, ?gap, "masked");
    Ok(out)
}

/// Row-major mask values for the fuse-axis plane of a canvas, ordered by
/// physical axis.
fn tile_mask(canvas: &[usize], map: AxisMap, extent: [usize; 2], gap: [usize; 2]) -> Vec<f32> {
    let inside = |f: usize, pos: usize| pos % (extent[f] + gap[f]) < extent[f];
    let (outer, inner) = if map.fuse[0] < map.fuse[1] { (0, 1) } else { (1, 0) };
    let mut values = Vec::with_capacity(canvas[map.fuse[0]] * canvas[map.fuse[1]]);
    for a in 0..canvas[map.fuse[outer]] {
        for b in 0..canvas[map.fuse[inner]] {
            let on_tile = inside(outer, a) && inside(inner, b);
            values.push(if on_tile { 1.0 } else { 0.0 });
        }
    }
    values
}
