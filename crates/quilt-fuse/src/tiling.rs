//! Canvas geometry and gap rules.
//!
//! Along one fuse axis a canvas holds `t` tiles of per-sample extent `s`,
//! separated by gaps of `g` cells. There is no trailing gap:
//!
//! ```text
//!   0        s     s+g      2s+g         (t-1)(s+g)        E
//!   |  tile  | gap |  tile  | gap | ... |    tile    |
//!
//!   E = t*s + (t-1)*g
//! ```
//!
//! Gaps are indexed by tile-grid dimension (0 or 1), not by physical axis.
//! Transposes move the fuse axes around but never reorder the grid.

use serde::Serialize;

/// The factor pair of `n` closest to `sqrt(n)`, smaller factor first.
///
/// Zero is treated as one.
#[must_use]
pub fn closest_factors(n: usize) -> [usize; 2] {
    let n = n.max(1);
    let mut small = 1;
    let mut i = 1;
    while i * i <= n {
        if n % i == 0 {
            small = i;
        }
        i += 1;
    }
    [small, n / small]
}

/// Arrangement of `count` samples on a `factors[0] x factors[1]` grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct TileGrid {
    count: usize,
    factors: [usize; 2],
}

impl TileGrid {
    /// Grid for `count` samples, using [`closest_factors`].
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            count: count.max(1),
            factors: closest_factors(count),
        }
    }

    /// Number of samples.
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Tiles along each grid dimension.
    #[must_use]
    pub const fn factors(&self) -> [usize; 2] {
        self.factors
    }

    /// Whether grid dimension `f` holds more than one tile.
    #[must_use]
    pub const fn is_tiled(&self, f: usize) -> bool {
        self.factors[f] > 1
    }

    /// Grid coordinates of a sample. The first coordinate varies fastest.
    #[must_use]
    pub const fn position(&self, sample: usize) -> [usize; 2] {
        [sample % self.factors[0], sample / self.factors[0]]
    }

    /// Offset of a sample's tile on each grid dimension.
    #[must_use]
    pub const fn tile_origin(&self, sample: usize, extent: [usize; 2], gap: [usize; 2]) -> [usize; 2] {
        let [i0, i1] = self.position(sample);
        [i0 * (extent[0] + gap[0]), i1 * (extent[1] + gap[1])]
    }

    /// Canvas extent on grid dimension `f`.
    #[must_use]
    pub const fn canvas_extent(&self, f: usize, extent: usize, gap: usize) -> usize {
        let t = self.factors[f];
        t * extent + (t - 1) * gap
    }

    /// Share of the canvas covered by tiles rather than gaps.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn proportion(&self, extent: [usize; 2], gap: [usize; 2]) -> f64 {
        (0..2)
            .map(|f| {
                let canvas = self.canvas_extent(f, extent[f], gap[f]);
                if canvas == 0 {
                    1.0
                } else {
                    (self.factors[f] * extent[f]) as f64 / canvas as f64
                }
            })
            .product()
    }
}

/// One spatial axis of a convolution or pooling window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Window {
    /// Kernel extent.
    pub kernel: usize,
    /// Stride.
    pub stride: usize,
    /// Dilation.
    pub dilation: usize,
    /// `[front, back]` padding.
    pub pad: [usize; 2],
    /// Per-sample input extent.
    pub input: usize,
    /// Per-sample output extent.
    pub output: usize,
}

impl Window {
    /// `(kernel - 1) * dilation + 1`.
    #[must_use]
    pub const fn effective_kernel(&self) -> usize {
        (self.kernel - 1) * self.dilation + 1
    }

    /// How far the last window of a tile reaches past the tile's end.
    #[must_use]
    pub const fn back_reach(&self) -> usize {
        ((self.output - 1) * self.stride + self.effective_kernel())
            .saturating_sub(self.pad[0] + self.input)
    }

    /// Smallest gap that keeps every window inside its own tile and gap,
    /// before stride alignment.
    #[must_use]
    pub fn min_gap(&self) -> usize {
        let tail = (self.output * self.stride).saturating_sub(self.input);
        self.pad[0].max(self.back_reach()).max(tail)
    }

    /// Raise `gap` until a tile plus its gap is a whole number of strides.
    #[must_use]
    pub fn align(&self, gap: usize) -> usize {
        (self.input + gap).div_ceil(self.stride) * self.stride - self.input
    }

    /// Smallest usable input gap at or above `gap`.
    #[must_use]
    pub fn admissible(&self, gap: usize) -> usize {
        self.align(gap.max(self.min_gap()))
    }

    /// Output gap produced by an admissible input gap.
    #[must_use]
    pub const fn forward(&self, gap: usize) -> usize {
        ((self.input + gap) / self.stride).saturating_sub(self.output)
    }

    /// Input gap that produces output gap `gap`.
    #[must_use]
    pub const fn backward(&self, gap: usize) -> usize {
        ((self.output + gap) * self.stride).saturating_sub(self.input)
    }

    /// Whether some window covers gap cells.
    #[must_use]
    pub const fn reads_gap(&self) -> bool {
        self.pad[0] > 0 || self.back_reach() > 0
    }
}

/// How one operator moves the gap along one grid dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GapRule {
    /// The gap passes through. Also used for untiled grid dimensions.
    Identity,
    /// Sliding window.
    Window(Window),
    /// Constant zero padding of `total = front + back` cells, carved out of
    /// the gap.
    Pad {
        /// Front plus back padding.
        total: usize,
    },
}

impl GapRule {
    /// Smallest usable input gap at or above `gap`.
    #[must_use]
    pub fn admissible(&self, gap: usize) -> usize {
        match self {
            Self::Identity => gap,
            Self::Window(w) => w.admissible(gap),
            Self::Pad { total } => gap.max(*total),
        }
    }

    /// Output gap for an admissible input gap.
    #[must_use]
    pub const fn forward(&self, gap: usize) -> usize {
        match self {
            Self::Identity => gap,
            Self::Window(w) => w.forward(gap),
            Self::Pad { total } => gap.saturating_sub(*total),
        }
    }

    /// Input gap needed for output gap `gap`.
    #[must_use]
    pub const fn backward(&self, gap: usize) -> usize {
        match self {
            Self::Identity => gap,
            Self::Window(w) => w.backward(gap),
            Self::Pad { total } => gap + *total,
        }
    }

    /// Whether gap cells of the input influence tile cells of the output.
    #[must_use]
    pub const fn reads_gap(&self) -> bool {
        match self {
            Self::Identity => false,
            Self::Window(w) => w.reads_gap(),
            Self::Pad { .. } => true,
        }
    }
}

/// What the gap cells of a canvas hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GapFill {
    /// Every gap cell is zero.
    Zeroed,
    /// Gap cells may hold arbitrary values.
    Dirty,
}
