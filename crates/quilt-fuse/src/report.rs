//! Summary of one run of the pass.

use std::fmt;

use serde::Serialize;

use crate::context::Counters;
use crate::FusionWarning;

// ============================================================================
// Fusion Report
// ============================================================================

/// What the pass did: the tile grid, how gap inference went, which
/// operators ended up where, and every soft failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FusionReport {
    /// Number of samples tiled.
    pub tile_count: usize,
    /// Tiles along each grid dimension.
    pub tiles: [usize; 2],
    /// Counters.
    #[serde(flatten)]
    pub counters: Counters,
    /// Soft failures, in the order they were hit.
    pub warnings: Vec<FusionWarning>,
}

impl FusionReport {
    /// Share of rewritten operators that run on the canvas.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fused_ratio(&self) -> f64 {
        let total = self.counters.fused_ops + self.counters.batched_ops;
        if total == 0 {
            0.0
        } else {
            self.counters.fused_ops as f64 / total as f64
        }
    }

    /// Total adapter operator sequences inserted.
    #[must_use]
    pub const fn adapters(&self) -> usize {
        self.counters.tile_adapters + self.counters.defuse_adapters + self.counters.masks
    }
}

// ============================================================================
// Display Implementation
// ============================================================================

impl fmt::Display for FusionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counters;
        writeln!(f, "┌──────────────────────────────────────────────┐")?;
        writeln!(f, "│ BATCH FUSION                                 │")?;
        writeln!(f, "├──────────────────────────────────────────────┤")?;
        writeln!(
            f,
            "│ Samples:             {:>6}  ({} x {} grid)",
            self.tile_count, self.tiles[0], self.tiles[1]
        )?;
        writeln!(f, "│ Fused operators:     {:>6}", c.fused_ops)?;
        writeln!(f, "│ Batched operators:   {:>6}", c.batched_ops)?;
        writeln!(f, "│ Fused ratio:         {:>5.1}%", self.fused_ratio() * 100.0)?;
        writeln!(f, "├──────────────────────────────────────────────┤")?;
        writeln!(f, "│ Backward passes:     {:>6}", c.backward_passes)?;
        writeln!(f, "│ Forward visits:      {:>6}", c.forward_visits)?;
        writeln!(f, "├──────────────────────────────────────────────┤")?;
        writeln!(f, "│ Tiling adapters:     {:>6}", c.tile_adapters)?;
        writeln!(f, "│ De-fuse adapters:    {:>6}", c.defuse_adapters)?;
        writeln!(f, "│ Masks:               {:>6}", c.masks)?;
        if !self.warnings.is_empty() {
            writeln!(f, "├──────────────────────────────────────────────┤")?;
            writeln!(f, "│ Warnings:            {:>6}", self.warnings.len())?;
            for warning in &self.warnings {
                writeln!(f, "│   {warning}")?;
            }
        }
        writeln!(f, "└──────────────────────────────────────────────┘")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quilt_graph::{Idx, OpId};

    fn report() -> FusionReport {
        FusionReport {
            tile_count: 4,
            tiles: [2, 2],
            counters: Counters {
                fused_ops: 3,
                batched_ops: 1,
                tile_adapters: 1,
                defuse_adapters: 1,
                ..Counters::default()
            },
            warnings: vec![FusionWarning::UnsupportedOperator {
                op: OpId::new(2),
                kind: "softmax",
            }],
        }
    }

    #[test]
    fn test_ratio_and_adapters() {
        let r = report();
        assert!((r.fused_ratio() - 0.75).abs() < 1e-12);
        assert_eq!(r.adapters(), 2);
    }

    #[test]
    fn test_display_lists_warnings() {
        let text = report().to_string();
        assert!(text.contains("BATCH FUSION"));
        assert!(text.contains("(2 x 2 grid)"));
        assert!(text.contains("unsupported operator softmax"));
    }

    #[test]
    fn test_json_is_flat() {
        let json = serde_json::to_value(report()).unwrap();
        assert_eq!(json["fused_ops"], 3);
        assert_eq!(json["tiles"], serde_json::json!([2, 2]));
        assert_eq!(json["warnings"][0]["warning"], "unsupported_operator");
    }
}
