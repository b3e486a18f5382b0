//! Pass configuration.
//!
//! Options can be built in code or loaded from a TOML file:
//!
//! ```toml
//! tile_count = 4
//! max_backward_passes = 64
//!
//! [axes]
//! batch = 0
//! channel = 1
//! fuse = [2, 3]
//! ```

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::axes::AxisMap;
use crate::{FusionError, FusionResult};

/// Which axes of a rank-4 tensor hold the batch, the channels, and the two
/// spatial dimensions the tiles are laid out along.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FusionAxisConfig {
    /// Batch axis.
    pub batch: usize,
    /// Channel axis.
    pub channel: usize,
    /// The two fuse axes; tiles advance fastest along `fuse[0]`.
    pub fuse: [usize; 2],
}

impl FusionAxisConfig {
    /// `[N, C, H, W]`, tiling along H and W.
    pub const NCHW: Self = Self {
        batch: 0,
        channel: 1,
        fuse: [2, 3],
    };

    /// `[N, H, W, C]`, tiling along H and W.
    pub const NHWC: Self = Self {
        batch: 0,
        channel: 3,
        fuse: [1, 2],
    };

    /// Check that the four axes are distinct and below 4.
    pub fn validate(&self) -> FusionResult<()> {
        let axes = [self.batch, self.channel, self.fuse[0], self.fuse[1]];
        for (i, &a) in axes.iter().enumerate() {
            if a >= 4 {
                return Err(FusionError::InvalidAxes(format!("axis {a} is out of range for rank 4")));
            }
            if axes[..i].contains(&a) {
                return Err(FusionError::InvalidAxes(format!("axis {a} is used twice")));
            }
        }
        Ok(())
    }

    /// The axis map graph inputs start with.
    #[must_use]
    pub const fn axis_map(&self) -> AxisMap {
        AxisMap {
            batch: self.batch,
            channel: self.channel,
            fuse: self.fuse,
        }
    }
}

impl Default for FusionAxisConfig {
    fn default() -> Self {
        Self::NCHW
    }
}

/// Options for one run of the pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionOptions {
    /// Axis roles.
    pub axes: FusionAxisConfig,
    /// Number of samples to tile. When set, graph inputs are re-batched to
    /// this extent; when unset, the first rank-4 input's batch is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tile_count: Option<usize>,
    /// Upper bound on backward passes during gap inference.
    pub max_backward_passes: usize,
}

impl Default for FusionOptions {
    fn default() -> Self {
        Self {
            axes: FusionAxisConfig::default(),
            tile_count: None,
            max_backward_passes: 64,
        }
    }
}

impl FusionOptions {
    /// Options with an explicit tile count.
    #[must_use]
    pub fn with_tile_count(mut self, tile_count: usize) -> Self {
        self.tile_count = Some(tile_count);
        self
    }

    /// Options with other axis roles.
    #[must_use]
    pub fn with_axes(mut self, axes: FusionAxisConfig) -> Self {
        self.axes = axes;
        self
    }

    /// Parse options from TOML text.
    pub fn from_toml_str(text: &str) -> FusionResult<Self> {
        let options: Self = toml::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a TOML file.
    pub fn load(path: &Utf8Path) -> FusionResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| FusionError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check axis roles and tile count.
    pub fn validate(&self) -> FusionResult<()> {
        self.axes.validate()?;
        if self.tile_count == Some(0) {
            return Err(FusionError::InvalidTileCount);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = FusionOptions::default();
        assert_eq!(options.axes, FusionAxisConfig::NCHW);
        assert_eq!(options.tile_count, None);
        assert_eq!(options.max_backward_passes, 64);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let options = FusionOptions::from_toml_str(
            r#"
            tile_count = 6
            [axes]
            batch = 0
            channel = 3
            fuse = [1, 2]
            "#,
        )
        .unwrap();
        assert_eq!(options.tile_count, Some(6));
        assert_eq!(options.axes, FusionAxisConfig::NHWC);
        assert_eq!(options.max_backward_passes, 64);
    }

    #[test]
    fn test_rejects_duplicate_axes() {
        let err = FusionOptions::from_toml_str(
            r#"
            [axes]
            batch = 0
            channel = 2
            fuse = [2, 3]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, FusionError::InvalidAxes(_)));
    }

    #[test]
    fn test_rejects_zero_tiles() {
        assert!(matches!(
            FusionOptions::from_toml_str("tile_count = 0"),
            Err(FusionError::InvalidTileCount)
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quilt.toml");
        std::fs::write(&path, "max_backward_passes = 8\n").unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(path).unwrap();
        let options = FusionOptions::load(&path).unwrap();
        assert_eq!(options.max_backward_passes, 8);

        let missing = FusionOptions::load(&path.with_file_name("missing.toml"));
        assert!(matches!(missing, Err(FusionError::Io { .. })));
    }
}
