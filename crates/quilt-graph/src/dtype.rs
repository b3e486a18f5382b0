//! Element types and quantization parameters.

use serde::{Deserialize, Serialize};

use crate::{GraphError, GraphResult};

/// Element type of a tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 32-bit IEEE float.
    F32,
    /// Unsigned 8-bit integer, usually asymmetric-quantized.
    U8,
    /// Signed 8-bit integer, usually symmetric-quantized.
    I8,
    /// Signed 32-bit integer.
    I32,
}

impl DType {
    /// Size of one element in bytes.
    #[must_use]
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::F32 | Self::I32 => 4,
            Self::U8 | Self::I8 => 1,
        }
    }

    /// Lowercase name as used in graph files.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::U8 => "u8",
            Self::I8 => "i8",
            Self::I32 => "i32",
        }
    }

    /// Encode values as little-endian element bytes.
    ///
    /// Integer types round to nearest and saturate at the type's range.
    #[must_use]
    pub fn encode(self, values: &[f32]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(values.len() * self.size_bytes());
        for &v in values {
            match self {
                Self::F32 => bytes.extend_from_slice(&v.to_le_bytes()),
                Self::U8 => bytes.push(v.round().clamp(0.0, 255.0) as u8),
                Self::I8 => bytes.push((v.round().clamp(-128.0, 127.0) as i8).to_le_bytes()[0]),
                Self::I32 => bytes.extend_from_slice(&(v.round() as i32).to_le_bytes()),
            }
        }
        bytes
    }

    /// Decode little-endian element bytes into `f32` values.
    pub fn decode(self, bytes: &[u8]) -> GraphResult<Vec<f32>> {
        let size = self.size_bytes();
        if bytes.len() % size != 0 {
            return Err(GraphError::DataSize {
                expected: bytes.len() / size * size,
                got: bytes.len(),
            });
        }
        let values = bytes
            .chunks_exact(size)
            .map(|c| match self {
                Self::F32 => f32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                Self::U8 => f32::from(c[0]),
                Self::I8 => f32::from(i8::from_le_bytes([c[0]])),
                Self::I32 => i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32,
            })
            .collect();
        Ok(values)
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Affine quantization: `real = scale * (stored - zero_point)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quantization {
    /// Scale factor.
    pub scale: f32,
    /// Stored value representing real zero.
    pub zero_point: i32,
}

impl Quantization {
    /// The identity quantization (scale 1, zero point 0).
    pub const IDENTITY: Self = Self {
        scale: 1.0,
        zero_point: 0,
    };
}
