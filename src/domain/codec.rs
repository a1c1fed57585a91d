//! IMU Frame Codec
//!
//! Fixed-width little-endian payloads exchanged over the IMU characteristics.
//!
//! # Per-channel frame (6 bytes)
//!
//! ```text
//! [0-1] : X (i16 little-endian)
//! [2-3] : Y (i16 little-endian)
//! [4-5] : Z (i16 little-endian)
//! ```
//!
//! # Composite frame (36 bytes)
//!
//! ```text
//! [0-11]  : Accel X, Y, Z (f32 little-endian)
//! [12-23] : Gyro X, Y, Z
//! [24-35] : Mag X, Y, Z
//! ```

use crate::domain::error::{LinkError, Result};
use crate::domain::models::{AxisReading, CompositeFrame, FrameProfile, SensorFrame};
use tracing::warn;

pub const AXIS_TRIPLE_LEN: usize = 6;
pub const COMPOSITE_LEN: usize = 36;

impl FrameProfile {
    pub fn expected_len(&self) -> usize {
        match self {
            Self::PerChannelInt16 => AXIS_TRIPLE_LEN,
            Self::CompositeFloat32 => COMPOSITE_LEN,
        }
    }

    /// Length check shared by both decoders.
    pub fn check_len(&self, bytes: &[u8]) -> Result<()> {
        let expected = self.expected_len();
        if bytes.len() != expected {
            return Err(LinkError::malformed(*self, expected, bytes.len()));
        }
        Ok(())
    }
}

/// Narrow a raw reading to i16: truncate toward zero, then saturate.
pub fn narrow_to_i16(value: f64) -> i16 {
    if value.is_nan() {
        warn!("NaN sensor reading narrowed to 0");
        return 0;
    }
    let truncated = value.trunc();
    if truncated > i16::MAX as f64 || truncated < i16::MIN as f64 {
        warn!("Sensor reading {} outside int16 range, saturating", value);
    }
    // `as` saturates for out-of-range floats
    truncated as i16
}

impl SensorFrame {
    pub fn from_reading(reading: AxisReading) -> Self {
        Self::new(
            narrow_to_i16(reading.x),
            narrow_to_i16(reading.y),
            narrow_to_i16(reading.z),
        )
    }
}

pub fn encode_axis_triple(frame: &SensorFrame) -> [u8; AXIS_TRIPLE_LEN] {
    let mut out = [0u8; AXIS_TRIPLE_LEN];
    out[0..2].copy_from_slice(&frame.x().to_le_bytes());
    out[2..4].copy_from_slice(&frame.y().to_le_bytes());
    out[4..6].copy_from_slice(&frame.z().to_le_bytes());
    out
}

pub fn decode_axis_triple(bytes: &[u8]) -> Result<SensorFrame> {
    FrameProfile::PerChannelInt16.check_len(bytes)?;

    let x = i16::from_le_bytes([bytes[0], bytes[1]]);
    let y = i16::from_le_bytes([bytes[2], bytes[3]]);
    let z = i16::from_le_bytes([bytes[4], bytes[5]]);

    Ok(SensorFrame::new(x, y, z))
}

pub fn encode_composite(frame: &CompositeFrame) -> [u8; COMPOSITE_LEN] {
    let mut out = [0u8; COMPOSITE_LEN];
    for (chunk, value) in out.chunks_exact_mut(4).zip(frame.to_array()) {
        chunk.copy_from_slice(&value.to_le_bytes());
    }
    out
}

pub fn decode_composite(bytes: &[u8]) -> Result<CompositeFrame> {
    FrameProfile::CompositeFloat32.check_len(bytes)?;

    let mut values = [0.0f32; 9];
    for (value, chunk) in values.iter_mut().zip(bytes.chunks_exact(4)) {
        *value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }

    Ok(CompositeFrame::from_array(values))
}
