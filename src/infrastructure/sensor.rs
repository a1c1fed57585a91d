//! Sensor sources
//!
//! The register-level IMU driver lives outside this crate; it plugs in
//! through [`SensorSource`]. Two in-process sources are provided: a fixed
//! stub for tests and a synthetic motion source for the loopback demo.

use crate::domain::models::{Axis, AxisReading, SensorChannel, Slot};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;

/// Version code drivers report when no IMU answers on the bus.
pub const UNKNOWN_VERSION: u32 = 99;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SensorError {
    #[error("Reading {channel} {axis:?} failed: {reason}")]
    Read {
        channel: SensorChannel,
        axis: Axis,
        reason: String,
    },
}

/// Map a raw driver version code to a detected version.
pub fn version_from_code(code: u32) -> Option<u32> {
    (code != UNKNOWN_VERSION).then_some(code)
}

pub trait SensorSource: Send + Sync {
    /// Probe the bus. `None` when the sensor is absent or unrecognized.
    fn detect(&self) -> Option<u32>;

    fn init(&self) -> bool;

    fn read_axis(&self, channel: SensorChannel, axis: Axis) -> Result<f64, SensorError>;

    fn read_channel(&self, channel: SensorChannel) -> Result<AxisReading, SensorError> {
        Ok(AxisReading::new(
            self.read_axis(channel, Axis::X)?,
            self.read_axis(channel, Axis::Y)?,
            self.read_axis(channel, Axis::Z)?,
        ))
    }
}

/// Sensor returning configured values.
pub struct FixedSensor {
    version_code: u32,
    init_ok: bool,
    readings: Mutex<[AxisReading; 3]>,
    read_failures: AtomicU32,
}

impl FixedSensor {
    pub fn new() -> Self {
        Self {
            version_code: 3,
            init_ok: true,
            readings: Mutex::new([AxisReading::default(); 3]),
            read_failures: AtomicU32::new(0),
        }
    }

    /// A bus with nothing attached.
    pub fn absent() -> Self {
        Self {
            version_code: UNKNOWN_VERSION,
            ..Self::new()
        }
    }

    pub fn failing_init() -> Self {
        Self {
            init_ok: false,
            ..Self::new()
        }
    }

    pub fn with_reading(self, channel: SensorChannel, reading: AxisReading) -> Self {
        self.set_reading(channel, reading);
        self
    }

    pub fn set_reading(&self, channel: SensorChannel, reading: AxisReading) {
        let mut readings = self
            .readings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        readings[channel_index(channel)] = reading;
    }

    /// Fail the next `count` axis reads.
    pub fn fail_reads(&self, count: u32) {
        self.read_failures.store(count, Ordering::SeqCst);
    }
}

impl Default for FixedSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorSource for FixedSensor {
    fn detect(&self) -> Option<u32> {
        version_from_code(self.version_code)
    }

    fn init(&self) -> bool {
        self.init_ok
    }

    fn read_axis(&self, channel: SensorChannel, axis: Axis) -> Result<f64, SensorError> {
        let failing = self
            .read_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SensorError::Read {
                channel,
                axis,
                reason: "I2C bus NACK".to_string(),
            });
        }

        let readings = self
            .readings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let reading = readings[channel_index(channel)];
        Ok(match axis {
            Axis::X => reading.x,
            Axis::Y => reading.y,
            Axis::Z => reading.z,
        })
    }
}

/// Synthetic IMU: gravity on Z with a slow wobble, a rotating gyro and a
/// fixed magnetic field. Raw counts, roughly in BerryIMU ranges.
pub struct MotionSensor {
    started: Instant,
}

impl MotionSensor {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for MotionSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorSource for MotionSensor {
    fn detect(&self) -> Option<u32> {
        Some(3)
    }

    fn init(&self) -> bool {
        true
    }

    fn read_axis(&self, channel: SensorChannel, axis: Axis) -> Result<f64, SensorError> {
        let t = self.started.elapsed().as_secs_f64();
        let wobble = (t * 1.5).sin();
        let value = match (channel, axis) {
            (SensorChannel::Accel, Axis::X) => 900.0 * wobble,
            (SensorChannel::Accel, Axis::Y) => 900.0 * (t * 1.5).cos(),
            (SensorChannel::Accel, Axis::Z) => 16384.0,
            (SensorChannel::Gyro, Axis::X) => 250.0 * (t * 0.7).sin(),
            (SensorChannel::Gyro, Axis::Y) => 250.0 * (t * 0.7).cos(),
            (SensorChannel::Gyro, Axis::Z) => 40.0 * wobble,
            (SensorChannel::Mag, Axis::X) => 420.0,
            (SensorChannel::Mag, Axis::Y) => -130.0,
            (SensorChannel::Mag, Axis::Z) => 610.0 + 5.0 * wobble,
        };
        Ok(value)
    }
}

fn channel_index(channel: SensorChannel) -> usize {
    Slot::Channel(channel).index()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_version_is_absent() {
        assert_eq!(version_from_code(UNKNOWN_VERSION), None);
        assert_eq!(version_from_code(3), Some(3));
        assert_eq!(FixedSensor::absent().detect(), None);
    }

    #[test]
    fn test_fixed_reading() {
        let sensor = FixedSensor::new()
            .with_reading(SensorChannel::Gyro, AxisReading::new(1.0, 2.0, 3.0));
        let reading = sensor.read_channel(SensorChannel::Gyro).unwrap();
        assert_eq!(reading, AxisReading::new(1.0, 2.0, 3.0));
        assert_eq!(
            sensor.read_channel(SensorChannel::Accel).unwrap(),
            AxisReading::default()
        );
    }

    #[test]
    fn test_injected_read_failures_run_out() {
        let sensor = FixedSensor::new();
        sensor.fail_reads(1);
        assert!(sensor.read_axis(SensorChannel::Mag, Axis::X).is_err());
        assert!(sensor.read_axis(SensorChannel::Mag, Axis::X).is_ok());
    }

    #[test]
    fn test_motion_sensor_gravity() {
        let sensor = MotionSensor::new();
        let accel = sensor.read_channel(SensorChannel::Accel).unwrap();
        assert_eq!(accel.z, 16384.0);
    }
}
