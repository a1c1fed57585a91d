//! IMU telemetry over BLE GATT.
//!
//! A sensor-bearing peripheral advertises accelerometer, gyroscope and
//! magnetometer characteristics; centrals scan for it, connect, and read or
//! subscribe to fixed-width frames. The radio and the sensor driver are
//! supplied by the embedding process through [`RadioStack`] and
//! [`SensorSource`].

pub mod domain;
pub mod infrastructure;
pub mod link;

#[cfg(test)]
pub(crate) mod testing;

pub use domain::error::{ErrorKind, LinkError, Result};
pub use domain::models::{
    CompositeFrame, FrameProfile, LinkState, PeripheralState, SensorChannel, SensorFrame, Slot,
};
pub use infrastructure::radio::RadioStack;
pub use infrastructure::sensor::SensorSource;
