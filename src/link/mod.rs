//! Telemetry Link
//!
//! Peripheral and central sessions, written once and run under either
//! execution model.
//!
//! ```text
//!  SensorSource ──► PeripheralSession ──► codec ──► RadioStack
//!                                                      │
//!       caller ◄── codec ◄── CentralSession ◄──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`execution`] - Blocking and cooperative execution models
//! - [`central`] - Scan, connect, read and subscribe
//! - [`peripheral`] - Advertise and serve
//! - [`facade`] - Blocking wrappers and scoped guards

pub mod central;
pub mod execution;
pub mod facade;
pub mod peripheral;

pub use central::{CentralConfig, CentralSession};
pub use execution::{Blocking, Cooperative, ExecutionModel};
pub use facade::{
    AdvertisingGuard, AsyncCentral, AsyncPeripheral, BlockingCentral, BlockingPeripheral,
    ConnectionGuard,
};
pub use peripheral::{PeripheralConfig, PeripheralSession, StopHandle};
