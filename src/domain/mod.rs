//! Domain Module
//!
//! Wire formats, link state and configuration. Nothing here talks to a
//! radio except through the [`crate::infrastructure::radio::RadioStack`]
//! trait.
//!
//! ## Modules
//!
//! - [`models`] - Sensor frames, slots, descriptors and state enums
//! - [`codec`] - Fixed-width frame encoding
//! - [`registry`] - Characteristic resolution against a live link
//! - [`error`] - Link error taxonomy
//! - [`settings`] - JSON settings file

pub mod codec;
pub mod error;
pub mod models;
pub mod registry;
pub mod settings;
