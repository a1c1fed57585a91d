//! Radio Stack Module
//!
//! The wireless stack the Telemetry Link runs on top of. Adapter power,
//! advertising, GATT transport and link-layer behavior belong to the
//! implementation; the link only sees the [`RadioStack`] trait.
//!
//! ## Modules
//!
//! - [`advertising`] - Advertising data parsing and scan filters
//! - [`simulated`] - In-process radio used for tests and the loopback demo
//!
//! Calls are blocking. The cooperative session offloads them to a worker
//! thread, so implementations must be `Send + Sync`.

pub mod advertising;
pub mod simulated;

use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub use advertising::{advertised_name, encode_advertising_data, ScanFilter};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("Adapter error: {0}")]
    Adapter(String),

    #[error("Advertising error: {0}")]
    Advertising(String),

    #[error("Scan error: {0}")]
    Scan(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("GATT error: {0}")]
    Gatt(String),

    #[error("Read rejected: {0}")]
    ReadRejected(String),

    #[error("Link {0} is not connected")]
    Disconnected(LinkHandle),
}

/// Read callback bound to a served characteristic.
pub type ReadCallback = Arc<dyn Fn() -> Result<Vec<u8>, RadioError> + Send + Sync>;

/// Notification callback registered by a central.
pub type NotifyCallback = Box<dyn Fn(&[u8]) + Send + Sync>;

/// A characteristic as registered on the peripheral side.
#[derive(Clone)]
pub struct CharacteristicDefinition {
    pub uuid: Uuid,
    pub read: bool,
    pub notify: bool,
    pub on_read: ReadCallback,
}

impl fmt::Debug for CharacteristicDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CharacteristicDefinition")
            .field("uuid", &self.uuid)
            .field("read", &self.read)
            .field("notify", &self.notify)
            .finish_non_exhaustive()
    }
}

/// A primary service plus the advertisement that announces it.
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    pub service_uuid: Uuid,
    pub local_name: String,
    /// Company identifier and payload.
    pub manufacturer_data: Option<(u16, Vec<u8>)>,
    pub characteristics: Vec<CharacteristicDefinition>,
}

/// A registered advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdvertisementHandle(pub u64);

/// A device seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: String,
    pub name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    pub rssi: Option<i16>,
}

/// An established transport link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkHandle(pub u64);

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A characteristic resolved against a live link. Only valid for that link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResolvedHandle {
    pub link: LinkHandle,
    pub value_handle: u16,
}

pub trait RadioStack: Send + Sync {
    fn power(&self, on: bool) -> Result<(), RadioError>;

    fn advertise(&self, service: &ServiceDefinition) -> Result<AdvertisementHandle, RadioError>;

    fn unadvertise(&self, handle: AdvertisementHandle) -> Result<(), RadioError>;

    /// Publish a new value to every central subscribed to `characteristic`.
    fn notify(
        &self,
        handle: AdvertisementHandle,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), RadioError>;

    fn scan(&self, filter: &ScanFilter) -> Result<Vec<DiscoveredDevice>, RadioError>;

    fn connect_to(&self, device: &DiscoveredDevice) -> Result<LinkHandle, RadioError>;

    fn disconnect(&self, link: LinkHandle) -> Result<(), RadioError>;

    fn services_resolved(&self, link: LinkHandle) -> Result<bool, RadioError>;

    /// `Ok(None)` when the peer does not expose the characteristic.
    fn resolve_characteristic(
        &self,
        link: LinkHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Option<ResolvedHandle>, RadioError>;

    fn read(&self, handle: ResolvedHandle) -> Result<Vec<u8>, RadioError>;

    fn subscribe(&self, handle: ResolvedHandle, on_value: NotifyCallback)
        -> Result<(), RadioError>;

    fn unsubscribe(&self, handle: ResolvedHandle) -> Result<(), RadioError>;
}
