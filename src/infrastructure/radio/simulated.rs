//! In-process radio simulator
//!
//! A single [`SimulatedRadio`] plays the shared medium: peripherals register
//! advertisements on it and centrals scan, connect and read through it.
//! Used by the test suites and by the `loopback` CLI mode, so no BLE
//! hardware is needed.
//!
//! Faults can be injected to exercise the retry and demotion paths.

use super::{
    advertised_name, encode_advertising_data, AdvertisementHandle, DiscoveredDevice, LinkHandle,
    NotifyCallback, RadioError, RadioStack, ResolvedHandle, ScanFilter, ServiceDefinition,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

/// Counters observable by tests.
#[derive(Debug, Clone, Default)]
pub struct RadioStats {
    pub connect_attempts: u32,
    pub connect_times: Vec<Instant>,
    pub disconnects: u32,
    pub reads: u32,
    pub advertisements: u32,
    pub unadvertisements: u32,
    pub notifications: u32,
}

#[derive(Debug, Default)]
struct Faults {
    /// Connect attempts left to fail; `u32::MAX` fails forever.
    connect_failures: u32,
    /// Polls of `services_resolved` that answer `false` on each new link.
    resolve_polls: u32,
    never_resolve: bool,
    hidden: HashSet<Uuid>,
    read_failures: u32,
    read_overrides: HashMap<Uuid, Vec<u8>>,
    reject_advertising: bool,
    crash_on_subscribe: bool,
}

struct SimPeripheral {
    address: String,
    adv_data: Vec<u8>,
    service: ServiceDefinition,
}

struct SimLink {
    peripheral: u64,
    pending_polls: u32,
    subscriptions: HashMap<u16, Arc<NotifyCallback>>,
}

#[derive(Default)]
struct SimState {
    powered: bool,
    next_id: u64,
    /// Address the next advertisement is published under.
    local_address: String,
    peripherals: HashMap<u64, SimPeripheral>,
    links: HashMap<u64, SimLink>,
    faults: Faults,
    stats: RadioStats,
}

impl SimState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn link(&self, link: LinkHandle) -> Result<&SimLink, RadioError> {
        self.links.get(&link.0).ok_or(RadioError::Disconnected(link))
    }

    fn characteristic_uuid(&self, handle: ResolvedHandle) -> Result<Uuid, RadioError> {
        let link = self.link(handle.link)?;
        let peripheral = self
            .peripherals
            .get(&link.peripheral)
            .ok_or(RadioError::Disconnected(handle.link))?;
        (handle.value_handle as usize)
            .checked_sub(1)
            .and_then(|index| peripheral.service.characteristics.get(index))
            .map(|c| c.uuid)
            .ok_or_else(|| RadioError::Gatt(format!("no value handle {}", handle.value_handle)))
    }
}

/// Shared in-process radio.
#[derive(Clone)]
pub struct SimulatedRadio {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedRadio {
    /// Create a radio whose advertisements appear under `local_address`.
    pub fn new(local_address: impl Into<String>) -> Self {
        let state = SimState {
            local_address: local_address.into(),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panicking callback must not wedge the whole medium.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn fail_connects(&self, count: u32) {
        self.lock().faults.connect_failures = count;
    }

    pub fn fail_all_connects(&self) {
        self.fail_connects(u32::MAX);
    }

    /// Report services as unresolved for `polls` polls on every new link.
    pub fn delay_resolution(&self, polls: u32) {
        self.lock().faults.resolve_polls = polls;
    }

    pub fn never_resolve(&self, never: bool) {
        self.lock().faults.never_resolve = never;
    }

    pub fn hide_characteristic(&self, uuid: Uuid) {
        self.lock().faults.hidden.insert(uuid);
    }

    pub fn fail_reads(&self, count: u32) {
        self.lock().faults.read_failures = count;
    }

    /// Serve fixed bytes for a characteristic instead of its read callback.
    pub fn override_read(&self, uuid: Uuid, bytes: Vec<u8>) {
        self.lock().faults.read_overrides.insert(uuid, bytes);
    }

    pub fn reject_advertising(&self, reject: bool) {
        self.lock().faults.reject_advertising = reject;
    }

    /// Make `subscribe` panic, as a crashing driver would.
    pub fn crash_on_subscribe(&self, crash: bool) {
        self.lock().faults.crash_on_subscribe = crash;
    }

    pub fn stats(&self) -> RadioStats {
        self.lock().stats.clone()
    }

    pub fn is_powered(&self) -> bool {
        self.lock().powered
    }

    pub fn is_advertising(&self) -> bool {
        !self.lock().peripherals.is_empty()
    }

    pub fn open_links(&self) -> usize {
        self.lock().links.len()
    }

    /// Deliver raw bytes to every subscriber of `characteristic`.
    pub fn inject_notification(&self, characteristic: Uuid, value: &[u8]) -> usize {
        let callbacks = {
            let state = self.lock();
            collect_subscribers(&state, None, characteristic)
        };
        for callback in &callbacks {
            callback(value);
        }
        callbacks.len()
    }
}

fn collect_subscribers(
    state: &SimState,
    peripheral: Option<u64>,
    characteristic: Uuid,
) -> Vec<Arc<NotifyCallback>> {
    let mut callbacks = Vec::new();
    for link in state.links.values() {
        if peripheral.is_some_and(|id| id != link.peripheral) {
            continue;
        }
        let Some(sim) = state.peripherals.get(&link.peripheral) else {
            continue;
        };
        let Some(index) = sim
            .service
            .characteristics
            .iter()
            .position(|c| c.uuid == characteristic)
        else {
            continue;
        };
        if let Some(callback) = link.subscriptions.get(&(index as u16 + 1)) {
            callbacks.push(Arc::clone(callback));
        }
    }
    callbacks
}

impl RadioStack for SimulatedRadio {
    fn power(&self, on: bool) -> Result<(), RadioError> {
        let mut state = self.lock();
        if state.powered != on {
            debug!("Simulated adapter powered {}", if on { "on" } else { "off" });
        }
        state.powered = on;
        Ok(())
    }

    fn advertise(&self, service: &ServiceDefinition) -> Result<AdvertisementHandle, RadioError> {
        let mut state = self.lock();
        if !state.powered {
            return Err(RadioError::Adapter("adapter is powered off".to_string()));
        }
        if state.faults.reject_advertising {
            return Err(RadioError::Advertising(
                "maximum advertisements reached".to_string(),
            ));
        }
        let id = state.next_id();
        let peripheral = SimPeripheral {
            address: state.local_address.clone(),
            adv_data: encode_advertising_data(service),
            service: service.clone(),
        };
        debug!(
            "Advertising '{}' as {} ({} characteristics)",
            service.local_name,
            peripheral.address,
            service.characteristics.len()
        );
        state.peripherals.insert(id, peripheral);
        state.stats.advertisements += 1;
        Ok(AdvertisementHandle(id))
    }

    fn unadvertise(&self, handle: AdvertisementHandle) -> Result<(), RadioError> {
        let mut state = self.lock();
        if state.peripherals.remove(&handle.0).is_none() {
            return Err(RadioError::Advertising(format!(
                "unknown advertisement {}",
                handle.0
            )));
        }
        // Centrals attached to this peripheral lose their links.
        state.links.retain(|_, link| link.peripheral != handle.0);
        state.stats.unadvertisements += 1;
        Ok(())
    }

    fn notify(
        &self,
        handle: AdvertisementHandle,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), RadioError> {
        let callbacks = {
            let mut state = self.lock();
            if !state.peripherals.contains_key(&handle.0) {
                return Err(RadioError::Advertising(format!(
                    "unknown advertisement {}",
                    handle.0
                )));
            }
            state.stats.notifications += 1;
            collect_subscribers(&state, Some(handle.0), characteristic)
        };
        trace!(
            "Notify {} -> {} subscriber(s): {:02X?}",
            characteristic,
            callbacks.len(),
            value
        );
        for callback in callbacks {
            callback(value);
        }
        Ok(())
    }

    fn scan(&self, filter: &ScanFilter) -> Result<Vec<DiscoveredDevice>, RadioError> {
        let state = self.lock();
        if !state.powered {
            return Err(RadioError::Adapter("adapter is powered off".to_string()));
        }
        let devices = state
            .peripherals
            .values()
            .map(|p| DiscoveredDevice {
                address: p.address.clone(),
                name: advertised_name(&p.adv_data),
                service_uuids: vec![p.service.service_uuid],
                rssi: Some(-50),
            })
            .filter(|device| filter.matches(device))
            .collect();
        Ok(devices)
    }

    fn connect_to(&self, device: &DiscoveredDevice) -> Result<LinkHandle, RadioError> {
        let mut state = self.lock();
        state.stats.connect_attempts += 1;
        state.stats.connect_times.push(Instant::now());

        if state.faults.connect_failures > 0 {
            if state.faults.connect_failures != u32::MAX {
                state.faults.connect_failures -= 1;
            }
            return Err(RadioError::Connection(format!(
                "{} did not respond",
                device.address
            )));
        }

        let peripheral = state
            .peripherals
            .iter()
            .find(|(_, p)| p.address.eq_ignore_ascii_case(&device.address))
            .map(|(id, _)| *id)
            .ok_or_else(|| RadioError::Connection(format!("{} not in range", device.address)))?;

        let id = state.next_id();
        let pending_polls = state.faults.resolve_polls;
        state.links.insert(
            id,
            SimLink {
                peripheral,
                pending_polls,
                subscriptions: HashMap::new(),
            },
        );
        Ok(LinkHandle(id))
    }

    fn disconnect(&self, link: LinkHandle) -> Result<(), RadioError> {
        let mut state = self.lock();
        state.stats.disconnects += 1;
        state
            .links
            .remove(&link.0)
            .map(|_| ())
            .ok_or(RadioError::Disconnected(link))
    }

    fn services_resolved(&self, link: LinkHandle) -> Result<bool, RadioError> {
        let mut state = self.lock();
        let never_resolve = state.faults.never_resolve;
        let sim = state
            .links
            .get_mut(&link.0)
            .ok_or(RadioError::Disconnected(link))?;
        if never_resolve {
            return Ok(false);
        }
        if sim.pending_polls > 0 {
            sim.pending_polls -= 1;
            return Ok(false);
        }
        Ok(true)
    }

    fn resolve_characteristic(
        &self,
        link: LinkHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Option<ResolvedHandle>, RadioError> {
        let state = self.lock();
        let sim = state.link(link)?;
        if state.faults.hidden.contains(&characteristic) {
            return Ok(None);
        }
        let Some(peripheral) = state.peripherals.get(&sim.peripheral) else {
            return Err(RadioError::Disconnected(link));
        };
        if peripheral.service.service_uuid != service {
            return Ok(None);
        }
        let handle = peripheral
            .service
            .characteristics
            .iter()
            .position(|c| c.uuid == characteristic)
            .map(|index| ResolvedHandle {
                link,
                value_handle: index as u16 + 1,
            });
        Ok(handle)
    }

    fn read(&self, handle: ResolvedHandle) -> Result<Vec<u8>, RadioError> {
        let on_read = {
            let mut state = self.lock();
            state.stats.reads += 1;
            let uuid = state.characteristic_uuid(handle)?;
            if state.faults.read_failures > 0 {
                state.faults.read_failures -= 1;
                return Err(RadioError::Gatt("ATT read timed out".to_string()));
            }
            if let Some(bytes) = state.faults.read_overrides.get(&uuid) {
                return Ok(bytes.clone());
            }
            let sim = state.link(handle.link)?;
            let peripheral = &state.peripherals[&sim.peripheral];
            let definition = &peripheral.service.characteristics[handle.value_handle as usize - 1];
            if !definition.read {
                return Err(RadioError::Gatt(format!("{} is not readable", uuid)));
            }
            Arc::clone(&definition.on_read)
        };
        // Outside the lock: the callback reaches into the sensor.
        on_read()
    }

    fn subscribe(
        &self,
        handle: ResolvedHandle,
        on_value: NotifyCallback,
    ) -> Result<(), RadioError> {
        let mut state = self.lock();
        if state.faults.crash_on_subscribe {
            drop(state);
            panic!("simulated driver crash in subscribe");
        }
        state.characteristic_uuid(handle)?;
        let sim = state
            .links
            .get_mut(&handle.link.0)
            .ok_or(RadioError::Disconnected(handle.link))?;
        sim.subscriptions
            .insert(handle.value_handle, Arc::new(on_value));
        Ok(())
    }

    fn unsubscribe(&self, handle: ResolvedHandle) -> Result<(), RadioError> {
        let mut state = self.lock();
        let sim = state
            .links
            .get_mut(&handle.link.0)
            .ok_or(RadioError::Disconnected(handle.link))?;
        sim.subscriptions.remove(&handle.value_handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::radio::CharacteristicDefinition;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn service(uuid: Uuid, chars: &[Uuid]) -> ServiceDefinition {
        ServiceDefinition {
            service_uuid: uuid,
            local_name: "IMU_Sensor".to_string(),
            manufacturer_data: None,
            characteristics: chars
                .iter()
                .map(|c| CharacteristicDefinition {
                    uuid: *c,
                    read: true,
                    notify: true,
                    on_read: Arc::new(|| Ok(vec![0xAA; 6])),
                })
                .collect(),
        }
    }

    #[test]
    fn test_scan_requires_power() {
        let radio = SimulatedRadio::new("11:22:33:44:55:66");
        assert!(radio.scan(&ScanFilter::default()).is_err());
        radio.power(true).unwrap();
        assert!(radio.scan(&ScanFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_connect_resolve_read() {
        let radio = SimulatedRadio::new("11:22:33:44:55:66");
        radio.power(true).unwrap();
        let svc = Uuid::new_v4();
        let chr = Uuid::new_v4();
        radio.advertise(&service(svc, &[chr])).unwrap();

        let devices = radio.scan(&ScanFilter::default()).unwrap();
        assert_eq!(devices[0].name.as_deref(), Some("IMU_Sensor"));

        radio.delay_resolution(1);
        let link = radio.connect_to(&devices[0]).unwrap();
        assert!(!radio.services_resolved(link).unwrap());
        assert!(radio.services_resolved(link).unwrap());

        let handle = radio.resolve_characteristic(link, svc, chr).unwrap().unwrap();
        assert_eq!(radio.read(handle).unwrap(), vec![0xAA; 6]);
        assert!(radio
            .resolve_characteristic(link, svc, Uuid::new_v4())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_stale_handle_after_disconnect() {
        let radio = SimulatedRadio::new("11:22:33:44:55:66");
        radio.power(true).unwrap();
        let svc = Uuid::new_v4();
        let chr = Uuid::new_v4();
        radio.advertise(&service(svc, &[chr])).unwrap();
        let device = radio.scan(&ScanFilter::default()).unwrap().remove(0);
        let link = radio.connect_to(&device).unwrap();
        let handle = radio.resolve_characteristic(link, svc, chr).unwrap().unwrap();

        radio.disconnect(link).unwrap();
        assert_eq!(radio.read(handle), Err(RadioError::Disconnected(link)));
    }

    #[test]
    fn test_notify_reaches_subscribers() {
        let radio = SimulatedRadio::new("11:22:33:44:55:66");
        radio.power(true).unwrap();
        let svc = Uuid::new_v4();
        let chr = Uuid::new_v4();
        let adv = radio.advertise(&service(svc, &[chr])).unwrap();
        let device = radio.scan(&ScanFilter::default()).unwrap().remove(0);
        let link = radio.connect_to(&device).unwrap();
        let handle = radio.resolve_characteristic(link, svc, chr).unwrap().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        radio
            .subscribe(
                handle,
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        radio.notify(adv, chr, &[0u8; 6]).unwrap();
        assert_eq!(radio.inject_notification(chr, &[0u8; 6]), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        radio.unsubscribe(handle).unwrap();
        radio.notify(adv, chr, &[0u8; 6]).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
