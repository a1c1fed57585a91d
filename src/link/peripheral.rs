//! Peripheral Session
//!
//! Advertises the IMU service and serves sensor frames from it.
//!
//! ```text
//! Idle -> Configuring -> Advertising -> Serving -> Stopping -> Idle
//! ```
//!
//! A session never reaches `Serving` without a detected, initialized sensor.

use crate::domain::codec::{encode_axis_triple, encode_composite};
use crate::domain::error::{LinkError, Result};
use crate::domain::models::{
    CharacteristicDescriptor, CompositeFrame, LinkEvent, MessageSeverity, PeripheralState,
    SensorChannel, SensorFrame, ServeModel, Slot, StatusMessage,
};
use crate::domain::registry::CharacteristicRegistry;
use crate::domain::settings::Settings;
use crate::infrastructure::radio::{
    AdvertisementHandle, CharacteristicDefinition, RadioError, RadioStack, ReadCallback,
    ServiceDefinition,
};
use crate::infrastructure::sensor::{SensorError, SensorSource};
use crate::link::execution::ExecutionModel;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Longest a stop request waits to be noticed.
const STOP_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct PeripheralConfig {
    pub local_name: String,
    /// Company identifier and payload carried in the advertisement.
    pub manufacturer_data: Option<(u16, Vec<u8>)>,
    pub serve: ServeModel,
}

impl PeripheralConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let peripheral = &settings.peripheral;
        Self {
            local_name: peripheral.device_name.clone(),
            manufacturer_data: Some((
                peripheral.manufacturer_id,
                peripheral.manufacturer_data.clone(),
            )),
            serve: peripheral.serve_model(),
        }
    }
}

/// Cloneable stop signal for [`PeripheralSession::serve_until`].
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Read one slot from the sensor and pack it for the wire.
pub fn pack_slot(
    sensor: &dyn SensorSource,
    slot: Slot,
) -> std::result::Result<Vec<u8>, SensorError> {
    match slot {
        Slot::Channel(channel) => {
            let frame = SensorFrame::from_reading(sensor.read_channel(channel)?);
            Ok(encode_axis_triple(&frame).to_vec())
        }
        Slot::Composite => {
            let mut values = [[0.0f32; 3]; 3];
            for (i, channel) in SensorChannel::ALL.iter().enumerate() {
                let reading = sensor.read_channel(*channel)?;
                values[i] = [reading.x as f32, reading.y as f32, reading.z as f32];
            }
            let frame = CompositeFrame::new(values[0], values[1], values[2]);
            Ok(encode_composite(&frame).to_vec())
        }
    }
}

fn read_callback(sensor: Arc<dyn SensorSource>, slot: Slot) -> ReadCallback {
    Arc::new(move || {
        pack_slot(&*sensor, slot).map_err(|e| {
            warn!("Rejecting read of {}: {}", slot, e);
            RadioError::ReadRejected(e.to_string())
        })
    })
}

pub struct PeripheralSession<R, X>
where
    R: RadioStack + ?Sized + 'static,
    X: ExecutionModel,
{
    radio: Arc<R>,
    exec: X,
    config: PeripheralConfig,
    state: PeripheralState,
    sensor: Option<Arc<dyn SensorSource>>,
    service: Option<ServiceDefinition>,
    /// Notify-capable characteristics, republished by the refresh loop.
    published: Vec<(Slot, Uuid)>,
    advertisement: Option<AdvertisementHandle>,
    event_sender: Option<mpsc::UnboundedSender<LinkEvent>>,
}

impl<R, X> PeripheralSession<R, X>
where
    R: RadioStack + ?Sized + 'static,
    X: ExecutionModel,
{
    pub fn new(radio: Arc<R>, exec: X, config: PeripheralConfig) -> Self {
        Self {
            radio,
            exec,
            config,
            state: PeripheralState::Idle,
            sensor: None,
            service: None,
            published: Vec::new(),
            advertisement: None,
            event_sender: None,
        }
    }

    pub fn with_events(mut self, sender: mpsc::UnboundedSender<LinkEvent>) -> Self {
        self.event_sender = Some(sender);
        self
    }

    pub fn state(&self) -> PeripheralState {
        self.state
    }

    pub fn service(&self) -> Option<&ServiceDefinition> {
        self.service.as_ref()
    }

    fn transition(&mut self, next: PeripheralState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            error!("Illegal peripheral transition {} -> {}", self.state, next);
        }
        debug!("[{}] {} -> {}", X::NAME, self.state, next);
        let from = std::mem::replace(&mut self.state, next);
        if let Some(sender) = &self.event_sender {
            let _ = sender.send(LinkEvent::PeripheralTransition { from, to: next });
        }
    }

    fn send_log(&self, message: impl Into<String>, severity: MessageSeverity) {
        if let Some(sender) = &self.event_sender {
            let _ = sender.send(LinkEvent::Status(StatusMessage {
                message: message.into(),
                severity,
            }));
        }
    }

    /// Probe the sensor and build the service around it.
    pub async fn configure(
        &mut self,
        sensor: Arc<dyn SensorSource>,
        descriptors: Vec<CharacteristicDescriptor>,
    ) -> Result<()> {
        if self.state != PeripheralState::Idle {
            return Err(LinkError::invalid_state("configure", self.state));
        }
        CharacteristicRegistry::validate(&descriptors)?;
        let service_uuid = descriptors[0].service_id;
        if descriptors.iter().any(|d| d.service_id != service_uuid) {
            return Err(LinkError::InvalidDescriptor {
                reason: "characteristics span more than one service".to_string(),
            });
        }

        self.transition(PeripheralState::Configuring);

        let probe = Arc::clone(&sensor);
        let detected = self
            .exec
            .offload(move || probe.detect().map(|version| (version, probe.init())))
            .await;
        let version = match detected {
            Ok(Some((version, true))) => version,
            Ok(Some((version, false))) => {
                self.transition(PeripheralState::Idle);
                error!("IMU version {} detected but failed to initialize", version);
                return Err(LinkError::DeviceNotFound {
                    reason: format!("version {} did not initialize", version),
                });
            }
            Ok(None) => {
                self.transition(PeripheralState::Idle);
                error!("No IMU detected");
                return Err(LinkError::DeviceNotFound {
                    reason: "no sensor answered on the bus".to_string(),
                });
            }
            Err(e) => {
                self.transition(PeripheralState::Idle);
                return Err(e);
            }
        };
        info!("Found IMU version {}", version);

        let characteristics = descriptors
            .iter()
            .map(|descriptor| CharacteristicDefinition {
                uuid: descriptor.uuid,
                read: descriptor.access.read,
                notify: descriptor.access.notify,
                on_read: read_callback(Arc::clone(&sensor), descriptor.slot),
            })
            .collect();
        self.published = descriptors
            .iter()
            .filter(|d| d.access.notify)
            .map(|d| (d.slot, d.uuid))
            .collect();
        self.service = Some(ServiceDefinition {
            service_uuid,
            local_name: self.config.local_name.clone(),
            manufacturer_data: self.config.manufacturer_data.clone(),
            characteristics,
        });
        self.sensor = Some(sensor);
        Ok(())
    }

    /// Power the radio, advertise and start serving.
    pub async fn start(&mut self) -> Result<()> {
        let service = match (&self.state, &self.service) {
            (PeripheralState::Configuring, Some(service)) => service.clone(),
            _ => return Err(LinkError::invalid_state("start", self.state)),
        };

        self.transition(PeripheralState::Advertising);
        let radio = Arc::clone(&self.radio);
        let registered = self
            .exec
            .offload(move || {
                radio.power(true)?;
                radio.advertise(&service)
            })
            .await;

        match registered {
            Ok(Ok(handle)) => {
                self.advertisement = Some(handle);
                self.transition(PeripheralState::Serving);
                info!("Advertising as '{}'", self.config.local_name);
                self.send_log(
                    format!("Advertising as '{}'", self.config.local_name),
                    MessageSeverity::Success,
                );
                Ok(())
            }
            Ok(Err(source)) => {
                error!("Failed to register advertisement: {}", source);
                self.send_log("Failed to register advertisement", MessageSeverity::Error);
                self.clear();
                self.transition(PeripheralState::Idle);
                Err(LinkError::AdvertiseFailed { source })
            }
            Err(e) => {
                self.clear();
                self.transition(PeripheralState::Idle);
                Err(e)
            }
        }
    }

    /// Serve until `stop` fires, then stop the session.
    pub async fn serve_until(&mut self, stop: StopHandle) -> Result<()> {
        if self.state != PeripheralState::Serving {
            return Err(LinkError::invalid_state("serve", self.state));
        }

        let mut scope = ServeScope { session: self };
        let session = &mut *scope.session;
        let tick = match session.config.serve {
            ServeModel::OnDemand => None,
            ServeModel::Refresh { interval } => Some(interval),
        };
        info!(
            "Serving {} characteristics ({})",
            session.service.as_ref().map_or(0, |s| s.characteristics.len()),
            match tick {
                Some(interval) => format!("refresh every {:?}", interval),
                None => "on demand".to_string(),
            }
        );

        while !stop.is_stopped() {
            match tick {
                Some(interval) => {
                    session.publish().await;
                    session.pause_unless_stopped(interval, &stop).await;
                }
                None => session.exec.pause(STOP_POLL).await,
            }
        }

        info!("Stop requested");
        session.stop().await;
        Ok(())
    }

    async fn pause_unless_stopped(&self, duration: Duration, stop: &StopHandle) {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if stop.is_stopped() || now >= deadline {
                return;
            }
            self.exec.pause(STOP_POLL.min(deadline - now)).await;
        }
    }

    /// Re-pack and notify every notify-capable characteristic once.
    async fn publish(&mut self) {
        let (Some(sensor), Some(handle)) = (self.sensor.clone(), self.advertisement) else {
            return;
        };
        let radio = Arc::clone(&self.radio);
        let published = self.published.clone();
        let outcome = self
            .exec
            .offload(move || {
                for (slot, uuid) in published {
                    let bytes = match pack_slot(&*sensor, slot) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!("Skipping {} refresh: {}", slot, e);
                            continue;
                        }
                    };
                    if let Err(e) = radio.notify(handle, uuid, &bytes) {
                        warn!("Notify on {} failed: {}", slot, e);
                    }
                }
            })
            .await;
        if let Err(e) = outcome {
            warn!("Refresh tick failed: {}", e);
        }
    }

    fn clear(&mut self) {
        self.sensor = None;
        self.service = None;
        self.published.clear();
    }

    /// Withdraw the advertisement. Safe to call in any state.
    pub async fn stop(&mut self) {
        if self.state == PeripheralState::Idle {
            return;
        }
        self.transition(PeripheralState::Stopping);
        if let Some(handle) = self.advertisement.take() {
            let radio = Arc::clone(&self.radio);
            match self.exec.offload(move || radio.unadvertise(handle)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Failed to unregister advertisement: {}", e),
                Err(e) => warn!("Failed to unregister advertisement: {}", e),
            }
        }
        self.finish_stop();
    }

    /// Synchronous stop for drop paths that cannot await.
    pub(crate) fn teardown_now(&mut self) {
        if self.state == PeripheralState::Idle {
            return;
        }
        self.transition(PeripheralState::Stopping);
        if let Some(handle) = self.advertisement.take() {
            if let Err(e) = self.radio.unadvertise(handle) {
                warn!("Failed to unregister advertisement: {}", e);
            }
        }
        self.finish_stop();
    }

    fn finish_stop(&mut self) {
        self.clear();
        self.transition(PeripheralState::Idle);
        info!("Peripheral stopped");
        self.send_log("Peripheral stopped", MessageSeverity::Info);
    }
}

/// Stops the session if `serve_until` is dropped before it finishes.
struct ServeScope<'a, R, X>
where
    R: RadioStack + ?Sized + 'static,
    X: ExecutionModel,
{
    session: &'a mut PeripheralSession<R, X>,
}

impl<R, X> Drop for ServeScope<'_, R, X>
where
    R: RadioStack + ?Sized + 'static,
    X: ExecutionModel,
{
    fn drop(&mut self) {
        self.session.teardown_now();
    }
}
