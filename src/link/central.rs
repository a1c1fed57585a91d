//! Central Session
//!
//! Scan, connect, resolve and read against one configured peer.
//!
//! ```text
//! Idle -> Scanning -> Connecting -> ServicesResolving -> Ready
//!                                                          |
//!                                    Reading <-> Ready <-> Notifying
//!                                                          |
//!                                           Disconnecting -> Idle
//! ```
//!
//! Connection-phase failures are retried inside `connect` within the
//! [`RetryBudget`]; every failed attempt gives back its partial link before
//! the next one starts. A `connect` future dropped mid-attempt tears its
//! link down synchronously. A transport failure during a read demotes the
//! session so the next call reconnects from scratch.

use crate::domain::codec::{decode_axis_triple, decode_composite};
use crate::domain::error::{LinkError, Result};
use crate::domain::models::{
    CharacteristicDescriptor, CompositeFrame, LinkEvent, LinkState, MessageSeverity, ResolveWait,
    RetryBudget, SensorChannel, SensorFrame, Slot, StatusMessage,
};
use crate::domain::registry::{CharacteristicRegistry, RegistryEntry};
use crate::domain::settings::Settings;
use crate::infrastructure::radio::{
    LinkHandle, NotifyCallback, RadioError, RadioStack, ResolvedHandle, ScanFilter,
};
use crate::link::execution::ExecutionModel;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Gap between scans while waiting for the peer to show up.
const SCAN_RETRY: Duration = Duration::from_millis(250);

/// Configuration for one central session
#[derive(Debug, Clone)]
pub struct CentralConfig {
    /// Which advertisement to connect to
    pub filter: ScanFilter,
    /// Characteristics that must all resolve for the link to be usable
    pub descriptors: Vec<CharacteristicDescriptor>,
    /// Budget copied fresh by every `connect` call
    pub retry: RetryBudget,
    pub resolve_wait: ResolveWait,
}

impl CentralConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            filter: settings
                .central
                .scan_filter(settings.link.advertised_service()),
            descriptors: settings.link.descriptors(),
            retry: settings.central.retry_budget(),
            resolve_wait: settings.central.resolve_wait(),
        }
    }
}

pub struct CentralSession<R, X>
where
    R: RadioStack + ?Sized + 'static,
    X: ExecutionModel,
{
    radio: Arc<R>,
    exec: X,
    config: CentralConfig,
    state: LinkState,
    link: Option<LinkHandle>,
    registry: Option<CharacteristicRegistry>,
    subscribed: [bool; Slot::COUNT],
    event_sender: Option<mpsc::UnboundedSender<LinkEvent>>,
}

impl<R, X> CentralSession<R, X>
where
    R: RadioStack + ?Sized + 'static,
    X: ExecutionModel,
{
    pub fn new(radio: Arc<R>, exec: X, config: CentralConfig) -> Self {
        Self {
            radio,
            exec,
            config,
            state: LinkState::Idle,
            link: None,
            registry: None,
            subscribed: [false; Slot::COUNT],
            event_sender: None,
        }
    }

    /// Report state transitions and status lines on `sender`.
    pub fn with_events(mut self, sender: mpsc::UnboundedSender<LinkEvent>) -> Self {
        self.event_sender = Some(sender);
        self
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_ready()
    }

    pub fn config(&self) -> &CentralConfig {
        &self.config
    }

    pub fn registry(&self) -> Option<&CharacteristicRegistry> {
        self.registry.as_ref()
    }

    fn transition(&mut self, next: LinkState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            error!("Illegal link transition {} -> {}", self.state, next);
        }
        debug!("[{}] {} -> {}", X::NAME, self.state, next);
        let from = std::mem::replace(&mut self.state, next);
        if let Some(sender) = &self.event_sender {
            let _ = sender.send(LinkEvent::CentralTransition { from, to: next });
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

    /// Connect using the configured retry budget.
    pub async fn connect(&mut self) -> Result<()> {
        let budget = self.config.retry;
        self.connect_with(budget).await
    }

    pub async fn connect_with(&mut self, budget: RetryBudget) -> Result<()> {
        if self.state.is_ready() {
            return Ok(());
        }
        if self.state != LinkState::Idle {
            return Err(LinkError::invalid_state("connect", self.state));
        }
        CharacteristicRegistry::validate(&self.config.descriptors)?;

        let mut scope = ConnectScope {
            session: self,
            settled: false,
        };
        let result = scope.session.run_attempts(budget).await;
        scope.settled = true;
        result
    }

    async fn run_attempts(&mut self, budget: RetryBudget) -> Result<()> {
        let attempts = budget.max_attempts.max(1);
        let peer = self.config.filter.describe();
        info!("Connecting to {} ({} attempts)", peer, attempts);
        self.send_log(format!("Connecting to {}...", peer), MessageSeverity::Info);

        let mut attempt = 1;
        loop {
            match self.attempt_connect().await {
                Ok(()) => {
                    self.transition(LinkState::Ready);
                    info!("Connected to {} on attempt {}", peer, attempt);
                    self.send_log(format!("Connected to {}", peer), MessageSeverity::Success);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Connection attempt {}/{} to {} failed: {}",
                        attempt, attempts, peer, e
                    );
                    self.release_link().await;

                    if attempt >= attempts {
                        self.transition(LinkState::Error);
                        self.transition(LinkState::Idle);
                        error!("Giving up on {} after {} attempts", peer, attempts);
                        self.send_log(
                            format!("Failed to connect to {}: {}", peer, e),
                            MessageSeverity::Error,
                        );
                        return Err(e);
                    }

                    self.transition(LinkState::Idle);
                    self.exec.pause(budget.delay_between_attempts).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt_connect(&mut self) -> Result<()> {
        self.transition(LinkState::Scanning);
        let peer = self.config.filter.describe();
        let radio = Arc::clone(&self.radio);
        self.exec
            .offload(move || radio.power(true))
            .await?
            .map_err(|e| LinkError::connection_failed(peer.as_str(), e))?;

        let scan_timeout = self.config.filter.timeout;
        let deadline = Instant::now() + scan_timeout;
        let device = loop {
            let radio = Arc::clone(&self.radio);
            let filter = self.config.filter.clone();
            let devices = self
                .exec
                .offload(move || radio.scan(&filter))
                .await?
                .map_err(|e| LinkError::connection_failed(peer.as_str(), e))?;
            if let Some(device) = devices.into_iter().next() {
                break device;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LinkError::ConnectionFailed {
                    peer: peer.clone(),
                    reason: format!("no matching device in range after {:?}", scan_timeout),
                    source: None,
                });
            }
            debug!("{} not seen yet, scanning again", peer);
            self.exec.pause(SCAN_RETRY.min(deadline - now)).await;
        };
        debug!("Found {} ({:?}, rssi {:?})", device.address, device.name, device.rssi);

        self.transition(LinkState::Connecting);
        let radio = Arc::clone(&self.radio);
        let address = device.address.clone();
        let link = self
            .exec
            .offload(move || radio.connect_to(&device))
            .await?
            .map_err(|e| LinkError::connection_failed(address, e))?;
        self.link = Some(link);

        self.transition(LinkState::ServicesResolving);
        self.wait_for_services(link).await?;

        let radio = Arc::clone(&self.radio);
        let descriptors = self.config.descriptors.clone();
        let registry = self
            .exec
            .offload(move || CharacteristicRegistry::resolve(&*radio, link, &descriptors))
            .await??;
        self.registry = Some(registry);
        Ok(())
    }

    async fn wait_for_services(&mut self, link: LinkHandle) -> Result<()> {
        let wait = self.config.resolve_wait;
        let polls = wait.max_polls();
        for poll in 0..polls {
            let radio = Arc::clone(&self.radio);
            let resolved = self
                .exec
                .offload(move || radio.services_resolved(link))
                .await?
                .map_err(|e| LinkError::connection_failed(link.to_string(), e))?;
            if resolved {
                debug!("Services resolved on link {} after {} polls", link, poll + 1);
                return Ok(());
            }
            if poll + 1 < polls {
                self.exec.pause(wait.poll_interval).await;
            }
        }
        Err(LinkError::ServiceDiscoveryTimeout {
            waited: wait.timeout,
        })
    }

    /// Give back the link, its subscriptions and the registry.
    async fn release_link(&mut self) {
        let Some((link, handles)) = self.take_link() else {
            return;
        };
        let radio = Arc::clone(&self.radio);
        if let Err(e) = self
            .exec
            .offload(move || release(&*radio, link, &handles))
            .await
        {
            warn!("Releasing link {} failed: {}", link, e);
        }
    }

    fn take_link(&mut self) -> Option<(LinkHandle, Vec<ResolvedHandle>)> {
        let registry = self.registry.take();
        let subscribed = std::mem::replace(&mut self.subscribed, [false; Slot::COUNT]);
        let link = self.link.take()?;

        let handles = registry
            .map(|registry| {
                ALL_SLOTS
                    .iter()
                    .filter(|slot| subscribed[slot.index()])
                    .filter_map(|slot| registry.handle(*slot).copied())
                    .collect()
            })
            .unwrap_or_default();
        Some((link, handles))
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.state.is_ready() {
            return Ok(());
        }
        debug!("Session not ready ({}), connecting first", self.state);
        self.connect().await
    }

    fn entry(&self, slot: Slot) -> Result<RegistryEntry> {
        self.registry
            .as_ref()
            .and_then(|registry| registry.entry(slot))
            .copied()
            .ok_or_else(|| LinkError::CharacteristicNotFound {
                missing: vec![slot],
            })
    }

    fn resolved(&self, slot: Slot) -> Result<ResolvedHandle> {
        self.entry(slot).map(|entry| entry.handle)
    }

    /// Resting state of a live link given its subscriptions.
    fn settled_state(&self) -> LinkState {
        if self.subscribed.iter().any(|s| *s) {
            LinkState::Notifying
        } else {
            LinkState::Ready
        }
    }

    async fn read_slot(&mut self, slot: Slot) -> Result<Vec<u8>> {
        self.ensure_connected().await?;
        let entry = self.entry(slot)?;
        if !entry.read {
            return Err(LinkError::InvalidDescriptor {
                reason: format!("{} is not readable", slot),
            });
        }
        let handle = entry.handle;

        let resume = self.settled_state();
        self.transition(LinkState::Reading);
        let radio = Arc::clone(&self.radio);
        match self.exec.offload(move || radio.read(handle)).await {
            Ok(Ok(bytes)) => {
                self.transition(resume);
                Ok(bytes)
            }
            Ok(Err(source)) => {
                warn!("Read of {} failed, dropping link: {}", slot, source);
                self.demote().await;
                Err(LinkError::TransportReadFailed { slot, source })
            }
            Err(e) => {
                self.demote().await;
                Err(e)
            }
        }
    }

    /// Drop the link after a transport failure so the next call reconnects.
    async fn demote(&mut self) {
        self.transition(LinkState::Error);
        self.release_link().await;
        self.transition(LinkState::Idle);
        self.send_log("Connection lost", MessageSeverity::Warning);
    }

    pub async fn read_sensor(&mut self, channel: SensorChannel) -> Result<SensorFrame> {
        let bytes = self.read_slot(Slot::Channel(channel)).await?;
        decode_axis_triple(&bytes)
    }

    pub async fn read_composite(&mut self) -> Result<CompositeFrame> {
        let bytes = self.read_slot(Slot::Composite).await?;
        decode_composite(&bytes)
    }

    /// Deliver decoded frames for `channel` as they are notified.
    pub async fn subscribe_sensor<F>(&mut self, channel: SensorChannel, on_frame: F) -> Result<()>
    where
        F: Fn(SensorFrame) + Send + Sync + 'static,
    {
        let slot = Slot::Channel(channel);
        let callback: NotifyCallback = Box::new(move |bytes| match decode_axis_triple(bytes) {
            Ok(frame) => on_frame(frame),
            Err(e) => warn!("Dropping {} notification: {}", slot, e),
        });
        self.subscribe_slot(slot, callback).await
    }

    pub async fn subscribe_composite<F>(&mut self, on_frame: F) -> Result<()>
    where
        F: Fn(CompositeFrame) + Send + Sync + 'static,
    {
        let callback: NotifyCallback = Box::new(move |bytes| match decode_composite(bytes) {
            Ok(frame) => on_frame(frame),
            Err(e) => warn!("Dropping composite notification: {}", e),
        });
        self.subscribe_slot(Slot::Composite, callback).await
    }

    async fn subscribe_slot(&mut self, slot: Slot, callback: NotifyCallback) -> Result<()> {
        self.ensure_connected().await?;
        let entry = self.entry(slot)?;
        if !entry.notify {
            return Err(LinkError::InvalidDescriptor {
                reason: format!("{} does not support notifications", slot),
            });
        }
        let handle = entry.handle;

        let radio = Arc::clone(&self.radio);
        match self
            .exec
            .offload(move || radio.subscribe(handle, callback))
            .await
        {
            Ok(Ok(())) => {
                self.subscribed[slot.index()] = true;
                self.transition(LinkState::Notifying);
                info!("Subscribed to {} notifications", slot);
                Ok(())
            }
            Ok(Err(source)) => {
                warn!("Subscribing to {} failed, dropping link: {}", slot, source);
                self.demote().await;
                Err(LinkError::TransportReadFailed { slot, source })
            }
            Err(e) => {
                self.demote().await;
                Err(e)
            }
        }
    }

    pub async fn unsubscribe(&mut self, slot: Slot) -> Result<()> {
        if !self.subscribed[slot.index()] {
            return Ok(());
        }
        let handle = self.resolved(slot)?;
        self.subscribed[slot.index()] = false;

        let radio = Arc::clone(&self.radio);
        if let Err(e) = self.exec.offload(move || radio.unsubscribe(handle)).await? {
            warn!("Unsubscribing from {} failed: {}", slot, e);
        }
        if self.state == LinkState::Notifying {
            let next = self.settled_state();
            self.transition(next);
        }
        Ok(())
    }

    pub fn is_subscribed(&self, slot: Slot) -> bool {
        self.subscribed[slot.index()]
    }

    /// Close the link. Safe to call in any state, any number of times.
    pub async fn disconnect(&mut self) {
        if self.state.is_ready() {
            self.transition(LinkState::Disconnecting);
        }
        let had_link = self.link.is_some();
        self.release_link().await;
        self.finish_disconnect(had_link);
    }

    /// Synchronous teardown for drop paths that cannot await.
    pub(crate) fn teardown_now(&mut self) {
        if self.state.is_ready() {
            self.transition(LinkState::Disconnecting);
        }
        let had_link = self.link.is_some();
        if let Some((link, handles)) = self.take_link() {
            release(&*self.radio, link, &handles);
        }
        self.finish_disconnect(had_link);
    }

    fn finish_disconnect(&mut self, had_link: bool) {
        match self.state {
            LinkState::Idle => {}
            LinkState::Disconnecting | LinkState::Error => self.transition(LinkState::Idle),
            // Interrupted mid-connect: the attempt is abandoned.
            _ => {
                self.transition(LinkState::Error);
                self.transition(LinkState::Idle);
            }
        }
        if had_link {
            info!("Disconnected from {}", self.config.filter.describe());
            self.send_log("Disconnected from device", MessageSeverity::Info);
        }
    }

    /// Explicit recovery from `Error`.
    pub fn reset(&mut self) {
        if self.state == LinkState::Error {
            self.take_link();
            self.transition(LinkState::Idle);
        }
    }
}

/// Tears the link down if `connect` is dropped before it settles.
struct ConnectScope<'a, R, X>
where
    R: RadioStack + ?Sized + 'static,
    X: ExecutionModel,
{
    session: &'a mut CentralSession<R, X>,
    settled: bool,
}

impl<R, X> Drop for ConnectScope<'_, R, X>
where
    R: RadioStack + ?Sized + 'static,
    X: ExecutionModel,
{
    fn drop(&mut self) {
        if !self.settled {
            warn!(
                "Connect to {} abandoned in state {}",
                self.session.config.filter.describe(),
                self.session.state
            );
            self.session.teardown_now();
        }
    }
}

const ALL_SLOTS: [Slot; Slot::COUNT] = [
    Slot::Channel(SensorChannel::Accel),
    Slot::Channel(SensorChannel::Gyro),
    Slot::Channel(SensorChannel::Mag),
    Slot::Composite,
];

fn release<R: RadioStack + ?Sized>(radio: &R, link: LinkHandle, subscriptions: &[ResolvedHandle]) {
    for handle in subscriptions {
        if let Err(e) = radio.unsubscribe(*handle) {
            debug!("Unsubscribe on link {} failed: {}", link, e);
        }
    }
    match radio.disconnect(link) {
        Ok(()) => debug!("Link {} released", link),
        Err(RadioError::Disconnected(_)) => debug!("Link {} was already down", link),
        Err(e) => warn!("Disconnecting link {} failed: {}", link, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::codec::encode_axis_triple;
    use crate::domain::error::ErrorKind;
    use crate::domain::models::{AccessFlags, FrameProfile};
    use crate::domain::settings::{LinkSettings, COMPOSITE_SERVICE_UUID};
    use crate::infrastructure::radio::simulated::SimulatedRadio;
    use crate::link::execution::Cooperative;
    use crate::testing::{self, STUB_FRAME};
    use std::sync::Mutex;
    use std::time::Duration;

    fn config() -> CentralConfig {
        let central = testing::fast_central_settings();
        CentralConfig {
            filter: central.scan_filter(testing::service_uuid()),
            descriptors: testing::channel_descriptors(),
            retry: central.retry_budget(),
            resolve_wait: central.resolve_wait(),
        }
    }

    fn composite_config() -> CentralConfig {
        let central = testing::fast_central_settings();
        CentralConfig {
            filter: central.scan_filter(COMPOSITE_SERVICE_UUID),
            descriptors: testing::composite_descriptors(),
            ..config()
        }
    }

    fn session(radio: &SimulatedRadio) -> CentralSession<SimulatedRadio, Cooperative> {
        CentralSession::new(Arc::new(radio.clone()), Cooperative, config())
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> Vec<(LinkState, LinkState)> {
        let mut transitions = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let LinkEvent::CentralTransition { from, to } = event {
                transitions.push((from, to));
            }
        }
        transitions
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_connect_reaches_ready() {
        let radio = testing::radio_with_stub_peripheral();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut central = session(&radio).with_events(tx);

        central.connect().await.unwrap();

        assert_eq!(central.state(), LinkState::Ready);
        assert_eq!(central.registry().unwrap().len(), 3);
        assert_eq!(
            drain(&mut rx),
            vec![
                (LinkState::Idle, LinkState::Scanning),
                (LinkState::Scanning, LinkState::Connecting),
                (LinkState::Connecting, LinkState::ServicesResolving),
                (LinkState::ServicesResolving, LinkState::Ready),
            ]
        );

        // Already connected: no new attempt.
        central.connect().await.unwrap();
        assert_eq!(radio.stats().connect_attempts, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retries_sleep_between_attempts() {
        let radio = testing::radio_with_stub_peripheral();
        radio.fail_connects(2);
        let mut central = session(&radio);

        central.connect().await.unwrap();

        let stats = radio.stats();
        assert_eq!(stats.connect_attempts, 3);
        for pair in stats.connect_times.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(20));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_exhausted_budget_ends_idle() {
        let radio = testing::radio_with_stub_peripheral();
        radio.fail_all_connects();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut central = session(&radio).with_events(tx);

        let err = central.connect().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
        assert_eq!(radio.stats().connect_attempts, 3);
        assert_eq!(central.state(), LinkState::Idle);
        let transitions = drain(&mut rx);
        assert_eq!(
            &transitions[transitions.len() - 2..],
            &[
                (LinkState::Connecting, LinkState::Error),
                (LinkState::Error, LinkState::Idle)
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fresh_budget_per_connect() {
        let radio = testing::radio_with_stub_peripheral();
        radio.fail_connects(3);
        let mut central = session(&radio);

        assert!(central.connect().await.is_err());
        central.connect().await.unwrap();
        assert_eq!(radio.stats().connect_attempts, 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resolution_timeout_releases_links() {
        let radio = testing::radio_with_stub_peripheral();
        radio.never_resolve(true);
        let mut central = session(&radio);

        let err = central
            .connect_with(RetryBudget::new(2, Duration::from_millis(1)))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ServiceDiscoveryTimeout);
        assert_eq!(radio.open_links(), 0);
        assert_eq!(radio.stats().disconnects, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_slow_resolution_within_wait() {
        let radio = testing::radio_with_stub_peripheral();
        radio.delay_resolution(3);
        let mut central = session(&radio);

        central.connect().await.unwrap();
        assert_eq!(radio.stats().connect_attempts, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_characteristic_never_reaches_ready() {
        let radio = testing::radio_with_stub_peripheral();
        radio.hide_characteristic(testing::gyro_uuid());
        let mut central = session(&radio);

        let err = central.connect().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::CharacteristicNotFound);
        assert!(central.registry().is_none());
        assert_eq!(central.state(), LinkState::Idle);
        assert_eq!(radio.open_links(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_read_connects_implicitly() {
        let radio = testing::radio_with_stub_peripheral();
        let mut central = session(&radio);

        let frame = central.read_sensor(SensorChannel::Mag).await.unwrap();

        assert_eq!(frame, STUB_FRAME);
        assert_eq!(central.state(), LinkState::Ready);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_transport_failure_demotes() {
        let radio = testing::radio_with_stub_peripheral();
        let mut central = session(&radio);
        central.connect().await.unwrap();

        radio.fail_reads(1);
        let err = central.read_sensor(SensorChannel::Accel).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::TransportReadFailed);
        assert_eq!(central.state(), LinkState::Idle);
        assert!(central.registry().is_none());
        assert_eq!(radio.open_links(), 0);

        // The next read starts over with a new link.
        let frame = central.read_sensor(SensorChannel::Accel).await.unwrap();
        assert_eq!(frame, STUB_FRAME);
        assert_eq!(radio.stats().connect_attempts, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_malformed_frame_keeps_link() {
        let radio = testing::radio_with_stub_peripheral();
        radio.override_read(testing::accel_uuid(), vec![0x64, 0x00, 0x38, 0xFF, 0x2C]);
        let mut central = session(&radio);

        let err = central.read_sensor(SensorChannel::Accel).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::MalformedFrame);
        assert_eq!(central.state(), LinkState::Ready);
        assert_eq!(radio.open_links(), 1);
        assert_eq!(
            central.read_sensor(SensorChannel::Gyro).await.unwrap(),
            STUB_FRAME
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_composite_read() {
        let radio = testing::radio_with_composite_peripheral();
        let mut central = CentralSession::new(Arc::new(radio.clone()), Cooperative, composite_config());

        let frame = central.read_composite().await.unwrap();

        assert_eq!(frame, testing::stub_composite());
        assert_eq!(
            central
                .registry()
                .unwrap()
                .entry(Slot::Composite)
                .unwrap()
                .profile,
            FrameProfile::CompositeFloat32
        );
        // No per-channel characteristics in this profile.
        let err = central.read_sensor(SensorChannel::Accel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CharacteristicNotFound);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_subscription_drops_malformed_payloads() {
        let radio = testing::radio_with_stub_peripheral();
        let mut central = session(&radio);
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&frames);

        central
            .subscribe_sensor(SensorChannel::Gyro, move |frame| {
                sink.lock().unwrap().push(frame);
            })
            .await
            .unwrap();
        assert_eq!(central.state(), LinkState::Notifying);

        let good = encode_axis_triple(&SensorFrame::new(1, -1, 2));
        radio.inject_notification(testing::gyro_uuid(), &good);
        radio.inject_notification(testing::gyro_uuid(), &[0x01, 0x02, 0x03]);

        assert_eq!(*frames.lock().unwrap(), vec![SensorFrame::new(1, -1, 2)]);

        // Reads still work while notifying.
        central.read_sensor(SensorChannel::Accel).await.unwrap();
        assert_eq!(central.state(), LinkState::Notifying);

        central
            .unsubscribe(Slot::Channel(SensorChannel::Gyro))
            .await
            .unwrap();
        assert_eq!(central.state(), LinkState::Ready);
        radio.inject_notification(testing::gyro_uuid(), &good);
        assert_eq!(frames.lock().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_disconnect_is_idempotent() {
        let radio = testing::radio_with_stub_peripheral();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut central = session(&radio).with_events(tx);
        central.connect().await.unwrap();
        drain(&mut rx);

        central.disconnect().await;
        central.disconnect().await;

        assert_eq!(central.state(), LinkState::Idle);
        assert_eq!(radio.stats().disconnects, 1);
        assert!(central.registry().is_none());
        assert_eq!(
            drain(&mut rx),
            vec![
                (LinkState::Ready, LinkState::Disconnecting),
                (LinkState::Disconnecting, LinkState::Idle),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancelled_connect_releases_link() {
        let radio = testing::radio_with_stub_peripheral();
        radio.never_resolve(true);
        let mut central = session(&radio);

        let outcome = tokio::time::timeout(Duration::from_millis(40), central.connect()).await;

        assert!(outcome.is_err());
        assert_eq!(central.state(), LinkState::Idle);
        assert_eq!(radio.open_links(), 0);

        radio.never_resolve(false);
        let frame = central.read_sensor(SensorChannel::Accel).await.unwrap();
        assert_eq!(frame, STUB_FRAME);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unreadable_slot_keeps_link() {
        let radio = testing::powered_radio();
        let mut service = testing::stub_service();
        for characteristic in &mut service.characteristics {
            if characteristic.uuid == testing::accel_uuid() {
                characteristic.read = false;
            }
        }
        radio.advertise(&service).unwrap();
        let mut config = config();
        for descriptor in &mut config.descriptors {
            if descriptor.slot == Slot::Channel(SensorChannel::Accel) {
                descriptor.access = AccessFlags::NOTIFY;
            }
        }
        let mut central = CentralSession::new(Arc::new(radio.clone()), Cooperative, config);
        central
            .subscribe_sensor(SensorChannel::Gyro, |_| {})
            .await
            .unwrap();

        let err = central.read_sensor(SensorChannel::Accel).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidDescriptor);
        assert_eq!(central.state(), LinkState::Notifying);
        assert!(central.is_subscribed(Slot::Channel(SensorChannel::Gyro)));
        assert_eq!(radio.open_links(), 1);
        assert_eq!(radio.stats().reads, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_scan_waits_for_late_advertiser() {
        let radio = testing::powered_radio();
        let advertiser = radio.clone();
        let late = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            advertiser.advertise(&testing::stub_service()).unwrap();
        });
        let mut central = session(&radio);

        central
            .connect_with(RetryBudget::new(1, Duration::ZERO))
            .await
            .unwrap();

        late.join().unwrap();
        assert_eq!(central.state(), LinkState::Ready);
        assert_eq!(radio.stats().connect_attempts, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_scan_gives_up_at_timeout() {
        let radio = testing::powered_radio();
        let mut central = session(&radio);
        let started = std::time::Instant::now();

        let err = central
            .connect_with(RetryBudget::new(1, Duration::ZERO))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(radio.stats().connect_attempts, 0);
        assert_eq!(central.state(), LinkState::Idle);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_worker_failure_on_subscribe_demotes() {
        let radio = testing::radio_with_stub_peripheral();
        let mut central = session(&radio);
        central.connect().await.unwrap();

        radio.crash_on_subscribe(true);
        let err = central
            .subscribe_sensor(SensorChannel::Mag, |_| {})
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Worker);
        assert_eq!(central.state(), LinkState::Idle);
        assert!(central.registry().is_none());
        assert_eq!(radio.open_links(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_descriptors_fail_before_scanning() {
        let radio = testing::radio_with_stub_peripheral();
        let mut config = config();
        config.descriptors.clear();
        let mut central = CentralSession::new(Arc::new(radio.clone()), Cooperative, config);

        let err = central.connect().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidDescriptor);
        assert_eq!(radio.stats().connect_attempts, 0);
        assert_eq!(central.state(), LinkState::Idle);
    }

    #[test]
    fn test_config_from_settings() {
        let mut settings = Settings::default();
        settings.central.peer_address = Some(testing::PEER_ADDRESS.to_string());
        settings.link = LinkSettings::default();
        let config = CentralConfig::from_settings(&settings);
        assert_eq!(config.descriptors.len(), 3);
        assert_eq!(config.retry, RetryBudget::default());
        assert_eq!(config.filter.service_uuid, Some(testing::service_uuid()));
    }
}
