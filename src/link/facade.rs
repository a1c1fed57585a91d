//! Session Facade
//!
//! Entry points for the two execution models over the one state machine.
//!
//! - [`AsyncCentral`] / [`AsyncPeripheral`]: the sessions driven on a tokio
//!   runtime, radio calls on the blocking pool.
//! - [`BlockingCentral`] / [`BlockingPeripheral`]: the same sessions driven
//!   to completion on the calling thread.
//!
//! Scoped acquisition releases the link on every exit path: normal return,
//! error, panic, and (async only) cancellation of the hosting task.

use crate::domain::error::Result;
use crate::domain::models::{
    CharacteristicDescriptor, CompositeFrame, LinkEvent, LinkState, PeripheralState,
    RetryBudget, SensorChannel, SensorFrame, Slot,
};
use crate::infrastructure::radio::{RadioStack, ServiceDefinition};
use crate::infrastructure::sensor::SensorSource;
use crate::link::central::{CentralConfig, CentralSession};
use crate::link::execution::{Blocking, Cooperative};
use crate::link::peripheral::{PeripheralConfig, PeripheralSession, StopHandle};
use futures::executor::block_on;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;

pub type AsyncCentral<R> = CentralSession<R, Cooperative>;
pub type AsyncPeripheral<R> = PeripheralSession<R, Cooperative>;

impl<R> CentralSession<R, Cooperative>
where
    R: RadioStack + ?Sized + 'static,
{
    pub fn cooperative(radio: Arc<R>, config: CentralConfig) -> Self {
        Self::new(radio, Cooperative, config)
    }

    /// Connect, run `body`, then disconnect however `body` ends.
    ///
    /// A panic in `body` is resumed after the link is released. If the
    /// returned future is dropped early the link is torn down synchronously.
    pub async fn with_connection<T, F>(&mut self, body: F) -> Result<T>
    where
        T: Send,
        F: for<'s> FnOnce(&'s mut Self) -> BoxFuture<'s, Result<T>>,
    {
        self.connect().await?;

        let mut scope = ConnectionScope { session: self };
        let outcome = AssertUnwindSafe(body(&mut *scope.session))
            .catch_unwind()
            .await;
        scope.session.disconnect().await;
        drop(scope);

        match outcome {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

impl<R> PeripheralSession<R, Cooperative>
where
    R: RadioStack + ?Sized + 'static,
{
    pub fn cooperative(radio: Arc<R>, config: PeripheralConfig) -> Self {
        Self::new(radio, Cooperative, config)
    }

    /// Start advertising, run `body`, then stop however `body` ends.
    pub async fn with_advertising<T, F>(&mut self, body: F) -> Result<T>
    where
        T: Send,
        F: for<'s> FnOnce(&'s mut Self) -> BoxFuture<'s, Result<T>>,
    {
        self.start().await?;

        let mut scope = AdvertisingScope { session: self };
        let outcome = AssertUnwindSafe(body(&mut *scope.session))
            .catch_unwind()
            .await;
        scope.session.stop().await;
        drop(scope);

        match outcome {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

struct AdvertisingScope<'a, R>
where
    R: RadioStack + ?Sized + 'static,
{
    session: &'a mut PeripheralSession<R, Cooperative>,
}

impl<R> Drop for AdvertisingScope<'_, R>
where
    R: RadioStack + ?Sized + 'static,
{
    fn drop(&mut self) {
        self.session.teardown_now();
    }
}

struct ConnectionScope<'a, R>
where
    R: RadioStack + ?Sized + 'static,
{
    session: &'a mut CentralSession<R, Cooperative>,
}

impl<R> Drop for ConnectionScope<'_, R>
where
    R: RadioStack + ?Sized + 'static,
{
    fn drop(&mut self) {
        self.session.teardown_now();
    }
}

/// Central session for callers without an async runtime.
pub struct BlockingCentral<R>
where
    R: RadioStack + ?Sized + 'static,
{
    session: CentralSession<R, Blocking>,
}

impl<R> BlockingCentral<R>
where
    R: RadioStack + ?Sized + 'static,
{
    pub fn new(radio: Arc<R>, config: CentralConfig) -> Self {
        Self {
            session: CentralSession::new(radio, Blocking, config),
        }
    }

    pub fn with_events(self, sender: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            session: self.session.with_events(sender),
        }
    }

    pub fn state(&self) -> LinkState {
        self.session.state()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn connect(&mut self) -> Result<()> {
        block_on(self.session.connect())
    }

    pub fn connect_with(&mut self, budget: RetryBudget) -> Result<()> {
        block_on(self.session.connect_with(budget))
    }

    pub fn read_sensor(&mut self, channel: SensorChannel) -> Result<SensorFrame> {
        block_on(self.session.read_sensor(channel))
    }

    pub fn read_composite(&mut self) -> Result<CompositeFrame> {
        block_on(self.session.read_composite())
    }

    pub fn subscribe_sensor<F>(&mut self, channel: SensorChannel, on_frame: F) -> Result<()>
    where
        F: Fn(SensorFrame) + Send + Sync + 'static,
    {
        block_on(self.session.subscribe_sensor(channel, on_frame))
    }

    pub fn subscribe_composite<F>(&mut self, on_frame: F) -> Result<()>
    where
        F: Fn(CompositeFrame) + Send + Sync + 'static,
    {
        block_on(self.session.subscribe_composite(on_frame))
    }

    pub fn unsubscribe(&mut self, slot: Slot) -> Result<()> {
        block_on(self.session.unsubscribe(slot))
    }

    pub fn disconnect(&mut self) {
        block_on(self.session.disconnect())
    }

    pub fn reset(&mut self) {
        self.session.reset()
    }

    /// Connect and hand back a guard that disconnects when dropped.
    pub fn connection(&mut self) -> Result<ConnectionGuard<'_, R>> {
        self.connect()?;
        Ok(ConnectionGuard { central: self })
    }
}

pub struct ConnectionGuard<'a, R>
where
    R: RadioStack + ?Sized + 'static,
{
    central: &'a mut BlockingCentral<R>,
}

impl<R> Deref for ConnectionGuard<'_, R>
where
    R: RadioStack + ?Sized + 'static,
{
    type Target = BlockingCentral<R>;

    fn deref(&self) -> &Self::Target {
        self.central
    }
}

impl<R> DerefMut for ConnectionGuard<'_, R>
where
    R: RadioStack + ?Sized + 'static,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.central
    }
}

impl<R> Drop for ConnectionGuard<'_, R>
where
    R: RadioStack + ?Sized + 'static,
{
    fn drop(&mut self) {
        self.central.session.teardown_now();
    }
}

/// Peripheral session for callers without an async runtime.
pub struct BlockingPeripheral<R>
where
    R: RadioStack + ?Sized + 'static,
{
    session: PeripheralSession<R, Blocking>,
}

impl<R> BlockingPeripheral<R>
where
    R: RadioStack + ?Sized + 'static,
{
    pub fn new(radio: Arc<R>, config: PeripheralConfig) -> Self {
        Self {
            session: PeripheralSession::new(radio, Blocking, config),
        }
    }

    pub fn with_events(self, sender: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            session: self.session.with_events(sender),
        }
    }

    pub fn state(&self) -> PeripheralState {
        self.session.state()
    }

    pub fn service(&self) -> Option<&ServiceDefinition> {
        self.session.service()
    }

    pub fn configure(
        &mut self,
        sensor: Arc<dyn SensorSource>,
        descriptors: Vec<CharacteristicDescriptor>,
    ) -> Result<()> {
        block_on(self.session.configure(sensor, descriptors))
    }

    pub fn start(&mut self) -> Result<()> {
        block_on(self.session.start())
    }

    pub fn serve_until(&mut self, stop: StopHandle) -> Result<()> {
        block_on(self.session.serve_until(stop))
    }

    pub fn stop(&mut self) {
        block_on(self.session.stop())
    }

    /// Start advertising and hand back a guard that stops when dropped.
    pub fn advertising(&mut self) -> Result<AdvertisingGuard<'_, R>> {
        self.start()?;
        Ok(AdvertisingGuard { peripheral: self })
    }
}

pub struct AdvertisingGuard<'a, R>
where
    R: RadioStack + ?Sized + 'static,
{
    peripheral: &'a mut BlockingPeripheral<R>,
}

impl<R> Deref for AdvertisingGuard<'_, R>
where
    R: RadioStack + ?Sized + 'static,
{
    type Target = BlockingPeripheral<R>;

    fn deref(&self) -> &Self::Target {
        self.peripheral
    }
}

impl<R> DerefMut for AdvertisingGuard<'_, R>
where
    R: RadioStack + ?Sized + 'static,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.peripheral
    }
}

impl<R> Drop for AdvertisingGuard<'_, R>
where
    R: RadioStack + ?Sized + 'static,
{
    fn drop(&mut self) {
        self.peripheral.session.teardown_now();
    }
}
