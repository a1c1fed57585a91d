use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// One of the three sensors carried by the IMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorChannel {
    Accel,
    Gyro,
    Mag,
}

impl SensorChannel {
    /// Fixed wire order of the composite frame.
    pub const ALL: [SensorChannel; 3] = [Self::Accel, Self::Gyro, Self::Mag];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Accel => "accel",
            Self::Gyro => "gyro",
            Self::Mag => "mag",
        }
    }
}

impl fmt::Display for SensorChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

impl FromStr for SensorChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "accel" | "acc" => Ok(Self::Accel),
            "gyro" | "gyr" => Ok(Self::Gyro),
            "mag" => Ok(Self::Mag),
            other => Err(format!("unknown sensor channel '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Self::X, Self::Y, Self::Z];
}

/// Raw values as reported by the sensor driver, before narrowing.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AxisReading {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl AxisReading {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// One 3-axis snapshot of a single channel in the int16 wire profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SensorFrame {
    x: i16,
    y: i16,
    z: i16,
}

impl SensorFrame {
    pub const fn new(x: i16, y: i16, z: i16) -> Self {
        Self { x, y, z }
    }

    pub fn x(&self) -> i16 {
        self.x
    }

    pub fn y(&self) -> i16 {
        self.y
    }

    pub fn z(&self) -> i16 {
        self.z
    }

    pub fn as_tuple(&self) -> (i16, i16, i16) {
        (self.x, self.y, self.z)
    }
}

impl fmt::Display for SensorFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X={}, Y={}, Z={}", self.x, self.y, self.z)
    }
}

/// Accel, gyro and mag readings packed into one float payload.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CompositeFrame {
    accel: [f32; 3],
    gyro: [f32; 3],
    mag: [f32; 3],
}

impl CompositeFrame {
    pub fn new(accel: [f32; 3], gyro: [f32; 3], mag: [f32; 3]) -> Self {
        Self { accel, gyro, mag }
    }

    pub fn from_array(values: [f32; 9]) -> Self {
        Self {
            accel: [values[0], values[1], values[2]],
            gyro: [values[3], values[4], values[5]],
            mag: [values[6], values[7], values[8]],
        }
    }

    pub fn to_array(&self) -> [f32; 9] {
        let mut out = [0.0f32; 9];
        out[0..3].copy_from_slice(&self.accel);
        out[3..6].copy_from_slice(&self.gyro);
        out[6..9].copy_from_slice(&self.mag);
        out
    }

    pub fn channel(&self, channel: SensorChannel) -> [f32; 3] {
        match channel {
            SensorChannel::Accel => self.accel,
            SensorChannel::Gyro => self.gyro,
            SensorChannel::Mag => self.mag,
        }
    }
}

/// Wire profile of a characteristic payload.
///
/// The per-channel int16 profile and the composite float profile are two
/// separate formats; a characteristic carries exactly one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameProfile {
    PerChannelInt16,
    CompositeFloat32,
}

/// A logical data slot exposed by the IMU service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Channel(SensorChannel),
    Composite,
}

impl Slot {
    pub const COUNT: usize = 4;

    pub fn index(&self) -> usize {
        match self {
            Self::Channel(SensorChannel::Accel) => 0,
            Self::Channel(SensorChannel::Gyro) => 1,
            Self::Channel(SensorChannel::Mag) => 2,
            Self::Composite => 3,
        }
    }

    pub fn profile(&self) -> FrameProfile {
        match self {
            Self::Channel(_) => FrameProfile::PerChannelInt16,
            Self::Composite => FrameProfile::CompositeFloat32,
        }
    }
}

impl From<SensorChannel> for Slot {
    fn from(channel: SensorChannel) -> Self {
        Self::Channel(channel)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(channel) => write!(f, "{}", channel),
            Self::Composite => f.write_str("composite"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessFlags {
    pub read: bool,
    pub notify: bool,
}

impl AccessFlags {
    pub const READ: Self = Self {
        read: true,
        notify: false,
    };
    pub const NOTIFY: Self = Self {
        read: false,
        notify: true,
    };
    pub const READ_NOTIFY: Self = Self {
        read: true,
        notify: true,
    };
}

/// Static description of one exposed characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    pub service_id: Uuid,
    pub slot: Slot,
    pub uuid: Uuid,
    pub access: AccessFlags,
}

impl CharacteristicDescriptor {
    pub fn new(service_id: Uuid, slot: Slot, uuid: Uuid, access: AccessFlags) -> Self {
        Self {
            service_id,
            slot,
            uuid,
            access,
        }
    }

    pub fn profile(&self) -> FrameProfile {
        self.slot.profile()
    }
}

/// Central-side connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Idle,
    Scanning,
    Connecting,
    ServicesResolving,
    Ready,
    Reading,
    Notifying,
    Disconnecting,
    Error,
}

impl LinkState {
    /// Ready for reads, possibly with live subscriptions.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready | Self::Reading | Self::Notifying)
    }

    pub fn can_transition_to(&self, next: LinkState) -> bool {
        use LinkState::*;
        match (self, next) {
            (Idle, Scanning) => true,
            (Scanning, Connecting) | (Connecting, ServicesResolving) => true,
            (ServicesResolving, Ready) => true,
            // A failed attempt gives the partial link back and rescans.
            (Scanning | Connecting | ServicesResolving, Idle) => true,
            (Ready, Reading) | (Reading, Ready) => true,
            (Notifying, Reading) | (Reading, Notifying) => true,
            (Ready, Notifying) | (Notifying, Ready) => true,
            (Ready | Notifying, Disconnecting) => true,
            (Disconnecting, Idle) => true,
            (Scanning | Connecting | ServicesResolving | Ready | Reading | Notifying, Error) => {
                true
            }
            (Error, Idle) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Peripheral-side serving state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeripheralState {
    Idle,
    Configuring,
    Advertising,
    Serving,
    Stopping,
}

impl PeripheralState {
    pub fn can_transition_to(&self, next: PeripheralState) -> bool {
        use PeripheralState::*;
        match (self, next) {
            (Idle, Configuring) => true,
            (Configuring, Advertising) | (Advertising, Serving) => true,
            // Failed detection or a rejected advertisement.
            (Configuring | Advertising, Idle) => true,
            (Configuring | Advertising | Serving, Stopping) => true,
            (Stopping, Idle) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PeripheralState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Attempt budget for one `connect` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    pub max_attempts: u32,
    pub delay_between_attempts: Duration,
}

impl RetryBudget {
    pub fn new(max_attempts: u32, delay_between_attempts: Duration) -> Self {
        Self {
            max_attempts,
            delay_between_attempts,
        }
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_between_attempts: Duration::from_secs(2),
        }
    }
}

/// Bounded wait for service resolution after a link comes up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveWait {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl ResolveWait {
    /// Number of polls that fit in the timeout, at least one.
    pub fn max_polls(&self) -> u32 {
        if self.poll_interval.is_zero() {
            return 1;
        }
        let polls = self.timeout.as_nanos().div_ceil(self.poll_interval.as_nanos());
        polls.clamp(1, u32::MAX as u128) as u32
    }
}

impl Default for ResolveWait {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// How a serving peripheral keeps its characteristics fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeModel {
    /// The radio stack invokes read callbacks on demand.
    OnDemand,
    /// Re-pack and publish notify-capable characteristics every interval.
    Refresh { interval: Duration },
}

#[derive(Debug, Clone)]
pub enum LinkEvent {
    CentralTransition { from: LinkState, to: LinkState },
    PeripheralTransition {
        from: PeripheralState,
        to: PeripheralState,
    },
    Status(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
