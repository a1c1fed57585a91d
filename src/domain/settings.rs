use crate::domain::models::{
    AccessFlags, CharacteristicDescriptor, FrameProfile, ResolveWait, RetryBudget, SensorChannel,
    ServeModel, Slot,
};
use crate::infrastructure::radio::ScanFilter;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;
use uuid::{uuid, Uuid};

pub const IMU_SERVICE_UUID: Uuid = uuid!("1b9998a2-1234-5678-1234-56789abcdef0");
pub const ACCEL_CHAR_UUID: Uuid = uuid!("2713d05a-1234-5678-1234-56789abcdef1");
pub const GYRO_CHAR_UUID: Uuid = uuid!("2713d05b-1234-5678-1234-56789abcdef2");
pub const MAG_CHAR_UUID: Uuid = uuid!("2713d05c-1234-5678-1234-56789abcdef3");
/// Environmental Sensing service, reused by the composite profile.
pub const COMPOSITE_SERVICE_UUID: Uuid = uuid!("0000181a-0000-1000-8000-00805f9b34fb");
pub const COMPOSITE_CHAR_UUID: Uuid = uuid!("00002a56-0000-1000-8000-00805f9b34fb");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

/// Service layout shared by both roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSettings {
    #[serde(default = "default_profile")]
    pub profile: FrameProfile,
    #[serde(default = "default_service_uuid")]
    pub service_uuid: Uuid,
    #[serde(default = "default_accel_uuid")]
    pub accel_char_uuid: Uuid,
    #[serde(default = "default_gyro_uuid")]
    pub gyro_char_uuid: Uuid,
    #[serde(default = "default_mag_uuid")]
    pub mag_char_uuid: Uuid,
    #[serde(default = "default_composite_service_uuid")]
    pub composite_service_uuid: Uuid,
    #[serde(default = "default_composite_char_uuid")]
    pub composite_char_uuid: Uuid,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            service_uuid: default_service_uuid(),
            accel_char_uuid: default_accel_uuid(),
            gyro_char_uuid: default_gyro_uuid(),
            mag_char_uuid: default_mag_uuid(),
            composite_service_uuid: default_composite_service_uuid(),
            composite_char_uuid: default_composite_char_uuid(),
        }
    }
}

impl LinkSettings {
    /// Characteristics exposed under the configured profile.
    pub fn descriptors(&self) -> Vec<CharacteristicDescriptor> {
        match self.profile {
            FrameProfile::PerChannelInt16 => SensorChannel::ALL
                .iter()
                .map(|channel| {
                    CharacteristicDescriptor::new(
                        self.service_uuid,
                        Slot::Channel(*channel),
                        self.char_uuid(*channel),
                        AccessFlags::READ_NOTIFY,
                    )
                })
                .collect(),
            FrameProfile::CompositeFloat32 => vec![CharacteristicDescriptor::new(
                self.composite_service_uuid,
                Slot::Composite,
                self.composite_char_uuid,
                AccessFlags::READ_NOTIFY,
            )],
        }
    }

    pub fn advertised_service(&self) -> Uuid {
        match self.profile {
            FrameProfile::PerChannelInt16 => self.service_uuid,
            FrameProfile::CompositeFloat32 => self.composite_service_uuid,
        }
    }

    pub fn char_uuid(&self, channel: SensorChannel) -> Uuid {
        match channel {
            SensorChannel::Accel => self.accel_char_uuid,
            SensorChannel::Gyro => self.gyro_char_uuid,
            SensorChannel::Mag => self.mag_char_uuid,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentralSettings {
    /// MAC address of the peripheral; matched case-insensitively.
    #[serde(default)]
    pub peer_address: Option<String>,
    /// Advertised local name, used when no address is configured.
    #[serde(default = "default_peer_name")]
    pub peer_name: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,
    #[serde(default = "default_resolve_poll_ms")]
    pub resolve_poll_ms: u64,
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
}

impl Default for CentralSettings {
    fn default() -> Self {
        Self {
            peer_address: None,
            peer_name: default_peer_name(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            resolve_timeout_ms: default_resolve_timeout_ms(),
            resolve_poll_ms: default_resolve_poll_ms(),
            scan_timeout_ms: default_scan_timeout_ms(),
        }
    }
}

impl CentralSettings {
    pub fn retry_budget(&self) -> RetryBudget {
        RetryBudget::new(self.max_retries, Duration::from_millis(self.retry_delay_ms))
    }

    pub fn resolve_wait(&self) -> ResolveWait {
        ResolveWait {
            timeout: Duration::from_millis(self.resolve_timeout_ms),
            poll_interval: Duration::from_millis(self.resolve_poll_ms),
        }
    }

    pub fn scan_filter(&self, service_uuid: Uuid) -> ScanFilter {
        ScanFilter {
            address: self.peer_address.clone(),
            // An explicit address wins over the advertised name.
            name: if self.peer_address.is_some() {
                None
            } else {
                self.peer_name.clone()
            },
            service_uuid: Some(service_uuid),
            timeout: Duration::from_millis(self.scan_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeripheralSettings {
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
    /// Republish notify-capable characteristics every interval.
    #[serde(default = "default_true")]
    pub refresh_notifications: bool,
    #[serde(default = "default_manufacturer_id")]
    pub manufacturer_id: u16,
    #[serde(default = "default_manufacturer_data")]
    pub manufacturer_data: Vec<u8>,
}

impl Default for PeripheralSettings {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            update_interval_ms: default_update_interval_ms(),
            refresh_notifications: default_true(),
            manufacturer_id: default_manufacturer_id(),
            manufacturer_data: default_manufacturer_data(),
        }
    }
}

impl PeripheralSettings {
    pub fn serve_model(&self) -> ServeModel {
        if self.refresh_notifications {
            ServeModel::Refresh {
                interval: Duration::from_millis(self.update_interval_ms),
            }
        } else {
            ServeModel::OnDemand
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub link: LinkSettings,
    #[serde(default)]
    pub central: CentralSettings,
    #[serde(default)]
    pub peripheral: PeripheralSettings,
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "imu_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_profile() -> FrameProfile {
    FrameProfile::PerChannelInt16
}
fn default_service_uuid() -> Uuid {
    IMU_SERVICE_UUID
}
fn default_accel_uuid() -> Uuid {
    ACCEL_CHAR_UUID
}
fn default_gyro_uuid() -> Uuid {
    GYRO_CHAR_UUID
}
fn default_mag_uuid() -> Uuid {
    MAG_CHAR_UUID
}
fn default_composite_service_uuid() -> Uuid {
    COMPOSITE_SERVICE_UUID
}
fn default_composite_char_uuid() -> Uuid {
    COMPOSITE_CHAR_UUID
}
fn default_peer_name() -> Option<String> {
    Some(default_device_name())
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    2000
}
fn default_resolve_timeout_ms() -> u64 {
    15_000
}
fn default_resolve_poll_ms() -> u64 {
    500
}
fn default_scan_timeout_ms() -> u64 {
    5000
}
fn default_device_name() -> String {
    "IMU_Sensor".to_string()
}
fn default_update_interval_ms() -> u64 {
    100
}
fn default_manufacturer_id() -> u16 {
    0xFFFF
}
fn default_manufacturer_data() -> Vec<u8> {
    vec![0x01, 0x02]
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load from the per-user config directory, falling back to defaults.
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::load_from(settings_path))
    }

    /// Load from an explicit path, falling back to defaults.
    pub fn load_from(settings_path: impl Into<PathBuf>) -> Self {
        let settings_path = settings_path.into();
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                if settings_path.exists() {
                    warn!(
                        "Ignoring unreadable settings file {}: {}",
                        settings_path.display(),
                        e
                    );
                }
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("ImuLink");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{ "central": { "peer_address": "11:22:33:44:55:66", "max_retries": 5 } }"#,
        )
        .unwrap();

        let service = SettingsService::load_from(&path);
        let settings = service.get();
        assert_eq!(settings.central.max_retries, 5);
        assert_eq!(settings.central.retry_delay_ms, 2000);
        assert_eq!(settings.link.service_uuid, IMU_SERVICE_UUID);
        assert_eq!(settings.peripheral.device_name, "IMU_Sensor");
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut service = SettingsService::load_from(&path);
        service.get_mut().link.profile = FrameProfile::CompositeFloat32;
        service.get_mut().peripheral.update_interval_ms = 250;
        service.save().unwrap();

        let reloaded = SettingsService::load_from(&path);
        assert_eq!(reloaded.get().link.profile, FrameProfile::CompositeFloat32);
        assert_eq!(reloaded.get().peripheral.update_interval_ms, 250);
    }

    #[test]
    fn test_corrupt_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        let service = SettingsService::load_from(&path);
        assert_eq!(service.get().central.max_retries, 3);
    }

    #[test]
    fn test_descriptors_follow_profile() {
        let mut link = LinkSettings::default();
        let per_channel = link.descriptors();
        assert_eq!(per_channel.len(), 3);
        assert_eq!(per_channel[2].uuid, MAG_CHAR_UUID);

        link.profile = FrameProfile::CompositeFloat32;
        let composite = link.descriptors();
        assert_eq!(composite.len(), 1);
        assert_eq!(composite[0].slot, Slot::Composite);
        assert_eq!(link.advertised_service(), COMPOSITE_SERVICE_UUID);
    }

    #[test]
    fn test_scan_filter_prefers_address() {
        let mut central = CentralSettings::default();
        assert_eq!(
            central.scan_filter(IMU_SERVICE_UUID).name.as_deref(),
            Some("IMU_Sensor")
        );
        central.peer_address = Some("AA:BB:CC:DD:EE:FF".to_string());
        let filter = central.scan_filter(IMU_SERVICE_UUID);
        assert_eq!(filter.name, None);
        assert_eq!(filter.address.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
    }
}
