//! Advertising data helpers
//!
//! Scan filtering for IMU peripherals, matched on address, advertised
//! service UUID or local name.

use super::{DiscoveredDevice, ServiceDefinition};
use std::time::Duration;
use uuid::Uuid;

const AD_TYPE_FLAGS: u8 = 0x01;
const AD_TYPE_SHORT_LOCAL_NAME: u8 = 0x08;
const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;
const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

/// Longest name that still fits a 31-byte legacy advertisement with flags.
const MAX_NAME_LEN: usize = 26;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub address: Option<String>,
    pub name: Option<String>,
    pub service_uuid: Option<Uuid>,
    pub timeout: Duration,
}

impl ScanFilter {
    pub fn matches(&self, device: &DiscoveredDevice) -> bool {
        if let Some(address) = &self.address {
            if !device.address.eq_ignore_ascii_case(address) {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if device.name.as_deref() != Some(name.as_str()) {
                return false;
            }
        }
        if let Some(uuid) = &self.service_uuid {
            if !device.service_uuids.contains(uuid) {
                return false;
            }
        }
        true
    }

    /// Human-readable peer description for logs and errors.
    pub fn describe(&self) -> String {
        match (&self.address, &self.name) {
            (Some(address), _) => address.clone(),
            (None, Some(name)) => format!("'{}'", name),
            (None, None) => match &self.service_uuid {
                Some(uuid) => format!("service {}", uuid),
                None => "any device".to_string(),
            },
        }
    }
}

/// Build the legacy advertising payload for a service definition.
///
/// ```text
/// 0x02 0x01 0x06            : Flags (LE General Discoverable, BR/EDR unsupported)
/// len  0x09 <name>          : Complete Local Name
/// len  0xFF <id lo> <id hi> : Manufacturer Specific Data
/// ```
pub fn encode_advertising_data(service: &ServiceDefinition) -> Vec<u8> {
    let mut data = vec![0x02, AD_TYPE_FLAGS, 0x06];

    let name = service.local_name.as_bytes();
    if !name.is_empty() {
        let name = &name[..name.len().min(MAX_NAME_LEN)];
        data.push(name.len() as u8 + 1);
        data.push(AD_TYPE_COMPLETE_LOCAL_NAME);
        data.extend_from_slice(name);
    }

    if let Some((company_id, payload)) = &service.manufacturer_data {
        data.push(payload.len() as u8 + 3);
        data.push(AD_TYPE_MANUFACTURER_DATA);
        data.extend_from_slice(&company_id.to_le_bytes());
        data.extend_from_slice(payload);
    }

    data
}

/// Extract the local name from raw advertising data.
///
/// Walks the length-type-value AD structures and prefers the complete name
/// over the shortened one. Returns `None` for truncated or non-UTF-8 data.
pub fn advertised_name(adv_data: &[u8]) -> Option<String> {
    let mut short_name = None;
    let mut i = 0;

    while i < adv_data.len() {
        let length = adv_data[i] as usize;
        if length == 0 {
            break;
        }
        let end = i + 1 + length;
        if end > adv_data.len() {
            return None;
        }
        let ad_type = adv_data[i + 1];
        let payload = &adv_data[i + 2..end];

        match ad_type {
            AD_TYPE_COMPLETE_LOCAL_NAME => {
                return std::str::from_utf8(payload).ok().map(str::to_string);
            }
            AD_TYPE_SHORT_LOCAL_NAME => {
                short_name = std::str::from_utf8(payload).ok().map(str::to_string);
            }
            _ => {}
        }
        i = end;
    }

    short_name
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(address: &str, name: Option<&str>) -> DiscoveredDevice {
        DiscoveredDevice {
            address: address.to_string(),
            name: name.map(str::to_string),
            service_uuids: Vec::new(),
            rssi: Some(-60),
        }
    }

    #[test]
    fn test_advertised_name_complete() {
        // flags, then complete local name "IMU_Sensor"
        let mut data = vec![0x02, 0x01, 0x06, 0x0B, 0x09];
        data.extend_from_slice(b"IMU_Sensor");
        assert_eq!(advertised_name(&data), Some("IMU_Sensor".to_string()));
    }

    #[test]
    fn test_advertised_name_short_fallback() {
        let data = [0x04, 0x08, b'I', b'M', b'U'];
        assert_eq!(advertised_name(&data), Some("IMU".to_string()));
    }

    #[test]
    fn test_advertised_name_truncated() {
        let data = [0x0B, 0x09, b'I', b'M'];
        assert_eq!(advertised_name(&data), None);
        assert_eq!(advertised_name(&[]), None);
    }

    #[test]
    fn test_encoded_advertisement_carries_name() {
        let service = ServiceDefinition {
            service_uuid: Uuid::nil(),
            local_name: "IMU_Sensor".to_string(),
            manufacturer_data: Some((0xFFFF, vec![0x01, 0x02])),
            characteristics: Vec::new(),
        };
        let data = encode_advertising_data(&service);
        assert_eq!(&data[0..3], &[0x02, 0x01, 0x06]);
        assert_eq!(&data[data.len() - 6..], &[0x05, 0xFF, 0xFF, 0xFF, 0x01, 0x02]);
        assert_eq!(advertised_name(&data), Some("IMU_Sensor".to_string()));
    }

    #[test]
    fn test_filter_matching() {
        let filter = ScanFilter {
            address: Some("AA:BB:CC:DD:EE:FF".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&device("aa:bb:cc:dd:ee:ff", None)));
        assert!(!filter.matches(&device("11:22:33:44:55:66", None)));

        let by_name = ScanFilter {
            name: Some("IMU_Sensor".to_string()),
            ..Default::default()
        };
        assert!(by_name.matches(&device("11:22:33:44:55:66", Some("IMU_Sensor"))));
        assert!(!by_name.matches(&device("11:22:33:44:55:66", None)));
    }
}
