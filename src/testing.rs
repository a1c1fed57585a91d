//! Shared fixtures for unit tests.

use crate::domain::codec::{encode_axis_triple, encode_composite};
use crate::domain::models::{CharacteristicDescriptor, CompositeFrame, FrameProfile, SensorFrame};
use crate::domain::settings::{
    CentralSettings, LinkSettings, ACCEL_CHAR_UUID, COMPOSITE_CHAR_UUID, COMPOSITE_SERVICE_UUID,
    GYRO_CHAR_UUID, IMU_SERVICE_UUID, MAG_CHAR_UUID,
};
use crate::infrastructure::radio::simulated::SimulatedRadio;
use crate::infrastructure::radio::{CharacteristicDefinition, RadioStack, ServiceDefinition};
use std::sync::Arc;
use uuid::Uuid;

pub const PEER_ADDRESS: &str = "11:22:33:44:55:66";

/// Frame every stub channel serves: bytes `64 00 38 FF 2C 01`.
pub const STUB_FRAME: SensorFrame = SensorFrame::new(100, -200, 300);

pub fn service_uuid() -> Uuid {
    IMU_SERVICE_UUID
}

pub fn accel_uuid() -> Uuid {
    ACCEL_CHAR_UUID
}

pub fn gyro_uuid() -> Uuid {
    GYRO_CHAR_UUID
}

pub fn mag_uuid() -> Uuid {
    MAG_CHAR_UUID
}

pub fn channel_descriptors() -> Vec<CharacteristicDescriptor> {
    LinkSettings::default().descriptors()
}

pub fn composite_descriptors() -> Vec<CharacteristicDescriptor> {
    LinkSettings {
        profile: FrameProfile::CompositeFloat32,
        ..Default::default()
    }
    .descriptors()
}

pub fn stub_composite() -> CompositeFrame {
    CompositeFrame::new([0.0, 0.0, 1.0], [0.5, -0.5, 0.25], [30.0, -12.5, 44.0])
}

fn stub_characteristic(uuid: Uuid, bytes: Vec<u8>) -> CharacteristicDefinition {
    CharacteristicDefinition {
        uuid,
        read: true,
        notify: true,
        on_read: Arc::new(move || Ok(bytes.clone())),
    }
}

pub fn powered_radio() -> SimulatedRadio {
    let radio = SimulatedRadio::new(PEER_ADDRESS);
    radio.power(true).unwrap();
    radio
}

/// Per-channel IMU service serving [`STUB_FRAME`] on every channel.
pub fn stub_service() -> ServiceDefinition {
    let frame = encode_axis_triple(&STUB_FRAME).to_vec();
    ServiceDefinition {
        service_uuid: service_uuid(),
        local_name: "IMU_Sensor".to_string(),
        manufacturer_data: Some((0xFFFF, vec![0x01, 0x02])),
        characteristics: vec![
            stub_characteristic(accel_uuid(), frame.clone()),
            stub_characteristic(gyro_uuid(), frame.clone()),
            stub_characteristic(mag_uuid(), frame),
        ],
    }
}

/// Powered radio already advertising the per-channel IMU service.
pub fn radio_with_stub_peripheral() -> SimulatedRadio {
    let radio = powered_radio();
    radio.advertise(&stub_service()).unwrap();
    radio
}

/// Powered radio advertising the composite float service.
pub fn radio_with_composite_peripheral() -> SimulatedRadio {
    let radio = powered_radio();
    radio
        .advertise(&ServiceDefinition {
            service_uuid: COMPOSITE_SERVICE_UUID,
            local_name: "IMU_Sensor".to_string(),
            manufacturer_data: None,
            characteristics: vec![stub_characteristic(
                COMPOSITE_CHAR_UUID,
                encode_composite(&stub_composite()).to_vec(),
            )],
        })
        .unwrap();
    radio
}

/// Central settings with millisecond-scale waits.
pub fn fast_central_settings() -> CentralSettings {
    CentralSettings {
        peer_address: Some(PEER_ADDRESS.to_string()),
        peer_name: None,
        max_retries: 3,
        retry_delay_ms: 20,
        resolve_timeout_ms: 50,
        resolve_poll_ms: 5,
        scan_timeout_ms: 100,
    }
}
