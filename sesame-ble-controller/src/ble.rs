//! Adapter access and scanning for Sesame locks

use std::time::Duration;

use btleplug::api::{Central, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter};
use btleplug::platform::{Adapter, Manager};

use sesame_proto::ble::{AdvertisementBuilder, TargetIdentity, ad_types, uuid_to_uuid16};

use crate::ControllerError;

/// A device seen during a scan
#[derive(Debug, Clone)]
pub struct LockDevice {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
    /// Advertisement as rebuilt from the platform's parsed properties
    pub advertisement: Vec<u8>,
    pub is_sesame: bool,
}

/// Get a Bluetooth adapter by index
pub async fn get_adapter(index: usize) -> Result<Adapter, ControllerError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    let count = adapters.len();
    if count == 0 {
        return Err(ControllerError::NoAdapter);
    }
    adapters
        .into_iter()
        .nth(index)
        .ok_or(ControllerError::AdapterIndex { index, count })
}

/// Rebuild advertisement bytes from the fields the platform already parsed
///
/// Host stacks do not hand out the raw payload, but the lock is matched on
/// its AD structures, so they are re-encoded here.
pub fn advertisement_bytes(props: &PeripheralProperties) -> Vec<u8> {
    let mut builder = AdvertisementBuilder::new();

    let services16: Vec<u16> = props.services.iter().filter_map(uuid_to_uuid16).collect();
    if !services16.is_empty() {
        builder = builder.complete_services16(&services16);
    }
    if let Some(name) = &props.local_name {
        builder = builder.local_name(name);
    }
    for (uuid, data) in &props.service_data {
        if let Some(id) = uuid_to_uuid16(uuid) {
            let mut element = id.to_le_bytes().to_vec();
            element.extend_from_slice(data);
            builder = builder.element(ad_types::SERVICE_DATA_16, &element);
        }
    }
    for (company, data) in &props.manufacturer_data {
        let mut element = company.to_le_bytes().to_vec();
        element.extend_from_slice(data);
        builder = builder.element(ad_types::MANUFACTURER_DATA, &element);
    }

    builder.build()
}

/// Scan for BLE devices
///
/// Returns every device seen; locks have `is_sesame = true`.
pub async fn scan(adapter: &Adapter, duration: Duration) -> Result<Vec<LockDevice>, ControllerError> {
    let target = TargetIdentity::SESAME;

    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(duration).await;

    let peripherals = adapter.peripherals().await?;
    let mut devices = Vec::new();

    for peripheral in peripherals {
        if let Some(props) = peripheral.properties().await? {
            let advertisement = advertisement_bytes(&props);
            devices.push(LockDevice {
                name: props.local_name.unwrap_or_else(|| "Unknown".to_string()),
                address: peripheral.address().to_string(),
                rssi: props.rssi,
                is_sesame: target.matches_advertisement(&advertisement),
                advertisement,
            });
        }
    }

    adapter.stop_scan().await?;
    Ok(devices)
}
