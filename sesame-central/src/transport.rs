//! BLE transport contract consumed by the controller
//!
//! The transport is whatever owns the radio: a btleplug adapter on a host, a
//! vendor stack on a microcontroller, or a recorder in tests. Requests are
//! fire-and-forget; their outcome comes back later as a [`TransportEvent`].

use std::convert::Infallible;
use std::fmt;

use uuid::Uuid;

/// Link handle assigned by the transport once a connection is established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u16);

/// 48-bit device address, most significant byte first
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr(pub [u8; 6]);

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl fmt::Debug for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BdAddr({self})")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressType {
    Public,
    Random,
}

/// Scan timing in units of 0.625 ms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParams {
    pub active: bool,
    pub interval: u16,
    pub window: u16,
}

impl ScanParams {
    /// Passive scan, 30 ms window every 30 ms
    pub const SESAME: Self = Self {
        active: false,
        interval: 0x0030,
        window: 0x0030,
    };
}

impl Default for ScanParams {
    fn default() -> Self {
        Self::SESAME
    }
}

/// A primary service found by discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Service {
    pub start_handle: u16,
    pub end_handle: u16,
    pub uuid: Uuid,
}

/// A characteristic found by discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Characteristic {
    pub start_handle: u16,
    pub value_handle: u16,
    pub end_handle: u16,
    pub properties: u8,
    pub uuid: Uuid,
}

/// Everything the transport reports back, in delivery order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    BluetoothReady,
    AdvertisementReport {
        address: BdAddr,
        address_type: AddressType,
        rssi: Option<i16>,
        data: Vec<u8>,
    },
    ConnectionComplete {
        handle: ConnectionHandle,
    },
    DisconnectionComplete {
        handle: ConnectionHandle,
        reason: u8,
    },
    ServiceQueryResult {
        service: Service,
    },
    CharacteristicQueryResult {
        characteristic: Characteristic,
    },
    CharacteristicValueQueryResult {
        value_handle: u16,
        value: Vec<u8>,
    },
    /// End of the outstanding GATT query; `status` is the ATT error code, 0 on success
    QueryComplete {
        status: u8,
    },
    Notification {
        value_handle: u16,
        value: Vec<u8>,
    },
    WriteComplete {
        status: u8,
    },
}

/// Trait for BLE central implementations
///
/// Platform crates implement this on top of their BLE stack. Every method only
/// issues the request and must not block.
pub trait BleTransport {
    /// Error type for requests the transport refuses synchronously
    type Error: fmt::Display;

    fn scan_start(&mut self, params: ScanParams) -> Result<(), Self::Error>;

    fn scan_stop(&mut self) -> Result<(), Self::Error>;

    fn connect(&mut self, address: BdAddr, address_type: AddressType) -> Result<(), Self::Error>;

    fn disconnect(&mut self, handle: ConnectionHandle) -> Result<(), Self::Error>;

    fn discover_services_by_uuid16(
        &mut self,
        handle: ConnectionHandle,
        uuid16: u16,
    ) -> Result<(), Self::Error>;

    fn discover_characteristics(
        &mut self,
        handle: ConnectionHandle,
        service: &Service,
    ) -> Result<(), Self::Error>;

    fn write_characteristic(
        &mut self,
        handle: ConnectionHandle,
        characteristic: &Characteristic,
        value: &[u8],
    ) -> Result<(), Self::Error>;

    fn write_client_characteristic_configuration(
        &mut self,
        handle: ConnectionHandle,
        characteristic: &Characteristic,
        enable_notify: bool,
    ) -> Result<(), Self::Error>;
}

/// A transport request in data form
///
/// Queue-based transports (an async driver task, a test recorder) carry
/// requests as values instead of executing them in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportRequest {
    ScanStart(ScanParams),
    ScanStop,
    Connect {
        address: BdAddr,
        address_type: AddressType,
    },
    Disconnect(ConnectionHandle),
    DiscoverServicesByUuid16 {
        handle: ConnectionHandle,
        uuid16: u16,
    },
    DiscoverCharacteristics {
        handle: ConnectionHandle,
        service: Service,
    },
    WriteCharacteristic {
        handle: ConnectionHandle,
        characteristic: Characteristic,
        value: Vec<u8>,
    },
    WriteClientCharacteristicConfiguration {
        handle: ConnectionHandle,
        characteristic: Characteristic,
        enable_notify: bool,
    },
}

/// Recording transport: every request is appended, nothing ever fails
impl BleTransport for Vec<TransportRequest> {
    type Error = Infallible;

    fn scan_start(&mut self, params: ScanParams) -> Result<(), Self::Error> {
        self.push(TransportRequest::ScanStart(params));
        Ok(())
    }

    fn scan_stop(&mut self) -> Result<(), Self::Error> {
        self.push(TransportRequest::ScanStop);
        Ok(())
    }

    fn connect(&mut self, address: BdAddr, address_type: AddressType) -> Result<(), Self::Error> {
        self.push(TransportRequest::Connect {
            address,
            address_type,
        });
        Ok(())
    }

    fn disconnect(&mut self, handle: ConnectionHandle) -> Result<(), Self::Error> {
        self.push(TransportRequest::Disconnect(handle));
        Ok(())
    }

    fn discover_services_by_uuid16(
        &mut self,
        handle: ConnectionHandle,
        uuid16: u16,
    ) -> Result<(), Self::Error> {
        self.push(TransportRequest::DiscoverServicesByUuid16 { handle, uuid16 });
        Ok(())
    }

    fn discover_characteristics(
        &mut self,
        handle: ConnectionHandle,
        service: &Service,
    ) -> Result<(), Self::Error> {
        self.push(TransportRequest::DiscoverCharacteristics {
            handle,
            service: *service,
        });
        Ok(())
    }

    fn write_characteristic(
        &mut self,
        handle: ConnectionHandle,
        characteristic: &Characteristic,
        value: &[u8],
    ) -> Result<(), Self::Error> {
        self.push(TransportRequest::WriteCharacteristic {
            handle,
            characteristic: *characteristic,
            value: value.to_vec(),
        });
        Ok(())
    }

    fn write_client_characteristic_configuration(
        &mut self,
        handle: ConnectionHandle,
        characteristic: &Characteristic,
        enable_notify: bool,
    ) -> Result<(), Self::Error> {
        self.push(TransportRequest::WriteClientCharacteristicConfiguration {
            handle,
            characteristic: *characteristic,
            enable_notify,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bd_addr_display() {
        let addr = BdAddr([0xC0, 0x01, 0x02, 0x0A, 0xBB, 0xFF]);
        assert_eq!(addr.to_string(), "C0:01:02:0A:BB:FF");
    }

    #[test]
    fn recorder_keeps_request_order() {
        let mut recorder: Vec<TransportRequest> = Vec::new();
        recorder.scan_start(ScanParams::SESAME).unwrap();
        recorder.scan_stop().unwrap();
        recorder
            .connect(BdAddr([1, 2, 3, 4, 5, 6]), AddressType::Random)
            .unwrap();

        assert_eq!(
            recorder,
            vec![
                TransportRequest::ScanStart(ScanParams::SESAME),
                TransportRequest::ScanStop,
                TransportRequest::Connect {
                    address: BdAddr([1, 2, 3, 4, 5, 6]),
                    address_type: AddressType::Random,
                },
            ]
        );
    }
}
