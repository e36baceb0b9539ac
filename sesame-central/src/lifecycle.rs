//! Connection lifecycle: scan, connect, discover, enable notifications
//!
//! Each step issues exactly one transport request and then waits for the
//! event that completes it. A step that finds nothing parks the manager in
//! its phase until the link drops; a disconnect from any phase clears every
//! handle and starts scanning again.

use log::{debug, error, info, warn};

use sesame_proto::ble::TargetIdentity;

use crate::transport::{
    AddressType, BdAddr, BleTransport, Characteristic, ConnectionHandle, ScanParams, Service,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionPhase {
    Idle,
    Scanning,
    Connecting,
    ServiceDiscovery,
    CharacteristicDiscovery,
    NotificationSetup,
    Ready,
}

/// Owner of the single link to the lock
#[derive(Debug)]
pub struct ConnectionManager {
    target: TargetIdentity,
    scan_params: ScanParams,
    phase: ConnectionPhase,
    peer: Option<(BdAddr, AddressType)>,
    handle: Option<ConnectionHandle>,
    service: Option<Service>,
    write_characteristic: Option<Characteristic>,
    notify_characteristic: Option<Characteristic>,
}

impl ConnectionManager {
    pub fn new(target: TargetIdentity, scan_params: ScanParams) -> Self {
        Self {
            target,
            scan_params,
            phase: ConnectionPhase::Idle,
            peer: None,
            handle: None,
            service: None,
            write_characteristic: None,
            notify_characteristic: None,
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn peer(&self) -> Option<(BdAddr, AddressType)> {
        self.peer
    }

    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.handle
    }

    pub fn service(&self) -> Option<&Service> {
        self.service.as_ref()
    }

    pub fn write_characteristic(&self) -> Option<&Characteristic> {
        self.write_characteristic.as_ref()
    }

    pub fn notify_characteristic(&self) -> Option<&Characteristic> {
        self.notify_characteristic.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.phase == ConnectionPhase::Ready
    }

    fn transition(&mut self, to: ConnectionPhase) {
        debug!("connection phase {:?} -> {:?}", self.phase, to);
        self.phase = to;
    }

    fn reject(&self, operation: &str) {
        warn!("{operation} ignored in phase {:?}", self.phase);
    }

    /// Idle -> Scanning; no-op in every other phase
    pub fn start<T: BleTransport>(&mut self, transport: &mut T) {
        if self.phase != ConnectionPhase::Idle {
            debug!("start ignored in phase {:?}", self.phase);
            return;
        }
        self.scan(transport);
    }

    fn scan<T: BleTransport>(&mut self, transport: &mut T) {
        info!("Starting BLE scan");
        match transport.scan_start(self.scan_params) {
            Ok(()) => self.transition(ConnectionPhase::Scanning),
            Err(e) => {
                error!("scan start failed: {e}");
                self.transition(ConnectionPhase::Idle);
            }
        }
    }

    /// Returns true when the advertisement matched and a connect was issued
    pub fn on_advertisement<T: BleTransport>(
        &mut self,
        address: BdAddr,
        address_type: AddressType,
        data: &[u8],
        transport: &mut T,
    ) -> bool {
        if self.phase != ConnectionPhase::Scanning {
            return false;
        }
        if !self.target.matches_advertisement(data) {
            return false;
        }

        info!("Found lock at {address}, connecting");
        if let Err(e) = transport.scan_stop() {
            // keep going, the connect request is what matters
            warn!("scan stop failed: {e}");
        }
        if let Err(e) = transport.connect(address, address_type) {
            error!("connect to {address} failed: {e}");
            // scanning was already stopped, so nothing else would wake us up
            self.scan(transport);
            return false;
        }

        self.peer = Some((address, address_type));
        self.transition(ConnectionPhase::Connecting);
        true
    }

    pub fn on_connected<T: BleTransport>(&mut self, handle: ConnectionHandle, transport: &mut T) {
        if self.phase != ConnectionPhase::Connecting {
            self.reject("connection complete");
            return;
        }

        info!("Connected, handle={}", handle.0);
        self.handle = Some(handle);
        self.transition(ConnectionPhase::ServiceDiscovery);

        if let Err(e) = transport.discover_services_by_uuid16(handle, self.target.service_uuid16) {
            error!("service discovery failed: {e}");
        }
    }

    pub fn on_service_found(&mut self, service: Service) {
        if self.phase != ConnectionPhase::ServiceDiscovery {
            self.reject("service result");
            return;
        }
        if let Some(previous) = &self.service {
            warn!(
                "second service result {:?}, replacing {:?}",
                service.uuid, previous.uuid
            );
        }
        info!("Service found ({}..{})", service.start_handle, service.end_handle);
        self.service = Some(service);
    }

    pub fn on_service_discovery_complete<T: BleTransport>(&mut self, transport: &mut T) {
        if self.phase != ConnectionPhase::ServiceDiscovery {
            self.reject("service discovery complete");
            return;
        }
        let (Some(handle), Some(service)) = (self.handle, self.service) else {
            warn!("service discovery finished without the lock service");
            return;
        };

        info!("Discovering characteristics");
        self.transition(ConnectionPhase::CharacteristicDiscovery);
        if let Err(e) = transport.discover_characteristics(handle, &service) {
            error!("characteristic discovery failed: {e}");
        }
    }

    pub fn on_characteristic_found(&mut self, characteristic: Characteristic) {
        if self.phase != ConnectionPhase::CharacteristicDiscovery {
            self.reject("characteristic result");
            return;
        }
        if characteristic.uuid == self.target.write_uuid {
            info!("Write characteristic found");
            self.write_characteristic = Some(characteristic);
        } else if characteristic.uuid == self.target.notify_uuid {
            info!("Notify characteristic found");
            self.notify_characteristic = Some(characteristic);
        } else {
            debug!("skipping characteristic {}", characteristic.uuid);
        }
    }

    pub fn on_characteristic_discovery_complete<T: BleTransport>(&mut self, transport: &mut T) {
        if self.phase != ConnectionPhase::CharacteristicDiscovery {
            self.reject("characteristic discovery complete");
            return;
        }
        let (Some(handle), Some(_), Some(notify)) = (
            self.handle,
            self.write_characteristic,
            self.notify_characteristic,
        ) else {
            warn!(
                "characteristic discovery incomplete (write: {}, notify: {})",
                self.write_characteristic.is_some(),
                self.notify_characteristic.is_some()
            );
            return;
        };

        info!("Enabling notifications");
        self.transition(ConnectionPhase::NotificationSetup);
        if let Err(e) = transport.write_client_characteristic_configuration(handle, &notify, true) {
            error!("enabling notifications failed: {e}");
        }
    }

    /// Returns true when the link just became ready for the handshake
    pub fn on_notification_setup_complete(&mut self) -> bool {
        if self.phase != ConnectionPhase::NotificationSetup {
            self.reject("notification setup complete");
            return false;
        }
        info!("Link ready");
        self.transition(ConnectionPhase::Ready);
        true
    }

    /// Returns false for a disconnect of some other, stale link
    pub fn on_disconnected<T: BleTransport>(
        &mut self,
        handle: ConnectionHandle,
        transport: &mut T,
    ) -> bool {
        if let Some(current) = self.handle
            && current != handle
        {
            debug!("ignoring disconnect of stale handle {}", handle.0);
            return false;
        }
        if self.handle.is_none() && self.phase == ConnectionPhase::Scanning {
            debug!("ignoring disconnect of handle {} while scanning", handle.0);
            return false;
        }

        info!("Disconnected, handle={}", handle.0);
        self.clear();
        self.scan(transport);
        true
    }

    /// Ask the transport to drop the current link
    ///
    /// Recovery still happens through the disconnection event.
    pub fn disconnect<T: BleTransport>(&mut self, transport: &mut T) {
        match self.handle {
            Some(handle) => {
                if let Err(e) = transport.disconnect(handle) {
                    error!("disconnect failed: {e}");
                }
            }
            None => debug!("disconnect requested without a link"),
        }
    }

    fn clear(&mut self) {
        self.peer = None;
        self.handle = None;
        self.service = None;
        self.write_characteristic = None;
        self.notify_characteristic = None;
    }
}
