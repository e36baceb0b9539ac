//! btleplug backed transport
//!
//! The controller only enqueues [`TransportRequest`]s through a
//! [`RequestSender`]. The [`Driver`] task executes them against the adapter
//! and turns btleplug central events and notification streams into
//! [`TransportEvent`]s on a single queue.
//!
//! btleplug hides ATT handles, so the driver hands out its own: services and
//! characteristics are numbered in discovery order, a characteristic taking a
//! declaration handle followed by its value handle.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use btleplug::api::{
    AddressType as PlatformAddressType, Central, CentralEvent,
    Characteristic as GattCharacteristic, Peripheral as _, ScanFilter, Service as GattService,
    WriteType,
};
use btleplug::platform::{Adapter, Peripheral, PeripheralId};
use data_encoding::HEXLOWER;
use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use sesame_central::{
    AddressType, BdAddr, BleTransport, Characteristic, ConnectionHandle, ScanParams, Service,
    TransportEvent, TransportRequest,
};
use sesame_proto::ble::uuid16_to_uuid;

use crate::ControllerError;
use crate::ble::advertisement_bytes;

// HCI disconnect reasons
const REMOTE_USER_TERMINATED: u8 = 0x13;
const LOCAL_HOST_TERMINATED: u8 = 0x16;
const CONNECTION_FAILED: u8 = 0x3E;

// ATT status codes
const ATT_SUCCESS: u8 = 0x00;
const ATT_ATTRIBUTE_NOT_FOUND: u8 = 0x0A;
const ATT_UNLIKELY_ERROR: u8 = 0x0E;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("BLE driver is not running")]
pub struct DriverGone;

/// [`BleTransport`] half handed to the controller
#[derive(Debug, Clone)]
pub struct RequestSender {
    tx: mpsc::UnboundedSender<TransportRequest>,
}

impl RequestSender {
    fn send(&self, request: TransportRequest) -> Result<(), DriverGone> {
        self.tx.send(request).map_err(|_| DriverGone)
    }
}

impl BleTransport for RequestSender {
    type Error = DriverGone;

    fn scan_start(&mut self, params: ScanParams) -> Result<(), Self::Error> {
        self.send(TransportRequest::ScanStart(params))
    }

    fn scan_stop(&mut self) -> Result<(), Self::Error> {
        self.send(TransportRequest::ScanStop)
    }

    fn connect(&mut self, address: BdAddr, address_type: AddressType) -> Result<(), Self::Error> {
        self.send(TransportRequest::Connect {
            address,
            address_type,
        })
    }

    fn disconnect(&mut self, handle: ConnectionHandle) -> Result<(), Self::Error> {
        self.send(TransportRequest::Disconnect(handle))
    }

    fn discover_services_by_uuid16(
        &mut self,
        handle: ConnectionHandle,
        uuid16: u16,
    ) -> Result<(), Self::Error> {
        self.send(TransportRequest::DiscoverServicesByUuid16 { handle, uuid16 })
    }

    fn discover_characteristics(
        &mut self,
        handle: ConnectionHandle,
        service: &Service,
    ) -> Result<(), Self::Error> {
        self.send(TransportRequest::DiscoverCharacteristics {
            handle,
            service: *service,
        })
    }

    fn write_characteristic(
        &mut self,
        handle: ConnectionHandle,
        characteristic: &Characteristic,
        value: &[u8],
    ) -> Result<(), Self::Error> {
        self.send(TransportRequest::WriteCharacteristic {
            handle,
            characteristic: *characteristic,
            value: value.to_vec(),
        })
    }

    fn write_client_characteristic_configuration(
        &mut self,
        handle: ConnectionHandle,
        characteristic: &Characteristic,
        enable_notify: bool,
    ) -> Result<(), Self::Error> {
        self.send(TransportRequest::WriteClientCharacteristicConfiguration {
            handle,
            characteristic: *characteristic,
            enable_notify,
        })
    }
}

/// Request and event queues between a controller and its driver
pub fn channel() -> (
    RequestSender,
    mpsc::UnboundedReceiver<TransportRequest>,
    mpsc::UnboundedSender<TransportEvent>,
    mpsc::UnboundedReceiver<TransportEvent>,
) {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    (RequestSender { tx: request_tx }, request_rx, event_tx, event_rx)
}

/// Assign handles to discovered services and characteristics
///
/// Returns the services and a value handle -> characteristic map.
fn layout<I>(services: I) -> (Vec<Service>, BTreeMap<u16, GattCharacteristic>)
where
    I: IntoIterator<Item = GattService>,
{
    let mut out = Vec::new();
    let mut characteristics = BTreeMap::new();
    let mut next: u16 = 1;

    for service in services {
        let start = next;
        for characteristic in service.characteristics {
            next = next.saturating_add(2);
            characteristics.insert(next, characteristic);
        }
        out.push(Service {
            start_handle: start,
            end_handle: next,
            uuid: service.uuid,
        });
        next = next.saturating_add(1);
    }

    (out, characteristics)
}

fn to_characteristic(value_handle: u16, characteristic: &GattCharacteristic) -> Characteristic {
    Characteristic {
        start_handle: value_handle - 1,
        value_handle,
        end_handle: value_handle,
        properties: characteristic.properties.bits(),
        uuid: characteristic.uuid,
    }
}

struct Link {
    handle: ConnectionHandle,
    peripheral: Peripheral,
    characteristics: BTreeMap<u16, GattCharacteristic>,
    notifications: Option<JoinHandle<()>>,
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(task) = self.notifications.take() {
            task.abort();
        }
    }
}

/// Owns the adapter and the single peripheral link
pub struct Driver {
    adapter: Adapter,
    events: mpsc::UnboundedSender<TransportEvent>,
    connect_timeout: Duration,
    scanning: bool,
    seen: HashMap<BdAddr, PeripheralId>,
    link: Option<Link>,
    next_handle: u16,
}

impl Driver {
    pub fn new(
        adapter: Adapter,
        events: mpsc::UnboundedSender<TransportEvent>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            adapter,
            events,
            connect_timeout,
            scanning: false,
            seen: HashMap::new(),
            link: None,
            next_handle: 0,
        }
    }

    /// Execute requests until every [`RequestSender`] is dropped
    pub async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<TransportRequest>,
    ) -> Result<(), ControllerError> {
        let mut central = self.adapter.events().await?;
        self.emit(TransportEvent::BluetoothReady);

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.execute(request).await,
                    None => break,
                },
                event = central.next() => match event {
                    Some(event) => self.on_central_event(event).await,
                    None => {
                        warn!("central event stream ended");
                        break;
                    }
                },
            }
        }

        if let Some(link) = self.link.take()
            && let Err(e) = link.peripheral.disconnect().await
        {
            warn!("disconnect on shutdown: {e}");
        }
        if self.scanning {
            let _ = self.adapter.stop_scan().await;
        }
        Ok(())
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("event queue closed");
        }
    }

    fn allocate_handle(&mut self) -> ConnectionHandle {
        // 0 is never handed out
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        ConnectionHandle(self.next_handle)
    }

    fn link_for(&self, handle: ConnectionHandle) -> Option<&Link> {
        let link = self.link.as_ref().filter(|link| link.handle == handle);
        if link.is_none() {
            warn!("request for unknown link handle {}", handle.0);
        }
        link
    }

    async fn execute(&mut self, request: TransportRequest) {
        match request {
            TransportRequest::ScanStart(params) => self.scan_start(params).await,
            TransportRequest::ScanStop => self.scan_stop().await,
            TransportRequest::Connect { address, .. } => self.connect(address).await,
            TransportRequest::Disconnect(handle) => self.disconnect(handle).await,
            TransportRequest::DiscoverServicesByUuid16 { handle, uuid16 } => {
                self.discover_services(handle, uuid16).await
            }
            TransportRequest::DiscoverCharacteristics { handle, service } => {
                self.discover_characteristics(handle, &service)
            }
            TransportRequest::WriteCharacteristic {
                handle,
                characteristic,
                value,
            } => self.write(handle, &characteristic, &value).await,
            TransportRequest::WriteClientCharacteristicConfiguration {
                handle,
                characteristic,
                enable_notify,
            } => {
                self.configure_notifications(handle, &characteristic, enable_notify)
                    .await
            }
        }
    }

    async fn scan_start(&mut self, params: ScanParams) {
        // scan timing is chosen by the host stack
        debug!("scan start {params:?}");
        if let Err(e) = self.adapter.start_scan(ScanFilter::default()).await {
            error!("start scan: {e}");
            return;
        }
        self.scanning = true;

        // already known devices may not be announced again
        match self.adapter.peripherals().await {
            Ok(peripherals) => {
                for peripheral in peripherals {
                    self.report(&peripheral.id()).await;
                }
            }
            Err(e) => debug!("listing peripherals: {e}"),
        }
    }

    async fn scan_stop(&mut self) {
        self.scanning = false;
        if let Err(e) = self.adapter.stop_scan().await {
            warn!("stop scan: {e}");
        }
    }

    async fn report(&mut self, id: &PeripheralId) {
        if !self.scanning {
            return;
        }
        let peripheral = match self.adapter.peripheral(id).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                debug!("peripheral {id:?}: {e}");
                return;
            }
        };
        let props = match peripheral.properties().await {
            Ok(Some(props)) => props,
            Ok(None) => return,
            Err(e) => {
                debug!("properties of {id:?}: {e}");
                return;
            }
        };

        let address = BdAddr(props.address.into_inner());
        let address_type = match props.address_type {
            Some(PlatformAddressType::Random) => AddressType::Random,
            _ => AddressType::Public,
        };
        self.seen.insert(address, id.clone());

        self.emit(TransportEvent::AdvertisementReport {
            address,
            address_type,
            rssi: props.rssi,
            data: advertisement_bytes(&props),
        });
    }

    async fn connect(&mut self, address: BdAddr) {
        let handle = self.allocate_handle();
        let failed = TransportEvent::DisconnectionComplete {
            handle,
            reason: CONNECTION_FAILED,
        };

        let Some(id) = self.seen.get(&address).cloned() else {
            warn!("connect to unknown device {address}");
            self.emit(failed);
            return;
        };
        let peripheral = match self.adapter.peripheral(&id).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                error!("connect to {address}: {e}");
                self.emit(failed);
                return;
            }
        };

        match tokio::time::timeout(self.connect_timeout, peripheral.connect()).await {
            Ok(Ok(())) => {
                info!("Connected to {address}");
                self.link = Some(Link {
                    handle,
                    peripheral,
                    characteristics: BTreeMap::new(),
                    notifications: None,
                });
                self.emit(TransportEvent::ConnectionComplete { handle });
            }
            Ok(Err(e)) => {
                error!("connect to {address}: {e}");
                self.emit(failed);
            }
            Err(_) => {
                error!(
                    "connect to {address} timed out after {:?}",
                    self.connect_timeout
                );
                let _ = peripheral.disconnect().await;
                self.emit(failed);
            }
        }
    }

    async fn disconnect(&mut self, handle: ConnectionHandle) {
        let Some(link) = self.link.take_if(|link| link.handle == handle) else {
            debug!("disconnect for unknown handle {}", handle.0);
            return;
        };
        if let Err(e) = link.peripheral.disconnect().await {
            warn!("disconnect: {e}");
        }
        self.emit(TransportEvent::DisconnectionComplete {
            handle,
            reason: LOCAL_HOST_TERMINATED,
        });
    }

    async fn discover_services(&mut self, handle: ConnectionHandle, uuid16: u16) {
        let Some(peripheral) = self.link_for(handle).map(|link| link.peripheral.clone()) else {
            self.emit(TransportEvent::QueryComplete {
                status: ATT_ATTRIBUTE_NOT_FOUND,
            });
            return;
        };
        if let Err(e) = peripheral.discover_services().await {
            error!("service discovery: {e}");
            self.emit(TransportEvent::QueryComplete {
                status: ATT_UNLIKELY_ERROR,
            });
            return;
        }

        let (services, characteristics) = layout(peripheral.services());
        if let Some(link) = self.link.as_mut().filter(|link| link.handle == handle) {
            link.characteristics = characteristics;
        }

        let wanted = uuid16_to_uuid(uuid16);
        for service in services.into_iter().filter(|s| s.uuid == wanted) {
            self.emit(TransportEvent::ServiceQueryResult { service });
        }
        self.emit(TransportEvent::QueryComplete {
            status: ATT_SUCCESS,
        });
    }

    fn discover_characteristics(&mut self, handle: ConnectionHandle, service: &Service) {
        let found: Vec<Characteristic> = match self.link_for(handle) {
            Some(link) => link
                .characteristics
                .range(service.start_handle..=service.end_handle)
                .map(|(value_handle, c)| to_characteristic(*value_handle, c))
                .collect(),
            None => Vec::new(),
        };

        for characteristic in found {
            self.emit(TransportEvent::CharacteristicQueryResult { characteristic });
        }
        self.emit(TransportEvent::QueryComplete {
            status: ATT_SUCCESS,
        });
    }

    fn resolve(
        &self,
        handle: ConnectionHandle,
        characteristic: &Characteristic,
    ) -> Option<(Peripheral, GattCharacteristic)> {
        let link = self.link_for(handle)?;
        let target = link.characteristics.get(&characteristic.value_handle)?;
        Some((link.peripheral.clone(), target.clone()))
    }

    async fn write(
        &mut self,
        handle: ConnectionHandle,
        characteristic: &Characteristic,
        value: &[u8],
    ) {
        let Some((peripheral, target)) = self.resolve(handle, characteristic) else {
            self.emit(TransportEvent::WriteComplete {
                status: ATT_ATTRIBUTE_NOT_FOUND,
            });
            return;
        };

        debug!("write {} <- {}", characteristic.value_handle, HEXLOWER.encode(value));
        let status = match peripheral.write(&target, value, WriteType::WithResponse).await {
            Ok(()) => ATT_SUCCESS,
            Err(e) => {
                error!("write to {}: {e}", target.uuid);
                ATT_UNLIKELY_ERROR
            }
        };
        self.emit(TransportEvent::WriteComplete { status });
    }

    async fn configure_notifications(
        &mut self,
        handle: ConnectionHandle,
        characteristic: &Characteristic,
        enable: bool,
    ) {
        let Some((peripheral, target)) = self.resolve(handle, characteristic) else {
            self.emit(TransportEvent::QueryComplete {
                status: ATT_ATTRIBUTE_NOT_FOUND,
            });
            return;
        };

        if !enable {
            let status = match peripheral.unsubscribe(&target).await {
                Ok(()) => ATT_SUCCESS,
                Err(e) => {
                    error!("unsubscribe: {e}");
                    ATT_UNLIKELY_ERROR
                }
            };
            self.emit(TransportEvent::QueryComplete { status });
            return;
        }

        // the stream must exist before the CCCD write, the lock publishes right away
        let stream = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("notification stream: {e}");
                self.emit(TransportEvent::QueryComplete {
                    status: ATT_UNLIKELY_ERROR,
                });
                return;
            }
        };
        let task = self.forward_notifications(handle, stream);
        match self.link.as_mut().filter(|link| link.handle == handle) {
            Some(link) => {
                if let Some(previous) = link.notifications.replace(task) {
                    previous.abort();
                }
            }
            None => task.abort(),
        }

        let status = match peripheral.subscribe(&target).await {
            Ok(()) => ATT_SUCCESS,
            Err(e) => {
                error!("subscribe to {}: {e}", target.uuid);
                ATT_UNLIKELY_ERROR
            }
        };
        self.emit(TransportEvent::QueryComplete { status });
    }

    fn forward_notifications<S>(&self, handle: ConnectionHandle, mut stream: S) -> JoinHandle<()>
    where
        S: futures::Stream<Item = btleplug::api::ValueNotification> + Send + Unpin + 'static,
    {
        let handles: HashMap<Uuid, u16> = self
            .link
            .as_ref()
            .map(|link| {
                link.characteristics
                    .iter()
                    .map(|(value_handle, c)| (c.uuid, *value_handle))
                    .collect()
            })
            .unwrap_or_default();
        let events = self.events.clone();

        tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                let Some(&value_handle) = handles.get(&notification.uuid) else {
                    continue;
                };
                debug!(
                    "notify {} -> {} on link {}",
                    value_handle,
                    HEXLOWER.encode(&notification.value),
                    handle.0
                );
                let event = TransportEvent::Notification {
                    value_handle,
                    value: notification.value,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
        })
    }

    async fn on_central_event(&mut self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ServicesAdvertisement { id, .. }
            | CentralEvent::ServiceDataAdvertisement { id, .. }
            | CentralEvent::ManufacturerDataAdvertisement { id, .. } => self.report(&id).await,
            CentralEvent::DeviceDisconnected(id) => {
                let Some(link) = self.link.take_if(|link| link.peripheral.id() == id) else {
                    return;
                };
                info!("Peripheral disconnected");
                self.emit(TransportEvent::DisconnectionComplete {
                    handle: link.handle,
                    reason: REMOTE_USER_TERMINATED,
                });
            }
            _ => {}
        }
    }
}
