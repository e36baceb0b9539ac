//! Event loop: one driver task, one controller, one queue between them

use std::time::Duration;

use log::{info, warn};
use rand::rngs::OsRng;
use tokio::sync::mpsc;

use sesame_central::{Controller, StatusObserver, TransportEvent};
use sesame_proto::ble::TargetIdentity;

use crate::ControllerError;
use crate::ble::get_adapter;
use crate::config::ControllerConfig;
use crate::driver::{self, Driver, RequestSender};

pub type HostController<O> = Controller<OsRng, O>;

/// Wait for the next event, giving up after `stall` when set
///
/// `Ok(None)` means the queue closed, `Err(())` that the stall timer fired.
async fn next_event(
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    stall: Option<Duration>,
) -> Result<Option<TransportEvent>, ()> {
    match stall {
        Some(limit) => tokio::time::timeout(limit, events.recv())
            .await
            .map_err(|_| ()),
        None => Ok(events.recv().await),
    }
}

/// Stall limit for the next wait
///
/// Only runs while a link is up and not yet logged in; before the connect
/// completes there is nothing to drop and the driver's connect timeout applies.
fn watchdog<O>(controller: &HostController<O>, stall_timeout: Option<Duration>) -> Option<Duration>
where
    O: StatusObserver,
{
    stall_timeout.filter(|_| !controller.is_settled() && controller.link().handle().is_some())
}

/// Drive `controller` from `events` until `done` returns true or `shutdown` resolves
pub async fn drive<O, F, S>(
    controller: &mut HostController<O>,
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    transport: &mut RequestSender,
    stall_timeout: Option<Duration>,
    mut done: F,
    shutdown: S,
) -> Result<(), ControllerError>
where
    O: StatusObserver,
    F: FnMut(&HostController<O>) -> bool,
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        let stall = watchdog(controller, stall_timeout);
        let next = tokio::select! {
            biased;
            () = &mut shutdown => {
                info!("Shutdown requested ({})", controller.status());
                return Ok(());
            }
            next = next_event(events, stall) => next,
        };
        let event = match next {
            Ok(Some(event)) => event,
            Ok(None) => return Err(ControllerError::DriverStopped),
            Err(()) => {
                warn!(
                    "no progress for {:?} in phase {:?}",
                    stall_timeout.unwrap_or_default(),
                    controller.link().phase()
                );
                controller.abort_link(transport);
                continue;
            }
        };

        controller.handle(&event, transport);
        if done(controller) {
            return Ok(());
        }
    }
}

/// Ask the driver to drop whatever link is up
fn release_link<O>(controller: &mut HostController<O>, transport: &mut RequestSender)
where
    O: StatusObserver,
{
    if controller.link().handle().is_some() {
        controller.abort_link(transport);
    }
}

/// Run a controller against the configured adapter until `done` returns true
/// or `shutdown` resolves
///
/// The link is dropped before returning either way; the observer is handed back.
pub async fn run<O, F, S>(
    config: &ControllerConfig,
    observer: O,
    done: F,
    shutdown: S,
) -> Result<O, ControllerError>
where
    O: StatusObserver,
    F: FnMut(&HostController<O>) -> bool,
    S: Future<Output = ()>,
{
    let adapter = get_adapter(config.adapter).await?;
    let (mut transport, requests, event_tx, mut events) = driver::channel();
    let driver = tokio::spawn(Driver::new(adapter, event_tx, config.connect_timeout()).run(requests));

    let mut controller = Controller::new(OsRng, observer)
        .with_link(TargetIdentity::SESAME, config.scan_params())
        .with_default_tag(config.default_tag.as_bytes());

    let result = drive(
        &mut controller,
        &mut events,
        &mut transport,
        config.stall_timeout(),
        done,
        shutdown,
    )
    .await;

    info!("Stopping controller ({})", controller.status());
    release_link(&mut controller, &mut transport);
    // closing the request queue ends the driver once it drained it
    drop(transport);
    match driver.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            // the driver failing is what stopped the event queue
            if matches!(result, Err(ControllerError::DriverStopped)) {
                return Err(e);
            }
            warn!("driver: {e}");
        }
        Err(e) => warn!("driver task: {e}"),
    }

    result.map(|()| controller.into_observer())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;

    use sesame_central::{
        AddressType, BdAddr, ConnectionHandle, ConnectionPhase, DeviceStatus, Quiet,
        TransportRequest,
    };

    fn advertisement() -> TransportEvent {
        TransportEvent::AdvertisementReport {
            address: BdAddr([7; 6]),
            address_type: AddressType::Random,
            rssi: Some(-70),
            data: vec![0x03, 0x03, 0x81, 0xFD],
        }
    }

    #[tokio::test]
    async fn closed_queue_stops_the_loop() {
        let (mut transport, _requests, event_tx, mut events) = driver::channel();
        let mut controller = Controller::new(OsRng, Quiet);
        event_tx.send(TransportEvent::BluetoothReady).unwrap();
        drop(event_tx);

        let result = drive(
            &mut controller,
            &mut events,
            &mut transport,
            None,
            |_| false,
            pending(),
        )
        .await;
        assert!(matches!(result, Err(ControllerError::DriverStopped)));
        assert_eq!(controller.status(), DeviceStatus::Scanning);
    }

    #[tokio::test]
    async fn done_predicate_ends_the_loop() {
        let (mut transport, mut requests, event_tx, mut events) = driver::channel();
        let mut controller = Controller::new(OsRng, Quiet);
        event_tx.send(TransportEvent::BluetoothReady).unwrap();
        event_tx.send(advertisement()).unwrap();

        drive(
            &mut controller,
            &mut events,
            &mut transport,
            None,
            |c| c.status() == DeviceStatus::Connecting,
            pending(),
        )
        .await
        .unwrap();

        assert!(matches!(
            requests.recv().await,
            Some(TransportRequest::ScanStart(_))
        ));
        assert_eq!(requests.recv().await, Some(TransportRequest::ScanStop));
        assert!(matches!(
            requests.recv().await,
            Some(TransportRequest::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn stalled_link_is_dropped_and_scanning_resumes() {
        let (mut transport, mut requests, event_tx, mut events) = driver::channel();
        let mut controller = Controller::new(OsRng, Quiet);
        event_tx.send(TransportEvent::BluetoothReady).unwrap();
        event_tx.send(advertisement()).unwrap();
        event_tx
            .send(TransportEvent::ConnectionComplete {
                handle: ConnectionHandle(1),
            })
            .unwrap();

        // a transport that answers disconnect requests and ignores the rest
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                if let TransportRequest::Disconnect(handle) = request {
                    let _ = event_tx.send(TransportEvent::DisconnectionComplete {
                        handle,
                        reason: 0x16,
                    });
                }
            }
        });

        let mut connected = false;
        let run = drive(
            &mut controller,
            &mut events,
            &mut transport,
            Some(Duration::from_millis(20)),
            |c| {
                connected |= c.link().phase() == ConnectionPhase::ServiceDiscovery;
                connected && c.link().phase() == ConnectionPhase::Scanning
            },
            pending(),
        );
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(controller.status(), DeviceStatus::Scanning);
        assert!(controller.link().handle().is_none());
    }

    #[test]
    fn watchdog_waits_for_a_link() {
        let mut controller = Controller::new(OsRng, Quiet);
        let mut t: Vec<TransportRequest> = Vec::new();
        let limit = Some(Duration::from_secs(5));
        controller.start(&mut t);
        assert_eq!(watchdog(&controller, limit), None);

        controller.handle(&advertisement(), &mut t);
        assert_eq!(controller.link().phase(), ConnectionPhase::Connecting);
        assert_eq!(watchdog(&controller, limit), None);

        controller.handle(
            &TransportEvent::ConnectionComplete {
                handle: ConnectionHandle(1),
            },
            &mut t,
        );
        assert_eq!(watchdog(&controller, limit), limit);
        assert_eq!(watchdog(&controller, None), None);
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop_and_link_is_released() {
        let (mut transport, mut requests, event_tx, mut events) = driver::channel();
        let mut controller = Controller::new(OsRng, Quiet);
        event_tx.send(TransportEvent::BluetoothReady).unwrap();
        event_tx.send(advertisement()).unwrap();
        event_tx
            .send(TransportEvent::ConnectionComplete {
                handle: ConnectionHandle(3),
            })
            .unwrap();

        let run = drive(
            &mut controller,
            &mut events,
            &mut transport,
            None,
            |_| false,
            tokio::time::sleep(Duration::from_millis(50)),
        );
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(controller.link().handle(), Some(ConnectionHandle(3)));

        release_link(&mut controller, &mut transport);
        drop(transport);
        let mut sent = Vec::new();
        while let Some(request) = requests.recv().await {
            sent.push(request);
        }
        assert_eq!(
            sent.last(),
            Some(&TransportRequest::Disconnect(ConnectionHandle(3)))
        );
        drop(event_tx);
    }
}
