//! Classify transport events by the phase they arrive in
//!
//! Pure function, no state: the controller owns both phases and applies
//! whatever [`Route`] comes back.

use crate::lifecycle::ConnectionPhase;
use crate::session::SessionPhase;
use crate::transport::{
    AddressType, BdAddr, Characteristic, ConnectionHandle, Service, TransportEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleInput<'a> {
    Start,
    Advertisement {
        address: BdAddr,
        address_type: AddressType,
        data: &'a [u8],
    },
    Connected(ConnectionHandle),
    Disconnected(ConnectionHandle),
    ServiceFound(Service),
    ServiceDiscoveryComplete,
    CharacteristicFound(Characteristic),
    CharacteristicDiscoveryComplete,
    NotificationSetupComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionInput<'a> {
    /// One notified segment from the lock
    Notification(&'a [u8]),
    LoginConfirmed,
    WriteComplete(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    Lifecycle(LifecycleInput<'a>),
    Session(SessionInput<'a>),
    Ignore(&'static str),
}

pub fn route(
    connection: ConnectionPhase,
    session: SessionPhase,
    event: &TransportEvent,
) -> Route<'_> {
    use ConnectionPhase as C;

    match event {
        TransportEvent::BluetoothReady => Route::Lifecycle(LifecycleInput::Start),
        TransportEvent::AdvertisementReport {
            address,
            address_type,
            data,
            ..
        } => {
            if connection != C::Scanning {
                return Route::Ignore("advertisement while not scanning");
            }
            Route::Lifecycle(LifecycleInput::Advertisement {
                address: *address,
                address_type: *address_type,
                data,
            })
        }
        TransportEvent::ConnectionComplete { handle } => {
            Route::Lifecycle(LifecycleInput::Connected(*handle))
        }
        TransportEvent::DisconnectionComplete { handle, .. } => {
            Route::Lifecycle(LifecycleInput::Disconnected(*handle))
        }
        TransportEvent::ServiceQueryResult { service } => {
            Route::Lifecycle(LifecycleInput::ServiceFound(*service))
        }
        TransportEvent::CharacteristicQueryResult { characteristic } => {
            Route::Lifecycle(LifecycleInput::CharacteristicFound(*characteristic))
        }
        TransportEvent::QueryComplete { .. } => match connection {
            C::ServiceDiscovery => Route::Lifecycle(LifecycleInput::ServiceDiscoveryComplete),
            C::CharacteristicDiscovery => {
                Route::Lifecycle(LifecycleInput::CharacteristicDiscoveryComplete)
            }
            C::NotificationSetup => Route::Lifecycle(LifecycleInput::NotificationSetupComplete),
            _ => Route::Ignore("query complete with no query outstanding"),
        },
        TransportEvent::CharacteristicValueQueryResult { .. } => {
            if connection == C::Ready && session == SessionPhase::LoggingIn {
                Route::Session(SessionInput::LoginConfirmed)
            } else {
                Route::Ignore("value read outside of login")
            }
        }
        TransportEvent::Notification { value, .. } => {
            // the lock publishes its challenge as soon as the CCCD is written,
            // possibly before the write completion arrives
            if connection >= C::NotificationSetup {
                Route::Session(SessionInput::Notification(value))
            } else {
                Route::Ignore("notification before notifications were enabled")
            }
        }
        TransportEvent::WriteComplete { status } => {
            if connection == C::Ready {
                Route::Session(SessionInput::WriteComplete(*status))
            } else {
                Route::Ignore("write completion outside of a ready link")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification() -> TransportEvent {
        TransportEvent::Notification {
            value_handle: 6,
            value: vec![0x03, 8, 14, 1, 2, 3, 4],
        }
    }

    #[test]
    fn query_complete_follows_connection_phase() {
        let done = TransportEvent::QueryComplete { status: 0 };
        let s = SessionPhase::Unregistered;

        assert_eq!(
            route(ConnectionPhase::ServiceDiscovery, s, &done),
            Route::Lifecycle(LifecycleInput::ServiceDiscoveryComplete)
        );
        assert_eq!(
            route(ConnectionPhase::CharacteristicDiscovery, s, &done),
            Route::Lifecycle(LifecycleInput::CharacteristicDiscoveryComplete)
        );
        assert_eq!(
            route(ConnectionPhase::NotificationSetup, s, &done),
            Route::Lifecycle(LifecycleInput::NotificationSetupComplete)
        );
        assert!(matches!(
            route(ConnectionPhase::Ready, s, &done),
            Route::Ignore(_)
        ));
    }

    #[test]
    fn notifications_go_to_session_once_enabled() {
        let event = notification();
        assert!(matches!(
            route(ConnectionPhase::CharacteristicDiscovery, SessionPhase::Unregistered, &event),
            Route::Ignore(_)
        ));
        assert_eq!(
            route(ConnectionPhase::NotificationSetup, SessionPhase::Unregistered, &event),
            Route::Session(SessionInput::Notification(&[0x03, 8, 14, 1, 2, 3, 4]))
        );
        assert!(matches!(
            route(ConnectionPhase::Ready, SessionPhase::Authenticated, &event),
            Route::Session(SessionInput::Notification(_))
        ));
    }

    #[test]
    fn value_read_confirms_login_only_while_logging_in() {
        let event = TransportEvent::CharacteristicValueQueryResult {
            value_handle: 3,
            value: vec![],
        };
        assert_eq!(
            route(ConnectionPhase::Ready, SessionPhase::LoggingIn, &event),
            Route::Session(SessionInput::LoginConfirmed)
        );
        assert!(matches!(
            route(ConnectionPhase::Ready, SessionPhase::Authenticated, &event),
            Route::Ignore(_)
        ));
    }

    #[test]
    fn advertisements_only_while_scanning() {
        let event = TransportEvent::AdvertisementReport {
            address: BdAddr([1; 6]),
            address_type: AddressType::Public,
            rssi: Some(-60),
            data: vec![0x02, 0x01, 0x06],
        };
        assert!(matches!(
            route(ConnectionPhase::Scanning, SessionPhase::Unregistered, &event),
            Route::Lifecycle(LifecycleInput::Advertisement { .. })
        ));
        assert!(matches!(
            route(ConnectionPhase::Connecting, SessionPhase::Unregistered, &event),
            Route::Ignore(_)
        ));
    }

    #[test]
    fn disconnect_always_reaches_lifecycle() {
        let event = TransportEvent::DisconnectionComplete {
            handle: ConnectionHandle(7),
            reason: 0x13,
        };
        for phase in [
            ConnectionPhase::Idle,
            ConnectionPhase::Connecting,
            ConnectionPhase::Ready,
        ] {
            assert_eq!(
                route(phase, SessionPhase::Authenticated, &event),
                Route::Lifecycle(LifecycleInput::Disconnected(ConnectionHandle(7)))
            );
        }
    }
}
