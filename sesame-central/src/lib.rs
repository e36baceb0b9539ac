//! Sesame Central Library
//!
//! Platform independent core of a BLE central that talks to a Sesame 5 lock.
//!
//! This crate provides:
//! - the [`BleTransport`] trait platform crates implement on top of their BLE stack
//! - the connection lifecycle (scan, connect, discover, enable notifications)
//! - the registration/login handshake and authenticated commands
//! - a [`Controller`] tying them together behind a single event entry point
//!
//! # Implementations
//! - host (btleplug): see `sesame-ble-controller`

pub mod controller;
pub mod crypto;
pub mod encoder;
pub mod lifecycle;
pub mod router;
pub mod session;
pub mod status;
pub mod transport;

pub use controller::{CommandError, Controller, DEFAULT_HISTORY_TAG};
pub use encoder::{CommandEncoder, EncodeError};
pub use lifecycle::{ConnectionManager, ConnectionPhase};
pub use router::{LifecycleInput, Route, SessionInput, route};
pub use session::{OutboundCommand, SessionEngine, SessionError, SessionPhase};
pub use status::{AppCommand, AutoLock, DeviceStatus, OneShot, Quiet, StatusObserver};
pub use transport::*;
