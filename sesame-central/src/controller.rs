//! The one owner of all per-lock state
//!
//! Feed every [`TransportEvent`] to [`Controller::handle`] from a single
//! consumer; each call finishes its transition and the transport requests
//! that follow from it before returning.

use log::{debug, info, warn};
use rand::{CryptoRng, RngCore};

use sesame_proto::ble::TargetIdentity;
use sesame_proto::{DeviceMessage, FramingCodec, ItemCode, MechStatus, SegmentCodec};

use crate::encoder::{CommandEncoder, EncodeError};
use crate::lifecycle::{ConnectionManager, ConnectionPhase};
use crate::router::{LifecycleInput, Route, SessionInput, route};
use crate::session::{OutboundCommand, SessionEngine, SessionError, SessionPhase};
use crate::status::{AppCommand, DeviceStatus, StatusObserver};
use crate::transport::{BleTransport, ScanParams, TransportEvent};

/// History tag used when a lock/unlock request does not name one
pub const DEFAULT_HISTORY_TAG: &[u8] = b"sesame-ble";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("session is not logged in (phase {0:?})")]
    NotLoggedIn(SessionPhase),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

pub struct Controller<R, O, C = SegmentCodec> {
    link: ConnectionManager,
    session: SessionEngine<R>,
    encoder: CommandEncoder,
    codec: C,
    observer: O,
    status: DeviceStatus,
    default_tag: Vec<u8>,
    /// Registration response that arrived before the challenge
    pending_registration: Option<Vec<u8>>,
}

impl<R, O> Controller<R, O, SegmentCodec>
where
    R: CryptoRng + RngCore,
    O: StatusObserver,
{
    pub fn new(rng: R, observer: O) -> Self {
        Self::with_codec(rng, observer, SegmentCodec::new())
    }
}

impl<R, O, C> Controller<R, O, C>
where
    R: CryptoRng + RngCore,
    O: StatusObserver,
    C: FramingCodec,
{
    pub fn with_codec(rng: R, observer: O, codec: C) -> Self {
        Self {
            link: ConnectionManager::new(TargetIdentity::SESAME, ScanParams::SESAME),
            session: SessionEngine::new(rng),
            encoder: CommandEncoder::new(),
            codec,
            observer,
            status: DeviceStatus::Disconnected,
            default_tag: DEFAULT_HISTORY_TAG.to_vec(),
            pending_registration: None,
        }
    }

    /// Replace target and scan timing; only meaningful before the first event
    pub fn with_link(mut self, target: TargetIdentity, scan_params: ScanParams) -> Self {
        self.link = ConnectionManager::new(target, scan_params);
        self
    }

    pub fn with_default_tag(mut self, tag: impl Into<Vec<u8>>) -> Self {
        self.default_tag = tag.into();
        self
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn link(&self) -> &ConnectionManager {
        &self.link
    }

    pub fn session(&self) -> &SessionEngine<R> {
        &self.session
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn into_observer(self) -> O {
        self.observer
    }

    /// Nothing is in flight: either looking for the lock or fully logged in
    pub fn is_settled(&self) -> bool {
        matches!(
            self.link.phase(),
            ConnectionPhase::Idle | ConnectionPhase::Scanning
        ) || self.session.is_authenticated()
    }

    /// Drop the current link; the disconnection event brings us back to scanning
    pub fn abort_link<T: BleTransport>(&mut self, transport: &mut T) {
        if self.link.handle().is_none() {
            warn!("no link to abort in phase {:?}", self.link.phase());
            return;
        }
        info!("Aborting link in phase {:?}", self.link.phase());
        self.link.disconnect(transport);
    }

    pub fn start<T: BleTransport>(&mut self, transport: &mut T) {
        self.handle(&TransportEvent::BluetoothReady, transport);
    }

    pub fn handle<T: BleTransport>(&mut self, event: &TransportEvent, transport: &mut T) {
        match route(self.link.phase(), self.session.phase(), event) {
            Route::Lifecycle(input) => self.on_lifecycle(input, transport),
            Route::Session(input) => self.on_session(input, transport),
            Route::Ignore(reason) => debug!("event ignored: {reason}"),
        }
    }

    /// Issue an application command on the current session
    pub fn request<T: BleTransport>(
        &mut self,
        command: AppCommand,
        transport: &mut T,
    ) -> Result<(), CommandError> {
        let outbound = match &command {
            AppCommand::Lock { tag } => {
                let tag = non_empty(tag.as_deref()).unwrap_or(self.default_tag.as_slice());
                self.session.lock(tag)?
            }
            AppCommand::Unlock { tag } => {
                let tag = non_empty(tag.as_deref()).unwrap_or(self.default_tag.as_slice());
                self.session.unlock(tag)?
            }
            AppCommand::ReadHistory => self.session.read_history(),
        };
        let outbound = outbound.ok_or(CommandError::NotLoggedIn(self.session.phase()))?;
        self.submit(&outbound, transport)?;
        Ok(())
    }

    fn submit<T: BleTransport>(
        &mut self,
        command: &OutboundCommand,
        transport: &mut T,
    ) -> Result<(), EncodeError> {
        self.encoder
            .submit(command, &self.link, &mut self.codec, transport)
    }

    /// The session already waits for the answer, so a lost handshake write
    /// drops the link and the disconnect path starts over
    fn submit_handshake<T: BleTransport>(&mut self, command: &OutboundCommand, transport: &mut T) {
        if let Err(e) = self.submit(command, transport) {
            warn!("{} write failed ({e}), dropping the link", command.frame.item_code);
            self.abort_link(transport);
        }
    }

    fn set_status<T: BleTransport>(&mut self, status: DeviceStatus, transport: &mut T) {
        if self.status == status {
            return;
        }
        info!("Status: {} -> {}", self.status, status);
        self.status = status;

        if let Some(command) = self.observer.on_status(status) {
            debug!("observer requested {command:?}");
            if let Err(e) = self.request(command, transport) {
                warn!("requested command failed: {e}");
            }
        }
    }

    fn on_lifecycle<T: BleTransport>(&mut self, input: LifecycleInput<'_>, transport: &mut T) {
        match input {
            LifecycleInput::Start => {
                self.link.start(transport);
                if self.link.phase() == ConnectionPhase::Scanning {
                    self.set_status(DeviceStatus::Scanning, transport);
                }
            }
            LifecycleInput::Advertisement {
                address,
                address_type,
                data,
            } => {
                if self
                    .link
                    .on_advertisement(address, address_type, data, transport)
                {
                    self.set_status(DeviceStatus::Connecting, transport);
                }
            }
            LifecycleInput::Connected(handle) => self.link.on_connected(handle, transport),
            LifecycleInput::Disconnected(handle) => {
                if !self.link.on_disconnected(handle, transport) {
                    return;
                }
                self.session.reset();
                self.codec.reset();
                self.encoder.clear();
                self.pending_registration = None;
                self.set_status(DeviceStatus::Disconnected, transport);
                if self.link.phase() == ConnectionPhase::Scanning {
                    self.set_status(DeviceStatus::Scanning, transport);
                }
            }
            LifecycleInput::ServiceFound(service) => self.link.on_service_found(service),
            LifecycleInput::ServiceDiscoveryComplete => {
                self.link.on_service_discovery_complete(transport)
            }
            LifecycleInput::CharacteristicFound(characteristic) => {
                self.link.on_characteristic_found(characteristic)
            }
            LifecycleInput::CharacteristicDiscoveryComplete => {
                self.link.on_characteristic_discovery_complete(transport)
            }
            LifecycleInput::NotificationSetupComplete => {
                if self.link.on_notification_setup_complete() {
                    self.set_status(DeviceStatus::Connected, transport);
                    self.begin_registration(transport);
                }
            }
        }
    }

    fn begin_registration<T: BleTransport>(&mut self, transport: &mut T) {
        match self.session.begin_registration() {
            Ok(command) => self.submit_handshake(&command, transport),
            Err(e) => warn!("registration not started: {e}"),
        }
    }

    fn on_session<T: BleTransport>(&mut self, input: SessionInput<'_>, transport: &mut T) {
        match input {
            SessionInput::Notification(segment) => match self.codec.decode(segment) {
                Ok(Some((mode, message))) => {
                    debug!("message from lock ({mode:?}, {} bytes)", message.len());
                    self.on_message(&message, transport);
                }
                Ok(None) => {}
                Err(e) => warn!("dropping notification: {e}"),
            },
            SessionInput::LoginConfirmed => {
                if self.session.on_login_confirmed() {
                    self.set_status(DeviceStatus::LoggedIn, transport);
                }
            }
            SessionInput::WriteComplete(status) => {
                if status != 0 {
                    warn!("write failed with ATT status 0x{status:02x}");
                }
            }
        }
    }

    fn on_message<T: BleTransport>(&mut self, bytes: &[u8], transport: &mut T) {
        let message = match DeviceMessage::from_bytes(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("unparseable message from lock: {e}");
                return;
            }
        };

        match message {
            DeviceMessage::Publish { item_code, payload } => match item_code {
                ItemCode::INITIAL => {
                    if let Err(e) = self.session.on_initial(&payload) {
                        warn!("bad initial publish: {e}");
                        return;
                    }
                    if let Some(pending) = self.pending_registration.take() {
                        self.on_registration_response(&pending, transport);
                    }
                }
                ItemCode::MECH_STATUS => self.on_mech_status(&payload, transport),
                other => debug!("publish {other} ignored"),
            },
            DeviceMessage::Response {
                item_code,
                result,
                payload,
            } => match item_code {
                ItemCode::REGISTRATION if result.is_success() => {
                    self.on_registration_response(&payload, transport)
                }
                ItemCode::REGISTRATION => warn!("registration rejected by the lock: {result}"),
                ItemCode::LOGIN => {
                    if self.session.on_login_response(result) {
                        self.set_status(DeviceStatus::LoggedIn, transport);
                    }
                }
                other => {
                    info!("{other} -> {result}");
                    self.observer.on_response(other, result);
                }
            },
        }
    }

    fn on_registration_response<T: BleTransport>(&mut self, payload: &[u8], transport: &mut T) {
        match self.session.on_registration_response(payload) {
            Ok(login) => {
                self.submit_handshake(&login, transport);
                self.set_status(DeviceStatus::LoggingIn, transport);
            }
            Err(SessionError::MissingChallenge) => {
                debug!("registration response before challenge, holding it");
                self.pending_registration = Some(payload.to_vec());
            }
            Err(e) => warn!("registration response rejected: {e}"),
        }
    }

    fn on_mech_status<T: BleTransport>(&mut self, payload: &[u8], transport: &mut T) {
        if !self.session.is_authenticated() {
            debug!("mech status before login ignored");
            return;
        }
        match MechStatus::from_bytes(payload) {
            Ok(mech) => {
                debug!(
                    "mech status: battery={} position={} clockwise={} flags=0x{:02x}",
                    mech.battery,
                    mech.position,
                    mech.is_clockwise(),
                    mech.flags
                );
                if mech.is_clutch_failed() {
                    warn!("lock reports a clutch failure");
                }
                if mech.is_critical() {
                    warn!("lock reports a critical state");
                }
                if mech.is_low_battery() {
                    warn!("lock battery low ({})", mech.battery);
                }
                self.set_status(mech.lock_state().into(), transport);
            }
            Err(e) => warn!("bad mech status: {e}"),
        }
    }
}

fn non_empty(tag: Option<&[u8]>) -> Option<&[u8]> {
    tag.filter(|t| !t.is_empty())
}

impl<R, O, C> std::fmt::Debug for Controller<R, O, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("status", &self.status)
            .field("link", &self.link)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}
