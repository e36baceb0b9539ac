//! Registration and login handshake, and the secured commands after it
//!
//! ```text
//! Unregistered --begin_registration--> AwaitingDeviceKey
//! AwaitingDeviceKey --on_registration_response--> LoggingIn (login frame returned)
//! LoggingIn --on_login_confirmed / successful login response--> Authenticated
//! ```
//!
//! The engine never talks to the transport. Every operation that has
//! something to send returns an [`OutboundCommand`] for the encoder.

use log::{debug, info, warn};
use rand::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use sesame_proto::{
    CHALLENGE_LEN, CommandFrame, FramingMode, Initial, ItemCode, LOGIN_TOKEN_LEN, ProtoError,
    RegistrationResponse, ResultCode,
};

use crate::crypto::{self, CryptoError, DEVICE_SECRET_LEN, KeyPair, TOKEN_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionPhase {
    Unregistered,
    AwaitingDeviceKey,
    LoggingIn,
    Authenticated,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("{operation} not allowed in session phase {phase:?}")]
    WrongPhase {
        operation: &'static str,
        phase: SessionPhase,
    },
    #[error("no challenge received from the lock yet")]
    MissingChallenge,
    #[error("malformed message: {0}")]
    Proto(#[from] ProtoError),
    #[error("key agreement failed: {0}")]
    Crypto(#[from] CryptoError),
}

/// A frame ready for the encoder, with the framing it must be sent with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundCommand {
    pub frame: CommandFrame,
    pub mode: FramingMode,
}

impl OutboundCommand {
    fn plaintext(frame: CommandFrame) -> Self {
        Self {
            frame,
            mode: FramingMode::Plaintext,
        }
    }

    fn ciphertext(frame: CommandFrame) -> Self {
        Self {
            frame,
            mode: FramingMode::Ciphertext,
        }
    }
}

/// Per-connection cryptographic state
pub struct SessionEngine<R> {
    rng: R,
    phase: SessionPhase,
    keypair: Option<KeyPair>,
    device_public_key: Option<[u8; sesame_proto::PUBLIC_KEY_LEN]>,
    device_secret: Option<Zeroizing<[u8; DEVICE_SECRET_LEN]>>,
    token: Option<Zeroizing<[u8; TOKEN_LEN]>>,
    challenge: Option<[u8; CHALLENGE_LEN]>,
}

impl<R> std::fmt::Debug for SessionEngine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEngine")
            .field("phase", &self.phase)
            .field("challenge", &self.challenge)
            .finish_non_exhaustive()
    }
}

impl<R: CryptoRng + RngCore> SessionEngine<R> {
    pub fn new(rng: R) -> Self {
        Self {
            rng,
            phase: SessionPhase::Unregistered,
            keypair: None,
            device_public_key: None,
            device_secret: None,
            token: None,
            challenge: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn challenge(&self) -> Option<[u8; CHALLENGE_LEN]> {
        self.challenge
    }

    pub fn public_key(&self) -> Option<&[u8; sesame_proto::PUBLIC_KEY_LEN]> {
        self.keypair.as_ref().map(KeyPair::public_key)
    }

    pub fn device_public_key(&self) -> Option<&[u8; sesame_proto::PUBLIC_KEY_LEN]> {
        self.device_public_key.as_ref()
    }

    pub fn device_secret(&self) -> Option<&[u8; DEVICE_SECRET_LEN]> {
        self.device_secret.as_deref()
    }

    pub fn token(&self) -> Option<&[u8; TOKEN_LEN]> {
        self.token.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase == SessionPhase::Authenticated
    }

    fn transition(&mut self, to: SessionPhase) {
        debug!("session phase {:?} -> {:?}", self.phase, to);
        self.phase = to;
    }

    fn expect_phase(
        &self,
        operation: &'static str,
        phase: SessionPhase,
    ) -> Result<(), SessionError> {
        if self.phase != phase {
            return Err(SessionError::WrongPhase {
                operation,
                phase: self.phase,
            });
        }
        Ok(())
    }

    /// Store the challenge from the `initial` publish
    ///
    /// The lock publishes a fresh challenge on every connection and may repeat
    /// it later; the latest one is used for the next token.
    pub fn on_initial(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        let initial = Initial::from_bytes(payload)?;
        debug!("challenge received: {:02x?}", initial.challenge);
        self.challenge = Some(initial.challenge);
        Ok(())
    }

    /// Fresh key pair, registration frame with our public key
    pub fn begin_registration(&mut self) -> Result<OutboundCommand, SessionError> {
        self.expect_phase("registration", SessionPhase::Unregistered)?;

        let keypair = crypto::generate_keypair(&mut self.rng);
        let frame = CommandFrame::registration(keypair.public_key());
        self.keypair = Some(keypair);

        info!("Registering with the lock");
        self.transition(SessionPhase::AwaitingDeviceKey);
        Ok(OutboundCommand::plaintext(frame))
    }

    /// Derive the device secret and token; returns the login frame
    ///
    /// Any failure leaves the engine in `AwaitingDeviceKey`.
    pub fn on_registration_response(
        &mut self,
        payload: &[u8],
    ) -> Result<OutboundCommand, SessionError> {
        self.expect_phase("registration response", SessionPhase::AwaitingDeviceKey)?;
        let challenge = self.challenge.ok_or(SessionError::MissingChallenge)?;
        let keypair = self.keypair.as_ref().ok_or(SessionError::WrongPhase {
            operation: "registration response",
            phase: self.phase,
        })?;

        let response = RegistrationResponse::from_bytes(payload)?;
        let shared = crypto::ecdh_shared_secret(&response.public_key, keypair.secret_key())?;
        let secret = crypto::device_secret(&shared);
        let token = Zeroizing::new(crypto::cmac(&secret, &challenge));

        self.device_public_key = Some(response.public_key);
        self.device_secret = Some(secret);
        self.token = Some(token);

        info!("Device secret derived");
        self.transition(SessionPhase::LoggingIn);
        self.begin_login()
    }

    /// Login frame with the first bytes of the current token
    pub fn begin_login(&mut self) -> Result<OutboundCommand, SessionError> {
        self.expect_phase("login", SessionPhase::LoggingIn)?;
        let token = self.token.as_ref().ok_or(SessionError::MissingChallenge)?;

        let mut wire = [0u8; LOGIN_TOKEN_LEN];
        wire.copy_from_slice(&token[..LOGIN_TOKEN_LEN]);

        info!("Logging in");
        Ok(OutboundCommand::plaintext(CommandFrame::login(&wire)))
    }

    /// The transport confirmed the login exchange
    pub fn on_login_confirmed(&mut self) -> bool {
        if self.phase != SessionPhase::LoggingIn {
            debug!("login confirmation ignored in phase {:?}", self.phase);
            return false;
        }
        info!("Logged in");
        self.transition(SessionPhase::Authenticated);
        true
    }

    /// The lock answered the login command
    pub fn on_login_response(&mut self, result: ResultCode) -> bool {
        if !result.is_success() {
            warn!("login rejected by the lock: {result}");
            return false;
        }
        self.on_login_confirmed()
    }

    /// Build a secured command
    ///
    /// Returns `None` (and logs) while the session is not yet logging in.
    pub fn issue_authenticated_command(
        &mut self,
        item_code: ItemCode,
        payload: Vec<u8>,
    ) -> Option<OutboundCommand> {
        if self.phase < SessionPhase::LoggingIn {
            warn!("{item_code} dropped: session not logged in ({:?})", self.phase);
            return None;
        }
        let (Some(secret), Some(challenge)) = (self.device_secret.as_ref(), self.challenge) else {
            warn!("{item_code} dropped: no device secret");
            return None;
        };

        self.token = Some(Zeroizing::new(crypto::cmac(secret, &challenge)));
        debug!("issuing {item_code} ({} payload bytes)", payload.len());
        Some(OutboundCommand::ciphertext(CommandFrame::new(item_code, payload)))
    }

    pub fn lock(&mut self, tag: &[u8]) -> Result<Option<OutboundCommand>, SessionError> {
        let frame = CommandFrame::lock(tag)?;
        Ok(self.issue_authenticated_command(frame.item_code, frame.payload))
    }

    pub fn unlock(&mut self, tag: &[u8]) -> Result<Option<OutboundCommand>, SessionError> {
        let frame = CommandFrame::unlock(tag)?;
        Ok(self.issue_authenticated_command(frame.item_code, frame.payload))
    }

    pub fn read_history(&mut self) -> Option<OutboundCommand> {
        let frame = CommandFrame::read_history();
        self.issue_authenticated_command(frame.item_code, frame.payload)
    }

    /// Forget everything tied to the previous link
    pub fn reset(&mut self) {
        if self.phase != SessionPhase::Unregistered {
            debug!("session reset from {:?}", self.phase);
        }
        self.phase = SessionPhase::Unregistered;
        self.keypair = None;
        self.device_public_key = None;
        self.device_secret = None;
        self.token = None;
        self.challenge = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    const CHALLENGE: [u8; 4] = [0x10, 0x20, 0x30, 0x40];

    fn engine() -> SessionEngine<ChaCha20Rng> {
        SessionEngine::new(ChaCha20Rng::seed_from_u64(42))
    }

    fn lock_keys() -> KeyPair {
        KeyPair::from_bytes(&[0x5A; 32]).unwrap()
    }

    fn registration_payload(lock: &KeyPair) -> Vec<u8> {
        RegistrationResponse {
            status_block: [0; 13],
            public_key: *lock.public_key(),
        }
        .to_bytes()
    }

    fn logged_in(engine: &mut SessionEngine<ChaCha20Rng>) -> OutboundCommand {
        engine.on_initial(&CHALLENGE).unwrap();
        engine.begin_registration().unwrap();
        engine
            .on_registration_response(&registration_payload(&lock_keys()))
            .unwrap()
    }

    #[test]
    fn registration_carries_public_key() {
        let mut engine = engine();
        let cmd = engine.begin_registration().unwrap();

        assert_eq!(cmd.mode, FramingMode::Plaintext);
        assert_eq!(cmd.frame.item_code, ItemCode::REGISTRATION);
        assert_eq!(cmd.frame.payload.len(), 64);
        assert_eq!(Some(&cmd.frame.payload[..]), engine.public_key().map(|k| &k[..]));
        assert_eq!(engine.phase(), SessionPhase::AwaitingDeviceKey);
    }

    #[test]
    fn registration_twice_is_rejected() {
        let mut engine = engine();
        engine.begin_registration().unwrap();
        assert!(matches!(
            engine.begin_registration(),
            Err(SessionError::WrongPhase { .. })
        ));
    }

    #[test]
    fn login_token_is_cmac_of_challenge() {
        let mut engine = engine();
        let login = logged_in(&mut engine);

        let lock = lock_keys();
        let own_public = *engine.public_key().unwrap();
        let shared = crypto::ecdh_shared_secret(&own_public, lock.secret_key()).unwrap();
        let secret = crypto::device_secret(&shared);
        let token = crypto::cmac(&secret, &CHALLENGE);

        assert_eq!(engine.phase(), SessionPhase::LoggingIn);
        assert_eq!(engine.device_secret(), Some(&*secret));
        assert_eq!(login.frame.item_code, ItemCode::LOGIN);
        assert_eq!(login.frame.payload, token[..4].to_vec());
        assert_eq!(login.mode, FramingMode::Plaintext);
    }

    #[test]
    fn same_seed_same_token() {
        let mut a = engine();
        let mut b = engine();
        assert_eq!(logged_in(&mut a), logged_in(&mut b));
        assert_eq!(a.token(), b.token());
    }

    #[test]
    fn registration_response_without_challenge_waits() {
        let mut engine = engine();
        engine.begin_registration().unwrap();

        assert_eq!(
            engine.on_registration_response(&registration_payload(&lock_keys())),
            Err(SessionError::MissingChallenge)
        );
        assert_eq!(engine.phase(), SessionPhase::AwaitingDeviceKey);
    }

    #[test]
    fn invalid_device_key_keeps_phase() {
        let mut engine = engine();
        engine.on_initial(&CHALLENGE).unwrap();
        engine.begin_registration().unwrap();

        let mut payload = vec![0u8; 13];
        payload.extend_from_slice(&[0x01; 64]);
        assert_eq!(
            engine.on_registration_response(&payload),
            Err(SessionError::Crypto(CryptoError::InvalidPublicKey))
        );
        assert_eq!(engine.phase(), SessionPhase::AwaitingDeviceKey);
        assert!(engine.device_secret().is_none());
    }

    #[test]
    fn short_registration_response_is_rejected() {
        let mut engine = engine();
        engine.on_initial(&CHALLENGE).unwrap();
        engine.begin_registration().unwrap();
        assert!(matches!(
            engine.on_registration_response(&[0; 20]),
            Err(SessionError::Proto(ProtoError::TooShort { .. }))
        ));
    }

    #[test]
    fn authenticated_commands_need_login() {
        let mut engine = engine();
        assert_eq!(engine.read_history(), None);
        engine.begin_registration().unwrap();
        assert_eq!(engine.lock(b"x").unwrap(), None);
    }

    #[test]
    fn authenticated_commands_use_ciphertext_while_logging_in() {
        let mut engine = engine();
        logged_in(&mut engine);

        let cmd = engine.lock(b"door").unwrap().unwrap();
        assert_eq!(cmd.mode, FramingMode::Ciphertext);
        assert_eq!(cmd.frame.item_code, ItemCode::LOCK);
        assert_eq!(cmd.frame.payload, b"\x04door".to_vec());

        let history = engine.read_history().unwrap();
        assert_eq!(history.frame.to_bytes(), vec![4, 1]);
    }

    #[test]
    fn token_follows_latest_challenge() {
        let mut engine = engine();
        logged_in(&mut engine);
        let first = *engine.token().unwrap();

        engine.on_initial(&[9, 9, 9, 9]).unwrap();
        engine.unlock(b"").unwrap().unwrap();
        let second = *engine.token().unwrap();

        assert_ne!(first, second);
        assert_eq!(second, crypto::cmac(engine.device_secret().unwrap(), &[9, 9, 9, 9]));
    }

    #[test]
    fn login_response_decides_authentication() {
        let mut engine = engine();
        logged_in(&mut engine);

        assert!(!engine.on_login_response(ResultCode::INVALID_SIG));
        assert_eq!(engine.phase(), SessionPhase::LoggingIn);
        assert!(engine.on_login_response(ResultCode::SUCCESS));
        assert!(engine.is_authenticated());
        assert!(!engine.on_login_confirmed());
    }

    #[test]
    fn reset_discards_secrets() {
        let mut engine = engine();
        logged_in(&mut engine);
        engine.reset();

        assert_eq!(engine.phase(), SessionPhase::Unregistered);
        assert!(engine.device_secret().is_none());
        assert!(engine.token().is_none());
        assert!(engine.challenge().is_none());
        assert!(engine.public_key().is_none());
    }
}
