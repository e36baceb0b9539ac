//! Sesame wire protocol - item codes, command frames and device messages

use std::fmt;

pub mod ble;
pub mod segment;

pub use segment::{FramingCodec, FramingMode, SegmentCodec};

/// Largest command frame the controller ever builds (item code + payload)
pub const MAX_FRAME_LEN: usize = 128;

/// Size of an uncompressed P-256 point without the SEC1 prefix (X || Y)
pub const PUBLIC_KEY_LEN: usize = 64;

/// Size of the challenge ("random code") published by the lock
pub const CHALLENGE_LEN: usize = 4;

/// Number of token bytes carried by the login command
pub const LOGIN_TOKEN_LEN: usize = 4;

/// Offset of the device public key inside a registration response payload
pub const REGISTRATION_KEY_OFFSET: usize = 13;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtoError {
    #[error("{what} too short: need {need} bytes, got {got}")]
    TooShort {
        what: &'static str,
        need: usize,
        got: usize,
    },
    #[error("empty frame")]
    Empty,
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("unexpected op code 0x{0:02x}")]
    UnexpectedOpCode(u8),
    #[error("segment without a preceding start segment")]
    OrphanSegment,
    #[error("invalid parsing type {0}")]
    InvalidParsingType(u8),
}

fn ensure_len(what: &'static str, data: &[u8], need: usize) -> Result<(), ProtoError> {
    if data.len() < need {
        return Err(ProtoError::TooShort {
            what,
            need,
            got: data.len(),
        });
    }
    Ok(())
}

/// Operation kind of a message exchanged with the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Create = 1,
    Read = 2,
    Update = 3,
    Delete = 4,
    Sync = 5,
    Async = 6,
    Response = 7,
    Publish = 8,
    Undefine = 16,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Create,
            2 => Self::Read,
            3 => Self::Update,
            4 => Self::Delete,
            5 => Self::Sync,
            6 => Self::Async,
            7 => Self::Response,
            8 => Self::Publish,
            16 => Self::Undefine,
            _ => return None,
        })
    }
}

/// Item code: byte 0 of every command frame
///
/// Kept open (any byte is representable) so frames from newer firmware still
/// parse; the known codes are associated constants.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemCode(pub u8);

impl ItemCode {
    pub const NONE: Self = Self(0);
    pub const REGISTRATION: Self = Self(1);
    pub const LOGIN: Self = Self(2);
    pub const USER: Self = Self(3);
    pub const HISTORY: Self = Self(4);
    pub const VERSION_DETAIL: Self = Self(5);
    pub const DISCONNECT_REBOOT_NOW: Self = Self(6);
    pub const ENABLE_DFU: Self = Self(7);
    pub const TIME: Self = Self(8);
    pub const INITIAL: Self = Self(14);
    pub const MAGNET: Self = Self(17);
    pub const MECH_SETTING: Self = Self(80);
    pub const MECH_STATUS: Self = Self(81);
    pub const LOCK: Self = Self(82);
    pub const UNLOCK: Self = Self(83);

    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::NONE => "none",
            Self::REGISTRATION => "registration",
            Self::LOGIN => "login",
            Self::USER => "user",
            Self::HISTORY => "history",
            Self::VERSION_DETAIL => "version_detail",
            Self::DISCONNECT_REBOOT_NOW => "disconnect_reboot_now",
            Self::ENABLE_DFU => "enable_dfu",
            Self::TIME => "time",
            Self::INITIAL => "initial",
            Self::MAGNET => "magnet",
            Self::MECH_SETTING => "mech_setting",
            Self::MECH_STATUS => "mech_status",
            Self::LOCK => "lock",
            Self::UNLOCK => "unlock",
            _ => return None,
        })
    }
}

impl fmt::Debug for ItemCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "ItemCode::{name}"),
            None => write!(f, "ItemCode({})", self.0),
        }
    }
}

impl fmt::Display for ItemCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "item#{}", self.0),
        }
    }
}

/// Result byte of a response message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultCode(pub u8);

impl ResultCode {
    pub const SUCCESS: Self = Self(0);
    pub const INVALID_FORMAT: Self = Self(1);
    pub const NOT_SUPPORTED: Self = Self(2);
    pub const STORAGE_FAIL: Self = Self(3);
    pub const INVALID_SIG: Self = Self(4);
    pub const NOT_FOUND: Self = Self(5);
    pub const UNKNOWN: Self = Self(6);
    pub const BUSY: Self = Self(7);
    pub const INVALID_PARAM: Self = Self(8);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::SUCCESS => "success",
            Self::INVALID_FORMAT => "invalid format",
            Self::NOT_SUPPORTED => "not supported",
            Self::STORAGE_FAIL => "storage failure",
            Self::INVALID_SIG => "invalid signature",
            Self::NOT_FOUND => "not found",
            Self::UNKNOWN => "unknown",
            Self::BUSY => "busy",
            Self::INVALID_PARAM => "invalid parameter",
            Self(other) => return write!(f, "unknown result code {other}"),
        };
        f.write_str(name)
    }
}

/// Controller -> lock command: `[item_code][payload...]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub item_code: ItemCode,
    pub payload: Vec<u8>,
}

impl CommandFrame {
    pub fn new(item_code: ItemCode, payload: Vec<u8>) -> Self {
        Self { item_code, payload }
    }

    /// Registration carries our ephemeral public key
    pub fn registration(public_key: &[u8; PUBLIC_KEY_LEN]) -> Self {
        Self::new(ItemCode::REGISTRATION, public_key.to_vec())
    }

    /// Login carries the first bytes of the session token
    pub fn login(token: &[u8; LOGIN_TOKEN_LEN]) -> Self {
        Self::new(ItemCode::LOGIN, token.to_vec())
    }

    /// Lock with a history tag: `[tag_len][tag...]`
    pub fn lock(tag: &[u8]) -> Result<Self, ProtoError> {
        Ok(Self::new(ItemCode::LOCK, tagged(tag)?))
    }

    /// Unlock with a history tag: `[tag_len][tag...]`
    pub fn unlock(tag: &[u8]) -> Result<Self, ProtoError> {
        Ok(Self::new(ItemCode::UNLOCK, tagged(tag)?))
    }

    /// Ask the lock to publish its oldest history entry
    pub fn read_history() -> Self {
        Self::new(ItemCode::HISTORY, vec![1])
    }

    /// Total frame length including the item code
    pub fn wire_len(&self) -> usize {
        1 + self.payload.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_len());
        buf.push(self.item_code.0);
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtoError> {
        let (&item_code, payload) = data.split_first().ok_or(ProtoError::Empty)?;
        if data.len() > MAX_FRAME_LEN {
            return Err(ProtoError::FrameTooLarge(data.len()));
        }
        Ok(Self::new(ItemCode(item_code), payload.to_vec()))
    }
}

fn tagged(tag: &[u8]) -> Result<Vec<u8>, ProtoError> {
    // tag length has to fit in one byte and the whole frame in MAX_FRAME_LEN
    let max_tag = (MAX_FRAME_LEN - 2).min(u8::MAX as usize);
    if tag.len() > max_tag {
        return Err(ProtoError::FrameTooLarge(tag.len() + 2));
    }
    let mut buf = Vec::with_capacity(1 + tag.len());
    buf.push(tag.len() as u8);
    buf.extend_from_slice(tag);
    Ok(buf)
}

/// Lock -> controller message, after segment reassembly
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMessage {
    /// Unsolicited: `[op=publish][item][payload...]`
    Publish { item_code: ItemCode, payload: Vec<u8> },
    /// Answer to a command: `[op=response][item][result][payload...]`
    Response {
        item_code: ItemCode,
        result: ResultCode,
        payload: Vec<u8>,
    },
}

impl DeviceMessage {
    pub fn item_code(&self) -> ItemCode {
        match self {
            Self::Publish { item_code, .. } | Self::Response { item_code, .. } => *item_code,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Publish { item_code, payload } => {
                let mut buf = Vec::with_capacity(2 + payload.len());
                buf.push(OpCode::Publish as u8);
                buf.push(item_code.0);
                buf.extend_from_slice(payload);
                buf
            }
            Self::Response {
                item_code,
                result,
                payload,
            } => {
                let mut buf = Vec::with_capacity(3 + payload.len());
                buf.push(OpCode::Response as u8);
                buf.push(item_code.0);
                buf.push(result.0);
                buf.extend_from_slice(payload);
                buf
            }
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtoError> {
        let (&op, rest) = data.split_first().ok_or(ProtoError::Empty)?;
        match OpCode::from_u8(op) {
            Some(OpCode::Publish) => {
                ensure_len("publish", data, 2)?;
                Ok(Self::Publish {
                    item_code: ItemCode(rest[0]),
                    payload: rest[1..].to_vec(),
                })
            }
            Some(OpCode::Response) => {
                ensure_len("response", data, 3)?;
                Ok(Self::Response {
                    item_code: ItemCode(rest[0]),
                    result: ResultCode(rest[1]),
                    payload: rest[2..].to_vec(),
                })
            }
            _ => Err(ProtoError::UnexpectedOpCode(op)),
        }
    }
}

/// Payload of the `initial` publish sent right after notifications are enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Initial {
    pub challenge: [u8; CHALLENGE_LEN],
}

impl Initial {
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtoError> {
        ensure_len("initial", data, CHALLENGE_LEN)?;
        let mut challenge = [0u8; CHALLENGE_LEN];
        challenge.copy_from_slice(&data[..CHALLENGE_LEN]);
        Ok(Self { challenge })
    }
}

/// Payload of the registration response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationResponse {
    /// Mech status and settings snapshot preceding the key
    pub status_block: [u8; REGISTRATION_KEY_OFFSET],
    pub public_key: [u8; PUBLIC_KEY_LEN],
}

impl RegistrationResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(REGISTRATION_KEY_OFFSET + PUBLIC_KEY_LEN);
        buf.extend_from_slice(&self.status_block);
        buf.extend_from_slice(&self.public_key);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtoError> {
        let end = REGISTRATION_KEY_OFFSET + PUBLIC_KEY_LEN;
        ensure_len("registration response", data, end)?;

        let mut status_block = [0u8; REGISTRATION_KEY_OFFSET];
        status_block.copy_from_slice(&data[..REGISTRATION_KEY_OFFSET]);
        let mut public_key = [0u8; PUBLIC_KEY_LEN];
        public_key.copy_from_slice(&data[REGISTRATION_KEY_OFFSET..end]);

        Ok(Self {
            status_block,
            public_key,
        })
    }
}

/// Bolt position as reported by mech status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Locked,
    Unlocked,
    Moved,
}

/// Mech status published by the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MechStatus {
    pub battery: u16,
    pub target: i16,
    pub position: i16,
    pub flags: u8,
}

impl MechStatus {
    pub const LEN: usize = 7;

    const CLUTCH_FAILED: u8 = 1 << 0;
    const IN_LOCK_RANGE: u8 = 1 << 1;
    const IN_UNLOCK_RANGE: u8 = 1 << 2;
    const CRITICAL: u8 = 1 << 3;
    const STOPPED: u8 = 1 << 4;
    const LOW_BATTERY: u8 = 1 << 5;
    const CLOCKWISE: u8 = 1 << 6;

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0..2].copy_from_slice(&self.battery.to_le_bytes());
        buf[2..4].copy_from_slice(&self.target.to_le_bytes());
        buf[4..6].copy_from_slice(&self.position.to_le_bytes());
        buf[6] = self.flags;
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtoError> {
        ensure_len("mech status", data, Self::LEN)?;
        Ok(Self {
            battery: u16::from_le_bytes([data[0], data[1]]),
            target: i16::from_le_bytes([data[2], data[3]]),
            position: i16::from_le_bytes([data[4], data[5]]),
            flags: data[6],
        })
    }

    pub fn is_clutch_failed(&self) -> bool {
        self.flags & Self::CLUTCH_FAILED != 0
    }

    pub fn in_lock_range(&self) -> bool {
        self.flags & Self::IN_LOCK_RANGE != 0
    }

    pub fn in_unlock_range(&self) -> bool {
        self.flags & Self::IN_UNLOCK_RANGE != 0
    }

    pub fn is_critical(&self) -> bool {
        self.flags & Self::CRITICAL != 0
    }

    pub fn is_stopped(&self) -> bool {
        self.flags & Self::STOPPED != 0
    }

    pub fn is_low_battery(&self) -> bool {
        self.flags & Self::LOW_BATTERY != 0
    }

    pub fn is_clockwise(&self) -> bool {
        self.flags & Self::CLOCKWISE != 0
    }

    /// Lock range wins over unlock range; neither means the bolt is in between
    pub fn lock_state(&self) -> LockState {
        if self.in_lock_range() {
            LockState::Locked
        } else if self.in_unlock_range() {
            LockState::Unlocked
        } else {
            LockState::Moved
        }
    }
}
