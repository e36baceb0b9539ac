//! Command frame layout and hand-off to the transport

use log::{debug, warn};

use sesame_proto::{FramingCodec, FramingMode, ItemCode, MAX_FRAME_LEN, ProtoError};

use crate::lifecycle::{ConnectionManager, ConnectionPhase};
use crate::session::OutboundCommand;
use crate::transport::BleTransport;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("link not ready (phase {0:?})")]
    NotReady(ConnectionPhase),
    #[error("write characteristic not resolved")]
    NoWriteCharacteristic,
    #[error("frame of {0} bytes exceeds {MAX_FRAME_LEN}")]
    FrameTooLarge(usize),
    #[error("framing failed: {0}")]
    Framing(#[from] ProtoError),
    #[error("transport write failed: {0}")]
    Transport(String),
}

/// Reusable frame buffer: `[item_code][payload...]`
#[derive(Debug)]
pub struct CommandEncoder {
    buf: [u8; MAX_FRAME_LEN],
    offset: usize,
}

impl Default for CommandEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandEncoder {
    pub fn new() -> Self {
        Self {
            buf: [0; MAX_FRAME_LEN],
            offset: 0,
        }
    }

    /// Lay out a frame, replacing the previous one; returns its length
    pub fn encode(&mut self, item_code: ItemCode, payload: &[u8]) -> Result<usize, EncodeError> {
        let len = 1 + payload.len();
        if len > MAX_FRAME_LEN {
            return Err(EncodeError::FrameTooLarge(len));
        }
        self.buf[0] = item_code.0;
        self.buf[1..len].copy_from_slice(payload);
        self.offset = len;
        Ok(len)
    }

    /// The frame built by the last successful [`encode`](Self::encode)
    pub fn frame(&self) -> &[u8] {
        &self.buf[..self.offset]
    }

    pub fn clear(&mut self) {
        self.offset = 0;
    }

    /// Split a frame back into item code and payload
    pub fn parse(frame: &[u8]) -> Result<(ItemCode, &[u8]), ProtoError> {
        let (&item_code, payload) = frame.split_first().ok_or(ProtoError::Empty)?;
        Ok((ItemCode(item_code), payload))
    }

    /// Frame the current buffer and write every segment to the lock
    ///
    /// Nothing is written unless the link is ready and the write
    /// characteristic is known.
    pub fn send<C, T>(
        &mut self,
        mode: FramingMode,
        link: &ConnectionManager,
        codec: &mut C,
        transport: &mut T,
    ) -> Result<(), EncodeError>
    where
        C: FramingCodec + ?Sized,
        T: BleTransport,
    {
        if !link.is_ready() {
            return Err(EncodeError::NotReady(link.phase()));
        }
        let (Some(handle), Some(characteristic)) = (link.handle(), link.write_characteristic())
        else {
            return Err(EncodeError::NoWriteCharacteristic);
        };

        let segments = codec.encode(self.frame(), mode)?;
        debug!(
            "sending {:?} as {} segment(s), {mode:?}",
            self.frame().first().map(|&b| ItemCode(b)),
            segments.len()
        );
        for segment in &segments {
            transport
                .write_characteristic(handle, characteristic, segment)
                .map_err(|e| EncodeError::Transport(e.to_string()))?;
        }
        Ok(())
    }

    /// Encode and send a command produced by the session engine
    pub fn submit<C, T>(
        &mut self,
        command: &OutboundCommand,
        link: &ConnectionManager,
        codec: &mut C,
        transport: &mut T,
    ) -> Result<(), EncodeError>
    where
        C: FramingCodec + ?Sized,
        T: BleTransport,
    {
        self.encode(command.frame.item_code, &command.frame.payload)?;
        let result = self.send(command.mode, link, codec, transport);
        if let Err(e) = &result {
            warn!("{} not sent: {e}", command.frame.item_code);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{
        AddressType, BdAddr, Characteristic, ConnectionHandle, ScanParams, Service,
        TransportRequest,
    };
    use proptest::prelude::*;
    use sesame_proto::SegmentCodec;
    use sesame_proto::ble::{
        NOTIFY_CHARACTERISTIC_UUID, TargetIdentity, WRITE_CHARACTERISTIC_UUID, uuid16_to_uuid,
    };

    fn ready_link(t: &mut Vec<TransportRequest>) -> ConnectionManager {
        let mut link = ConnectionManager::new(TargetIdentity::SESAME, ScanParams::SESAME);
        link.start(t);
        link.on_advertisement(
            BdAddr([1; 6]),
            AddressType::Public,
            &[0x03, 0x03, 0x81, 0xFD],
            t,
        );
        link.on_connected(ConnectionHandle(1), t);
        link.on_service_found(Service {
            start_handle: 1,
            end_handle: 9,
            uuid: uuid16_to_uuid(0xFD81),
        });
        link.on_service_discovery_complete(t);
        for (value_handle, uuid) in [(3, WRITE_CHARACTERISTIC_UUID), (5, NOTIFY_CHARACTERISTIC_UUID)] {
            link.on_characteristic_found(Characteristic {
                start_handle: value_handle - 1,
                value_handle,
                end_handle: value_handle,
                properties: 0,
                uuid,
            });
        }
        link.on_characteristic_discovery_complete(t);
        link.on_notification_setup_complete();
        t.clear();
        link
    }

    fn writes(t: &[TransportRequest]) -> Vec<Vec<u8>> {
        t.iter()
            .filter_map(|r| match r {
                TransportRequest::WriteCharacteristic { value, .. } => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn encode_then_parse() {
        let mut encoder = CommandEncoder::new();
        let len = encoder.encode(ItemCode::LOCK, &[3, b'a', b'b', b'c']).unwrap();
        assert_eq!(len, 5);

        let (item, payload) = CommandEncoder::parse(encoder.frame()).unwrap();
        assert_eq!(item, ItemCode::LOCK);
        assert_eq!(payload, &[3, b'a', b'b', b'c']);
    }

    #[test]
    fn encode_replaces_previous_frame() {
        let mut encoder = CommandEncoder::new();
        encoder.encode(ItemCode::REGISTRATION, &[7; 64]).unwrap();
        encoder.encode(ItemCode::HISTORY, &[1]).unwrap();
        assert_eq!(encoder.frame(), &[4, 1]);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut encoder = CommandEncoder::new();
        assert_eq!(
            encoder.encode(ItemCode::LOCK, &[0; MAX_FRAME_LEN]),
            Err(EncodeError::FrameTooLarge(MAX_FRAME_LEN + 1))
        );
        assert!(encoder.frame().is_empty());
    }

    #[test]
    fn parse_empty_frame_fails() {
        assert_eq!(CommandEncoder::parse(&[]), Err(ProtoError::Empty));
    }

    #[test]
    fn send_requires_ready_link() {
        let mut t = Vec::new();
        let mut link = ConnectionManager::new(TargetIdentity::SESAME, ScanParams::SESAME);
        link.start(&mut t);
        t.clear();

        let mut encoder = CommandEncoder::new();
        encoder.encode(ItemCode::HISTORY, &[1]).unwrap();
        assert_eq!(
            encoder.send(FramingMode::Plaintext, &link, &mut SegmentCodec::new(), &mut t),
            Err(EncodeError::NotReady(ConnectionPhase::Scanning))
        );
        assert!(t.is_empty());
    }

    #[test]
    fn send_writes_every_segment_to_write_characteristic() {
        let mut t = Vec::new();
        let link = ready_link(&mut t);
        let mut encoder = CommandEncoder::new();
        encoder.encode(ItemCode::REGISTRATION, &[0xAB; 64]).unwrap();

        encoder
            .send(FramingMode::Plaintext, &link, &mut SegmentCodec::new(), &mut t)
            .unwrap();

        let segments = writes(&t);
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[0][0], 0b001);
        assert_eq!(segments[3][0], 0b010);
        assert!(t.iter().all(|r| matches!(
            r,
            TransportRequest::WriteCharacteristic { characteristic, .. }
                if characteristic.value_handle == 3
        )));

        let mut rx = SegmentCodec::new();
        let mut assembled = None;
        for segment in &segments {
            assembled = rx.decode(segment).unwrap();
        }
        let (mode, frame) = assembled.unwrap();
        assert_eq!(mode, FramingMode::Plaintext);
        assert_eq!(frame.len(), 65);
        assert_eq!(frame[0], ItemCode::REGISTRATION.0);
    }

    proptest! {
        #[test]
        fn every_frame_that_fits_is_written_and_reassembled(
            item in any::<u8>(),
            payload in proptest::collection::vec(any::<u8>(), 0..MAX_FRAME_LEN),
            ciphertext in any::<bool>(),
        ) {
            let mode = if ciphertext { FramingMode::Ciphertext } else { FramingMode::Plaintext };
            let mut t = Vec::new();
            let link = ready_link(&mut t);
            let mut encoder = CommandEncoder::new();
            encoder.encode(ItemCode(item), &payload).unwrap();
            encoder.send(mode, &link, &mut SegmentCodec::new(), &mut t).unwrap();

            let segments = writes(&t);
            prop_assert_eq!(segments.len(), (payload.len() + 1).div_ceil(19));
            prop_assert!(segments.iter().all(|s| s.len() <= 20));

            let mut rx = SegmentCodec::new();
            let mut assembled = None;
            for segment in &segments {
                assembled = rx.decode(segment).unwrap();
            }
            let (got_mode, frame) = assembled.unwrap();
            prop_assert_eq!(got_mode, mode);
            prop_assert_eq!(
                CommandEncoder::parse(&frame).unwrap(),
                (ItemCode(item), payload.as_slice())
            );
        }
    }
}
