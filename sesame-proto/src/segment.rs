//! Segmentation of command frames into BLE writes
//!
//! Every segment starts with a one byte header:
//! - bit 0: first segment of a frame
//! - bits 1..=2: parsing type, 0 (append only) on every segment but the last
//!
//! The lock notifies its answers using the same layout.

use log::debug;

use crate::{MAX_FRAME_LEN, ProtoError};

/// Payload bytes per segment (default ATT MTU of 23 minus the ATT header and our header)
pub const SEGMENT_PAYLOAD_LEN: usize = 19;

/// Upper bound for a reassembled incoming message
pub const MAX_MESSAGE_LEN: usize = 512;

/// How the final segment asks the receiver to interpret the assembled frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FramingMode {
    AppendOnly = 0,
    Plaintext = 1,
    Ciphertext = 2,
}

impl FramingMode {
    pub fn from_u8(value: u8) -> Result<Self, ProtoError> {
        match value {
            0 => Ok(Self::AppendOnly),
            1 => Ok(Self::Plaintext),
            2 => Ok(Self::Ciphertext),
            other => Err(ProtoError::InvalidParsingType(other)),
        }
    }
}

/// Turns whole frames into transport-sized writes and back
pub trait FramingCodec {
    /// Split a frame into the segments to write, in order
    fn encode(&mut self, frame: &[u8], mode: FramingMode) -> Result<Vec<Vec<u8>>, ProtoError>;

    /// Feed one notified segment; returns the message once it is complete
    fn decode(&mut self, segment: &[u8]) -> Result<Option<(FramingMode, Vec<u8>)>, ProtoError>;

    /// Drop any partially received message
    fn reset(&mut self);
}

/// Default codec: header byte segmentation, no payload transformation
#[derive(Debug, Default)]
pub struct SegmentCodec {
    rx: Vec<u8>,
    receiving: bool,
}

impl SegmentCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

fn header(is_start: bool, mode: FramingMode) -> u8 {
    ((mode as u8) << 1) | u8::from(is_start)
}

impl FramingCodec for SegmentCodec {
    fn encode(&mut self, frame: &[u8], mode: FramingMode) -> Result<Vec<Vec<u8>>, ProtoError> {
        if frame.is_empty() {
            return Err(ProtoError::Empty);
        }
        if frame.len() > MAX_FRAME_LEN {
            return Err(ProtoError::FrameTooLarge(frame.len()));
        }

        let chunks: Vec<&[u8]> = frame.chunks(SEGMENT_PAYLOAD_LEN).collect();
        let last = chunks.len() - 1;

        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let seg_mode = if i == last { mode } else { FramingMode::AppendOnly };
                let mut segment = Vec::with_capacity(1 + chunk.len());
                segment.push(header(i == 0, seg_mode));
                segment.extend_from_slice(chunk);
                segment
            })
            .collect())
    }

    fn decode(&mut self, segment: &[u8]) -> Result<Option<(FramingMode, Vec<u8>)>, ProtoError> {
        let (&head, data) = segment.split_first().ok_or(ProtoError::Empty)?;
        let is_start = head & 1 != 0;
        let mode = FramingMode::from_u8(head >> 1)?;

        if is_start {
            self.rx.clear();
            self.receiving = true;
        } else if !self.receiving {
            return Err(ProtoError::OrphanSegment);
        }

        if self.rx.len() + data.len() > MAX_MESSAGE_LEN {
            self.reset();
            return Err(ProtoError::FrameTooLarge(MAX_MESSAGE_LEN + 1));
        }
        self.rx.extend_from_slice(data);
        debug!(
            "segment: start={is_start} mode={mode:?} len={} buffered={}",
            data.len(),
            self.rx.len()
        );

        if mode == FramingMode::AppendOnly {
            return Ok(None);
        }

        self.receiving = false;
        Ok(Some((mode, std::mem::take(&mut self.rx))))
    }

    fn reset(&mut self) {
        self.rx.clear();
        self.receiving = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_frame_is_one_segment() {
        let mut codec = SegmentCodec::new();
        let segments = codec.encode(&[2, 1, 2, 3, 4], FramingMode::Plaintext).unwrap();
        assert_eq!(segments, vec![vec![0b011, 2, 1, 2, 3, 4]]);
    }

    #[test]
    fn registration_frame_spans_four_segments() {
        let mut codec = SegmentCodec::new();
        let mut frame = vec![1u8];
        frame.extend([0xAA; 64]);

        let segments = codec.encode(&frame, FramingMode::Plaintext).unwrap();
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[0][0], 0b001);
        assert_eq!(segments[1][0], 0b000);
        assert_eq!(segments[2][0], 0b000);
        assert_eq!(segments[3][0], 0b010);
        assert_eq!(segments.iter().map(|s| s.len() - 1).sum::<usize>(), 65);

        let mut rx = SegmentCodec::new();
        let mut out = None;
        for segment in &segments {
            out = rx.decode(segment).unwrap();
        }
        assert_eq!(out, Some((FramingMode::Plaintext, frame)));
    }

    #[test]
    fn ciphertext_mode_rides_on_last_segment() {
        let mut codec = SegmentCodec::new();
        let segments = codec.encode(&[82, 0], FramingMode::Ciphertext).unwrap();
        assert_eq!(segments[0][0], 0b101);
    }

    #[test]
    fn continuation_without_start_is_rejected() {
        let mut codec = SegmentCodec::new();
        assert_eq!(codec.decode(&[0b000, 1, 2]), Err(ProtoError::OrphanSegment));
    }

    #[test]
    fn new_start_discards_partial_message() {
        let mut codec = SegmentCodec::new();
        assert_eq!(codec.decode(&[0b001, 9, 9]).unwrap(), None);
        let out = codec.decode(&[0b011, 8, 14, 1, 2, 3, 4]).unwrap();
        assert_eq!(out, Some((FramingMode::Plaintext, vec![8, 14, 1, 2, 3, 4])));
    }

    #[test]
    fn reset_forgets_partial_message() {
        let mut codec = SegmentCodec::new();
        codec.decode(&[0b001, 9, 9]).unwrap();
        codec.reset();
        assert_eq!(codec.decode(&[0b010, 1]), Err(ProtoError::OrphanSegment));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = SegmentCodec::new();
        let frame = vec![0u8; MAX_FRAME_LEN + 1];
        assert_eq!(
            codec.encode(&frame, FramingMode::Plaintext),
            Err(ProtoError::FrameTooLarge(MAX_FRAME_LEN + 1))
        );
    }
}
