//! Wire frames and the streaming decoder.
//!
//! ```text
//! [0x7E][address][command_id][length][payload: length][checksum]
//! ```
//!
//! The checksum covers address, command id, length and payload. The start
//! marker is the resynchronization anchor: after a checksum or length failure
//! the decoder discards exactly one byte and scans for the next marker.

use core::fmt;

use openracing_errors::{EncodingError, FramingError};

use crate::checksum::{AdditiveChecksum, Checksum};

/// First byte of every frame.
pub const START_MARKER: u8 = 0x7E;
/// Marker, address, command id and length.
pub const HEADER_LEN: usize = 4;
/// Largest payload a single frame carries.
pub const MAX_PAYLOAD_LEN: usize = MAX_DECLARED_LEN as usize;
const MAX_DECLARED_LEN: u8 = 64;
/// Largest encoded frame.
pub const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_PAYLOAD_LEN + 1;

/// A validated frame. Built by [`FrameCodec`], immutable afterwards.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Frame {
    address: u8,
    command_id: u8,
    payload: Vec<u8>,
    checksum: u8,
}

impl Frame {
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn command_id(&self) -> u8 {
        self.command_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn checksum(&self) -> u8 {
        self.checksum
    }

    /// Length of the encoded frame on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len() + 1
    }

    /// Encoded wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_len());
        out.push(START_MARKER);
        out.push(self.address);
        out.push(self.command_id);
        // Frame construction bounds the payload to MAX_PAYLOAD_LEN.
        out.push(u8::try_from(self.payload.len()).unwrap_or(u8::MAX));
        out.extend_from_slice(&self.payload);
        out.push(self.checksum);
        out
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame {{ addr: {:#04x}, cmd: {:#04x}, payload: {:02X?}, checksum: {:#04x} }}",
            self.address, self.command_id, self.payload, self.checksum
        )
    }
}

/// Result of one decode attempt over a receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// A valid frame starts at the beginning of the buffer.
    Frame { frame: Frame, consumed: usize },
    /// The buffer holds an incomplete frame; wait for more bytes.
    NeedMoreData,
    /// Drop `discard` bytes from the front and try again.
    Invalid { discard: usize, reason: FramingError },
}

/// Encoder and decoder parameterized by the checksum function.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec<C = AdditiveChecksum> {
    checksum: C,
}

impl FrameCodec<AdditiveChecksum> {
    /// Codec with the Moza checksum.
    pub fn moza() -> Self {
        Self {
            checksum: AdditiveChecksum::MOZA,
        }
    }
}

impl<C: Checksum> FrameCodec<C> {
    pub fn new(checksum: C) -> Self {
        Self { checksum }
    }

    /// Build a frame, computing its checksum.
    pub fn frame(
        &self,
        address: u8,
        command_id: u8,
        payload: Vec<u8>,
    ) -> Result<Frame, EncodingError> {
        let len = u8::try_from(payload.len())
            .ok()
            .filter(|len| usize::from(*len) <= MAX_PAYLOAD_LEN)
            .ok_or(EncodingError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_LEN,
            })?;
        let checksum = self.compute(address, command_id, len, &payload);
        Ok(Frame {
            address,
            command_id,
            payload,
            checksum,
        })
    }

    fn compute(&self, address: u8, command_id: u8, len: u8, payload: &[u8]) -> u8 {
        let mut covered = Vec::with_capacity(payload.len() + 3);
        covered.extend_from_slice(&[address, command_id, len]);
        covered.extend_from_slice(payload);
        self.checksum.compute(&covered)
    }

    /// Attempt to decode one frame from the front of `bytes`.
    ///
    /// Leading bytes before a start marker are reported as a single
    /// `Invalid` covering all of them.
    pub fn decode(&self, bytes: &[u8]) -> DecodeOutcome {
        match bytes.iter().position(|b| *b == START_MARKER) {
            Some(0) => {}
            Some(skipped) => {
                return DecodeOutcome::Invalid {
                    discard: skipped,
                    reason: FramingError::Noise { skipped },
                };
            }
            None if bytes.is_empty() => return DecodeOutcome::NeedMoreData,
            None => {
                return DecodeOutcome::Invalid {
                    discard: bytes.len(),
                    reason: FramingError::Noise {
                        skipped: bytes.len(),
                    },
                };
            }
        }

        let Some(&[_, address, command_id, declared]) = bytes.get(..HEADER_LEN) else {
            return DecodeOutcome::NeedMoreData;
        };
        let payload_len = usize::from(declared);
        if payload_len > MAX_PAYLOAD_LEN {
            return DecodeOutcome::Invalid {
                discard: 1,
                reason: FramingError::LengthOutOfRange {
                    declared,
                    max: MAX_DECLARED_LEN,
                },
            };
        }

        let checksum_at = HEADER_LEN + payload_len;
        let (Some(payload), Some(&received)) =
            (bytes.get(HEADER_LEN..checksum_at), bytes.get(checksum_at))
        else {
            // A corrupted length byte would otherwise stall every frame
            // queued behind it.
            return match self.next_complete_frame(bytes) {
                Some(next_frame_at) => DecodeOutcome::Invalid {
                    discard: 1,
                    reason: FramingError::Truncated {
                        declared,
                        next_frame_at,
                    },
                },
                None => DecodeOutcome::NeedMoreData,
            };
        };

        let expected = self.compute(address, command_id, declared, payload);
        if expected != received {
            return DecodeOutcome::Invalid {
                discard: 1,
                reason: FramingError::ChecksumMismatch {
                    expected,
                    actual: received,
                },
            };
        }

        DecodeOutcome::Frame {
            frame: Frame {
                address,
                command_id,
                payload: payload.to_vec(),
                checksum: received,
            },
            consumed: checksum_at + 1,
        }
    }

    /// Offset of the first complete, checksum-valid frame after position 0.
    fn next_complete_frame(&self, bytes: &[u8]) -> Option<usize> {
        bytes
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, b)| **b == START_MARKER)
            .map(|(at, _)| at)
            .find(|&at| bytes.get(at..).is_some_and(|rest| self.is_complete_frame(rest)))
    }

    fn is_complete_frame(&self, bytes: &[u8]) -> bool {
        let Some(&[_, address, command_id, declared]) = bytes.get(..HEADER_LEN) else {
            return false;
        };
        if usize::from(declared) > MAX_PAYLOAD_LEN {
            return false;
        }
        let checksum_at = HEADER_LEN + usize::from(declared);
        match (bytes.get(HEADER_LEN..checksum_at), bytes.get(checksum_at)) {
            (Some(payload), Some(&received)) => {
                self.compute(address, command_id, declared, payload) == received
            }
            _ => false,
        }
    }
}

/// Receive buffer that feeds [`FrameCodec::decode`] in byte order.
#[derive(Debug, Default)]
pub struct StreamDecoder<C = AdditiveChecksum> {
    codec: FrameCodec<C>,
    buffer: Vec<u8>,
}

impl<C: Checksum> StreamDecoder<C> {
    pub fn new(codec: FrameCodec<C>) -> Self {
        Self {
            codec,
            buffer: Vec::with_capacity(MAX_FRAME_LEN * 2),
        }
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Next decoded frame or framing failure, or `None` once the buffer needs
    /// more bytes.
    pub fn next_event(&mut self) -> Option<Result<Frame, FramingError>> {
        match self.codec.decode(&self.buffer) {
            DecodeOutcome::NeedMoreData => None,
            DecodeOutcome::Frame { frame, consumed } => {
                self.buffer.drain(..consumed.min(self.buffer.len()));
                Some(Ok(frame))
            }
            DecodeOutcome::Invalid { discard, reason } => {
                let n = discard.max(1).min(self.buffer.len());
                self.buffer.drain(..n);
                Some(Err(reason))
            }
        }
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
