// dny-protocol: wire codec for the DNY binary frame protocol plus its two
// unframed sentinel messages (ICCID report, link heartbeat).
//
// A single `DnyCodec` recognises all three message shapes on one byte
// stream and is meant to be driven through `tokio_util::codec::Framed`
// over the device's TCP socket.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Minimum `len` field value: physical_id(4) + message_id(2) + command(1) + checksum(2).
const MIN_FRAME_LEN: u16 = 9;
/// `"DNY"` + the 2-byte length field that precedes every binary frame.
const FRAME_HEADER_LEN: usize = 5;
/// Exact byte length of an ICCID sentinel.
const ICCID_LEN: usize = 20;
/// Exact bytes of the link-heartbeat sentinel.
const LINK_SENTINEL: &[u8; 4] = b"link";

/// A single decoded message taken off a device's byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedMessage {
    Dny(DnyFrame),
    Iccid(String),
    LinkHeartbeat,
    /// A byte that matched none of the three known shapes. Carried for
    /// diagnostics; callers log and discard it without stalling the stream.
    Unknown(u8),
}

/// A fully decoded DNY binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnyFrame {
    pub physical_id: u32,
    pub message_id: u16,
    pub command: u8,
    pub payload: Vec<u8>,
    pub checksum_valid: bool,
}

impl DnyFrame {
    /// The 8-hex-char uppercase display form of `physical_id`, used as the
    /// device registry key.
    #[must_use]
    pub fn device_id(&self) -> String {
        format!("{:08X}", self.physical_id)
    }
}

/// A frame to be written to a device, prior to checksum computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundDnyFrame {
    pub physical_id: u32,
    pub message_id: u16,
    pub command: u8,
    pub payload: Vec<u8>,
}

impl OutboundDnyFrame {
    #[must_use]
    pub fn new(physical_id: u32, message_id: u16, command: u8, payload: Vec<u8>) -> Self {
        Self {
            physical_id,
            message_id,
            command,
            payload,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("DNY frame declares len {0}, below the minimum of {MIN_FRAME_LEN}")]
    FrameTooShort(u16),
    #[error("DNY frame declares len {0}, exceeding the configured maximum of {1}")]
    FrameTooLong(u16, u16),
}

/// Default ceiling on a DNY frame's declared `len` field, guarding against a
/// corrupt length value forcing an unbounded read buffer.
pub const DEFAULT_MAX_FRAME_LEN: u16 = 4096;

/// Stateful decoder/encoder for one connection's byte stream.
pub struct DnyCodec {
    max_frame_len: u16,
}

impl DnyCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    #[must_use]
    pub fn with_max_frame_len(max_frame_len: u16) -> Self {
        Self { max_frame_len }
    }
}

impl Default for DnyCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn checksum_of(frame_bytes_without_checksum: &[u8]) -> u16 {
    let sum: u32 = frame_bytes_without_checksum
        .iter()
        .fold(0u32, |acc, b| acc + u32::from(*b));
    (sum % 0x1_0000) as u16
}

fn is_iccid(candidate: &[u8]) -> bool {
    candidate.len() == ICCID_LEN
        && candidate.starts_with(b"89")
        && candidate.iter().all(|b| b.is_ascii_hexdigit())
}

/// True iff `prefix` (shorter than [`ICCID_LEN`]) is still consistent with
/// eventually forming a valid ICCID once more bytes arrive.
fn is_iccid_prefix(prefix: &[u8]) -> bool {
    prefix.len() < ICCID_LEN
        && (prefix.is_empty() || prefix[0] == b'8')
        && (prefix.len() < 2 || prefix[1] == b'9')
        && prefix.iter().all(|b| b.is_ascii_hexdigit())
}

/// True iff `prefix` (shorter than 4 bytes) is still consistent with
/// eventually forming the `"link"` sentinel once more bytes arrive.
fn is_link_prefix(prefix: &[u8]) -> bool {
    prefix.len() < 4 && LINK_SENTINEL.starts_with(prefix)
}

impl Decoder for DnyCodec {
    type Item = DecodedMessage;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < 3 {
            return Ok(None);
        }

        if &buf[0..3] == b"DNY" {
            return self.decode_dny(buf);
        }

        if buf.len() < 4 {
            // Could still turn into "link" or the start of an ICCID with one
            // more byte; wait rather than misclassifying a true prefix.
            if is_iccid_prefix(&buf[..]) || is_link_prefix(&buf[..]) {
                return Ok(None);
            }
            return Ok(Some(DecodedMessage::Unknown(buf.get_u8())));
        }

        if &buf[0..4] == LINK_SENTINEL {
            buf.advance(4);
            return Ok(Some(DecodedMessage::LinkHeartbeat));
        }

        if buf.len() < ICCID_LEN {
            if is_iccid_prefix(&buf[..]) {
                return Ok(None);
            }
            return Ok(Some(DecodedMessage::Unknown(buf.get_u8())));
        }

        if is_iccid(&buf[..ICCID_LEN]) {
            let iccid = String::from_utf8_lossy(&buf[..ICCID_LEN]).into_owned();
            buf.advance(ICCID_LEN);
            return Ok(Some(DecodedMessage::Iccid(iccid)));
        }

        Ok(Some(DecodedMessage::Unknown(buf.get_u8())))
    }
}

impl DnyCodec {
    fn decode_dny(&mut self, buf: &mut BytesMut) -> Result<Option<DecodedMessage>, CodecError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let len = u16::from_le_bytes([buf[3], buf[4]]);
        if len < MIN_FRAME_LEN {
            // Drop the anchor and resync one byte at a time rather than
            // wedging the stream on a malformed length.
            buf.advance(3);
            return Err(CodecError::FrameTooShort(len));
        }
        if len > self.max_frame_len {
            buf.advance(3);
            return Err(CodecError::FrameTooLong(len, self.max_frame_len));
        }

        let total_len = FRAME_HEADER_LEN + len as usize;
        if buf.len() < total_len {
            buf.reserve(total_len - buf.len());
            return Ok(None);
        }

        let frame_bytes = buf.split_to(total_len);
        let physical_id = u32::from_le_bytes([
            frame_bytes[5],
            frame_bytes[6],
            frame_bytes[7],
            frame_bytes[8],
        ]);
        let message_id = u16::from_le_bytes([frame_bytes[9], frame_bytes[10]]);
        let command = frame_bytes[11];
        let payload = frame_bytes[12..total_len - 2].to_vec();
        let checksum = u16::from_le_bytes([frame_bytes[total_len - 2], frame_bytes[total_len - 1]]);
        let checksum_valid = checksum_of(&frame_bytes[..total_len - 2]) == checksum;

        Ok(Some(DecodedMessage::Dny(DnyFrame {
            physical_id,
            message_id,
            command,
            payload,
            checksum_valid,
        })))
    }
}

impl Encoder<OutboundDnyFrame> for DnyCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: OutboundDnyFrame, buf: &mut BytesMut) -> Result<(), CodecError> {
        let len = MIN_FRAME_LEN
            .checked_add(frame.payload.len() as u16)
            .ok_or(CodecError::FrameTooLong(u16::MAX, self.max_frame_len))?;

        let body_start = buf.len();
        buf.put_slice(b"DNY");
        buf.put_u16_le(len);
        buf.put_u32_le(frame.physical_id);
        buf.put_u16_le(frame.message_id);
        buf.put_u8(frame.command);
        buf.put_slice(&frame.payload);
        let checksum = checksum_of(&buf[body_start..]);
        buf.put_u16_le(checksum);
        Ok(())
    }
}

/// Encodes a single frame to a standalone byte vector, for callers that
/// write directly to a socket instead of going through `Framed`.
#[must_use]
pub fn encode_frame(frame: &OutboundDnyFrame) -> Vec<u8> {
    let mut buf = BytesMut::new();
    let mut codec = DnyCodec::new();
    codec
        .encode(frame.clone(), &mut buf)
        .expect("encoding a well-formed frame never fails");
    buf.to_vec()
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn decode_of_encode_is_identity(
            physical_id: u32,
            message_id: u16,
            command: u8,
            payload in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let frame = OutboundDnyFrame::new(physical_id, message_id, command, payload.clone());
            let bytes = encode_frame(&frame);
            let mut codec = DnyCodec::new();
            let mut buf = BytesMut::from(&bytes[..]);
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            match decoded {
                DecodedMessage::Dny(f) => {
                    prop_assert_eq!(f.physical_id, physical_id);
                    prop_assert_eq!(f.message_id, message_id);
                    prop_assert_eq!(f.command, command);
                    prop_assert_eq!(f.payload, payload);
                    prop_assert!(f.checksum_valid);
                }
                other => prop_assert!(false, "expected Dny, got {:?}", other),
            }
        }
    }
}
