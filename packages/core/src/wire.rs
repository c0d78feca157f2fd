//! Length-prefixed typed frames and the record payload layout.
//!
//! Every frame starts with a four-byte header: `u16` total size (big
//! endian, header included) followed by a `u16` message type. Record
//! payloads carry a fixed part — key size, expiry, peer presence flag, the
//! 32 peer bytes (zeroed when absent), subsystem size, value size, store
//! option — and then the variable regions `subsystem ‖ key ‖ value`.
//! All integers are network byte order.
//!
//! [`FrameCodec`] adapts the framing to `tokio_util::codec` so both the
//! service and the client can drive a socket through `Framed`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::hash::KeyHash;
use crate::identity::PeerId;
use crate::record::{Expiry, Record, StoreOption};

/// Size of the `{size, type}` frame header in bytes.
pub const HEADER_LEN: usize = 4;

/// Largest encodable frame; the size field is an unsigned 16-bit integer.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Size of the fixed part of a record payload.
pub const RECORD_FIXED_LEN: usize = 2 + 8 + 1 + PeerId::LEN + 2 + 2 + 1;

/// Typed messages exchanged between client and service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// C→S: persist a record.
    Store,
    /// C→S: stream records matching a query.
    Iterate,
    /// C→S: subscribe to stores matching a key digest.
    Watch,
    /// C→S: drop one matching subscription.
    WatchCancel,
    /// S→C: one record in an iteration stream.
    IterateRecord,
    /// S→C: end of an iteration stream, optionally carrying an error.
    IterateEnd,
    /// S→C: a stored record matching a subscription.
    WatchRecord,
    /// S→C: outcome of a store (negative code = failure).
    StoreResult,
}

impl MessageType {
    /// Wire discriminant of this message type.
    #[must_use]
    pub const fn to_wire(self) -> u16 {
        match self {
            Self::Store => 1,
            Self::Iterate => 2,
            Self::Watch => 3,
            Self::WatchCancel => 4,
            Self::IterateRecord => 5,
            Self::IterateEnd => 6,
            Self::WatchRecord => 7,
            Self::StoreResult => 8,
        }
    }

    /// Parses a wire discriminant back into a message type.
    #[must_use]
    pub const fn from_wire(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::Store),
            2 => Some(Self::Iterate),
            3 => Some(Self::Watch),
            4 => Some(Self::WatchCancel),
            5 => Some(Self::IterateRecord),
            6 => Some(Self::IterateEnd),
            7 => Some(Self::WatchRecord),
            8 => Some(Self::StoreResult),
            _ => None,
        }
    }
}

/// Errors raised while encoding or decoding frames.
///
/// All of these are recoverable locally: the service closes the offending
/// connection, other clients are unaffected.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The frame or payload is shorter than its mandatory fields.
    #[error("frame too short")]
    TooShort,
    /// The variable-region sizes do not add up to the payload length.
    #[error("variable-region sizes do not match payload length")]
    LengthMismatch,
    /// Subsystem, key, or error message bytes are not valid UTF-8.
    #[error("text field is not valid UTF-8")]
    InvalidUtf8,
    /// The store-option byte is not a known discriminant.
    #[error("unknown store option {0}")]
    InvalidOption(u8),
    /// The type field does not name a known message.
    #[error("unknown message type {0}")]
    UnknownType(u16),
    /// The frame would exceed the 16-bit size field.
    #[error("frame exceeds the {MAX_FRAME_LEN}-byte limit")]
    Oversize,
    /// Transport-level failure while framing.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A decoded frame: message type plus raw payload bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The message type from the header.
    pub ty: MessageType,
    /// Payload bytes after the header.
    pub payload: Bytes,
}

impl Frame {
    /// Builds a frame from a type and payload.
    #[must_use]
    pub const fn new(ty: MessageType, payload: Bytes) -> Self {
        Self { ty, payload }
    }
}

/// `tokio_util` codec for the length-prefixed frame format.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ParseError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let size = usize::from(u16::from_be_bytes([src[0], src[1]]));
        if size < HEADER_LEN {
            return Err(ParseError::TooShort);
        }
        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(size);
        frame.advance(2);
        let raw_ty = frame.get_u16();
        let ty = MessageType::from_wire(raw_ty).ok_or(ParseError::UnknownType(raw_ty))?;
        Ok(Some(Frame::new(ty, frame.freeze())))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ParseError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ParseError> {
        let total = HEADER_LEN + frame.payload.len();
        let size = u16::try_from(total).map_err(|_| ParseError::Oversize)?;
        dst.reserve(total);
        dst.put_u16(size);
        dst.put_u16(frame.ty.to_wire());
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

/// Encodes a record payload (without the frame header).
///
/// An absent `peer` is written as a zero presence flag plus 32 zero bytes,
/// so the variable regions always start at [`RECORD_FIXED_LEN`]. An absent
/// or empty `key` is written with size zero (the iteration wildcard).
///
/// # Errors
///
/// [`ParseError::Oversize`] when any field exceeds its 16-bit size or the
/// whole frame would exceed [`MAX_FRAME_LEN`].
pub fn encode_record(record: &Record) -> Result<Bytes, ParseError> {
    let key = record.key.as_deref().unwrap_or("");
    let key_size = u16::try_from(key.len()).map_err(|_| ParseError::Oversize)?;
    let subsystem_size =
        u16::try_from(record.subsystem.len()).map_err(|_| ParseError::Oversize)?;
    let value_size = u16::try_from(record.value.len()).map_err(|_| ParseError::Oversize)?;

    let payload_len =
        RECORD_FIXED_LEN + record.subsystem.len() + key.len() + record.value.len();
    if HEADER_LEN + payload_len > MAX_FRAME_LEN {
        return Err(ParseError::Oversize);
    }

    let mut buf = BytesMut::with_capacity(payload_len);
    buf.put_u16(key_size);
    buf.put_u64(record.expiry.as_micros());
    match &record.peer {
        Some(peer) => {
            buf.put_u8(1);
            buf.put_slice(peer.as_bytes());
        }
        None => {
            buf.put_u8(0);
            buf.put_slice(&[0u8; PeerId::LEN]);
        }
    }
    buf.put_u16(subsystem_size);
    buf.put_u16(value_size);
    buf.put_u8(record.option.to_wire());
    buf.put_slice(record.subsystem.as_bytes());
    buf.put_slice(key.as_bytes());
    buf.put_slice(&record.value);
    Ok(buf.freeze())
}

/// Decodes a record payload produced by [`encode_record`].
///
/// # Errors
///
/// [`ParseError::TooShort`] when the payload is smaller than the fixed
/// part, [`ParseError::LengthMismatch`] when the three variable sizes do
/// not sum to the remaining payload, [`ParseError::InvalidUtf8`] /
/// [`ParseError::InvalidOption`] for malformed fields.
pub fn decode_record(payload: &[u8]) -> Result<Record, ParseError> {
    if payload.len() < RECORD_FIXED_LEN {
        return Err(ParseError::TooShort);
    }
    let mut buf = payload;
    let key_size = usize::from(buf.get_u16());
    let expiry = Expiry::from_unix_micros(buf.get_u64());
    let peer_set = buf.get_u8();
    let mut peer_bytes = [0u8; PeerId::LEN];
    buf.copy_to_slice(&mut peer_bytes);
    let subsystem_size = usize::from(buf.get_u16());
    let value_size = usize::from(buf.get_u16());
    let raw_option = buf.get_u8();

    if buf.remaining() != subsystem_size + key_size + value_size {
        return Err(ParseError::LengthMismatch);
    }
    let option = StoreOption::from_wire(raw_option)
        .ok_or(ParseError::InvalidOption(raw_option))?;

    let subsystem = std::str::from_utf8(&buf[..subsystem_size])
        .map_err(|_| ParseError::InvalidUtf8)?
        .to_string();
    buf.advance(subsystem_size);
    let key = if key_size == 0 {
        None
    } else {
        Some(
            std::str::from_utf8(&buf[..key_size])
                .map_err(|_| ParseError::InvalidUtf8)?
                .to_string(),
        )
    };
    buf.advance(key_size);
    let value = buf[..value_size].to_vec();

    let peer = (peer_set != 0).then(|| PeerId::from_bytes(peer_bytes));
    Ok(Record {
        subsystem,
        peer,
        key,
        value,
        expiry,
        option,
    })
}

/// Encodes a `WATCH`/`WATCH_CANCEL` payload.
#[must_use]
pub fn encode_key_hash(hash: &KeyHash) -> Bytes {
    Bytes::copy_from_slice(hash.as_bytes())
}

/// Decodes a `WATCH`/`WATCH_CANCEL` payload, which must be exactly the
/// digest.
///
/// # Errors
///
/// [`ParseError::LengthMismatch`] for any other payload size.
pub fn decode_key_hash(payload: &[u8]) -> Result<KeyHash, ParseError> {
    let bytes: [u8; KeyHash::LEN] =
        payload.try_into().map_err(|_| ParseError::LengthMismatch)?;
    Ok(KeyHash::from_bytes(bytes))
}

/// Encodes a `STORE_RESULT` payload: `i32` code plus optional message.
#[must_use]
pub fn encode_store_result(code: i32, message: Option<&str>) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + message.map_or(0, str::len));
    buf.put_i32(code);
    if let Some(message) = message {
        buf.put_slice(message.as_bytes());
    }
    buf.freeze()
}

/// Decodes a `STORE_RESULT` payload into `(code, message)`.
///
/// # Errors
///
/// [`ParseError::TooShort`] when the code is missing,
/// [`ParseError::InvalidUtf8`] for a malformed message.
pub fn decode_store_result(payload: &[u8]) -> Result<(i32, Option<String>), ParseError> {
    if payload.len() < 4 {
        return Err(ParseError::TooShort);
    }
    let mut buf = payload;
    let code = buf.get_i32();
    let message = if buf.is_empty() {
        None
    } else {
        Some(
            std::str::from_utf8(buf)
                .map_err(|_| ParseError::InvalidUtf8)?
                .to_string(),
        )
    };
    Ok((code, message))
}

/// Encodes an `ITERATE_END` payload: empty on success, the error message
/// otherwise.
#[must_use]
pub fn encode_iterate_end(error: Option<&str>) -> Bytes {
    match error {
        Some(error) => Bytes::copy_from_slice(error.as_bytes()),
        None => Bytes::new(),
    }
}

/// Decodes an `ITERATE_END` payload; `None` means the stream finished
/// cleanly.
///
/// # Errors
///
/// [`ParseError::InvalidUtf8`] for a malformed error message.
pub fn decode_iterate_end(payload: &[u8]) -> Result<Option<String>, ParseError> {
    if payload.is_empty() {
        return Ok(None);
    }
    Ok(Some(
        std::str::from_utf8(payload)
            .map_err(|_| ParseError::InvalidUtf8)?
            .to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> Record {
        Record {
            subsystem: "transport".to_string(),
            peer: Some(PeerId::from_bytes([9; 32])),
            key: Some("hello".to_string()),
            value: vec![1, 2, 3, 0, 5],
            expiry: Expiry::from_unix_micros(1_234_567),
            option: StoreOption::Replace,
        }
    }

    #[test]
    fn record_roundtrip() {
        let record = sample_record();
        let payload = encode_record(&record).expect("encode");
        assert_eq!(decode_record(&payload).expect("decode"), record);
    }

    #[test]
    fn record_roundtrip_without_peer_or_key() {
        // The query shape: wildcard peer and key, empty value.
        let record = Record {
            subsystem: "dht".to_string(),
            peer: None,
            key: None,
            value: Vec::new(),
            expiry: Expiry::NEVER,
            option: StoreOption::Multiple,
        };
        let payload = encode_record(&record).expect("encode");
        assert_eq!(payload.len(), RECORD_FIXED_LEN + 3);
        assert_eq!(decode_record(&payload).expect("decode"), record);
    }

    #[test]
    fn record_roundtrip_empty_value() {
        let mut record = sample_record();
        record.value.clear();
        let payload = encode_record(&record).expect("encode");
        let decoded = decode_record(&payload).expect("decode");
        assert!(decoded.value.is_empty());
        assert_eq!(decoded, record);
    }

    #[test]
    fn decode_rejects_short_payload() {
        let err = decode_record(&[0u8; RECORD_FIXED_LEN - 1]).unwrap_err();
        assert!(matches!(err, ParseError::TooShort));
    }

    #[test]
    fn decode_rejects_size_mismatch() {
        let record = sample_record();
        let mut payload = BytesMut::from(&encode_record(&record).expect("encode")[..]);
        // Inflate the declared value size without adding bytes.
        let value_size_at = 2 + 8 + 1 + PeerId::LEN + 2;
        payload[value_size_at] = 0xFF;
        let err = decode_record(&payload).unwrap_err();
        assert!(matches!(err, ParseError::LengthMismatch));
    }

    #[test]
    fn decode_rejects_invalid_utf8_subsystem() {
        let record = sample_record();
        let mut payload = BytesMut::from(&encode_record(&record).expect("encode")[..]);
        payload[RECORD_FIXED_LEN] = 0xFF; // first subsystem byte
        let err = decode_record(&payload).unwrap_err();
        assert!(matches!(err, ParseError::InvalidUtf8));
    }

    #[test]
    fn decode_rejects_unknown_option() {
        let record = sample_record();
        let mut payload = BytesMut::from(&encode_record(&record).expect("encode")[..]);
        payload[RECORD_FIXED_LEN - 1] = 9;
        let err = decode_record(&payload).unwrap_err();
        assert!(matches!(err, ParseError::InvalidOption(9)));
    }

    #[test]
    fn encode_rejects_oversize_value() {
        let mut record = sample_record();
        record.value = vec![0u8; MAX_FRAME_LEN];
        let err = encode_record(&record).unwrap_err();
        assert!(matches!(err, ParseError::Oversize));
    }

    #[test]
    fn key_hash_payload_roundtrip() {
        let hash = KeyHash::of("t", &PeerId::from_bytes([3; 32]), "k");
        let payload = encode_key_hash(&hash);
        assert_eq!(payload.len(), KeyHash::LEN);
        assert_eq!(decode_key_hash(&payload).expect("decode"), hash);
    }

    #[test]
    fn key_hash_payload_must_be_exact() {
        assert!(matches!(
            decode_key_hash(&[0u8; KeyHash::LEN - 1]),
            Err(ParseError::LengthMismatch)
        ));
        assert!(matches!(
            decode_key_hash(&[0u8; KeyHash::LEN + 1]),
            Err(ParseError::LengthMismatch)
        ));
    }

    #[test]
    fn store_result_roundtrip() {
        let ok = encode_store_result(0, None);
        assert_eq!(decode_store_result(&ok).expect("decode"), (0, None));

        let err = encode_store_result(-1, Some("disk full"));
        assert_eq!(
            decode_store_result(&err).expect("decode"),
            (-1, Some("disk full".to_string()))
        );
    }

    #[test]
    fn iterate_end_roundtrip() {
        assert_eq!(decode_iterate_end(&encode_iterate_end(None)).expect("decode"), None);
        assert_eq!(
            decode_iterate_end(&encode_iterate_end(Some("bind failed"))).expect("decode"),
            Some("bind failed".to_string())
        );
    }

    #[test]
    fn message_type_wire_roundtrip() {
        for ty in [
            MessageType::Store,
            MessageType::Iterate,
            MessageType::Watch,
            MessageType::WatchCancel,
            MessageType::IterateRecord,
            MessageType::IterateEnd,
            MessageType::WatchRecord,
            MessageType::StoreResult,
        ] {
            assert_eq!(MessageType::from_wire(ty.to_wire()), Some(ty));
        }
        assert_eq!(MessageType::from_wire(0), None);
        assert_eq!(MessageType::from_wire(999), None);
    }

    #[test]
    fn codec_roundtrip() {
        let mut codec = FrameCodec;
        let record = sample_record();
        let frame = Frame::new(
            MessageType::Store,
            encode_record(&record).expect("encode"),
        );

        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).expect("encode frame");
        let decoded = codec.decode(&mut buf).expect("decode frame").expect("one frame");
        assert_eq!(decoded.ty, MessageType::Store);
        assert_eq!(decode_record(&decoded.payload).expect("decode record"), record);
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_waits_for_full_frame() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(
                Frame::new(MessageType::IterateEnd, Bytes::from_static(b"oops")),
                &mut buf,
            )
            .expect("encode frame");

        let mut partial = BytesMut::from(&buf[..3]);
        assert!(codec.decode(&mut partial).expect("incomplete header").is_none());

        let mut partial = BytesMut::from(&buf[..buf.len() - 1]);
        assert!(codec.decode(&mut partial).expect("incomplete body").is_none());
    }

    #[test]
    fn codec_decodes_back_to_back_frames() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new(MessageType::IterateEnd, Bytes::new()), &mut buf)
            .expect("encode first");
        codec
            .encode(
                Frame::new(MessageType::Watch, encode_key_hash(&KeyHash::of(
                    "t",
                    &PeerId::from_bytes([1; 32]),
                    "k",
                ))),
                &mut buf,
            )
            .expect("encode second");

        let first = codec.decode(&mut buf).expect("decode").expect("first frame");
        assert_eq!(first.ty, MessageType::IterateEnd);
        let second = codec.decode(&mut buf).expect("decode").expect("second frame");
        assert_eq!(second.ty, MessageType::Watch);
        assert!(codec.decode(&mut buf).expect("drained").is_none());
    }

    #[test]
    fn codec_rejects_undersized_header() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u16(2); // size smaller than the header itself
        buf.put_u16(MessageType::Store.to_wire());
        assert!(matches!(codec.decode(&mut buf), Err(ParseError::TooShort)));
    }

    #[test]
    fn codec_rejects_unknown_type() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u16(4);
        buf.put_u16(4242);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ParseError::UnknownType(4242))
        ));
    }
}
