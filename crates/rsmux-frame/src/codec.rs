use std::fmt;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::frame_type::{
    FrameType, FLAGS_MASK, FLAG_COMPLETE, FLAG_FOLLOWS, FLAG_IGNORE, FLAG_METADATA, FLAG_NEXT,
    FLAG_RESPOND,
};

/// Transport-level length prefix: 3 bytes, big-endian.
pub const FRAME_LENGTH_SIZE: usize = 3;

/// Frame header: stream id (4) + type and flags (2) = 6 bytes.
pub const HEADER_SIZE: usize = 6;

/// Bytes every frame spends before its body, length prefix included.
pub const FRAME_OFFSET: usize = FRAME_LENGTH_SIZE + HEADER_SIZE;

/// Initial request-n / REQUEST_N field.
pub const REQUEST_N_SIZE: usize = 4;

/// Metadata length field in payload-bearing frames.
pub const METADATA_LENGTH_SIZE: usize = 3;

/// Largest frame the 24-bit length prefix can describe.
pub const MAX_FRAME_LENGTH: usize = 0xFF_FFFF;

/// Largest metadata section the 24-bit metadata length can describe.
pub const MAX_METADATA_LENGTH: usize = 0xFF_FFFF;

/// Stream ids are 31 bits; the top bit is reserved.
pub const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;

/// Largest request-n; sending it means "unbounded".
pub const MAX_REQUEST_N: u32 = 0x7FFF_FFFF;

/// Default maximum frame length: the protocol maximum.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = MAX_FRAME_LENGTH;

const TYPE_SHIFT: u16 = 10;

/// One decoded frame: an immutable, reference-counted byte region without
/// the length prefix.
///
/// Construction validates the layout, so accessors never fail.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    buf: Bytes,
    frame_type: FrameType,
}

impl Frame {
    /// Decode a frame from its bytes (length prefix already stripped).
    pub fn decode(buf: Bytes) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(FrameError::Truncated {
                frame_type: "frame",
                size: buf.len(),
                needed: HEADER_SIZE,
            });
        }
        let type_and_flags = u16::from_be_bytes([buf[4], buf[5]]);
        let code = (type_and_flags >> TYPE_SHIFT) as u8;
        let frame_type = FrameType::from_encoded(code, type_and_flags & FLAGS_MASK)?;
        let frame = Self { buf, frame_type };
        frame.validate()?;
        Ok(frame)
    }

    fn validate(&self) -> Result<()> {
        let mut needed = self.body_offset();
        if self.frame_type.carries_payload() && self.has_metadata() {
            needed += METADATA_LENGTH_SIZE;
            if self.buf.len() >= needed {
                needed += read_u24(&self.buf[needed - METADATA_LENGTH_SIZE..]);
            }
        }
        if self.buf.len() < needed {
            let stream_id = self.stream_id();
            if stream_id == 0 {
                return Err(FrameError::Truncated {
                    frame_type: self.frame_type.name(),
                    size: self.buf.len(),
                    needed,
                });
            }
            return Err(FrameError::MalformedBody {
                stream_id,
                frame_type: self.frame_type,
                size: self.buf.len(),
                needed,
            });
        }
        Ok(())
    }

    /// Encode any payload-bearing frame: the four request types and the
    /// PAYLOAD variants.
    ///
    /// `extra_flags` may carry FOLLOWS, and COMPLETE for REQUEST_CHANNEL.
    /// `initial_request_n` is written only for REQUEST_STREAM/REQUEST_CHANNEL.
    pub fn payload_frame(
        stream_id: u32,
        frame_type: FrameType,
        extra_flags: u16,
        initial_request_n: u32,
        metadata: Option<&[u8]>,
        data: &[u8],
    ) -> Result<Self> {
        if !frame_type.carries_payload() {
            return Err(FrameError::NotFragmentable(frame_type.name()));
        }
        let flags = extra_flags & (FLAG_FOLLOWS | FLAG_COMPLETE | FLAG_IGNORE);
        let metadata_len = metadata.map_or(0, <[u8]>::len);
        if metadata_len > MAX_METADATA_LENGTH {
            return Err(FrameError::MetadataTooLarge(metadata_len));
        }
        Ok(Self::payload_frame_unchecked(
            stream_id,
            frame_type,
            flags,
            initial_request_n,
            metadata,
            data,
        ))
    }

    /// `payload_frame` for callers that already bounded the metadata length.
    pub(crate) fn payload_frame_unchecked(
        stream_id: u32,
        frame_type: FrameType,
        flags: u16,
        initial_request_n: u32,
        metadata: Option<&[u8]>,
        data: &[u8],
    ) -> Self {
        let flags = if metadata.is_some() {
            flags | FLAG_METADATA
        } else {
            flags
        };
        let mut dst = BytesMut::with_capacity(encoded_payload_len(
            frame_type,
            metadata.map(<[u8]>::len),
            data.len(),
        ));
        put_header(&mut dst, stream_id, frame_type, flags);
        if frame_type.has_initial_request_n() {
            dst.put_u32(initial_request_n.clamp(1, MAX_REQUEST_N));
        }
        if let Some(metadata) = metadata {
            put_u24(&mut dst, metadata.len());
            dst.put_slice(metadata);
        }
        dst.put_slice(data);
        Self::from_parts(dst, frame_type)
    }

    /// CANCEL for a stream.
    pub fn cancel(stream_id: u32) -> Self {
        let mut dst = BytesMut::with_capacity(HEADER_SIZE);
        put_header(&mut dst, stream_id, FrameType::Cancel, 0);
        Self::from_parts(dst, FrameType::Cancel)
    }

    /// REQUEST_N for a stream; `n` is clamped into `1..=MAX_REQUEST_N`.
    pub fn request_n_frame(stream_id: u32, n: u64) -> Self {
        let mut dst = BytesMut::with_capacity(HEADER_SIZE + REQUEST_N_SIZE);
        put_header(&mut dst, stream_id, FrameType::RequestN, 0);
        dst.put_u32(n.clamp(1, MAX_REQUEST_N as u64) as u32);
        Self::from_parts(dst, FrameType::RequestN)
    }

    /// COMPLETE (PAYLOAD with only the COMPLETE flag) for a stream.
    pub fn complete(stream_id: u32) -> Self {
        let mut dst = BytesMut::with_capacity(HEADER_SIZE);
        put_header(&mut dst, stream_id, FrameType::Complete, 0);
        Self::from_parts(dst, FrameType::Complete)
    }

    /// ERROR with a code and a UTF-8 message.
    pub fn error(stream_id: u32, code: u32, message: &str) -> Self {
        let mut dst = BytesMut::with_capacity(HEADER_SIZE + 4 + message.len());
        put_header(&mut dst, stream_id, FrameType::Error, 0);
        dst.put_u32(code);
        dst.put_slice(message.as_bytes());
        Self::from_parts(dst, FrameType::Error)
    }

    /// LEASE on stream 0. The ttl is sent in milliseconds.
    pub fn lease(ttl: Duration, requests: u32, metadata: Option<&[u8]>) -> Self {
        let flags = if metadata.is_some() { FLAG_METADATA } else { 0 };
        let metadata = metadata.unwrap_or_default();
        let mut dst = BytesMut::with_capacity(HEADER_SIZE + 8 + metadata.len());
        put_header(&mut dst, 0, FrameType::Lease, flags);
        dst.put_u32(ttl.as_millis().min(i32::MAX as u128) as u32);
        dst.put_u32(requests.min(i32::MAX as u32));
        dst.put_slice(metadata);
        Self::from_parts(dst, FrameType::Lease)
    }

    /// KEEPALIVE on stream 0.
    pub fn keepalive(respond: bool, last_received_position: u64, data: &[u8]) -> Self {
        let flags = if respond { FLAG_RESPOND } else { 0 };
        let mut dst = BytesMut::with_capacity(HEADER_SIZE + 8 + data.len());
        put_header(&mut dst, 0, FrameType::KeepAlive, flags);
        dst.put_u64(last_received_position & (i64::MAX as u64));
        dst.put_slice(data);
        Self::from_parts(dst, FrameType::KeepAlive)
    }

    /// METADATA_PUSH on stream 0.
    pub fn metadata_push(metadata: &[u8]) -> Self {
        let mut dst = BytesMut::with_capacity(HEADER_SIZE + metadata.len());
        put_header(&mut dst, 0, FrameType::MetadataPush, FLAG_METADATA);
        dst.put_slice(metadata);
        Self::from_parts(dst, FrameType::MetadataPush)
    }

    fn from_parts(buf: BytesMut, frame_type: FrameType) -> Self {
        Self {
            buf: buf.freeze(),
            frame_type,
        }
    }

    /// Stream this frame belongs to; 0 for connection-level frames.
    pub fn stream_id(&self) -> u32 {
        u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) & MAX_STREAM_ID
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    /// The ten flag bits.
    pub fn flags(&self) -> u16 {
        u16::from_be_bytes([self.buf[4], self.buf[5]]) & FLAGS_MASK
    }

    pub fn has_metadata(&self) -> bool {
        self.flags() & FLAG_METADATA != 0
    }

    /// FOLLOWS is only meaningful on payload-bearing frames; on KEEPALIVE
    /// the same bit is RESPOND.
    pub fn has_follows(&self) -> bool {
        self.frame_type.carries_payload() && self.flags() & FLAG_FOLLOWS != 0
    }

    pub fn is_complete(&self) -> bool {
        self.frame_type.carries_payload() && self.flags() & FLAG_COMPLETE != 0
    }

    pub fn is_next(&self) -> bool {
        self.frame_type.is_payload() && self.flags() & FLAG_NEXT != 0
    }

    pub fn can_ignore(&self) -> bool {
        self.flags() & FLAG_IGNORE != 0
    }

    pub fn respond_requested(&self) -> bool {
        self.frame_type == FrameType::KeepAlive && self.flags() & FLAG_RESPOND != 0
    }

    /// Initial request-n (REQUEST_STREAM, REQUEST_CHANNEL) or the REQUEST_N
    /// value.
    pub fn request_n(&self) -> Option<u32> {
        match self.frame_type {
            FrameType::RequestStream | FrameType::RequestChannel | FrameType::RequestN => {
                Some(read_u32(&self.buf[HEADER_SIZE..]) & MAX_REQUEST_N)
            }
            _ => None,
        }
    }

    /// Metadata section, if present.
    pub fn metadata(&self) -> Option<Bytes> {
        match self.frame_type {
            ty if ty.carries_payload() && self.has_metadata() => {
                let offset = self.body_offset();
                let len = read_u24(&self.buf[offset..]);
                let start = offset + METADATA_LENGTH_SIZE;
                Some(self.buf.slice(start..start + len))
            }
            FrameType::Lease if self.has_metadata() => Some(self.buf.slice(HEADER_SIZE + 8..)),
            FrameType::MetadataPush => Some(self.buf.slice(HEADER_SIZE..)),
            _ => None,
        }
    }

    /// Data section (the message for ERROR frames).
    pub fn data(&self) -> Bytes {
        match self.frame_type {
            ty if ty.carries_payload() => {
                let mut start = self.body_offset();
                if self.has_metadata() {
                    start += METADATA_LENGTH_SIZE + read_u24(&self.buf[start..]);
                }
                self.buf.slice(start..)
            }
            FrameType::Lease | FrameType::MetadataPush | FrameType::RequestN | FrameType::Cancel => {
                Bytes::new()
            }
            _ => self.buf.slice(self.body_offset()..),
        }
    }

    /// Bytes of metadata plus data, i.e. what counts against payload limits.
    pub fn payload_len(&self) -> usize {
        self.metadata().map_or(0, |m| m.len()) + self.data().len()
    }

    /// ERROR code.
    pub fn error_code(&self) -> Option<u32> {
        (self.frame_type == FrameType::Error).then(|| read_u32(&self.buf[HEADER_SIZE..]))
    }

    /// ERROR message (lossy UTF-8).
    pub fn error_message(&self) -> String {
        String::from_utf8_lossy(&self.data()).into_owned()
    }

    /// LEASE time-to-live.
    pub fn lease_ttl(&self) -> Option<Duration> {
        (self.frame_type == FrameType::Lease)
            .then(|| Duration::from_millis(u64::from(read_u32(&self.buf[HEADER_SIZE..]))))
    }

    /// LEASE number of requests.
    pub fn lease_requests(&self) -> Option<u32> {
        (self.frame_type == FrameType::Lease).then(|| read_u32(&self.buf[HEADER_SIZE + 4..]))
    }

    /// KEEPALIVE last received position.
    pub fn keepalive_position(&self) -> Option<u64> {
        (self.frame_type == FrameType::KeepAlive).then(|| {
            let mut field = &self.buf[HEADER_SIZE..HEADER_SIZE + 8];
            field.get_u64()
        })
    }

    /// Encoded bytes without the length prefix.
    pub fn as_bytes(&self) -> &Bytes {
        &self.buf
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf
    }

    /// Encoded length without the length prefix.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The total wire size of this frame (length prefix + frame).
    pub fn wire_size(&self) -> usize {
        FRAME_LENGTH_SIZE + self.buf.len()
    }

    fn body_offset(&self) -> usize {
        HEADER_SIZE + fixed_body_len(self.frame_type)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("stream_id", &self.stream_id())
            .field("frame_type", &self.frame_type)
            .field("flags", &format_args!("{:#012b}", self.flags()))
            .field("len", &self.buf.len())
            .finish()
    }
}

/// Encoded size (without the length prefix) of a payload-bearing frame.
pub fn encoded_payload_len(
    frame_type: FrameType,
    metadata_len: Option<usize>,
    data_len: usize,
) -> usize {
    HEADER_SIZE
        + fixed_body_len(frame_type)
        + metadata_len.map_or(0, |len| METADATA_LENGTH_SIZE + len)
        + data_len
}

fn fixed_body_len(frame_type: FrameType) -> usize {
    match frame_type {
        FrameType::RequestStream | FrameType::RequestChannel | FrameType::RequestN => {
            REQUEST_N_SIZE
        }
        FrameType::Error | FrameType::Ext => 4,
        FrameType::Lease | FrameType::KeepAlive => 8,
        _ => 0,
    }
}

fn put_header(dst: &mut BytesMut, stream_id: u32, frame_type: FrameType, flags: u16) {
    dst.put_u32(stream_id & MAX_STREAM_ID);
    let flags = (flags | frame_type.implied_flags()) & FLAGS_MASK;
    dst.put_u16((u16::from(frame_type.encoded_type()) << TYPE_SHIFT) | flags);
}

fn put_u24(dst: &mut BytesMut, value: usize) {
    dst.put_uint(value as u64, 3);
}

fn read_u24(src: &[u8]) -> usize {
    (usize::from(src[0]) << 16) | (usize::from(src[1]) << 8) | usize::from(src[2])
}

fn read_u32(src: &[u8]) -> u32 {
    u32::from_be_bytes([src[0], src[1], src[2], src[3]])
}

/// Encode a frame with its length prefix.
///
/// Wire format:
/// ```text
/// ┌──────────────┬─────────────────┬────────────────┬──────────────┐
/// │ Length (3B)  │ Stream id (4B)  │ Type:6 Flags:10│ Body         │
/// │ big-endian   │ top bit = 0     │ (2B)           │              │
/// └──────────────┴─────────────────┴────────────────┴──────────────┘
/// ```
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    if frame.len() > MAX_FRAME_LENGTH {
        return Err(FrameError::FrameTooLarge {
            size: frame.len(),
            max: MAX_FRAME_LENGTH,
        });
    }
    dst.reserve(FRAME_LENGTH_SIZE + frame.len());
    put_u24(dst, frame.len());
    dst.put_slice(frame.as_bytes());
    Ok(())
}

/// Decode a length-prefixed frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_frame_length: usize) -> Result<Option<Frame>> {
    if src.len() < FRAME_LENGTH_SIZE {
        return Ok(None);
    }

    let frame_len = read_u24(&src[..FRAME_LENGTH_SIZE]);
    if frame_len > max_frame_length {
        return Err(FrameError::FrameTooLarge {
            size: frame_len,
            max: max_frame_length,
        });
    }

    if src.len() < FRAME_LENGTH_SIZE + frame_len {
        return Ok(None);
    }

    src.advance(FRAME_LENGTH_SIZE);
    let buf = src.split_to(frame_len).freeze();
    Frame::decode(buf).map(Some)
}

/// Configuration for the frame reader/writer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum frame length in bytes (without prefix). Default: 16 MiB - 1.
    pub max_frame_length: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_type::error_code;

    #[test]
    fn header_layout_is_big_endian() {
        let frame =
            Frame::payload_frame(1, FrameType::RequestResponse, 0, 0, None, b"hi").unwrap();
        assert_eq!(frame.as_bytes().as_ref(), &[0, 0, 0, 1, 0x10, 0x00, b'h', b'i']);

        let mut wire = BytesMut::new();
        encode_frame(&frame, &mut wire).unwrap();
        assert_eq!(&wire[..3], &[0, 0, 8]);
        assert_eq!(frame.wire_size(), wire.len());
    }

    #[test]
    fn request_stream_with_metadata() {
        let frame = Frame::payload_frame(
            5,
            FrameType::RequestStream,
            0,
            16,
            Some(b"route"),
            b"body",
        )
        .unwrap();
        let decoded = Frame::decode(frame.as_bytes().clone()).unwrap();

        assert_eq!(decoded.stream_id(), 5);
        assert_eq!(decoded.frame_type(), FrameType::RequestStream);
        assert_eq!(decoded.request_n(), Some(16));
        assert_eq!(decoded.metadata().unwrap().as_ref(), b"route");
        assert_eq!(decoded.data().as_ref(), b"body");
        assert_eq!(decoded.payload_len(), 9);
        assert!(!decoded.has_follows());
    }

    #[test]
    fn empty_metadata_is_distinct_from_absent() {
        let with_empty =
            Frame::payload_frame(3, FrameType::Next, 0, 0, Some(b""), b"d").unwrap();
        assert_eq!(with_empty.metadata().unwrap().len(), 0);

        let without = Frame::payload_frame(3, FrameType::Next, 0, 0, None, b"d").unwrap();
        assert!(without.metadata().is_none());
        assert!(without.is_next());
    }

    #[test]
    fn payload_flags_resolve_logical_types() {
        let frame = Frame::payload_frame(9, FrameType::NextComplete, 0, 0, None, b"x").unwrap();
        let decoded = Frame::decode(frame.into_bytes()).unwrap();
        assert_eq!(decoded.frame_type(), FrameType::NextComplete);
        assert!(decoded.is_complete());
        assert!(decoded.is_next());

        let complete = Frame::complete(9);
        assert_eq!(complete.frame_type(), FrameType::Complete);
        assert!(complete.data().is_empty());
    }

    #[test]
    fn follows_and_respond_share_a_bit() {
        let frame =
            Frame::payload_frame(1, FrameType::Next, FLAG_FOLLOWS, 0, None, b"x").unwrap();
        assert!(frame.has_follows());

        let keepalive = Frame::keepalive(true, 42, b"ka");
        assert!(keepalive.respond_requested());
        assert!(!keepalive.has_follows());
        assert_eq!(keepalive.keepalive_position(), Some(42));
        assert_eq!(keepalive.data().as_ref(), b"ka");
    }

    #[test]
    fn error_frame_fields() {
        let frame = Frame::error(7, error_code::APPLICATION_ERROR, "boom");
        let decoded = Frame::decode(frame.into_bytes()).unwrap();
        assert_eq!(decoded.error_code(), Some(error_code::APPLICATION_ERROR));
        assert_eq!(decoded.error_message(), "boom");
    }

    #[test]
    fn lease_frame_fields() {
        let frame = Frame::lease(Duration::from_secs(30), 10, Some(b"m"));
        let decoded = Frame::decode(frame.into_bytes()).unwrap();
        assert_eq!(decoded.stream_id(), 0);
        assert_eq!(decoded.lease_ttl(), Some(Duration::from_secs(30)));
        assert_eq!(decoded.lease_requests(), Some(10));
        assert_eq!(decoded.metadata().unwrap().as_ref(), b"m");
    }

    #[test]
    fn request_n_is_clamped() {
        assert_eq!(Frame::request_n_frame(3, u64::MAX).request_n(), Some(MAX_REQUEST_N));
        assert_eq!(Frame::request_n_frame(3, 0).request_n(), Some(1));
    }

    #[test]
    fn reserved_stream_bit_is_ignored() {
        let mut raw = BytesMut::new();
        raw.put_u32(0x8000_0003);
        raw.put_u16(u16::from(FrameType::Cancel.encoded_type()) << TYPE_SHIFT);
        let frame = Frame::decode(raw.freeze()).unwrap();
        assert_eq!(frame.stream_id(), 3);
    }

    #[test]
    fn truncated_metadata_is_rejected() {
        let mut raw = BytesMut::new();
        raw.put_u32(1);
        raw.put_u16(
            (u16::from(FrameType::RequestResponse.encoded_type()) << TYPE_SHIFT) | FLAG_METADATA,
        );
        raw.put_uint(100, 3);
        raw.put_slice(b"short");
        assert!(matches!(
            Frame::decode(raw.freeze()),
            Err(FrameError::MalformedBody {
                stream_id: 1,
                frame_type: FrameType::RequestResponse,
                ..
            })
        ));
    }

    #[test]
    fn truncated_request_n_is_rejected() {
        let mut raw = BytesMut::new();
        raw.put_u32(1);
        raw.put_u16(u16::from(FrameType::RequestN.encoded_type()) << TYPE_SHIFT);
        raw.put_u16(1);
        assert!(matches!(
            Frame::decode(raw.freeze()),
            Err(FrameError::MalformedBody { stream_id: 1, needed: 10, .. })
        ));
    }

    #[test]
    fn truncated_body_on_stream_zero_is_fatal() {
        let mut raw = BytesMut::new();
        raw.put_u32(0);
        raw.put_u16(u16::from(FrameType::RequestN.encoded_type()) << TYPE_SHIFT);
        raw.put_u16(1);
        assert!(matches!(
            Frame::decode(raw.freeze()),
            Err(FrameError::Truncated { needed: 10, .. })
        ));
    }

    #[test]
    fn malformed_body_leaves_following_frame_readable() {
        let mut buf = BytesMut::new();
        buf.put_uint(HEADER_SIZE as u64 + METADATA_LENGTH_SIZE as u64 + 2, 3);
        buf.put_u32(1);
        buf.put_u16(
            (u16::from(FrameType::RequestResponse.encoded_type()) << TYPE_SHIFT) | FLAG_METADATA,
        );
        buf.put_uint(0xFF, 3);
        buf.put_slice(b"ab");
        encode_frame(&Frame::cancel(3), &mut buf).unwrap();

        let err = decode_frame(&mut buf, DEFAULT_MAX_FRAME_LENGTH).unwrap_err();
        assert!(matches!(
            err,
            FrameError::MalformedBody { stream_id: 1, size: 11, needed: 0x108, .. }
        ));
        let next = decode_frame(&mut buf, DEFAULT_MAX_FRAME_LENGTH).unwrap().unwrap();
        assert_eq!(next, Frame::cancel(3));
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_incomplete_and_oversized() {
        let mut buf = BytesMut::from(&[0x00, 0x00][..]);
        assert!(decode_frame(&mut buf, DEFAULT_MAX_FRAME_LENGTH).unwrap().is_none());

        let mut buf = BytesMut::new();
        encode_frame(&Frame::cancel(1), &mut buf).unwrap();
        buf.truncate(5);
        assert!(decode_frame(&mut buf, DEFAULT_MAX_FRAME_LENGTH).unwrap().is_none());

        let mut buf = BytesMut::new();
        buf.put_uint(2000, 3);
        assert!(matches!(
            decode_frame(&mut buf, 1000),
            Err(FrameError::FrameTooLarge { size: 2000, max: 1000 })
        ));
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::request_n_frame(1, 5), &mut buf).unwrap();
        encode_frame(&Frame::cancel(3), &mut buf).unwrap();

        let first = decode_frame(&mut buf, DEFAULT_MAX_FRAME_LENGTH).unwrap().unwrap();
        let second = decode_frame(&mut buf, DEFAULT_MAX_FRAME_LENGTH).unwrap().unwrap();
        assert_eq!(first.frame_type(), FrameType::RequestN);
        assert_eq!(second.frame_type(), FrameType::Cancel);
        assert_eq!(second.stream_id(), 3);
        assert!(buf.is_empty());
    }

    #[test]
    fn non_payload_type_is_refused_by_payload_encoder() {
        assert!(matches!(
            Frame::payload_frame(1, FrameType::Cancel, 0, 0, None, b""),
            Err(FrameError::NotFragmentable("CANCEL"))
        ));
    }
}
