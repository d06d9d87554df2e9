// This file is part of Prahari and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted payload size for any single protocol message (1 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 1 << 20;

/// One-byte tags identifying protocol messages on the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum MessageType {
    AuthHello = 0,
    SessionKeyReqInPubEnc = 20,
    SessionKeyResp = 21,
    SessionKeyReq = 22,
    AuthAlert = 100,
}

impl MessageType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::AuthHello),
            20 => Some(Self::SessionKeyReqInPubEnc),
            21 => Some(Self::SessionKeyResp),
            22 => Some(Self::SessionKeyReq),
            100 => Some(Self::AuthAlert),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// Errors produced while encoding or decoding wire data.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("unexpected end of input (needed {needed} more bytes)")]
    UnexpectedEof { needed: usize },
    #[error("variable-length integer exceeds five bytes")]
    VarintOverflow,
    #[error("string field is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("unknown message type tag {0}")]
    UnknownMessageType(u8),
    #[error("payload length {0} exceeds the {MAX_PAYLOAD_SIZE}-byte limit")]
    PayloadTooLarge(usize),
    #[error("trailing bytes after the declared payload length")]
    TrailingBytes,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// A decoded message envelope: type tag plus raw payload bytes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Envelope {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

/// Appends a base-128 varint: 7 bits per byte, least-significant group
/// first, high bit set on every byte except the last.
pub fn put_varint(out: &mut Vec<u8>, mut value: usize) {
    while value > 0x7f {
        out.push(0x80 | (value & 0x7f) as u8);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Appends a length-prefixed UTF-8 string.
pub fn put_string(out: &mut Vec<u8>, value: &str) {
    put_varint(out, value.len());
    out.extend_from_slice(value.as_bytes());
}

/// Cursor over a byte slice used to parse message payloads.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Consumes and returns everything left in the buffer.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::UnexpectedEof {
                needed: n - self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        let bytes = self.read_bytes(8)?;
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn read_i64(&mut self) -> Result<i64, WireError> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_varint(&mut self) -> Result<usize, WireError> {
        let mut value: usize = 0;
        for group in 0..5 {
            let byte = self.read_u8()?;
            value |= ((byte & 0x7f) as usize) << (7 * group);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(WireError::VarintOverflow)
    }

    /// Reads a varint-length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, WireError> {
        let len = self.read_varint()?;
        let bytes = self.read_bytes(len)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }
}

/// Frames a payload into `tag | varint(len) | payload` bytes.
pub fn encode_envelope(msg_type: MessageType, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 5 + payload.len());
    out.push(msg_type.tag());
    put_varint(&mut out, payload.len());
    out.extend_from_slice(payload);
    out
}

/// Parses a complete envelope from a byte slice. Trailing bytes after the
/// declared payload length are rejected.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, WireError> {
    let mut reader = Reader::new(bytes);
    let tag = reader.read_u8()?;
    let msg_type = MessageType::from_tag(tag).ok_or(WireError::UnknownMessageType(tag))?;
    let len = reader.read_varint()?;
    if len > MAX_PAYLOAD_SIZE {
        return Err(WireError::PayloadTooLarge(len));
    }
    let payload = reader.read_bytes(len)?.to_vec();
    if reader.remaining() != 0 {
        return Err(WireError::TrailingBytes);
    }
    Ok(Envelope { msg_type, payload })
}

/// Reads one framed message from the stream.
pub async fn read_envelope<R>(io: &mut R) -> Result<Envelope, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut tag = [0_u8; 1];
    io.read_exact(&mut tag).await?;
    let msg_type = MessageType::from_tag(tag[0]).ok_or(WireError::UnknownMessageType(tag[0]))?;

    let mut len: usize = 0;
    let mut group = 0;
    loop {
        if group == 5 {
            return Err(WireError::VarintOverflow);
        }
        let mut byte = [0_u8; 1];
        io.read_exact(&mut byte).await?;
        len |= ((byte[0] & 0x7f) as usize) << (7 * group);
        if byte[0] & 0x80 == 0 {
            break;
        }
        group += 1;
    }
    if len > MAX_PAYLOAD_SIZE {
        return Err(WireError::PayloadTooLarge(len));
    }

    let mut payload = vec![0_u8; len];
    io.read_exact(&mut payload).await?;
    Ok(Envelope { msg_type, payload })
}

/// Writes one framed message to the stream and flushes it.
pub async fn write_envelope<W>(
    io: &mut W,
    msg_type: MessageType,
    payload: &[u8],
) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(WireError::PayloadTooLarge(payload.len()));
    }
    let framed = encode_envelope(msg_type, payload);
    io.write_all(&framed).await?;
    io.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint_roundtrip(value: usize) {
        let mut buf = Vec::new();
        put_varint(&mut buf, value);
        let mut reader = Reader::new(&buf);
        assert_eq!(reader.read_varint().expect("decode"), value);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn varint_roundtrips_at_group_boundaries() {
        for value in [0, 1, 127, 128, 129, 16_383, 16_384, 2_097_151, 2_097_152] {
            varint_roundtrip(value);
        }
    }

    #[test]
    fn varint_uses_continuation_bits() {
        let mut buf = Vec::new();
        put_varint(&mut buf, 300);
        assert_eq!(buf, vec![0xac, 0x02]);
    }

    #[test]
    fn varint_rejects_six_byte_encodings() {
        let buf = [0x80, 0x80, 0x80, 0x80, 0x80, 0x01];
        let mut reader = Reader::new(&buf);
        assert!(matches!(
            reader.read_varint(),
            Err(WireError::VarintOverflow)
        ));
    }

    #[test]
    fn string_roundtrips_and_advances_cursor() {
        let mut buf = Vec::new();
        put_string(&mut buf, "fileSystemManager");
        put_string(&mut buf, "केंद्र");
        let mut reader = Reader::new(&buf);
        assert_eq!(reader.read_string().expect("first"), "fileSystemManager");
        assert_eq!(reader.read_string().expect("second"), "केंद्र");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn string_rejects_truncated_input() {
        let mut buf = Vec::new();
        put_string(&mut buf, "sensor-17");
        buf.truncate(buf.len() - 3);
        let mut reader = Reader::new(&buf);
        assert!(matches!(
            reader.read_string(),
            Err(WireError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn fixed_width_integers_are_big_endian() {
        let buf = [0x00, 0x00, 0x00, 0x07, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe];
        let mut reader = Reader::new(&buf);
        assert_eq!(reader.read_u32().expect("u32"), 7);
        assert_eq!(reader.read_i64().expect("i64"), -2);
    }

    #[test]
    fn envelope_roundtrips() {
        let payload = vec![0xde, 0xad, 0xbe, 0xef];
        let framed = encode_envelope(MessageType::SessionKeyReq, &payload);
        let envelope = decode_envelope(&framed).expect("decode");
        assert_eq!(envelope.msg_type, MessageType::SessionKeyReq);
        assert_eq!(envelope.payload, payload);
    }

    #[test]
    fn envelope_rejects_unknown_tag() {
        let framed = encode_envelope(MessageType::AuthAlert, &[0]);
        let mut bytes = framed;
        bytes[0] = 99;
        assert!(matches!(
            decode_envelope(&bytes),
            Err(WireError::UnknownMessageType(99))
        ));
    }

    #[test]
    fn envelope_rejects_oversized_length_prefix() {
        let mut bytes = vec![MessageType::SessionKeyReq.tag()];
        put_varint(&mut bytes, MAX_PAYLOAD_SIZE + 1);
        assert!(matches!(
            decode_envelope(&bytes),
            Err(WireError::PayloadTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn async_framing_roundtrips() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let payload = b"auth hello payload".to_vec();
        write_envelope(&mut client, MessageType::AuthHello, &payload)
            .await
            .expect("write");
        let envelope = read_envelope(&mut server).await.expect("read");
        assert_eq!(envelope.msg_type, MessageType::AuthHello);
        assert_eq!(envelope.payload, payload);
    }

    #[tokio::test]
    async fn async_read_rejects_oversized_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let mut bytes = vec![MessageType::SessionKeyReq.tag()];
        put_varint(&mut bytes, MAX_PAYLOAD_SIZE + 1);
        tokio::io::AsyncWriteExt::write_all(&mut client, &bytes)
            .await
            .expect("write");
        let err = read_envelope(&mut server).await.expect_err("oversized");
        assert!(matches!(err, WireError::PayloadTooLarge(_)));
    }
}
