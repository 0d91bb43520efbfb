//! Binary framed protocol shared by clients and the server.
//!
//! Every frame starts with two bytes: the message type and a `more` flag.
//! When `more` is set, the logical message continues in the next frame,
//! which carries the continuation type (`0xFF`) and its own `more` flag.
//! Integers are big-endian; strings are preceded by a length field at the
//! position the message layout dictates; a trailing `data` field consumes
//! the remainder of the logical message.

use crate::error::WireError;
use crate::store::Key;

pub const INIT: u8 = 0x01;
pub const APPEND_V2: u8 = 0x02;
pub const SET_KEY: u8 = 0x03;
pub const BROADCAST: u8 = 0x04;
pub const APPEND: u8 = 0x05;
pub const ERROR: u8 = 0x80;
pub const APPEND_ACK: u8 = 0x81;
pub const KEY_INFORMATION: u8 = 0x82;
pub const SET_KEY_ACK: u8 = 0x83;
pub const SERVER_IDENTIFICATION: u8 = 0x84;
pub const CONTINUATION: u8 = 0xff;

/// Default cap on a single outgoing frame, overridable per connection
/// during the handshake.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 100 * 1024;

/// Append acknowledgment statuses carried by [`Message::AppendAck`].
pub mod ack {
    /// Rejected; the offset field carries the authoritative length.
    pub const NACK: u16 = 0;
    /// Accepted and applied.
    pub const APPLIED: u16 = 1;
    /// Acknowledged but discarded (no write permission).
    pub const DISCARDED: u16 = 2;
}

/// Protocol-visible error codes for the `ERROR` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unspecified,
    DoesNotExist,
    AlreadyExists,
    InvalidOffset,
    AccessDenied,
}

impl ErrorCode {
    pub fn code(self) -> u16 {
        match self {
            ErrorCode::Unspecified => 0,
            ErrorCode::DoesNotExist => 1,
            ErrorCode::AlreadyExists => 2,
            ErrorCode::InvalidOffset => 3,
            ErrorCode::AccessDenied => 4,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            1 => ErrorCode::DoesNotExist,
            2 => ErrorCode::AlreadyExists,
            3 => ErrorCode::InvalidOffset,
            4 => ErrorCode::AccessDenied,
            _ => ErrorCode::Unspecified,
        }
    }

    pub fn default_text(self) -> &'static str {
        match self {
            ErrorCode::Unspecified => "unspecified",
            ErrorCode::DoesNotExist => "does not exist",
            ErrorCode::AlreadyExists => "already exists",
            ErrorCode::InvalidOffset => "invalid offset",
            ErrorCode::AccessDenied => "access denied",
        }
    }
}

/// A complete logical message, after continuation reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Init {
        protocol_version: u16,
        max_message_size: u32,
        creation_mode: u8,
        offset: u64,
        doc_id: String,
        data: Vec<u8>,
    },
    /// Both wire layouts (0x02 and 0x05) decode into this variant; encoding
    /// picks the layout from the negotiated protocol version and always
    /// writes generation 0.
    Append {
        generation: u32,
        offset: u64,
        data: Vec<u8>,
    },
    SetKey {
        request_id: u16,
        lifetime: u8,
        old_version: u32,
        new_version: u32,
        name: String,
        value: String,
    },
    Broadcast {
        data: Vec<u8>,
    },
    Error {
        code: ErrorCode,
        description: String,
    },
    AppendAck {
        status: u16,
        offset: u64,
    },
    SetKeyAck {
        status: u16,
        request_id: u16,
    },
    KeyInformation {
        keys: Vec<Key>,
    },
}

impl Message {
    /// Decode a reassembled logical message, dispatching on the type byte.
    pub fn decode(buf: &[u8]) -> Result<Message, WireError> {
        if buf.len() < 2 {
            return Err(WireError::MessageTooShort);
        }
        let mut r = WireReader::new(&buf[2..]);
        match buf[0] {
            INIT => {
                let protocol_version = r.u16()?;
                let max_message_size = r.u32()?;
                let creation_mode = r.u8()?;
                let offset = r.u64()?;
                let id_len = if protocol_version == 2 {
                    r.u8()? as usize
                } else {
                    r.u32()? as usize
                };
                let doc_id = r.string(id_len)?;
                let data = r.rest().to_vec();
                Ok(Message::Init {
                    protocol_version,
                    max_message_size,
                    creation_mode,
                    offset,
                    doc_id,
                    data,
                })
            }
            APPEND_V2 => {
                let offset = r.u64()?;
                Ok(Message::Append {
                    generation: 0,
                    offset,
                    data: r.rest().to_vec(),
                })
            }
            APPEND => {
                let generation = r.u32()?;
                let offset = r.u64()?;
                Ok(Message::Append {
                    generation,
                    offset,
                    data: r.rest().to_vec(),
                })
            }
            SET_KEY => {
                let request_id = r.u16()?;
                let lifetime = r.u8()?;
                let old_version = r.u32()?;
                let new_version = r.u32()?;
                let name_len = r.u32()? as usize;
                let name = r.string(name_len)?;
                let value_len = r.u32()? as usize;
                let value = r.string(value_len)?;
                Ok(Message::SetKey {
                    request_id,
                    lifetime,
                    old_version,
                    new_version,
                    name,
                    value,
                })
            }
            BROADCAST => {
                let len = r.u32()? as usize;
                let data = r.bytes(len)?.to_vec();
                Ok(Message::Broadcast { data })
            }
            ERROR => {
                let code = ErrorCode::from_code(r.u16()?);
                let description = String::from_utf8_lossy(r.rest()).into_owned();
                Ok(Message::Error { code, description })
            }
            APPEND_ACK => {
                let status = r.u16()?;
                let offset = r.u64()?;
                Ok(Message::AppendAck { status, offset })
            }
            SET_KEY_ACK => {
                let status = r.u16()?;
                let request_id = r.u16()?;
                Ok(Message::SetKeyAck { status, request_id })
            }
            KEY_INFORMATION => {
                let mut keys = Vec::new();
                while !r.is_empty() {
                    let version = r.u32()?;
                    let name_len = r.u32()? as usize;
                    let name = r.string(name_len)?;
                    let value_len = r.u32()? as usize;
                    let value = r.string(value_len)?;
                    keys.push(Key {
                        version,
                        name,
                        value,
                    });
                }
                Ok(Message::KeyInformation { keys })
            }
            other => Err(WireError::UnexpectedMessageType(other)),
        }
    }

    /// Encode into a logical message with the `more` flag cleared; the
    /// writer overwrites that flag while fragmenting.
    pub fn encode(&self, protocol_version: u16) -> Vec<u8> {
        let mut w = WireWriter::new();
        match self {
            Message::Init {
                protocol_version: proto,
                max_message_size,
                creation_mode,
                offset,
                doc_id,
                data,
            } => {
                w.header(INIT);
                w.u16(*proto);
                w.u32(*max_message_size);
                w.u8(*creation_mode);
                w.u64(*offset);
                if *proto == 2 {
                    w.u8(doc_id.len() as u8);
                } else {
                    w.u32(doc_id.len() as u32);
                }
                w.bytes(doc_id.as_bytes());
                w.bytes(data);
            }
            Message::Append {
                generation,
                offset,
                data,
            } => {
                if protocol_version < 3 {
                    w.header(APPEND_V2);
                } else {
                    w.header(APPEND);
                    w.u32(*generation);
                }
                w.u64(*offset);
                w.bytes(data);
            }
            Message::SetKey {
                request_id,
                lifetime,
                old_version,
                new_version,
                name,
                value,
            } => {
                w.header(SET_KEY);
                w.u16(*request_id);
                w.u8(*lifetime);
                w.u32(*old_version);
                w.u32(*new_version);
                w.u32(name.len() as u32);
                w.bytes(name.as_bytes());
                w.u32(value.len() as u32);
                w.bytes(value.as_bytes());
            }
            Message::Broadcast { data } => {
                w.header(BROADCAST);
                w.u32(data.len() as u32);
                w.bytes(data);
            }
            Message::Error { code, description } => {
                w.header(ERROR);
                w.u16(code.code());
                w.bytes(description.as_bytes());
            }
            Message::AppendAck { status, offset } => {
                w.header(APPEND_ACK);
                w.u16(*status);
                w.u64(*offset);
            }
            Message::SetKeyAck { status, request_id } => {
                w.header(SET_KEY_ACK);
                w.u16(*status);
                w.u16(*request_id);
            }
            Message::KeyInformation { keys } => {
                w.header(KEY_INFORMATION);
                for key in keys {
                    w.u32(key.version);
                    w.u32(key.name.len() as u32);
                    w.bytes(key.name.as_bytes());
                    w.u32(key.value.len() as u32);
                    w.bytes(key.value.as_bytes());
                }
            }
        }
        w.finish()
    }
}

/// Accumulates frames until a logical message is complete.
///
/// A message is open from the first frame with `more == 1` until a frame
/// arrives with `more == 0`. Malformed sequences are reported as errors so
/// the connection can be closed instead of panicking.
#[derive(Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
    open: bool,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame; returns the complete logical message once the final
    /// frame of the sequence has arrived.
    pub fn push(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, WireError> {
        if frame.len() < 2 {
            return Err(WireError::MessageTooShort);
        }

        if self.open {
            if frame[0] != CONTINUATION {
                return Err(WireError::UnexpectedMessageType(frame[0]));
            }
            self.buf.extend_from_slice(&frame[2..]);
        } else {
            if frame[0] == CONTINUATION {
                return Err(WireError::UnexpectedContinuation);
            }
            self.buf = frame.to_vec();
            self.open = true;
        }

        if frame[1] == 0 {
            self.open = false;
            // Reassembly undoes fragmentation exactly: the first frame's
            // more flag was set while chunking, clear it again.
            self.buf[1] = 0;
            Ok(Some(std::mem::take(&mut self.buf)))
        } else {
            Ok(None)
        }
    }
}

/// Split an encoded logical message into frames of at most `max_size`
/// bytes. The first frame keeps the real type byte; every following frame
/// is a continuation. The `more` flag is set on every frame but the last.
pub fn fragment(mut message: Vec<u8>, max_size: usize) -> Vec<Vec<u8>> {
    let max_size = max_size.max(3);
    if message.len() <= max_size {
        message[1] = 0;
        return vec![message];
    }

    message[1] = 1;
    let rest = message.split_off(max_size);
    let mut frames = vec![message];

    let mut at = 0;
    while at < rest.len() {
        let take = (rest.len() - at).min(max_size - 2);
        let more = u8::from(at + take < rest.len());
        let mut frame = Vec::with_capacity(take + 2);
        frame.push(CONTINUATION);
        frame.push(more);
        frame.extend_from_slice(&rest[at..at + take]);
        frames.push(frame);
        at += take;
    }

    frames
}

struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.pos + len > self.buf.len() {
            return Err(WireError::MessageTooShort);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(b);
        Ok(u64::from_be_bytes(out))
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        self.take(len)
    }

    fn string(&mut self, len: usize) -> Result<String, WireError> {
        Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn header(&mut self, message_type: u8) {
        self.buf.push(message_type);
        self.buf.push(0);
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: Message, protocol_version: u16) {
        let encoded = message.encode(protocol_version);
        let decoded = Message::decode(&encoded).expect("decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn init_roundtrip_both_versions() {
        for proto in [2u16, 3] {
            roundtrip(
                Message::Init {
                    protocol_version: proto,
                    max_message_size: 65536,
                    creation_mode: 0,
                    offset: 12,
                    doc_id: "doc-1".to_string(),
                    data: b"HELLO".to_vec(),
                },
                proto,
            );
        }
    }

    #[test]
    fn append_layout_tracks_protocol_version() {
        let message = Message::Append {
            generation: 0,
            offset: 7,
            data: b"xyz".to_vec(),
        };
        assert_eq!(message.encode(2)[0], APPEND_V2);
        assert_eq!(message.encode(3)[0], APPEND);
        roundtrip(message.clone(), 2);
        roundtrip(message, 3);
    }

    #[test]
    fn set_key_roundtrip() {
        roundtrip(
            Message::SetKey {
                request_id: 9,
                lifetime: 1,
                old_version: 0,
                new_version: 1,
                name: "title".to_string(),
                value: "A".to_string(),
            },
            3,
        );
    }

    #[test]
    fn broadcast_roundtrip() {
        roundtrip(
            Message::Broadcast {
                data: vec![1, 2, 3, 4],
            },
            3,
        );
    }

    #[test]
    fn error_roundtrip() {
        roundtrip(
            Message::Error {
                code: ErrorCode::AccessDenied,
                description: "access denied".to_string(),
            },
            2,
        );
    }

    #[test]
    fn acks_roundtrip() {
        roundtrip(
            Message::AppendAck {
                status: ack::APPLIED,
                offset: 42,
            },
            3,
        );
        roundtrip(
            Message::SetKeyAck {
                status: 1,
                request_id: 17,
            },
            3,
        );
    }

    #[test]
    fn key_information_roundtrip_repeats_to_end() {
        roundtrip(
            Message::KeyInformation {
                keys: vec![
                    Key {
                        version: 1,
                        name: "cursor".to_string(),
                        value: "12".to_string(),
                    },
                    Key {
                        version: 2,
                        name: "cursor".to_string(),
                        value: String::new(),
                    },
                ],
            },
            3,
        );
    }

    #[test]
    fn truncated_fixed_field_is_too_short() {
        // APPEND_ACK with only one of two status bytes.
        let err = Message::decode(&[APPEND_ACK, 0, 0]).unwrap_err();
        assert_eq!(err, WireError::MessageTooShort);
    }

    #[test]
    fn truncated_string_is_too_short() {
        // SET_KEY announcing a 10-byte name with none present.
        let mut buf = vec![SET_KEY, 0];
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.push(0);
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&10u32.to_be_bytes());
        let err = Message::decode(&buf).unwrap_err();
        assert_eq!(err, WireError::MessageTooShort);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = Message::decode(&[0x42, 0, 0, 0]).unwrap_err();
        assert_eq!(err, WireError::UnexpectedMessageType(0x42));
    }

    #[test]
    fn empty_append_still_decodes() {
        let message = Message::Append {
            generation: 0,
            offset: 0,
            data: Vec::new(),
        };
        roundtrip(message, 3);
    }

    #[test]
    fn assembler_passes_single_frame_through() {
        let mut assembler = FrameAssembler::new();
        let frame = vec![BROADCAST, 0, 0, 0, 0, 1, 9];
        let out = assembler.push(&frame).unwrap();
        assert_eq!(out, Some(frame));
    }

    #[test]
    fn assembler_joins_continuations() {
        let mut assembler = FrameAssembler::new();
        assert_eq!(assembler.push(&[APPEND_V2, 1, 1, 2]).unwrap(), None);
        assert_eq!(assembler.push(&[CONTINUATION, 1, 3, 4]).unwrap(), None);
        let out = assembler.push(&[CONTINUATION, 0, 5]).unwrap();
        assert_eq!(out, Some(vec![APPEND_V2, 0, 1, 2, 3, 4, 5]));
    }

    #[test]
    fn assembler_rejects_orphan_continuation() {
        let mut assembler = FrameAssembler::new();
        let err = assembler.push(&[CONTINUATION, 0, 1]).unwrap_err();
        assert_eq!(err, WireError::UnexpectedContinuation);
    }

    #[test]
    fn assembler_rejects_non_continuation_mid_message() {
        let mut assembler = FrameAssembler::new();
        assert_eq!(assembler.push(&[APPEND_V2, 1, 1]).unwrap(), None);
        let err = assembler.push(&[BROADCAST, 0, 2]).unwrap_err();
        assert_eq!(err, WireError::UnexpectedMessageType(BROADCAST));
    }

    #[test]
    fn assembler_rejects_short_frame() {
        let mut assembler = FrameAssembler::new();
        let err = assembler.push(&[APPEND_V2]).unwrap_err();
        assert_eq!(err, WireError::MessageTooShort);
    }

    #[test]
    fn fragmentation_is_transparent() {
        let message = Message::Append {
            generation: 0,
            offset: 3,
            data: (0..=255u8).cycle().take(1000).collect(),
        };
        let encoded = message.encode(3);

        for max_size in [3usize, 5, 64, 999, 1013, 4096] {
            let frames = fragment(encoded.clone(), max_size);
            assert!(frames.iter().all(|f| f.len() <= max_size.max(3)));

            let mut assembler = FrameAssembler::new();
            let mut result = None;
            for (i, frame) in frames.iter().enumerate() {
                let out = assembler.push(frame).unwrap();
                if i + 1 < frames.len() {
                    assert_eq!(out, None);
                } else {
                    result = out;
                }
            }
            assert_eq!(result, Some(encoded.clone()), "max_size={max_size}");
        }
    }

    #[test]
    fn small_message_is_single_frame_with_more_cleared() {
        let mut encoded = Message::Broadcast { data: vec![7] }.encode(3);
        encoded[1] = 1;
        let frames = fragment(encoded, 1024);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][1], 0);
    }
}
