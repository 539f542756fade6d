//! Multiplex frame protocol wire codec.
//!
//! Header byte: bits 7..5 protocol type (1..5), bit 4 has-checksum,
//! bits 3..0 type-specific flags. A big-endian u32 id follows, then the
//! type-specific sections, then an optional trailing checksum of
//! `checksum.length()` bytes computed over everything before it.

use crate::checksum::{ChecksumRef, NoopChecksum, VerifyMode};
use crate::error::{ProtoError, Result};
use crate::frame::{BinaryBody, BinaryScope, Frame, FrameBody, FrameKind, PayloadBody, ServiceCode};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Fixed prefix: one header byte plus the four id bytes.
pub const FRAME_PREFIX_LEN: usize = 5;

const NEED_ACK_BIT: u8 = 0b1000;
const OWN_REF_ID_BIT: u8 = 0b1000;
const CHECKSUM_BIT: u8 = 0b0001_0000;

/// Payload section dispositions (bits 2..0 of the flag nibble).
const DISP_DATA: u8 = 0b001;
const DISP_BINARIES: u8 = 0b110;
const DISP_EXPECTED: u8 = 0b010;
const DISP_STREAMING: u8 = 0b100;
const DISP_STREAMING_BARE: u8 = 0b000;

/// Stateless encoder/decoder for MFP frames.
///
/// The verifier and verification mode are fixed per codec instance; a
/// dispatcher builds one codec per connection.
pub struct MfpCodec {
    checksum: ChecksumRef,
    verify: VerifyMode,
    max_binaries: Option<usize>,
}

impl MfpCodec {
    pub fn new() -> Self {
        Self {
            checksum: Arc::new(NoopChecksum),
            verify: VerifyMode::IfFlagged,
            max_binaries: None,
        }
    }

    pub fn with_checksum(mut self, checksum: ChecksumRef) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn with_verify_mode(mut self, verify: VerifyMode) -> Self {
        self.verify = verify;
        self
    }

    /// Cap the number of binaries accepted in one incoming frame.
    pub fn with_max_binaries(mut self, max: Option<usize>) -> Self {
        self.max_binaries = max;
        self
    }

    pub fn checksum(&self) -> &ChecksumRef {
        &self.checksum
    }

    // --- encode ---

    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        if frame.id == 0 {
            return Err(ProtoError::FrameEncode("frame id must be non-zero".into()));
        }
        let mut out = Vec::with_capacity(FRAME_PREFIX_LEN + 16);
        let kind = frame.kind();
        // Header byte is patched in once the flag nibble is known.
        out.push(0);
        out.extend_from_slice(&frame.id.to_be_bytes());

        let nibble = match &frame.body {
            FrameBody::Service {
                ref_id,
                own_ref_id,
                code,
            } => {
                if *code == ServiceCode::Ping && (frame.id != *ref_id || !own_ref_id) {
                    return Err(ProtoError::FrameEncode(
                        "ping must reference its own id".into(),
                    ));
                }
                out.extend_from_slice(&ref_id.to_be_bytes());
                (u8::from(*own_ref_id) << 3) | *code as u8
            }
            FrameBody::Message(body) => self.encode_payload(&mut out, kind, None, body)?,
            FrameBody::Request(body) => self.encode_payload(&mut out, kind, None, body)?,
            FrameBody::Response { ref_id, body } => {
                self.encode_payload(&mut out, kind, Some(*ref_id), body)?
            }
            FrameBody::Binary(body) => {
                out.extend_from_slice(&body.ref_id.to_be_bytes());
                if let Some(key) = body.scope.key() {
                    out.extend_from_slice(&key.to_be_bytes());
                }
                if let Some(bin) = &body.bin {
                    out.extend_from_slice(bin);
                }
                (u8::from(body.need_ack) << 3) | body.scope.bits() | u8::from(!body.last)
            }
        };

        out[0] = ((kind as u8) << 5) | nibble;
        if frame.checksum {
            out[0] |= CHECKSUM_BIT;
            let tail = self.checksum.length();
            out.resize(out.len() + tail, 0);
            self.checksum.write(&mut out);
        }
        Ok(out)
    }

    fn encode_payload(
        &self,
        out: &mut Vec<u8>,
        kind: FrameKind,
        ref_id: Option<u32>,
        body: &PayloadBody,
    ) -> Result<u8> {
        let body = body.clone().normalized();
        let sections = usize::from(body.binaries.is_some())
            + usize::from(body.expected.is_some())
            + usize::from(body.streaming);
        if sections > 1 {
            return Err(ProtoError::FrameEncode(
                "binaries, expected and streaming are mutually exclusive".into(),
            ));
        }
        if matches!(kind, FrameKind::Request | FrameKind::Response)
            && (body.expected.is_some() || body.streaming)
        {
            return Err(ProtoError::FrameEncode(format!(
                "{:?} frames cannot carry expected or streaming sections",
                kind
            )));
        }
        if let Some(ref_id) = ref_id {
            out.extend_from_slice(&ref_id.to_be_bytes());
        }

        let data_len = body.data.as_ref().map_or(0, |d| d.len());
        check_u32(data_len, "data")?;

        let disposition = if let Some(binaries) = &body.binaries {
            let map_len = binaries
                .len()
                .checked_mul(8)
                .ok_or_else(|| ProtoError::FrameEncode("binaries map overflow".into()))?;
            check_u32(map_len, "binaries map")?;
            out.extend_from_slice(&(data_len as u32).to_be_bytes());
            out.extend_from_slice(&(map_len as u32).to_be_bytes());
            if let Some(data) = &body.data {
                out.extend_from_slice(data);
            }
            for (key, bin) in binaries {
                check_u32(bin.len(), "binary entry")?;
                out.extend_from_slice(&key.to_be_bytes());
                out.extend_from_slice(&(bin.len() as u32).to_be_bytes());
            }
            for bin in binaries.values() {
                out.extend_from_slice(bin);
            }
            DISP_BINARIES
        } else if let Some(expected) = &body.expected {
            let set_len = expected
                .len()
                .checked_mul(4)
                .ok_or_else(|| ProtoError::FrameEncode("expected set overflow".into()))?;
            check_u32(set_len, "expected set")?;
            out.extend_from_slice(&(data_len as u32).to_be_bytes());
            out.extend_from_slice(&(set_len as u32).to_be_bytes());
            if let Some(data) = &body.data {
                out.extend_from_slice(data);
            }
            for key in expected {
                out.extend_from_slice(&key.to_be_bytes());
            }
            DISP_EXPECTED
        } else if body.streaming {
            if let Some(data) = &body.data {
                out.extend_from_slice(&(data_len as u32).to_be_bytes());
                out.extend_from_slice(data);
                DISP_STREAMING
            } else {
                DISP_STREAMING_BARE
            }
        } else {
            out.extend_from_slice(&(data_len as u32).to_be_bytes());
            if let Some(data) = &body.data {
                out.extend_from_slice(data);
            }
            DISP_DATA
        };

        Ok((u8::from(body.need_ack) << 3) | disposition)
    }

    // --- decode ---

    pub fn decode(&self, buf: &[u8]) -> Result<Frame> {
        if buf.len() < FRAME_PREFIX_LEN {
            return Err(ProtoError::FrameDecode("frame shorter than prefix".into()));
        }
        let header = buf[0];
        let kind = FrameKind::from_u8(header >> 5)
            .ok_or_else(|| ProtoError::FrameDecode(format!("invalid protocol type {}", header >> 5)))?;
        let has_checksum = header & CHECKSUM_BIT != 0;
        let nibble = header & 0b1111;

        let tail = if has_checksum { self.checksum.length() } else { 0 };
        match self.verify {
            VerifyMode::Ignore => {}
            VerifyMode::IfFlagged => {
                if has_checksum && !self.checksum.verify(buf) {
                    return Err(ProtoError::FrameDecode("checksum mismatch".into()));
                }
            }
            VerifyMode::Require => {
                if !has_checksum {
                    return Err(ProtoError::FrameDecode(
                        "checksum required but frame carries none".into(),
                    ));
                }
                if !self.checksum.verify(buf) {
                    return Err(ProtoError::FrameDecode("checksum mismatch".into()));
                }
            }
        }
        if buf.len() < FRAME_PREFIX_LEN + tail {
            return Err(ProtoError::FrameDecode("frame shorter than checksum".into()));
        }
        let body = &buf[..buf.len() - tail];

        let id = read_u32(body, 1);
        if id == 0 {
            return Err(ProtoError::FrameDecode("frame id must be non-zero".into()));
        }

        let frame_body = match kind {
            FrameKind::Service => self.decode_service(id, nibble, &body[FRAME_PREFIX_LEN..])?,
            FrameKind::Message => {
                FrameBody::Message(self.decode_payload(kind, nibble, &body[FRAME_PREFIX_LEN..])?)
            }
            FrameKind::Request => {
                FrameBody::Request(self.decode_payload(kind, nibble, &body[FRAME_PREFIX_LEN..])?)
            }
            FrameKind::Response => {
                let rest = &body[FRAME_PREFIX_LEN..];
                if rest.len() < 4 {
                    return Err(ProtoError::FrameDecode("response frame missing ref id".into()));
                }
                let ref_id = read_u32(rest, 0);
                FrameBody::Response {
                    ref_id,
                    body: self.decode_payload(kind, nibble, &rest[4..])?,
                }
            }
            FrameKind::Binary => self.decode_binary(nibble, &body[FRAME_PREFIX_LEN..])?,
        };

        Ok(Frame {
            id,
            checksum: has_checksum,
            body: frame_body,
        })
    }

    fn decode_service(&self, id: u32, nibble: u8, rest: &[u8]) -> Result<FrameBody> {
        if rest.len() != 4 {
            return Err(ProtoError::FrameDecode(format!(
                "service frame body must be 4 bytes, got {}",
                rest.len()
            )));
        }
        let own_ref_id = nibble & OWN_REF_ID_BIT != 0;
        let code = ServiceCode::from_u8(nibble & 0b111)
            .ok_or_else(|| ProtoError::FrameDecode(format!("invalid service code {}", nibble & 0b111)))?;
        let ref_id = read_u32(rest, 0);
        if code == ServiceCode::Ping && (id != ref_id || !own_ref_id) {
            return Err(ProtoError::FrameDecode(
                "ping must reference its own id".into(),
            ));
        }
        Ok(FrameBody::Service {
            ref_id,
            own_ref_id,
            code,
        })
    }

    fn decode_payload(&self, kind: FrameKind, nibble: u8, rest: &[u8]) -> Result<PayloadBody> {
        let need_ack = nibble & NEED_ACK_BIT != 0;
        let disposition = nibble & 0b111;
        if matches!(kind, FrameKind::Request | FrameKind::Response)
            && !matches!(disposition, DISP_DATA | DISP_BINARIES)
        {
            return Err(ProtoError::FrameDecode(format!(
                "{:?} frames cannot carry disposition {:#05b}",
                kind, disposition
            )));
        }

        let mut cursor = Cursor::new(rest);
        let body = match disposition {
            DISP_DATA => {
                let data_len = cursor.read_u32()? as usize;
                let data = cursor.read_bytes(data_len, "data")?;
                PayloadBody {
                    data: non_empty(data),
                    need_ack,
                    ..Default::default()
                }
            }
            DISP_BINARIES => {
                let data_len = cursor.read_u32()? as usize;
                let map_len = cursor.read_u32()? as usize;
                if map_len % 8 != 0 {
                    return Err(ProtoError::FrameDecode(format!(
                        "binaries map size {} is not a multiple of 8",
                        map_len
                    )));
                }
                let count = map_len / 8;
                if self.max_binaries.is_some_and(|max| count > max) {
                    return Err(ProtoError::FrameDecode(format!(
                        "frame carries {} binaries, limit is {}",
                        count,
                        self.max_binaries.unwrap_or(0)
                    )));
                }
                let data = cursor.read_bytes(data_len, "data")?;
                let mut sizes = Vec::with_capacity(count);
                let mut keys = BTreeSet::new();
                for _ in 0..count {
                    let key = cursor.read_u32()?;
                    let size = cursor.read_u32()? as usize;
                    if !keys.insert(key) {
                        return Err(ProtoError::FrameDecode(format!(
                            "duplicate binary key {}",
                            key
                        )));
                    }
                    sizes.push((key, size));
                }
                let mut binaries = BTreeMap::new();
                for (key, size) in sizes {
                    binaries.insert(key, cursor.read_bytes(size, "binary entry")?);
                }
                PayloadBody {
                    data: non_empty(data),
                    binaries: Some(binaries),
                    need_ack,
                    ..Default::default()
                }
            }
            DISP_EXPECTED => {
                let data_len = cursor.read_u32()? as usize;
                let set_len = cursor.read_u32()? as usize;
                if set_len == 0 || set_len % 4 != 0 {
                    return Err(ProtoError::FrameDecode(format!(
                        "expected set size {} is not a positive multiple of 4",
                        set_len
                    )));
                }
                let data = cursor.read_bytes(data_len, "data")?;
                let mut expected = BTreeSet::new();
                for _ in 0..set_len / 4 {
                    let key = cursor.read_u32()?;
                    if !expected.insert(key) {
                        return Err(ProtoError::FrameDecode(format!(
                            "duplicate expected key {}",
                            key
                        )));
                    }
                }
                PayloadBody {
                    data: non_empty(data),
                    expected: Some(expected),
                    need_ack,
                    ..Default::default()
                }
            }
            DISP_STREAMING => {
                let data_len = cursor.read_u32()? as usize;
                let data = cursor.read_bytes(data_len, "data")?;
                PayloadBody {
                    data: non_empty(data),
                    streaming: true,
                    need_ack,
                    ..Default::default()
                }
            }
            DISP_STREAMING_BARE => PayloadBody {
                streaming: true,
                need_ack,
                ..Default::default()
            },
            _ => {
                return Err(ProtoError::FrameDecode(format!(
                    "invalid payload disposition {:#05b}",
                    disposition
                )))
            }
        };
        cursor.finish()?;
        Ok(body)
    }

    fn decode_binary(&self, nibble: u8, rest: &[u8]) -> Result<FrameBody> {
        let need_ack = nibble & NEED_ACK_BIT != 0;
        let last = nibble & 0b001 == 0;
        let mut cursor = Cursor::new(rest);
        let ref_id = cursor.read_u32()?;
        let scope = match nibble & 0b110 {
            0b110 => BinaryScope::Data,
            0b010 => BinaryScope::Expected(cursor.read_u32()?),
            0b100 => BinaryScope::Streaming(cursor.read_u32()?),
            _ => BinaryScope::Plain,
        };
        let bin = cursor.take_rest();
        Ok(FrameBody::Binary(BinaryBody {
            ref_id,
            scope,
            bin: non_empty(bin),
            last,
            need_ack,
        }))
    }
}

impl Default for MfpCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn check_u32(len: usize, what: &str) -> Result<()> {
    if len > u32::MAX as usize {
        return Err(ProtoError::FrameEncode(format!("{} exceeds u32 size", what)));
    }
    Ok(())
}

fn non_empty(bytes: Vec<u8>) -> Option<Vec<u8>> {
    if bytes.is_empty() {
        None
    } else {
        Some(bytes)
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Bounds-checked reader that enforces the aggregate-size invariant: every
/// declared section must be consumed and nothing may remain.
struct Cursor<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, at: 0 }
    }

    fn read_u32(&mut self) -> Result<u32> {
        if self.at + 4 > self.buf.len() {
            return Err(ProtoError::FrameDecode("unexpected end of frame".into()));
        }
        let value = read_u32(self.buf, self.at);
        self.at += 4;
        Ok(value)
    }

    fn read_bytes(&mut self, len: usize, what: &str) -> Result<Vec<u8>> {
        if self.at + len > self.buf.len() {
            return Err(ProtoError::FrameDecode(format!(
                "{} section of {} bytes exceeds frame",
                what, len
            )));
        }
        let bytes = self.buf[self.at..self.at + len].to_vec();
        self.at += len;
        Ok(bytes)
    }

    fn take_rest(&mut self) -> Vec<u8> {
        let bytes = self.buf[self.at..].to_vec();
        self.at = self.buf.len();
        bytes
    }

    fn finish(self) -> Result<()> {
        if self.at != self.buf.len() {
            return Err(ProtoError::FrameDecode(format!(
                "declared sizes cover {} bytes, frame has {}",
                self.at,
                self.buf.len()
            )));
        }
        Ok(())
    }
}
