//! Frame model for the multiplex frame protocol.
//!
//! Five frame kinds share one byte-stream transport: service control frames,
//! fire-and-forget messages, request/response pairs, and binary continuation
//! frames that stream the payloads promised by an announcement.

use std::collections::{BTreeMap, BTreeSet};

/// Protocol type stored in bits 7..5 of the header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Service = 1,
    Message = 2,
    Request = 3,
    Binary = 4,
    Response = 5,
}

impl FrameKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Service),
            2 => Some(Self::Message),
            3 => Some(Self::Request),
            4 => Some(Self::Binary),
            5 => Some(Self::Response),
            _ => None,
        }
    }
}

/// Control code carried by a service frame (bits 2..0 of the flag nibble).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceCode {
    Ack = 1,
    Timeout = 2,
    Abort = 3,
    Unknown = 4,
    Ping = 7,
}

impl ServiceCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Ack),
            2 => Some(Self::Timeout),
            3 => Some(Self::Abort),
            4 => Some(Self::Unknown),
            7 => Some(Self::Ping),
            _ => None,
        }
    }
}

/// Body of a message, request or response frame.
///
/// At most one of `binaries`, `expected` and `streaming` may be present;
/// request and response frames additionally forbid `expected` and
/// `streaming`. The encoder enforces both rules.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PayloadBody {
    /// UTF-8 JSON payload. Empty buffers are normalized to `None`.
    pub data: Option<Vec<u8>>,
    /// Inline binary attachments, keyed by caller-chosen u32.
    pub binaries: Option<BTreeMap<u32, Vec<u8>>>,
    /// Keys of binary frames that will follow this announcement.
    pub expected: Option<BTreeSet<u32>>,
    /// Open-ended announcement: binary frames follow without a known key set.
    pub streaming: bool,
    /// Ask the peer for a service-ack on receipt.
    pub need_ack: bool,
}

impl PayloadBody {
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    /// Drop empty collections so the wire form and the model agree.
    pub(crate) fn normalized(mut self) -> Self {
        if self.data.as_ref().is_some_and(|d| d.is_empty()) {
            self.data = None;
        }
        if self.binaries.as_ref().is_some_and(|b| b.is_empty()) {
            self.binaries = None;
        }
        if self.expected.as_ref().is_some_and(|e| e.is_empty()) {
            self.expected = None;
        }
        self
    }
}

/// Which of the mutually exclusive disposition flags a binary frame carries,
/// with the follow-up key where the layout includes one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryScope {
    /// No disposition flag set.
    Plain,
    /// Chunk of the announced main data buffer.
    Data,
    /// Chunk of the binary promised under `key` by an expected-set announce.
    Expected(u32),
    /// Chunk of an open-ended stream under `key`.
    Streaming(u32),
}

impl BinaryScope {
    pub(crate) fn bits(self) -> u8 {
        match self {
            BinaryScope::Plain => 0b000,
            BinaryScope::Data => 0b110,
            BinaryScope::Expected(_) => 0b010,
            BinaryScope::Streaming(_) => 0b100,
        }
    }

    pub fn key(self) -> Option<u32> {
        match self {
            BinaryScope::Expected(key) | BinaryScope::Streaming(key) => Some(key),
            _ => None,
        }
    }
}

/// Body of a binary continuation frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryBody {
    /// Id of the announcement or payload frame this chunk belongs to.
    pub ref_id: u32,
    pub scope: BinaryScope,
    /// Chunk bytes; empty chunks are normalized to `None`.
    pub bin: Option<Vec<u8>>,
    /// Terminal chunk marker. On the wire bit 0 is set on every
    /// non-terminal frame and cleared on the last one.
    pub last: bool,
    pub need_ack: bool,
}

/// One decoded frame: shared header fields plus the kind-specific body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Non-zero frame id allocated by the sender.
    pub id: u32,
    /// Whether the encoded form carries a trailing checksum.
    pub checksum: bool,
    pub body: FrameBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    Service {
        /// Referenced frame id. See `own_ref_id` for whose id space it names.
        ref_id: u32,
        /// True when `ref_id` was allocated by this frame's sender.
        own_ref_id: bool,
        code: ServiceCode,
    },
    Message(PayloadBody),
    Request(PayloadBody),
    Response { ref_id: u32, body: PayloadBody },
    Binary(BinaryBody),
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self.body {
            FrameBody::Service { .. } => FrameKind::Service,
            FrameBody::Message(_) => FrameKind::Message,
            FrameBody::Request(_) => FrameKind::Request,
            FrameBody::Binary(_) => FrameKind::Binary,
            FrameBody::Response { .. } => FrameKind::Response,
        }
    }

    pub fn service(id: u32, ref_id: u32, own_ref_id: bool, code: ServiceCode) -> Self {
        Self {
            id,
            checksum: false,
            body: FrameBody::Service {
                ref_id,
                own_ref_id,
                code,
            },
        }
    }

    /// Ping is a service frame referencing itself.
    pub fn ping(id: u32) -> Self {
        Self::service(id, id, true, ServiceCode::Ping)
    }

    pub fn message(id: u32, body: PayloadBody) -> Self {
        Self {
            id,
            checksum: false,
            body: FrameBody::Message(body),
        }
    }

    pub fn request(id: u32, body: PayloadBody) -> Self {
        Self {
            id,
            checksum: false,
            body: FrameBody::Request(body),
        }
    }

    pub fn response(id: u32, ref_id: u32, body: PayloadBody) -> Self {
        Self {
            id,
            checksum: false,
            body: FrameBody::Response { ref_id, body },
        }
    }

    pub fn binary(id: u32, body: BinaryBody) -> Self {
        Self {
            id,
            checksum: false,
            body: FrameBody::Binary(body),
        }
    }

    pub fn with_checksum(mut self, checksum: bool) -> Self {
        self.checksum = checksum;
        self
    }

    /// Whether the sender asked for a service-ack.
    pub fn need_ack(&self) -> bool {
        match &self.body {
            FrameBody::Service { .. } => false,
            FrameBody::Message(body) | FrameBody::Request(body) => body.need_ack,
            FrameBody::Response { body, .. } => body.need_ack,
            FrameBody::Binary(body) => body.need_ack,
        }
    }

    /// The referenced id, for the kinds that carry one.
    pub fn ref_id(&self) -> Option<u32> {
        match &self.body {
            FrameBody::Service { ref_id, .. } => Some(*ref_id),
            FrameBody::Response { ref_id, .. } => Some(*ref_id),
            FrameBody::Binary(body) => Some(body.ref_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_kind_codes() {
        assert_eq!(FrameKind::from_u8(1), Some(FrameKind::Service));
        assert_eq!(FrameKind::from_u8(5), Some(FrameKind::Response));
        assert_eq!(FrameKind::from_u8(0), None);
        assert_eq!(FrameKind::from_u8(6), None);
    }

    #[test]
    fn test_service_code_set() {
        for code in [1u8, 2, 3, 4, 7] {
            assert!(ServiceCode::from_u8(code).is_some());
        }
        for code in [0u8, 5, 6, 8, 15] {
            assert!(ServiceCode::from_u8(code).is_none());
        }
    }

    #[test]
    fn test_ping_references_itself() {
        let frame = Frame::ping(42);
        match frame.body {
            FrameBody::Service {
                ref_id,
                own_ref_id,
                code,
            } => {
                assert_eq!(ref_id, 42);
                assert!(own_ref_id);
                assert_eq!(code, ServiceCode::Ping);
            }
            _ => panic!("ping must be a service frame"),
        }
    }

    #[test]
    fn test_body_normalization_drops_empty() {
        let body = PayloadBody {
            data: Some(vec![]),
            binaries: Some(BTreeMap::new()),
            expected: Some(BTreeSet::new()),
            ..Default::default()
        }
        .normalized();
        assert!(body.data.is_none());
        assert!(body.binaries.is_none());
        assert!(body.expected.is_none());
    }

    #[test]
    fn test_binary_scope_keys() {
        assert_eq!(BinaryScope::Plain.key(), None);
        assert_eq!(BinaryScope::Data.key(), None);
        assert_eq!(BinaryScope::Expected(7).key(), Some(7));
        assert_eq!(BinaryScope::Streaming(0).key(), Some(0));
    }
}
