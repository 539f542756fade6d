use muxlink_config::ConfigError;
use muxlink_proto::ProtoError;
use thiserror::Error;

/// Runtime error taxonomy. Every kind carries a stable code; the umbrella
/// kinds subsume their specific forms (pack/unpack over the frame kinds,
/// connection over send/receive, interrupt over abort/timeout).
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Logic error: {0}")]
    Logic(String),

    #[error("Configure error: {0}")]
    Configure(String),

    #[error("Method access error: {0}")]
    MethodAccess(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Status error: {status}")]
    Status { status: u16, body: Option<String> },

    #[error("Missing recipient: {0}")]
    MissingRecipient(String),

    #[error("Data type error: {0}")]
    DataType(String),

    #[error("Pack error: {0}")]
    Pack(String),

    #[error("Unpack error: {0}")]
    Unpack(String),

    #[error("Frame encode error: {0}")]
    FrameEncode(String),

    #[error("Frame decode error: {0}")]
    FrameDecode(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Send error: {0}")]
    Send(String),

    #[error("Receive error: {0}")]
    Receive(String),

    #[error("Interrupt error: {0}")]
    Interrupt(String),

    #[error("Abort error: {0}")]
    Abort(String),

    #[error("Timeout error: {0}")]
    Timeout(String),
}

impl Error {
    /// Stable code of this kind.
    pub fn code(&self) -> u8 {
        match self {
            Error::Unknown(_) => 0,
            Error::Logic(_) => 1,
            Error::Configure(_) => 2,
            Error::MethodAccess(_) => 3,
            Error::Protocol(_) => 4,
            Error::Status { .. } => 5,
            Error::MissingRecipient(_) => 6,
            Error::DataType(_) => 7,
            Error::Pack(_) => 8,
            Error::Unpack(_) => 9,
            Error::FrameEncode(_) => 10,
            Error::FrameDecode(_) => 11,
            Error::Connection(_) => 12,
            Error::Send(_) => 13,
            Error::Receive(_) => 14,
            Error::Interrupt(_) => 15,
            Error::Abort(_) => 16,
            Error::Timeout(_) => 17,
        }
    }

    /// Interrupt family: interrupt, abort, timeout. These never retry.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Error::Interrupt(_) | Error::Abort(_) | Error::Timeout(_))
    }

    /// Connection family: connection, send, receive.
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Send(_) | Error::Receive(_))
    }

    /// Encode family: pack, frame-encode.
    pub fn is_pack(&self) -> bool {
        matches!(self, Error::Pack(_) | Error::FrameEncode(_))
    }

    /// Decode family: unpack, frame-decode.
    pub fn is_unpack(&self) -> bool {
        matches!(self, Error::Unpack(_) | Error::FrameDecode(_))
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Configure(e.to_string())
    }
}

impl From<ProtoError> for Error {
    fn from(e: ProtoError) -> Self {
        match e {
            ProtoError::FrameEncode(msg) => Error::FrameEncode(msg),
            ProtoError::FrameDecode(msg) => Error::FrameDecode(msg),
            ProtoError::Pack(msg) => Error::Pack(msg),
            ProtoError::Unpack(msg) => Error::Unpack(msg),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::DataType(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
