use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Frame encode error: {0}")]
    FrameEncode(String),

    #[error("Frame decode error: {0}")]
    FrameDecode(String),

    #[error("Pack error: {0}")]
    Pack(String),

    #[error("Unpack error: {0}")]
    Unpack(String),
}

impl ProtoError {
    /// True for the encode-side kinds (frame-encode, pack).
    pub fn is_encode(&self) -> bool {
        matches!(self, ProtoError::FrameEncode(_) | ProtoError::Pack(_))
    }

    /// True for the decode-side kinds (frame-decode, unpack).
    pub fn is_decode(&self) -> bool {
        matches!(self, ProtoError::FrameDecode(_) | ProtoError::Unpack(_))
    }
}

pub type Result<T> = std::result::Result<T, ProtoError>;
