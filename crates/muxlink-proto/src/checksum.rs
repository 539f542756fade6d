//! Checksum verifier interface.
//!
//! Concrete algorithms live outside this crate; the framer only needs the
//! trailing-bytes contract: a verifier appends `length()` bytes to a frame,
//! computed over everything that precedes them.

use std::sync::Arc;

/// A checksum verifier appends `length()` trailing bytes to an encoded
/// frame. `write` computes the sum over `view[..view.len() - length()]` and
/// stores it into the trailing bytes; `verify` recomputes and compares.
pub trait Checksum: Send + Sync {
    /// Algorithm identifier, stable across versions of the same algorithm.
    fn version(&self) -> &str;

    /// Number of trailing bytes this verifier appends. Zero disables
    /// checksumming entirely.
    fn length(&self) -> usize;

    /// Compute the checksum over the buffer prefix and write it into the
    /// trailing `length()` bytes of `view`.
    fn write(&self, view: &mut [u8]);

    /// Recompute the checksum over the prefix and compare it against the
    /// trailing bytes.
    fn verify(&self, view: &[u8]) -> bool;
}

/// Shared checksum handle.
pub type ChecksumRef = Arc<dyn Checksum>;

/// No-op verifier with `length() == 0`, used in the zero-verification mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopChecksum;

impl Checksum for NoopChecksum {
    fn version(&self) -> &str {
        "noop"
    }

    fn length(&self) -> usize {
        0
    }

    fn write(&self, _view: &mut [u8]) {}

    fn verify(&self, _view: &[u8]) -> bool {
        true
    }
}

/// How the decoder treats the per-frame checksum flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyMode {
    /// Skip verification even when the flag is set.
    Ignore,
    /// Verify frames that carry the flag, accept frames that do not.
    #[default]
    IfFlagged,
    /// Require the flag on every frame; absence is a protocol violation.
    Require,
}

impl VerifyMode {
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => VerifyMode::Ignore,
            2 => VerifyMode::Require,
            _ => VerifyMode::IfFlagged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_checksum_contract() {
        let ck = NoopChecksum;
        assert_eq!(ck.length(), 0);
        assert_eq!(ck.version(), "noop");
        let mut buf = vec![1, 2, 3];
        ck.write(&mut buf);
        assert_eq!(buf, vec![1, 2, 3]);
        assert!(ck.verify(&buf));
    }

    #[test]
    fn test_verify_mode_levels() {
        assert_eq!(VerifyMode::from_level(0), VerifyMode::Ignore);
        assert_eq!(VerifyMode::from_level(1), VerifyMode::IfFlagged);
        assert_eq!(VerifyMode::from_level(2), VerifyMode::Require);
    }
}
