//! # muxlink-proto
//!
//! Wire layer of the muxlink stack: the multiplex frame protocol (MFP)
//! binary codec and the multiplex data protocol (MDP) envelope layer that
//! adds endpoint naming and file attachments on top of it.
//!
//! ## Quick Start
//!
//! ```rust
//! use muxlink_proto::{FrameOptions, MdpCodec, MdpFrame, MfpCodec};
//! use serde_json::json;
//!
//! # fn main() -> muxlink_proto::Result<()> {
//! let mdp = MdpCodec::new(MfpCodec::new());
//! let (id, bytes) = mdp.encode_request(
//!     "calculator",
//!     Some(json!({"value1": 6, "value2": 2, "operation": "/"})),
//!     None,
//!     FrameOptions::acked(),
//! )?;
//!
//! match mdp.decode(&bytes)? {
//!     MdpFrame::Request(payload) => {
//!         assert_eq!(payload.id, id);
//!         assert_eq!(payload.endpoint, "calculator");
//!     }
//!     _ => unreachable!(),
//! }
//! # Ok(())
//! # }
//! ```

pub mod checksum;
pub mod codec;
pub mod error;
pub mod frame;
pub mod id;
pub mod mdp;
pub mod mfp;

pub use checksum::{Checksum, ChecksumRef, NoopChecksum, VerifyMode};
pub use error::{ProtoError, Result};
pub use frame::{BinaryBody, BinaryScope, Frame, FrameBody, FrameKind, PayloadBody, ServiceCode};
pub use id::IdGenerator;
pub use mdp::{FileBlob, FrameOptions, MdpCodec, MdpFrame, MdpPayload};
pub use mfp::{MfpCodec, FRAME_PREFIX_LEN};
