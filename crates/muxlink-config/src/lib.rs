//! # muxlink-config
//!
//! Configuration layer of the muxlink stack: layerable endpoint options and
//! presets, the per-field composition engine with explicit-off semantics,
//! ordered header and URL containers, freezable kind registries, and a YAML
//! front end for declaring presets and endpoints.

pub mod chain;
pub mod compose;
pub mod error;
pub mod headers;
pub mod options;
pub mod parser;
pub mod registry;
pub mod request_init;
pub mod setting;
pub mod url;
pub mod validator;

pub use chain::{expand_chain, ChainRef, ChainSpec};
pub use compose::{Composer, ResolvedEndpoint};
pub use error::{ConfigError, Result};
pub use headers::{HeaderMerge, Headers};
pub use options::{EndpointOptions, PresetOptions, PresetRef, RetryDelay};
pub use parser::{parse_config, parse_config_from_str, EndpointDecl, PresetDecl, StackDoc, StackMeta};
pub use registry::KindRegistry;
pub use request_init::{
    CacheMode, CorsMode, CredentialsMode, RedirectMode, RequestInit, RequestInitPatch,
    RequestPriority,
};
pub use setting::Setting;
pub use url::{HashMode, QueryMode, UrlParts};
pub use validator::validate_doc;
