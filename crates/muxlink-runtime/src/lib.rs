//! # muxlink-runtime
//!
//! Execution layer of the muxlink stack: the HTTP request pipeline
//! (middleware chains, retries, timeouts, named priority queues) and the
//! multiplexed endpoint dispatcher over a persistent binary transport.
//!
//! ## Quick Start (HTTP pipeline)
//!
//! ```rust,no_run
//! use muxlink_runtime::{CallOptions, Options, Stack};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> muxlink_runtime::Result<()> {
//! let stack = Stack::builder()
//!     .base_url("https://api.example.com")
//!     .endpoint("users.create", Options::new().url(muxlink_config::UrlParts::parse("/users")?).method("POST"))?
//!     .build()?;
//!
//! let outcome = stack
//!     .fetch("users.create", CallOptions::body(json!({"name": "ada"})))
//!     .await?;
//! assert!(outcome.ok);
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod exchange;
pub mod executor;
pub mod interrupt;
pub mod middleware;
pub mod promise;
pub mod queue;
pub mod stack;
pub mod transport;

pub use context::{
    HttpContext, Options, Presets, RequestOutcome, RequestStatus, Resolved, ResolvedPipeline,
    ResultHandler, Stage,
};
pub use dispatcher::{
    DispatchEvent, Dispatcher, DispatcherOptions, GlobalHandler, SendControls,
};
pub use endpoint::{EndpointDefaults, EndpointEventHandler, EndpointHandle};
pub use error::{Error, Result};
pub use exchange::{
    ExchangeResult, ExchangeStatus, ExchangeValue, IncomingRequest, OutgoingContext,
};
pub use executor::HttpExecutor;
pub use interrupt::{AbortKind, AbortSignal, InterruptController, InterruptStatus};
pub use middleware::{
    run_chain, run_error_chain, Flow, Middleware, MiddlewareHandle, MiddlewareRegistry,
    TraceMiddleware,
};
pub use promise::SettleCell;
pub use queue::{AsyncQueue, NamedAsyncQueue};
pub use stack::{CallOptions, CallRuntime, ContextFactory, Stack, StackBuilder};
pub use transport::{
    MessageKind, PairTransport, ReceiveHandler, StateHandler, Transport, TransportEvent,
};
