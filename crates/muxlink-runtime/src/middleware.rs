//! Middleware contract, chain execution, and the middleware registry.

use crate::context::HttpContext;
use crate::error::{Error, Result};
use muxlink_config::{ChainRef, KindRegistry};
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// What a middleware did with the flowing value.
pub enum Flow {
    /// Replace the flowing value.
    Next(Value),
    /// Leave the flowing value untouched.
    Pass,
}

/// One processing step of the HTTP pipeline. Preprocessors shape the
/// outgoing value, the executor performs the native request, postprocessors
/// shape the response; error processors get a chance to recover when a peer
/// middleware failed.
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    /// Registry kind of this middleware.
    fn kind(&self) -> &str;

    async fn process(&self, ctx: &HttpContext, value: Value) -> Result<Flow>;

    /// Invoked in the error chain after another middleware failed.
    /// Returning a value recovers the request with that value.
    async fn process_error(&self, ctx: &HttpContext, value: Value, error: Error) -> Result<Flow> {
        let _ = (ctx, value);
        Err(error)
    }
}

impl std::fmt::Debug for dyn Middleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Middleware").field("kind", &self.kind()).finish()
    }
}

pub type MiddlewareHandle = Arc<dyn Middleware>;

/// Run a middleware chain over a value. `Pass` keeps the current value.
pub async fn run_chain(
    chain: &[MiddlewareHandle],
    ctx: &HttpContext,
    mut value: Value,
) -> Result<Value> {
    for middleware in chain {
        match middleware.process(ctx, value.clone()).await? {
            Flow::Next(next) => value = next,
            Flow::Pass => {}
        }
    }
    Ok(value)
}

/// Run the error chain. The first middleware that returns a value recovers
/// the request; otherwise the last error stands.
pub async fn run_error_chain(
    chain: &[MiddlewareHandle],
    ctx: &HttpContext,
    value: Value,
    error: Error,
) -> Result<Value> {
    let mut current = error;
    for middleware in chain {
        match middleware.process_error(ctx, value.clone(), current.clone()).await {
            Ok(Flow::Next(recovered)) => return Ok(recovered),
            Ok(Flow::Pass) => return Ok(value),
            Err(next) => current = next,
        }
    }
    Err(current)
}

enum MiddlewareSource {
    Instance(MiddlewareHandle),
    Factory(Box<dyn Fn() -> MiddlewareHandle + Send + Sync>),
}

/// Registry slot; factories are invoked once and memoized.
pub struct MiddlewareSlot {
    source: MiddlewareSource,
    cached: OnceLock<MiddlewareHandle>,
}

impl MiddlewareSlot {
    fn instance(&self) -> MiddlewareHandle {
        match &self.source {
            MiddlewareSource::Instance(handle) => handle.clone(),
            MiddlewareSource::Factory(factory) => self.cached.get_or_init(|| factory()).clone(),
        }
    }
}

/// Freezable kind-keyed middleware registry.
pub struct MiddlewareRegistry {
    registry: KindRegistry<MiddlewareSlot>,
}

impl MiddlewareRegistry {
    pub fn new() -> Self {
        Self {
            registry: KindRegistry::new("middlewares"),
        }
    }

    pub fn register(&mut self, middleware: MiddlewareHandle) -> Result<()> {
        let kind = middleware.kind().to_string();
        self.registry
            .register(
                kind,
                MiddlewareSlot {
                    source: MiddlewareSource::Instance(middleware),
                    cached: OnceLock::new(),
                },
            )
            .map_err(Into::into)
    }

    pub fn register_factory(
        &mut self,
        kind: impl Into<String>,
        factory: impl Fn() -> MiddlewareHandle + Send + Sync + 'static,
    ) -> Result<()> {
        self.registry
            .register(
                kind,
                MiddlewareSlot {
                    source: MiddlewareSource::Factory(Box::new(factory)),
                    cached: OnceLock::new(),
                },
            )
            .map_err(Into::into)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.registry.contains(kind)
    }

    pub fn freeze(&mut self) {
        self.registry.freeze();
    }

    /// Bring-up check: instantiated entries must report the kind they were
    /// registered under.
    pub fn verify(&self) -> Result<()> {
        for (kind, slot) in self.registry.iter() {
            let instance = slot.instance();
            if instance.kind() != kind {
                return Err(Error::Configure(format!(
                    "middleware registered as '{}' reports kind '{}'",
                    kind,
                    instance.kind()
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Result<MiddlewareHandle> {
        Ok(self.registry.require(kind).map(MiddlewareSlot::instance)?)
    }

    /// Materialize a composed chain reference.
    pub fn resolve_ref(&self, reference: &ChainRef<MiddlewareHandle>) -> Result<MiddlewareHandle> {
        match reference {
            ChainRef::Kind(kind) => self.get(kind),
            ChainRef::Instance(handle) => Ok(handle.clone()),
            ChainRef::Factory(factory) => Ok(factory()),
            ChainRef::Base => Err(Error::Logic(
                "base marker survived composition".into(),
            )),
        }
    }

    pub fn resolve_chain(
        &self,
        refs: &[ChainRef<MiddlewareHandle>],
    ) -> Result<Vec<MiddlewareHandle>> {
        refs.iter().map(|r| self.resolve_ref(r)).collect()
    }
}

impl Default for MiddlewareRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Logs the flowing value on both sides of the executor.
pub struct TraceMiddleware;

#[async_trait::async_trait]
impl Middleware for TraceMiddleware {
    fn kind(&self) -> &str {
        "trace"
    }

    async fn process(&self, ctx: &HttpContext, value: Value) -> Result<Flow> {
        debug!(request_id = ctx.request_id(), stage = ?ctx.stage(), %value, "pipeline value");
        Ok(Flow::Pass)
    }
}
