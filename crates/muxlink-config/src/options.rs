//! Layerable endpoint and preset options.

use crate::chain::{ChainRef, ChainSpec};
use crate::request_init::RequestInitPatch;
use crate::setting::Setting;
use crate::url::UrlParts;
use std::fmt;
use std::sync::Arc;

/// Monotonic retry delay: attempt index (0-based) to milliseconds.
#[derive(Clone)]
pub struct RetryDelay(pub Arc<dyn Fn(u32) -> u64 + Send + Sync>);

impl RetryDelay {
    pub fn new(f: impl Fn(u32) -> u64 + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Fixed delay per attempt.
    pub fn fixed(ms: u64) -> Self {
        Self::new(move |_| ms)
    }

    pub fn delay_ms(&self, attempt: u32) -> u64 {
        (self.0)(attempt)
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RetryDelay(..)")
    }
}

/// Reference to a preset: registered by name or supplied inline.
pub enum PresetRef<M, H> {
    Named(String),
    Inline(Arc<PresetOptions<M, H>>),
}

impl<M, H> Clone for PresetRef<M, H> {
    fn clone(&self) -> Self {
        match self {
            PresetRef::Named(name) => PresetRef::Named(name.clone()),
            PresetRef::Inline(preset) => PresetRef::Inline(preset.clone()),
        }
    }
}

impl<M, H> fmt::Debug for PresetRef<M, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresetRef::Named(name) => write!(f, "Named({})", name),
            PresetRef::Inline(_) => write!(f, "Inline(..)"),
        }
    }
}

/// One layer of endpoint configuration. `M` is the middleware handle type,
/// `H` the result-handler callback type; both are supplied by the runtime.
pub struct EndpointOptions<M, H> {
    /// Config class this endpoint belongs to (selects class defaults).
    pub kind: Option<String>,
    /// Context factory kind resolved from the runtime registry.
    pub context_kind: Setting<String>,
    pub executor: Setting<ChainRef<M>>,
    pub preprocess: Setting<ChainSpec<M>>,
    pub postprocess: Setting<ChainSpec<M>>,
    pub errorprocess: Setting<ChainSpec<M>>,
    pub queue_key: Setting<String>,
    pub queue_limit: Setting<u32>,
    pub queue_priority: Setting<u32>,
    pub queue_unordered: Setting<bool>,
    pub timeout_ms: Setting<u64>,
    pub retries: Setting<u32>,
    pub retry_delay: Setting<RetryDelay>,
    pub request_init: RequestInitPatch,
    pub headers: Setting<Vec<(String, String)>>,
    /// Absolute URL or path fragment contributed by this layer.
    pub url: Option<UrlParts>,
    /// Callback-style result delivery.
    pub handler: Setting<H>,
    pub preset: Setting<PresetRef<M, H>>,
}

impl<M, H> Default for EndpointOptions<M, H> {
    fn default() -> Self {
        Self {
            kind: None,
            context_kind: Setting::Inherit,
            executor: Setting::Inherit,
            preprocess: Setting::Inherit,
            postprocess: Setting::Inherit,
            errorprocess: Setting::Inherit,
            queue_key: Setting::Inherit,
            queue_limit: Setting::Inherit,
            queue_priority: Setting::Inherit,
            queue_unordered: Setting::Inherit,
            timeout_ms: Setting::Inherit,
            retries: Setting::Inherit,
            retry_delay: Setting::Inherit,
            request_init: RequestInitPatch::default(),
            headers: Setting::Inherit,
            url: None,
            handler: Setting::Inherit,
            preset: Setting::Inherit,
        }
    }
}

impl<M: Clone, H: Clone> Clone for EndpointOptions<M, H> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            context_kind: self.context_kind.clone(),
            executor: self.executor.clone(),
            preprocess: self.preprocess.clone(),
            postprocess: self.postprocess.clone(),
            errorprocess: self.errorprocess.clone(),
            queue_key: self.queue_key.clone(),
            queue_limit: self.queue_limit.clone(),
            queue_priority: self.queue_priority.clone(),
            queue_unordered: self.queue_unordered.clone(),
            timeout_ms: self.timeout_ms.clone(),
            retries: self.retries.clone(),
            retry_delay: self.retry_delay.clone(),
            request_init: self.request_init.clone(),
            headers: self.headers.clone(),
            url: self.url.clone(),
            handler: self.handler.clone(),
            preset: self.preset.clone(),
        }
    }
}

impl<M, H> EndpointOptions<M, H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn url(mut self, url: UrlParts) -> Self {
        self.url = Some(url);
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.request_init.method = Setting::Value(method.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let entry = (name.into(), value.into());
        match &mut self.headers {
            Setting::Value(entries) => entries.push(entry),
            other => *other = Setting::Value(vec![entry]),
        }
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Setting::Value(ms);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Setting::Value(retries);
        self
    }

    pub fn retry_delay(mut self, delay: RetryDelay) -> Self {
        self.retry_delay = Setting::Value(delay);
        self
    }

    pub fn queue(mut self, key: impl Into<String>) -> Self {
        self.queue_key = Setting::Value(key.into());
        self
    }

    pub fn queue_priority(mut self, priority: u32) -> Self {
        self.queue_priority = Setting::Value(priority);
        self
    }

    pub fn executor(mut self, executor: ChainRef<M>) -> Self {
        self.executor = Setting::Value(executor);
        self
    }

    pub fn preprocess(mut self, spec: ChainSpec<M>) -> Self {
        self.preprocess = Setting::Value(spec);
        self
    }

    pub fn postprocess(mut self, spec: ChainSpec<M>) -> Self {
        self.postprocess = Setting::Value(spec);
        self
    }

    pub fn errorprocess(mut self, spec: ChainSpec<M>) -> Self {
        self.errorprocess = Setting::Value(spec);
        self
    }

    pub fn handler(mut self, handler: H) -> Self {
        self.handler = Setting::Value(handler);
        self
    }

    pub fn preset(mut self, preset: PresetRef<M, H>) -> Self {
        self.preset = Setting::Value(preset);
        self
    }

    pub fn preset_named(self, name: impl Into<String>) -> Self {
        self.preset(PresetRef::Named(name.into()))
    }
}

/// A preset is the endpoint-option subset that carries no path, handler or
/// nested preset of its own.
pub struct PresetOptions<M, H> {
    pub context_kind: Setting<String>,
    pub executor: Setting<ChainRef<M>>,
    pub preprocess: Setting<ChainSpec<M>>,
    pub postprocess: Setting<ChainSpec<M>>,
    pub errorprocess: Setting<ChainSpec<M>>,
    pub queue_key: Setting<String>,
    pub queue_limit: Setting<u32>,
    pub queue_priority: Setting<u32>,
    pub queue_unordered: Setting<bool>,
    pub timeout_ms: Setting<u64>,
    pub retries: Setting<u32>,
    pub retry_delay: Setting<RetryDelay>,
    pub request_init: RequestInitPatch,
    pub headers: Setting<Vec<(String, String)>>,
    _handler: std::marker::PhantomData<H>,
}

impl<M, H> Default for PresetOptions<M, H> {
    fn default() -> Self {
        Self {
            context_kind: Setting::Inherit,
            executor: Setting::Inherit,
            preprocess: Setting::Inherit,
            postprocess: Setting::Inherit,
            errorprocess: Setting::Inherit,
            queue_key: Setting::Inherit,
            queue_limit: Setting::Inherit,
            queue_priority: Setting::Inherit,
            queue_unordered: Setting::Inherit,
            timeout_ms: Setting::Inherit,
            retries: Setting::Inherit,
            retry_delay: Setting::Inherit,
            request_init: RequestInitPatch::default(),
            headers: Setting::Inherit,
            _handler: std::marker::PhantomData,
        }
    }
}

impl<M: Clone, H> Clone for PresetOptions<M, H> {
    fn clone(&self) -> Self {
        Self {
            context_kind: self.context_kind.clone(),
            executor: self.executor.clone(),
            preprocess: self.preprocess.clone(),
            postprocess: self.postprocess.clone(),
            errorprocess: self.errorprocess.clone(),
            queue_key: self.queue_key.clone(),
            queue_limit: self.queue_limit.clone(),
            queue_priority: self.queue_priority.clone(),
            queue_unordered: self.queue_unordered.clone(),
            timeout_ms: self.timeout_ms.clone(),
            retries: self.retries.clone(),
            retry_delay: self.retry_delay.clone(),
            request_init: self.request_init.clone(),
            headers: self.headers.clone(),
            _handler: std::marker::PhantomData,
        }
    }
}

impl<M, H> PresetOptions<M, H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Setting::Value(ms);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Setting::Value(retries);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let entry = (name.into(), value.into());
        match &mut self.headers {
            Setting::Value(entries) => entries.push(entry),
            other => *other = Setting::Value(vec![entry]),
        }
        self
    }

    pub fn queue(mut self, key: impl Into<String>) -> Self {
        self.queue_key = Setting::Value(key.into());
        self
    }
}
