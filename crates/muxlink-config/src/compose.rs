//! Configuration composer.
//!
//! A resolved endpoint is layered class defaults → preset → endpoint →
//! request-specific options. Per field: a value overwrites, the explicit-off
//! marker clears, an absent field inherits.

use crate::chain::{expand_chain, ChainRef, ChainSpec};
use crate::error::{ConfigError, Result};
use crate::headers::{HeaderMerge, Headers};
use crate::options::{EndpointOptions, PresetOptions, PresetRef, RetryDelay};
use crate::registry::KindRegistry;
use crate::request_init::{RequestInit, RequestInitPatch};
use crate::setting::Setting;
use crate::url::UrlParts;
use std::sync::Arc;
use std::time::Duration;

/// Immutable product of composition. Wrapped in `Arc` and memoized by the
/// owning stack; nothing here changes after construction.
#[derive(Debug)]
pub struct ResolvedEndpoint<M, H> {
    pub kind: String,
    pub context_kind: Option<String>,
    pub executor: Option<ChainRef<M>>,
    pub preprocess: Vec<ChainRef<M>>,
    pub postprocess: Vec<ChainRef<M>>,
    pub errorprocess: Vec<ChainRef<M>>,
    pub queue_key: Option<String>,
    pub queue_limit: Option<u32>,
    pub queue_priority: Option<u32>,
    pub queue_unordered: bool,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub retry_delay: Option<RetryDelay>,
    pub request_init: RequestInit,
    pub headers: Headers,
    pub url: Option<UrlParts>,
    pub handler: Option<H>,
}

/// Mutable accumulator while layers apply.
struct Working<M, H> {
    context_kind: Option<String>,
    executor: Option<ChainRef<M>>,
    preprocess: Vec<ChainRef<M>>,
    postprocess: Vec<ChainRef<M>>,
    errorprocess: Vec<ChainRef<M>>,
    queue_key: Option<String>,
    queue_limit: Option<u32>,
    queue_priority: Option<u32>,
    queue_unordered: Option<bool>,
    timeout_ms: Option<u64>,
    retries: Option<u32>,
    retry_delay: Option<RetryDelay>,
    request_init: RequestInit,
    headers: Headers,
    url: Option<UrlParts>,
    handler: Option<H>,
}

impl<M, H> Default for Working<M, H> {
    fn default() -> Self {
        Self {
            context_kind: None,
            executor: None,
            preprocess: Vec::new(),
            postprocess: Vec::new(),
            errorprocess: Vec::new(),
            queue_key: None,
            queue_limit: None,
            queue_priority: None,
            queue_unordered: None,
            timeout_ms: None,
            retries: None,
            retry_delay: None,
            request_init: RequestInit::default(),
            headers: Headers::new(),
            url: None,
            handler: None,
        }
    }
}

/// Borrowed view over the fields shared by endpoint and preset layers.
struct Layer<'a, M, H> {
    context_kind: &'a Setting<String>,
    executor: &'a Setting<ChainRef<M>>,
    preprocess: &'a Setting<ChainSpec<M>>,
    postprocess: &'a Setting<ChainSpec<M>>,
    errorprocess: &'a Setting<ChainSpec<M>>,
    queue_key: &'a Setting<String>,
    queue_limit: &'a Setting<u32>,
    queue_priority: &'a Setting<u32>,
    queue_unordered: &'a Setting<bool>,
    timeout_ms: &'a Setting<u64>,
    retries: &'a Setting<u32>,
    retry_delay: &'a Setting<RetryDelay>,
    request_init: &'a RequestInitPatch,
    headers: &'a Setting<Vec<(String, String)>>,
    url: Option<&'a UrlParts>,
    handler: Option<&'a Setting<H>>,
}

impl<'a, M, H> Layer<'a, M, H> {
    fn from_endpoint(options: &'a EndpointOptions<M, H>) -> Self {
        Self {
            context_kind: &options.context_kind,
            executor: &options.executor,
            preprocess: &options.preprocess,
            postprocess: &options.postprocess,
            errorprocess: &options.errorprocess,
            queue_key: &options.queue_key,
            queue_limit: &options.queue_limit,
            queue_priority: &options.queue_priority,
            queue_unordered: &options.queue_unordered,
            timeout_ms: &options.timeout_ms,
            retries: &options.retries,
            retry_delay: &options.retry_delay,
            request_init: &options.request_init,
            headers: &options.headers,
            url: options.url.as_ref(),
            handler: Some(&options.handler),
        }
    }

    fn from_preset(preset: &'a PresetOptions<M, H>) -> Self {
        Self {
            context_kind: &preset.context_kind,
            executor: &preset.executor,
            preprocess: &preset.preprocess,
            postprocess: &preset.postprocess,
            errorprocess: &preset.errorprocess,
            queue_key: &preset.queue_key,
            queue_limit: &preset.queue_limit,
            queue_priority: &preset.queue_priority,
            queue_unordered: &preset.queue_unordered,
            timeout_ms: &preset.timeout_ms,
            retries: &preset.retries,
            retry_delay: &preset.retry_delay,
            request_init: &preset.request_init,
            headers: &preset.headers,
            url: None,
            handler: None,
        }
    }
}

/// Holds the config-class and preset registries and produces resolved
/// endpoint configs.
pub struct Composer<M, H> {
    classes: KindRegistry<EndpointOptions<M, H>>,
    presets: KindRegistry<Arc<PresetOptions<M, H>>>,
}

impl<M: Clone, H: Clone> Composer<M, H> {
    pub fn new() -> Self {
        Self {
            classes: KindRegistry::new("endpoint config classes"),
            presets: KindRegistry::new("presets"),
        }
    }

    pub fn register_class(&mut self, kind: impl Into<String>, defaults: EndpointOptions<M, H>) -> Result<()> {
        self.classes.register(kind, defaults)
    }

    pub fn register_preset(&mut self, name: impl Into<String>, preset: PresetOptions<M, H>) -> Result<()> {
        self.presets.register(name, Arc::new(preset))
    }

    pub fn has_class(&self, kind: &str) -> bool {
        self.classes.contains(kind)
    }

    pub fn has_preset(&self, name: &str) -> bool {
        self.presets.contains(name)
    }

    /// Freeze both registries before hot use.
    pub fn freeze(&mut self) {
        self.classes.freeze();
        self.presets.freeze();
    }

    /// Compose a resolved config from the endpoint options plus optional
    /// request-specific options.
    pub fn resolve(
        &self,
        endpoint: &EndpointOptions<M, H>,
        request: Option<&EndpointOptions<M, H>>,
    ) -> Result<ResolvedEndpoint<M, H>> {
        let kind = endpoint
            .kind
            .clone()
            .or_else(|| request.and_then(|r| r.kind.clone()))
            .ok_or_else(|| ConfigError::ValidationError("endpoint kind missing".into()))?;
        if kind.is_empty() {
            return Err(ConfigError::ValidationError("endpoint kind must be non-empty".into()));
        }
        let class = self.classes.require(&kind)?;

        // The preset in effect is decided across all layers before any of
        // them applies.
        let mut preset_ref: Option<PresetRef<M, H>> = None;
        class.preset.apply(&mut preset_ref);
        endpoint.preset.apply(&mut preset_ref);
        if let Some(request) = request {
            request.preset.apply(&mut preset_ref);
        }
        let preset = match preset_ref {
            None => None,
            Some(PresetRef::Inline(preset)) => Some(preset),
            Some(PresetRef::Named(name)) => Some(
                self.presets
                    .get(&name)
                    .ok_or(ConfigError::InvalidPreset(name))?
                    .clone(),
            ),
        };

        let mut working = Working::default();
        self.apply(&mut working, Layer::from_endpoint(class))?;
        if let Some(preset) = &preset {
            self.apply(&mut working, Layer::from_preset(preset))?;
        }
        self.apply(&mut working, Layer::from_endpoint(endpoint))?;
        if let Some(request) = request {
            self.apply(&mut working, Layer::from_endpoint(request))?;
        }

        self.finish(kind, working)
    }

    fn apply(&self, working: &mut Working<M, H>, layer: Layer<'_, M, H>) -> Result<()> {
        layer.context_kind.apply(&mut working.context_kind);

        match layer.executor {
            Setting::Inherit | Setting::Value(ChainRef::Base) => {}
            Setting::Off => working.executor = None,
            Setting::Value(executor) => working.executor = Some(executor.clone()),
        }
        apply_chain(layer.preprocess, &mut working.preprocess)?;
        apply_chain(layer.postprocess, &mut working.postprocess)?;
        apply_chain(layer.errorprocess, &mut working.errorprocess)?;

        layer.queue_key.apply(&mut working.queue_key);
        layer.queue_limit.apply(&mut working.queue_limit);
        layer.queue_priority.apply(&mut working.queue_priority);
        layer.queue_unordered.apply(&mut working.queue_unordered);
        layer.timeout_ms.apply(&mut working.timeout_ms);
        layer.retries.apply(&mut working.retries);
        layer.retry_delay.apply(&mut working.retry_delay);

        working.request_init.extend(layer.request_init);

        // Headers carried inside request-init land on the headers channel
        // first; the channel's own entries apply last and win.
        match &layer.request_init.headers {
            Setting::Inherit => {}
            Setting::Off => working.headers = Headers::new(),
            Setting::Value(entries) => {
                working
                    .headers
                    .extend(entries.iter().cloned(), HeaderMerge::Patch);
            }
        }
        match layer.headers {
            Setting::Inherit => {}
            Setting::Off => working.headers = Headers::new(),
            Setting::Value(entries) => {
                working
                    .headers
                    .extend(entries.iter().cloned(), HeaderMerge::Patch);
            }
        }

        if let Some(parts) = layer.url {
            working.url = Some(match &working.url {
                None => {
                    if !parts.is_absolute() {
                        return Err(ConfigError::MissingBaseUrl);
                    }
                    parts.clone()
                }
                Some(base) => base.extend(parts)?,
            });
        }

        if let Some(handler) = layer.handler {
            handler.apply(&mut working.handler);
        }
        Ok(())
    }

    fn finish(&self, kind: String, working: Working<M, H>) -> Result<ResolvedEndpoint<M, H>> {
        if working.queue_limit == Some(0) {
            return Err(ConfigError::ValidationError("queue limit must be positive".into()));
        }
        if working.timeout_ms == Some(0) {
            return Err(ConfigError::ValidationError("timeout must be positive".into()));
        }
        if working.retries == Some(0) {
            return Err(ConfigError::ValidationError("retries must be positive".into()));
        }
        if working.queue_key.as_deref() == Some("") {
            return Err(ConfigError::ValidationError("queue key must be non-empty".into()));
        }

        Ok(ResolvedEndpoint {
            kind,
            context_kind: working.context_kind,
            executor: working.executor,
            preprocess: working.preprocess,
            postprocess: working.postprocess,
            errorprocess: working.errorprocess,
            queue_key: working.queue_key,
            queue_limit: working.queue_limit,
            queue_priority: working.queue_priority,
            queue_unordered: working.queue_unordered.unwrap_or(false),
            timeout: working.timeout_ms.map(Duration::from_millis),
            retries: working.retries,
            retry_delay: working.retry_delay,
            request_init: working.request_init,
            headers: working.headers,
            url: working.url,
            handler: working.handler,
        })
    }
}

impl<M: Clone, H: Clone> Default for Composer<M, H> {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_chain<M: Clone>(
    setting: &Setting<ChainSpec<M>>,
    target: &mut Vec<ChainRef<M>>,
) -> Result<()> {
    match setting {
        Setting::Inherit => Ok(()),
        Setting::Off => {
            target.clear();
            Ok(())
        }
        Setting::Value(spec) => {
            *target = expand_chain(spec, target)?;
            Ok(())
        }
    }
}
