//! Stack facade: owns the registries, the named queues and the memoized
//! resolved configs, and turns endpoint keys into running request contexts.

use crate::context::{
    HttpContext, Options, Presets, RequestOutcome, Resolved, ResolvedPipeline,
};
use crate::error::{Error, Result};
use crate::executor::HttpExecutor;
use crate::interrupt::AbortSignal;
use crate::middleware::{MiddlewareHandle, MiddlewareRegistry};
use crate::queue::NamedAsyncQueue;
use dashmap::DashMap;
use muxlink_config::{
    validate_doc, ChainRef, Composer, KindRegistry, StackDoc, UrlParts,
};
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Per-call runtime inputs handed to a context factory.
pub struct CallRuntime {
    pub body: Option<Value>,
    pub abort: Option<AbortSignal>,
    pub queues: Arc<NamedAsyncQueue>,
}

/// Produces request contexts for one config kind.
pub trait ContextFactory: Send + Sync {
    fn kind(&self) -> &str;
    fn create(&self, pipeline: Arc<ResolvedPipeline>, runtime: CallRuntime) -> Arc<HttpContext>;
}

struct DefaultContextFactory;

impl ContextFactory for DefaultContextFactory {
    fn kind(&self) -> &str {
        "http"
    }

    fn create(&self, pipeline: Arc<ResolvedPipeline>, runtime: CallRuntime) -> Arc<HttpContext> {
        HttpContext::new(pipeline, runtime.queues, runtime.body, runtime.abort)
    }
}

/// Request-specific inputs for one call.
#[derive(Default)]
pub struct CallOptions {
    /// Extra option layer applied over the endpoint's own options.
    pub options: Option<Options>,
    pub body: Option<Value>,
    pub abort: Option<AbortSignal>,
}

impl CallOptions {
    pub fn body(value: Value) -> Self {
        Self {
            body: Some(value),
            ..Self::default()
        }
    }
}

pub struct StackBuilder {
    base_url: Option<String>,
    middlewares: MiddlewareRegistry,
    composer: Composer<MiddlewareHandle, crate::context::ResultHandler>,
    factories: KindRegistry<Arc<dyn ContextFactory>>,
    endpoints: Vec<(String, Options)>,
    has_http_class: bool,
}

impl StackBuilder {
    pub fn new() -> Self {
        Self {
            base_url: None,
            middlewares: MiddlewareRegistry::new(),
            composer: Composer::new(),
            factories: KindRegistry::new("context factories"),
            endpoints: Vec::new(),
            has_http_class: false,
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn middleware(mut self, middleware: MiddlewareHandle) -> Result<Self> {
        self.middlewares.register(middleware)?;
        Ok(self)
    }

    pub fn middleware_factory(
        mut self,
        kind: impl Into<String>,
        factory: impl Fn() -> MiddlewareHandle + Send + Sync + 'static,
    ) -> Result<Self> {
        self.middlewares.register_factory(kind, factory)?;
        Ok(self)
    }

    pub fn preset(mut self, name: impl Into<String>, preset: Presets) -> Result<Self> {
        self.composer.register_preset(name, preset)?;
        Ok(self)
    }

    /// Register a config class. Registering a class named `http` replaces
    /// the built-in default.
    pub fn class(mut self, kind: impl Into<String>, defaults: Options) -> Result<Self> {
        let kind = kind.into();
        if kind == "http" {
            self.has_http_class = true;
        }
        self.composer.register_class(kind, defaults)?;
        Ok(self)
    }

    pub fn endpoint(mut self, key: impl Into<String>, options: Options) -> Result<Self> {
        let key = key.into();
        if self.endpoints.iter().any(|(k, _)| *k == key) {
            return Err(Error::Configure(format!("duplicate endpoint key '{}'", key)));
        }
        self.endpoints.push((key, options));
        Ok(self)
    }

    pub fn context_factory(mut self, factory: Arc<dyn ContextFactory>) -> Result<Self> {
        let kind = factory.kind().to_string();
        self.factories.register(kind, factory)?;
        Ok(self)
    }

    /// Merge a declarative document: presets and endpoints by name, plus
    /// the stack's base URL when none was set programmatically.
    pub fn load_doc(mut self, doc: &StackDoc) -> Result<Self> {
        validate_doc(doc)?;
        if self.base_url.is_none() {
            self.base_url = doc.stack.base_url.clone();
        }
        for preset in &doc.presets {
            self.composer
                .register_preset(preset.name.clone(), preset.to_options())?;
        }
        for endpoint in &doc.endpoints {
            let options = endpoint.to_options()?;
            if self.endpoints.iter().any(|(k, _)| *k == endpoint.name) {
                return Err(Error::Configure(format!(
                    "duplicate endpoint key '{}'",
                    endpoint.name
                )));
            }
            self.endpoints.push((endpoint.name.clone(), options));
        }
        Ok(self)
    }

    pub fn build(mut self) -> Result<Stack> {
        if !self.middlewares.contains("http") {
            self.middlewares.register(Arc::new(HttpExecutor::new()))?;
        }
        if !self.has_http_class {
            let mut defaults = Options::new().executor(ChainRef::kind("http"));
            if let Some(base) = &self.base_url {
                defaults = defaults.url(UrlParts::parse_absolute(base)?);
            }
            self.composer.register_class("http", defaults)?;
        }
        if !self.factories.contains("http") {
            self.factories
                .register("http", Arc::new(DefaultContextFactory) as Arc<dyn ContextFactory>)?;
        }

        self.middlewares.verify()?;
        self.middlewares.freeze();
        self.composer.freeze();
        self.factories.freeze();

        let mut endpoints = FxHashMap::default();
        for (key, mut options) in self.endpoints {
            if options.kind.is_none() {
                options.kind = Some("http".into());
            }
            endpoints.insert(key, options);
        }

        Ok(Stack {
            middlewares: self.middlewares,
            composer: self.composer,
            factories: self.factories,
            endpoints,
            resolved: DashMap::new(),
            queues: Arc::new(NamedAsyncQueue::new()),
        })
    }
}

impl Default for StackBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The HTTP half of the communication stack.
pub struct Stack {
    middlewares: MiddlewareRegistry,
    composer: Composer<MiddlewareHandle, crate::context::ResultHandler>,
    factories: KindRegistry<Arc<dyn ContextFactory>>,
    endpoints: FxHashMap<String, Options>,
    resolved: DashMap<String, Arc<ResolvedPipeline>>,
    queues: Arc<NamedAsyncQueue>,
}

impl Stack {
    pub fn builder() -> StackBuilder {
        StackBuilder::new()
    }

    pub fn queues(&self) -> Arc<NamedAsyncQueue> {
        self.queues.clone()
    }

    pub fn middlewares(&self) -> &MiddlewareRegistry {
        &self.middlewares
    }

    fn options_for(&self, key: &str) -> Result<&Options> {
        self.endpoints
            .get(key)
            .ok_or_else(|| Error::MissingRecipient(format!("unknown endpoint '{}'", key)))
    }

    fn build_pipeline(&self, config: Resolved) -> Result<Arc<ResolvedPipeline>> {
        Ok(Arc::new(ResolvedPipeline::from_config(
            config,
            &self.middlewares,
        )?))
    }

    /// Resolved config for an endpoint key, built on first access and
    /// memoized.
    pub fn endpoint(&self, key: &str) -> Result<Arc<ResolvedPipeline>> {
        if let Some(pipeline) = self.resolved.get(key) {
            return Ok(pipeline.value().clone());
        }
        let options = self.options_for(key)?;
        let config = self.composer.resolve(options, None)?;
        let pipeline = self.build_pipeline(config)?;
        debug!(endpoint = key, "resolved endpoint config");
        self.resolved.insert(key.to_string(), pipeline.clone());
        Ok(pipeline)
    }

    /// Build a runnable context for one call. Request-specific options are
    /// layered on top and bypass the memo table.
    pub fn context(&self, key: &str, call: CallOptions) -> Result<Arc<HttpContext>> {
        let pipeline = match &call.options {
            None => self.endpoint(key)?,
            Some(request) => {
                let options = self.options_for(key)?;
                let config = self.composer.resolve(options, Some(request))?;
                self.build_pipeline(config)?
            }
        };
        let kind = pipeline
            .config
            .context_kind
            .clone()
            .unwrap_or_else(|| "http".to_string());
        let factory = self.factories.require(&kind)?;
        Ok(factory.create(
            pipeline,
            CallRuntime {
                body: call.body,
                abort: call.abort,
                queues: self.queues.clone(),
            },
        ))
    }

    /// Run one call to completion.
    pub async fn fetch(&self, key: &str, call: CallOptions) -> Result<RequestOutcome> {
        let ctx = self.context(key, call)?;
        Ok(ctx.run().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestStatus;
    use crate::middleware::{Flow, Middleware};
    use muxlink_config::parse_config_from_str;
    use serde_json::json;

    struct EchoExecutor;

    #[async_trait::async_trait]
    impl Middleware for EchoExecutor {
        fn kind(&self) -> &str {
            "echo"
        }

        async fn process(&self, _ctx: &HttpContext, value: Value) -> crate::error::Result<Flow> {
            Ok(Flow::Next(json!({"echo": value})))
        }
    }

    fn echo_stack() -> Stack {
        Stack::builder()
            .middleware(Arc::new(EchoExecutor))
            .unwrap()
            .class(
                "http",
                Options::new().executor(ChainRef::kind("echo")),
            )
            .unwrap()
            .endpoint("echo.call", Options::new().kind("http"))
            .unwrap()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_through_registered_executor() {
        let stack = echo_stack();
        let outcome = stack
            .fetch("echo.call", CallOptions::body(json!({"n": 1})))
            .await
            .unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.value, Some(json!({"echo": {"n": 1}})));
    }

    #[tokio::test]
    async fn test_unknown_endpoint_is_missing_recipient() {
        let stack = echo_stack();
        let err = stack.fetch("ghost", CallOptions::default()).await.unwrap_err();
        assert_eq!(err.code(), 6);
    }

    #[tokio::test]
    async fn test_resolved_configs_memoized() {
        let stack = echo_stack();
        let first = stack.endpoint("echo.call").unwrap();
        let second = stack.endpoint("echo.call").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_request_options_bypass_memo() {
        let stack = echo_stack();
        let memoized = stack.endpoint("echo.call").unwrap();
        let ctx = stack
            .context(
                "echo.call",
                CallOptions {
                    options: Some(Options::new().timeout_ms(5_000)),
                    body: None,
                    abort: None,
                },
            )
            .unwrap();
        assert!(!Arc::ptr_eq(&memoized, &ctx.pipeline()));
        assert_eq!(
            ctx.config().timeout,
            Some(std::time::Duration::from_millis(5_000))
        );
    }

    #[tokio::test]
    async fn test_load_doc_registers_endpoints_and_presets() {
        let doc = parse_config_from_str(
            r#"
stack:
  name: api
  base_url: https://api.example.com

presets:
  - name: patient
    timeout_ms: 60000

endpoints:
  - name: users.list
    path: /users
    method: GET
    preset: patient
"#,
        )
        .unwrap();
        let stack = Stack::builder().load_doc(&doc).unwrap().build().unwrap();
        let pipeline = stack.endpoint("users.list").unwrap();
        assert_eq!(
            pipeline.config.timeout,
            Some(std::time::Duration::from_millis(60_000))
        );
        assert_eq!(
            pipeline.config.url.as_ref().unwrap().href().unwrap(),
            "https://api.example.com/users"
        );
        assert_eq!(
            pipeline.config.request_init.method.as_deref(),
            Some("GET")
        );
    }

    #[tokio::test]
    async fn test_handler_delivery_via_stack() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let handler = {
            let seen = seen.clone();
            crate::context::ResultHandler::new(move |outcome| {
                seen.lock().unwrap().push(outcome.ok);
            })
        };
        let stack = Stack::builder()
            .middleware(Arc::new(EchoExecutor))
            .unwrap()
            .class("http", Options::new().executor(ChainRef::kind("echo")))
            .unwrap()
            .endpoint("echo.call", Options::new().kind("http").handler(handler))
            .unwrap()
            .build()
            .unwrap();
        let outcome = stack
            .fetch("echo.call", CallOptions::body(json!(1)))
            .await
            .unwrap();
        assert!(outcome.ok);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(*seen.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn test_fetch_status_observable_on_context() {
        let stack = echo_stack();
        let ctx = stack
            .context("echo.call", CallOptions::body(json!(null)))
            .unwrap();
        ctx.run().await;
        assert_eq!(ctx.status(), RequestStatus::Ok);
    }
}
