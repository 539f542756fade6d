//! Per-request HTTP execution context.
//!
//! A context walks pre → executor → post middleware chains with retries,
//! an interrupt controller guarding the whole run, and optional scheduling
//! through a named priority queue.

use crate::error::{Error, Result};
use crate::interrupt::{AbortKind, AbortSignal, InterruptController, InterruptStatus};
use crate::middleware::{run_chain, run_error_chain, Flow, MiddlewareHandle};
use crate::middleware::MiddlewareRegistry;
use crate::promise::SettleCell;
use crate::queue::NamedAsyncQueue;
use muxlink_config::{EndpointOptions, Headers, PresetOptions, RequestInit, ResolvedEndpoint, UrlParts};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Progress of a request through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Stage {
    #[default]
    None,
    Started,
    Preprocessing,
    Pending,
    Postprocessing,
    Finished,
}

/// Terminal disposition of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestStatus {
    #[default]
    None,
    Ok,
    Error,
    Aborted,
    Timeout,
}

/// Callback-style result delivery.
#[derive(Clone)]
pub struct ResultHandler(Arc<dyn Fn(RequestOutcome) + Send + Sync>);

impl ResultHandler {
    pub fn new(f: impl Fn(RequestOutcome) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self, outcome: RequestOutcome) {
        (self.0)(outcome)
    }
}

impl fmt::Debug for ResultHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResultHandler(..)")
    }
}

/// Final result of one request.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub ok: bool,
    pub value: Option<Value>,
    pub error: Option<Error>,
    pub request_id: u64,
}

/// Endpoint options instantiated with the runtime's middleware and handler
/// types.
pub type Options = EndpointOptions<MiddlewareHandle, ResultHandler>;
pub type Presets = PresetOptions<MiddlewareHandle, ResultHandler>;
pub type Resolved = ResolvedEndpoint<MiddlewareHandle, ResultHandler>;

/// A resolved config with its middleware chains materialized from the
/// registry. Built once per endpoint key and shared by every context.
pub struct ResolvedPipeline {
    pub config: Resolved,
    pub executor: Option<MiddlewareHandle>,
    pub preprocess: Vec<MiddlewareHandle>,
    pub postprocess: Vec<MiddlewareHandle>,
    pub errorprocess: Vec<MiddlewareHandle>,
}

impl ResolvedPipeline {
    pub fn from_config(config: Resolved, registry: &MiddlewareRegistry) -> Result<Self> {
        let executor = config
            .executor
            .as_ref()
            .map(|r| registry.resolve_ref(r))
            .transpose()?;
        let preprocess = registry.resolve_chain(&config.preprocess)?;
        let postprocess = registry.resolve_chain(&config.postprocess)?;
        let errorprocess = registry.resolve_chain(&config.errorprocess)?;
        Ok(Self {
            config,
            executor,
            preprocess,
            postprocess,
            errorprocess,
        })
    }
}

struct CtxState {
    stage: Stage,
    status: RequestStatus,
    attempt: u32,
    value: Option<Value>,
    response_status: Option<u16>,
    response_headers: Option<Headers>,
    error: Option<Error>,
}

enum Step {
    Done,
    Retry(u64),
}

/// The per-request state machine.
pub struct HttpContext {
    request_id: u64,
    pipeline: Arc<ResolvedPipeline>,
    queues: Arc<NamedAsyncQueue>,
    body: Option<Value>,
    abort_signal: AbortSignal,
    has_external_abort: bool,
    started: AtomicBool,
    driving: AtomicBool,
    handler_done: AtomicBool,
    state: Mutex<CtxState>,
    url_cache: Mutex<Option<UrlParts>>,
    headers_cache: Mutex<Option<Headers>>,
    init_cache: Mutex<Option<RequestInit>>,
    interrupt: Mutex<Option<InterruptController>>,
    result: SettleCell<RequestOutcome>,
}

impl HttpContext {
    pub fn new(
        pipeline: Arc<ResolvedPipeline>,
        queues: Arc<NamedAsyncQueue>,
        body: Option<Value>,
        external_abort: Option<AbortSignal>,
    ) -> Arc<Self> {
        let abort_signal = AbortSignal::new();
        let has_external_abort = external_abort.is_some();
        if let Some(external) = external_abort {
            // Forward the caller's signal into the context-owned one so
            // `abort()` and the external signal share a single path.
            let own = abort_signal.clone();
            if let Some(kind) = external.fired() {
                forward_abort(&own, kind);
            } else {
                tokio::spawn(async move {
                    let kind = external.wait().await;
                    forward_abort(&own, kind);
                });
            }
        }
        Arc::new(Self {
            request_id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            pipeline,
            queues,
            body,
            abort_signal,
            has_external_abort,
            started: AtomicBool::new(false),
            driving: AtomicBool::new(false),
            handler_done: AtomicBool::new(false),
            state: Mutex::new(CtxState {
                stage: Stage::None,
                status: RequestStatus::None,
                attempt: 0,
                value: None,
                response_status: None,
                response_headers: None,
                error: None,
            }),
            url_cache: Mutex::new(None),
            headers_cache: Mutex::new(None),
            init_cache: Mutex::new(None),
            interrupt: Mutex::new(None),
            result: SettleCell::new(),
        })
    }

    // --- observers ---

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn stage(&self) -> Stage {
        self.state.lock().expect("context poisoned").stage
    }

    pub fn status(&self) -> RequestStatus {
        self.state.lock().expect("context poisoned").status
    }

    pub fn attempt(&self) -> u32 {
        self.state.lock().expect("context poisoned").attempt
    }

    pub fn config(&self) -> &Resolved {
        &self.pipeline.config
    }

    pub fn pipeline(&self) -> Arc<ResolvedPipeline> {
        self.pipeline.clone()
    }

    /// Current in-flight value.
    pub fn value(&self) -> Option<Value> {
        self.state.lock().expect("context poisoned").value.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.stage() == Stage::Finished
    }

    // --- mutable derivations (copy-on-first-write from the config) ---

    pub fn url(&self) -> UrlParts {
        self.url_cache
            .lock()
            .expect("context poisoned")
            .get_or_insert_with(|| self.pipeline.config.url.clone().unwrap_or_default())
            .clone()
    }

    pub fn modify_url(&self, f: impl FnOnce(&mut UrlParts)) {
        let mut cache = self.url_cache.lock().expect("context poisoned");
        f(cache.get_or_insert_with(|| self.pipeline.config.url.clone().unwrap_or_default()));
    }

    pub fn headers(&self) -> Headers {
        self.headers_cache
            .lock()
            .expect("context poisoned")
            .get_or_insert_with(|| self.pipeline.config.headers.clone())
            .clone()
    }

    pub fn modify_headers(&self, f: impl FnOnce(&mut Headers)) {
        let mut cache = self.headers_cache.lock().expect("context poisoned");
        f(cache.get_or_insert_with(|| self.pipeline.config.headers.clone()));
    }

    pub fn request_init(&self) -> RequestInit {
        self.init_cache
            .lock()
            .expect("context poisoned")
            .get_or_insert_with(|| self.pipeline.config.request_init.clone())
            .clone()
    }

    pub fn modify_request_init(&self, f: impl FnOnce(&mut RequestInit)) {
        let mut cache = self.init_cache.lock().expect("context poisoned");
        f(cache.get_or_insert_with(|| self.pipeline.config.request_init.clone()));
    }

    fn discard_caches(&self) {
        *self.url_cache.lock().expect("context poisoned") = None;
        *self.headers_cache.lock().expect("context poisoned") = None;
        *self.init_cache.lock().expect("context poisoned") = None;
    }

    // --- response metadata set by the executor ---

    pub fn set_response_meta(&self, status: u16, headers: Headers) {
        let mut state = self.state.lock().expect("context poisoned");
        state.response_status = Some(status);
        state.response_headers = Some(headers);
    }

    pub fn response_status(&self) -> Option<u16> {
        self.state.lock().expect("context poisoned").response_status
    }

    pub fn response_headers(&self) -> Option<Headers> {
        self.state
            .lock()
            .expect("context poisoned")
            .response_headers
            .clone()
    }

    // --- interrupts ---

    /// Signal handed to the native request by the executor.
    pub fn interrupt_signal(&self) -> Option<AbortSignal> {
        self.interrupt
            .lock()
            .expect("context poisoned")
            .as_ref()
            .map(InterruptController::signal)
    }

    pub fn interrupt_status(&self) -> InterruptStatus {
        self.interrupt
            .lock()
            .expect("context poisoned")
            .as_ref()
            .map(InterruptController::status)
            .unwrap_or_default()
    }

    /// The error matching the fired interrupt, for tagging native failures.
    pub fn interrupt_error(&self) -> Error {
        self.interrupt_status()
            .error()
            .unwrap_or_else(|| Error::Abort("aborted".into()))
    }

    pub fn abort(&self) {
        self.abort_signal.abort();
    }

    pub fn abort_soft(&self) {
        self.abort_signal.abort_soft();
    }

    // --- execution ---

    /// Idempotent entry point; every caller receives the same outcome.
    pub async fn run(self: &Arc<Self>) -> RequestOutcome {
        if !self.started.swap(true, Ordering::SeqCst) {
            tokio::task::yield_now().await;
            self.launch();
        }
        self.result.wait().await
    }

    pub async fn result(&self) -> RequestOutcome {
        self.result.wait().await
    }

    fn launch(self: &Arc<Self>) {
        self.state.lock().expect("context poisoned").stage = Stage::Started;
        let config = &self.pipeline.config;

        if config.timeout.is_some() || self.has_external_abort {
            let controller =
                InterruptController::new(Some(self.abort_signal.clone()), config.timeout);
            let weak = Arc::downgrade(self);
            controller.on(move |status| {
                if let Some(ctx) = weak.upgrade() {
                    ctx.on_interrupt(status);
                }
            });
            let already = (!controller.alive()).then(|| controller.status());
            *self.interrupt.lock().expect("context poisoned") = Some(controller);
            if let Some(status) = already {
                self.on_interrupt(status);
                return;
            }
        } else if self.abort_signal.is_fired() {
            // No controller, but the caller aborted before the first tick.
            self.on_interrupt(match self.abort_signal.fired() {
                Some(AbortKind::Soft) => InterruptStatus::Soft,
                _ => InterruptStatus::Abort,
            });
            return;
        }

        match config.queue_key.clone() {
            Some(key) => {
                let limit = config.queue_limit.unwrap_or(1) as usize;
                let priority = config.queue_priority.unwrap_or(0);
                let unlink = self.interrupt_signal();
                let ctx = self.clone();
                self.queues.add(&key, limit, priority, unlink, move || async move {
                    ctx.drive().await;
                    Ok(())
                });
            }
            None => {
                let ctx = self.clone();
                tokio::spawn(async move {
                    ctx.drive().await;
                });
            }
        }
    }

    /// Re-enqueue one retry attempt at maximum priority (unordered mode).
    fn enqueue_retry(self: &Arc<Self>) {
        let config = &self.pipeline.config;
        let key = match &config.queue_key {
            Some(key) => key.clone(),
            None => return,
        };
        let limit = config.queue_limit.unwrap_or(1) as usize;
        let unlink = self.interrupt_signal();
        let ctx = self.clone();
        self.queues.add(&key, limit, u32::MAX, unlink, move || async move {
            ctx.drive().await;
            Ok(())
        });
    }

    async fn drive(self: Arc<Self>) {
        self.driving.store(true, Ordering::SeqCst);
        loop {
            match self.execute_once().await {
                Step::Done => break,
                Step::Retry(delay_ms) => {
                    if self.pipeline.config.queue_unordered && self.pipeline.config.queue_key.is_some() {
                        // Release the slot; the retry re-enqueues ahead of
                        // everything else once the delay elapses.
                        let ctx = self.clone();
                        tokio::spawn(async move {
                            if delay_ms > 0 {
                                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                            }
                            ctx.enqueue_retry();
                        });
                        break;
                    }
                    if delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                }
            }
        }
        self.driving.store(false, Ordering::SeqCst);
        self.deliver_handler();
    }

    async fn execute_once(&self) -> Step {
        if self.is_finished() {
            return Step::Done;
        }
        let status = self.interrupt_status();
        if status != InterruptStatus::None {
            self.on_interrupt(status);
            return Step::Done;
        }

        let attempt = {
            let mut state = self.state.lock().expect("context poisoned");
            state.attempt += 1;
            if state.attempt > 1 {
                // Preprocessors see fresh derivations on every retry.
                drop(state);
                self.discard_caches();
                let mut state = self.state.lock().expect("context poisoned");
                state.stage = Stage::Preprocessing;
                state.attempt
            } else {
                state.stage = Stage::Preprocessing;
                state.attempt
            }
        };
        debug!(request_id = self.request_id, attempt, "executing request");

        let input = self.body.clone().unwrap_or(Value::Null);
        let value = match run_chain(&self.pipeline.preprocess, self, input.clone()).await {
            Ok(value) => value,
            Err(error) => return self.fail(input, error).await,
        };
        if self.is_finished() {
            return Step::Done;
        }

        {
            let mut state = self.state.lock().expect("context poisoned");
            state.stage = Stage::Pending;
            state.value = Some(value.clone());
        }
        let executor = match &self.pipeline.executor {
            Some(executor) => executor.clone(),
            None => {
                self.finish_error(Error::MethodAccess("endpoint has no executor".into()));
                return Step::Done;
            }
        };
        let value = match executor.process(self, value.clone()).await {
            Ok(Flow::Next(next)) => next,
            Ok(Flow::Pass) => value,
            Err(error) => {
                if self.is_finished() {
                    return Step::Done;
                }
                let fired = self.interrupt_status() != InterruptStatus::None;
                if !error.is_interrupt() && !fired {
                    let retries = self.pipeline.config.retries.unwrap_or(0);
                    if retries >= attempt {
                        let delay = self
                            .pipeline
                            .config
                            .retry_delay
                            .as_ref()
                            .map(|d| d.delay_ms(attempt))
                            .unwrap_or(0);
                        return Step::Retry(delay);
                    }
                }
                return self.fail(value, error).await;
            }
        };

        // The response is in; only the external abort can still cancel.
        if let Some(controller) = self.interrupt.lock().expect("context poisoned").as_ref() {
            controller.disable_timeout();
        }
        {
            let mut state = self.state.lock().expect("context poisoned");
            state.stage = Stage::Postprocessing;
            state.value = Some(value.clone());
        }
        let value = match run_chain(&self.pipeline.postprocess, self, value.clone()).await {
            Ok(value) => value,
            Err(error) => return self.fail(value, error).await,
        };
        self.finish_ok(value);
        Step::Done
    }

    /// Route a failure through the error chain; recovery finishes ok.
    async fn fail(&self, value: Value, error: Error) -> Step {
        if self.is_finished() {
            return Step::Done;
        }
        match run_error_chain(&self.pipeline.errorprocess, self, value, error).await {
            Ok(recovered) => self.finish_ok(recovered),
            Err(error) => self.finish_error(error),
        }
        Step::Done
    }

    fn finish_ok(&self, value: Value) {
        {
            let mut state = self.state.lock().expect("context poisoned");
            if state.stage == Stage::Finished {
                return;
            }
            state.stage = Stage::Finished;
            state.status = RequestStatus::Ok;
            state.value = Some(value.clone());
        }
        if let Some(controller) = self.interrupt.lock().expect("context poisoned").as_ref() {
            controller.disable();
        }
        self.result.settle(RequestOutcome {
            ok: true,
            value: Some(value),
            error: None,
            request_id: self.request_id,
        });
    }

    fn finish_error(&self, error: Error) {
        let status = match &error {
            Error::Abort(_) => RequestStatus::Aborted,
            Error::Timeout(_) => RequestStatus::Timeout,
            _ => RequestStatus::Error,
        };
        {
            let mut state = self.state.lock().expect("context poisoned");
            if state.stage == Stage::Finished {
                return;
            }
            state.stage = Stage::Finished;
            state.status = status;
            state.error = Some(error.clone());
        }
        if let Some(controller) = self.interrupt.lock().expect("context poisoned").as_ref() {
            controller.disable();
        }
        self.result.settle(RequestOutcome {
            ok: false,
            value: None,
            error: Some(error),
            request_id: self.request_id,
        });
    }

    fn on_interrupt(&self, status: InterruptStatus) {
        {
            let state = self.state.lock().expect("context poisoned");
            if state.stage == Stage::Finished {
                return;
            }
            // Soft aborts only cancel before the response is delivered.
            if status == InterruptStatus::Soft && state.stage >= Stage::Postprocessing {
                return;
            }
        }
        if let Some(error) = status.error() {
            self.finish_error(error);
        }
        if !self.driving.load(Ordering::SeqCst) {
            self.deliver_handler();
        }
    }

    /// Invoke the configured handler exactly once, after the queue slot is
    /// released.
    fn deliver_handler(&self) {
        if !self.is_finished() {
            return;
        }
        if self.handler_done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handler) = &self.pipeline.config.handler {
            if let Some(outcome) = self.result.peek() {
                handler.call(outcome);
            }
        }
    }

    pub fn error(&self) -> Option<Error> {
        self.state.lock().expect("context poisoned").error.clone()
    }
}

fn forward_abort(own: &AbortSignal, kind: AbortKind) {
    match kind {
        AbortKind::Hard => own.abort(),
        AbortKind::Soft => own.abort_soft(),
    }
}
