//! Per-exchange contexts for the multiplexed protocol.
//!
//! An outgoing context lives from send until its first terminal frame
//! (service ack/abort/timeout or response) or a local interrupt; an
//! incoming context lives from request receipt until the reply is sent.

use crate::dispatcher::DispatcherCore;
use crate::error::Error;
use crate::interrupt::{AbortSignal, InterruptController, InterruptStatus};
use crate::promise::SettleCell;
use muxlink_proto::{FileBlob, FrameOptions, MdpPayload, ServiceCode};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Terminal disposition of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangeStatus {
    #[default]
    None,
    Complete,
    Abort,
    Timeout,
    PackError,
    SendError,
    LogicError,
}

/// What settled the exchange: a decoded payload or the protocol-level
/// service frame that provoked the decision.
#[derive(Debug, Clone)]
pub enum ExchangeValue {
    Payload(MdpPayload),
    Service { code: ServiceCode, ref_id: u32 },
}

#[derive(Debug, Clone)]
pub struct ExchangeResult {
    pub ok: bool,
    pub status: ExchangeStatus,
    pub value: Option<ExchangeValue>,
    pub error: Option<Error>,
}

/// What the context is waiting for before it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitKind {
    /// A service-ack is the terminal frame.
    Ack,
    /// A response frame is terminal; a service-ack only settles `ack()`.
    Response,
}

/// Terminal-frame updates routed in by the dispatcher.
#[derive(Debug)]
pub(crate) enum Update {
    Ack,
    Abort,
    Timeout,
    UnknownCode,
    Response(MdpPayload),
}

/// One in-flight outgoing exchange.
pub struct OutgoingContext {
    id: u32,
    endpoint: String,
    wait: WaitKind,
    core: Weak<DispatcherCore>,
    status: Mutex<ExchangeStatus>,
    ack: SettleCell<bool>,
    result: SettleCell<ExchangeResult>,
    interrupt: Mutex<Option<InterruptController>>,
}

impl OutgoingContext {
    pub(crate) fn new_waiting(
        id: u32,
        endpoint: impl Into<String>,
        wait: WaitKind,
        core: Weak<DispatcherCore>,
        pre_acked: bool,
    ) -> Arc<Self> {
        let ctx = Arc::new(Self {
            id,
            endpoint: endpoint.into(),
            wait,
            core,
            status: Mutex::new(ExchangeStatus::None),
            ack: SettleCell::new(),
            result: SettleCell::new(),
            interrupt: Mutex::new(None),
        });
        if pre_acked {
            ctx.ack.settle(true);
        }
        ctx
    }

    /// Context for a send that needed no ack: already complete, carrying a
    /// synthetic service-ack with the sent id.
    pub(crate) fn pre_acked(id: u32, endpoint: impl Into<String>) -> Arc<Self> {
        let ctx = Arc::new(Self {
            id,
            endpoint: endpoint.into(),
            wait: WaitKind::Ack,
            core: Weak::new(),
            status: Mutex::new(ExchangeStatus::Complete),
            ack: SettleCell::new(),
            result: SettleCell::new(),
            interrupt: Mutex::new(None),
        });
        ctx.ack.settle(true);
        ctx.result.settle(ExchangeResult {
            ok: true,
            status: ExchangeStatus::Complete,
            value: Some(ExchangeValue::Service {
                code: ServiceCode::Ack,
                ref_id: id,
            }),
            error: None,
        });
        ctx
    }

    /// Pre-finished error context (pack or send failures). Never enters the
    /// outgoing table and carries no interrupt controller.
    pub(crate) fn pre_failed(
        endpoint: impl Into<String>,
        status: ExchangeStatus,
        error: Error,
    ) -> Arc<Self> {
        let ctx = Arc::new(Self {
            id: 0,
            endpoint: endpoint.into(),
            wait: WaitKind::Ack,
            core: Weak::new(),
            status: Mutex::new(status),
            ack: SettleCell::new(),
            result: SettleCell::new(),
            interrupt: Mutex::new(None),
        });
        ctx.ack.settle(false);
        ctx.result.settle(ExchangeResult {
            ok: false,
            status,
            value: None,
            error: Some(error),
        });
        ctx
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn status(&self) -> ExchangeStatus {
        *self.status.lock().expect("exchange poisoned")
    }

    pub fn is_finished(&self) -> bool {
        self.status() != ExchangeStatus::None
    }

    pub fn ok(&self) -> bool {
        self.result.peek().map(|r| r.ok).unwrap_or(false)
    }

    /// Resolves true on the peer's service-ack, false on failure.
    pub async fn ack(&self) -> bool {
        self.ack.wait().await
    }

    pub async fn result(&self) -> ExchangeResult {
        self.result.wait().await
    }

    /// Abort locally: emits a service-abort for this id and finishes.
    pub fn abort(&self) {
        if self.is_finished() {
            return;
        }
        match self.core.upgrade() {
            Some(core) => core.cancel_outgoing(self.id, InterruptStatus::Abort),
            None => self.finish_local(
                ExchangeStatus::Abort,
                Some(Error::Abort("aborted".into())),
                None,
            ),
        }
    }

    /// Time out locally: emits a service-timeout for this id and finishes.
    pub fn timeout(&self) {
        if self.is_finished() {
            return;
        }
        match self.core.upgrade() {
            Some(core) => core.cancel_outgoing(self.id, InterruptStatus::Timeout),
            None => self.finish_local(
                ExchangeStatus::Timeout,
                Some(Error::Timeout("timed out".into())),
                None,
            ),
        }
    }

    pub(crate) fn install_interrupt(&self, controller: InterruptController) {
        *self.interrupt.lock().expect("exchange poisoned") = Some(controller);
    }

    pub(crate) fn interrupt_status(&self) -> InterruptStatus {
        self.interrupt
            .lock()
            .expect("exchange poisoned")
            .as_ref()
            .map(InterruptController::status)
            .unwrap_or_default()
    }

    /// Handle a frame addressed to this context. Returns true when the
    /// frame was terminal and the dispatcher must drop the table entry.
    pub(crate) fn update(&self, update: Update) -> bool {
        match (self.wait, update) {
            (WaitKind::Ack, Update::Ack) => {
                self.complete(ExchangeValue::Service {
                    code: ServiceCode::Ack,
                    ref_id: self.id,
                });
                true
            }
            (WaitKind::Response, Update::Ack) => {
                self.ack.settle(true);
                false
            }
            (_, Update::Abort) => {
                self.finish_local(
                    ExchangeStatus::Abort,
                    Some(Error::Abort("aborted by peer".into())),
                    Some(ExchangeValue::Service {
                        code: ServiceCode::Abort,
                        ref_id: self.id,
                    }),
                );
                true
            }
            (_, Update::Timeout) => {
                self.finish_local(
                    ExchangeStatus::Timeout,
                    Some(Error::Timeout("timed out by peer".into())),
                    Some(ExchangeValue::Service {
                        code: ServiceCode::Timeout,
                        ref_id: self.id,
                    }),
                );
                true
            }
            (WaitKind::Response, Update::Response(payload)) => {
                self.ack.settle(true);
                self.complete(ExchangeValue::Payload(payload));
                true
            }
            (WaitKind::Ack, Update::Response(_)) | (_, Update::UnknownCode) => {
                self.finish_local(
                    ExchangeStatus::LogicError,
                    Some(Error::Logic("mismatched terminal frame".into())),
                    None,
                );
                true
            }
        }
    }

    fn complete(&self, value: ExchangeValue) {
        {
            let mut status = self.status.lock().expect("exchange poisoned");
            if *status != ExchangeStatus::None {
                return;
            }
            *status = ExchangeStatus::Complete;
        }
        self.disable_interrupt();
        self.ack.settle(true);
        self.result.settle(ExchangeResult {
            ok: true,
            status: ExchangeStatus::Complete,
            value: Some(value),
            error: None,
        });
    }

    /// Terminal failure path; always resolves both promises.
    pub(crate) fn finish_local(
        &self,
        status: ExchangeStatus,
        error: Option<Error>,
        value: Option<ExchangeValue>,
    ) {
        {
            let mut slot = self.status.lock().expect("exchange poisoned");
            if *slot != ExchangeStatus::None {
                return;
            }
            *slot = status;
        }
        self.disable_interrupt();
        self.ack.settle(false);
        self.result.settle(ExchangeResult {
            ok: false,
            status,
            value,
            error,
        });
    }

    fn disable_interrupt(&self) {
        if let Some(controller) = self.interrupt.lock().expect("exchange poisoned").as_ref() {
            controller.disable();
        }
    }
}

/// An incoming request pending a local reply.
pub struct IncomingRequest {
    payload: MdpPayload,
    response_id: u32,
    core: Weak<DispatcherCore>,
    responded: AtomicBool,
    abort: AbortSignal,
    peer_status: Mutex<Option<ServiceCode>>,
}

impl IncomingRequest {
    pub(crate) fn new(payload: MdpPayload, response_id: u32, core: Weak<DispatcherCore>) -> Self {
        Self {
            payload,
            response_id,
            core,
            responded: AtomicBool::new(false),
            abort: AbortSignal::new(),
            peer_status: Mutex::new(None),
        }
    }

    /// The decoded request payload.
    pub fn request(&self) -> &MdpPayload {
        &self.payload
    }

    pub fn endpoint(&self) -> &str {
        &self.payload.endpoint
    }

    /// Pre-assigned id of the reply frame.
    pub fn response_id(&self) -> u32 {
        self.response_id
    }

    /// Fires when the peer cancels this request.
    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    pub fn is_alive(&self) -> bool {
        !self.responded.load(Ordering::SeqCst) && !self.abort.is_fired()
    }

    /// Send the reply. Only the first call goes out.
    pub fn respond(
        &self,
        data: Option<Value>,
        error: Option<Value>,
        files: Option<&BTreeMap<u32, FileBlob>>,
        opts: FrameOptions,
    ) -> crate::error::Result<()> {
        if self.abort.is_fired() {
            return Err(Error::Abort("request was cancelled by the peer".into()));
        }
        if self.responded.swap(true, Ordering::SeqCst) {
            return Err(Error::MethodAccess("request already answered".into()));
        }
        let core = self
            .core
            .upgrade()
            .ok_or_else(|| Error::Connection("dispatcher is gone".into()))?;
        core.send_response(self, data, error, files, opts)
    }

    pub(crate) fn peer_finished(&self, code: ServiceCode) {
        *self.peer_status.lock().expect("incoming poisoned") = Some(code);
        self.abort.abort();
    }

    /// The service code the peer used to cancel, if it did.
    pub fn peer_status(&self) -> Option<ServiceCode> {
        *self.peer_status.lock().expect("incoming poisoned")
    }

    pub(crate) fn request_id(&self) -> u32 {
        self.payload.id
    }
}

impl std::fmt::Debug for IncomingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingRequest")
            .field("endpoint", &self.payload.endpoint)
            .field("request_id", &self.payload.id)
            .field("response_id", &self.response_id)
            .finish()
    }
}
