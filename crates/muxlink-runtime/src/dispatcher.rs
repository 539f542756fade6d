//! Per-connection endpoint dispatcher.
//!
//! Multiplexes outgoing and incoming exchanges over one transport: routes
//! frames by endpoint name, acknowledges on request, reifies incoming
//! requests into reply-ready contexts, and serializes every handler
//! delivery so overlapping events never interleave.

use crate::endpoint::{EndpointDefaults, EndpointEventHandler, EndpointHandle};
use crate::error::{Error, Result};
use crate::exchange::{
    ExchangeStatus, ExchangeValue, IncomingRequest, OutgoingContext, Update, WaitKind,
};
use crate::interrupt::{AbortSignal, InterruptController, InterruptStatus};
use crate::transport::{MessageKind, Transport, TransportEvent};
use dashmap::DashMap;
use muxlink_proto::{
    BinaryBody, BinaryScope, FileBlob, FrameOptions, MdpCodec, MdpFrame, MdpPayload, ServiceCode,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Per-send knobs; endpoint handles inject their own defaults.
#[derive(Debug, Clone, Default)]
pub struct SendControls {
    pub need_ack: bool,
    pub checksum: bool,
    pub timeout: Option<Duration>,
    pub abort: Option<AbortSignal>,
}

impl SendControls {
    pub fn acked() -> Self {
        Self {
            need_ack: true,
            ..Self::default()
        }
    }

    fn frame_options(&self) -> FrameOptions {
        FrameOptions {
            need_ack: self.need_ack,
            checksum: self.checksum,
        }
    }
}

/// Events delivered to the global handler.
#[derive(Debug)]
pub enum DispatchEvent {
    Message(MdpPayload),
    Request(Arc<IncomingRequest>),
    Binary { id: u32, body: BinaryBody },
    /// A frame that matched no context or endpoint.
    Unknown { id: u32, ref_id: Option<u32> },
    Unpack(Error),
    Pack(Error),
    Open,
    Close,
    Error(Error),
    Enable(bool),
}

/// Catch-all sink for unclaimed events. Invocations are serialized: the
/// next event is delivered only after the previous call returns.
#[async_trait::async_trait]
pub trait GlobalHandler: Send + Sync {
    async fn handle(&self, event: DispatchEvent);
}

/// Dispatcher construction options.
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Reply with a service-abort when an expected/streaming announcement
    /// or binary frame finds no enabled endpoint.
    pub auto_abort_unclaimed: bool,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            auto_abort_unclaimed: true,
        }
    }
}

enum Delivery {
    Global(DispatchEvent),
    Message(Arc<EndpointHandle>, MdpPayload),
    Request(Arc<EndpointHandle>, Arc<IncomingRequest>),
    Binary(Arc<EndpointHandle>, u32, BinaryBody),
}

pub(crate) struct DispatcherCore {
    transport: Arc<dyn Transport>,
    mdp: MdpCodec,
    outgoing: DashMap<u32, Arc<OutgoingContext>>,
    incoming: DashMap<u32, Arc<IncomingRequest>>,
    /// Remote request id → local response id.
    incoming_by_request: DashMap<u32, u32>,
    handles: DashMap<String, Arc<EndpointHandle>>,
    binary_endpoint: Mutex<Option<String>>,
    events: mpsc::UnboundedSender<Delivery>,
    options: DispatcherOptions,
    closed: AtomicBool,
}

impl DispatcherCore {
    pub(crate) fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.transport.is_connected()
    }

    fn emit(&self, event: DispatchEvent) {
        let _ = self.events.send(Delivery::Global(event));
    }

    fn send_service(&self, ref_id: u32, own_ref_id: bool, code: ServiceCode) {
        match self.mdp.encode_service(ref_id, own_ref_id, code) {
            Ok((_, buf)) => {
                if let Some(error) = self.transport.send(buf) {
                    self.emit(DispatchEvent::Error(error));
                }
            }
            Err(error) => self.emit(DispatchEvent::Pack(error.into())),
        }
    }

    /// Local cancellation of a registered outgoing exchange: emit the
    /// matching service frame (our own id, so `own_ref_id` is set), then
    /// finish the context.
    pub(crate) fn cancel_outgoing(&self, id: u32, status: InterruptStatus) {
        let Some((_, ctx)) = self.outgoing.remove(&id) else {
            return;
        };
        let (code, exchange_status) = match status {
            InterruptStatus::Timeout => (ServiceCode::Timeout, ExchangeStatus::Timeout),
            _ => (ServiceCode::Abort, ExchangeStatus::Abort),
        };
        self.send_service(id, true, code);
        ctx.finish_local(exchange_status, status.error(), None);
    }

    /// Abort every registered outgoing exchange for one endpoint name.
    pub(crate) fn cancel_endpoint(&self, endpoint: &str) {
        let ids: Vec<u32> = self
            .outgoing
            .iter()
            .filter(|entry| entry.value().endpoint() == endpoint)
            .map(|entry| *entry.key())
            .collect();
        for id in ids {
            self.cancel_outgoing(id, InterruptStatus::Abort);
        }
    }

    pub(crate) fn remove_handle(&self, name: &str) {
        self.handles.remove(name);
    }

    pub(crate) fn send_response(
        &self,
        request: &IncomingRequest,
        data: Option<Value>,
        error: Option<Value>,
        files: Option<&BTreeMap<u32, FileBlob>>,
        opts: FrameOptions,
    ) -> Result<()> {
        let buf = self.mdp.encode_response_with_id(
            request.response_id(),
            request.request_id(),
            request.endpoint(),
            data,
            error,
            files,
            opts,
        )?;
        self.incoming.remove(&request.response_id());
        self.incoming_by_request.remove(&request.request_id());
        self.transport.send_or_throw(buf)
    }

    // --- incoming routing ---

    fn on_receive(self: &Arc<Self>, kind: MessageKind, buf: Vec<u8>) {
        if kind != MessageKind::Binary {
            self.emit(DispatchEvent::Error(Error::Receive(
                "unexpected non-binary transport message".into(),
            )));
            return;
        }
        let frame = match self.mdp.decode(&buf) {
            Ok(frame) => frame,
            Err(error) => {
                self.emit(DispatchEvent::Unpack(error.into()));
                return;
            }
        };
        trace!(?frame, "frame received");

        // Acks go out before any higher-level delivery.
        let (id, need_ack) = match &frame {
            MdpFrame::Service { .. } => (0, false),
            MdpFrame::Message(p) | MdpFrame::Request(p) => (p.id, p.need_ack),
            MdpFrame::Response { payload, .. } => (payload.id, payload.need_ack),
            MdpFrame::Binary { id, body } => (*id, body.need_ack),
        };
        if need_ack {
            self.send_service(id, false, ServiceCode::Ack);
        }

        match frame {
            MdpFrame::Service {
                id,
                ref_id,
                own_ref_id,
                code,
            } => self.route_service(id, ref_id, own_ref_id, code),
            MdpFrame::Message(payload) => self.route_message(payload),
            MdpFrame::Request(payload) => self.route_request(payload),
            MdpFrame::Response { ref_id, payload } => self.route_response(ref_id, payload),
            MdpFrame::Binary { id, body } => self.route_binary(id, body),
        }
    }

    fn route_service(self: &Arc<Self>, id: u32, ref_id: u32, own_ref_id: bool, code: ServiceCode) {
        if code == ServiceCode::Ping {
            self.send_service(id, false, ServiceCode::Ack);
            return;
        }
        if own_ref_id {
            // The peer references its own id: one of our incoming requests.
            if matches!(code, ServiceCode::Abort | ServiceCode::Timeout) {
                if let Some(response_id) = self.incoming_by_request.get(&ref_id).map(|e| *e) {
                    if let Some((_, request)) = self.incoming.remove(&response_id) {
                        self.incoming_by_request.remove(&ref_id);
                        debug!(ref_id, ?code, "peer cancelled incoming request");
                        request.peer_finished(code);
                        return;
                    }
                }
            }
            self.emit(DispatchEvent::Unknown {
                id,
                ref_id: Some(ref_id),
            });
            return;
        }
        // The peer references an id we allocated: an outgoing exchange.
        let Some(ctx) = self.outgoing.get(&ref_id).map(|e| e.value().clone()) else {
            self.emit(DispatchEvent::Unknown {
                id,
                ref_id: Some(ref_id),
            });
            return;
        };
        let update = match code {
            ServiceCode::Ack => Update::Ack,
            ServiceCode::Abort => Update::Abort,
            ServiceCode::Timeout => Update::Timeout,
            _ => Update::UnknownCode,
        };
        if ctx.update(update) {
            self.outgoing.remove(&ref_id);
        }
    }

    fn route_message(self: &Arc<Self>, payload: MdpPayload) {
        let handle = self
            .handles
            .get(&payload.endpoint)
            .map(|e| e.value().clone())
            .filter(|h| h.is_enabled());
        match handle {
            Some(handle) => {
                let _ = self.events.send(Delivery::Message(handle, payload));
            }
            None => {
                if self.options.auto_abort_unclaimed
                    && (payload.expected.is_some() || payload.streaming)
                {
                    self.send_service(payload.id, false, ServiceCode::Abort);
                }
                self.emit(DispatchEvent::Message(payload));
            }
        }
    }

    fn route_request(self: &Arc<Self>, payload: MdpPayload) {
        let response_id = self.mdp.next_id();
        let request = Arc::new(IncomingRequest::new(
            payload.clone(),
            response_id,
            Arc::downgrade(self),
        ));
        self.incoming.insert(response_id, request.clone());
        self.incoming_by_request.insert(payload.id, response_id);

        let handle = self
            .handles
            .get(&payload.endpoint)
            .map(|e| e.value().clone())
            .filter(|h| h.is_enabled());
        match handle {
            Some(handle) => {
                let _ = self.events.send(Delivery::Request(handle, request));
            }
            None => self.emit(DispatchEvent::Request(request)),
        }
    }

    fn route_response(self: &Arc<Self>, ref_id: u32, payload: MdpPayload) {
        let Some(ctx) = self.outgoing.get(&ref_id).map(|e| e.value().clone()) else {
            self.emit(DispatchEvent::Unknown {
                id: payload.id,
                ref_id: Some(ref_id),
            });
            return;
        };
        if ctx.update(Update::Response(payload)) {
            self.outgoing.remove(&ref_id);
        }
    }

    fn route_binary(self: &Arc<Self>, id: u32, body: BinaryBody) {
        let reserved = self
            .binary_endpoint
            .lock()
            .expect("binary endpoint poisoned")
            .clone();
        let handle = reserved
            .and_then(|name| self.handles.get(&name).map(|e| e.value().clone()))
            .filter(|h| h.is_enabled());
        match handle {
            Some(handle) => {
                let _ = self.events.send(Delivery::Binary(handle, id, body));
            }
            None => {
                if self.options.auto_abort_unclaimed {
                    self.send_service(body.ref_id, false, ServiceCode::Abort);
                }
                self.emit(DispatchEvent::Binary { id, body });
            }
        }
    }

    // --- outgoing operations (shared by the dispatcher and handles) ---

    pub(crate) fn ping(self: &Arc<Self>, controls: SendControls) -> Arc<OutgoingContext> {
        match self.mdp.encode_ping() {
            Ok((id, buf)) => self.launch(id, "", WaitKind::Ack, true, false, buf, controls),
            Err(error) => OutgoingContext::pre_failed("", ExchangeStatus::PackError, error.into()),
        }
    }

    pub(crate) fn send_message_op(
        self: &Arc<Self>,
        endpoint: &str,
        data: Option<Value>,
        files: Option<&BTreeMap<u32, FileBlob>>,
        controls: SendControls,
    ) -> Arc<OutgoingContext> {
        let opts = controls.frame_options();
        match self.mdp.encode_message(endpoint, data, files, opts) {
            Ok((id, buf)) => self.launch(
                id,
                endpoint,
                WaitKind::Ack,
                controls.need_ack,
                !controls.need_ack,
                buf,
                controls,
            ),
            Err(error) => {
                OutgoingContext::pre_failed(endpoint, ExchangeStatus::PackError, error.into())
            }
        }
    }

    pub(crate) fn message_lite_op(
        &self,
        endpoint: &str,
        data: Option<Value>,
        files: Option<&BTreeMap<u32, FileBlob>>,
    ) -> Option<u32> {
        let (id, buf) = self
            .mdp
            .encode_message(endpoint, data, files, FrameOptions::default())
            .ok()?;
        self.transport.send(buf).is_none().then_some(id)
    }

    pub(crate) fn announce_op(
        self: &Arc<Self>,
        endpoint: &str,
        data: Option<Value>,
        filemap: Option<Vec<(u32, String, String)>>,
        expected: Option<BTreeSet<u32>>,
        controls: SendControls,
    ) -> Arc<OutgoingContext> {
        let opts = controls.frame_options();
        match self.mdp.encode_announce(endpoint, data, filemap, expected, opts) {
            Ok((id, buf)) => self.launch(
                id,
                endpoint,
                WaitKind::Ack,
                controls.need_ack,
                !controls.need_ack,
                buf,
                controls,
            ),
            Err(error) => {
                OutgoingContext::pre_failed(endpoint, ExchangeStatus::PackError, error.into())
            }
        }
    }

    pub(crate) fn announce_lite_op(
        &self,
        endpoint: &str,
        data: Option<Value>,
        filemap: Option<Vec<(u32, String, String)>>,
        expected: Option<BTreeSet<u32>>,
    ) -> Option<u32> {
        let (id, buf) = self
            .mdp
            .encode_announce(endpoint, data, filemap, expected, FrameOptions::default())
            .ok()?;
        self.transport.send(buf).is_none().then_some(id)
    }

    pub(crate) fn send_binary_op(
        self: &Arc<Self>,
        ref_id: u32,
        scope: BinaryScope,
        bin: Option<Vec<u8>>,
        last: bool,
        controls: SendControls,
    ) -> Arc<OutgoingContext> {
        let opts = controls.frame_options();
        match self.mdp.encode_binary_chunk(ref_id, scope, bin, last, opts) {
            Ok((id, buf)) => self.launch(
                id,
                "",
                WaitKind::Ack,
                controls.need_ack,
                !controls.need_ack,
                buf,
                controls,
            ),
            Err(error) => OutgoingContext::pre_failed("", ExchangeStatus::PackError, error.into()),
        }
    }

    pub(crate) fn binary_lite_op(
        &self,
        ref_id: u32,
        scope: BinaryScope,
        bin: Option<Vec<u8>>,
        last: bool,
    ) -> Option<u32> {
        let (id, buf) = self
            .mdp
            .encode_binary_chunk(ref_id, scope, bin, last, FrameOptions::default())
            .ok()?;
        self.transport.send(buf).is_none().then_some(id)
    }

    pub(crate) fn request_op(
        self: &Arc<Self>,
        endpoint: &str,
        data: Option<Value>,
        files: Option<&BTreeMap<u32, FileBlob>>,
        controls: SendControls,
    ) -> Arc<OutgoingContext> {
        let opts = controls.frame_options();
        match self.mdp.encode_request(endpoint, data, files, opts) {
            Ok((id, buf)) => self.launch(
                id,
                endpoint,
                WaitKind::Response,
                true,
                !controls.need_ack,
                buf,
                controls,
            ),
            Err(error) => {
                OutgoingContext::pre_failed(endpoint, ExchangeStatus::PackError, error.into())
            }
        }
    }

    /// Shared tail of every send: register the context if the exchange
    /// waits for the peer, install its interrupt controller, send the
    /// frame. Pack and send failures yield pre-finished contexts.
    #[allow(clippy::too_many_arguments)]
    fn launch(
        self: &Arc<Self>,
        id: u32,
        endpoint: &str,
        wait: WaitKind,
        register: bool,
        pre_acked: bool,
        buf: Vec<u8>,
        controls: SendControls,
    ) -> Arc<OutgoingContext> {
        if !register {
            return match self.transport.send(buf) {
                Some(error) => {
                    OutgoingContext::pre_failed(endpoint, ExchangeStatus::SendError, error)
                }
                None => OutgoingContext::pre_acked(id, endpoint),
            };
        }

        let ctx =
            OutgoingContext::new_waiting(id, endpoint, wait, Arc::downgrade(self), pre_acked);
        if controls.timeout.is_some() || controls.abort.is_some() {
            let controller = InterruptController::new(controls.abort.clone(), controls.timeout);
            let core = Arc::downgrade(self);
            let ctx_weak = Arc::downgrade(&ctx);
            controller.on(move |status| {
                if let Some(core) = core.upgrade() {
                    core.cancel_outgoing(id, status);
                } else if let Some(ctx) = ctx_weak.upgrade() {
                    ctx.finish_local(
                        match status {
                            InterruptStatus::Timeout => ExchangeStatus::Timeout,
                            _ => ExchangeStatus::Abort,
                        },
                        status.error(),
                        None,
                    );
                }
            });
            ctx.install_interrupt(controller);
        }
        self.outgoing.insert(id, ctx.clone());

        if let Some(error) = self.transport.send(buf) {
            self.outgoing.remove(&id);
            warn!(id, %error, "frame send failed");
            ctx.finish_local(ExchangeStatus::SendError, Some(error), None);
            return ctx;
        }
        // An interrupt firing before the table insert would have found
        // nothing to cancel; settle it now.
        let fired = ctx.interrupt_status();
        if fired != InterruptStatus::None && !ctx.is_finished() {
            self.cancel_outgoing(id, fired);
        }
        ctx
    }

    fn fail_all(&self, error: Error) {
        let ids: Vec<u32> = self.outgoing.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, ctx)) = self.outgoing.remove(&id) {
                ctx.finish_local(ExchangeStatus::Abort, Some(error.clone()), None);
            }
        }
        let response_ids: Vec<u32> = self.incoming.iter().map(|e| *e.key()).collect();
        for response_id in response_ids {
            if let Some((_, request)) = self.incoming.remove(&response_id) {
                self.incoming_by_request.remove(&request.request_id());
                request.peer_finished(ServiceCode::Abort);
            }
        }
    }
}

/// Public face of the dispatcher.
pub struct Dispatcher {
    core: Arc<DispatcherCore>,
    global: Arc<Mutex<Option<Arc<dyn GlobalHandler>>>>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, mdp: MdpCodec, options: DispatcherOptions) -> Self {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Delivery>();
        let core = Arc::new(DispatcherCore {
            transport,
            mdp,
            outgoing: DashMap::new(),
            incoming: DashMap::new(),
            incoming_by_request: DashMap::new(),
            handles: DashMap::new(),
            binary_endpoint: Mutex::new(None),
            events: events_tx,
            options,
            closed: AtomicBool::new(false),
        });

        let global: Arc<Mutex<Option<Arc<dyn GlobalHandler>>>> = Arc::new(Mutex::new(None));
        {
            // Serialized delivery worker: one event at a time, in transport
            // order.
            let global = global.clone();
            tokio::spawn(async move {
                while let Some(delivery) = events_rx.recv().await {
                    match delivery {
                        Delivery::Global(event) => {
                            let handler = global.lock().expect("global handler poisoned").clone();
                            match handler {
                                Some(handler) => handler.handle(event).await,
                                None => trace!(?event, "unhandled dispatcher event"),
                            }
                        }
                        Delivery::Message(handle, payload) => {
                            handle.handler().on_message(payload).await;
                        }
                        Delivery::Request(handle, request) => {
                            handle.handler().on_request(request).await;
                        }
                        Delivery::Binary(handle, id, body) => {
                            handle.handler().on_binary(id, body).await;
                        }
                    }
                }
            });
        }

        {
            let weak = Arc::downgrade(&core);
            core.transport
                .change_receive_handler(Some(Box::new(move |kind, buf| {
                    if let Some(core) = weak.upgrade() {
                        core.on_receive(kind, buf);
                    }
                })));
        }
        {
            let weak = Arc::downgrade(&core);
            core.transport
                .change_state_handler(Some(Box::new(move |event, error| {
                    let Some(core) = weak.upgrade() else { return };
                    match event {
                        TransportEvent::Open => core.emit(DispatchEvent::Open),
                        TransportEvent::Close => {
                            core.fail_all(Error::Connection("transport closed".into()));
                            core.emit(DispatchEvent::Close);
                        }
                        TransportEvent::Error => core.emit(DispatchEvent::Error(
                            error.unwrap_or_else(|| Error::Connection("transport error".into())),
                        )),
                        TransportEvent::Type => core.emit(DispatchEvent::Error(Error::Receive(
                            "peer sent an unexpected message type".into(),
                        ))),
                    }
                })));
        }

        Self { core, global }
    }

    pub fn change_global_handler(&self, handler: Option<Arc<dyn GlobalHandler>>) {
        *self.global.lock().expect("global handler poisoned") = handler;
    }

    pub fn is_alive(&self) -> bool {
        self.core.is_alive()
    }

    /// Enable or disable the underlying transport, notifying the handler.
    pub fn enable(&self, on: bool) {
        self.core.transport.enable(on);
        self.core.emit(DispatchEvent::Enable(on));
    }

    /// Abort everything in flight and detach from the transport.
    pub fn close(&self) {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.core
            .fail_all(Error::Connection("dispatcher closed".into()));
        for entry in self.core.handles.iter() {
            entry.value().mark_closed();
        }
        self.core.handles.clear();
        self.core.transport.change_receive_handler(None);
        self.core.transport.change_state_handler(None);
    }

    // --- endpoint handles ---

    pub fn register_endpoint(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn EndpointEventHandler>,
        defaults: EndpointDefaults,
    ) -> Result<Arc<EndpointHandle>> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::Configure("endpoint name must be non-empty".into()));
        }
        if self.core.handles.contains_key(&name) {
            return Err(Error::Configure(format!(
                "endpoint '{}' is already registered",
                name
            )));
        }
        let handle = Arc::new(EndpointHandle::new(
            name.clone(),
            Arc::downgrade(&self.core),
            handler,
            defaults,
        ));
        self.core.handles.insert(name, handle.clone());
        Ok(handle)
    }

    /// Route incoming binary frames to this endpoint's handle.
    pub fn set_binary_endpoint(&self, name: Option<String>) {
        *self
            .core
            .binary_endpoint
            .lock()
            .expect("binary endpoint poisoned") = name;
    }

    // --- outgoing operations ---

    pub fn ping(&self, controls: SendControls) -> Arc<OutgoingContext> {
        self.core.ping(controls)
    }

    pub fn send_message(
        &self,
        endpoint: &str,
        data: Option<Value>,
        files: Option<&BTreeMap<u32, FileBlob>>,
        controls: SendControls,
    ) -> Arc<OutgoingContext> {
        self.core.send_message_op(endpoint, data, files, controls)
    }

    /// Fire-and-forget form: just the sent id, or none on failure.
    pub fn message_lite(
        &self,
        endpoint: &str,
        data: Option<Value>,
        files: Option<&BTreeMap<u32, FileBlob>>,
    ) -> Option<u32> {
        self.core.message_lite_op(endpoint, data, files)
    }

    /// Announce follow-up binary frames under a known key set, or
    /// open-ended when `expected` is none.
    pub fn announce(
        &self,
        endpoint: &str,
        data: Option<Value>,
        filemap: Option<Vec<(u32, String, String)>>,
        expected: Option<BTreeSet<u32>>,
        controls: SendControls,
    ) -> Arc<OutgoingContext> {
        self.core
            .announce_op(endpoint, data, filemap, expected, controls)
    }

    pub fn announce_lite(
        &self,
        endpoint: &str,
        data: Option<Value>,
        filemap: Option<Vec<(u32, String, String)>>,
        expected: Option<BTreeSet<u32>>,
    ) -> Option<u32> {
        self.core.announce_lite_op(endpoint, data, filemap, expected)
    }

    pub fn send_binary(
        &self,
        ref_id: u32,
        scope: BinaryScope,
        bin: Option<Vec<u8>>,
        last: bool,
        controls: SendControls,
    ) -> Arc<OutgoingContext> {
        self.core.send_binary_op(ref_id, scope, bin, last, controls)
    }

    pub fn binary_lite(
        &self,
        ref_id: u32,
        scope: BinaryScope,
        bin: Option<Vec<u8>>,
        last: bool,
    ) -> Option<u32> {
        self.core.binary_lite_op(ref_id, scope, bin, last)
    }

    /// Request/response exchange. The context's `ack()` resolves on the
    /// peer's service-ack, `result()` on the response frame.
    pub fn request(
        &self,
        endpoint: &str,
        data: Option<Value>,
        files: Option<&BTreeMap<u32, FileBlob>>,
        controls: SendControls,
    ) -> Arc<OutgoingContext> {
        self.core.request_op(endpoint, data, files, controls)
    }

    pub fn outgoing_len(&self) -> usize {
        self.core.outgoing.len()
    }

    pub fn incoming_len(&self) -> usize {
        self.core.incoming.len()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PairTransport;
    use muxlink_proto::MfpCodec;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn dispatcher_over(transport: PairTransport) -> Dispatcher {
        Dispatcher::new(
            Arc::new(transport),
            MdpCodec::new(MfpCodec::new()),
            DispatcherOptions::default(),
        )
    }

    fn pair() -> (Dispatcher, Dispatcher) {
        let (left, right) = PairTransport::pair();
        (dispatcher_over(left), dispatcher_over(right))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[derive(Default)]
    struct CollectingHandler {
        events: Mutex<Vec<String>>,
        notify: Notify,
    }

    impl CollectingHandler {
        fn names(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl GlobalHandler for CollectingHandler {
        async fn handle(&self, event: DispatchEvent) {
            let name = match &event {
                DispatchEvent::Message(p) => format!("message:{}", p.endpoint),
                DispatchEvent::Request(r) => format!("request:{}", r.endpoint()),
                DispatchEvent::Binary { .. } => "binary".to_string(),
                DispatchEvent::Unknown { ref_id, .. } => {
                    format!("unknown:{}", ref_id.unwrap_or(0))
                }
                DispatchEvent::Unpack(_) => "unpack".to_string(),
                DispatchEvent::Pack(_) => "pack".to_string(),
                DispatchEvent::Open => "open".to_string(),
                DispatchEvent::Close => "close".to_string(),
                DispatchEvent::Error(_) => "error".to_string(),
                DispatchEvent::Enable(on) => format!("enable:{}", on),
            };
            self.events.lock().unwrap().push(name);
            self.notify.notify_waiters();
        }
    }

    /// Endpoint handler that answers calculator requests, echoing division
    /// errors the way a real peer would.
    struct Calculator;

    #[async_trait::async_trait]
    impl crate::endpoint::EndpointEventHandler for Calculator {
        async fn on_request(&self, request: Arc<IncomingRequest>) {
            let data = request.request().data.clone().unwrap_or(Value::Null);
            let v1 = data["value1"].as_f64().unwrap_or(0.0);
            let v2 = data["value2"].as_f64().unwrap_or(0.0);
            let op = data["operation"].as_str().unwrap_or("+");
            let (data, error) = match op {
                "/" if v2 == 0.0 => (
                    Some(Value::Null),
                    Some(json!({"message": "division by zero"})),
                ),
                "/" => (Some(json!({"result": v1 / v2})), None),
                _ => (Some(json!({"result": v1 + v2})), None),
            };
            request
                .respond(data, error, None, FrameOptions::default())
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_ping_resolves_on_peer_ack() {
        let (left, _right) = pair();
        let ctx = left.ping(SendControls::default());
        let result = ctx.result().await;
        assert!(result.ok);
        assert_eq!(result.status, ExchangeStatus::Complete);
        assert!(ctx.ack().await);
        assert_eq!(left.outgoing_len(), 0);
    }

    #[tokio::test]
    async fn test_message_without_ack_is_pre_resolved() {
        let (left, _right) = pair();
        let ctx = left.send_message("news", Some(json!({"n": 1})), None, SendControls::default());
        assert!(ctx.is_finished());
        assert!(ctx.ack().await);
        let result = ctx.result().await;
        assert!(result.ok);
        assert!(matches!(
            result.value,
            Some(ExchangeValue::Service { code: ServiceCode::Ack, .. })
        ));
    }

    #[tokio::test]
    async fn test_message_with_ack_waits_for_peer() {
        let (left, right) = pair();
        let handler = Arc::new(CollectingHandler::default());
        right.change_global_handler(Some(handler.clone()));
        let ctx = left.send_message("news", Some(json!({"n": 1})), None, SendControls::acked());
        assert!(!ctx.is_finished());
        assert!(ctx.ack().await);
        let result = ctx.result().await;
        assert!(result.ok);
        settle().await;
        assert_eq!(handler.names(), vec!["message:news"]);
    }

    #[tokio::test]
    async fn test_calculator_request_response() {
        let (left, right) = pair();
        right
            .register_endpoint("calculator", Arc::new(Calculator), EndpointDefaults::default())
            .unwrap();

        let ctx = left.request(
            "calculator",
            Some(json!({"value1": 6.0, "value2": 2.0, "operation": "/"})),
            None,
            SendControls::acked(),
        );
        assert!(ctx.ack().await);
        let result = ctx.result().await;
        assert!(result.ok);
        match result.value {
            Some(ExchangeValue::Payload(payload)) => {
                assert_eq!(payload.data, Some(json!({"result": 3.0})));
                assert!(payload.error.is_none());
            }
            other => panic!("expected payload, got {:?}", other),
        }
        assert_eq!(left.outgoing_len(), 0);
        assert_eq!(right.incoming_len(), 0);
    }

    #[tokio::test]
    async fn test_peer_error_field_still_completes() {
        let (left, right) = pair();
        right
            .register_endpoint("calculator", Arc::new(Calculator), EndpointDefaults::default())
            .unwrap();

        let ctx = left.request(
            "calculator",
            Some(json!({"value1": 6.0, "value2": 0.0, "operation": "/"})),
            None,
            SendControls::default(),
        );
        let result = ctx.result().await;
        // The exchange itself succeeded; the error travels in the payload.
        assert!(result.ok);
        match result.value {
            Some(ExchangeValue::Payload(payload)) => {
                assert_eq!(payload.data, Some(Value::Null));
                let message = payload.error.unwrap()["message"].as_str().unwrap().to_string();
                assert!(!message.is_empty());
            }
            other => panic!("expected payload, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_without_need_ack_has_pre_resolved_ack() {
        let (left, right) = pair();
        right
            .register_endpoint("calculator", Arc::new(Calculator), EndpointDefaults::default())
            .unwrap();
        let ctx = left.request("calculator", Some(json!({})), None, SendControls::default());
        assert!(ctx.ack().await);
        assert!(ctx.result().await.ok);
    }

    #[tokio::test]
    async fn test_abort_after_ack_emits_service_abort() {
        struct Sink;

        #[async_trait::async_trait]
        impl crate::endpoint::EndpointEventHandler for Sink {
            async fn on_request(&self, _request: Arc<IncomingRequest>) {
                // Never responds; the requester cancels.
            }
        }

        let (left, right) = pair();
        right
            .register_endpoint("slow", Arc::new(Sink), EndpointDefaults::default())
            .unwrap();

        let ctx = left.request("slow", Some(json!({})), None, SendControls::acked());
        assert!(ctx.ack().await);
        assert_eq!(right.incoming_len(), 1);

        ctx.abort();
        let result = ctx.result().await;
        assert!(!result.ok);
        assert_eq!(result.status, ExchangeStatus::Abort);
        assert!(matches!(result.error, Some(Error::Abort(_))));
        assert_eq!(left.outgoing_len(), 0);

        // The peer's incoming context was cancelled by the service-abort.
        settle().await;
        assert_eq!(right.incoming_len(), 0);
    }

    #[tokio::test]
    async fn test_second_terminal_frame_is_unknown() {
        // Raw peer so we can hand-craft duplicate responses.
        let (left_transport, right_transport) = PairTransport::pair();
        let left = dispatcher_over(left_transport);
        let handler = Arc::new(CollectingHandler::default());
        left.change_global_handler(Some(handler.clone()));
        let peer = MdpCodec::new(MfpCodec::new());

        let ctx = left.request("calc", Some(json!({})), None, SendControls::default());
        let request_id = ctx.id();
        settle().await;

        let response = peer
            .encode_response_with_id(
                50,
                request_id,
                "calc",
                Some(json!({"ok": 1})),
                None,
                None,
                FrameOptions::default(),
            )
            .unwrap();
        right_transport.send(response.clone());
        let result = ctx.result().await;
        assert!(result.ok);

        // Duplicate terminal frame: the context must not be disturbed.
        let duplicate = peer
            .encode_response_with_id(
                51,
                request_id,
                "calc",
                Some(json!({"ok": 2})),
                None,
                None,
                FrameOptions::default(),
            )
            .unwrap();
        right_transport.send(duplicate);
        settle().await;
        assert_eq!(handler.names(), vec![format!("unknown:{}", request_id)]);
        assert_eq!(ctx.result().await.ok, true);
        match ctx.result().await.value {
            Some(ExchangeValue::Payload(p)) => assert_eq!(p.data, Some(json!({"ok": 1}))),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_timeout_emits_service_timeout() {
        struct Sink;

        #[async_trait::async_trait]
        impl crate::endpoint::EndpointEventHandler for Sink {
            async fn on_request(&self, _request: Arc<IncomingRequest>) {}
        }

        let (left, right) = pair();
        right
            .register_endpoint("slow", Arc::new(Sink), EndpointDefaults::default())
            .unwrap();

        let controls = SendControls {
            timeout: Some(Duration::from_millis(50)),
            ..SendControls::default()
        };
        let ctx = left.request("slow", Some(json!({})), None, controls);
        let result = ctx.result().await;
        assert!(!result.ok);
        assert_eq!(result.status, ExchangeStatus::Timeout);
        assert!(matches!(result.error, Some(Error::Timeout(_))));
        settle().await;
        assert_eq!(right.incoming_len(), 0);
    }

    #[tokio::test]
    async fn test_unclaimed_message_goes_to_global_handler() {
        let (left, right) = pair();
        let handler = Arc::new(CollectingHandler::default());
        right.change_global_handler(Some(handler.clone()));
        left.send_message("nobody", Some(json!(1)), None, SendControls::default());
        settle().await;
        assert_eq!(handler.names(), vec!["message:nobody"]);
    }

    #[tokio::test]
    async fn test_disabled_handle_falls_back_to_global() {
        struct Sink;

        #[async_trait::async_trait]
        impl crate::endpoint::EndpointEventHandler for Sink {}

        let (left, right) = pair();
        let handle = right
            .register_endpoint("news", Arc::new(Sink), EndpointDefaults::default())
            .unwrap();
        handle.enable(false);
        let handler = Arc::new(CollectingHandler::default());
        right.change_global_handler(Some(handler.clone()));
        left.send_message("news", Some(json!(1)), None, SendControls::default());
        settle().await;
        assert_eq!(handler.names(), vec!["message:news"]);
    }

    #[tokio::test]
    async fn test_unclaimed_announce_is_auto_aborted() {
        let (left, _right) = pair();
        let handler = Arc::new(CollectingHandler::default());
        left.change_global_handler(Some(handler.clone()));
        let ctx = left.announce(
            "files.copy",
            None,
            Some(vec![(0, "a.bin".into(), "application/octet-stream".into())]),
            Some([0u32].into_iter().collect()),
            SendControls::default(),
        );
        // Fire-and-forget announce: complete locally, while the peer's
        // auto-abort surfaces as an unknown-context event.
        assert!(ctx.result().await.ok);
        settle().await;
        assert_eq!(handler.names(), vec![format!("unknown:{}", ctx.id())]);
    }

    #[tokio::test]
    async fn test_announce_then_binary_stream_reassembles() {
        /// Collects announced files and reports them back as a
        /// `files.copy` message once the stream finishes.
        struct FileCollector {
            pending: Mutex<BTreeMap<u32, (String, String, Vec<u8>)>>,
            core: Mutex<Option<Weak<DispatcherCore>>>,
        }

        #[async_trait::async_trait]
        impl crate::endpoint::EndpointEventHandler for FileCollector {
            async fn on_message(&self, payload: MdpPayload) {
                let mut pending = self.pending.lock().unwrap();
                for (key, name, mime) in payload.filemap.unwrap_or_default() {
                    pending.insert(key, (name, mime, Vec::new()));
                }
            }

            async fn on_binary(&self, _id: u32, body: BinaryBody) {
                let done = {
                    let mut pending = self.pending.lock().unwrap();
                    if let Some(key) = body.scope.key() {
                        if let (Some(slot), Some(bin)) = (pending.get_mut(&key), &body.bin) {
                            slot.2.extend_from_slice(bin);
                        }
                    }
                    body.last
                };
                if done {
                    let files: BTreeMap<u32, FileBlob> = self
                        .pending
                        .lock()
                        .unwrap()
                        .iter()
                        .map(|(key, (name, mime, bin))| {
                            (
                                *key,
                                FileBlob {
                                    name: name.clone(),
                                    mime: mime.clone(),
                                    bin: bin.clone(),
                                },
                            )
                        })
                        .collect();
                    if let Some(core) = self.core.lock().unwrap().clone().and_then(|w| w.upgrade())
                    {
                        core.message_lite_op("files.copy", None, Some(&files));
                    }
                }
            }
        }

        let (left, right) = pair();
        let collector = Arc::new(FileCollector {
            pending: Mutex::new(BTreeMap::new()),
            core: Mutex::new(None),
        });
        *collector.core.lock().unwrap() = Some(Arc::downgrade(&right.core));
        right
            .register_endpoint("files.recv", collector.clone(), EndpointDefaults::default())
            .unwrap();
        right.set_binary_endpoint(Some("files.recv".into()));

        let received: Arc<Mutex<Option<BTreeMap<u32, FileBlob>>>> = Arc::new(Mutex::new(None));
        struct CopyHandler(Arc<Mutex<Option<BTreeMap<u32, FileBlob>>>>);

        #[async_trait::async_trait]
        impl GlobalHandler for CopyHandler {
            async fn handle(&self, event: DispatchEvent) {
                if let DispatchEvent::Message(payload) = event {
                    if payload.endpoint == "files.copy" {
                        *self.0.lock().unwrap() = payload.files;
                    }
                }
            }
        }
        left.change_global_handler(Some(Arc::new(CopyHandler(received.clone()))));

        // Announce one expected file, stream it in two chunks, finish.
        let original = vec![7u8; 100];
        let announce = left.announce(
            "files.recv",
            None,
            Some(vec![(0, "dump.bin".into(), "application/octet-stream".into())]),
            Some([0u32].into_iter().collect()),
            SendControls::acked(),
        );
        assert!(announce.ack().await);
        let announce_id = announce.id();
        left.binary_lite(announce_id, BinaryScope::Expected(0), Some(original[..60].to_vec()), false)
            .unwrap();
        left.binary_lite(announce_id, BinaryScope::Expected(0), Some(original[60..].to_vec()), false)
            .unwrap();
        left.binary_lite(announce_id, BinaryScope::Expected(0), None, true)
            .unwrap();

        settle().await;
        settle().await;
        let received = received.lock().unwrap().clone();
        let files = received.expect("files.copy message not delivered");
        assert_eq!(files[&0].bin, original);
        assert_eq!(files[&0].name, "dump.bin");
    }

    #[tokio::test]
    async fn test_global_handler_serialized_in_order() {
        struct SlowFirst {
            order: Arc<Mutex<Vec<String>>>,
        }

        #[async_trait::async_trait]
        impl GlobalHandler for SlowFirst {
            async fn handle(&self, event: DispatchEvent) {
                if let DispatchEvent::Message(payload) = event {
                    self.order.lock().unwrap().push(format!("start:{}", payload.endpoint));
                    if payload.endpoint == "first" {
                        tokio::time::sleep(Duration::from_millis(60)).await;
                    }
                    self.order.lock().unwrap().push(format!("end:{}", payload.endpoint));
                }
            }
        }

        let (left, right) = pair();
        let order = Arc::new(Mutex::new(Vec::new()));
        right.change_global_handler(Some(Arc::new(SlowFirst { order: order.clone() })));
        left.send_message("first", None, None, SendControls::default());
        left.send_message("second", None, None, SendControls::default());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            *order.lock().unwrap(),
            vec!["start:first", "end:first", "start:second", "end:second"]
        );
    }

    #[tokio::test]
    async fn test_endpoint_disable_aborts_pending_contexts() {
        struct Sink;

        #[async_trait::async_trait]
        impl crate::endpoint::EndpointEventHandler for Sink {
            async fn on_request(&self, _request: Arc<IncomingRequest>) {}
        }

        let (left, right) = pair();
        right
            .register_endpoint("slow", Arc::new(Sink), EndpointDefaults::default())
            .unwrap();
        let sender = left
            .register_endpoint("slow", Arc::new(Sink), EndpointDefaults::default())
            .unwrap();

        let ctx = sender.request(Some(json!({})), None, SendControls::acked());
        assert!(ctx.ack().await);
        sender.enable(false);
        let result = ctx.result().await;
        assert!(!result.ok);
        assert_eq!(result.status, ExchangeStatus::Abort);
    }

    #[tokio::test]
    async fn test_disabled_endpoint_send_yields_failed_context() {
        struct Sink;

        #[async_trait::async_trait]
        impl crate::endpoint::EndpointEventHandler for Sink {}

        let (left, _right) = pair();
        let handle = left
            .register_endpoint("out", Arc::new(Sink), EndpointDefaults::default())
            .unwrap();
        handle.enable(true);
        handle.enable(false);
        let ctx = handle.send_message(Some(json!(1)), None, SendControls::default());
        let result = ctx.result().await;
        assert!(!result.ok);
        assert_eq!(result.status, ExchangeStatus::SendError);
        assert!(matches!(result.error, Some(Error::MethodAccess(_))));
    }

    #[tokio::test]
    async fn test_pack_error_yields_pre_finished_context() {
        let (left, _right) = pair();
        // Empty endpoint names fail at pack time.
        let ctx = left.send_message("", None, None, SendControls::acked());
        assert!(ctx.is_finished());
        let result = ctx.result().await;
        assert_eq!(result.status, ExchangeStatus::PackError);
        assert!(matches!(result.error, Some(Error::Pack(_))));
        assert_eq!(left.outgoing_len(), 0);
    }

    #[tokio::test]
    async fn test_send_error_yields_finished_context() {
        let (left_transport, _right_transport) = PairTransport::pair();
        left_transport.disconnect();
        let left = dispatcher_over(left_transport);
        let ctx = left.send_message("news", Some(json!(1)), None, SendControls::acked());
        let result = ctx.result().await;
        assert!(!result.ok);
        assert_eq!(result.status, ExchangeStatus::SendError);
        assert_eq!(left.outgoing_len(), 0);
    }

    #[tokio::test]
    async fn test_undecodable_frame_reports_unpack() {
        let (left_transport, right_transport) = PairTransport::pair();
        let left = dispatcher_over(left_transport);
        let handler = Arc::new(CollectingHandler::default());
        left.change_global_handler(Some(handler.clone()));
        right_transport.send(vec![0xFF, 0x00, 0x01]);
        settle().await;
        assert_eq!(handler.names(), vec!["unpack"]);
    }

    #[tokio::test]
    async fn test_close_fails_everything_in_flight() {
        struct Sink;

        #[async_trait::async_trait]
        impl crate::endpoint::EndpointEventHandler for Sink {
            async fn on_request(&self, _request: Arc<IncomingRequest>) {}
        }

        let (left, right) = pair();
        right
            .register_endpoint("slow", Arc::new(Sink), EndpointDefaults::default())
            .unwrap();
        let ctx = left.request("slow", Some(json!({})), None, SendControls::acked());
        assert!(ctx.ack().await);
        left.close();
        let result = ctx.result().await;
        assert!(!result.ok);
        assert!(matches!(result.error, Some(Error::Connection(_))));
        assert!(!left.is_alive());
    }
}
