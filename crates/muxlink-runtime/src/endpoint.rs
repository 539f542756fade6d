//! Endpoint handle: a subscription over the dispatcher scoped to one
//! endpoint name.

use crate::dispatcher::{DispatcherCore, SendControls};
use crate::error::Error;
use crate::exchange::{ExchangeStatus, IncomingRequest, OutgoingContext};
use muxlink_proto::{BinaryBody, BinaryScope, FileBlob, MdpPayload};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Send defaults injected into every operation of one handle.
#[derive(Debug, Clone, Default)]
pub struct EndpointDefaults {
    pub need_ack: bool,
    pub checksum: bool,
    pub timeout: Option<Duration>,
}

/// Receiver side of an endpoint handle. Default methods ignore the event,
/// so implementors subscribe only to what they care about.
#[async_trait::async_trait]
pub trait EndpointEventHandler: Send + Sync {
    async fn on_message(&self, payload: MdpPayload) {
        let _ = payload;
    }

    async fn on_request(&self, request: Arc<IncomingRequest>) {
        let _ = request;
    }

    async fn on_binary(&self, id: u32, body: BinaryBody) {
        let _ = (id, body);
    }
}

/// Lightweight delegator over the dispatcher for one endpoint name.
/// Registered handles receive routed events while enabled; send operations
/// inject the handle's defaults and are guarded on `enabled && alive`.
pub struct EndpointHandle {
    name: String,
    core: Weak<DispatcherCore>,
    handler: Arc<dyn EndpointEventHandler>,
    enabled: AtomicBool,
    closed: AtomicBool,
    defaults: EndpointDefaults,
}

impl EndpointHandle {
    pub(crate) fn new(
        name: String,
        core: Weak<DispatcherCore>,
        handler: Arc<dyn EndpointEventHandler>,
        defaults: EndpointDefaults,
    ) -> Self {
        Self {
            name,
            core,
            handler,
            enabled: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            defaults,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn handler(&self) -> &Arc<dyn EndpointEventHandler> {
        &self.handler
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.core.upgrade().is_some_and(|core| core.is_alive())
    }

    /// Toggle the subscription. Disabling aborts every pending outgoing
    /// exchange addressed to this endpoint; the handle stays registered.
    pub fn enable(&self, on: bool) {
        let was = self.enabled.swap(on, Ordering::SeqCst);
        if was && !on {
            if let Some(core) = self.core.upgrade() {
                core.cancel_endpoint(&self.name);
            }
        }
    }

    /// Remove the handle from the dispatcher and abort pending exchanges.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(core) = self.core.upgrade() {
            core.cancel_endpoint(&self.name);
            core.remove_handle(&self.name);
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Send defaults for this endpoint; tweak and pass back in.
    pub fn controls(&self) -> SendControls {
        SendControls {
            need_ack: self.defaults.need_ack,
            checksum: self.defaults.checksum,
            timeout: self.defaults.timeout,
            abort: None,
        }
    }

    fn guard(&self) -> std::result::Result<Arc<DispatcherCore>, Arc<OutgoingContext>> {
        if !self.is_enabled() {
            return Err(OutgoingContext::pre_failed(
                self.name.clone(),
                ExchangeStatus::SendError,
                Error::MethodAccess(format!("endpoint '{}' is disabled", self.name)),
            ));
        }
        match self.core.upgrade().filter(|core| core.is_alive()) {
            Some(core) => Ok(core),
            None => Err(OutgoingContext::pre_failed(
                self.name.clone(),
                ExchangeStatus::SendError,
                Error::Connection("dispatcher is not alive".into()),
            )),
        }
    }

    pub fn send_message(
        &self,
        data: Option<Value>,
        files: Option<&BTreeMap<u32, FileBlob>>,
        controls: SendControls,
    ) -> Arc<OutgoingContext> {
        match self.guard() {
            Ok(core) => core.send_message_op(&self.name, data, files, controls),
            Err(failed) => failed,
        }
    }

    pub fn request(
        &self,
        data: Option<Value>,
        files: Option<&BTreeMap<u32, FileBlob>>,
        controls: SendControls,
    ) -> Arc<OutgoingContext> {
        match self.guard() {
            Ok(core) => core.request_op(&self.name, data, files, controls),
            Err(failed) => failed,
        }
    }

    pub fn announce(
        &self,
        data: Option<Value>,
        filemap: Option<Vec<(u32, String, String)>>,
        expected: Option<BTreeSet<u32>>,
        controls: SendControls,
    ) -> Arc<OutgoingContext> {
        match self.guard() {
            Ok(core) => core.announce_op(&self.name, data, filemap, expected, controls),
            Err(failed) => failed,
        }
    }

    pub fn send_binary(
        &self,
        ref_id: u32,
        scope: BinaryScope,
        bin: Option<Vec<u8>>,
        last: bool,
        controls: SendControls,
    ) -> Arc<OutgoingContext> {
        match self.guard() {
            Ok(core) => core.send_binary_op(ref_id, scope, bin, last, controls),
            Err(failed) => failed,
        }
    }

    pub fn message_lite(
        &self,
        data: Option<Value>,
        files: Option<&BTreeMap<u32, FileBlob>>,
    ) -> Option<u32> {
        let core = self.core.upgrade()?;
        if !self.is_enabled() || !core.is_alive() {
            return None;
        }
        core.message_lite_op(&self.name, data, files)
    }
}
