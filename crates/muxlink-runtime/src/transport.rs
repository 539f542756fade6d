//! Transport interface consumed by the dispatcher, plus an in-memory
//! channel-backed pair for tests and loopback use.
//!
//! A real WebSocket implementation lives outside this crate; anything that
//! moves whole binary messages in order satisfies the trait.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::trace;

/// Connection lifecycle events reported through the state handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Close,
    Error,
    /// The peer sent a message of an unexpected kind.
    Type,
}

/// Kind of a received transport message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Binary,
    Text,
}

pub type StateHandler = Box<dyn Fn(TransportEvent, Option<Error>) + Send + Sync>;
pub type ReceiveHandler = Box<dyn Fn(MessageKind, Vec<u8>) + Send + Sync>;

/// Byte-stream transport carrying whole frames in order.
pub trait Transport: Send + Sync {
    fn is_enabled(&self) -> bool;
    fn is_connected(&self) -> bool;
    fn enable(&self, on: bool);
    fn change_state_handler(&self, handler: Option<StateHandler>);
    fn change_receive_handler(&self, handler: Option<ReceiveHandler>);
    /// Best-effort synchronous send; `Some(error)` on failure.
    fn send(&self, buf: Vec<u8>) -> Option<Error>;
    fn send_or_throw(&self, buf: Vec<u8>) -> Result<()>;
}

struct PairShared {
    enabled: AtomicBool,
    peer_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    receive: Mutex<Option<ReceiveHandler>>,
    state: Mutex<Option<StateHandler>>,
    peer: Mutex<Weak<PairShared>>,
}

impl PairShared {
    fn emit_state(&self, event: TransportEvent, error: Option<Error>) {
        if let Some(handler) = self.state.lock().expect("state handler poisoned").as_ref() {
            handler(event, error);
        }
    }
}

/// One half of an in-memory transport pair. Delivery is asynchronous (a
/// pump task per half) so a send never re-enters the receiver inline.
#[derive(Clone)]
pub struct PairTransport {
    shared: Arc<PairShared>,
}

impl PairTransport {
    /// Build two connected halves.
    pub fn pair() -> (PairTransport, PairTransport) {
        let left = Self::half();
        let right = Self::half();
        *left.shared.peer.lock().expect("peer poisoned") = Arc::downgrade(&right.shared);
        *right.shared.peer.lock().expect("peer poisoned") = Arc::downgrade(&left.shared);
        left.start_pump();
        right.start_pump();
        (left, right)
    }

    fn half() -> PairTransport {
        PairTransport {
            shared: Arc::new(PairShared {
                enabled: AtomicBool::new(true),
                peer_tx: Mutex::new(None),
                receive: Mutex::new(None),
                state: Mutex::new(None),
                peer: Mutex::new(Weak::new()),
            }),
        }
    }

    fn start_pump(&self) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        // The peer writes into our channel.
        if let Some(peer) = self.shared.peer.lock().expect("peer poisoned").upgrade() {
            *peer.peer_tx.lock().expect("peer tx poisoned") = Some(tx);
        }
        let shared = self.shared.clone();
        tokio::spawn(async move {
            while let Some(buf) = rx.recv().await {
                if !shared.enabled.load(Ordering::SeqCst) {
                    continue;
                }
                trace!(len = buf.len(), "pair transport delivering");
                let handler = shared.receive.lock().expect("receive handler poisoned");
                if let Some(handler) = handler.as_ref() {
                    handler(MessageKind::Binary, buf);
                }
            }
            shared.emit_state(TransportEvent::Close, None);
        });
    }

    /// Drop the link to the peer, closing both pumps.
    pub fn disconnect(&self) {
        *self.shared.peer_tx.lock().expect("peer tx poisoned") = None;
        if let Some(peer) = self.shared.peer.lock().expect("peer poisoned").upgrade() {
            *peer.peer_tx.lock().expect("peer tx poisoned") = None;
        }
    }
}

impl Transport for PairTransport {
    fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    fn is_connected(&self) -> bool {
        self.is_enabled()
            && self
                .shared
                .peer_tx
                .lock()
                .expect("peer tx poisoned")
                .is_some()
    }

    fn enable(&self, on: bool) {
        self.shared.enabled.store(on, Ordering::SeqCst);
    }

    fn change_state_handler(&self, handler: Option<StateHandler>) {
        *self.shared.state.lock().expect("state handler poisoned") = handler;
    }

    fn change_receive_handler(&self, handler: Option<ReceiveHandler>) {
        *self.shared.receive.lock().expect("receive handler poisoned") = handler;
    }

    fn send(&self, buf: Vec<u8>) -> Option<Error> {
        if !self.is_enabled() {
            return Some(Error::Send("transport disabled".into()));
        }
        let tx = self.shared.peer_tx.lock().expect("peer tx poisoned");
        match tx.as_ref() {
            Some(tx) if tx.send(buf).is_ok() => None,
            _ => Some(Error::Send("transport disconnected".into())),
        }
    }

    fn send_or_throw(&self, buf: Vec<u8>) -> Result<()> {
        match self.send(buf) {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (left, right) = PairTransport::pair();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            right.change_receive_handler(Some(Box::new(move |_, buf| {
                seen.lock().unwrap().push(buf);
            })));
        }
        for n in 0..5u8 {
            assert!(left.send(vec![n]).is_none());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock().unwrap(), vec![vec![0], vec![1], vec![2], vec![3], vec![4]]);
    }

    #[tokio::test]
    async fn test_disabled_transport_rejects_sends() {
        let (left, _right) = PairTransport::pair();
        left.enable(false);
        assert!(matches!(left.send(vec![1]), Some(Error::Send(_))));
        assert!(left.send_or_throw(vec![1]).is_err());
    }

    #[tokio::test]
    async fn test_disconnect_fails_sends() {
        let (left, right) = PairTransport::pair();
        left.disconnect();
        assert!(!left.is_connected());
        assert!(!right.is_connected());
        assert!(left.send(vec![1]).is_some());
    }
}
