//! Interrupt controller: a uniform surface over abort signals and timeouts.
//!
//! The controller owns an internal abort signal handed to whatever native
//! operation the caller runs. Registered callbacks fire BEFORE that signal
//! aborts, so the caller can tag the ensuing native error with the right
//! status.

use crate::error::Error;
use std::future::pending;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Why an abort signal fired. The soft flavor only cancels work whose
/// response has not been delivered yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortKind {
    Hard,
    Soft,
}

struct AbortInner {
    fired: Mutex<Option<AbortKind>>,
    notify: Notify,
}

/// Cloneable abort handle; all clones observe the same state.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal").finish_non_exhaustive()
    }
}

impl AbortSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AbortInner {
                fired: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    pub fn abort(&self) {
        self.fire(AbortKind::Hard);
    }

    /// Abort with the soft sentinel.
    pub fn abort_soft(&self) {
        self.fire(AbortKind::Soft);
    }

    fn fire(&self, kind: AbortKind) {
        {
            let mut fired = self.inner.fired.lock().expect("abort signal poisoned");
            if fired.is_some() {
                return;
            }
            *fired = Some(kind);
        }
        self.inner.notify.notify_waiters();
    }

    pub fn fired(&self) -> Option<AbortKind> {
        *self.inner.fired.lock().expect("abort signal poisoned")
    }

    pub fn is_fired(&self) -> bool {
        self.fired().is_some()
    }

    pub async fn wait(&self) -> AbortKind {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(kind) = self.fired() {
                return kind;
            }
            notified.await;
        }
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Exit status of an interrupt controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterruptStatus {
    #[default]
    None,
    Timeout,
    Abort,
    Soft,
}

impl InterruptStatus {
    pub fn error(self) -> Option<Error> {
        match self {
            InterruptStatus::None => None,
            InterruptStatus::Timeout => Some(Error::Timeout("deadline elapsed".into())),
            InterruptStatus::Abort => Some(Error::Abort("aborted".into())),
            InterruptStatus::Soft => Some(Error::Abort("soft-aborted".into())),
        }
    }
}

type InterruptCallback = Box<dyn Fn(InterruptStatus) + Send + Sync>;

struct ControllerInner {
    status: Mutex<InterruptStatus>,
    disabled: AtomicBool,
    timeout_disabled: AtomicBool,
    callbacks: Mutex<Vec<(u64, InterruptCallback)>>,
    next_callback: AtomicU64,
    internal: AbortSignal,
    notify: Notify,
}

impl ControllerInner {
    fn fire(&self, status: InterruptStatus) {
        if self.disabled.load(Ordering::SeqCst) {
            return;
        }
        if status == InterruptStatus::Timeout && self.timeout_disabled.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut slot = self.status.lock().expect("interrupt status poisoned");
            if *slot != InterruptStatus::None {
                return;
            }
            *slot = status;
        }
        // Callbacks run before the internal signal aborts.
        let callbacks = self.callbacks.lock().expect("interrupt callbacks poisoned");
        for (_, callback) in callbacks.iter() {
            callback(status);
        }
        drop(callbacks);
        self.internal.abort();
        self.notify.notify_waiters();
    }
}

/// Watches an optional external abort signal and an optional deadline and
/// settles into exactly one exit status.
#[derive(Clone)]
pub struct InterruptController {
    inner: Arc<ControllerInner>,
}

impl InterruptController {
    /// Build a controller over an optional external signal and an optional
    /// deadline. A controller with neither never fires.
    pub fn new(external: Option<AbortSignal>, timeout: Option<Duration>) -> Self {
        let inner = Arc::new(ControllerInner {
            status: Mutex::new(InterruptStatus::None),
            disabled: AtomicBool::new(false),
            timeout_disabled: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
            next_callback: AtomicU64::new(1),
            internal: AbortSignal::new(),
            notify: Notify::new(),
        });

        // An already-fired external signal settles the controller before
        // the watcher task even spawns.
        if let Some(kind) = external.as_ref().and_then(|s| s.fired()) {
            inner.fire(match kind {
                AbortKind::Hard => InterruptStatus::Abort,
                AbortKind::Soft => InterruptStatus::Soft,
            });
            return Self { inner };
        }

        let watcher = inner.clone();
        tokio::spawn(async move {
            let external_wait = async {
                match &external {
                    Some(signal) => signal.wait().await,
                    None => pending().await,
                }
            };
            let deadline = async {
                match timeout {
                    Some(duration) => tokio::time::sleep(duration).await,
                    None => pending().await,
                }
            };
            tokio::select! {
                kind = external_wait => {
                    watcher.fire(match kind {
                        AbortKind::Hard => InterruptStatus::Abort,
                        AbortKind::Soft => InterruptStatus::Soft,
                    });
                }
                _ = deadline => {
                    watcher.fire(InterruptStatus::Timeout);
                }
            }
        });

        Self { inner }
    }

    /// Timeout-only flavor.
    pub fn timeout(duration: Duration) -> Self {
        Self::new(None, Some(duration))
    }

    pub fn status(&self) -> InterruptStatus {
        *self.inner.status.lock().expect("interrupt status poisoned")
    }

    /// True while the controller has not fired.
    pub fn alive(&self) -> bool {
        self.status() == InterruptStatus::None
    }

    pub fn error(&self) -> Option<Error> {
        self.status().error()
    }

    /// Register a callback invoked once on fire. Returns a token for `off`.
    pub fn on(&self, callback: impl Fn(InterruptStatus) + Send + Sync + 'static) -> u64 {
        let token = self.inner.next_callback.fetch_add(1, Ordering::SeqCst);
        self.inner
            .callbacks
            .lock()
            .expect("interrupt callbacks poisoned")
            .push((token, Box::new(callback)));
        token
    }

    pub fn off(&self, token: u64) {
        self.inner
            .callbacks
            .lock()
            .expect("interrupt callbacks poisoned")
            .retain(|(t, _)| *t != token);
    }

    /// Permanently disarm the controller.
    pub fn disable(&self) {
        self.inner.disabled.store(true, Ordering::SeqCst);
    }

    /// Disarm only the deadline; the external abort stays live.
    pub fn disable_timeout(&self) {
        self.inner.timeout_disabled.store(true, Ordering::SeqCst);
    }

    /// The internal signal handed to the native operation. It aborts after
    /// the callbacks have run.
    pub fn signal(&self) -> AbortSignal {
        self.inner.internal.clone()
    }

    pub async fn wait(&self) -> InterruptStatus {
        loop {
            let notified = self.inner.notify.notified();
            let status = self.status();
            if status != InterruptStatus::None {
                return status;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_timeout_fires_once() {
        let controller = InterruptController::timeout(Duration::from_millis(20));
        assert!(controller.alive());
        assert_eq!(controller.wait().await, InterruptStatus::Timeout);
        assert!(!controller.alive());
        assert!(matches!(controller.error(), Some(Error::Timeout(_))));
        assert!(controller.signal().is_fired());
    }

    #[tokio::test]
    async fn test_external_abort_wins_over_timeout() {
        let signal = AbortSignal::new();
        let controller = InterruptController::new(Some(signal.clone()), Some(Duration::from_secs(10)));
        signal.abort();
        assert_eq!(controller.wait().await, InterruptStatus::Abort);
    }

    #[tokio::test]
    async fn test_soft_abort_status() {
        let signal = AbortSignal::new();
        let controller = InterruptController::new(Some(signal.clone()), None);
        signal.abort_soft();
        assert_eq!(controller.wait().await, InterruptStatus::Soft);
        assert!(matches!(controller.error(), Some(Error::Abort(_))));
    }

    #[tokio::test]
    async fn test_already_fired_signal_settles_immediately() {
        let signal = AbortSignal::new();
        signal.abort();
        let controller = InterruptController::new(Some(signal), Some(Duration::from_secs(10)));
        assert_eq!(controller.status(), InterruptStatus::Abort);
    }

    #[tokio::test]
    async fn test_callbacks_run_before_internal_abort() {
        let controller = InterruptController::timeout(Duration::from_millis(10));
        let order = Arc::new(Mutex::new(Vec::new()));
        let signal = controller.signal();
        let seen = order.clone();
        controller.on(move |status| {
            seen.lock()
                .unwrap()
                .push((status, signal.is_fired()));
        });
        controller.wait().await;
        let seen = order.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, InterruptStatus::Timeout);
        // The internal signal had not aborted yet when the callback ran.
        assert!(!seen[0].1);
    }

    #[tokio::test]
    async fn test_disable_timeout_keeps_external_abort() {
        let signal = AbortSignal::new();
        let controller =
            InterruptController::new(Some(signal.clone()), Some(Duration::from_millis(10)));
        controller.disable_timeout();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(controller.alive());
        signal.abort();
        assert_eq!(controller.wait().await, InterruptStatus::Abort);
    }

    #[tokio::test]
    async fn test_disable_disarms_everything() {
        let controller = InterruptController::timeout(Duration::from_millis(10));
        controller.disable();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(controller.alive());
    }

    #[tokio::test]
    async fn test_off_unregisters_callback() {
        let controller = InterruptController::timeout(Duration::from_millis(10));
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        let token = controller.on(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        controller.off(token);
        controller.wait().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
