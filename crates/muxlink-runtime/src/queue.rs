//! Named cooperative task queues with per-task priority.
//!
//! Tasks run strictly in priority-then-FIFO order within a queue. Failures
//! are logged and swallowed so one bad task never stalls the queue; abort
//! signals that fire before a task starts unlink it, signals firing
//! mid-task are the task's own business.

use crate::error::Error;
use crate::interrupt::AbortSignal;
use rustc_hash::FxHashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tracing::warn;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type TaskFn = Box<dyn FnOnce() -> BoxFuture<Result<(), Error>> + Send>;

struct Node {
    priority: u32,
    task: TaskFn,
    abort: Option<AbortSignal>,
}

struct QueueState {
    pending: Vec<Node>,
    running: usize,
    concurrency: usize,
}

struct QueueInner {
    key: String,
    state: Mutex<QueueState>,
}

/// One priority queue. Cloning shares the underlying queue.
#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<QueueInner>,
}

impl AsyncQueue {
    pub fn new(key: impl Into<String>, concurrency: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                key: key.into(),
                state: Mutex::new(QueueState {
                    pending: Vec::new(),
                    running: 0,
                    concurrency: concurrency.max(1),
                }),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Grow the concurrency cap; shared queue keys use the maximum across
    /// every config that named them.
    pub fn raise_concurrency(&self, concurrency: usize) {
        let mut state = self.inner.state.lock().expect("queue poisoned");
        if concurrency > state.concurrency {
            state.concurrency = concurrency;
        }
        drop(state);
        Self::pump(&self.inner);
    }

    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().expect("queue poisoned").pending.len()
    }

    /// Enqueue a task. Higher priority runs first; equal priority keeps
    /// insertion order. Scheduling begins on the next cooperative tick.
    pub fn add<F, Fut>(&self, priority: u32, abort: Option<AbortSignal>, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let node = Node {
            priority,
            task: Box::new(move || Box::pin(task()) as BoxFuture<Result<(), Error>>),
            abort,
        };
        {
            let mut state = self.inner.state.lock().expect("queue poisoned");
            // Insert after the last node with the same or higher priority.
            let at = state
                .pending
                .iter()
                .rposition(|n| n.priority >= priority)
                .map(|i| i + 1)
                .unwrap_or(0);
            state.pending.insert(at, node);
        }
        Self::pump(&self.inner);
    }

    /// Start eligible heads while capacity remains.
    fn pump(inner: &Arc<QueueInner>) {
        loop {
            let node = {
                let mut state = inner.state.lock().expect("queue poisoned");
                if state.running >= state.concurrency {
                    return;
                }
                // Unlink aborted heads without running them.
                let node = loop {
                    if state.pending.is_empty() {
                        return;
                    }
                    let node = state.pending.remove(0);
                    if node.abort.as_ref().is_some_and(AbortSignal::is_fired) {
                        continue;
                    }
                    break node;
                };
                state.running += 1;
                node
            };

            let inner = inner.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                // A nested spawn isolates panics; the queue keeps draining.
                let outcome = tokio::spawn((node.task)()).await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        warn!(queue = %inner.key, %error, "queued task failed");
                    }
                    Err(join_error) => {
                        warn!(queue = %inner.key, %join_error, "queued task panicked");
                    }
                }
                inner.state.lock().expect("queue poisoned").running -= 1;
                Self::pump(&inner);
            });
        }
    }
}

/// Lazily-created queues keyed by name.
pub struct NamedAsyncQueue {
    queues: Mutex<FxHashMap<String, AsyncQueue>>,
}

impl NamedAsyncQueue {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(FxHashMap::default()),
        }
    }

    /// Fetch or create the queue for `key`, raising its concurrency to at
    /// least `concurrency`.
    pub fn queue(&self, key: &str, concurrency: usize) -> AsyncQueue {
        let queue = {
            let mut queues = self.queues.lock().expect("named queues poisoned");
            queues
                .entry(key.to_string())
                .or_insert_with(|| AsyncQueue::new(key, concurrency))
                .clone()
        };
        queue.raise_concurrency(concurrency);
        queue
    }

    pub fn add<F, Fut>(
        &self,
        key: &str,
        concurrency: usize,
        priority: u32,
        abort: Option<AbortSignal>,
        task: F,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.queue(key, concurrency).add(priority, abort, task);
    }

    pub fn len(&self) -> usize {
        self.queues.lock().expect("named queues poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NamedAsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}
