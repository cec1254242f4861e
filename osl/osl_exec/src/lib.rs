// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Deferred execution of interpreter callbacks.
//!
//! [`Dispatcher::execute`] queues a callback and returns immediately. A
//! single worker thread runs callbacks one at a time in submission order,
//! each with interrupt delivery disabled. A shared pending counter lets the
//! engine wait for the queue to drain.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use futures::channel::mpsc;
use futures::executor::block_on;
use futures::StreamExt;
use osl_host::HeapBox;
use osl_host::HostHeap;
use osl_host::InterruptControl;
use osl_host::InterruptsDisabled;
use osl_host::OutOfMemory;
use osl_host::Platform;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::thread::ThreadId;
use std::time::Duration;
use thiserror::Error;

/// The kind of deferred work, as reported by the engine.
///
/// Every kind runs on the same worker; the kind is only logged.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecuteType {
    /// Global lock release handler.
    GlobalLockHandler,
    /// Device notify handler.
    NotifyHandler,
    /// General purpose event handler.
    GpeHandler,
    /// Debugger main thread.
    DebuggerMainThread,
    /// Debugger execution thread.
    DebuggerExecThread,
    /// Embedded controller poll handler.
    EcPollHandler,
    /// Embedded controller burst handler.
    EcBurstHandler,
}

/// A deferred callback.
pub type Callback = Box<dyn FnOnce() + Send>;

/// Errors returned by [`Dispatcher`].
#[derive(Debug, Error)]
pub enum ExecError {
    /// The work record could not be allocated.
    #[error("failed to allocate deferred work record")]
    OutOfMemory(#[source] OutOfMemory),
    /// The queue is full.
    #[error("deferred work queue is full")]
    QueueFull,
    /// The worker has shut down.
    #[error("deferred work worker is not running")]
    WorkerGone,
    /// The worker thread could not be started.
    #[error("failed to spawn deferred work worker")]
    Spawn(#[source] std::io::Error),
}

/// Dispatcher tuning.
#[derive(Debug, Copy, Clone)]
pub struct DispatcherConfig {
    /// Records that may be queued behind the running callback.
    pub queue_depth: usize,
    /// How often [`Dispatcher::wait_for_idle`] samples the pending count.
    pub poll_interval: Duration,
    /// How long [`Dispatcher::wait_for_idle`] waits before giving up.
    pub max_wait: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_depth: 64,
            poll_interval: Duration::from_millis(10),
            max_wait: Duration::from_millis(5000),
        }
    }
}

struct Record {
    kind: ExecuteType,
    callback: Option<Callback>,
}

#[derive(Debug, Default)]
struct PendingCounter(AtomicUsize);

impl PendingCounter {
    fn increment(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    fn decrement(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

/// Runs deferred callbacks on a dedicated worker thread.
pub struct Dispatcher {
    heap: Arc<dyn HostHeap>,
    platform: Arc<dyn Platform>,
    config: DispatcherConfig,
    pending: Arc<PendingCounter>,
    sender: Mutex<Option<mpsc::Sender<HeapBox<Record>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl Dispatcher {
    /// Starts the worker thread.
    pub fn new(
        heap: Arc<dyn HostHeap>,
        interrupts: Arc<dyn InterruptControl>,
        platform: Arc<dyn Platform>,
        config: DispatcherConfig,
    ) -> Result<Self, ExecError> {
        let (sender, receiver) = mpsc::channel(config.queue_depth);
        let pending = Arc::new(PendingCounter::default());
        let worker = std::thread::Builder::new()
            .name("acpi-osl-exec".to_owned())
            .spawn({
                let runner = Worker {
                    interrupts,
                    pending: pending.clone(),
                };
                || block_on(runner.run(receiver))
            })
            .map_err(ExecError::Spawn)?;

        Ok(Self {
            heap,
            platform,
            config,
            pending,
            sender: Mutex::new(Some(sender)),
            worker_id: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queues `callback` to run on the worker thread.
    pub fn execute(&self, kind: ExecuteType, callback: Callback) -> Result<(), ExecError> {
        let record = HeapBox::new(
            &self.heap,
            Record {
                kind,
                callback: Some(callback),
            },
        )
        .map_err(|err| {
            tracing::warn!(?kind, "no memory for deferred work");
            ExecError::OutOfMemory(err)
        })?;

        self.pending.increment();
        let mut sender = self.sender.lock();
        let result = match sender.as_mut() {
            Some(sender) => sender.try_send(record).map_err(|err| {
                if err.is_full() {
                    ExecError::QueueFull
                } else {
                    ExecError::WorkerGone
                }
            }),
            None => Err(ExecError::WorkerGone),
        };
        drop(sender);

        if let Err(err) = &result {
            // The record, if it was not consumed, has already been dropped.
            self.pending.decrement();
            tracing::warn!(
                ?kind,
                error = err as &dyn std::error::Error,
                "failed to queue deferred work"
            );
        } else {
            tracing::trace!(?kind, "queued deferred work");
        }
        result
    }

    /// The number of callbacks queued or running.
    pub fn pending(&self) -> usize {
        self.pending.get()
    }

    /// Waits for every queued callback to finish, polling every
    /// `poll_interval` for at most `max_wait`. Returns false if work is
    /// still pending at the deadline.
    ///
    /// Sleeps between polls go through the host's [`Platform::sleep`].
    pub fn wait_for_idle(&self) -> bool {
        let start = self.platform.uptime();
        loop {
            let pending = self.pending.get();
            if pending == 0 {
                return true;
            }
            if self.platform.uptime().saturating_sub(start) >= self.config.max_wait {
                tracing::warn!(
                    pending,
                    max_wait = ?self.config.max_wait,
                    "deferred work did not drain"
                );
                return false;
            }
            self.platform.sleep(self.config.poll_interval);
        }
    }

    /// Drains the queue, then stops and joins the worker. Later calls to
    /// [`Dispatcher::execute`] fail.
    pub fn shutdown(&self) {
        if std::thread::current().id() == self.worker_id {
            // A callback cannot wait for itself.
            self.sender.lock().take();
            return;
        }
        self.wait_for_idle();
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!("deferred work worker panicked");
            }
            tracing::debug!("deferred work worker stopped");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("pending", &self.pending.get())
            .finish()
    }
}

struct Worker {
    interrupts: Arc<dyn InterruptControl>,
    pending: Arc<PendingCounter>,
}

impl Worker {
    async fn run(self, mut receiver: mpsc::Receiver<HeapBox<Record>>) {
        while let Some(mut record) = receiver.next().await {
            let kind = record.kind;
            if let Some(callback) = record.callback.take() {
                let result = {
                    let _disabled = InterruptsDisabled::new(&*self.interrupts);
                    std::panic::catch_unwind(AssertUnwindSafe(callback))
                };
                if let Err(panic) = result {
                    let message = panic
                        .downcast_ref::<&str>()
                        .copied()
                        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
                        .unwrap_or("<non-string panic>");
                    tracing::error!(?kind, panic = message, "deferred callback panicked");
                }
            }
            drop(record);
            self.pending.decrement();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osl_test_host::TestHost;
    use osl_test_host::test;
    use std::sync::mpsc as std_mpsc;
    use std::time::Instant;

    fn dispatcher(config: DispatcherConfig) -> (Arc<TestHost>, Dispatcher) {
        let host = TestHost::new();
        let dispatcher = Dispatcher::new(host.clone(), host.clone(), host.clone(), config).unwrap();
        (host, dispatcher)
    }

    #[test]
    fn callbacks_run_in_order() {
        let (host, dispatcher) = dispatcher(DispatcherConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let seen = seen.clone();
            dispatcher
                .execute(ExecuteType::NotifyHandler, Box::new(move || seen.lock().push(i)))
                .unwrap();
        }
        assert!(dispatcher.wait_for_idle());
        assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());
        assert_eq!(dispatcher.pending(), 0);
        assert_eq!(host.in_use(), 0);
    }

    #[test]
    fn callbacks_run_with_interrupts_disabled() {
        let (host, dispatcher) = dispatcher(DispatcherConfig::default());
        let (send, recv) = std_mpsc::channel();
        let observer = host.clone();
        dispatcher
            .execute(
                ExecuteType::GpeHandler,
                Box::new(move || send.send(observer.are_enabled()).unwrap()),
            )
            .unwrap();
        assert!(!recv.recv().unwrap());
        assert!(dispatcher.wait_for_idle());
    }

    #[test]
    fn allocation_failure_is_reported() {
        let (host, dispatcher) = dispatcher(DispatcherConfig::default());
        host.set_heap_limit(0);
        let err = dispatcher
            .execute(ExecuteType::GlobalLockHandler, Box::new(|| {}))
            .unwrap_err();
        assert!(matches!(err, ExecError::OutOfMemory(_)));
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn panicking_callback_does_not_stop_worker() {
        let (_host, dispatcher) = dispatcher(DispatcherConfig::default());
        dispatcher
            .execute(ExecuteType::EcPollHandler, Box::new(|| panic!("bad handler")))
            .unwrap();
        let (send, recv) = std_mpsc::channel();
        dispatcher
            .execute(ExecuteType::EcPollHandler, Box::new(move || send.send(()).unwrap()))
            .unwrap();
        recv.recv().unwrap();
        assert!(dispatcher.wait_for_idle());
    }

    #[test]
    fn full_queue_is_reported() {
        let (host, dispatcher) = dispatcher(DispatcherConfig {
            queue_depth: 1,
            ..Default::default()
        });
        let (started_send, started) = std_mpsc::channel();
        let (release, release_recv) = std_mpsc::channel::<()>();
        dispatcher
            .execute(
                ExecuteType::NotifyHandler,
                Box::new(move || {
                    started_send.send(()).unwrap();
                    release_recv.recv().unwrap();
                }),
            )
            .unwrap();
        started.recv().unwrap();

        let mut queued = 0;
        let err = loop {
            match dispatcher.execute(ExecuteType::NotifyHandler, Box::new(|| {})) {
                Ok(()) => queued += 1,
                Err(err) => break err,
            }
            assert!(queued < 16, "queue never filled");
        };
        assert!(matches!(err, ExecError::QueueFull));
        assert_eq!(dispatcher.pending(), queued + 1);

        release.send(()).unwrap();
        assert!(dispatcher.wait_for_idle());
        assert_eq!(host.in_use(), 0);
    }

    #[test]
    fn idle_wait_is_bounded() {
        let (host, dispatcher) = dispatcher(DispatcherConfig {
            max_wait: Duration::from_millis(50),
            ..Default::default()
        });
        let (release, release_recv) = std_mpsc::channel::<()>();
        dispatcher
            .execute(
                ExecuteType::DebuggerExecThread,
                Box::new(move || release_recv.recv().unwrap()),
            )
            .unwrap();

        let start = Instant::now();
        assert!(!dispatcher.wait_for_idle());
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(dispatcher.pending(), 1);
        // Polling yields through the host rather than the thread directly.
        assert!(host.sleep_calls() > 0);

        release.send(()).unwrap();
        assert!(dispatcher.wait_for_idle());
    }

    #[test]
    fn execute_after_shutdown_fails() {
        let (_host, dispatcher) = dispatcher(DispatcherConfig::default());
        dispatcher.shutdown();
        assert!(matches!(
            dispatcher.execute(ExecuteType::NotifyHandler, Box::new(|| {})),
            Err(ExecError::WorkerGone)
        ));
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn pending_never_underflows() {
        let counter = PendingCounter::default();
        counter.decrement();
        assert_eq!(counter.get(), 0);
        counter.increment();
        counter.decrement();
        counter.decrement();
        assert_eq!(counter.get(), 0);
    }
}
