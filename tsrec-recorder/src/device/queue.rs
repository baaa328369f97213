//! Single-flight command queue for device operations.
//!
//! Every device owns one queue. Commands are started strictly in submission
//! order and the next command is not started before the previous one has
//! completed and its result handler has run. Submitting never blocks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, error, trace, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::device::DeviceError;

/// How long shutdown waits for queued commands before aborting them.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Handle to a running asynchronous device operation.
pub type CommandFuture<T = ()> = BoxFuture<'static, Result<T, DeviceError>>;

/// Starts a device operation when the queue reaches it.
pub type Command<T = ()> = Box<dyn FnOnce() -> Result<CommandFuture<T>, DeviceError> + Send>;

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// FIFO queue with at most one command in flight.
pub struct CommandQueue {
    /// Label used in log messages (usually the device name).
    label: String,
    /// Submission side; `None` once shut down.
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    /// Consumer task.
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    /// Entries queued or running.
    pending: Arc<AtomicUsize>,
}

impl CommandQueue {
    /// Create a queue and spawn its consumer on the current runtime.
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn(consume(label.clone(), rx, Arc::clone(&pending)));

        Self {
            label,
            tx: Mutex::new(Some(tx)),
            worker: tokio::sync::Mutex::new(Some(worker)),
            pending,
        }
    }

    /// Queue a command whose result is not needed.
    pub fn enqueue<S>(&self, start: S)
    where
        S: FnOnce() -> Result<CommandFuture, DeviceError> + Send + 'static,
    {
        self.enqueue_with(start, |_: ()| {});
    }

    /// Queue a command and hand its result to `on_result`.
    ///
    /// If the command fails to start, fails while running or panics, the
    /// failure is logged and `on_result` receives `T::default()`.
    pub fn enqueue_with<T, S, R>(&self, start: S, on_result: R)
    where
        T: Default + Send + 'static,
        S: FnOnce() -> Result<CommandFuture<T>, DeviceError> + Send + 'static,
        R: FnOnce(T) + Send + 'static,
    {
        let label = self.label.clone();
        let job: Job = Box::new(move || {
            async move {
                let result = match start() {
                    Ok(pending) => match tokio::spawn(pending).await {
                        Ok(Ok(value)) => value,
                        Ok(Err(e)) => {
                            error!("[{}] Command failed: {}", label, e);
                            T::default()
                        }
                        Err(e) => {
                            error!("[{}] Command aborted: {}", label, e);
                            T::default()
                        }
                    },
                    Err(e) => {
                        error!("[{}] Command could not be started: {}", label, e);
                        T::default()
                    }
                };
                on_result(result);
            }
            .boxed()
        });

        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match tx.as_ref() {
            Some(tx) => {
                self.pending.fetch_add(1, Ordering::SeqCst);
                if tx.send(job).is_err() {
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                    warn!("[{}] Command queue consumer is gone, dropping command", self.label);
                }
            }
            None => warn!("[{}] Command queue is shut down, dropping command", self.label),
        }
    }

    /// Queue a command and wait until it has completed.
    ///
    /// Since the queue is FIFO, every command queued before has completed
    /// too once this returns. Returns `None` if the queue is shut down.
    pub async fn enqueue_and_wait<T, S>(&self, start: S) -> Option<T>
    where
        T: Default + Send + 'static,
        S: FnOnce() -> Result<CommandFuture<T>, DeviceError> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.enqueue_with(start, move |result: T| {
            let _ = done_tx.send(result);
        });
        done_rx.await.ok()
    }

    /// Number of commands queued or running.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Check if no command is queued or running.
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Stop accepting commands and wait for the queued ones to finish.
    pub async fn shutdown(&self) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if tx.is_none() {
            return;
        }
        drop(tx);

        let handle = self.worker.lock().await.take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut handle).await {
                Ok(_) => debug!("[{}] Command queue drained", self.label),
                Err(_) => {
                    warn!(
                        "[{}] Command queue did not drain within {:?}, aborting",
                        self.label, SHUTDOWN_TIMEOUT
                    );
                    handle.abort();
                }
            }
        }
    }
}

async fn consume(label: String, mut rx: mpsc::UnboundedReceiver<Job>, pending: Arc<AtomicUsize>) {
    debug!("[{}] Command queue started", label);

    while let Some(job) = rx.recv().await {
        trace!("[{}] Running command", label);
        // A panicking result handler must not stop the consumer
        if let Err(e) = tokio::spawn(job()).await {
            error!("[{}] Command handler panicked: {}", label, e);
        }
        pending.fetch_sub(1, Ordering::SeqCst);
    }

    debug!("[{}] Command queue closed", label);
}
