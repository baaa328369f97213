//! Generic device driving a backend through its command queue.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::device::queue::{Command, CommandQueue};
use crate::device::{DeviceError, RecordingDevice, SourceResolution, StreamId};

/// Hardware or transport specific part of a device.
///
/// Command builders are called under the device's stream lock and must not
/// block; the returned commands run later, one at a time, on the device
/// queue.
#[async_trait]
pub trait DeviceBackend: Send + Sync + 'static {
    /// Descriptor of one receivable source.
    type Source: Clone + fmt::Debug + Send + Sync + 'static;

    /// All sources the channel name maps to, best first.
    fn resolve_channel(&self, channel: &str) -> Vec<Self::Source>;

    /// Check whether two sources can be received at the same time.
    fn co_recordable(&self, left: &Self::Source, right: &Self::Source) -> bool;

    /// Bring the device up if needed.
    ///
    /// Returns an initialization command to queue ahead of tuning. On error
    /// the backend must be left as it was before the call.
    async fn reserve(&self) -> Result<Option<Command>, DeviceError>;

    /// Tune to the source of the first stream.
    fn tune(self: &Arc<Self>, source: &Self::Source) -> Command;

    /// Start writing `source` into `path` as `stream`.
    fn begin_record(self: &Arc<Self>, source: &Self::Source, stream: StreamId, path: &Path)
        -> Command;

    /// Stop writing `stream`.
    fn end_record(self: &Arc<Self>, source: &Self::Source, stream: StreamId) -> Command;

    /// Last command queued before release; waiting for it drains the queue.
    fn detune(self: &Arc<Self>) -> Command;

    /// Release the device after the last stream ended.
    async fn release(&self);

    /// Final teardown.
    async fn dispose(&self);
}

#[derive(Debug)]
struct ActiveStream<S> {
    source: S,
    path: PathBuf,
}

/// A recording device made of a backend and a single-flight command queue.
pub struct Device<B: DeviceBackend> {
    name: String,
    priority: u32,
    backend: Arc<B>,
    /// Active streams; also serializes start against release.
    streams: Mutex<HashMap<StreamId, ActiveStream<B::Source>>>,
    queue: CommandQueue,
    disposed: AtomicBool,
}

impl<B: DeviceBackend> Device<B> {
    /// Create a device. Must be called within a tokio runtime.
    pub fn new(name: impl Into<String>, priority: u32, backend: Arc<B>) -> Self {
        let name = name.into();
        let queue = CommandQueue::new(format!("Device {}", name));
        Self {
            name,
            priority,
            backend,
            streams: Mutex::new(HashMap::new()),
            queue,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Commands queued or running on this device.
    pub fn pending_commands(&self) -> usize {
        self.queue.pending()
    }

    fn downcast<'a>(&self, resolution: &'a SourceResolution) -> Option<&'a [B::Source]> {
        resolution.sources::<B::Source>()
    }
}

#[async_trait]
impl<B: DeviceBackend> RecordingDevice for Device<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn resolve(&self, channel: &str) -> Option<SourceResolution> {
        SourceResolution::new(self.backend.resolve_channel(channel))
    }

    fn can_share_source_group(&self, left: &SourceResolution, right: &SourceResolution) -> bool {
        let (Some(left), Some(right)) = (self.downcast(left), self.downcast(right)) else {
            return false;
        };
        left.iter()
            .any(|l| right.iter().any(|r| self.backend.co_recordable(l, r)))
    }

    async fn start(
        &self,
        resolution: &SourceResolution,
        path: &Path,
    ) -> Result<Option<StreamId>, DeviceError> {
        let candidates = self
            .downcast(resolution)
            .ok_or(DeviceError::ForeignResolution)?;

        let mut streams = self.streams.lock().await;
        if self.disposed.load(Ordering::SeqCst) {
            return Err(DeviceError::Disposed(self.name.clone()));
        }

        let source = match streams.values().next() {
            None => candidates.first().cloned(),
            Some(current) => candidates
                .iter()
                .find(|candidate| self.backend.co_recordable(&current.source, candidate))
                .cloned(),
        };
        let Some(source) = source else {
            debug!(
                "[Device {}] Busy with {} stream(s), no compatible source",
                self.name,
                streams.len()
            );
            return Ok(None);
        };

        // Directory first, so a failure leaves the device untouched
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        if let Some(init) = self.backend.reserve().await? {
            self.queue.enqueue(init);
        }
        if streams.is_empty() {
            debug!("[Device {}] Tuning to {:?}", self.name, source);
            self.queue.enqueue(self.backend.tune(&source));
        }

        let stream = StreamId::new();
        self.queue
            .enqueue(self.backend.begin_record(&source, stream, path));
        streams.insert(
            stream,
            ActiveStream {
                source,
                path: path.to_path_buf(),
            },
        );

        info!(
            "[Device {}] Stream {} recording to {} ({} active)",
            self.name,
            stream,
            path.display(),
            streams.len()
        );
        Ok(Some(stream))
    }

    async fn stop(&self, stream: StreamId) {
        let mut streams = self.streams.lock().await;
        let Some(active) = streams.remove(&stream) else {
            debug!("[Device {}] Ignoring stop of unknown stream {}", self.name, stream);
            return;
        };

        info!(
            "[Device {}] Stream {} stopped ({})",
            self.name,
            stream,
            active.path.display()
        );
        self.queue
            .enqueue(self.backend.end_record(&active.source, stream));

        if streams.is_empty() {
            debug!("[Device {}] Last stream ended, releasing", self.name);
            if self
                .queue
                .enqueue_and_wait(self.backend.detune())
                .await
                .is_none()
            {
                warn!("[Device {}] Queue closed before release", self.name);
            }
            self.backend.release().await;
        }
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let dropped = {
            let mut streams = self.streams.lock().await;
            let count = streams.len();
            streams.clear();
            count
        };
        if dropped > 0 {
            warn!("[Device {}] Disposing with {} active stream(s)", self.name, dropped);
        }

        self.queue.shutdown().await;
        self.backend.dispose().await;
        info!("[Device {}] Disposed", self.name);
    }

    async fn active_streams(&self) -> usize {
        self.streams.lock().await.len()
    }
}
