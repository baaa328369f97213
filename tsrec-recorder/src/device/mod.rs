//! Recording devices.
//!
//! This module provides:
//! - [`RecordingDevice`]: Capability interface the registry and activities use
//! - [`Device`]: Generic device driving a [`DeviceBackend`] through a [`CommandQueue`]
//! - [`CommandQueue`]: Per-device single-flight command queue
//! - [`DeviceRegistry`]: Named device collection with channel allocation
//! - [`driver`]: Backend for an out-of-process tuner driver
//! - [`rtp`]: Backend receiving RTP-framed transport streams over UDP

pub mod backend;
pub mod driver;
pub mod queue;
pub mod registry;
pub mod rtp;

use std::any::Any;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub use backend::{Device, DeviceBackend};
pub use queue::{Command, CommandFuture, CommandQueue};
pub use registry::{DeviceRegistry, NameComparison};

/// Device-related errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The device hardware could not be brought up.
    #[error("Failed to reserve device {device}: {reason}")]
    ReserveFailed { device: String, reason: String },

    /// A command ran while no driver was attached.
    #[error("Device is not reserved")]
    NotReserved,

    /// A resolution produced by another kind of device was passed in.
    #[error("Source resolution belongs to a different device type")]
    ForeignResolution,

    /// The tuner driver rejected a request.
    #[error("Driver error: {0}")]
    Driver(String),

    /// The device was disposed.
    #[error("Device {0} is disposed")]
    Disposed(String),

    /// Two devices share a name under the configured comparison.
    #[error("Duplicate device name: {0}")]
    DuplicateName(String),

    /// The device could not be created.
    #[error("Failed to create device {device}: {reason}")]
    CreateFailed { device: String, reason: String },

    /// File or socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Unique identifier of one recording stream on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(Uuid);

impl StreamId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sources a channel name resolved to on one device.
///
/// The descriptors are opaque to everything but the device that produced
/// them. A resolution is never empty; an unresolvable channel is `None`.
#[derive(Clone)]
pub struct SourceResolution {
    sources: Arc<dyn Any + Send + Sync>,
    count: usize,
}

impl SourceResolution {
    /// Wrap resolved sources; `None` if there are none.
    pub fn new<S>(sources: Vec<S>) -> Option<Self>
    where
        S: Send + Sync + 'static,
    {
        if sources.is_empty() {
            return None;
        }
        let count = sources.len();
        Some(Self {
            sources: Arc::new(sources),
            count,
        })
    }

    /// Access the sources if they are of type `S`.
    pub fn sources<S: 'static>(&self) -> Option<&[S]> {
        self.sources
            .downcast_ref::<Vec<S>>()
            .map(|sources| sources.as_slice())
    }

    /// Number of resolved sources.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl fmt::Debug for SourceResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceResolution")
            .field("count", &self.count)
            .finish()
    }
}

/// A tuning/capture resource that can record one or more sources at once.
#[async_trait]
pub trait RecordingDevice: Send + Sync {
    /// Unique device name.
    fn name(&self) -> &str;

    /// Allocation priority; lower values are preferred.
    fn priority(&self) -> u32;

    /// Resolve a channel name to the sources this device can receive.
    fn resolve(&self, channel: &str) -> Option<SourceResolution>;

    /// Check whether any source of `left` can be recorded together with any
    /// source of `right`.
    fn can_share_source_group(&self, left: &SourceResolution, right: &SourceResolution) -> bool;

    /// Start recording one of the resolved sources into `path`.
    ///
    /// Returns `Ok(None)` if the device is busy with an incompatible source.
    async fn start(
        &self,
        resolution: &SourceResolution,
        path: &Path,
    ) -> Result<Option<StreamId>, DeviceError>;

    /// Stop a recording stream; unknown streams are ignored.
    async fn stop(&self, stream: StreamId);

    /// Release the device for good. Repeated calls do nothing.
    async fn dispose(&self);

    /// Number of streams currently recording.
    async fn active_streams(&self) -> usize;
}

/// Creates devices by name at startup.
pub trait DeviceFactory: Send + Sync {
    fn create_device(
        &self,
        name: &str,
        priority: u32,
    ) -> Result<Arc<dyn RecordingDevice>, DeviceError>;
}
