//! Backend for devices served by an out-of-process tuner driver.
//!
//! The driver process is launched on the first reservation and shut down
//! when the last stream ends. Sources come from a per-device channel table;
//! two sources can be recorded together when they belong to the same group
//! (transponder or multiplex).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::FutureExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::device::backend::{Device, DeviceBackend};
use crate::device::queue::{Command, CommandFuture};
use crate::device::{DeviceError, DeviceFactory, RecordingDevice, StreamId};

/// One receivable source in a channel table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunerSource {
    /// Channel name the source is listed under.
    pub name: String,
    /// Driver-specific key that selects the source.
    pub selection_key: String,
    /// Transponder or multiplex the source is carried on.
    pub group: String,
}

impl TunerSource {
    pub fn new(
        name: impl Into<String>,
        selection_key: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            selection_key: selection_key.into(),
            group: group.into(),
        }
    }
}

/// Sources a device can receive, in preference order.
#[derive(Debug, Clone, Default)]
pub struct ChannelTable {
    sources: Vec<TunerSource>,
}

impl ChannelTable {
    pub fn new(sources: impl IntoIterator<Item = TunerSource>) -> Self {
        Self {
            sources: sources.into_iter().collect(),
        }
    }

    /// All sources listed under exactly `name`.
    pub fn resolve(&self, name: &str) -> Vec<TunerSource> {
        self.sources
            .iter()
            .filter(|source| source.name == name)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Request to start writing one source into a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub stream: StreamId,
    pub selection_key: String,
    pub path: PathBuf,
}

/// Control interface of a running tuner driver.
#[async_trait]
pub trait TunerDriver: Send + Sync {
    /// Load the driver profile of a device.
    async fn set_profile(&self, profile: &str) -> Result<(), DeviceError>;

    /// Tune to a source.
    async fn select(&self, selection_key: &str) -> Result<(), DeviceError>;

    /// Start writing a source into a file.
    async fn add_source(&self, request: ReceiveRequest) -> Result<(), DeviceError>;

    /// Stop writing one stream.
    async fn remove_source(&self, selection_key: &str, stream: StreamId)
        -> Result<(), DeviceError>;

    /// Stop writing all streams.
    async fn remove_all_sources(&self) -> Result<(), DeviceError>;

    /// Terminate the driver.
    async fn shutdown(&self);
}

/// Starts tuner driver instances.
#[async_trait]
pub trait DriverLauncher: Send + Sync {
    async fn launch(&self, device: &str) -> Result<Arc<dyn TunerDriver>, DeviceError>;
}

/// Device backend talking to a [`TunerDriver`].
pub struct DriverBackend {
    name: String,
    table: ChannelTable,
    launcher: Arc<dyn DriverLauncher>,
    /// Attached driver; `None` while released.
    driver: Mutex<Option<Arc<dyn TunerDriver>>>,
}

impl DriverBackend {
    pub fn new(name: impl Into<String>, table: ChannelTable, launcher: Arc<dyn DriverLauncher>) -> Self {
        Self {
            name: name.into(),
            table,
            launcher,
            driver: Mutex::new(None),
        }
    }

    /// Check whether a driver is attached.
    pub fn is_reserved(&self) -> bool {
        self.driver().is_some()
    }

    fn driver(&self) -> Option<Arc<dyn TunerDriver>> {
        self.driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn detach(&self) -> Option<Arc<dyn TunerDriver>> {
        self.driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Build a command that runs `op` against the driver attached when the
    /// command starts.
    fn with_driver<F>(self: &Arc<Self>, op: F) -> Command
    where
        F: FnOnce(Arc<dyn TunerDriver>) -> CommandFuture + Send + 'static,
    {
        let backend = Arc::clone(self);
        Box::new(move || -> Result<CommandFuture, DeviceError> {
            let driver = backend.driver().ok_or(DeviceError::NotReserved)?;
            Ok(op(driver))
        })
    }
}

#[async_trait]
impl DeviceBackend for DriverBackend {
    type Source = TunerSource;

    fn resolve_channel(&self, channel: &str) -> Vec<TunerSource> {
        self.table.resolve(channel)
    }

    fn co_recordable(&self, left: &TunerSource, right: &TunerSource) -> bool {
        left.group == right.group
    }

    async fn reserve(&self) -> Result<Option<Command>, DeviceError> {
        if self.is_reserved() {
            return Ok(None);
        }

        let driver = self
            .launcher
            .launch(&self.name)
            .await
            .map_err(|e| DeviceError::ReserveFailed {
                device: self.name.clone(),
                reason: e.to_string(),
            })?;
        info!("[Driver {}] Driver launched", self.name);

        *self.driver.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&driver));

        let profile = self.name.clone();
        let init: Command = Box::new(move || -> Result<CommandFuture, DeviceError> {
            Ok(async move { driver.set_profile(&profile).await }.boxed())
        });
        Ok(Some(init))
    }

    fn tune(self: &Arc<Self>, source: &TunerSource) -> Command {
        let key = source.selection_key.clone();
        self.with_driver(move |driver| async move { driver.select(&key).await }.boxed())
    }

    fn begin_record(self: &Arc<Self>, source: &TunerSource, stream: StreamId, path: &Path) -> Command {
        let request = ReceiveRequest {
            stream,
            selection_key: source.selection_key.clone(),
            path: path.to_path_buf(),
        };
        self.with_driver(move |driver| async move { driver.add_source(request).await }.boxed())
    }

    fn end_record(self: &Arc<Self>, source: &TunerSource, stream: StreamId) -> Command {
        let key = source.selection_key.clone();
        self.with_driver(move |driver| {
            async move { driver.remove_source(&key, stream).await }.boxed()
        })
    }

    fn detune(self: &Arc<Self>) -> Command {
        self.with_driver(|driver| async move { driver.remove_all_sources().await }.boxed())
    }

    async fn release(&self) {
        if let Some(driver) = self.detach() {
            driver.shutdown().await;
            info!("[Driver {}] Driver released", self.name);
        }
    }

    async fn dispose(&self) {
        if let Some(driver) = self.detach() {
            warn!("[Driver {}] Shutting down driver still in use", self.name);
            driver.shutdown().await;
        }
        debug!("[Driver {}] Disposed", self.name);
    }
}

/// Creates driver-backed devices from per-device channel tables.
pub struct DriverDeviceFactory {
    launcher: Arc<dyn DriverLauncher>,
    tables: HashMap<String, ChannelTable>,
}

impl DriverDeviceFactory {
    pub fn new(launcher: Arc<dyn DriverLauncher>) -> Self {
        Self {
            launcher,
            tables: HashMap::new(),
        }
    }

    /// Register the channel table of a device.
    pub fn with_table(mut self, device: impl Into<String>, table: ChannelTable) -> Self {
        self.tables.insert(device.into(), table);
        self
    }
}

impl DeviceFactory for DriverDeviceFactory {
    fn create_device(
        &self,
        name: &str,
        priority: u32,
    ) -> Result<Arc<dyn RecordingDevice>, DeviceError> {
        let table = self
            .tables
            .get(name)
            .cloned()
            .ok_or_else(|| DeviceError::CreateFailed {
                device: name.to_string(),
                reason: "no channel table".to_string(),
            })?;
        let backend = DriverBackend::new(name, table, Arc::clone(&self.launcher));
        Ok(Arc::new(Device::new(name, priority, Arc::new(backend))))
    }
}
