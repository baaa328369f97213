//! Operations offered to remote recording schedulers.
//!
//! [`RecordingService`] ties the device registry, the activity scheduler and
//! the callback connector together. A network front end maps its requests
//! one to one onto these methods.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use log::{info, warn};
use thiserror::Error;
use uuid::Uuid;

use tsrec_protocol::{
    Channel, ChannelAllocation, LiveStream, LiveStreamResult, UpcomingProgram, API_VERSION,
};

use crate::callback::{CallbackConnector, CallbackError};
use crate::config::{ConfigError, DirectoryUsage, RecorderConfig};
use crate::device::{DeviceError, DeviceFactory, DeviceRegistry};
use crate::scheduler::{ActivityScheduler, RecorderContext, RecordingRequest, SleepInhibitor};

/// Service errors.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Callback failed: {0}")]
    Callback(#[from] CallbackError),
}

/// The recorder as seen by a scheduler.
pub struct RecordingService {
    name: String,
    config: RecorderConfig,
    devices: Arc<DeviceRegistry>,
    scheduler: Arc<ActivityScheduler>,
    callbacks: Arc<dyn CallbackConnector>,
    /// Assigned by the scheduler on `initialize`.
    identifier: Mutex<Option<Uuid>>,
}

impl RecordingService {
    /// Create the devices and the scheduler. Must be called within a tokio
    /// runtime.
    pub fn new(
        config: RecorderConfig,
        factory: &dyn DeviceFactory,
        callbacks: Arc<dyn CallbackConnector>,
        inhibitor: Arc<dyn SleepInhibitor>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        let recording_directory = config
            .recording_directory()
            .ok_or_else(|| ConfigError::Invalid("no directory with recording usage".into()))?
            .to_path_buf();

        let devices = Arc::new(DeviceRegistry::new(
            &config.devices.names,
            config.devices.name_comparison,
            factory,
        )?);
        let context = Arc::new(RecorderContext {
            devices: Arc::clone(&devices),
            callbacks: Arc::clone(&callbacks),
            recording_directory,
            busy_retry: config.scheduler.busy_retry(),
        });
        let scheduler = Arc::new(ActivityScheduler::new(
            context,
            inhibitor,
            config.scheduler.poll_interval(),
        ));

        Ok(Self {
            name: config.service.name.clone(),
            config,
            devices,
            scheduler,
            callbacks,
            identifier: Mutex::new(None),
        })
    }

    /// Start the polling loop.
    pub fn start(&self) {
        info!(
            "[Service] {} starting with {} device(s)",
            self.name,
            self.config.devices.names.len()
        );
        self.scheduler.start();
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    pub fn scheduler(&self) -> &Arc<ActivityScheduler> {
        &self.scheduler
    }

    /// Identifier assigned by the last `initialize` call.
    pub fn identifier(&self) -> Option<Uuid> {
        *self
            .identifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Remember the recorder identifier and register with the scheduler.
    pub async fn initialize(
        &self,
        recorder_id: Uuid,
        host: &str,
        port: u16,
    ) -> Result<(), ServiceError> {
        *self
            .identifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(recorder_id);

        info!(
            "[Service] Registering as {} with {}:{}",
            recorder_id, host, port
        );
        self.callbacks
            .connect(host, port)
            .register_recorder_tuner(recorder_id, &self.name, env!("CARGO_PKG_VERSION"))
            .await?;
        Ok(())
    }

    pub fn ping(&self) -> i32 {
        API_VERSION
    }

    /// Network paths of the recording directories.
    pub fn recording_shares(&self) -> Vec<String> {
        self.config.shares(DirectoryUsage::Recording)
    }

    /// Network paths of the timeshift directories.
    pub fn timeshift_shares(&self) -> Vec<String> {
        self.config.shares(DirectoryUsage::Timeshift)
    }

    /// Pick a device for `channel` given the allocations already made.
    pub async fn allocate_card(
        &self,
        channel: &Channel,
        existing: &[ChannelAllocation],
        _use_reverse_priority: bool,
    ) -> Option<String> {
        self.devices.allocate(&channel.display_name, existing).await
    }

    /// Schedule a recording; `false` if one is already running for the
    /// program.
    pub async fn start_recording(&self, request: RecordingRequest) -> bool {
        let key = request.program.upcoming_program_id;
        self.scheduler.get_or_create(key).await.start(request).await
    }

    /// End a recording now; `false` if the program is not being recorded.
    pub async fn abort_recording(&self, host: &str, port: u16, program: &UpcomingProgram) -> bool {
        match self.scheduler.get(program.upcoming_program_id).await {
            Some(activity) => {
                info!(
                    "[Service] Abort of '{}' requested by {}:{}",
                    program.title, host, port
                );
                activity.abort().await
            }
            None => {
                warn!("[Service] No recording of '{}' to abort", program.title);
                false
            }
        }
    }

    /// Move the end of a recording.
    pub async fn validate_and_update_recording(
        &self,
        allocation: &ChannelAllocation,
        program: &UpcomingProgram,
        stop_time: DateTime<Utc>,
    ) -> bool {
        match self.scheduler.get(program.upcoming_program_id).await {
            Some(activity) => activity.set_new_stop_time(stop_time).await,
            None => {
                warn!(
                    "[Service] No recording of '{}' on {} to update",
                    program.title, allocation.card_id
                );
                false
            }
        }
    }

    /// Live streaming is not offered.
    pub fn get_live_streams(&self) -> Vec<LiveStream> {
        Vec::new()
    }

    pub fn tune_live_stream(
        &self,
        _channel: &Channel,
        _allocation: &ChannelAllocation,
    ) -> LiveStreamResult {
        LiveStreamResult::NotSupported
    }

    /// Stop scheduling and release all devices.
    pub async fn shutdown(&self) {
        info!("[Service] Shutting down");
        self.scheduler.stop().await;
        self.devices.dispose().await;
    }
}
