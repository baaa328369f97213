//! Reporting to the remote recording scheduler.
//!
//! Every start request carries the address of the scheduler that issued it.
//! A [`CallbackConnector`] turns that address into a [`SchedulerCallback`]
//! sink the recording activity reports its progress to.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use tsrec_protocol::{ChannelAllocation, UpcomingProgram};

#[cfg(feature = "webhook")]
use reqwest::Client;

/// Errors reporting to the scheduler.
#[derive(Debug, Error)]
pub enum CallbackError {
    /// The request could not be delivered.
    #[cfg(feature = "webhook")]
    #[error("Callback request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The scheduler answered with an error status.
    #[error("Scheduler rejected {event}: HTTP {status}")]
    Rejected { event: &'static str, status: u16 },

    /// Any other delivery failure.
    #[error("Callback failed: {0}")]
    Failed(String),
}

/// An event reported to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CallbackEvent {
    RegisterRecorderTuner {
        recorder_id: Uuid,
        name: String,
        version: String,
    },
    StartRecordingFailed {
        allocation: ChannelAllocation,
        program: UpcomingProgram,
        reason: String,
    },
    AddNewRecording {
        program: UpcomingProgram,
        timestamp: DateTime<Utc>,
        path: PathBuf,
    },
    EndRecording {
        path: PathBuf,
        timestamp: DateTime<Utc>,
        incomplete: bool,
        success: bool,
    },
}

impl CallbackEvent {
    /// Event name as used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RegisterRecorderTuner { .. } => "register_recorder_tuner",
            Self::StartRecordingFailed { .. } => "start_recording_failed",
            Self::AddNewRecording { .. } => "add_new_recording",
            Self::EndRecording { .. } => "end_recording",
        }
    }
}

/// Progress sink of one scheduler.
#[async_trait]
pub trait SchedulerCallback: Send + Sync {
    /// Announce this recorder.
    async fn register_recorder_tuner(
        &self,
        recorder_id: Uuid,
        name: &str,
        version: &str,
    ) -> Result<(), CallbackError>;

    /// A recording could not be started at all.
    async fn start_recording_failed(
        &self,
        allocation: &ChannelAllocation,
        program: &UpcomingProgram,
        reason: &str,
    ) -> Result<(), CallbackError>;

    /// A recording has started writing to `path`.
    async fn add_new_recording(
        &self,
        program: &UpcomingProgram,
        timestamp: DateTime<Utc>,
        path: &Path,
    ) -> Result<(), CallbackError>;

    /// A recording has ended.
    async fn end_recording(
        &self,
        path: &Path,
        timestamp: DateTime<Utc>,
        incomplete: bool,
        success: bool,
    ) -> Result<(), CallbackError>;
}

/// Maps a scheduler address to its callback sink.
pub trait CallbackConnector: Send + Sync {
    fn connect(&self, host: &str, port: u16) -> Arc<dyn SchedulerCallback>;
}

/// Sink for schedulers reachable only through some other channel: every
/// event is written to the log.
struct LogCallback {
    address: String,
}

#[async_trait]
impl SchedulerCallback for LogCallback {
    async fn register_recorder_tuner(
        &self,
        recorder_id: Uuid,
        name: &str,
        version: &str,
    ) -> Result<(), CallbackError> {
        info!(
            "[Callback {}] Recorder {} registered as {} (version {})",
            self.address, recorder_id, name, version
        );
        Ok(())
    }

    async fn start_recording_failed(
        &self,
        allocation: &ChannelAllocation,
        program: &UpcomingProgram,
        reason: &str,
    ) -> Result<(), CallbackError> {
        info!(
            "[Callback {}] Recording of '{}' on {}/{} failed: {}",
            self.address, program.title, allocation.card_id, allocation.channel_name, reason
        );
        Ok(())
    }

    async fn add_new_recording(
        &self,
        program: &UpcomingProgram,
        timestamp: DateTime<Utc>,
        path: &Path,
    ) -> Result<(), CallbackError> {
        info!(
            "[Callback {}] Recording of '{}' started at {} into {}",
            self.address,
            program.title,
            timestamp,
            path.display()
        );
        Ok(())
    }

    async fn end_recording(
        &self,
        path: &Path,
        timestamp: DateTime<Utc>,
        incomplete: bool,
        success: bool,
    ) -> Result<(), CallbackError> {
        info!(
            "[Callback {}] Recording {} ended at {} (incomplete={}, success={})",
            self.address,
            path.display(),
            timestamp,
            incomplete,
            success
        );
        Ok(())
    }
}

/// Connector producing logging sinks.
#[derive(Debug, Default)]
pub struct LogCallbackConnector;

impl CallbackConnector for LogCallbackConnector {
    fn connect(&self, host: &str, port: u16) -> Arc<dyn SchedulerCallback> {
        Arc::new(LogCallback {
            address: format!("{}:{}", host, port),
        })
    }
}

/// Connector posting events as JSON to `http://host:port/<path>`.
#[cfg(feature = "webhook")]
pub struct WebhookConnector {
    client: Client,
    path: String,
}

#[cfg(feature = "webhook")]
impl WebhookConnector {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            path: path.into(),
        }
    }

    fn url(&self, host: &str, port: u16) -> String {
        let path = self.path.trim_start_matches('/');
        if host.contains(':') {
            format!("http://[{}]:{}/{}", host, port, path)
        } else {
            format!("http://{}:{}/{}", host, port, path)
        }
    }
}

#[cfg(feature = "webhook")]
impl CallbackConnector for WebhookConnector {
    fn connect(&self, host: &str, port: u16) -> Arc<dyn SchedulerCallback> {
        Arc::new(WebhookCallback {
            client: self.client.clone(),
            url: self.url(host, port),
        })
    }
}

#[cfg(feature = "webhook")]
struct WebhookCallback {
    client: Client,
    url: String,
}

#[cfg(feature = "webhook")]
impl WebhookCallback {
    async fn send(&self, event: CallbackEvent) -> Result<(), CallbackError> {
        let response = self.client.post(&self.url).json(&event).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CallbackError::Rejected {
                event: event.name(),
                status: status.as_u16(),
            });
        }
        log::debug!("[Callback] {} delivered to {}", event.name(), self.url);
        Ok(())
    }
}

#[cfg(feature = "webhook")]
#[async_trait]
impl SchedulerCallback for WebhookCallback {
    async fn register_recorder_tuner(
        &self,
        recorder_id: Uuid,
        name: &str,
        version: &str,
    ) -> Result<(), CallbackError> {
        self.send(CallbackEvent::RegisterRecorderTuner {
            recorder_id,
            name: name.to_string(),
            version: version.to_string(),
        })
        .await
    }

    async fn start_recording_failed(
        &self,
        allocation: &ChannelAllocation,
        program: &UpcomingProgram,
        reason: &str,
    ) -> Result<(), CallbackError> {
        self.send(CallbackEvent::StartRecordingFailed {
            allocation: allocation.clone(),
            program: program.clone(),
            reason: reason.to_string(),
        })
        .await
    }

    async fn add_new_recording(
        &self,
        program: &UpcomingProgram,
        timestamp: DateTime<Utc>,
        path: &Path,
    ) -> Result<(), CallbackError> {
        self.send(CallbackEvent::AddNewRecording {
            program: program.clone(),
            timestamp,
            path: path.to_path_buf(),
        })
        .await
    }

    async fn end_recording(
        &self,
        path: &Path,
        timestamp: DateTime<Utc>,
        incomplete: bool,
        success: bool,
    ) -> Result<(), CallbackError> {
        self.send(CallbackEvent::EndRecording {
            path: path.to_path_buf(),
            timestamp,
            incomplete,
            success,
        })
        .await
    }
}
