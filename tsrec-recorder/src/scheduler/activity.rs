//! Lifecycle of a single recording.
//!
//! An activity is driven by the scheduler's polling loop. Each call to
//! [`RecordingActivity::run`] executes the current step and schedules the
//! next wake-up:
//!
//! ```text
//!  start() ──► Validate ──► Start ──► Finish ──► Done
//!                 │           │ ▲
//!                 │           └─┘ device busy, retry
//!                 └──► report failure, Done
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use tsrec_protocol::{ChannelAllocation, UpcomingProgram};

use crate::callback::{CallbackConnector, CallbackError, SchedulerCallback};
use crate::device::{DeviceError, DeviceRegistry, RecordingDevice, SourceResolution, StreamId};

/// Wake time of an activity that has nothing to do.
const NEVER: i64 = i64::MAX;

/// Errors that end an activity abnormally.
#[derive(Debug, Error)]
pub enum ActivityError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Scheduler callback failed: {0}")]
    Callback(#[from] CallbackError),
}

/// Everything an activity needs from the recorder.
pub struct RecorderContext {
    pub devices: Arc<DeviceRegistry>,
    pub callbacks: Arc<dyn CallbackConnector>,
    /// Directory new recordings are written to.
    pub recording_directory: PathBuf,
    /// Delay before retrying a busy device.
    pub busy_retry: Duration,
}

/// Parameters of a start request.
#[derive(Debug, Clone)]
pub struct RecordingRequest {
    /// Scheduler to report to.
    pub host: String,
    pub port: u16,
    pub allocation: ChannelAllocation,
    /// Recording start including pre-record margin.
    pub start_time: DateTime<Utc>,
    /// Recording end including post-record margin.
    pub stop_time: DateTime<Utc>,
    pub program: UpcomingProgram,
    /// File name without extension; a random one is used if empty.
    pub suggested_name: Option<String>,
}

enum Step {
    Validate,
    Start {
        device: Arc<dyn RecordingDevice>,
        sources: SourceResolution,
    },
    Finish {
        device: Arc<dyn RecordingDevice>,
        stream: Option<StreamId>,
    },
    Done,
}

/// State of a started activity.
struct Recording {
    request: RecordingRequest,
    path: PathBuf,
    current_end: DateTime<Utc>,
    step: Step,
    incomplete: bool,
    aborted: bool,
}

/// One recording tracked from validation to completion.
pub struct RecordingActivity {
    key: Uuid,
    context: Arc<RecorderContext>,
    /// `None` until started. Held for the whole duration of a step.
    state: Mutex<Option<Recording>>,
    /// Next wake-up in microseconds since the epoch.
    wake: AtomicI64,
}

impl RecordingActivity {
    pub fn new(key: Uuid, context: Arc<RecorderContext>) -> Self {
        Self {
            key,
            context,
            state: Mutex::new(None),
            wake: AtomicI64::new(NEVER),
        }
    }

    pub fn key(&self) -> Uuid {
        self.key
    }

    /// Start the activity; `false` if it was started before.
    pub async fn start(&self, request: RecordingRequest) -> bool {
        let mut state = self.state.lock().await;
        if state.is_some() {
            debug!("[Activity {}] Already running", self.key);
            return false;
        }

        let name = match request.suggested_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => Uuid::new_v4().simple().to_string(),
        };
        let path = self
            .context
            .recording_directory
            .join(format!("{}.ts", name));

        info!(
            "[Activity {}] '{}' on {}/{} from {} to {} into {}",
            self.key,
            request.program.title,
            request.allocation.card_id,
            request.allocation.channel_name,
            request.start_time,
            request.stop_time,
            path.display()
        );

        *state = Some(Recording {
            current_end: request.stop_time,
            request,
            path,
            step: Step::Validate,
            incomplete: false,
            aborted: false,
        });
        self.set_wake(Utc::now());
        true
    }

    /// Move the end of the recording; `false` if not started.
    pub async fn set_new_stop_time(&self, new_end: DateTime<Utc>) -> bool {
        self.modify_end(new_end, false).await
    }

    /// End the recording now; `false` if not started.
    pub async fn abort(&self) -> bool {
        self.modify_end(Utc::now(), true).await
    }

    async fn modify_end(&self, new_end: DateTime<Utc>, abort: bool) -> bool {
        let mut state = self.state.lock().await;
        let Some(recording) = state.as_mut() else {
            warn!("[Activity {}] Cannot change end, not started", self.key);
            return false;
        };

        // Never reset once set
        if abort {
            recording.aborted = true;
        }
        recording.current_end = new_end;
        if new_end.timestamp_micros() < self.wake.load(Ordering::SeqCst) {
            self.set_wake(new_end);
        }

        info!(
            "[Activity {}] End moved to {}{}",
            self.key,
            new_end,
            if abort { " (aborted)" } else { "" }
        );
        true
    }

    /// Run the current step, and the following ones while they are due.
    ///
    /// Returns `Ok(false)` once the activity has nothing more to do.
    pub async fn run(&self) -> Result<bool, ActivityError> {
        let mut state = self.state.lock().await;
        let Some(recording) = state.as_mut() else {
            return Ok(true);
        };

        loop {
            let more = match std::mem::replace(&mut recording.step, Step::Done) {
                Step::Validate => self.validate(recording).await,
                Step::Start { device, sources } => self.begin(recording, device, sources).await?,
                Step::Finish { device, stream } => self.finish(recording, device, stream).await?,
                Step::Done => return Ok(true),
            };
            if !more {
                return Ok(false);
            }
            if !self.is_due(Utc::now()) {
                return Ok(true);
            }
        }
    }

    async fn validate(&self, recording: &mut Recording) -> bool {
        match self.resolve(&recording.request).await {
            Ok((device, sources)) => {
                debug!(
                    "[Activity {}] Validated, {} source(s) on {}",
                    self.key,
                    sources.len(),
                    device.name()
                );
                recording.step = Step::Start { device, sources };
                self.set_wake(recording.request.start_time);
                true
            }
            Err(reason) => {
                warn!("[Activity {}] Cannot record: {}", self.key, reason);
                let request = &recording.request;
                if let Err(e) = self
                    .sink(request)
                    .start_recording_failed(&request.allocation, &request.program, reason)
                    .await
                {
                    error!("[Activity {}] Failed to report failure: {}", self.key, e);
                }
                self.clear_wake();
                false
            }
        }
    }

    async fn resolve(
        &self,
        request: &RecordingRequest,
    ) -> Result<(Arc<dyn RecordingDevice>, SourceResolution), &'static str> {
        if request.stop_time < request.start_time {
            return Err("ends before start");
        }
        let device = self
            .context
            .devices
            .get(&request.allocation.card_id)
            .await
            .ok_or("bad device name")?;
        let sources = device
            .resolve(&request.allocation.channel_name)
            .ok_or("no such channel")?;
        Ok((device, sources))
    }

    async fn begin(
        &self,
        recording: &mut Recording,
        device: Arc<dyn RecordingDevice>,
        sources: SourceResolution,
    ) -> Result<bool, ActivityError> {
        let mut stream = None;

        if Utc::now() < recording.current_end {
            let started = device.start(&sources, &recording.path).await?;
            let Some(started) = started else {
                debug!("[Activity {}] {} busy, retrying", self.key, device.name());
                let retry = chrono::Duration::from_std(self.context.busy_retry)
                    .unwrap_or_else(|_| chrono::Duration::seconds(1));
                recording.step = Step::Start { device, sources };
                self.set_wake(Utc::now() + retry);
                return Ok(true);
            };
            stream = Some(started);

            let now = Utc::now();
            if now > recording.request.program.start_time_utc {
                recording.incomplete = true;
            }

            let request = &recording.request;
            if let Err(e) = self
                .sink(request)
                .add_new_recording(&request.program, now, &recording.path)
                .await
            {
                device.stop(started).await;
                return Err(e.into());
            }
            info!("[Activity {}] Recording on {}", self.key, device.name());
        } else {
            debug!("[Activity {}] End passed before the recording started", self.key);
            recording.incomplete = true;
        }

        recording.step = Step::Finish { device, stream };
        self.set_wake(recording.current_end);
        Ok(true)
    }

    async fn finish(
        &self,
        recording: &mut Recording,
        device: Arc<dyn RecordingDevice>,
        stream: Option<StreamId>,
    ) -> Result<bool, ActivityError> {
        if Utc::now() < recording.request.program.stop_time_utc {
            recording.incomplete = true;
        }
        if let Some(stream) = stream {
            device.stop(stream).await;
        }
        self.clear_wake();

        info!(
            "[Activity {}] Finished {} (incomplete={}, aborted={})",
            self.key,
            recording.path.display(),
            recording.incomplete,
            recording.aborted
        );
        self.sink(&recording.request)
            .end_recording(&recording.path, Utc::now(), recording.incomplete, true)
            .await?;
        Ok(false)
    }

    fn sink(&self, request: &RecordingRequest) -> Arc<dyn SchedulerCallback> {
        self.context.callbacks.connect(&request.host, request.port)
    }

    fn set_wake(&self, time: DateTime<Utc>) {
        self.wake.store(time.timestamp_micros(), Ordering::SeqCst);
    }

    fn clear_wake(&self) {
        self.wake.store(NEVER, Ordering::SeqCst);
    }

    /// Earliest time the activity wants to run; `None` while idle.
    pub fn next_wake_time(&self) -> Option<DateTime<Utc>> {
        match self.wake.load(Ordering::SeqCst) {
            NEVER => None,
            micros => DateTime::from_timestamp_micros(micros),
        }
    }

    /// Check whether the activity should run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.wake.load(Ordering::SeqCst) <= now.timestamp_micros()
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.is_some()
    }

    pub async fn is_aborted(&self) -> bool {
        self.state
            .lock()
            .await
            .as_ref()
            .is_some_and(|recording| recording.aborted)
    }

    /// Target file of the recording, once started.
    pub async fn recording_path(&self) -> Option<PathBuf> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|recording| recording.path.clone())
    }
}
