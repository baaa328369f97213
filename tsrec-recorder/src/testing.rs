//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use uuid::Uuid;

use tsrec_protocol::{ChannelAllocation, UpcomingProgram};

use crate::callback::{CallbackConnector, CallbackError, CallbackEvent, SchedulerCallback};
use crate::device::{
    Command, CommandFuture, Device, DeviceBackend, DeviceError, DeviceFactory, DeviceRegistry,
    NameComparison, RecordingDevice, StreamId,
};
use crate::scheduler::activity::RecorderContext;
use crate::scheduler::sleep::{InhibitMode, SleepInhibitor};

pub(crate) fn noop() -> Result<CommandFuture, DeviceError> {
    Ok(async { Ok(()) }.boxed())
}

/// Channel `name` carried on multiplex `group`.
#[derive(Clone, PartialEq, Eq)]
pub(crate) struct MockSource {
    pub name: String,
    pub group: String,
}

impl fmt::Display for MockSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.group)
    }
}

impl fmt::Debug for MockSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Backend recording every call it sees.
#[derive(Default)]
pub(crate) struct MockBackend {
    channels: HashMap<String, Vec<MockSource>>,
    calls: Arc<Mutex<Vec<String>>>,
    fail_reserve: AtomicBool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(mut self, name: &str, groups: &[&str]) -> Self {
        let sources = groups
            .iter()
            .map(|group| MockSource {
                name: name.to_string(),
                group: group.to_string(),
            })
            .collect();
        self.channels.insert(name.to_string(), sources);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_reserve(&self, fail: bool) {
        self.fail_reserve.store(fail, Ordering::SeqCst);
    }

    fn push(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn recorded(&self, call: String) -> Command {
        let calls = Arc::clone(&self.calls);
        Box::new(move || {
            calls.lock().unwrap().push(call);
            noop()
        })
    }
}

#[async_trait]
impl DeviceBackend for MockBackend {
    type Source = MockSource;

    fn resolve_channel(&self, channel: &str) -> Vec<MockSource> {
        self.channels.get(channel).cloned().unwrap_or_default()
    }

    fn co_recordable(&self, left: &MockSource, right: &MockSource) -> bool {
        left.group == right.group
    }

    async fn reserve(&self) -> Result<Option<Command>, DeviceError> {
        if self.fail_reserve.load(Ordering::SeqCst) {
            return Err(DeviceError::ReserveFailed {
                device: "mock".into(),
                reason: "hardware missing".into(),
            });
        }
        self.push("reserve");
        Ok(None)
    }

    fn tune(self: &Arc<Self>, source: &MockSource) -> Command {
        self.recorded(format!("tune:{}", source))
    }

    fn begin_record(self: &Arc<Self>, source: &MockSource, _: StreamId, _: &Path) -> Command {
        self.recorded(format!("begin:{}", source))
    }

    fn end_record(self: &Arc<Self>, source: &MockSource, _: StreamId) -> Command {
        self.recorded(format!("end:{}", source))
    }

    fn detune(self: &Arc<Self>) -> Command {
        self.recorded("detune".into())
    }

    async fn release(&self) {
        self.push("release");
    }

    async fn dispose(&self) {
        self.push("dispose");
    }
}

/// Factory creating [`MockBackend`] devices and keeping hold of them.
pub(crate) struct MockFactory {
    channels: Vec<(String, String)>,
    overrides: HashMap<String, Vec<(String, String)>>,
    backends: Mutex<HashMap<String, Arc<MockBackend>>>,
}

fn owned(channels: &[(&str, &str)]) -> Vec<(String, String)> {
    channels
        .iter()
        .map(|(name, group)| (name.to_string(), group.to_string()))
        .collect()
}

impl MockFactory {
    /// Every device receives the given `(channel, group)` pairs.
    pub fn new(channels: &[(&str, &str)]) -> Self {
        Self {
            channels: owned(channels),
            overrides: HashMap::new(),
            backends: Mutex::new(HashMap::new()),
        }
    }

    /// Give one device its own channel list.
    pub fn with_device_channels(mut self, device: &str, channels: &[(&str, &str)]) -> Self {
        self.overrides.insert(device.to_string(), owned(channels));
        self
    }

    pub fn backend(&self, device: &str) -> Option<Arc<MockBackend>> {
        self.backends.lock().unwrap().get(device).cloned()
    }
}

impl DeviceFactory for MockFactory {
    fn create_device(
        &self,
        name: &str,
        priority: u32,
    ) -> Result<Arc<dyn RecordingDevice>, DeviceError> {
        let channels = self.overrides.get(name).unwrap_or(&self.channels);
        let mut groups: HashMap<&str, Vec<&str>> = HashMap::new();
        for (channel, group) in channels {
            groups.entry(channel.as_str()).or_default().push(group.as_str());
        }

        let backend = groups
            .into_iter()
            .fold(MockBackend::new(), |backend, (channel, list)| {
                backend.with_channel(channel, &list)
            });
        let backend = Arc::new(backend);
        self.backends
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::clone(&backend));
        Ok(Arc::new(Device::new(name, priority, backend)))
    }
}

/// Callback sink appending events to a shared log.
struct RecordingCallback {
    events: Arc<Mutex<Vec<CallbackEvent>>>,
    fail_add_new_recording: Arc<AtomicBool>,
}

impl RecordingCallback {
    fn push(&self, event: CallbackEvent) -> Result<(), CallbackError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

#[async_trait]
impl SchedulerCallback for RecordingCallback {
    async fn register_recorder_tuner(
        &self,
        recorder_id: Uuid,
        name: &str,
        version: &str,
    ) -> Result<(), CallbackError> {
        self.push(CallbackEvent::RegisterRecorderTuner {
            recorder_id,
            name: name.to_string(),
            version: version.to_string(),
        })
    }

    async fn start_recording_failed(
        &self,
        allocation: &ChannelAllocation,
        program: &UpcomingProgram,
        reason: &str,
    ) -> Result<(), CallbackError> {
        self.push(CallbackEvent::StartRecordingFailed {
            allocation: allocation.clone(),
            program: program.clone(),
            reason: reason.to_string(),
        })
    }

    async fn add_new_recording(
        &self,
        program: &UpcomingProgram,
        timestamp: DateTime<Utc>,
        path: &Path,
    ) -> Result<(), CallbackError> {
        if self.fail_add_new_recording.load(Ordering::SeqCst) {
            return Err(CallbackError::Failed("scheduler unreachable".into()));
        }
        self.push(CallbackEvent::AddNewRecording {
            program: program.clone(),
            timestamp,
            path: path.to_path_buf(),
        })
    }

    async fn end_recording(
        &self,
        path: &Path,
        timestamp: DateTime<Utc>,
        incomplete: bool,
        success: bool,
    ) -> Result<(), CallbackError> {
        self.push(CallbackEvent::EndRecording {
            path: path.to_path_buf(),
            timestamp,
            incomplete,
            success,
        })
    }
}

/// Connector whose sinks all share one event log.
#[derive(Default)]
pub(crate) struct RecordingConnector {
    events: Arc<Mutex<Vec<CallbackEvent>>>,
    addresses: Mutex<Vec<(String, u16)>>,
    fail_add_new_recording: Arc<AtomicBool>,
}

impl RecordingConnector {
    pub fn events(&self) -> Vec<CallbackEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Every address connected to, in order.
    pub fn addresses(&self) -> Vec<(String, u16)> {
        self.addresses.lock().unwrap().clone()
    }

    pub fn fail_add_new_recording(&self, fail: bool) {
        self.fail_add_new_recording.store(fail, Ordering::SeqCst);
    }
}

impl CallbackConnector for RecordingConnector {
    fn connect(&self, host: &str, port: u16) -> Arc<dyn SchedulerCallback> {
        self.addresses
            .lock()
            .unwrap()
            .push((host.to_string(), port));
        Arc::new(RecordingCallback {
            events: Arc::clone(&self.events),
            fail_add_new_recording: Arc::clone(&self.fail_add_new_recording),
        })
    }
}

/// Inhibitor logging requests; away mode support is configurable.
pub(crate) struct RecordingInhibitor {
    away_mode: bool,
    calls: Mutex<Vec<String>>,
}

impl RecordingInhibitor {
    pub fn new(away_mode: bool) -> Self {
        Self {
            away_mode,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl SleepInhibitor for RecordingInhibitor {
    fn inhibit(&self, mode: InhibitMode) -> bool {
        self.calls.lock().unwrap().push(format!("inhibit:{:?}", mode));
        self.away_mode || mode == InhibitMode::System
    }

    fn allow(&self) -> bool {
        self.calls.lock().unwrap().push("allow".into());
        true
    }
}

/// Recorder context over mock devices named `devices`.
pub(crate) fn context(
    factory: &MockFactory,
    devices: &[&str],
    connector: Arc<RecordingConnector>,
    recording_directory: &Path,
) -> Arc<RecorderContext> {
    let names: Vec<String> = devices.iter().map(|name| name.to_string()).collect();
    let registry = DeviceRegistry::new(&names, NameComparison::Ordinal, factory).unwrap();
    Arc::new(RecorderContext {
        devices: Arc::new(registry),
        callbacks: connector,
        recording_directory: recording_directory.to_path_buf(),
        busy_retry: Duration::from_millis(50),
    })
}
