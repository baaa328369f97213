//! Polling scheduler for recording activities.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::scheduler::activity::{RecorderContext, RecordingActivity};
use crate::scheduler::sleep::{InhibitMode, SleepInhibitor};

/// How long `stop` waits for the polling task.
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Owns all activities and runs them when they are due.
pub struct ActivityScheduler {
    activities: RwLock<HashMap<Uuid, Arc<RecordingActivity>>>,
    context: Arc<RecorderContext>,
    inhibitor: Arc<dyn SleepInhibitor>,
    /// Mirrors whether the host may sleep.
    sleep_allowed: AtomicBool,
    poll_interval: Duration,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ActivityScheduler {
    pub fn new(
        context: Arc<RecorderContext>,
        inhibitor: Arc<dyn SleepInhibitor>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            activities: RwLock::new(HashMap::new()),
            context,
            inhibitor,
            sleep_allowed: AtomicBool::new(true),
            poll_interval,
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the polling task. Calling it again has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() || self.shutdown.is_cancelled() {
            return;
        }
        let scheduler = Arc::clone(self);
        *worker = Some(tokio::spawn(async move { scheduler.run().await }));
    }

    async fn run(&self) {
        info!(
            "[Scheduler] Polling activities every {:?}",
            self.poll_interval
        );
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.tick().await;
        }
        info!("[Scheduler] Stopped");
    }

    /// One polling round.
    pub async fn tick(&self) {
        if !self.is_empty().await && self.sleep_allowed.load(Ordering::SeqCst) {
            self.inhibit_sleep();
        }

        let now = Utc::now();
        let due: Vec<_> = self
            .activities
            .read()
            .await
            .values()
            .filter(|activity| activity.is_due(now))
            .cloned()
            .collect();

        for activity in due {
            if self.shutdown.is_cancelled() {
                return;
            }

            let key = activity.key();
            let keep = match tokio::spawn(async move { activity.run().await }).await {
                Ok(Ok(more)) => more,
                Ok(Err(e)) => {
                    error!("[Scheduler] Activity {} failed: {}", key, e);
                    false
                }
                Err(e) => {
                    error!("[Scheduler] Activity {} panicked: {}", key, e);
                    false
                }
            };
            if !keep {
                self.remove(key).await;
            }
        }

        if self.is_empty().await && !self.sleep_allowed.load(Ordering::SeqCst) {
            self.allow_sleep();
        }
    }

    fn inhibit_sleep(&self) {
        if self.inhibitor.inhibit(InhibitMode::AwayMode) {
            debug!("[Scheduler] Sleep inhibited (away mode)");
        } else if self.inhibitor.inhibit(InhibitMode::System) {
            debug!("[Scheduler] Sleep inhibited");
        } else {
            warn!("[Scheduler] Unable to inhibit sleep");
            return;
        }
        self.sleep_allowed.store(false, Ordering::SeqCst);
    }

    fn allow_sleep(&self) {
        if self.inhibitor.allow() {
            debug!("[Scheduler] Sleep allowed");
            self.sleep_allowed.store(true, Ordering::SeqCst);
        } else {
            warn!("[Scheduler] Unable to allow sleep");
        }
    }

    /// Get the activity for `key`, creating an idle one if needed.
    pub async fn get_or_create(&self, key: Uuid) -> Arc<RecordingActivity> {
        if let Some(activity) = self.activities.read().await.get(&key) {
            return Arc::clone(activity);
        }

        let mut activities = self.activities.write().await;
        Arc::clone(activities.entry(key).or_insert_with(|| {
            debug!("[Scheduler] New activity {}", key);
            Arc::new(RecordingActivity::new(key, Arc::clone(&self.context)))
        }))
    }

    pub async fn get(&self, key: Uuid) -> Option<Arc<RecordingActivity>> {
        self.activities.read().await.get(&key).cloned()
    }

    async fn remove(&self, key: Uuid) {
        if self.activities.write().await.remove(&key).is_some() {
            debug!("[Scheduler] Activity {} removed", key);
        }
    }

    pub async fn len(&self) -> usize {
        self.activities.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.activities.read().await.is_empty()
    }

    /// Check whether the host is currently kept awake.
    pub fn sleep_inhibited(&self) -> bool {
        !self.sleep_allowed.load(Ordering::SeqCst)
    }

    /// Stop polling and let the host sleep again.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
                warn!("[Scheduler] Polling task did not stop in time, aborting");
                handle.abort();
            }
        }

        if !self.sleep_allowed.swap(true, Ordering::SeqCst) && !self.inhibitor.allow() {
            warn!("[Scheduler] Unable to allow sleep on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::CallbackEvent;
    use crate::scheduler::activity::RecordingRequest;
    use crate::testing::{self, MockFactory, RecordingConnector, RecordingInhibitor};
    use chrono::{DateTime, Duration as TimeDelta};
    use tsrec_protocol::{Channel, ChannelAllocation, UpcomingProgram};

    struct Fixture {
        factory: MockFactory,
        connector: Arc<RecordingConnector>,
        inhibitor: Arc<RecordingInhibitor>,
        scheduler: Arc<ActivityScheduler>,
        _dir: tempfile::TempDir,
    }

    fn fixture(away_mode: bool) -> Fixture {
        let factory = MockFactory::new(&[("ZDF", "mux1")]);
        let connector = Arc::new(RecordingConnector::default());
        let inhibitor = Arc::new(RecordingInhibitor::new(away_mode));
        let dir = tempfile::tempdir().unwrap();
        let context = testing::context(&factory, &["tuner0"], connector.clone(), dir.path());
        let scheduler = Arc::new(ActivityScheduler::new(
            context,
            inhibitor.clone(),
            Duration::from_millis(20),
        ));
        Fixture {
            factory,
            connector,
            inhibitor,
            scheduler,
            _dir: dir,
        }
    }

    fn request(card: &str, start: DateTime<Utc>, stop: DateTime<Utc>) -> RecordingRequest {
        let channel = Channel::new("ZDF");
        RecordingRequest {
            host: "scheduler".into(),
            port: 49942,
            allocation: ChannelAllocation::new(card, &channel),
            start_time: start,
            stop_time: stop,
            program: UpcomingProgram::new("News", channel, start, stop),
            suggested_name: None,
        }
    }

    async fn wait_until_empty(scheduler: &ActivityScheduler) {
        for _ in 0..300 {
            if scheduler.is_empty().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("activities did not finish");
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_activity() {
        let f = fixture(true);
        let key = Uuid::new_v4();

        let first = f.scheduler.get_or_create(key).await;
        let second = f.scheduler.get_or_create(key).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(f.scheduler.len().await, 1);
        assert!(f.scheduler.get(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_idle_tick_leaves_sleep_alone() {
        let f = fixture(true);
        f.scheduler.tick().await;
        assert!(f.inhibitor.calls().is_empty());
        assert!(!f.scheduler.sleep_inhibited());
    }

    #[tokio::test]
    async fn test_sleep_falls_back_to_system_mode() {
        let f = fixture(false);
        let now = Utc::now();
        let activity = f.scheduler.get_or_create(Uuid::new_v4()).await;
        activity
            .start(request("tuner0", now + TimeDelta::hours(1), now + TimeDelta::hours(2)))
            .await;

        f.scheduler.tick().await;
        assert!(f.scheduler.sleep_inhibited());
        assert_eq!(f.inhibitor.calls(), vec!["inhibit:AwayMode", "inhibit:System"]);

        // Already inhibited
        f.scheduler.tick().await;
        assert_eq!(f.inhibitor.calls().len(), 2);

        f.scheduler.stop().await;
        assert!(!f.scheduler.sleep_inhibited());
        assert_eq!(f.inhibitor.calls().last().unwrap(), "allow");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_device_reported_once() {
        let f = fixture(true);
        f.scheduler.start();

        let now = Utc::now();
        let activity = f.scheduler.get_or_create(Uuid::new_v4()).await;
        assert!(activity.start(request("tuner9", now, now + TimeDelta::hours(1))).await);

        wait_until_empty(&f.scheduler).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        f.scheduler.stop().await;

        let events = f.connector.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            CallbackEvent::StartRecordingFailed { reason, .. } if reason == "bad device name"
        ));
        assert!(f.factory.backend("tuner0").unwrap().calls().is_empty());
        assert!(!f.scheduler.sleep_inhibited());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_recording_lifecycle() {
        let f = fixture(true);
        f.scheduler.start();

        let now = Utc::now();
        let key = Uuid::new_v4();
        let activity = f.scheduler.get_or_create(key).await;
        assert!(activity.start(request("tuner0", now, now + TimeDelta::milliseconds(300))).await);

        wait_until_empty(&f.scheduler).await;
        f.scheduler.stop().await;

        let events = f.connector.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], CallbackEvent::AddNewRecording { .. }));
        assert!(matches!(
            events[1],
            CallbackEvent::EndRecording { success: true, .. }
        ));

        let calls = f.factory.backend("tuner0").unwrap().calls();
        assert_eq!(
            calls,
            vec![
                "reserve",
                "tune:ZDF@mux1",
                "begin:ZDF@mux1",
                "end:ZDF@mux1",
                "detune",
                "release",
            ]
        );
        assert!(f.scheduler.get(key).await.is_none());
        assert_eq!(
            f.inhibitor.calls(),
            vec!["inhibit:AwayMode", "allow"]
        );
    }

    #[tokio::test]
    async fn test_failed_activity_is_removed() {
        let f = fixture(true);
        f.connector.fail_add_new_recording(true);

        let now = Utc::now();
        let activity = f.scheduler.get_or_create(Uuid::new_v4()).await;
        activity
            .start(request("tuner0", now, now + TimeDelta::hours(1)))
            .await;

        f.scheduler.tick().await;
        assert!(f.scheduler.is_empty().await);
        assert!(!f.scheduler.sleep_inhibited());
    }

    #[tokio::test]
    async fn test_stop_prevents_further_runs() {
        let f = fixture(true);
        f.scheduler.start();
        f.scheduler.stop().await;

        let now = Utc::now();
        let activity = f.scheduler.get_or_create(Uuid::new_v4()).await;
        activity
            .start(request("tuner9", now, now + TimeDelta::hours(1)))
            .await;

        // Restarting a stopped scheduler does nothing
        f.scheduler.start();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(f.scheduler.len().await, 1);
        assert!(f.connector.events().is_empty());
    }
}
