//! Keeping the host awake while recordings are pending.

use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, PoisonError};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// Kind of sleep inhibition requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InhibitMode {
    /// Keep the system running but let it look asleep to the user.
    AwayMode,
    /// Keep the system fully awake.
    System,
}

/// Host power management hook.
///
/// Both operations report whether the request was honored.
pub trait SleepInhibitor: Send + Sync {
    fn inhibit(&self, mode: InhibitMode) -> bool;
    fn allow(&self) -> bool;
}

/// Configured inhibitor backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InhibitorKind {
    #[default]
    None,
    Systemd,
}

/// Inhibitor without any effect.
#[derive(Debug, Default)]
pub struct NoopInhibitor;

impl SleepInhibitor for NoopInhibitor {
    fn inhibit(&self, _: InhibitMode) -> bool {
        true
    }

    fn allow(&self) -> bool {
        true
    }
}

/// Holds a `systemd-inhibit` lock while sleep is inhibited.
pub struct SystemdInhibitor {
    program: String,
    lock: Mutex<Option<Child>>,
}

impl SystemdInhibitor {
    pub fn new() -> Self {
        Self::with_program("systemd-inhibit")
    }

    /// Use another `systemd-inhibit` binary.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            lock: Mutex::new(None),
        }
    }

    /// Check whether the inhibitor process is running.
    pub fn is_held(&self) -> bool {
        self.lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Default for SystemdInhibitor {
    fn default() -> Self {
        Self::new()
    }
}

impl SleepInhibitor for SystemdInhibitor {
    fn inhibit(&self, mode: InhibitMode) -> bool {
        if mode == InhibitMode::AwayMode {
            debug!("[Sleep] Away mode is not available through systemd");
            return false;
        }

        let mut lock = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        if lock.is_some() {
            return true;
        }

        let child = Command::new(&self.program)
            .arg("--what=sleep:idle")
            .arg("--who=tsrec-recorder")
            .arg("--why=Recording scheduled")
            .arg("--mode=block")
            .arg("sleep")
            .arg("infinity")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match child {
            Ok(child) => {
                info!("[Sleep] Sleep inhibited (pid {})", child.id());
                *lock = Some(child);
                true
            }
            Err(e) => {
                warn!("[Sleep] Failed to start {}: {}", self.program, e);
                false
            }
        }
    }

    fn allow(&self) -> bool {
        let child = self.lock.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(mut child) = child else {
            return true;
        };

        if let Err(e) = child.kill() {
            warn!("[Sleep] Failed to stop inhibitor: {}", e);
        }
        match child.wait() {
            Ok(_) => {
                info!("[Sleep] Sleep allowed again");
                true
            }
            Err(e) => {
                warn!("[Sleep] Failed to reap inhibitor: {}", e);
                false
            }
        }
    }
}

impl Drop for SystemdInhibitor {
    fn drop(&mut self) {
        self.allow();
    }
}

/// Build the configured inhibitor.
pub fn inhibitor(kind: InhibitorKind) -> Box<dyn SleepInhibitor> {
    match kind {
        InhibitorKind::None => Box::new(NoopInhibitor),
        InhibitorKind::Systemd => Box::new(SystemdInhibitor::new()),
    }
}
