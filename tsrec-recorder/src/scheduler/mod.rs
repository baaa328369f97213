//! Recording activity scheduling.
//!
//! This module provides:
//! - [`RecordingActivity`]: Step machine of a single recording
//! - [`ActivityScheduler`]: Polling loop running due activities
//! - [`SleepInhibitor`]: Host power management while recordings are pending

pub mod activities;
pub mod activity;
pub mod sleep;

pub use activities::ActivityScheduler;
pub use activity::{ActivityError, RecorderContext, RecordingActivity, RecordingRequest};
pub use sleep::{InhibitMode, InhibitorKind, SleepInhibitor};
