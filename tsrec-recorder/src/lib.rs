//! tsrec-recorder: recording device orchestration and activity scheduling.
//!
//! Recording requests from a remote scheduler become [`scheduler::RecordingActivity`]
//! instances polled by the [`scheduler::ActivityScheduler`]. Activities
//! allocate streams on [`device::RecordingDevice`]s, which serialize their
//! hardware commands through a per-device [`device::CommandQueue`].

pub mod callback;
pub mod config;
pub mod device;
pub mod logging;
pub mod scheduler;
pub mod service;

#[cfg(test)]
mod testing;

pub use config::RecorderConfig;
pub use service::{RecordingService, ServiceError};
