//! Data exchanged with the remote recording scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Recorder API version reported by `ping`.
pub const API_VERSION: i32 = 1;

/// A channel as known to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Scheduler-side channel identifier.
    pub channel_id: Uuid,
    /// Display name, used to resolve sources on a device.
    pub display_name: String,
}

impl Channel {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            channel_id: Uuid::new_v4(),
            display_name: display_name.into(),
        }
    }
}

/// Assignment of a channel to a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAllocation {
    /// Name of the device (card) the recording runs on.
    pub card_id: String,
    /// Scheduler-side channel identifier.
    pub channel_id: Uuid,
    /// Display name of the allocated channel.
    pub channel_name: String,
}

impl ChannelAllocation {
    pub fn new(card_id: impl Into<String>, channel: &Channel) -> Self {
        Self {
            card_id: card_id.into(),
            channel_id: channel.channel_id,
            channel_name: channel.display_name.clone(),
        }
    }
}

/// A program scheduled for recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpcomingProgram {
    /// Unique key of the scheduled recording.
    pub upcoming_program_id: Uuid,
    /// Program title.
    pub title: String,
    /// Channel the program airs on.
    pub channel: Channel,
    /// Intended program start, without pre-record margin.
    pub start_time_utc: DateTime<Utc>,
    /// Intended program end, without post-record margin.
    pub stop_time_utc: DateTime<Utc>,
}

impl UpcomingProgram {
    pub fn new(
        title: impl Into<String>,
        channel: Channel,
        start_time_utc: DateTime<Utc>,
        stop_time_utc: DateTime<Utc>,
    ) -> Self {
        Self {
            upcoming_program_id: Uuid::new_v4(),
            title: title.into(),
            channel,
            start_time_utc,
            stop_time_utc,
        }
    }
}

/// A live stream handed out to a viewer.
///
/// Live viewing is not supported; the type exists so the service surface
/// can report an empty list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveStream {
    pub channel: Channel,
    pub rtsp_url: String,
}

/// Outcome of a live tuning request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiveStreamResult {
    Succeeded,
    NoFreeCardFound,
    ChannelTuneFailed,
    NotSupported,
}
