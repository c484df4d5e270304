//! Options recognized by the [`NodeManager`] and its sessions.
//!
//! [`NodeManager`]: ../nodes/struct.NodeManager.html

use serde::Deserialize;
use std::time::Duration;

/// Behaviour of the whole pool.
///
/// Deserializes from camelCase keys; every missing key falls back to its
/// default.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientOptions {
    /// Whether nodes are asked to keep sessions alive across reconnects.
    pub resumable: bool,
    /// How long a node keeps sessions alive after a disconnect, in seconds.
    pub resumable_timeout: u64,
    /// Reconnect attempts before a node is given up.
    pub reconnect_tries: u32,
    /// Base reconnect delay in milliseconds, doubled per attempt.
    pub reconnect_interval: u64,
    /// Whether sessions of a lost node are moved to another node instead of
    /// being dropped.
    pub move_on_disconnect: bool,
    /// Track resolver timeout in milliseconds.
    pub rest_timeout: u64,
    /// Command acknowledgement and join timeout in milliseconds.
    pub request_timeout: u64,
    /// Whether sends to a node that is not connected are buffered until it
    /// connects instead of failing.
    pub queue_sends: bool,
    /// Optional volume ceiling. The floor is always 0.
    pub max_volume: Option<i32>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            resumable: false,
            resumable_timeout: 30,
            reconnect_tries: 2,
            reconnect_interval: 5_000,
            move_on_disconnect: false,
            rest_timeout: 15_000,
            request_timeout: 10_000,
            queue_sends: false,
            max_volume: None,
        }
    }
}

impl ClientOptions {
    pub fn resume_window(&self) -> Duration {
        Duration::from_secs(self.resumable_timeout)
    }

    pub fn rest_timeout(&self) -> Duration {
        Duration::from_millis(self.rest_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout)
    }

    /// Delay before the given reconnect attempt (1-based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.pow(attempt.saturating_sub(1).min(3));

        Duration::from_millis(self.reconnect_interval.saturating_mul(factor))
    }
}

/// Identity of the bot, supplied when the pool starts.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientIdentity {
    pub user_id: u64,
    #[serde(default = "default_shard_count")]
    pub shard_count: u64,
}

fn default_shard_count() -> u64 {
    1
}

impl ClientIdentity {
    pub fn new(user_id: u64, shard_count: u64) -> Self {
        Self { user_id, shard_count }
    }
}

/// A request to join a guild's voice channel.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinOptions {
    pub guild_id: u64,
    pub voice_channel_id: u64,
    pub shard_id: u64,
    pub mute: bool,
    pub deaf: bool,
    /// Overrides [`ClientOptions::request_timeout`] for this join.
    ///
    /// [`ClientOptions::request_timeout`]: struct.ClientOptions.html#structfield.request_timeout
    pub timeout: Option<Duration>,
}

impl JoinOptions {
    pub fn new(guild_id: u64, voice_channel_id: u64) -> Self {
        Self {
            guild_id,
            voice_channel_id,
            shard_id: 0,
            mute: false,
            deaf: false,
            timeout: None,
        }
    }
}

/// Optional bounds for a played track, in milliseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PlayOptions {
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
}
