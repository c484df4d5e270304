//! Notifications surfaced to the embedding application.
//!
//! Both kinds are plain data delivered over `tokio::sync::broadcast`
//! channels; emitting never fails, even when nobody is subscribed.

use crate::model::{PlayerUpdateState, TrackEndReason, TrackException};
use tokio::sync::broadcast;

/// Capacity of every event channel. Lagging subscribers lose the oldest
/// events.
pub(crate) const CHANNEL_CAPACITY: usize = 256;

/// Pool-level notifications, each tagged with the name of the node involved.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    /// The node's socket opened. `resumed` is whether its previous sessions
    /// were kept alive.
    Ready { node: String, resumed: bool },
    /// The node's socket closed. Reconnection may follow.
    Closed { node: String, code: u16, reason: Option<String> },
    /// The node was given up on, or removed from the pool.
    Disconnected { node: String, reason: Option<String> },
    Error { node: String, message: String },
    Debug { node: String, message: String },
}

impl ClientEvent {
    pub fn node(&self) -> &str {
        use self::ClientEvent::*;

        match self {
            Ready { node, .. }
            | Closed { node, .. }
            | Disconnected { node, .. }
            | Error { node, .. }
            | Debug { node, .. } => node,
        }
    }
}

/// Session-level notifications.
#[derive(Clone, Debug, PartialEq)]
pub enum PlayerEvent {
    /// A track started playing.
    Start { track: Option<String> },
    /// A track stopped, naturally or because it was stopped or replaced.
    End { track: Option<String>, reason: TrackEndReason },
    TrackException { track: Option<String>, exception: TrackException },
    Stuck { track: Option<String>, threshold_ms: u64 },
    /// The voice connection between the node and Discord closed.
    Closed { code: u16, reason: String, by_remote: bool },
    PlayerUpdate(PlayerUpdateState),
    /// The owning node reconnected and kept this session alive.
    Resumed,
    /// The owning node was lost and the session was dropped.
    NodeDisconnect { node: String },
    /// A failure that is not tied to a caller, such as a failed restore after
    /// a move.
    Error { message: String },
}

pub(crate) fn emit<T: Clone>(sender: &broadcast::Sender<T>, event: T) {
    // An error only means nobody is listening.
    let _ = sender.send(event);
}
