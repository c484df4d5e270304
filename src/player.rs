//! Playback control of a guild, resolved against the events its node pushes
//! back.

use crate::config::{ClientOptions, PlayOptions};
use crate::events::{self, PlayerEvent, CHANNEL_CAPACITY};
use crate::link::Link;
use crate::model::{
    EqualizerBand,
    NodeEvent,
    OutgoingMessage,
    PlayerUpdateState,
    Track,
    TrackEndReason,
    TrackException,
};
use crate::nodes::{Node, Status};
use crate::request::{CommandKind, PendingRequests, RequestKey};
use crate::{Error, Result};
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use tokio::sync::{broadcast, oneshot};
use tokio::time::{self, Instant};

/// The state of a guild's audio player.
///
/// Every command sends a message through the link's node and completes once
/// the node confirms it (see each method), or fails with
/// [`Error::CommandTimeout`] after [`ClientOptions::request_timeout`].
///
/// [`Error::CommandTimeout`]: ../enum.Error.html#variant.CommandTimeout
/// [`ClientOptions::request_timeout`]: ../config/struct.ClientOptions.html#structfield.request_timeout
#[derive(Clone)]
pub struct Player {
    inner: Rc<PlayerInner>,
}

/// A handle that does not keep the player alive.
#[derive(Clone)]
pub(crate) struct WeakPlayer(Weak<PlayerInner>);

impl WeakPlayer {
    pub fn upgrade(&self) -> Option<Player> {
        self.0.upgrade().map(|inner| Player { inner })
    }
}

struct PlayerInner {
    link: Link,
    options: Rc<ClientOptions>,
    state: RefCell<PlaybackState>,
    pending: RefCell<PendingRequests>,
    /// Track whose load failure already failed a play; its trailing
    /// `LOAD_FAILED` end must not fail another.
    failed_track: RefCell<Option<Option<String>>>,
    events: broadcast::Sender<PlayerEvent>,
}

#[derive(Clone, Debug)]
struct PlaybackState {
    track: Option<Track>,
    paused: bool,
    volume: i32,
    bands: Vec<EqualizerBand>,
    /// Last position reported by the node, in milliseconds.
    position: i64,
    /// Node timestamp of `position`.
    time: i64,
    /// When `position` was recorded locally.
    updated_at: Option<Instant>,
}

impl PlaybackState {
    fn clear_track(&mut self) {
        self.track = None;
        self.position = 0;
        self.updated_at = None;
    }
}

struct Ack {
    key: RequestKey,
    rx: oneshot::Receiver<bool>,
}

impl Player {
    pub(crate) fn new(link: Link, options: Rc<ClientOptions>) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);

        Self {
            inner: Rc::new(PlayerInner {
                pending: RefCell::new(PendingRequests::new(link.guild_id())),
                failed_track: RefCell::new(None),
                state: RefCell::new(PlaybackState {
                    track: None,
                    paused: false,
                    volume: 100,
                    bands: Vec::new(),
                    position: 0,
                    time: 0,
                    updated_at: None,
                }),
                link,
                options,
                events,
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakPlayer {
        WeakPlayer(Rc::downgrade(&self.inner))
    }

    /// Whether both handles refer to the same player.
    pub fn ptr_eq(&self, other: &Player) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    #[inline]
    pub fn guild_id(&self) -> u64 {
        self.inner.link.guild_id()
    }

    /// The voice link this player sends through.
    #[inline]
    pub fn link(&self) -> &Link {
        &self.inner.link
    }

    pub fn node(&self) -> Node {
        self.inner.link.node()
    }

    /// Subscribes to this player's events.
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.inner.events.subscribe()
    }

    /// The track that the player is playing.
    pub fn track(&self) -> Option<Track> {
        self.inner.state.borrow().track.clone()
    }

    pub fn paused(&self) -> bool {
        self.inner.state.borrow().paused
    }

    pub fn volume(&self) -> i32 {
        self.inner.state.borrow().volume
    }

    /// Equalizer overrides; these survive track changes.
    pub fn bands(&self) -> Vec<EqualizerBand> {
        self.inner.state.borrow().bands.clone()
    }

    /// The last position reported by the node.
    pub fn position(&self) -> i64 {
        self.inner.state.borrow().position
    }

    /// The node timestamp of the last position update.
    pub fn time(&self) -> i64 {
        self.inner.state.borrow().time
    }

    /// The estimated current position, advancing the last reported one by
    /// the time elapsed since, unless paused.
    pub fn estimated_position(&self) -> i64 {
        let state = self.inner.state.borrow();

        match (state.track.as_ref(), state.updated_at) {
            (Some(_), Some(at)) if !state.paused => {
                state.position + at.elapsed().as_millis() as i64
            },
            _ => state.position,
        }
    }

    fn emit(&self, event: PlayerEvent) {
        events::emit(&self.inner.events, event);
    }

    fn active_node(&self) -> Result<Node> {
        if self.inner.link.status() != Status::Connected {
            return Err(Error::NoActiveLink);
        }

        Ok(self.inner.link.node())
    }

    fn dispatch(&self, node: &Node, kind: CommandKind, message: &OutgoingMessage) -> Result<Ack> {
        let (key, rx) = self.inner.pending.borrow_mut().register(kind);

        if let Err(why) = node.send(message) {
            self.inner.pending.borrow_mut().cancel(&key);

            return Err(why);
        }

        Ok(Ack { key, rx })
    }

    async fn confirm(&self, ack: Ack) -> Result<bool> {
        let Ack { key, rx } = ack;

        match time::timeout(self.inner.options.request_timeout(), rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(Error::NoActiveLink),
            Err(_) => {
                self.inner.pending.borrow_mut().cancel(&key);

                Err(Error::CommandTimeout)
            },
        }
    }

    /// Sends a command that the node only confirms while a track is loaded.
    /// Otherwise there is nothing to report, and the send alone counts.
    async fn send_while_loaded(&self, node: &Node, kind: CommandKind, message: &OutgoingMessage)
        -> Result<bool> {
        if self.inner.state.borrow().track.is_none() {
            node.send(message)?;

            return Ok(true);
        }

        let ack = self.dispatch(node, kind, message)?;

        self.confirm(ack).await
    }

    /// Plays a track, replacing the current one.
    ///
    /// Resolves to `true` once the node reports the track started and to
    /// `false` if it failed to load. Equalizer overrides are kept.
    pub async fn play_track(&self, track: &Track, options: PlayOptions) -> Result<bool> {
        let node = self.active_node()?;
        let message = OutgoingMessage::Play {
            guild_id: self.guild_id(),
            track: track.track.clone(),
            start_time: options.start_time,
            end_time: options.end_time,
            volume: None,
            pause: None,
            no_replace: None,
        };

        let ack = self.dispatch(&node, CommandKind::Play, &message)?;
        let started = self.confirm(ack).await?;

        if started {
            let mut state = self.inner.state.borrow_mut();
            state.track = Some(track.clone());
            state.paused = false;
            state.position = options.start_time.unwrap_or(0) as i64;
            state.updated_at = Some(Instant::now());
        }

        Ok(started)
    }

    /// Stops the current track.
    ///
    /// Resolves once the node reports the track ended. With nothing loaded
    /// the node has nothing to report, so this resolves as soon as the stop
    /// is sent.
    pub async fn stop_track(&self) -> Result<bool> {
        let node = self.active_node()?;
        let message = OutgoingMessage::Stop { guild_id: self.guild_id() };

        let stopped = self.send_while_loaded(&node, CommandKind::Stop, &message).await?;

        if stopped {
            self.inner.state.borrow_mut().clear_track();
        }

        Ok(stopped)
    }

    /// Pauses or resumes the player; `None` pauses.
    ///
    /// Resolves on the next position update from the node, or once sent
    /// when no track is loaded.
    pub async fn set_paused(&self, pause: impl Into<Option<bool>>) -> Result<bool> {
        let pause = pause.into().unwrap_or(true);
        let node = self.active_node()?;
        let message = OutgoingMessage::Pause {
            guild_id: self.guild_id(),
            pause,
        };

        let confirmed = self.send_while_loaded(&node, CommandKind::Pause, &message).await?;

        if confirmed {
            self.inner.state.borrow_mut().paused = pause;
        }

        Ok(confirmed)
    }

    /// Sets the volume.
    ///
    /// Fails with [`Error::InvalidVolume`] below 0 or above
    /// [`ClientOptions::max_volume`]. Resolves like [`set_paused`].
    ///
    /// [`Error::InvalidVolume`]: ../enum.Error.html#variant.InvalidVolume
    /// [`ClientOptions::max_volume`]: ../config/struct.ClientOptions.html#structfield.max_volume
    /// [`set_paused`]: #method.set_paused
    pub async fn set_volume(&self, volume: i32) -> Result<bool> {
        let node = self.active_node()?;

        if volume < 0 || self.inner.options.max_volume.map_or(false, |max| volume > max) {
            return Err(Error::InvalidVolume(volume));
        }

        let message = OutgoingMessage::Volume {
            guild_id: self.guild_id(),
            volume,
        };

        let confirmed = self.send_while_loaded(&node, CommandKind::Volume, &message).await?;

        if confirmed {
            self.inner.state.borrow_mut().volume = volume;
        }

        Ok(confirmed)
    }

    /// Replaces every equalizer override. Resolves like [`set_paused`].
    ///
    /// [`set_paused`]: #method.set_paused
    pub async fn set_equalizer(&self, bands: Vec<EqualizerBand>) -> Result<bool> {
        let node = self.active_node()?;

        if let Some(band) = bands.iter().find(|band| band.band >= EqualizerBand::COUNT) {
            return Err(Error::InvalidBand(band.band));
        }

        let message = OutgoingMessage::Equalizer {
            guild_id: self.guild_id(),
            bands: bands.clone(),
        };

        let confirmed = self.send_while_loaded(&node, CommandKind::Equalizer, &message).await?;

        if confirmed {
            self.inner.state.borrow_mut().bands = bands;
        }

        Ok(confirmed)
    }

    /// Seeks the current track.
    ///
    /// Fails with [`Error::NotSeekable`], sending nothing, when no track is
    /// loaded or the track cannot seek. Resolves on the next position
    /// update.
    ///
    /// [`Error::NotSeekable`]: ../enum.Error.html#variant.NotSeekable
    pub async fn seek_to(&self, position: u64) -> Result<bool> {
        let node = self.active_node()?;

        let seekable = self.inner.state
            .borrow()
            .track
            .as_ref()
            .map_or(false, |track| track.info.is_seekable);

        if !seekable {
            return Err(Error::NotSeekable);
        }

        let message = OutgoingMessage::Seek {
            guild_id: self.guild_id(),
            position,
        };

        let ack = self.dispatch(&node, CommandKind::Seek, &message)?;
        let confirmed = self.confirm(ack).await?;

        if confirmed {
            let mut state = self.inner.state.borrow_mut();
            state.position = position as i64;
            state.updated_at = Some(Instant::now());
        }

        Ok(confirmed)
    }

    pub(crate) fn handle_player_update(&self, update: PlayerUpdateState) {
        {
            let mut state = self.inner.state.borrow_mut();
            state.position = update.position;
            state.time = update.time;
            state.updated_at = Some(Instant::now());
        }

        self.inner.pending.borrow_mut().resolve(&CommandKind::STATE, true);
        self.emit(PlayerEvent::PlayerUpdate(update));
    }

    pub(crate) fn handle_event(&self, event: NodeEvent) {
        match event {
            NodeEvent::TrackStart { track, .. } => {
                self.inner.failed_track.borrow_mut().take();
                self.inner.pending.borrow_mut().resolve_first(CommandKind::Play, true);
                self.emit(PlayerEvent::Start { track });
            },
            NodeEvent::TrackEnd { track, reason, .. } => {
                if reason != TrackEndReason::Replaced {
                    self.inner.state.borrow_mut().clear_track();
                }

                {
                    let mut pending = self.inner.pending.borrow_mut();
                    pending.resolve(&[CommandKind::Stop], true);

                    if reason == TrackEndReason::LoadFailed {
                        let reported = self.inner.failed_track.borrow_mut().take();

                        if reported.as_ref() != Some(&track) {
                            pending.resolve_first(CommandKind::Play, false);
                        }
                    }
                }

                self.emit(PlayerEvent::End { track, reason });
            },
            NodeEvent::TrackException { track, error, exception, .. } => {
                if self.inner.pending.borrow_mut().resolve_first(CommandKind::Play, false) {
                    *self.inner.failed_track.borrow_mut() = Some(track.clone());
                }

                let exception = exception.unwrap_or_else(|| TrackException {
                    message: error,
                    ..TrackException::default()
                });

                self.emit(PlayerEvent::TrackException { track, exception });
            },
            NodeEvent::TrackStuck { track, threshold_ms, .. } => {
                self.emit(PlayerEvent::Stuck { track, threshold_ms });
            },
            NodeEvent::WebSocketClosed { code, reason, by_remote, .. } => {
                self.emit(PlayerEvent::Closed { code, reason, by_remote });
            },
        }
    }

    pub(crate) fn handle_resumed(&self) {
        debug!("[{}] Resumed on {}", self.guild_id(), self.node().name());

        self.emit(PlayerEvent::Resumed);
    }

    /// Re-establishes the session on its node after the node lost it.
    pub(crate) fn renegotiate(&self) {
        if self.inner.link.status() != Status::Connected {
            return;
        }

        match self.inner.link.resend_handshake() {
            Ok(()) => self.restore(),
            Err(why) => self.emit(PlayerEvent::Error { message: why.to_string() }),
        }
    }

    /// Replays the playback state to the current node, e.g. after a move.
    pub(crate) fn restore(&self) {
        let node = self.node();
        let state = self.inner.state.borrow().clone();
        let mut messages = Vec::new();

        match state.track {
            Some(track) => messages.push(OutgoingMessage::Play {
                guild_id: self.guild_id(),
                track: track.track,
                start_time: Some(self.estimated_position().max(0) as u64),
                end_time: None,
                volume: Some(state.volume),
                pause: Some(state.paused),
                no_replace: None,
            }),
            None if state.volume != 100 => messages.push(OutgoingMessage::Volume {
                guild_id: self.guild_id(),
                volume: state.volume,
            }),
            None => {},
        }

        if !state.bands.is_empty() {
            messages.push(OutgoingMessage::Equalizer {
                guild_id: self.guild_id(),
                bands: state.bands,
            });
        }

        for message in messages {
            if let Err(why) = node.send(&message) {
                warn!("[{}] Failed to restore playback on {}: {:?}", self.guild_id(), node.name(), why);

                self.emit(PlayerEvent::Error { message: why.to_string() });

                break;
            }
        }
    }

    /// Detaches the player from its node after the node was lost.
    pub(crate) fn handle_node_disconnect(&self, node: &str) {
        self.destroy();
        self.emit(PlayerEvent::NodeDisconnect { node: node.to_owned() });
    }

    /// Fails every outstanding command.
    pub(crate) fn destroy(&self) {
        self.inner.pending.borrow_mut().clear();
    }
}

impl fmt::Debug for Player {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.inner.state.borrow();

        f.debug_struct("Player")
            .field("guild_id", &self.guild_id())
            .field("link", &self.inner.link)
            .field("track", &state.track.as_ref().map(|track| &track.info.title))
            .field("paused", &state.paused)
            .field("volume", &state.volume)
            .field("position", &state.position)
            .finish()
    }
}
