//! The voice link of a guild: reconciles Discord's voice state and voice
//! server updates into a single handshake sent to the owning node.

use crate::event_handler::EventHandler;
use crate::model::{
    IntoWebSocketMessage,
    OutgoingMessage,
    VoiceServerUpdate,
    VoiceStateRequest,
    VoiceStateUpdate,
};
use crate::nodes::{Node, Status};
use crate::{Error, Result};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use tokio::sync::oneshot;
use tokio::time::{self, Instant};

type PendingJoin = oneshot::Sender<Result<()>>;

/// Voice connection state of a single guild.
///
/// Cloning is cheap; every clone refers to the same link.
#[derive(Clone)]
pub struct Link {
    inner: Rc<LinkInner>,
}

struct LinkInner {
    guild_id: u64,
    shard_id: u64,
    user_id: u64,
    handler: Rc<dyn EventHandler>,
    node: RefCell<Node>,
    status: Cell<Status>,
    session_id: RefCell<Option<String>>,
    voice_channel_id: Cell<Option<u64>>,
    self_mute: Cell<bool>,
    self_deaf: Cell<bool>,
    last_server_update: RefCell<Option<VoiceServerUpdate>>,
    /// The handshake last sent to the node.
    handshake: RefCell<Option<OutgoingMessage>>,
    pending: RefCell<Option<PendingJoin>>,
}

impl Link {
    pub(crate) fn new(
        guild_id: u64,
        shard_id: u64,
        user_id: u64,
        node: Node,
        handler: Rc<dyn EventHandler>,
    ) -> Self {
        Self {
            inner: Rc::new(LinkInner {
                node: RefCell::new(node),
                status: Cell::new(Status::Disconnected),
                session_id: RefCell::new(None),
                voice_channel_id: Cell::new(None),
                self_mute: Cell::new(false),
                self_deaf: Cell::new(false),
                last_server_update: RefCell::new(None),
                handshake: RefCell::new(None),
                pending: RefCell::new(None),
                guild_id,
                shard_id,
                user_id,
                handler,
            }),
        }
    }

    #[inline]
    pub fn guild_id(&self) -> u64 {
        self.inner.guild_id
    }

    #[inline]
    pub fn shard_id(&self) -> u64 {
        self.inner.shard_id
    }

    #[inline]
    pub fn user_id(&self) -> u64 {
        self.inner.user_id
    }

    /// The node this link currently sends through.
    pub fn node(&self) -> Node {
        self.inner.node.borrow().clone()
    }

    #[inline]
    pub fn status(&self) -> Status {
        self.inner.status.get()
    }

    /// Discord's voice session ID, once a voice state update arrived.
    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.borrow().clone()
    }

    pub fn voice_channel_id(&self) -> Option<u64> {
        self.inner.voice_channel_id.get()
    }

    pub fn self_mute(&self) -> bool {
        self.inner.self_mute.get()
    }

    pub fn self_deaf(&self) -> bool {
        self.inner.self_deaf.get()
    }

    pub fn last_server_update(&self) -> Option<VoiceServerUpdate> {
        self.inner.last_server_update.borrow().clone()
    }

    /// Whether a join is waiting for its handshake.
    fn is_joining(&self) -> bool {
        self.status() == Status::Connecting && self.inner.pending
            .borrow()
            .as_ref()
            .map_or(false, |pending| !pending.is_closed())
    }

    /// Records Discord's voice state for this guild.
    ///
    /// A state without a channel while connected means the bot was removed
    /// from voice; the link drops to `Disconnected`.
    pub fn apply_session_update(&self, update: &VoiceStateUpdate) {
        *self.inner.session_id.borrow_mut() = Some(update.session_id.clone());
        self.inner.self_mute.set(update.self_mute);
        self.inner.self_deaf.set(update.self_deaf);

        match update.channel_id {
            Some(channel_id) => {
                self.inner.voice_channel_id.set(Some(channel_id));
                self.try_handshake();
            },
            None => {
                self.inner.voice_channel_id.set(None);

                if self.status() == Status::Connected {
                    debug!("[{}] Removed from voice", self.guild_id());

                    self.inner.status.set(Status::Disconnected);
                    self.inner.last_server_update.borrow_mut().take();
                    self.destroy_remote();
                }
            },
        }
    }

    /// Records Discord's voice server for this guild.
    pub fn apply_server_update(&self, update: VoiceServerUpdate) {
        *self.inner.last_server_update.borrow_mut() = Some(update);
        self.try_handshake();
    }

    /// Sends the handshake once both halves are known, and again whenever
    /// either changes while joined.
    fn try_handshake(&self) {
        match self.status() {
            Status::Connecting | Status::Connected => {},
            _ => return,
        }

        let session_id = match self.session_id() {
            Some(session_id) => session_id,
            None => return,
        };
        let event = match self.last_server_update() {
            Some(ref update) if update.endpoint.is_none() => {
                debug!("[{}] Waiting for a voice server endpoint", self.guild_id());

                return;
            },
            Some(update) => update,
            None => return,
        };

        let message = OutgoingMessage::VoiceUpdate {
            guild_id: self.guild_id(),
            session_id,
            event,
        };

        if self.inner.handshake.borrow().as_ref() == Some(&message) {
            return;
        }

        let node = self.node();

        match node.send(&message) {
            Ok(()) => {
                debug!("[{}] Sent voice update to {}", self.guild_id(), node.name());

                *self.inner.handshake.borrow_mut() = Some(message);
                self.inner.status.set(Status::Connected);
                self.finish_join(Ok(()));
            },
            Err(why) => {
                warn!("[{}] Failed to send voice update: {:?}", self.guild_id(), why);

                if self.status() == Status::Connecting {
                    self.inner.status.set(Status::Disconnected);
                    self.finish_join(Err(why));
                }
            },
        }
    }

    fn finish_join(&self, result: Result<()>) {
        let pending = self.inner.pending.borrow_mut().take();

        if let Some(pending) = pending {
            let _ = pending.send(result);
        }
    }

    /// Abandons the pending join after a failure on the caller's side.
    fn abort_join(&self) {
        self.inner.pending.borrow_mut().take();
        self.inner.last_server_update.borrow_mut().take();

        if self.status() == Status::Connecting {
            self.inner.status.set(Status::Disconnected);
        }
    }

    /// Asks Discord to move the bot into a voice channel and waits until the
    /// handshake is sent or `deadline` passes.
    ///
    /// Only one join may be in flight; another one fails with
    /// [`Error::AlreadyConnecting`] without disturbing the first.
    ///
    /// [`Error::AlreadyConnecting`]: ../enum.Error.html#variant.AlreadyConnecting
    pub async fn join(&self, channel_id: u64, mute: bool, deaf: bool, deadline: Instant)
        -> Result<()> {
        if self.is_joining() {
            return Err(Error::AlreadyConnecting);
        }

        let (tx, rx) = oneshot::channel();
        *self.inner.pending.borrow_mut() = Some(tx);
        // Both halves of the new voice session must come from Discord again.
        *self.inner.handshake.borrow_mut() = None;
        *self.inner.session_id.borrow_mut() = None;
        self.inner.last_server_update.borrow_mut().take();
        self.inner.status.set(Status::Connecting);
        self.inner.voice_channel_id.set(Some(channel_id));
        self.inner.self_mute.set(mute);
        self.inner.self_deaf.set(deaf);

        debug!("[{}] Joining channel {}", self.guild_id(), channel_id);

        if let Err(why) = self.request_channel(Some(channel_id), mute, deaf).await {
            self.abort_join();

            return Err(why);
        }

        match time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::JoinCancelled),
            Err(_) => {
                debug!("[{}] Timed out joining channel {}", self.guild_id(), channel_id);

                self.abort_join();

                Err(Error::ConnectTimeout)
            },
        }
    }

    /// Asks Discord to move the bot to another channel of an already
    /// connected link. The handshake is left alone unless Discord sends new
    /// updates.
    pub(crate) async fn switch_channel(&self, channel_id: u64, mute: bool, deaf: bool)
        -> Result<()> {
        if self.voice_channel_id() == Some(channel_id)
            && self.self_mute() == mute
            && self.self_deaf() == deaf {
            return Ok(());
        }

        self.request_channel(Some(channel_id), mute, deaf).await?;
        self.inner.voice_channel_id.set(Some(channel_id));
        self.inner.self_mute.set(mute);
        self.inner.self_deaf.set(deaf);

        Ok(())
    }

    async fn request_channel(&self, channel_id: Option<u64>, mute: bool, deaf: bool)
        -> Result<()> {
        let shard_id = self.shard_id();

        if !self.inner.handler.is_connected(shard_id).await {
            return Err(Error::ShardNotConnected(shard_id));
        }

        let message = VoiceStateRequest {
            guild_id: self.guild_id(),
            self_mute: mute,
            self_deaf: deaf,
            channel_id,
        }.into_ws_message()?;

        self.inner.handler.forward(shard_id, &message).await
    }

    /// Leaves the voice channel and tears the handshake down.
    ///
    /// Leaving a link that is already disconnected does nothing.
    pub async fn leave(&self) -> Result<()> {
        match self.status() {
            Status::Disconnecting | Status::Disconnected => return Ok(()),
            Status::Connecting | Status::Connected => {},
        }

        debug!("[{}] Leaving voice", self.guild_id());

        self.inner.status.set(Status::Disconnecting);
        self.finish_join(Err(Error::JoinCancelled));

        let result = self.request_channel(None, self.self_mute(), self.self_deaf()).await;

        self.destroy_remote();

        self.inner.voice_channel_id.set(None);
        self.inner.last_server_update.borrow_mut().take();
        self.inner.status.set(Status::Disconnected);

        result
    }

    /// Tells the node to destroy its player if a handshake was sent to it.
    fn destroy_remote(&self) {
        let sent = self.inner.handshake.borrow_mut().take();

        if sent.is_some() {
            if let Err(why) = self.node().send(&OutgoingMessage::Destroy { guild_id: self.guild_id() }) {
                debug!("[{}] Could not destroy the player: {:?}", self.guild_id(), why);
            }
        }
    }

    /// Re-parents the link onto another node.
    ///
    /// The last handshake is replayed to `node`; if that fails the original
    /// node is restored. On success the old node is told to destroy its
    /// player.
    pub(crate) fn move_to(&self, node: &Node) -> Result<()> {
        let previous = self.inner.node.replace(node.clone());
        let handshake = self.inner.handshake.borrow().clone();

        if let Some(message) = handshake {
            if let Err(why) = node.send(&message) {
                *self.inner.node.borrow_mut() = previous;

                return Err(why);
            }
        }

        debug!("[{}] Moved from {} to {}", self.guild_id(), previous.name(), node.name());

        if let Err(why) = previous.send(&OutgoingMessage::Destroy { guild_id: self.guild_id() }) {
            debug!("[{}] Could not destroy the old player: {:?}", self.guild_id(), why);
        }

        Ok(())
    }

    /// Replays the last handshake to the current node.
    pub(crate) fn resend_handshake(&self) -> Result<()> {
        let handshake = self.inner.handshake.borrow().clone();

        match handshake {
            Some(message) => self.node().send(&message),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Link")
            .field("guild_id", &self.guild_id())
            .field("node", &self.node().name())
            .field("status", &self.status())
            .field("voice_channel_id", &self.voice_channel_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ClientOptions;
    use crate::nodes::Status;
    use crate::testing::{self, drain, RecordingHandler};
    use crate::Error;
    use serde_json::json;
    use std::rc::Rc;
    use std::time::Duration;
    use super::Link;
    use tokio::time::Instant;

    fn link(handler: &RecordingHandler) -> (Link, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let node = testing::node("a", ClientOptions::default());
        let rx = testing::connect(&node);

        (Link::new(5, 0, 1, node, Rc::new(handler.clone())), rx)
    }

    #[tokio::test]
    async fn test_handshake_once_per_endpoint() {
        let handler = RecordingHandler::default();
        let (link, mut rx) = link(&handler);
        let deadline = Instant::now() + Duration::from_secs(5);

        let updates = async {
            testing::settle().await;

            link.apply_server_update(testing::server_update(5, "a.discord.media"));
            assert!(drain(&mut rx).is_empty());

            link.apply_session_update(&testing::state_update(5, Some(10), "s1"));
            link.apply_server_update(testing::server_update(5, "a.discord.media"));
            link.apply_session_update(&testing::state_update(5, Some(10), "s1"));
        };
        let (joined, ()) = tokio::join!(link.join(10, false, false, deadline), updates);

        joined.unwrap();
        assert_eq!(link.status(), Status::Connected);
        assert_eq!(drain(&mut rx), vec![json!({
            "op": "voiceUpdate",
            "guildId": "5",
            "sessionId": "s1",
            "event": { "token": "token", "guild_id": "5", "endpoint": "a.discord.media" },
        })]);

        link.apply_server_update(testing::server_update(5, "b.discord.media"));
        link.apply_server_update(testing::server_update(5, "b.discord.media"));

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["event"]["endpoint"], "b.discord.media");
    }

    #[tokio::test]
    async fn test_updates_are_ignored_until_joined() {
        let handler = RecordingHandler::default();
        let (link, mut rx) = link(&handler);

        link.apply_session_update(&testing::state_update(5, Some(10), "s1"));
        link.apply_server_update(testing::server_update(5, "a.discord.media"));

        assert!(drain(&mut rx).is_empty());
        assert_eq!(link.status(), Status::Disconnected);
        assert_eq!(link.session_id().as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_null_endpoint_waits() {
        let handler = RecordingHandler::default();
        let (link, mut rx) = link(&handler);
        let deadline = Instant::now() + Duration::from_secs(5);

        let updates = async {
            testing::settle().await;

            let mut pending = testing::server_update(5, "a.discord.media");
            pending.endpoint = None;
            link.apply_session_update(&testing::state_update(5, Some(10), "s1"));
            link.apply_server_update(pending);
            assert!(drain(&mut rx).is_empty());

            link.apply_server_update(testing::server_update(5, "a.discord.media"));
        };
        let (joined, ()) = tokio::join!(link.join(10, false, false, deadline), updates);

        joined.unwrap();
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_times_out_without_updates() {
        let handler = RecordingHandler::default();
        let (link, mut rx) = link(&handler);
        let start = Instant::now();
        let deadline = start + Duration::from_secs(3);

        let result = link.join(10, false, false, deadline).await;

        assert!(matches!(result, Err(Error::ConnectTimeout)));
        assert!(Instant::now() >= deadline);
        assert_eq!(link.status(), Status::Disconnected);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(handler.forwarded()[0]["d"]["channel_id"], "10");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_join_is_rejected() {
        let handler = RecordingHandler::default();
        let (link, _rx) = link(&handler);
        let deadline = Instant::now() + Duration::from_secs(3);

        let second = async {
            testing::settle().await;

            let result = link.join(11, false, false, Instant::now() + Duration::from_secs(60)).await;
            assert!(matches!(result, Err(Error::AlreadyConnecting)));
            assert_eq!(link.status(), Status::Connecting);
        };
        let (first, ()) = tokio::join!(link.join(10, false, false, deadline), second);

        assert!(matches!(first, Err(Error::ConnectTimeout)));
        assert!(Instant::now() >= deadline);
        assert_eq!(handler.forwarded().len(), 1);
    }

    #[tokio::test]
    async fn test_join_fails_when_shard_is_offline() {
        let handler = RecordingHandler::default();
        handler.set_connected(false);
        let (link, _rx) = link(&handler);

        let result = link.join(10, false, false, Instant::now() + Duration::from_secs(3)).await;

        assert!(matches!(result, Err(Error::ShardNotConnected(0))));
        assert_eq!(link.status(), Status::Disconnected);
        assert!(handler.forwarded().is_empty());
    }

    #[tokio::test]
    async fn test_leave_twice_is_a_no_op() {
        let handler = RecordingHandler::default();
        let (link, mut rx) = link(&handler);
        testing::join_link(&link).await.unwrap();
        drain(&mut rx);

        link.leave().await.unwrap();
        link.leave().await.unwrap();

        assert_eq!(link.status(), Status::Disconnected);
        assert_eq!(drain(&mut rx), vec![json!({ "op": "destroy", "guildId": "5" })]);

        let forwarded = handler.forwarded();
        assert_eq!(forwarded.len(), 2);
        assert_eq!(forwarded[1]["d"]["channel_id"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_leave_cancels_pending_join() {
        let handler = RecordingHandler::default();
        let (link, _rx) = link(&handler);
        let deadline = Instant::now() + Duration::from_secs(5);

        let leave = async {
            testing::settle().await;
            link.leave().await.unwrap();
        };
        let (joined, ()) = tokio::join!(link.join(10, false, false, deadline), leave);

        assert!(matches!(joined, Err(Error::JoinCancelled)));
        assert_eq!(link.status(), Status::Disconnected);
    }

    #[tokio::test]
    async fn test_removed_from_voice() {
        let handler = RecordingHandler::default();
        let (link, mut rx) = link(&handler);
        testing::join_link(&link).await.unwrap();
        drain(&mut rx);

        link.apply_session_update(&testing::state_update(5, None, "s1"));

        assert_eq!(link.status(), Status::Disconnected);
        assert_eq!(link.voice_channel_id(), None);
        assert_eq!(link.last_server_update(), None);
        assert_eq!(drain(&mut rx), vec![json!({ "op": "destroy", "guildId": "5" })]);

        // Nothing is left to tear down.
        link.leave().await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_waits_for_new_server_update() {
        let handler = RecordingHandler::default();
        let (link, mut rx) = link(&handler);
        testing::join_link(&link).await.unwrap();
        link.apply_session_update(&testing::state_update(5, None, "s1"));
        drain(&mut rx);

        let deadline = Instant::now() + Duration::from_secs(5);
        let updates = async {
            testing::settle().await;

            link.apply_session_update(&testing::state_update(5, Some(10), "s2"));
            assert!(drain(&mut rx).is_empty());
            assert_eq!(link.status(), Status::Connecting);

            link.apply_server_update(testing::server_update(5, "b.discord.media"));
        };

        let (joined, ()) = tokio::join!(link.join(10, false, false, deadline), updates);
        joined.unwrap();

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["sessionId"], "s2");
        assert_eq!(sent[0]["event"]["endpoint"], "b.discord.media");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_join_forgets_server_update() {
        let handler = RecordingHandler::default();
        let (link, mut rx) = link(&handler);
        let deadline = Instant::now() + Duration::from_secs(1);

        let updates = async {
            testing::settle().await;
            link.apply_server_update(testing::server_update(5, "a.discord.media"));
        };
        let (joined, ()) = tokio::join!(link.join(10, false, false, deadline), updates);

        assert!(matches!(joined, Err(Error::ConnectTimeout)));
        assert_eq!(link.last_server_update(), None);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_move_replays_handshake() {
        let handler = RecordingHandler::default();
        let (link, mut old_rx) = link(&handler);
        testing::join_link(&link).await.unwrap();
        drain(&mut old_rx);

        let target = testing::node("b", ClientOptions::default());
        let mut new_rx = testing::connect(&target);

        link.move_to(&target).unwrap();

        assert_eq!(link.node().name(), "b");
        assert_eq!(drain(&mut new_rx)[0]["op"], "voiceUpdate");
        assert_eq!(drain(&mut old_rx), vec![json!({ "op": "destroy", "guildId": "5" })]);
    }

    #[tokio::test]
    async fn test_failed_move_restores_node() {
        let handler = RecordingHandler::default();
        let (link, _rx) = link(&handler);
        testing::join_link(&link).await.unwrap();

        let offline = testing::node("b", ClientOptions::default());

        assert!(matches!(link.move_to(&offline), Err(Error::NotConnected(_))));
        assert_eq!(link.node().name(), "a");
        assert_eq!(link.status(), Status::Connected);
    }
}
