use crate::config::{ClientIdentity, ClientOptions, JoinOptions};
use crate::event_handler::EventHandler;
use crate::events::{self, ClientEvent, CHANNEL_CAPACITY};
use crate::link::Link;
use crate::model::{VoiceServerUpdate, VoiceStateUpdate};
use crate::player::Player;
use crate::{Error, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::i32;
use std::rc::Rc;
use super::{Node, NodeConfig, Status};
use tokio::sync::broadcast;
use tokio::time::Instant;

/// The pool of nodes and the guild sessions placed on them.
///
/// Node drivers are spawned with [`tokio::task::spawn_local`], so the
/// manager must be used from within a [`tokio::task::LocalSet`].
pub struct NodeManager {
    inner: Rc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    options: Rc<ClientOptions>,
    handler: Rc<dyn EventHandler>,
    identity: RefCell<Option<ClientIdentity>>,
    /// In registration order; ties in load go to the earliest node.
    nodes: RefCell<Vec<Node>>,
    /// Session of each guild. The node a session lives on is its link's
    /// node.
    players: RefCell<HashMap<u64, Player>>,
    events: broadcast::Sender<ClientEvent>,
}

impl NodeManager {
    pub fn new<H: EventHandler + 'static>(handler: H, options: ClientOptions) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);

        Self {
            inner: Rc::new(ManagerInner {
                options: Rc::new(options),
                handler: Rc::new(handler),
                identity: RefCell::new(None),
                nodes: RefCell::new(Vec::new()),
                players: RefCell::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Subscribes to pool-level events of every node.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    #[inline]
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn identity(&self) -> Option<ClientIdentity> {
        self.inner.identity.borrow().clone()
    }

    /// Sets the bot's identity and connects to each of the given nodes.
    pub fn start<I>(&self, nodes: I, identity: ClientIdentity) -> Result<()>
        where I: IntoIterator<Item = NodeConfig> {
        info!("Starting as user {} with {} shards", identity.user_id, identity.shard_count);

        *self.inner.identity.borrow_mut() = Some(identity);

        for config in nodes {
            self.add_node(config)?;
        }

        Ok(())
    }

    /// Adds a new node to be managed and starts connecting to it.
    ///
    /// Returns [`Error::NotStarted`] before [`start`] was called, and
    /// [`Error::NodeAlreadyExists`] if the name is taken.
    ///
    /// [`Error::NotStarted`]: ../enum.Error.html#variant.NotStarted
    /// [`Error::NodeAlreadyExists`]: ../enum.Error.html#variant.NodeAlreadyExists
    /// [`start`]: #method.start
    pub fn add_node(&self, config: NodeConfig) -> Result<Node> {
        let identity = self.identity().ok_or(Error::NotStarted)?;
        let node = self.insert_node(config)?;

        tokio::task::spawn_local(node.clone().run(identity, Rc::downgrade(&self.inner)));

        Ok(node)
    }

    /// Registers a node without driving its socket.
    pub(crate) fn insert_node(&self, config: NodeConfig) -> Result<Node> {
        if self.inner.node(&config.name).is_some() {
            return Err(Error::NodeAlreadyExists(config.name));
        }

        debug!("Adding node {} at {}", config.name, config.websocket_url());

        let node = Node::new(config, Rc::clone(&self.inner.options), self.inner.events.clone());
        self.inner.nodes.borrow_mut().push(node.clone());

        Ok(node)
    }

    /// Closes a node and removes it from the pool.
    ///
    /// Its sessions are moved to the best remaining node if
    /// [`ClientOptions::move_on_disconnect`] is set, and dropped otherwise.
    ///
    /// [`ClientOptions::move_on_disconnect`]: ../config/struct.ClientOptions.html#structfield.move_on_disconnect
    pub async fn remove_node(&self, name: &str, reason: Option<&str>) -> Result<()> {
        let node = self.inner
            .node(name)
            .ok_or_else(|| Error::NodeNotFound(name.to_owned()))?;

        self.inner.evict(&node, reason.map(str::to_owned)).await;

        Ok(())
    }

    /// Retrieves a node by name, or the least loaded connected node.
    pub fn get_node(&self, name: Option<&str>) -> Result<Node> {
        match name {
            Some(name) => self.inner.node(name).ok_or_else(|| Error::NodeNotFound(name.to_owned())),
            None => self.best_node().ok_or(Error::NodeExhausted),
        }
    }

    /// Determines the connected node with the lowest penalty, if any.
    pub fn best_node(&self) -> Option<Node> {
        self.inner.best_node(None)
    }

    /// Every node of the pool, in registration order.
    pub fn nodes(&self) -> Vec<Node> {
        self.inner.nodes.borrow().clone()
    }

    /// Joins a guild's voice channel, creating its session on the best node.
    ///
    /// Joining a guild that is already connected returns its session, asking
    /// Discord to switch channels if needed. A join fails with
    /// [`Error::ConnectTimeout`] if the handshake is not completed before
    /// [`JoinOptions::timeout`], or [`ClientOptions::request_timeout`] when
    /// that is unset.
    ///
    /// [`Error::ConnectTimeout`]: ../enum.Error.html#variant.ConnectTimeout
    /// [`JoinOptions::timeout`]: ../config/struct.JoinOptions.html#structfield.timeout
    /// [`ClientOptions::request_timeout`]: ../config/struct.ClientOptions.html#structfield.request_timeout
    pub async fn join_voice_channel(&self, options: JoinOptions) -> Result<Player> {
        let identity = self.identity().ok_or(Error::NotStarted)?;
        let existing = self.get_player(options.guild_id);

        if let Some(player) = existing.as_ref() {
            if player.link().status() == Status::Connected {
                player.link()
                    .switch_channel(options.voice_channel_id, options.mute, options.deaf)
                    .await?;

                return Ok(player.clone());
            }
        }

        let (player, created) = match existing {
            Some(player) => (player, false),
            None => {
                let node = self.get_node(None)?;
                let link = Link::new(
                    options.guild_id,
                    options.shard_id,
                    identity.user_id,
                    node.clone(),
                    Rc::clone(&self.inner.handler),
                );
                let player = Player::new(link, Rc::clone(&self.inner.options));

                debug!("[{}] Creating session on {}", options.guild_id, node.name());

                node.register(&player);
                self.inner.players.borrow_mut().insert(options.guild_id, player.clone());

                (player, true)
            },
        };

        let timeout = options.timeout.unwrap_or_else(|| self.inner.options.request_timeout());
        let joined = player.link()
            .join(options.voice_channel_id, options.mute, options.deaf, Instant::now() + timeout)
            .await;

        match joined {
            Ok(()) => Ok(player),
            Err(why) => {
                if created && player.link().status() == Status::Disconnected {
                    self.inner.forget(&player);
                }

                Err(why)
            },
        }
    }

    /// Leaves a guild's voice channel and drops its session.
    ///
    /// Leaving a guild without a session does nothing.
    pub async fn leave_voice_channel(&self, guild_id: u64) -> Result<()> {
        let player = match self.get_player(guild_id) {
            Some(player) => player,
            None => return Ok(()),
        };

        self.inner.forget(&player);

        player.link().leave().await
    }

    pub fn get_link(&self, guild_id: u64) -> Option<Link> {
        self.get_player(guild_id).map(|player| player.link().clone())
    }

    pub fn get_player(&self, guild_id: u64) -> Option<Player> {
        self.inner.players.borrow().get(&guild_id).cloned()
    }

    /// Feeds a voice state update from the gateway. Updates of other users
    /// are ignored.
    pub fn voice_state_update(&self, update: &VoiceStateUpdate) {
        let user_id = match self.identity() {
            Some(identity) => identity.user_id,
            None => return,
        };

        if update.user_id != user_id {
            return;
        }

        if let Some(link) = self.get_link(update.guild_id) {
            link.apply_session_update(update);
        }
    }

    /// Feeds a voice server update from the gateway.
    pub fn voice_server_update(&self, update: VoiceServerUpdate) {
        match self.get_link(update.guild_id) {
            Some(link) => link.apply_server_update(update),
            None => trace!("[{}] Voice server update without a session", update.guild_id),
        }
    }

    /// Moves a guild's session to another node, replaying its voice
    /// handshake and playback there.
    pub fn move_player(&self, guild_id: u64, node_name: &str) -> Result<()> {
        let player = self.get_player(guild_id).ok_or(Error::NoActiveLink)?;
        let target = self.inner
            .node(node_name)
            .ok_or_else(|| Error::NodeNotFound(node_name.to_owned()))?;

        if target.ptr_eq(&player.node()) {
            return Ok(());
        }

        self.inner.relocate(&player, &target)
    }

    /// The number of sessions across the pool.
    pub fn total_players(&self) -> usize {
        self.inner.players.borrow().len()
    }

    /// Closes every node.
    ///
    /// This is also automatically called when the manager is dropped.
    pub fn shutdown(&self) {
        for node in self.nodes() {
            node.close();
        }
    }
}

impl Drop for NodeManager {
    /// Drops the manager, closing all nodes.
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for NodeManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NodeManager")
            .field("nodes", &*self.inner.nodes.borrow())
            .field("players", &self.total_players())
            .finish()
    }
}

impl ManagerInner {
    fn node(&self, name: &str) -> Option<Node> {
        self.nodes.borrow().iter().find(|node| node.name() == name).cloned()
    }

    fn best_node(&self, except: Option<&Node>) -> Option<Node> {
        let mut record = i32::MAX;
        let mut best = None;
        let nodes = self.nodes.borrow();

        for node in nodes.iter() {
            if node.status() != Status::Connected {
                continue;
            }

            if except.map_or(false, |except| except.ptr_eq(node)) {
                continue;
            }

            let total = node.penalty().unwrap_or(0);

            if total < record {
                best = Some(node);
                record = total;
            }
        }

        best.cloned()
    }

    /// Forgets a session; the caller tears its link down.
    fn forget(&self, player: &Player) {
        let guild_id = player.guild_id();

        let removed = {
            let mut players = self.players.borrow_mut();

            match players.get(&guild_id) {
                Some(current) if current.ptr_eq(player) => players.remove(&guild_id),
                _ => None,
            }
        };

        if removed.is_some() {
            player.node().unregister(guild_id);
            player.destroy();
        }
    }

    fn relocate(&self, player: &Player, target: &Node) -> Result<()> {
        let source = player.node();

        target.register(player);

        if let Err(why) = player.link().move_to(target) {
            target.unregister(player.guild_id());

            return Err(why);
        }

        source.unregister(player.guild_id());
        player.restore();

        info!("[{}] Moved from {} to {}", player.guild_id(), source.name(), target.name());

        Ok(())
    }

    /// Removes a node from the pool, relocating or dropping its sessions
    /// before closing it.
    pub(crate) async fn evict(&self, node: &Node, reason: Option<String>) {
        self.nodes.borrow_mut().retain(|other| !other.ptr_eq(node));

        info!("Removing node {} ({:?})", node.name(), reason);

        for player in node.players() {
            if self.options.move_on_disconnect {
                let moved = match self.best_node(Some(node)) {
                    Some(target) => self.relocate(&player, &target),
                    None => Err(Error::NodeExhausted),
                };

                match moved {
                    Ok(()) => continue,
                    Err(why) => warn!("[{}] Failed to move off {}: {:?}", player.guild_id(), node.name(), why),
                }
            }

            self.forget(&player);
            player.handle_node_disconnect(node.name());

            if let Err(why) = player.link().leave().await {
                debug!("[{}] Failed to leave voice: {:?}", player.guild_id(), why);
            }
        }

        node.remove();

        events::emit(&self.events, ClientEvent::Disconnected {
            node: node.name().to_owned(),
            reason,
        });
    }
}
