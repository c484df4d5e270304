use crate::config::{ClientIdentity, ClientOptions};
use crate::events::{self, ClientEvent};
use crate::model::{IncomingMessage, IntoWebSocketMessage, OutgoingMessage};
use crate::player::{Player, WeakPlayer};
use crate::rest::Resolver;
use crate::{Error, Result};
use futures::{SinkExt, StreamExt};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};
use super::{ManagerInner, NodeConfig, State, Status};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLIENT_NAME: &str = concat!("lavalink-pool/", env!("CARGO_PKG_VERSION"));

/// Close code reported when the socket dropped without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

/// A connection to a single Lavalink node.
///
/// Cloning is cheap; every clone refers to the same connection.
#[derive(Clone)]
pub struct Node {
    inner: Rc<NodeInner>,
}

struct NodeInner {
    config: NodeConfig,
    options: Rc<ClientOptions>,
    events: broadcast::Sender<ClientEvent>,
    rest: Resolver,
    resume_key: String,
    status: Cell<Status>,
    state: RefCell<State>,
    reconnect_attempts: Cell<u32>,
    connected_once: Cell<bool>,
    disconnected_at: Cell<Option<Instant>>,
    /// Sender half of the socket writer, present while connected.
    user_to_node: RefCell<Option<UnboundedSender<String>>>,
    queue: RefCell<VecDeque<String>>,
    /// Sessions routed through this node, keyed by guild. Owned by the
    /// manager.
    players: RefCell<HashMap<u64, WeakPlayer>>,
    driving: Cell<bool>,
    removed: Cell<bool>,
}

impl Node {
    pub(crate) fn new(
        config: NodeConfig,
        options: Rc<ClientOptions>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        let rest = Resolver::new(config.http_url(), config.auth.clone(), options.rest_timeout());

        Self {
            inner: Rc::new(NodeInner {
                resume_key: uuid::Uuid::new_v4().to_string(),
                status: Cell::new(Status::Disconnected),
                state: RefCell::new(State::default()),
                reconnect_attempts: Cell::new(0),
                connected_once: Cell::new(false),
                disconnected_at: Cell::new(None),
                user_to_node: RefCell::new(None),
                queue: RefCell::new(VecDeque::new()),
                players: RefCell::new(HashMap::new()),
                driving: Cell::new(false),
                removed: Cell::new(false),
                config,
                options,
                events,
                rest,
            }),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    #[inline]
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    #[inline]
    pub fn status(&self) -> Status {
        self.inner.status.get()
    }

    /// The track resolver of this node.
    #[inline]
    pub fn rest(&self) -> &Resolver {
        &self.inner.rest
    }

    pub fn state(&self) -> State {
        self.inner.state.borrow().clone()
    }

    /// The node's load score, or `None` until it reports stats.
    pub fn penalty(&self) -> Option<i32> {
        self.inner.state.borrow().penalty()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.get()
    }

    /// Number of sessions currently routed through this node.
    pub fn player_count(&self) -> usize {
        self.inner.players.borrow().len()
    }

    /// Whether both handles refer to the same connection.
    pub fn ptr_eq(&self, other: &Node) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Sends a message to the node.
    ///
    /// This only enqueues the message; whether the node acted on it is
    /// observed through the events it pushes back.
    ///
    /// Returns [`Error::NotConnected`] if the node is not connected, unless
    /// [`ClientOptions::queue_sends`] is set, in which case the message is
    /// held until the node connects.
    ///
    /// [`Error::NotConnected`]: ../enum.Error.html#variant.NotConnected
    /// [`ClientOptions::queue_sends`]: ../config/struct.ClientOptions.html#structfield.queue_sends
    pub fn send(&self, message: &OutgoingMessage) -> Result<()> {
        let text = message.into_ws_message()?;

        trace!("[{}] Sending: {}", self.name(), text);

        self.send_raw(text)
    }

    fn send_raw(&self, mut text: String) -> Result<()> {
        if self.status() == Status::Connected {
            if let Some(sender) = self.inner.user_to_node.borrow().as_ref() {
                match sender.send(text) {
                    Ok(()) => return Ok(()),
                    Err(mpsc::error::SendError(unsent)) => text = unsent,
                }
            }
        }

        if self.inner.options.queue_sends && !self.inner.removed.get() {
            self.inner.queue.borrow_mut().push_back(text);

            return Ok(());
        }

        Err(Error::NotConnected(self.name().to_owned()))
    }

    /// Closes the connection without reconnecting.
    ///
    /// The socket is sent a close frame once the writer notices the sender
    /// is gone.
    pub fn close(&self) {
        match self.status() {
            Status::Disconnecting => return,
            Status::Disconnected if !self.inner.driving.get() => return,
            _ => {},
        }

        debug!("[{}] Closing", self.name());

        self.inner.status.set(Status::Disconnecting);
        self.inner.user_to_node.borrow_mut().take();

        if !self.inner.driving.get() {
            self.inner.status.set(Status::Disconnected);
        }
    }

    /// Closes the connection for good, dropping anything still queued.
    pub(crate) fn remove(&self) {
        self.inner.removed.set(true);
        self.inner.queue.borrow_mut().clear();
        self.close();
    }

    pub(crate) fn register(&self, player: &Player) {
        self.inner.players.borrow_mut().insert(player.guild_id(), player.downgrade());
    }

    pub(crate) fn unregister(&self, guild_id: u64) {
        self.inner.players.borrow_mut().remove(&guild_id);
    }

    /// Sessions routed through this node, ordered by guild.
    pub(crate) fn players(&self) -> Vec<Player> {
        let mut players = self.inner.players
            .borrow()
            .values()
            .filter_map(WeakPlayer::upgrade)
            .collect::<Vec<_>>();
        players.sort_by_key(Player::guild_id);

        players
    }

    fn player(&self, guild_id: u64) -> Option<Player> {
        self.inner.players.borrow().get(&guild_id).and_then(WeakPlayer::upgrade)
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: ClientEvent) {
        if let ClientEvent::Debug { ref message, .. } = event {
            debug!("[{}] {}", self.name(), message);
        }

        events::emit(&self.inner.events, event);
    }

    /// Marks the socket as open, with `user_to_node` feeding its writer.
    ///
    /// On a reconnect, sessions on this node are either told they resumed or
    /// renegotiated from scratch.
    pub(crate) fn attach(&self, user_to_node: UnboundedSender<String>, resumed: bool) {
        let inner = &self.inner;
        let window = inner.options.resume_window();
        let resumed = resumed && inner.options.resumable && inner.disconnected_at
            .get()
            .map_or(false, |at| at.elapsed() <= window);
        let reconnect = inner.connected_once.replace(true);

        inner.disconnected_at.set(None);
        inner.reconnect_attempts.set(0);
        *inner.user_to_node.borrow_mut() = Some(user_to_node);
        inner.status.set(Status::Connected);

        info!("[{}] Connected (resumed: {})", self.name(), resumed);

        if inner.options.resumable {
            let configure = OutgoingMessage::ConfigureResuming {
                key: inner.resume_key.clone(),
                timeout: inner.options.resumable_timeout,
            };

            if let Err(why) = self.send(&configure) {
                warn!("[{}] Failed to configure resuming: {:?}", self.name(), why);
            }
        }

        let queued = inner.queue.borrow_mut().drain(..).collect::<Vec<_>>();

        for text in queued {
            if let Err(why) = self.send_raw(text) {
                warn!("[{}] Failed to flush queued message: {:?}", self.name(), why);
            }
        }

        self.emit(ClientEvent::Ready {
            node: self.name().to_owned(),
            resumed,
        });

        if !reconnect {
            return;
        }

        for player in self.players() {
            if resumed {
                player.handle_resumed();
            } else {
                player.renegotiate();
            }
        }
    }

    /// Marks the socket as gone.
    pub(crate) fn detach(&self, code: u16, reason: Option<String>) {
        let inner = &self.inner;

        inner.user_to_node.borrow_mut().take();

        if inner.disconnected_at.get().is_none() {
            inner.disconnected_at.set(Some(Instant::now()));
        }

        if inner.status.get() != Status::Disconnecting {
            inner.status.set(Status::Disconnected);
        }

        info!("[{}] Closed with code {}: {:?}", self.name(), code, reason);

        self.emit(ClientEvent::Closed {
            node: self.name().to_owned(),
            code,
            reason,
        });
    }

    /// Demultiplexes a text frame received from the node.
    pub(crate) fn handle_message(&self, text: &str) {
        trace!("[{}] Received: {}", self.name(), text);

        let message = match IncomingMessage::parse(text) {
            Ok(message) => message,
            Err(why) => {
                warn!("[{}] Error parsing received JSON: {:?}", self.name(), why);

                return;
            },
        };

        match message {
            IncomingMessage::Stats(stats) => {
                self.inner.state.borrow_mut().stats = Some(stats);
            },
            IncomingMessage::PlayerUpdate(update) => match self.player(update.guild_id) {
                Some(player) => player.handle_player_update(update.state),
                None => self.emit(ClientEvent::Debug {
                    node: self.name().to_owned(),
                    message: format!("player update for unknown guild {}", update.guild_id),
                }),
            },
            IncomingMessage::Event(event) => match self.player(event.guild_id()) {
                Some(player) => player.handle_event(event),
                None => self.emit(ClientEvent::Debug {
                    node: self.name().to_owned(),
                    message: format!("event for unknown guild {}", event.guild_id()),
                }),
            },
            IncomingMessage::Ready { resumed } => {
                debug!("[{}] Node reports ready (resumed: {})", self.name(), resumed);
            },
            IncomingMessage::Unknown(op) => {
                warn!("[{}] Unknown op: {:?}", self.name(), op);
            },
        }
    }

    /// Drives the connection until it is closed or given up on.
    ///
    /// Unexpected closures are retried up to
    /// [`ClientOptions::reconnect_tries`] times with a doubling delay, after
    /// which the node is evicted from the manager.
    ///
    /// [`ClientOptions::reconnect_tries`]: ../config/struct.ClientOptions.html#structfield.reconnect_tries
    pub(crate) async fn run(self, identity: ClientIdentity, manager: Weak<ManagerInner>) {
        self.inner.driving.set(true);

        loop {
            if self.status() == Status::Disconnecting {
                break;
            }

            self.inner.status.set(Status::Connecting);

            let (code, reason) = match self.open(&identity).await {
                Ok((stream, resumed)) => self.pump(stream, resumed).await,
                Err(why) => {
                    warn!("[{}] Failed to connect: {:?}", self.name(), why);

                    self.emit(ClientEvent::Error {
                        node: self.name().to_owned(),
                        message: why.to_string(),
                    });

                    (ABNORMAL_CLOSURE, Some(why.to_string()))
                },
            };

            self.detach(code, reason.clone());

            if self.status() == Status::Disconnecting {
                break;
            }

            let attempt = self.inner.reconnect_attempts.get() + 1;

            if attempt > self.inner.options.reconnect_tries {
                warn!("[{}] Giving up after {} reconnect attempts", self.name(), attempt - 1);

                self.inner.driving.set(false);

                if let Some(manager) = manager.upgrade() {
                    manager.evict(&self, reason.or_else(|| {
                        Some("failed to reconnect".to_owned())
                    })).await;
                }

                return;
            }

            self.inner.reconnect_attempts.set(attempt);

            let delay = self.inner.options.reconnect_delay(attempt);

            info!(
                "[{}] Reconnecting (attempt {}/{}) in {:?}",
                self.name(),
                attempt,
                self.inner.options.reconnect_tries,
                delay,
            );

            time::sleep(delay).await;
        }

        self.inner.status.set(Status::Disconnected);
        self.inner.driving.set(false);
    }

    async fn open(&self, identity: &ClientIdentity) -> Result<(WsStream, bool)> {
        let config = &self.inner.config;
        let mut request = config.websocket_url().into_client_request()?;

        {
            let headers = request.headers_mut();
            headers.insert("Authorization", HeaderValue::from_str(&config.auth)?);
            headers.insert("Num-Shards", HeaderValue::from(identity.shard_count));
            headers.insert("User-Id", HeaderValue::from(identity.user_id));
            headers.insert("Client-Name", HeaderValue::from_static(CLIENT_NAME));

            if self.inner.options.resumable && self.inner.connected_once.get() {
                headers.insert("Resume-Key", HeaderValue::from_str(&self.inner.resume_key)?);
            }
        }

        debug!("[{}] Connecting to {}", self.name(), config.websocket_url());

        let (stream, response) = tokio_tungstenite::connect_async(request).await?;

        let resumed = response.headers()
            .get("Session-Resumed")
            .and_then(|value| value.to_str().ok())
            .map_or(false, |value| value == "true");

        Ok((stream, resumed))
    }

    /// Pumps both directions of an open socket, returning the close code and
    /// reason once it ends.
    async fn pump(&self, stream: WsStream, resumed: bool) -> (u16, Option<String>) {
        let (mut sink, mut stream) = stream.split();

        if self.status() == Status::Disconnecting {
            let _ = sink.send(Message::Close(None)).await;

            return (1000, Some("closed by client".to_owned()));
        }

        // user_to_node: user send to node (node handles)
        // node_from_user: node receive from user (writer handles)
        let (user_to_node, mut node_from_user) = mpsc::unbounded_channel::<String>();
        self.attach(user_to_node, resumed);

        loop {
            tokio::select! {
                outgoing = node_from_user.recv() => match outgoing {
                    Some(text) => {
                        if let Err(why) = sink.send(Message::Text(text.into())).await {
                            warn!("[{}] Failed to write: {:?}", self.name(), why);

                            return (ABNORMAL_CLOSURE, Some(why.to_string()));
                        }
                    },
                    None => {
                        let _ = sink.send(Message::Close(None)).await;

                        return (1000, Some("closed by client".to_owned()));
                    },
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.handle_message(text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        return match frame {
                            Some(frame) => (u16::from(frame.code), Some(frame.reason.as_str().to_owned())),
                            None => (1005, None),
                        };
                    },
                    Some(Ok(other)) => trace!("[{}] Ignoring frame: {:?}", self.name(), other),
                    Some(Err(why)) => {
                        warn!("[{}] Failed to read: {:?}", self.name(), why);

                        return (ABNORMAL_CLOSURE, Some(why.to_string()));
                    },
                    None => return (ABNORMAL_CLOSURE, None),
                },
            }
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name())
            .field("status", &self.status())
            .field("penalty", &self.penalty())
            .field("players", &self.player_count())
            .finish()
    }
}
