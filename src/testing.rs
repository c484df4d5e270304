//! Fixtures shared by the unit tests. Nodes are attached to in-memory
//! channels instead of sockets.

use async_trait::async_trait;
use crate::config::{ClientIdentity, ClientOptions, JoinOptions};
use crate::events::{ClientEvent, CHANNEL_CAPACITY};
use crate::link::Link;
use crate::model::{Track, TrackInfo, VoiceServerUpdate, VoiceStateUpdate};
use crate::nodes::{Node, NodeConfig, NodeManager};
use crate::player::Player;
use crate::{EventHandler, Result};
use serde_json::{json, Value};
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::Instant;

pub const TRACK: &str = "QAAAjQIAJVJpY2sgQXN0bGV5";

/// Records every payload forwarded to the gateway.
#[derive(Clone)]
pub struct RecordingHandler {
    forwarded: Rc<RefCell<Vec<(u64, Value)>>>,
    connected: Rc<Cell<bool>>,
}

impl Default for RecordingHandler {
    fn default() -> Self {
        Self {
            forwarded: Rc::new(RefCell::new(Vec::new())),
            connected: Rc::new(Cell::new(true)),
        }
    }
}

impl RecordingHandler {
    /// Forwarded payloads, oldest first.
    pub fn forwarded(&self) -> Vec<Value> {
        self.forwarded.borrow().iter().map(|(_, value)| value.clone()).collect()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.set(connected);
    }
}

#[async_trait(?Send)]
impl EventHandler for RecordingHandler {
    async fn forward(&self, shard_id: u64, message: &str) -> Result<()> {
        let value = serde_json::from_str(message)?;
        self.forwarded.borrow_mut().push((shard_id, value));

        Ok(())
    }

    async fn is_connected(&self, _: u64) -> bool {
        self.connected.get()
    }
}

pub fn node(name: &str, options: ClientOptions) -> Node {
    let (events, _) = broadcast::channel(CHANNEL_CAPACITY);

    Node::new(config(name), Rc::new(options), events)
}

fn config(name: &str) -> NodeConfig {
    NodeConfig::new(name, "localhost", 2333, "youshallnotpass")
}

pub fn node_events(node: &Node) -> broadcast::Receiver<ClientEvent> {
    node.subscribe()
}

/// Marks the node connected; the receiver sees everything it writes.
pub fn connect(node: &Node) -> UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    node.attach(tx, false);

    rx
}

/// Everything written so far, parsed.
pub fn drain(rx: &mut UnboundedReceiver<String>) -> Vec<Value> {
    let mut sent = Vec::new();

    while let Ok(text) = rx.try_recv() {
        sent.push(serde_json::from_str(&text).unwrap());
    }

    sent
}

/// A stats payload whose penalty equals `players`.
pub fn stats(players: u32) -> String {
    json!({
        "op": "stats",
        "players": players,
        "playingPlayers": players,
        "uptime": 1000,
        "memory": { "free": 1, "used": 1, "allocated": 2, "reservable": 4 },
        "cpu": { "cores": 4, "systemLoad": 0.0, "lavalinkLoad": 0.0 },
        "frameStats": null,
    }).to_string()
}

/// Lets concurrently joined futures make progress.
pub async fn settle() {
    for _ in 0..3 {
        tokio::task::yield_now().await;
    }
}

pub fn server_update(guild_id: u64, endpoint: &str) -> VoiceServerUpdate {
    VoiceServerUpdate {
        token: "token".to_owned(),
        endpoint: Some(endpoint.to_owned()),
        guild_id,
    }
}

pub fn state_update(guild_id: u64, channel_id: Option<u64>, session_id: &str) -> VoiceStateUpdate {
    VoiceStateUpdate {
        user_id: 1,
        session_id: session_id.to_owned(),
        self_mute: false,
        self_deaf: false,
        guild_id,
        channel_id,
    }
}

/// Joins channel 10, feeding the link the gateway's answer.
pub async fn join_link(link: &Link) -> Result<()> {
    let guild_id = link.guild_id();
    let deadline = Instant::now() + Duration::from_secs(5);

    let updates = async {
        settle().await;

        link.apply_session_update(&state_update(guild_id, Some(10), "s1"));
        link.apply_server_update(server_update(guild_id, "a.discord.media"));
    };

    let (joined, ()) = tokio::join!(link.join(10, false, false, deadline), updates);

    joined
}

/// A started manager as user 1 with no nodes.
pub fn manager(options: ClientOptions) -> (NodeManager, RecordingHandler) {
    let handler = RecordingHandler::default();
    let manager = NodeManager::new(handler.clone(), options);
    manager.start(Vec::new(), ClientIdentity::new(1, 1)).unwrap();

    (manager, handler)
}

/// Registers a node that is not driven by a socket.
pub fn add_node(manager: &NodeManager, name: &str) -> Node {
    manager.insert_node(config(name)).unwrap()
}

/// Joins channel 10 of a guild through the manager.
pub async fn join(manager: &NodeManager, guild_id: u64) -> Player {
    let updates = async {
        settle().await;

        manager.voice_state_update(&state_update(guild_id, Some(10), "s1"));
        manager.voice_server_update(server_update(guild_id, "a.discord.media"));
    };

    let (joined, ()) = tokio::join!(manager.join_voice_channel(JoinOptions::new(guild_id, 10)), updates);

    joined.unwrap()
}

/// Runs a command while the node answers with `text`.
pub async fn reply<F: Future>(command: F, node: &Node, text: String) -> F::Output {
    let answer = async {
        settle().await;

        node.handle_message(&text);
    };

    let (output, ()) = tokio::join!(command, answer);

    output
}

pub fn track(seekable: bool) -> Track {
    Track {
        track: TRACK.to_owned(),
        info: TrackInfo {
            identifier: "dQw4w9WgXcQ".to_owned(),
            is_seekable: seekable,
            author: "RickAstleyVEVO".to_owned(),
            length: 212_000,
            is_stream: !seekable,
            position: 0,
            title: "Rick Astley - Never Gonna Give You Up".to_owned(),
            uri: Some("https://www.youtube.com/watch?v=dQw4w9WgXcQ".to_owned()),
        },
    }
}

/// An `event` op for a guild, merged with `fields`.
pub fn event(guild_id: u64, fields: Value) -> String {
    let mut message = json!({
        "op": "event",
        "guildId": guild_id.to_string(),
        "track": TRACK,
    });

    if let (Some(message), Value::Object(fields)) = (message.as_object_mut(), fields) {
        message.extend(fields);
    }

    message.to_string()
}

pub fn track_start(guild_id: u64) -> String {
    event(guild_id, json!({ "type": "TrackStartEvent" }))
}

pub fn track_end(guild_id: u64, reason: &str) -> String {
    event(guild_id, json!({ "type": "TrackEndEvent", "reason": reason }))
}

pub fn player_update(guild_id: u64, position: i64) -> String {
    json!({
        "op": "playerUpdate",
        "guildId": guild_id.to_string(),
        "state": { "time": 1_500_000_000_000i64, "position": position },
    }).to_string()
}
