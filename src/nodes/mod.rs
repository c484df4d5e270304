mod node;
mod node_manager;

pub use self::node::Node;
pub use self::node_manager::NodeManager;

pub(crate) use self::node_manager::ManagerInner;

use crate::model::Stats;

/// Connection state shared by nodes and voice links.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Status {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Identity of a Lavalink node.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeConfig {
    /// Unique key of the node within the pool.
    pub name: String,
    pub host: String,
    pub port: u16,
    /// The node's password, sent as the `Authorization` header.
    pub auth: String,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16, auth: impl Into<String>)
        -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            auth: auth.into(),
            port,
        }
    }

    pub fn websocket_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    pub fn http_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Latest health telemetry of a node.
#[derive(Clone, Debug, Default)]
pub struct State {
    pub stats: Option<Stats>,
}

impl State {
    /// The node's load score, if it has reported stats yet.
    pub fn penalty(&self) -> Option<i32> {
        self.stats.as_ref().map(Stats::penalty)
    }
}
