use hyper::http::uri::InvalidUri;
use std::result::Result as StdResult;
use thiserror::Error;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::Error as WebSocketError;

pub type Result<T> = StdResult<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The socket to a node failed.
    #[error("websocket error: {0}")]
    Transport(#[from] WebSocketError),
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Hyper(#[from] hyper::Error),
    #[error("failed to build request: {0}")]
    Http(#[from] hyper::http::Error),
    #[error("invalid uri: {0}")]
    InvalidUri(#[from] InvalidUri),
    #[error("rest request failed with status {0}")]
    RestStatus(u16),
    #[error("rest request timed out")]
    RestTimeout,
    /// A message was sent to a node that is not connected.
    #[error("node {0} is not connected")]
    NotConnected(String),
    #[error("timed out waiting for the voice connection")]
    ConnectTimeout,
    #[error("timed out waiting for the node to acknowledge the command")]
    CommandTimeout,
    #[error("the voice link is not connected")]
    NoActiveLink,
    #[error("the current track is not seekable")]
    NotSeekable,
    #[error("a join is already in progress for this guild")]
    AlreadyConnecting,
    #[error("no connected node is available")]
    NodeExhausted,
    #[error("no node named {0}")]
    NodeNotFound(String),
    #[error("a node named {0} already exists")]
    NodeAlreadyExists(String),
    #[error("the manager has not been started")]
    NotStarted,
    #[error("shard {0} is not connected")]
    ShardNotConnected(u64),
    /// The pending join was aborted by a leave.
    #[error("the join was cancelled")]
    JoinCancelled,
    #[error("volume {0} is out of range")]
    InvalidVolume(i32),
    #[error("equalizer band {0} is out of range")]
    InvalidBand(u8),
}
