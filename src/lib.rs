//! Client-side orchestration for a pool of Lavalink audio nodes.
//!
//! A [`NodeManager`] keeps one WebSocket per node, places guild sessions on
//! the least loaded node and keeps each session's voice state in sync between
//! the Discord gateway (through an [`EventHandler`]) and the node that owns
//! it.
//!
//! All shared state is `Rc`/`RefCell` based: the manager and its node drivers
//! must run on a single thread inside a [`tokio::task::LocalSet`].
//!
//! [`NodeManager`]: nodes/struct.NodeManager.html
//! [`EventHandler`]: trait.EventHandler.html

#[macro_use] extern crate log;

pub mod config;
pub mod events;
pub mod link;
pub mod model;
pub mod nodes;
pub mod player;
pub mod rest;

mod error;
mod event_handler;
mod request;

#[cfg(test)]
mod testing;

pub use self::config::{ClientIdentity, ClientOptions, JoinOptions, PlayOptions};
pub use self::error::{Error, Result};
pub use self::event_handler::EventHandler;
pub use self::events::{ClientEvent, PlayerEvent};
pub use self::link::Link;
pub use self::nodes::{Node, NodeConfig, NodeManager, Status};
pub use self::player::Player;
