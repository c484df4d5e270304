use async_trait::async_trait;
use crate::Result;

/// Bridge to the Discord gateway, implemented by the embedding application.
///
/// Futures returned by the handler run on the manager's thread and need not be
/// `Send`.
#[async_trait(?Send)]
pub trait EventHandler {
    /// Sends a voice state payload (gateway opcode 4) through the shard of
    /// the given ID.
    ///
    /// Resolves once the shard has accepted the payload.
    async fn forward(&self, shard_id: u64, message: &str) -> Result<()>;

    /// Whether the shard of the given ID is connected to the gateway.
    async fn is_connected(&self, shard_id: u64) -> bool;
}
