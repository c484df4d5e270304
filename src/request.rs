//! Correlates fire-and-forget node commands with the events that confirm
//! them.

use tokio::sync::oneshot;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) enum CommandKind {
    Play,
    Stop,
    Pause,
    Volume,
    Equalizer,
    Seek,
}

impl CommandKind {
    /// Commands confirmed by the next `playerUpdate` of their guild.
    pub const STATE: [CommandKind; 4] = [
        CommandKind::Pause,
        CommandKind::Volume,
        CommandKind::Equalizer,
        CommandKind::Seek,
    ];
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct RequestKey {
    pub guild_id: u64,
    pub kind: CommandKind,
    pub nonce: u64,
}

/// Outstanding commands of a single session, oldest first.
#[derive(Debug)]
pub(crate) struct PendingRequests {
    guild_id: u64,
    next_nonce: u64,
    entries: Vec<(RequestKey, oneshot::Sender<bool>)>,
}

impl PendingRequests {
    pub fn new(guild_id: u64) -> Self {
        Self {
            entries: Vec::new(),
            next_nonce: 0,
            guild_id,
        }
    }

    /// Registers a command; the receiver yields its outcome.
    pub fn register(&mut self, kind: CommandKind) -> (RequestKey, oneshot::Receiver<bool>) {
        // Callers that gave up no longer need their slot.
        self.entries.retain(|(_, tx)| !tx.is_closed());

        let key = RequestKey {
            guild_id: self.guild_id,
            nonce: self.next_nonce,
            kind,
        };
        self.next_nonce += 1;

        let (tx, rx) = oneshot::channel();
        self.entries.push((key, tx));

        (key, rx)
    }

    /// Resolves every outstanding command of the given kinds, returning how
    /// many were resolved.
    pub fn resolve(&mut self, kinds: &[CommandKind], outcome: bool) -> usize {
        let mut resolved = 0;
        let mut idx = 0;

        while idx < self.entries.len() {
            if kinds.contains(&self.entries[idx].0.kind) {
                let (key, tx) = self.entries.remove(idx);

                if tx.send(outcome).is_ok() {
                    trace!("Resolved {:?} with {}", key, outcome);
                    resolved += 1;
                }
            } else {
                idx += 1;
            }
        }

        resolved
    }

    /// Resolves the oldest outstanding command of the given kind, returning
    /// whether there was one.
    pub fn resolve_first(&mut self, kind: CommandKind, outcome: bool) -> bool {
        while let Some(idx) = self.entries.iter().position(|(key, _)| key.kind == kind) {
            let (key, tx) = self.entries.remove(idx);

            if tx.send(outcome).is_ok() {
                trace!("Resolved {:?} with {}", key, outcome);

                return true;
            }
        }

        false
    }

    /// Forgets a command, e.g. after it timed out or failed to send.
    pub fn cancel(&mut self, key: &RequestKey) {
        self.entries.retain(|(k, _)| k != key);
    }

    /// Drops every outstanding command; their callers observe a closed
    /// channel.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
