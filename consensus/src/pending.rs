use crate::messages::ConsensusMessage;
use block::NetAddress;
use crypto::Digest;
use std::collections::{HashMap, HashSet};

/// Messages parked because a `(height, round)` reference they carry is not
/// in the block tree yet. When the missing block arrives, the bucket is
/// drained and the messages replayed through the loop. Everything is
/// dropped when the epoch ends.
#[derive(Default)]
pub struct PendingList {
    messages: HashMap<(u64, u64), Vec<(ConsensusMessage, NetAddress)>>,
}

impl PendingList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, height: u64, round: u64, message: ConsensusMessage, from: NetAddress) {
        self.messages
            .entry((height, round))
            .or_default()
            .push((message, from));
    }

    /// Drain the bucket waiting on `(height, round)`.
    pub fn take(&mut self, height: u64, round: u64) -> Vec<(ConsensusMessage, NetAddress)> {
        self.messages.remove(&(height, round)).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.messages.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn cleanup(&mut self) {
        self.messages.clear();
    }
}

/// Dedupe of outbound proposal relays, keyed by height and message digest.
/// Cleared from a height upward when the pacemaker restarts there so the
/// same proposals can flow again in the next session.
#[derive(Default)]
pub struct MsgRelayInfo {
    sent: HashSet<(u64, Digest)>,
}

impl MsgRelayInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a message as relayed. Returns false if it was already marked.
    pub fn mark(&mut self, height: u64, digest: Digest) -> bool {
        self.sent.insert((height, digest))
    }

    pub fn is_marked(&self, height: u64, digest: &Digest) -> bool {
        self.sent.contains(&(height, *digest))
    }

    pub fn clean_up_from(&mut self, height: u64) {
        self.sent.retain(|(h, _)| *h < height);
    }
}
