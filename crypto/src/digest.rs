//! Canonical signing digests.
//!
//! Every consensus signature covers the SHA-256 of a formatted message, so
//! two implementations agree on bytes as long as they agree on the format
//! strings below.

use crate::{hash256, Digest};

/// Digest every committee member signs when voting for a proposal.
pub fn build_vote_digest(leader_pk: &[u8], epoch_id: u64, height: u64, round: u64) -> Digest {
    hash256(format!(
        "BlockVote Message: Leader:{} EpochID:{} Height:{} Round:{}",
        hex::encode(leader_pk),
        epoch_id,
        height,
        round
    ))
}

/// Digest the round proposer signs over its own proposal.
pub fn build_proposal_digest(proposer_pk: &[u8], epoch_id: u64, height: u64, round: u64) -> Digest {
    hash256(format!(
        "BlockProposal Message: Proposer:{} EpochID:{} Height:{} Round:{}",
        hex::encode(proposer_pk),
        epoch_id,
        height,
        round
    ))
}

/// Digest signed inside a round-timeout new-view message.
pub fn build_new_view_digest(
    epoch_id: u64,
    timeout_height: u64,
    timeout_round: u64,
    timeout_counter: u64,
) -> Digest {
    hash256(format!(
        "NewView Message: EpochID:{} TimeoutHeight:{} TimeoutRound:{} TimeoutCounter:{}",
        epoch_id, timeout_height, timeout_round, timeout_counter
    ))
}

/// Digest for the committee announce phase at epoch start.
pub fn build_announce_digest(
    announcer_pk: &[u8],
    committee_id: u32,
    height: u64,
    round: u64,
) -> Digest {
    hash256(format!(
        "Announce Committee Message: Announcer:{} CommitteeID:{} Height:{} Round:{}",
        hex::encode(announcer_pk),
        committee_id,
        height,
        round
    ))
}

/// Digest for the committee notary phase at epoch start.
pub fn build_notary_digest(
    announcer_pk: &[u8],
    committee_id: u32,
    height: u64,
    round: u64,
) -> Digest {
    hash256(format!(
        "Notary Announce Message: Announcer:{} CommitteeID:{} Height:{} Round:{}",
        hex::encode(announcer_pk),
        committee_id,
        height,
        round
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digests_separate_by_kind_and_coordinates() {
        let pk = [7u8; 48];
        let vote = build_vote_digest(&pk, 1, 5, 0);
        assert_eq!(vote, build_vote_digest(&pk, 1, 5, 0));
        assert_ne!(vote, build_vote_digest(&pk, 1, 5, 1));
        assert_ne!(vote, build_proposal_digest(&pk, 1, 5, 0));
        assert_ne!(vote, build_new_view_digest(1, 5, 0, 0));
    }
}
