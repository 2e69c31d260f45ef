//! One-shot committee formation at epoch start.
//!
//! The elected leader announces the committee, collects commit votes,
//! notarizes the result and publishes the member list. The subsystem runs
//! to completion before the pacemaker starts and hands over nothing but
//! the finalized committee and the establishment evidence.

use crate::aggregator::SignatureAggregator;
use crate::committee::Committee;
use crate::error::{ConsensusError, ConsensusResult};
use crate::messages::{
    now_timestamp, AnnounceCommitteeMessage, CommitCommitteeMessage, CommonHeader,
    NotaryAnnounceMessage, VoteForNotaryMessage, CONSENSUS_MSG_ANNOUNCE_COMMITTEE,
    CONSENSUS_MSG_COMMIT_COMMITTEE, CONSENSUS_MSG_NOTARY_ANNOUNCE, CONSENSUS_MSG_VOTE_FOR_NOTARY,
};
use block::Evidence;
use crypto::bls::{self, BlsKeyPair, BlsSignature};
use crypto::{build_announce_digest, build_notary_digest, hash256, BitArray};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Wait for two-thirds consensus in each formation phase.
pub const THRESHOLD_TIMER_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LeaderState {
    Init,
    Announced,
    NotarySent,
    Committed,
}

/// Deterministic session identifier for one committee formation.
pub fn committee_id(nonce: u64, epoch_id: u64) -> u32 {
    let mut seed = nonce.to_le_bytes().to_vec();
    seed.extend_from_slice(&epoch_id.to_le_bytes());
    let digest = hash256(seed);
    u32::from_le_bytes([digest.0[0], digest.0[1], digest.0[2], digest.0[3]])
}

pub struct CommitteeLeader {
    committee: Committee,
    committee_id: u32,
    nonce: u64,
    height: u64,
    state: LeaderState,
    bls_key: Arc<BlsKeyPair>,
    my_ecdsa_pk: Vec<u8>,
    announce_agg: SignatureAggregator,
    notary_agg: SignatureAggregator,
    announce_agg_sig: Vec<u8>,
    announce_bitarray: BitArray,
}

impl CommitteeLeader {
    pub fn new(
        committee: Committee,
        nonce: u64,
        height: u64,
        bls_key: Arc<BlsKeyPair>,
        my_ecdsa_pk: Vec<u8>,
    ) -> Self {
        let id = committee_id(nonce, committee.epoch_id);
        let announce_digest = build_announce_digest(&my_ecdsa_pk, id, height, 0);
        let notary_digest = build_notary_digest(&my_ecdsa_pk, id, height, 0);
        let size = committee.size();
        Self {
            announce_agg: SignatureAggregator::new(size, announce_digest, committee.clone()),
            notary_agg: SignatureAggregator::new(size, notary_digest, committee.clone()),
            announce_agg_sig: Vec::new(),
            announce_bitarray: BitArray::new(size),
            committee,
            committee_id: id,
            nonce,
            height,
            state: LeaderState::Init,
            bls_key,
            my_ecdsa_pk,
        }
    }

    pub fn state(&self) -> LeaderState {
        self.state
    }

    pub fn committee_id(&self) -> u32 {
        self.committee_id
    }

    fn common_header(&self, msg_type: u8) -> CommonHeader {
        CommonHeader {
            height: self.height as u32,
            round: 0,
            sender: self.my_ecdsa_pk.clone(),
            timestamp: now_timestamp(),
            msg_type,
            epoch_id: self.committee.epoch_id,
        }
    }

    /// Open the formation: announce the committee to every member. The
    /// leader's own commit vote is counted right away.
    pub fn generate_announce_msg(&mut self) -> AnnounceCommitteeMessage {
        let msg = AnnounceCommitteeMessage {
            header: self.common_header(CONSENSUS_MSG_ANNOUNCE_COMMITTEE),
            announcer_id: self.my_ecdsa_pk.clone(),
            committee_id: self.committee_id,
            committee_size: self.committee.size() as u32,
            nonce: self.nonce,
            cs_leader_pubkey: self.bls_key.public_key().to_vec(),
            kblock_height: self.height,
            pow_block_height: 0,
        };
        let digest = *self.announce_agg.msg_hash();
        let signature = self.bls_key.sign(&digest);
        self.announce_agg
            .add(0, digest, signature.to_vec(), self.bls_key.public_key());
        self.state = LeaderState::Announced;
        msg
    }

    /// A member committed to the announced committee.
    pub fn process_commit_msg(&mut self, msg: &CommitCommitteeMessage) -> ConsensusResult<()> {
        ensure!(
            self.state >= LeaderState::Announced,
            ConsensusError::ConsensusFailure(format!(
                "state machine incorrect, expected ANNOUNCED, actual {:?}",
                self.state
            ))
        );
        ensure!(
            msg.committee_id == self.committee_id,
            ConsensusError::ConsensusFailure("committee id mismatch".to_string())
        );
        let index = self
            .committee
            .index_of_sender(&msg.header.sender)
            .ok_or(ConsensusError::NotInCommittee)?;
        ensure!(
            index as u32 == msg.committer_index,
            ConsensusError::VoterIndexMismatch {
                claimed: msg.committer_index,
                resolved: index as u32,
            }
        );
        ensure!(
            msg.signed_message_hash == *self.announce_agg.msg_hash(),
            ConsensusError::DigestMismatch
        );
        let member = self
            .committee
            .member_by_index(index)
            .ok_or(ConsensusError::NotInCommittee)?;
        let signature = BlsSignature::from_bytes(&msg.committer_signature)
            .ok_or(ConsensusError::InvalidSignature(msg.committer_index))?;
        ensure!(
            bls::verify(&signature, &msg.signed_message_hash, &member.bls_pubkey),
            ConsensusError::InvalidSignature(msg.committer_index)
        );
        let pubkey = member.bls_pubkey;
        self.announce_agg
            .add(index, msg.signed_message_hash, msg.committer_signature.clone(), pubkey);
        Ok(())
    }

    /// The announce threshold timer fired. With two thirds of commits the
    /// notary goes out; otherwise the formation resets.
    pub fn on_announce_expire(&mut self) -> Option<NotaryAnnounceMessage> {
        if self.state != LeaderState::Announced || !self.announce_agg.reached_majority() {
            warn!(
                "did not reach 2/3 committers of announce, count {}",
                self.announce_agg.count()
            );
            self.move_init_state();
            return None;
        }
        info!("committers reach 2/3 of committee");
        self.announce_agg_sig = self.announce_agg.aggregate();
        self.announce_bitarray = self.announce_agg.bitarray().clone();
        self.announce_agg.seal();

        let msg = NotaryAnnounceMessage {
            header: self.common_header(CONSENSUS_MSG_NOTARY_ANNOUNCE),
            announcer_id: self.my_ecdsa_pk.clone(),
            committee_id: self.committee_id,
            committee_size: self.committee.size() as u32,
            voter_bitarray: self.announce_bitarray.to_canonical_string(),
            voter_agg_signature: self.announce_agg_sig.clone(),
            committee_actual_size: self.committee.size() as u32,
            committee_actual_members: self.committee.to_committee_info(),
        };
        let digest = *self.notary_agg.msg_hash();
        let signature = self.bls_key.sign(&digest);
        self.notary_agg
            .add(0, digest, signature.to_vec(), self.bls_key.public_key());
        self.state = LeaderState::NotarySent;
        Some(msg)
    }

    /// A member notarized the committee. Two thirds seal the formation and
    /// yield the establishment evidence.
    pub fn process_vote_notary(
        &mut self,
        msg: &VoteForNotaryMessage,
    ) -> ConsensusResult<Option<Evidence>> {
        ensure!(
            self.state == LeaderState::NotarySent,
            ConsensusError::ConsensusFailure(format!(
                "state machine incorrect, expected NOTARYSENT, actual {:?}",
                self.state
            ))
        );
        let index = self
            .committee
            .index_of_sender(&msg.header.sender)
            .ok_or(ConsensusError::NotInCommittee)?;
        ensure!(
            index as u32 == msg.voter_index,
            ConsensusError::VoterIndexMismatch {
                claimed: msg.voter_index,
                resolved: index as u32,
            }
        );
        ensure!(
            msg.signed_message_hash == *self.notary_agg.msg_hash(),
            ConsensusError::DigestMismatch
        );
        let member = self
            .committee
            .member_by_index(index)
            .ok_or(ConsensusError::NotInCommittee)?;
        let signature = BlsSignature::from_bytes(&msg.voter_signature)
            .ok_or(ConsensusError::InvalidSignature(msg.voter_index))?;
        ensure!(
            bls::verify(&signature, &msg.signed_message_hash, &member.bls_pubkey),
            ConsensusError::InvalidSignature(msg.voter_index)
        );
        let pubkey = member.bls_pubkey;
        self.notary_agg
            .add(index, msg.signed_message_hash, msg.voter_signature.clone(), pubkey);

        if !self.notary_agg.reached_majority() {
            info!("vote for NotaryAnnounce processed, count {}", self.notary_agg.count());
            return Ok(None);
        }

        let evidence = Evidence {
            voting_sig: self.announce_agg_sig.clone(),
            voting_msg_hash: *self.announce_agg.msg_hash(),
            voting_bitarray: self.announce_bitarray.clone(),
            notarize_sig: self.notary_agg.aggregate(),
            notarize_msg_hash: *self.notary_agg.msg_hash(),
            notarize_bitarray: self.notary_agg.bitarray().clone(),
        };
        self.notary_agg.seal();
        self.state = LeaderState::Committed;
        info!(
            "==== Committee is established!!! #{} ====",
            self.committee_id
        );
        Ok(Some(evidence))
    }

    /// The notary threshold timer fired without a quorum.
    pub fn on_notary_expire(&mut self) {
        if self.state == LeaderState::NotarySent {
            warn!(
                "did not reach 2/3 votes of notary, count {}",
                self.notary_agg.count()
            );
            self.move_init_state();
        }
    }

    fn move_init_state(&mut self) {
        info!("current state {:?}, move to state init", self.state);
        self.state = LeaderState::Init;
    }
}

/// Member side of the formation: commit to the announce, notarize the
/// published committee.
pub struct CommitteeValidator {
    committee: Committee,
    my_index: usize,
    bls_key: Arc<BlsKeyPair>,
    my_ecdsa_pk: Vec<u8>,
}

impl CommitteeValidator {
    pub fn new(
        committee: Committee,
        my_index: usize,
        bls_key: Arc<BlsKeyPair>,
        my_ecdsa_pk: Vec<u8>,
    ) -> Self {
        Self {
            committee,
            my_index,
            bls_key,
            my_ecdsa_pk,
        }
    }

    fn common_header(&self, height: u32, msg_type: u8) -> CommonHeader {
        CommonHeader {
            height,
            round: 0,
            sender: self.my_ecdsa_pk.clone(),
            timestamp: now_timestamp(),
            msg_type,
            epoch_id: self.committee.epoch_id,
        }
    }

    /// Answer an announce with a commit vote to the leader.
    pub fn process_announce(
        &self,
        msg: &AnnounceCommitteeMessage,
    ) -> ConsensusResult<CommitCommitteeMessage> {
        let leader = self
            .committee
            .member_by_index(0)
            .ok_or(ConsensusError::NotInCommittee)?;
        ensure!(
            leader.ecdsa_pubkey == msg.header.sender,
            ConsensusError::NotInCommittee
        );
        let digest = build_announce_digest(
            &msg.announcer_id,
            msg.committee_id,
            u64::from(msg.header.height),
            0,
        );
        let signature = self.bls_key.sign(&digest);
        Ok(CommitCommitteeMessage {
            header: self.common_header(msg.header.height, CONSENSUS_MSG_COMMIT_COMMITTEE),
            committee_id: msg.committee_id,
            committer_id: self.my_ecdsa_pk.clone(),
            committer_index: self.my_index as u32,
            signed_message_hash: digest,
            committer_signature: signature.to_vec(),
            cs_committer_pubkey: self.bls_key.public_key().to_vec(),
        })
    }

    /// Verify the notarized announce quorum and answer with a notary vote.
    pub fn process_notary(
        &self,
        msg: &NotaryAnnounceMessage,
    ) -> ConsensusResult<VoteForNotaryMessage> {
        let announce_digest = build_announce_digest(
            &msg.announcer_id,
            msg.committee_id,
            u64::from(msg.header.height),
            0,
        );
        let bitarray = BitArray::from_canonical_str(&msg.voter_bitarray);
        ensure!(
            crate::aggregator::majority_two_thirds(bitarray.count(), self.committee.size()),
            ConsensusError::QCRequiresQuorum
        );
        let agg = BlsSignature::from_bytes(&msg.voter_agg_signature)
            .ok_or(ConsensusError::InvalidSignature(0))?;
        let mut pubkeys = Vec::new();
        for index in bitarray.members() {
            let member = self
                .committee
                .member_by_index(index)
                .ok_or(ConsensusError::NotInCommittee)?;
            pubkeys.push(member.bls_pubkey);
        }
        let digests = vec![announce_digest; pubkeys.len()];
        ensure!(
            bls::aggregate_verify(&agg, &digests, &pubkeys),
            ConsensusError::InvalidSignature(0)
        );

        let digest = build_notary_digest(
            &msg.announcer_id,
            msg.committee_id,
            u64::from(msg.header.height),
            0,
        );
        let signature = self.bls_key.sign(&digest);
        Ok(VoteForNotaryMessage {
            header: self.common_header(msg.header.height, CONSENSUS_MSG_VOTE_FOR_NOTARY),
            voter_id: self.my_ecdsa_pk.clone(),
            voter_index: self.my_index as u32,
            signed_message_hash: digest,
            voter_signature: signature.to_vec(),
            cs_voter_pubkey: self.bls_key.public_key().to_vec(),
        })
    }
}
