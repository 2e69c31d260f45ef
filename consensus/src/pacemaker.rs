use crate::aggregator::SignatureAggregator;
use crate::block_tree::{BlockTree, ProposalBlock};
use crate::committee::Committee;
use crate::config::{Parameters, CONTROL_CHANNEL_CAPACITY, PACEMAKER_CHANNEL_CAPACITY};
use crate::error::{ConsensusError, ConsensusResult};
use crate::messages::{
    now_timestamp, CommonHeader, ConsensusMessage, NewViewReason, PMNewViewMessage,
    PMProposalMessage, PMQueryProposalMessage, PMVoteForProposalMessage,
    CONSENSUS_MSG_PM_NEW_VIEW, CONSENSUS_MSG_PM_PROPOSAL, CONSENSUS_MSG_PM_QUERY_PROPOSAL,
    CONSENSUS_MSG_PM_VOTE_FOR_PROPOSAL,
};
use crate::pending::{MsgRelayInfo, PendingList};
use crate::reactor::ReactorCore;
use crate::timeout_cert_manager::TimeoutCertManager;
use crate::traits::{
    ChainError, OutboundMessage, OutboundPayload, OutboundTarget, ProposedBlockInfo,
};
use block::{Block, BlockType, NetAddress, QuorumCert, TimeoutCert};
use crypto::bls::{self, BlsSignature};
use crypto::{build_new_view_digest, build_vote_digest, hash256, Digest};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::sleep;

#[cfg(test)]
#[path = "tests/pacemaker_tests.rs"]
pub mod pacemaker_tests;

/// Delay before the very first beat after a start.
const BEAT_START_DELAY: Duration = Duration::from_millis(1_000);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BeatReason {
    Init,
    HigherQC,
    Timeout,
}

impl std::fmt::Display for BeatReason {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            BeatReason::Init => write!(f, "BeatOnInit"),
            BeatReason::HigherQC => write!(f, "BeatOnHigherQC"),
            BeatReason::Timeout => write!(f, "BeatOnTimeout"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RoundUpdateReason {
    RegularProposal,
    TimeoutCertProposal,
    Timeout,
    Beat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TimerReason {
    Init,
    Inc,
    Keep,
}

#[derive(Clone, Copy, Debug)]
pub struct PMBeatInfo {
    pub height: u64,
    pub round: u64,
    pub reason: BeatReason,
}

#[derive(Clone, Copy, Debug)]
pub struct PMRoundTimeoutInfo {
    pub round: u64,
    pub counter: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct PMStopInfo;

/// Posted to the reactor when a K-block commits and the epoch ends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecvKBlockInfo {
    pub height: u64,
    pub last_kblock_height: u32,
    pub nonce: u64,
    pub epoch: u64,
}

/// A block position in the tree. Anchors are copies, not references, so
/// evicting the underlying entry never leaves them dangling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct BlockAnchor {
    height: u64,
    round: u64,
}

/// External handle into a running pacemaker.
#[derive(Clone)]
pub struct PacemakerHandle {
    tx_msg: Sender<(ConsensusMessage, NetAddress)>,
    tx_stop: Sender<PMStopInfo>,
    stopped: Arc<AtomicBool>,
}

impl PacemakerHandle {
    /// Enqueue an inbound consensus message for the event loop.
    pub async fn dispatch(&self, message: ConsensusMessage, from: NetAddress) -> bool {
        self.tx_msg.send((message, from)).await.is_ok()
    }

    /// Request a stop. One shot; duplicates are dropped when the control
    /// queue is full.
    pub fn stop(&self) {
        let _ = self.tx_stop.try_send(PMStopInfo);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// The round engine. One owning task runs the event loop and is the only
/// mutator of this state; network, timers and stop requests all arrive
/// through the bounded queues.
pub struct Pacemaker {
    reactor: Arc<ReactorCore>,
    committee: Committee,
    my_index: usize,
    params: Parameters,

    current_round: u64,
    last_voting_height: u64,
    qc_high: QuorumCert,
    block_leaf: BlockAnchor,
    block_executed: BlockAnchor,
    block_locked: BlockAnchor,
    start_height: u64,

    proposal_map: BlockTree,
    pending_list: PendingList,
    msg_relay_info: MsgRelayInfo,
    vote_sigs: Option<SignatureAggregator>,

    timeout_cert_manager: TimeoutCertManager,
    timeout_cert: Option<TimeoutCert>,
    timeout_counter: u64,
    round_timer: Option<JoinHandle<()>>,

    rx_msg: Receiver<(ConsensusMessage, NetAddress)>,
    rx_stop: Receiver<PMStopInfo>,
    rx_beat: Receiver<PMBeatInfo>,
    rx_timeout: Receiver<PMRoundTimeoutInfo>,
    tx_msg: Sender<(ConsensusMessage, NetAddress)>,
    tx_stop: Sender<PMStopInfo>,
    tx_beat: Sender<PMBeatInfo>,
    tx_timeout: Sender<PMRoundTimeoutInfo>,

    stopped: Arc<AtomicBool>,
}

impl Pacemaker {
    pub fn new(
        reactor: Arc<ReactorCore>,
        committee: Committee,
        my_index: usize,
        params: Parameters,
    ) -> (Self, PacemakerHandle) {
        let (tx_msg, rx_msg) = channel(PACEMAKER_CHANNEL_CAPACITY);
        let (tx_stop, rx_stop) = channel(CONTROL_CHANNEL_CAPACITY);
        let (tx_beat, rx_beat) = channel(CONTROL_CHANNEL_CAPACITY);
        let (tx_timeout, rx_timeout) = channel(CONTROL_CHANNEL_CAPACITY);
        let stopped = Arc::new(AtomicBool::new(true));

        let handle = PacemakerHandle {
            tx_msg: tx_msg.clone(),
            tx_stop: tx_stop.clone(),
            stopped: stopped.clone(),
        };

        let committee_size = committee.size();
        let pacemaker = Self {
            reactor,
            committee,
            my_index,
            params,
            current_round: 0,
            last_voting_height: 0,
            qc_high: QuorumCert::genesis(),
            block_leaf: BlockAnchor {
                height: 0,
                round: 0,
            },
            block_executed: BlockAnchor {
                height: 0,
                round: 0,
            },
            block_locked: BlockAnchor {
                height: 0,
                round: 0,
            },
            start_height: 0,
            proposal_map: BlockTree::new(),
            pending_list: PendingList::new(),
            msg_relay_info: MsgRelayInfo::new(),
            vote_sigs: None,
            timeout_cert_manager: TimeoutCertManager::new(committee_size),
            timeout_cert: None,
            timeout_counter: 0,
            round_timer: None,
            rx_msg,
            rx_stop,
            rx_beat,
            rx_timeout,
            tx_msg,
            tx_stop,
            tx_beat,
            tx_timeout,
            stopped,
        };
        (pacemaker, handle)
    }

    /// Seed the tree from the persisted chain and spawn the event loop.
    /// Round 0 for a fresh committee, the best QC round otherwise.
    pub fn start(mut self, new_committee: bool) -> JoinHandle<()> {
        self.reactor.chain.update_best_qc();
        self.reactor.chain.update_leaf_block();
        let block_qc = self.reactor.chain.best_qc();
        info!(
            "*** Pacemaker start at height {}, QC: {}, newCommittee: {}",
            block_qc.qc_height, block_qc, new_committee
        );

        let height = block_qc.qc_height;
        let round = if new_committee { 0 } else { block_qc.qc_round };
        self.start_height = height;

        let seed_block = self
            .reactor
            .chain
            .get_trunk_block(height as u32)
            .unwrap_or_else(|| self.reactor.chain.best_block());
        let seed_digest = block_qc.voting_digest().copied().unwrap_or_default();
        let b_init = ProposalBlock {
            height,
            round,
            parent_key: None,
            justify: block_qc.clone(),
            proposed_block: seed_block.to_bytes(),
            proposed_block_info: None,
            proposal_message: None,
            block_type: seed_block.block_type(),
            voting_digest: seed_digest,
            success_processed: false,
        };

        self.block_locked = BlockAnchor { height, round };
        self.block_executed = BlockAnchor { height, round };
        self.block_leaf = BlockAnchor { height, round };
        self.proposal_map.replace(b_init);
        self.qc_high = block_qc;

        // Channels are up before the start; drain whatever is stale.
        while self.rx_msg.try_recv().is_ok() {}
        while self.rx_timeout.try_recv().is_ok() {}
        while self.rx_beat.try_recv().is_ok() {}
        while self.rx_stop.try_recv().is_ok() {}
        self.pending_list.cleanup();
        self.msg_relay_info.clean_up_from(height);
        self.stopped.store(false, Ordering::SeqCst);

        self.schedule_on_beat(height + 1, round, BeatReason::Init, BEAT_START_DELAY);
        tokio::spawn(async move { self.main_loop().await })
    }

    async fn main_loop(mut self) {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                warn!("Pacemaker fully stopped.");
                return;
            }
            let result = tokio::select! {
                Some(_) = self.rx_stop.recv() => {
                    warn!("Scheduled stop, exit pacemaker now");
                    self.stop_cleanup();
                    return;
                }
                Some(ti) = self.rx_timeout.recv() => self.on_round_timeout(ti).await,
                Some(beat) = self.rx_beat.recv() => {
                    self.on_beat(beat.height, beat.round, beat.reason).await
                }
                Some((message, from)) = self.rx_msg.recv() => {
                    self.handle_message(message, from).await
                }
            };
            match result {
                Ok(()) => {}
                Err(ConsensusError::Unrecoverable(e)) => {
                    error!("Unrecoverable consensus failure: {}", e);
                    self.stop_cleanup();
                    return;
                }
                Err(e) => warn!("Error during handling: {}", e),
            }
        }
    }

    async fn handle_message(
        &mut self,
        message: ConsensusMessage,
        from: NetAddress,
    ) -> ConsensusResult<()> {
        match message {
            ConsensusMessage::Proposal(msg) => {
                let height = u64::from(msg.header.height);
                let round = u64::from(msg.header.round);
                let result = self.on_receive_proposal(msg, from).await;
                // Errors that just parked the message must not trigger a
                // replay; everything else may have unblocked a pending one.
                let parked = matches!(&result, Err(e) if e.is_pending());
                if !parked {
                    self.check_pending_messages(height, round);
                }
                result
            }
            ConsensusMessage::Vote(msg) => self.on_receive_vote(&msg).await,
            ConsensusMessage::NewView(msg) => self.on_receive_new_view(msg, from).await,
            ConsensusMessage::QueryProposal(msg) => self.on_receive_query_proposal(&msg).await,
            other => {
                warn!("Received a message of unexpected type: {}", other);
                Ok(())
            }
        }
    }

    // ---- proposal path ----------------------------------------------------

    async fn on_receive_proposal(
        &mut self,
        msg: PMProposalMessage,
        from: NetAddress,
    ) -> ConsensusResult<()> {
        let height = u64::from(msg.header.height);
        let round = u64::from(msg.header.round);

        if height < self.block_locked.height {
            info!(
                "recved proposal with height {} < bLocked.height {}, ignore ...",
                height, self.block_locked.height
            );
            return Ok(());
        }

        let blk = Block::from_bytes(&msg.proposed_block)
            .map_err(|_| ConsensusError::MalformedBlock(height))?;
        ensure!(
            blk.height() == height,
            ConsensusError::HeightMismatch {
                expected: height,
                actual: blk.height(),
            }
        );

        let qc = blk.qc.clone();
        info!(
            "start to handle received proposal, height {}, round {}, parent ({}, {}), qc {}, id {}",
            height, round, msg.parent_height, msg.parent_round, qc, blk.id()
        );

        // Address the parent.
        if self
            .proposal_map
            .address_block(msg.parent_height, msg.parent_round)
            .is_none()
        {
            self.park_message(
                msg.parent_height,
                msg.parent_round,
                ConsensusMessage::Proposal(msg),
                from,
            )
            .await;
            bail!(ConsensusError::UnknownParent {
                height,
                round,
            });
        }

        // Address the qc node and make sure the embedded QC certifies it.
        let qc_node_state = self
            .proposal_map
            .address_block(qc.qc_height, qc.qc_round)
            .map(|node| BlockTree::block_match_qc(node, &qc));
        match qc_node_state {
            None => {
                warn!("OnReceiveProposal: can not address qcNode");
                self.park_message(
                    qc.qc_height,
                    qc.qc_round,
                    ConsensusMessage::Proposal(msg),
                    from,
                )
                .await;
                bail!(ConsensusError::UnknownQcNode {
                    height: qc.qc_height,
                    round: qc.qc_round,
                });
            }
            Some(false) => {
                error!(
                    "qcNode does not match qc from proposal, potential fork happens, qcHeight {} qcRound {}",
                    qc.qc_height, qc.qc_round
                );
                self.park_message(
                    qc.qc_height,
                    qc.qc_round,
                    ConsensusMessage::Proposal(msg),
                    from,
                )
                .await;
                bail!(ConsensusError::QcMismatch {
                    height: qc.qc_height,
                    round: qc.qc_round,
                });
            }
            Some(true) => {
                debug!(
                    "addressed qcNode, qcHeight {} qcRound {}",
                    qc.qc_height, qc.qc_round
                );
            }
        }

        // A valid timeout certificate overrides the in-flight blocks from
        // this height on.
        let valid_timeout = self.verify_timeout_cert(msg.timeout_cert.as_ref(), height, round);
        if valid_timeout {
            self.revert_to(height);
        }

        if !self.proposal_map.contains(height) {
            let proposer = self.committee.round_proposer(round);
            let voting_digest = build_vote_digest(
                &proposer.bls_pubkey.0,
                self.committee.epoch_id,
                height,
                round,
            );
            self.proposal_map.insert(ProposalBlock {
                height,
                round,
                parent_key: Some((msg.parent_height, msg.parent_round)),
                justify: qc.clone(),
                proposed_block: msg.proposed_block.clone(),
                proposed_block_info: None,
                proposal_message: Some(msg.clone()),
                block_type: blk.block_type(),
                voting_digest,
                success_processed: false,
            })?;
        }

        let (bnew_height, bnew_round, justify_height) = {
            let bnew = self
                .proposal_map
                .get(height)
                .ok_or(ConsensusError::MissingProposal(height))?;
            (bnew.height, bnew.round, bnew.justify.qc_height)
        };

        let safe_to_vote = bnew_height > self.last_voting_height
            && (self.is_extended_from_locked(bnew_height, bnew_round)
                || justify_height > self.block_locked.height);

        if safe_to_vote || valid_timeout {
            let reason = if valid_timeout {
                RoundUpdateReason::TimeoutCertProposal
            } else {
                RoundUpdateReason::RegularProposal
            };
            self.update_current_round(bnew_round, reason);

            // The parent certified by the embedded QC can be applied to
            // state ahead of the commit.
            if justify_height > self.start_height {
                if let Err(e) = self.on_pre_commit_block(justify_height) {
                    warn!("pre-commit skipped: {}", e);
                }
            }

            if let Err(e) = self.validate_proposal(height) {
                error!("HELP: Validate Proposal failed: {}", e);
                return Err(e);
            }

            let vote = self.build_vote_for_proposal(&msg, &blk)?;
            self.send_to_round_proposer(round, ConsensusMessage::Vote(vote))
                .await;
            self.last_voting_height = bnew_height;
        }

        self.update(height).await
    }

    /// Validate a proposal through the reactor unless it was locally built
    /// or already validated; capture the state checkpoint on success.
    fn validate_proposal(&mut self, height: u64) -> ConsensusResult<()> {
        let parent_header = {
            let bnew = self
                .proposal_map
                .get(height)
                .ok_or(ConsensusError::MissingProposal(height))?;
            if bnew.success_processed {
                return Ok(());
            }
            let (parent_height, _) = bnew
                .parent_key
                .ok_or(ConsensusError::MissingProposal(height))?;
            let parent = self
                .proposal_map
                .get(parent_height)
                .ok_or(ConsensusError::MissingProposal(parent_height))?;
            Block::from_bytes(&parent.proposed_block)
                .map_err(|_| ConsensusError::MalformedBlock(parent_height))?
                .header
        };

        let block = {
            let bnew = self
                .proposal_map
                .get(height)
                .ok_or(ConsensusError::MissingProposal(height))?;
            Block::from_bytes(&bnew.proposed_block)
                .map_err(|_| ConsensusError::MalformedBlock(height))?
        };
        let info = self.reactor.validate_proposal(&parent_header, &block)?;
        let bnew = self
            .proposal_map
            .get_mut(height)
            .ok_or(ConsensusError::MissingProposal(height))?;
        bnew.proposed_block_info = Some(info);
        bnew.success_processed = true;
        Ok(())
    }

    fn build_vote_for_proposal(
        &self,
        msg: &PMProposalMessage,
        blk: &Block,
    ) -> ConsensusResult<PMVoteForProposalMessage> {
        let height = u64::from(msg.header.height);
        let round = u64::from(msg.header.round);
        let proposer = self.committee.round_proposer(round);
        let digest = build_vote_digest(
            &proposer.bls_pubkey.0,
            self.committee.epoch_id,
            height,
            round,
        );
        let signature = self.reactor.bls_key.sign(&digest);
        Ok(PMVoteForProposalMessage {
            header: self.common_header(height, round, CONSENSUS_MSG_PM_VOTE_FOR_PROPOSAL),
            voter_index: self.my_index as u32,
            signed_message_hash: digest,
            voter_signature: signature.to_vec(),
            cs_voter_pubkey: self.reactor.bls_key.public_key().to_vec(),
            block_id: blk.id(),
            txs_root: blk.header.txs_root,
            state_root: blk.header.state_root,
        })
    }

    // ---- vote path --------------------------------------------------------

    async fn on_receive_vote(&mut self, msg: &PMVoteForProposalMessage) -> ConsensusResult<()> {
        let height = u64::from(msg.header.height);
        let round = u64::from(msg.header.round);
        if round < self.current_round {
            info!(
                "expired voteForProposal message, current round {}, vote round {}",
                self.current_round, round
            );
        }

        let voting_digest = self
            .proposal_map
            .address_block(height, round)
            .map(|b| b.voting_digest)
            .ok_or(ConsensusError::MissingProposal(height))?;

        self.collect_vote_signature(msg, &voting_digest)?;

        let aggregator = match self.vote_sigs.as_ref() {
            Some(agg) if !agg.is_sealed() && *agg.msg_hash() == voting_digest => agg,
            _ => return Ok(()),
        };
        if !aggregator.reached_majority() {
            debug!(
                "not reach majority, committee size {}, count {}",
                self.committee.size(),
                aggregator.count()
            );
            return Ok(());
        }
        info!(
            "reached majority, committee size {}, count {}",
            self.committee.size(),
            aggregator.count()
        );

        let qc = QuorumCert {
            qc_height: height,
            qc_round: round,
            epoch_id: self.committee.epoch_id,
            voter_msg_hash: aggregator.msg_hashes(),
            voter_agg_sig: aggregator.aggregate(),
            voter_bitarray: aggregator.bitarray().clone(),
        };
        if let Some(agg) = self.vote_sigs.as_mut() {
            agg.seal();
        }

        if self.update_qc_high(&qc) {
            // Relay the fresh QC to the next round's proposer.
            self.on_next_sync_view(
                qc.qc_height + 1,
                qc.qc_round + 1,
                NewViewReason::HigherQCSeen,
                None,
            )
            .await;
        }
        Ok(())
    }

    fn collect_vote_signature(
        &mut self,
        msg: &PMVoteForProposalMessage,
        voting_digest: &Digest,
    ) -> ConsensusResult<()> {
        let index = msg.voter_index as usize;
        let member = self
            .committee
            .member_by_index(index)
            .ok_or(ConsensusError::NotInCommittee)?;
        ensure!(
            member.bls_pubkey.to_vec() == msg.cs_voter_pubkey,
            ConsensusError::InvalidSignature(msg.voter_index)
        );
        ensure!(
            msg.signed_message_hash == *voting_digest,
            ConsensusError::DigestMismatch
        );
        let signature = BlsSignature::from_bytes(&msg.voter_signature)
            .ok_or(ConsensusError::InvalidSignature(msg.voter_index))?;
        ensure!(
            bls::verify(&signature, voting_digest, &member.bls_pubkey),
            ConsensusError::InvalidSignature(msg.voter_index)
        );

        let pubkey = member.bls_pubkey;
        if let Some(agg) = self.vote_sigs.as_mut() {
            agg.add(
                index,
                msg.signed_message_hash,
                msg.voter_signature.clone(),
                pubkey,
            );
        }
        Ok(())
    }

    // ---- three-chain update and commit ------------------------------------

    /// HotStuff three-chain walk from a freshly inserted block. Locks the
    /// commit candidate, and decides once the direct-parent chain holds.
    async fn update(&mut self, bnew_height: u64) -> ConsensusResult<()> {
        let bnew = match self.proposal_map.get(bnew_height) {
            Some(b) => b,
            None => return Ok(()),
        };
        let justify = bnew.justify.clone();

        let prime2 = match self
            .proposal_map
            .address_block(justify.qc_height, justify.qc_round)
        {
            Some(b) => (b.height, b.round, b.parent_key, b.justify.clone()),
            None => {
                warn!("blockPrimePrime is empty, early termination of Update");
                return Ok(());
            }
        };
        let prime = match self
            .proposal_map
            .address_block(prime2.3.qc_height, prime2.3.qc_round)
        {
            Some(b) => (b.height, b.round, b.parent_key, b.justify.clone()),
            None => {
                warn!("blockPrime is empty, early termination of Update");
                return Ok(());
            }
        };
        let decided = match self
            .proposal_map
            .address_block(prime.3.qc_height, prime.3.qc_round)
        {
            Some(b) => (b.height, b.round),
            None => {
                // bnew justify is already higher than the current QCHigh.
                self.update_qc_high(&justify);
                warn!("block is empty, early termination of Update");
                return Ok(());
            }
        };

        // Pre-commit phase on b''.
        self.update_qc_high(&justify);

        // Commit phase on b'.
        if prime.0 > self.block_locked.height {
            self.block_locked = BlockAnchor {
                height: prime.0,
                round: prime.1,
            };
        }

        // Commit requires the direct-parent chain b'' -> b' -> b.
        if prime2.2 != Some((prime.0, prime.1)) || prime.2 != Some(decided) {
            return Ok(());
        }

        let mut commit_ready = Vec::new();
        let mut cursor = decided.0;
        while cursor > self.block_executed.height {
            commit_ready.push(cursor);
            match self.proposal_map.get(cursor).and_then(|b| b.parent_key) {
                Some((parent_height, _)) => cursor = parent_height,
                None => break,
            }
        }
        commit_ready.reverse();
        self.on_commit(commit_ready).await?;

        // Decide phase on b.
        self.block_executed = BlockAnchor {
            height: decided.0,
            round: decided.1,
        };
        Ok(())
    }

    async fn on_commit(&mut self, commit_ready: Vec<u64>) -> ConsensusResult<()> {
        for height in commit_ready {
            let (info, block_type) = {
                let b = match self.proposal_map.get(height) {
                    Some(b) => b,
                    None => continue,
                };
                info!("OnCommit, height {}, round {}", b.height, b.round);
                if !b.success_processed {
                    error!(
                        "Process this proposal failed, possible my states are wrong, height {}, round {}",
                        b.height, b.round
                    );
                    continue;
                }
                match &b.proposed_block_info {
                    Some(info) => (info.clone(), b.block_type),
                    None => {
                        error!("proposal at height {} has no block info, skip commit", height);
                        continue;
                    }
                }
            };

            let best_qc = self
                .proposal_map
                .get(height + 1)
                .map(|child| child.justify.clone())
                .unwrap_or_else(|| self.qc_high.clone());

            match self.reactor.finalize_commit_block(&info, &best_qc).await {
                Ok(()) => {}
                // The same block can be imported from the wire; success.
                Err(ConsensusError::ChainError(ChainError::KnownBlock)) => {}
                Err(ConsensusError::Unrecoverable(e)) => {
                    bail!(ConsensusError::Unrecoverable(e));
                }
                Err(e) => {
                    warn!("Commit block failed: {}", e);
                    if let Err(revert_err) = self.reactor.revert_state(info.checkpoint) {
                        error!("revert the state failed: {}", revert_err);
                    }
                }
            }

            if block_type == BlockType::KBlock {
                info!("committed a kblock, stop pacemaker, height {}", height);
                self.send_kblock_info(&info).await;
                self.stop();
            }
        }
        Ok(())
    }

    fn on_pre_commit_block(&mut self, height: u64) -> ConsensusResult<()> {
        let b = self
            .proposal_map
            .get(height)
            .ok_or(ConsensusError::MissingProposal(height))?;
        if !b.success_processed {
            bail!(ConsensusError::ConsensusFailure(
                "proposal not processed, precommit skipped".to_string()
            ));
        }
        let info = b
            .proposed_block_info
            .clone()
            .ok_or(ConsensusError::MissingProposal(height))?;
        self.reactor.pre_commit_block(&info)
    }

    async fn send_kblock_info(&mut self, info: &ProposedBlockInfo) {
        let blk = &info.block;
        if let Some(data) = blk.kblock_data() {
            let kinfo = RecvKBlockInfo {
                height: blk.height(),
                last_kblock_height: blk.header.last_kblock_height,
                nonce: data.nonce,
                epoch: self.committee.epoch_id,
            };
            if self.reactor.kblock_tx.send(kinfo.clone()).await.is_ok() {
                info!(
                    "sent kblock info to reactor, nonce {}, height {}",
                    kinfo.nonce, kinfo.height
                );
            }
        }
    }

    // ---- proposing --------------------------------------------------------

    async fn on_beat(&mut self, height: u64, round: u64, reason: BeatReason) -> ConsensusResult<()> {
        if reason == BeatReason::Timeout && height <= self.qc_high.qc_height {
            return self.on_timeout_beat(height, round).await;
        }
        info!("--------------------------------------------------");
        info!("  OnBeat Round:{}, Height:{}, Reason:{}", round, height, reason);
        info!("--------------------------------------------------");

        // The parent already got a QC; apply it to state early.
        let justify_height = self.qc_high.qc_height;
        if justify_height > self.start_height {
            if let Err(e) = self.on_pre_commit_block(justify_height) {
                warn!("pre-commit skipped: {}", e);
            }
        }

        if reason == BeatReason::Init {
            // Only reset the round timer at initialization.
            self.reset_round_timer(round, TimerReason::Init);
        }
        self.update_current_round(round, RoundUpdateReason::Beat);

        if self.committee.is_round_proposer(round, self.my_index) {
            info!("OnBeat: I am round proposer, round {}", round);
            let parent = self.block_leaf;
            let qc = self.qc_high.clone();
            self.on_propose(parent, qc, height, round).await?;
            self.block_leaf = BlockAnchor { height, round };
        } else {
            info!("OnBeat: I am NOT round proposer, round {}", round);
        }
        Ok(())
    }

    /// Beat for a height that already carries a QC: re-propose on the same
    /// parent with the superseded block's justify.
    async fn on_timeout_beat(&mut self, height: u64, round: u64) -> ConsensusResult<()> {
        info!("--------------------------------------------------");
        info!("  OnTimeoutBeat Round:{}, Height:{}", round, height);
        info!("--------------------------------------------------");
        let parent = self
            .proposal_map
            .get(height - 1)
            .map(|b| BlockAnchor {
                height: b.height,
                round: b.round,
            })
            .ok_or(ConsensusError::MissingProposal(height - 1))?;
        let justify = self
            .proposal_map
            .get(height)
            .map(|b| b.justify.clone())
            .ok_or(ConsensusError::MissingProposal(height))?;

        if self.committee.is_round_proposer(round, self.my_index) {
            info!("OnTimeoutBeat: I am round proposer, round {}", round);
            self.on_propose(parent, justify, height, round).await?;
        } else {
            info!("OnTimeoutBeat: I am NOT round proposer, round {}", round);
        }
        Ok(())
    }

    async fn on_propose(
        &mut self,
        parent: BlockAnchor,
        qc: QuorumCert,
        height: u64,
        round: u64,
    ) -> ConsensusResult<()> {
        // Clean the signature cache for the new proposal.
        let voting_digest = build_vote_digest(
            &self.committee.round_proposer(round).bls_pubkey.0,
            self.committee.epoch_id,
            height,
            round,
        );
        self.vote_sigs = Some(SignatureAggregator::new(
            self.committee.size(),
            voting_digest,
            self.committee.clone(),
        ));

        let mut bnew = self.create_leaf(parent, &qc, height, round)?;
        ensure!(
            bnew.height == height,
            ConsensusError::HeightMismatch {
                expected: height,
                actual: bnew.height,
            }
        );

        let msg = PMProposalMessage {
            header: self.common_header(height, round, CONSENSUS_MSG_PM_PROPOSAL),
            parent_height: parent.height,
            parent_round: parent.round,
            proposed_block: bnew.proposed_block.clone(),
            proposed_block_type: bnew.block_type.to_byte(),
            timeout_cert: self.timeout_cert.take(),
        };
        bnew.proposal_message = Some(msg.clone());

        // Create the slot directly instead of looping the message to self.
        self.proposal_map.replace(bnew);

        // Send the proposal to everybody, including myself.
        self.broadcast_proposal(msg, true).await;
        Ok(())
    }

    fn create_leaf(
        &mut self,
        parent: BlockAnchor,
        qc: &QuorumCert,
        height: u64,
        round: u64,
    ) -> ConsensusResult<ProposalBlock> {
        let (parent_block, parent_type) = {
            let parent_node = self
                .proposal_map
                .address_block(parent.height, parent.round)
                .ok_or(ConsensusError::MissingProposal(parent.height))?;
            let block = Block::from_bytes(&parent_node.proposed_block)
                .map_err(|_| ConsensusError::MalformedBlock(parent.height))?;
            (block, parent_node.block_type)
        };
        info!(
            "CreateLeaf: height={}, round={}, QCHeight={}, QCRound={}, parentHeight={}, parentRound={}",
            height, round, qc.qc_height, qc.qc_round, parent.height, parent.round
        );

        // After a K-block the pipeline is flushed with stop-committee
        // blocks so the K-block itself reaches the block store.
        let info = if parent_type == BlockType::KBlock || parent_type == BlockType::StopCommittee {
            info!("proposing stop-committee block: height={}, round={}", height, round);
            self.reactor.builder.build_stop_committee_block(&parent_block)
        } else if let Some(request) = self.reactor.ready_kblock_request(&parent_block, height) {
            self.reactor
                .builder
                .build_kblock(&parent_block, &request.data, &request.rewards)
        } else {
            self.reactor.builder.build_mblock(&parent_block)
        };
        let mut info = info.ok_or(ConsensusError::BuilderFailed { height, round })?;
        if info.block_type == BlockType::KBlock {
            self.reactor.clear_kblock_request();
        }
        // Seal the justify QC into the packed block before it ships.
        info.block.qc = qc.clone();
        info!("Proposed block: {}", info.block);

        let voting_digest = build_vote_digest(
            &self.committee.round_proposer(round).bls_pubkey.0,
            self.committee.epoch_id,
            height,
            round,
        );
        Ok(ProposalBlock {
            height,
            round,
            parent_key: Some((parent.height, parent.round)),
            justify: qc.clone(),
            proposed_block: info.block.to_bytes(),
            block_type: info.block_type,
            voting_digest,
            proposed_block_info: Some(info),
            proposal_message: None,
            success_processed: true,
        })
    }

    // ---- new view, timeouts and queries -----------------------------------

    async fn on_next_sync_view(
        &mut self,
        next_height: u64,
        next_round: u64,
        reason: NewViewReason,
        timeout_info: Option<PMRoundTimeoutInfo>,
    ) -> ConsensusResult<()> {
        let msg = self.build_new_view_message(next_height, next_round, reason, timeout_info);
        self.send_to_round_proposer(next_round, ConsensusMessage::NewView(msg))
            .await;
        Ok(())
    }

    fn build_new_view_message(
        &self,
        next_height: u64,
        next_round: u64,
        reason: NewViewReason,
        timeout_info: Option<PMRoundTimeoutInfo>,
    ) -> PMNewViewMessage {
        let header = self.common_header(next_height, next_round, CONSENSUS_MSG_PM_NEW_VIEW);
        match (reason, timeout_info) {
            (NewViewReason::RoundTimeout, Some(ti)) => {
                let timeout_height = self.qc_high.qc_height + 1;
                let digest = build_new_view_digest(
                    self.committee.epoch_id,
                    timeout_height,
                    ti.round,
                    ti.counter,
                );
                let signature = self.reactor.bls_key.sign(&digest);
                PMNewViewMessage {
                    header,
                    reason,
                    qc_high: self.qc_high.to_bytes(),
                    timeout_height,
                    timeout_round: ti.round,
                    timeout_counter: ti.counter,
                    peer_id: self.reactor.my_ecdsa_pk.clone(),
                    peer_index: self.my_index as u32,
                    signed_message_hash: digest,
                    peer_signature: signature.to_vec(),
                }
            }
            _ => PMNewViewMessage {
                header,
                reason,
                qc_high: self.qc_high.to_bytes(),
                timeout_height: 0,
                timeout_round: 0,
                timeout_counter: 0,
                peer_id: self.reactor.my_ecdsa_pk.clone(),
                peer_index: self.my_index as u32,
                signed_message_hash: Digest::default(),
                peer_signature: Vec::new(),
            },
        }
    }

    async fn on_receive_new_view(
        &mut self,
        msg: PMNewViewMessage,
        from: NetAddress,
    ) -> ConsensusResult<()> {
        let qc = QuorumCert::from_bytes(&msg.qc_high)?;

        // Drop stale news.
        let best_height = self.reactor.chain.best_block().height();
        if qc.qc_height < best_height {
            info!("old newview message, dropped, QCHeight {}", qc.qc_height);
            return Ok(());
        }

        let qc_node_state = self
            .proposal_map
            .address_block(qc.qc_height, qc.qc_round)
            .map(|node| BlockTree::block_match_qc(node, &qc));
        match qc_node_state {
            None => {
                error!("can not address qcNode from new view message");
                self.park_message(
                    qc.qc_height,
                    qc.qc_round,
                    ConsensusMessage::NewView(msg),
                    from,
                )
                .await;
                return Ok(());
            }
            Some(false) => {
                error!(
                    "qcNode does not match qc from new view, potential fork happens, qcHeight {} qcRound {}",
                    qc.qc_height, qc.qc_round
                );
                self.park_message(
                    qc.qc_height,
                    qc.qc_round,
                    ConsensusMessage::NewView(msg),
                    from,
                )
                .await;
                return Ok(());
            }
            Some(true) => {}
        }

        match msg.reason {
            NewViewReason::RoundTimeout => self.handle_timeout_new_view(msg, from, qc).await,
            NewViewReason::HigherQCSeen => {
                let round = u64::from(msg.header.round);
                if round <= self.current_round {
                    info!(
                        "expired newview message, dropped, current round {}, newview next round {}",
                        self.current_round, round
                    );
                    return Ok(());
                }
                if self.update_qc_high(&qc) && qc.qc_height > self.block_locked.height {
                    info!(
                        "Received a newview with higher QC, scheduleOnBeat now, qcHeight {}, qcRound {}",
                        qc.qc_height, qc.qc_round
                    );
                    self.schedule_on_beat(
                        self.qc_high.qc_height + 1,
                        qc.qc_round + 1,
                        BeatReason::HigherQC,
                        Duration::from_millis(self.params.round_interval),
                    );
                }
                Ok(())
            }
        }
    }

    async fn handle_timeout_new_view(
        &mut self,
        msg: PMNewViewMessage,
        from: NetAddress,
        qc: QuorumCert,
    ) -> ConsensusResult<()> {
        let height = u64::from(msg.header.height);
        let round = u64::from(msg.header.round);
        if !self.committee.is_round_proposer(round, self.my_index) {
            info!(
                "Not round proposer, drops the newView timeout, height {}, round {}",
                height, round
            );
            return Ok(());
        }

        // The timeout signature must cover the canonical new-view digest.
        let expected = build_new_view_digest(
            self.committee.epoch_id,
            msg.timeout_height,
            msg.timeout_round,
            msg.timeout_counter,
        );
        ensure!(
            msg.signed_message_hash == expected,
            ConsensusError::DigestMismatch
        );
        let member = self
            .committee
            .member_by_index(msg.peer_index as usize)
            .ok_or(ConsensusError::NotInCommittee)?;
        let signature = BlsSignature::from_bytes(&msg.peer_signature)
            .ok_or(ConsensusError::InvalidSignature(msg.peer_index))?;
        ensure!(
            bls::verify(&signature, &expected, &member.bls_pubkey),
            ConsensusError::InvalidSignature(msg.peer_index)
        );

        // Adopt the QC the timed-out peers carry; without it a proposer
        // that never saw the relay could not act on the certificate.
        self.update_qc_high(&qc);

        // If the peer is behind, forward the proposals that fill its gap.
        if qc.qc_height < self.last_voting_height {
            let mut forward_height = qc.qc_height;
            while let Some(proposal) = self.proposal_map.get(forward_height) {
                let Some(proposal_msg) = proposal.proposal_message.clone() else {
                    break;
                };
                info!(
                    "peer missed one proposal, forward to it, height {}, peer {}",
                    forward_height, from
                );
                self.send_outbound(
                    ConsensusMessage::Proposal(proposal_msg),
                    OutboundTarget::Peer(from.clone()),
                )
                .await;
                forward_height += 1;
            }
        }

        // Now count the timeout.
        self.timeout_cert_manager.collect_signature(&msg);
        let count = self
            .timeout_cert_manager
            .count(msg.timeout_height, msg.timeout_round);
        if !self
            .timeout_cert_manager
            .reached_majority(msg.timeout_height, msg.timeout_round)
        {
            info!(
                "not reach majority on timeout, count {}, timeoutHeight {}, timeoutRound {}, timeoutCounter {}",
                count, msg.timeout_height, msg.timeout_round, msg.timeout_counter
            );
            return Ok(());
        }
        info!(
            "reached majority on timeout, count {}, timeoutHeight {}, timeoutRound {}, timeoutCounter {}",
            count, msg.timeout_height, msg.timeout_round, msg.timeout_counter
        );
        self.timeout_cert = self
            .timeout_cert_manager
            .timeout_cert(msg.timeout_height, msg.timeout_round);
        self.timeout_cert_manager
            .cleanup(msg.timeout_height, msg.timeout_round);

        // Reached timeout consensus on (height, round); check my own state
        // before scheduling the beat.
        if self.qc_high.qc_height + 1 < height {
            info!(
                "Can not OnBeat due to states lagging, my QCHeight {}, timeoutCert height {}",
                self.qc_high.qc_height, height
            );
            return Ok(());
        }
        info!(
            "Received a newview with timeoutCert, scheduleOnBeat now, height {}, round {}",
            height, round
        );
        self.schedule_on_beat(
            height,
            round,
            BeatReason::Timeout,
            Duration::from_millis(self.params.round_interval),
        );
        Ok(())
    }

    async fn on_receive_query_proposal(
        &mut self,
        msg: &PMQueryProposalMessage,
    ) -> ConsensusResult<()> {
        let mut from_height = msg.from_height;
        let to_height = msg.to_height;
        let round = msg.round;
        info!(
            "receives query, fromHeight {}, toHeight {}, round {}, returnAddr {}",
            from_height, to_height, round, msg.return_addr
        );

        let best = self.reactor.chain.best_block();
        let best_height = best.height();
        let epoch_base = u64::from(best.header.last_kblock_height) + 1;
        if to_height <= best_height {
            error!(
                "query too old, fromHeight {}, toHeight {}, round {}",
                from_height, to_height, round
            );
            bail!(ConsensusError::ConsensusFailure("query too old".to_string()));
        }
        if from_height < epoch_base {
            from_height = epoch_base;
        }
        if from_height >= to_height {
            error!("invalid query, fromHeight {}, toHeight {}", from_height, to_height);
        }

        let mut query_height = from_height + 1;
        while query_height <= to_height {
            let proposal = self
                .proposal_map
                .get(query_height)
                .ok_or(ConsensusError::MissingProposal(query_height))?;
            let proposal_msg = proposal
                .proposal_message
                .clone()
                .ok_or(ConsensusError::MissingProposal(query_height))?;
            self.send_outbound(
                ConsensusMessage::Proposal(proposal_msg),
                OutboundTarget::Peer(msg.return_addr.clone()),
            )
            .await;
            query_height += 1;
        }
        Ok(())
    }

    async fn on_round_timeout(&mut self, ti: PMRoundTimeoutInfo) -> ConsensusResult<()> {
        warn!(
            "Round timed out, round {}, counter {}",
            ti.round, self.timeout_counter
        );
        let timed_out_round = self.current_round;
        self.update_current_round(self.current_round + 1, RoundUpdateReason::Timeout);
        let next_height = self.qc_high.qc_height + 1;
        self.on_next_sync_view(
            next_height,
            self.current_round,
            NewViewReason::RoundTimeout,
            Some(PMRoundTimeoutInfo {
                round: timed_out_round,
                counter: self.timeout_counter,
            }),
        )
        .await
    }

    /// Structural and cryptographic check of a proposal's timeout cert. A
    /// valid cert grants the liveness override for exactly this height.
    fn verify_timeout_cert(&self, tc: Option<&TimeoutCert>, height: u64, round: u64) -> bool {
        let Some(tc) = tc else { return false };
        if tc.timeout_height != height || tc.timeout_round >= round {
            return false;
        }
        if !crate::aggregator::majority_two_thirds(
            tc.timeout_bitarray.count(),
            self.committee.size(),
        ) {
            return false;
        }
        let digest = build_new_view_digest(
            self.committee.epoch_id,
            tc.timeout_height,
            tc.timeout_round,
            u64::from(tc.timeout_counter),
        );
        let Some(agg) = BlsSignature::from_bytes(&tc.timeout_agg_sig) else {
            return false;
        };
        let mut pubkeys = Vec::new();
        for index in tc.timeout_bitarray.members() {
            match self.committee.member_by_index(index) {
                Some(member) => pubkeys.push(member.bls_pubkey),
                None => return false,
            }
        }
        let digests = vec![digest; pubkeys.len()];
        bls::aggregate_verify(&agg, &digests, &pubkeys)
    }

    // ---- round and timer management ---------------------------------------

    fn update_qc_high(&mut self, qc: &QuorumCert) -> bool {
        let mut updated = false;
        if qc.qc_height > self.qc_high.qc_height {
            self.qc_high = qc.clone();
            self.block_leaf = BlockAnchor {
                height: qc.qc_height,
                round: qc.qc_round,
            };
            updated = true;
        }
        debug!("After update QCHigh, updated {}, now {}", updated, self.qc_high);
        updated
    }

    fn update_current_round(&mut self, round: u64, reason: RoundUpdateReason) -> bool {
        let mut updated = self.current_round != round;
        match reason {
            RoundUpdateReason::RegularProposal => {
                if round > self.current_round {
                    updated = true;
                    self.reset_round_timer(round, TimerReason::Init);
                } else {
                    return false;
                }
            }
            RoundUpdateReason::TimeoutCertProposal => {
                self.reset_round_timer(round, TimerReason::Keep);
            }
            RoundUpdateReason::Timeout => {
                self.reset_round_timer(round, TimerReason::Inc);
            }
            RoundUpdateReason::Beat => {}
        }
        if updated {
            self.current_round = round;
            info!("* Current round updated to {}, reason {:?}", round, reason);
            return true;
        }
        false
    }

    fn start_round_timer(&mut self, round: u64, reason: TimerReason) {
        if self.round_timer.is_some() {
            return;
        }
        match reason {
            TimerReason::Init => self.timeout_counter = 0,
            TimerReason::Inc => self.timeout_counter += 1,
            TimerReason::Keep => {}
        }
        info!(
            "Start round timer, round {}, counter {}",
            round, self.timeout_counter
        );
        let interval =
            self.params.round_timeout_interval * (1u64 << self.timeout_counter.min(16));
        let tx = self.tx_timeout.clone();
        let counter = self.timeout_counter;
        self.round_timer = Some(tokio::spawn(async move {
            sleep(Duration::from_millis(interval)).await;
            let _ = tx.send(PMRoundTimeoutInfo { round, counter }).await;
        }));
    }

    fn stop_round_timer(&mut self) {
        if let Some(timer) = self.round_timer.take() {
            info!("Stop round timer, round {}", self.current_round);
            timer.abort();
        }
    }

    fn reset_round_timer(&mut self, round: u64, reason: TimerReason) {
        self.stop_round_timer();
        self.start_round_timer(round, reason);
    }

    fn schedule_on_beat(&self, height: u64, round: u64, reason: BeatReason, delay: Duration) {
        let tx = self.tx_beat.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx
                .send(PMBeatInfo {
                    height,
                    round,
                    reason,
                })
                .await;
        });
    }

    // ---- revert and shutdown ----------------------------------------------

    fn revert_to(&mut self, revert_height: u64) {
        info!(
            "Start revert, revertHeight {}, block-leaf ({}, {}), QCHigh {}",
            revert_height, self.block_leaf.height, self.block_leaf.round, self.qc_high
        );
        let pivot = self
            .proposal_map
            .get(revert_height)
            .map(|b| (b.key(), b.parent_key, b.justify.clone()));

        let reactor = self.reactor.clone();
        self.proposal_map.revert_to(revert_height, |b| {
            match &b.proposed_block_info {
                Some(info) => {
                    // Return the packed txs of precommitted blocks.
                    (info.return_txs)();
                    if let Err(e) = reactor.revert_state(info.checkpoint) {
                        error!("revert the state failed: {}", e);
                    }
                }
                None => warn!("Empty block info, height {}", b.height),
            }
            warn!("Deleted from proposalMap: {}", b);
        });

        if let Some((pivot_key, pivot_parent, pivot_justify)) = pivot {
            if self.block_leaf.height >= pivot_key.0 {
                if let Some((parent_height, parent_round)) = pivot_parent {
                    self.block_leaf = BlockAnchor {
                        height: parent_height,
                        round: parent_round,
                    };
                }
            }
            if self.qc_high.qc_height >= pivot_key.0 {
                self.qc_high = pivot_justify;
            }
        }
        info!(
            "Reverted !!! block-leaf ({}, {}), QCHigh {}",
            self.block_leaf.height, self.block_leaf.round, self.qc_high
        );
    }

    /// Request a stop from inside a handler. Duplicate requests while one
    /// is queued are dropped.
    fn stop(&mut self) {
        let chain = &self.reactor.chain;
        info!(
            "Pacemaker stop requested. Current best: {}, bestQC: {}",
            chain.best_block(),
            chain.best_qc()
        );
        if self.tx_stop.try_send(PMStopInfo).is_err() {
            warn!("stop already scheduled");
        }
    }

    fn stop_cleanup(&mut self) {
        self.stop_round_timer();
        self.proposal_map.clear();
        self.pending_list.cleanup();
        self.current_round = 0;
        self.last_voting_height = 0;
        self.qc_high = QuorumCert::genesis();
        self.block_leaf = BlockAnchor { height: 0, round: 0 };
        self.block_executed = BlockAnchor { height: 0, round: 0 };
        self.block_locked = BlockAnchor { height: 0, round: 0 };
        self.vote_sigs = None;
        self.timeout_cert = None;
        self.stopped.store(true, Ordering::SeqCst);
        warn!("--- Pacemaker stopped successfully");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    // ---- plumbing ----------------------------------------------------------

    fn common_header(&self, height: u64, round: u64, msg_type: u8) -> CommonHeader {
        CommonHeader {
            height: height as u32,
            round: round as u32,
            sender: self.reactor.my_ecdsa_pk.clone(),
            timestamp: now_timestamp(),
            msg_type,
            epoch_id: self.committee.epoch_id,
        }
    }

    async fn send_outbound(&self, message: ConsensusMessage, target: OutboundTarget) {
        if self
            .reactor
            .outbound
            .send(OutboundMessage {
                payload: OutboundPayload::Consensus(message),
                target,
            })
            .await
            .is_err()
        {
            warn!("outbound channel closed, message dropped");
        }
    }

    /// Broadcast a proposal, deduped by the relay info, optionally looping
    /// it back into the local queue so this node processes it too.
    async fn broadcast_proposal(&mut self, msg: PMProposalMessage, include_self: bool) {
        let height = u64::from(msg.header.height);
        let digest = hash256(rlp::encode(&msg));
        if !self.msg_relay_info.mark(height, digest) {
            debug!("proposal at height {} already relayed, skip", height);
            return;
        }
        let message = ConsensusMessage::Proposal(msg);
        self.send_outbound(message.clone(), OutboundTarget::Broadcast)
            .await;
        if include_self {
            let my_addr = self.reactor.my_net_addr.clone();
            if self.tx_msg.try_send((message, my_addr)).is_err() {
                warn!("loopback queue full, own proposal dropped");
            }
        }
    }

    async fn send_to_round_proposer(&mut self, round: u64, message: ConsensusMessage) {
        let proposer = self.committee.round_proposer(round);
        if proposer.cs_index as usize == self.my_index {
            let my_addr = self.reactor.my_net_addr.clone();
            if self.tx_msg.try_send((message, my_addr)).is_err() {
                warn!("loopback queue full, message to self dropped");
            }
            return;
        }
        let target = OutboundTarget::Peer(proposer.net_addr.clone());
        self.send_outbound(message, target).await;
    }

    /// Park a message on the missing reference and ask the sender for the
    /// gap with a query.
    async fn park_message(
        &mut self,
        missing_height: u64,
        missing_round: u64,
        message: ConsensusMessage,
        from: NetAddress,
    ) {
        self.pending_list
            .add(missing_height, missing_round, message, from.clone());
        let best_height = self.reactor.chain.best_block().height();
        let query = PMQueryProposalMessage {
            header: self.common_header(
                missing_height,
                missing_round,
                CONSENSUS_MSG_PM_QUERY_PROPOSAL,
            ),
            from_height: best_height,
            to_height: missing_height,
            round: missing_round,
            return_addr: self.reactor.my_net_addr.clone(),
        };
        info!(
            "Send PMQueryProposal, height {}, round {}",
            missing_height, missing_round
        );
        self.send_outbound(
            ConsensusMessage::QueryProposal(query),
            OutboundTarget::Peer(from),
        )
        .await;
    }

    /// Replay messages that were waiting on the block just inserted.
    fn check_pending_messages(&mut self, height: u64, round: u64) {
        for (message, from) in self.pending_list.take(height, round) {
            info!("replay pending message waiting on ({}, {})", height, round);
            if self.tx_msg.try_send((message, from)).is_err() {
                warn!("inbound queue full, pending message dropped");
            }
        }
    }

    fn is_extended_from_locked(&self, height: u64, round: u64) -> bool {
        let locked = self.block_locked;
        let mut cursor = (height, round);
        loop {
            if cursor == (locked.height, locked.round) {
                return true;
            }
            let Some(block) = self.proposal_map.address_block(cursor.0, cursor.1) else {
                return false;
            };
            if block.height <= locked.height {
                return false;
            }
            match block.parent_key {
                Some(parent) => cursor = parent,
                None => return false,
            }
        }
    }
}
