use crate::committee::{Committee, Delegate};
use crate::config::{Parameters, PresetConfig, PACEMAKER_CHANNEL_CAPACITY};
use crate::error::{ConsensusError, ConsensusResult};
use crate::leader::{CommitteeLeader, CommitteeValidator, THRESHOLD_TIMER_TIMEOUT};
use crate::messages::ConsensusMessage;
use crate::pacemaker::{Pacemaker, PacemakerHandle, RecvKBlockInfo};
use crate::traits::{
    BlockBuilder, ChainError, ChainStore, Executor, KBlockRequest, LogDb, OutboundMessage,
    OutboundPayload, OutboundSender, OutboundTarget, ProposedBlockInfo, Staking, StateStore,
    TxPool,
};
use async_trait::async_trait;
use block::{Block, BlockHeader, BlockType, NetAddress, QuorumCert};
use bytes::Bytes;
use crypto::bls::{self, BlsKeyPair, BlsSignature};
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::sleep;

#[cfg(test)]
#[path = "tests/reactor_tests.rs"]
pub mod reactor_tests;

/// Upper bound on how far in the future a proposed block timestamp may be.
const BLOCK_INTERVAL: u64 = 10;

/// Smallest acceptable block gas limit.
const MIN_GAS_LIMIT: u64 = 10_000_000;

fn gas_limit_is_valid(limit: u64, parent_limit: u64) -> bool {
    let delta = parent_limit / 1_024;
    limit >= MIN_GAS_LIMIT && limit >= parent_limit.saturating_sub(delta)
        && limit <= parent_limit.saturating_add(delta)
}

/// The shared engine behind both the pacemaker and the epoch driver: every
/// collaborator seam, block validation, and the commit paths.
pub struct ReactorCore {
    pub chain: Arc<dyn ChainStore>,
    pub state_store: Arc<dyn StateStore>,
    pub executor: Arc<dyn Executor>,
    pub builder: Arc<dyn BlockBuilder>,
    pub logdb: Arc<dyn LogDb>,
    pub txpool: Arc<dyn TxPool>,
    pub outbound: OutboundSender,
    pub kblock_tx: Sender<RecvKBlockInfo>,
    pub bls_key: Arc<BlsKeyPair>,
    pub my_name: Vec<u8>,
    pub my_ecdsa_pk: Vec<u8>,
    pub my_net_addr: NetAddress,
    pub params: Parameters,
    kblock_request: Mutex<Option<KBlockRequest>>,
}

impl ReactorCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<dyn ChainStore>,
        state_store: Arc<dyn StateStore>,
        executor: Arc<dyn Executor>,
        builder: Arc<dyn BlockBuilder>,
        logdb: Arc<dyn LogDb>,
        txpool: Arc<dyn TxPool>,
        outbound: OutboundSender,
        kblock_tx: Sender<RecvKBlockInfo>,
        bls_key: Arc<BlsKeyPair>,
        my_name: Vec<u8>,
        my_ecdsa_pk: Vec<u8>,
        my_net_addr: NetAddress,
        params: Parameters,
    ) -> Self {
        Self {
            chain,
            state_store,
            executor,
            builder,
            logdb,
            txpool,
            outbound,
            kblock_tx,
            bls_key,
            my_name,
            my_ecdsa_pk,
            my_net_addr,
            params,
            kblock_request: Mutex::new(None),
        }
    }

    // ---- K-block triggering ------------------------------------------------

    /// Queue a request to close the epoch with a K-block. Consumed by the
    /// next proposal once enough M-blocks are in.
    pub fn set_kblock_request(&self, request: KBlockRequest) {
        *self.kblock_request.lock().unwrap() = Some(request);
    }

    pub fn clear_kblock_request(&self) {
        *self.kblock_request.lock().unwrap() = None;
    }

    /// The pending K-block request, if the epoch is old enough for it.
    pub fn ready_kblock_request(&self, parent: &Block, height: u64) -> Option<KBlockRequest> {
        let request = self.kblock_request.lock().unwrap().clone()?;
        let epoch_base = u64::from(parent.header.last_kblock_height);
        if height > epoch_base + self.params.min_mblocks_per_epoch {
            Some(request)
        } else {
            None
        }
    }

    // ---- block validation --------------------------------------------------

    /// Validate and replay a block received from the wire whose parent is
    /// on the chain. Returns the staged state and receipts.
    pub fn process(
        &self,
        blk: &Block,
        now: u64,
    ) -> ConsensusResult<(Arc<dyn crate::traits::Stage>, Vec<crate::traits::Receipt>)> {
        let header = &blk.header;
        if self.chain.get_block_header(&header.id()).is_some() {
            // We may already have this id. If it is after the best block,
            // still accept it.
            if blk.height() <= self.chain.best_block().height() {
                bail!(ConsensusError::ChainError(ChainError::KnownBlock));
            }
            debug!("continue to process blk, height {}", header.number);
        }
        let parent = self
            .chain
            .get_block_header(&header.parent_id)
            .ok_or(ConsensusError::ChainError(ChainError::ParentMissing))?;
        self.validate(blk, &parent, now).map(|(stage, receipts, _)| (stage, receipts))
    }

    /// Validate and replay a proposed block against an in-flight parent.
    pub fn process_proposed_block(
        &self,
        parent: &BlockHeader,
        blk: &Block,
        now: u64,
    ) -> ConsensusResult<(Arc<dyn crate::traits::Stage>, Vec<crate::traits::Receipt>, u64)> {
        if self.chain.get_block_header(&blk.header.id()).is_some() {
            bail!(ConsensusError::ChainError(ChainError::KnownBlock));
        }
        self.validate(blk, parent, now)
    }

    fn validate(
        &self,
        blk: &Block,
        parent: &BlockHeader,
        now: u64,
    ) -> ConsensusResult<(Arc<dyn crate::traits::Stage>, Vec<crate::traits::Receipt>, u64)> {
        self.validate_block_header(&blk.header, parent, now)?;
        if self.params.validate_evidence {
            self.validate_evidence(blk)?;
        }
        self.validate_block_body(blk)?;

        let (stage, receipts, checkpoint) = self.executor.execute(blk, parent)?;

        let total_gas: u64 = receipts.iter().map(|r| r.gas_used).sum();
        ensure!(
            total_gas == blk.header.gas_used,
            ConsensusError::ConsensusFailure(format!(
                "block gas used mismatch: want {}, have {}",
                blk.header.gas_used, total_gas
            ))
        );
        ensure!(
            stage.root() == blk.header.state_root,
            ConsensusError::ConsensusFailure(format!(
                "block state root mismatch: want {:?}, have {:?}",
                blk.header.state_root,
                stage.root()
            ))
        );
        Ok((stage, receipts, checkpoint))
    }

    fn validate_block_header(
        &self,
        header: &BlockHeader,
        parent: &BlockHeader,
        now: u64,
    ) -> ConsensusResult<()> {
        ensure!(
            header.timestamp > parent.timestamp,
            ConsensusError::ConsensusFailure(format!(
                "block timestamp behind parents: parent {}, current {}",
                parent.timestamp, header.timestamp
            ))
        );
        ensure!(
            header.timestamp <= now + BLOCK_INTERVAL,
            ConsensusError::ConsensusFailure("future block".to_string())
        );
        ensure!(
            gas_limit_is_valid(header.gas_limit, parent.gas_limit),
            ConsensusError::ConsensusFailure(format!(
                "block gas limit invalid: parent {}, current {}",
                parent.gas_limit, header.gas_limit
            ))
        );
        ensure!(
            header.gas_used <= header.gas_limit,
            ConsensusError::ConsensusFailure(format!(
                "block gas used exceeds limit: limit {}, used {}",
                header.gas_limit, header.gas_used
            ))
        );
        ensure!(
            header.total_score > parent.total_score,
            ConsensusError::ConsensusFailure(format!(
                "block total score invalid: parent {}, current {}",
                parent.total_score, header.total_score
            ))
        );
        Ok(())
    }

    fn validate_block_body(&self, blk: &Block) -> ConsensusResult<()> {
        let txs_root = Block::compute_txs_root(&blk.txs);
        ensure!(
            blk.header.txs_root == txs_root,
            ConsensusError::ConsensusFailure(format!(
                "block txs root mismatch: want {:?}, have {:?}",
                blk.header.txs_root, txs_root
            ))
        );
        Ok(())
    }

    /// Verify the committee-establishment evidence embedded at epoch start.
    /// Normally the committee info lives in the first M-block after the
    /// K-block.
    fn validate_evidence(&self, blk: &Block) -> ConsensusResult<()> {
        let Some(evidence) = blk.evidence() else {
            return Ok(());
        };
        let header = &blk.header;
        let info_block;
        let committee_info = if u64::from(header.last_kblock_height) + 1 == u64::from(header.number)
        {
            &blk.committee_info
        } else {
            info_block = self
                .chain
                .get_trunk_block(header.last_kblock_height + 1)
                .ok_or(ConsensusError::ConsensusFailure(
                    "get committee info block failed".to_string(),
                ))?;
            &info_block.committee_info
        };
        let committee = Committee::from_committee_info(committee_info, blk.qc.epoch_id)?;
        info!(
            "get committeeinfo from block, members {}",
            committee.size()
        );

        let check = |sig_bytes: &[u8], msg_hash, bitarray: &crypto::BitArray| -> ConsensusResult<()> {
            let sig = BlsSignature::from_bytes(sig_bytes)
                .ok_or(ConsensusError::InvalidSignature(0))?;
            let mut pubkeys = Vec::new();
            for index in bitarray.members() {
                let member = committee
                    .member_by_index(index)
                    .ok_or(ConsensusError::NotInCommittee)?;
                pubkeys.push(member.bls_pubkey);
            }
            let digests = vec![msg_hash; pubkeys.len()];
            ensure!(
                bls::aggregate_verify(&sig, &digests, &pubkeys),
                ConsensusError::ConsensusFailure("evidence signature validate error".to_string())
            );
            Ok(())
        };
        check(
            &evidence.voting_sig,
            evidence.voting_msg_hash,
            &evidence.voting_bitarray,
        )?;
        check(
            &evidence.notarize_sig,
            evidence.notarize_msg_hash,
            &evidence.notarize_bitarray,
        )
    }

    /// Validate a proposal and capture everything needed to commit or
    /// revert it later.
    pub fn validate_proposal(
        &self,
        parent: &BlockHeader,
        blk: &Block,
    ) -> ConsensusResult<ProposedBlockInfo> {
        let now = crate::messages::now_timestamp();
        let (stage, receipts, checkpoint) = self.process_proposed_block(parent, blk, now)?;

        let txpool = self.txpool.clone();
        let txs_for_removal = blk.txs.clone();
        let remove_txs = Arc::new(move || {
            txpool.remove_batch(&txs_for_removal);
            true
        });
        let txpool = self.txpool.clone();
        let txs_for_return = blk.txs.clone();
        let return_txs = Arc::new(move || {
            txpool.add_batch(&txs_for_return);
            true
        });

        Ok(ProposedBlockInfo {
            block: blk.clone(),
            stage,
            receipts,
            remove_txs,
            return_txs,
            checkpoint,
            block_type: blk.block_type(),
        })
    }

    // ---- commit paths ------------------------------------------------------

    /// Apply a block that already has a QC to state ahead of the final
    /// commit. Idempotent and safe to retry.
    pub fn pre_commit_block(&self, info: &ProposedBlockInfo) -> ConsensusResult<()> {
        let blk = &info.block;
        debug!("Try to pre-commit block {}", blk);
        info.stage.commit()?;
        match self.chain.add_block(blk, &info.receipts, false) {
            Ok(Some(fork)) if !fork.branch.is_empty() => {
                let out = format!(
                    "Fork happened ... fork(ancestor={}, branch={})",
                    fork.ancestor, fork.branch[0]
                );
                warn!("{}", out);
                bail!(ConsensusError::Unrecoverable(out));
            }
            Ok(_) => {}
            Err(ChainError::KnownBlock) => {}
            Err(e) => {
                warn!("add block failed: {}", e);
                bail!(ConsensusError::ChainError(e));
            }
        }
        // Only now are the packed txs gone for good.
        (info.remove_txs)();
        info!("block precommitted, height {}, id {}", blk.height(), blk.id());
        Ok(())
    }

    /// Finalize a decided block with its own QC and announce it.
    pub async fn finalize_commit_block(
        &self,
        info: &ProposedBlockInfo,
        best_qc: &QuorumCert,
    ) -> ConsensusResult<()> {
        let blk = &info.block;
        debug!("Try to finalize block {}", blk);

        self.logdb.commit_batch(&blk.header, &info.receipts)?;

        if blk.height() <= self.chain.best_block().height() {
            bail!(ConsensusError::ChainError(ChainError::KnownBlock));
        }
        match self.chain.add_block(blk, &info.receipts, true) {
            Ok(Some(fork)) if !fork.branch.is_empty() => {
                let out = format!(
                    "Fork happened ... fork(ancestor={}, branch={})",
                    fork.ancestor, fork.branch[0]
                );
                warn!("{}", out);
                bail!(ConsensusError::Unrecoverable(out));
            }
            Ok(_) => {}
            Err(e) => {
                warn!("add block failed: {}", e);
                bail!(ConsensusError::ChainError(e));
            }
        }

        self.chain.set_best_qc_candidate(best_qc.clone());
        self.chain.update_best_qc();

        let _ = self
            .outbound
            .send(OutboundMessage {
                payload: OutboundPayload::Block(blk.clone()),
                target: OutboundTarget::Broadcast,
            })
            .await;
        info!("Block committed, height {}, id {}", blk.height(), blk.id());
        Ok(())
    }

    /// Open the best state and walk it back to the captured checkpoint.
    pub fn revert_state(&self, checkpoint: u64) -> ConsensusResult<()> {
        let best = self.chain.best_block();
        self.state_store
            .revert_to(best.header.state_root, checkpoint)
            .map_err(ConsensusError::from)
    }
}

/// Internal ticks for the committee-formation threshold timers.
#[derive(Clone, Copy, Debug)]
enum FormationTick {
    AnnounceExpire,
    NotaryExpire,
}

enum FormationRole {
    Leader(CommitteeLeader),
    Validator(CommitteeValidator),
    Idle,
}

/// Dispatches raw wire bytes into the consensus stack: pacemaker messages
/// to the running pacemaker, committee-formation messages to the reactor.
#[derive(Clone)]
pub struct ConsensusReceiverHandler {
    pacemaker: Arc<RwLock<Option<PacemakerHandle>>>,
    tx_formation: Sender<(ConsensusMessage, NetAddress)>,
}

#[async_trait]
pub trait MessageHandler: Clone + Send + Sync + 'static {
    async fn dispatch(&self, message: Bytes, from: NetAddress) -> ConsensusResult<()>;
}

#[async_trait]
impl MessageHandler for ConsensusReceiverHandler {
    async fn dispatch(&self, message: Bytes, from: NetAddress) -> ConsensusResult<()> {
        let message = ConsensusMessage::decode(&message)?;
        if message.is_pacemaker_message() {
            let handle = self.pacemaker.read().unwrap().clone();
            match handle {
                Some(handle) => {
                    handle.dispatch(message, from).await;
                }
                None => warn!("no running pacemaker, message dropped: {}", message),
            }
            return Ok(());
        }
        self.tx_formation
            .send((message, from))
            .await
            .map_err(|_| ConsensusError::ConsensusFailure("reactor stopped".to_string()))
    }
}

/// Epoch lifecycle driver: elects the committee at every K-block boundary,
/// runs the one-shot formation FSM, and starts/stops the pacemaker.
pub struct ConsensusReactor {
    core: Arc<ReactorCore>,
    staking: Arc<dyn Staking>,
    preset: PresetConfig,
    params: Parameters,

    epoch_id: u64,
    last_kblock_height: u32,
    cur_delegates: Vec<Delegate>,
    role: FormationRole,
    pending_committee: Option<(Committee, usize)>,
    establishment_evidence: Option<block::Evidence>,

    pacemaker: Arc<RwLock<Option<PacemakerHandle>>>,
    pacemaker_task: Option<JoinHandle<()>>,

    rx_kblock: Receiver<RecvKBlockInfo>,
    tx_kblock: Sender<RecvKBlockInfo>,
    rx_formation: Receiver<(ConsensusMessage, NetAddress)>,
    tx_formation: Sender<(ConsensusMessage, NetAddress)>,
    rx_tick: Receiver<FormationTick>,
    tx_tick: Sender<FormationTick>,
}

impl ConsensusReactor {
    pub fn new(
        core: Arc<ReactorCore>,
        staking: Arc<dyn Staking>,
        preset: PresetConfig,
        params: Parameters,
        rx_kblock: Receiver<RecvKBlockInfo>,
        tx_kblock: Sender<RecvKBlockInfo>,
    ) -> Self {
        let (tx_formation, rx_formation) = channel(PACEMAKER_CHANNEL_CAPACITY);
        let (tx_tick, rx_tick) = channel(PACEMAKER_CHANNEL_CAPACITY);
        Self {
            core,
            staking,
            preset,
            params,
            epoch_id: 0,
            last_kblock_height: 0,
            cur_delegates: Vec::new(),
            role: FormationRole::Idle,
            pending_committee: None,
            establishment_evidence: None,
            pacemaker: Arc::new(RwLock::new(None)),
            pacemaker_task: None,
            rx_kblock,
            tx_kblock,
            rx_formation,
            tx_formation,
            rx_tick,
            tx_tick,
        }
    }

    /// The handler the transport feeds inbound messages into.
    pub fn receiver_handler(&self) -> ConsensusReceiverHandler {
        ConsensusReceiverHandler {
            pacemaker: self.pacemaker.clone(),
            tx_formation: self.tx_formation.clone(),
        }
    }

    pub fn update_cur_delegates(&mut self) {
        self.cur_delegates = self.staking.internal_delegate_list();
    }

    /// Entry point at a K-block boundary (and at boot): elect the next
    /// committee from the nonce and open the formation.
    pub async fn consensus_handle_received_nonce(
        &mut self,
        height: u64,
        nonce: u64,
        epoch: u64,
    ) -> ConsensusResult<()> {
        let committee = Committee::elect(&self.cur_delegates, nonce, epoch, &self.preset)?;
        let my_index = committee
            .index_of_sender(&self.core.my_ecdsa_pk)
            .ok_or(ConsensusError::NotInCommittee)?;
        self.epoch_id = epoch;
        info!(
            "elected committee for epoch {}, size {}, my index {}",
            epoch,
            committee.size(),
            my_index
        );

        self.pending_committee = Some((committee.clone(), my_index));
        if my_index == 0 {
            let mut leader = CommitteeLeader::new(
                committee,
                nonce,
                height,
                self.core.bls_key.clone(),
                self.core.my_ecdsa_pk.clone(),
            );
            let announce = leader.generate_announce_msg();
            self.role = FormationRole::Leader(leader);
            self.send_broadcast(ConsensusMessage::AnnounceCommittee(announce))
                .await;
            self.schedule_tick(FormationTick::AnnounceExpire, THRESHOLD_TIMER_TIMEOUT);
        } else {
            self.role = FormationRole::Validator(CommitteeValidator::new(
                committee,
                my_index,
                self.core.bls_key.clone(),
                self.core.my_ecdsa_pk.clone(),
            ));
        }
        Ok(())
    }

    /// K-block info from the pacemaker: wind the old session down and
    /// restart on the new epoch. Retried after a second while the
    /// pacemaker has not fully stopped yet.
    pub async fn handle_recv_kblock_info(&mut self, ki: RecvKBlockInfo) -> ConsensusResult<()> {
        let best = self.core.chain.best_block();
        if ki.height != best.height() {
            info!(
                "kblock info is ignored, received height {}, my best {}",
                ki.height,
                best.height()
            );
            return Ok(());
        }
        if best.block_type() != BlockType::KBlock {
            info!("best block is not kblock");
            return Ok(());
        }

        let running = self.pacemaker.read().unwrap().clone();
        if let Some(handle) = running {
            if !handle.is_stopped() {
                handle.stop();
                let tx = self.tx_kblock.clone();
                tokio::spawn(async move {
                    sleep(Duration::from_secs(1)).await;
                    let _ = tx.send(ki).await;
                });
                info!("pacemaker is not fully stopped, wait for another sec ...");
                return Ok(());
            }
        }

        info!(
            "received KBlock, height {}, lastKBlockHeight {}, nonce {}, epoch {}",
            ki.height, ki.last_kblock_height, ki.nonce, ki.epoch
        );
        self.last_kblock_height = best.header.number;
        self.update_cur_delegates();
        self.consensus_handle_received_nonce(ki.height, ki.nonce, ki.epoch + 1)
            .await
    }

    async fn on_formation_message(
        &mut self,
        message: ConsensusMessage,
        _from: NetAddress,
    ) -> ConsensusResult<()> {
        enum Action {
            Reply(ConsensusMessage),
            ReplyAndStart(ConsensusMessage, Committee),
            StartAsLeader(block::Evidence),
            Nothing,
        }

        let epoch_id = self.epoch_id;
        let action = match (&mut self.role, message) {
            (FormationRole::Validator(validator), ConsensusMessage::AnnounceCommittee(msg)) => {
                let commit = validator.process_announce(&msg)?;
                Action::Reply(ConsensusMessage::CommitCommittee(commit))
            }
            (FormationRole::Validator(validator), ConsensusMessage::NotaryAnnounce(msg)) => {
                let vote = validator.process_notary(&msg)?;
                // The published member list is final; the steady state can
                // start on it.
                let committee =
                    Committee::from_committee_info(&msg.committee_actual_members, epoch_id)?;
                Action::ReplyAndStart(ConsensusMessage::VoteForNotary(vote), committee)
            }
            (FormationRole::Leader(leader), ConsensusMessage::CommitCommittee(msg)) => {
                leader.process_commit_msg(&msg)?;
                Action::Nothing
            }
            (FormationRole::Leader(leader), ConsensusMessage::VoteForNotary(msg)) => {
                match leader.process_vote_notary(&msg)? {
                    Some(evidence) => Action::StartAsLeader(evidence),
                    None => Action::Nothing,
                }
            }
            (_, other) => {
                warn!("unexpected formation message: {}", other);
                Action::Nothing
            }
        };

        match action {
            Action::Reply(reply) => {
                let leader_addr = self.formation_leader_addr();
                self.send_to(reply, leader_addr).await;
            }
            Action::ReplyAndStart(reply, committee) => {
                let leader_addr = self.formation_leader_addr();
                self.send_to(reply, leader_addr).await;
                let my_index = committee
                    .index_of_sender(&self.core.my_ecdsa_pk)
                    .ok_or(ConsensusError::NotInCommittee)?;
                self.start_pacemaker(committee, my_index);
            }
            Action::StartAsLeader(evidence) => {
                self.establishment_evidence = Some(evidence);
                let (committee, my_index) =
                    self.pending_committee
                        .clone()
                        .ok_or(ConsensusError::ConsensusFailure(
                            "no pending committee".to_string(),
                        ))?;
                self.start_pacemaker(committee, my_index);
            }
            Action::Nothing => {}
        }
        Ok(())
    }

    async fn handle_tick(&mut self, tick: FormationTick) {
        let notary = match (&mut self.role, tick) {
            (FormationRole::Leader(leader), FormationTick::AnnounceExpire) => {
                leader.on_announce_expire()
            }
            (FormationRole::Leader(leader), FormationTick::NotaryExpire) => {
                leader.on_notary_expire();
                None
            }
            _ => None,
        };
        if let Some(notary) = notary {
            self.send_broadcast(ConsensusMessage::NotaryAnnounce(notary))
                .await;
            self.schedule_tick(FormationTick::NotaryExpire, THRESHOLD_TIMER_TIMEOUT);
        }
    }

    /// Establishment proof of the current committee, for the packer to
    /// embed in the first block of the epoch.
    pub fn establishment_evidence(&self) -> Option<&block::Evidence> {
        self.establishment_evidence.as_ref()
    }

    pub fn last_kblock_height(&self) -> u32 {
        self.last_kblock_height
    }

    /// Join handle of the running pacemaker loop, for shutdown supervision.
    pub fn pacemaker_task(&self) -> Option<&JoinHandle<()>> {
        self.pacemaker_task.as_ref()
    }

    fn start_pacemaker(&mut self, committee: Committee, my_index: usize) {
        let (pacemaker, handle) = Pacemaker::new(
            self.core.clone(),
            committee,
            my_index,
            self.params.clone(),
        );
        *self.pacemaker.write().unwrap() = Some(handle);
        self.pacemaker_task = Some(pacemaker.start(true));
        self.role = FormationRole::Idle;
    }

    fn formation_leader_addr(&self) -> Option<NetAddress> {
        self.pending_committee
            .as_ref()
            .and_then(|(committee, _)| committee.member_by_index(0))
            .map(|leader| leader.net_addr.clone())
    }

    fn schedule_tick(&self, tick: FormationTick, delay: Duration) {
        let tx = self.tx_tick.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(tick).await;
        });
    }

    async fn send_broadcast(&self, message: ConsensusMessage) {
        let _ = self
            .core
            .outbound
            .send(OutboundMessage {
                payload: OutboundPayload::Consensus(message),
                target: OutboundTarget::Broadcast,
            })
            .await;
    }

    async fn send_to(&self, message: ConsensusMessage, addr: Option<NetAddress>) {
        let Some(addr) = addr else {
            warn!("no destination for formation message, dropped");
            return;
        };
        if addr == self.core.my_net_addr {
            // A single-member edge: route through the formation queue.
            let _ = self.tx_formation.send((message, addr)).await;
            return;
        }
        let _ = self
            .core
            .outbound
            .send(OutboundMessage {
                payload: OutboundPayload::Consensus(message),
                target: OutboundTarget::Peer(addr),
            })
            .await;
    }

    /// Reactor event loop: K-block transitions, formation messages and the
    /// formation threshold timers.
    pub async fn run(mut self) {
        loop {
            let result = tokio::select! {
                Some(ki) = self.rx_kblock.recv() => self.handle_recv_kblock_info(ki).await,
                Some((message, from)) = self.rx_formation.recv() => {
                    self.on_formation_message(message, from).await
                }
                Some(tick) = self.rx_tick.recv() => {
                    self.handle_tick(tick).await;
                    Ok(())
                }
                else => return,
            };
            if let Err(e) = result {
                error!("reactor error: {}", e);
            }
        }
    }
}
