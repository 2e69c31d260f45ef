//! Seams to the collaborators the consensus core drives but does not own.
//!
//! The core never reaches for process-wide singletons; everything it needs
//! from packing, storage, state and the network is injected here so tests
//! can substitute deterministic fakes.

use crate::committee::Delegate;
use crate::messages::ConsensusMessage;
use block::{Block, BlockHeader, BlockType, KBlockData, NetAddress, QuorumCert};
use crypto::Digest;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::Sender;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("block already exists")]
    KnownBlock,

    #[error("not found")]
    NotFound,

    #[error("parent missing")]
    ParentMissing,

    #[error("storage error: {0}")]
    Storage(String),
}

/// Reported by `ChainStore::add_block` when the inserted block created a
/// side branch. Under this protocol a confirmed fork is a safety violation.
#[derive(Clone, Debug)]
pub struct Fork {
    pub ancestor: Digest,
    pub branch: Vec<Digest>,
}

/// Transaction receipt as far as the core cares: enough to feed the log
/// store and to cross-check gas accounting during validation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Receipt {
    pub gas_used: u64,
    pub reverted: bool,
    pub outputs: Vec<Vec<u8>>,
}

/// An uncommitted state mutation produced by packing or replay. Committing
/// yields the resulting state root; `root` reads it without committing.
pub trait Stage: Send + Sync {
    fn root(&self) -> Digest;
    fn commit(&self) -> Result<Digest, ChainError>;
}

/// Candidate block handed back by the builder, together with everything the
/// core needs to commit it or walk it back.
#[derive(Clone)]
pub struct ProposedBlockInfo {
    pub block: Block,
    pub stage: Arc<dyn Stage>,
    pub receipts: Vec<Receipt>,
    pub remove_txs: Arc<dyn Fn() -> bool + Send + Sync>,
    pub return_txs: Arc<dyn Fn() -> bool + Send + Sync>,
    pub checkpoint: u64,
    pub block_type: BlockType,
}

impl fmt::Debug for ProposedBlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ProposedBlockInfo(block: {}, checkpoint: {})",
            self.block, self.checkpoint
        )
    }
}

/// Reward entry for the miners of the closing epoch, paid inside a K-block.
#[derive(Clone, Debug)]
pub struct PowReward {
    pub beneficiary: Vec<u8>,
    pub amount: u64,
}

/// Pending request to terminate the epoch with a K-block, queued when a PoW
/// result arrives and consumed by the round proposer.
#[derive(Clone, Debug)]
pub struct KBlockRequest {
    pub data: KBlockData,
    pub rewards: Vec<PowReward>,
}

/// Packs candidate blocks. Failure aborts the proposal for the round; the
/// round will time out and advance.
pub trait BlockBuilder: Send + Sync {
    fn build_mblock(&self, parent: &Block) -> Option<ProposedBlockInfo>;

    fn build_kblock(
        &self,
        parent: &Block,
        data: &KBlockData,
        rewards: &[PowReward],
    ) -> Option<ProposedBlockInfo>;

    fn build_stop_committee_block(&self, parent: &Block) -> Option<ProposedBlockInfo>;
}

/// The persistent chain the core commits into. Implementations handle their
/// own locking; all calls from the core are synchronous.
pub trait ChainStore: Send + Sync {
    fn best_block(&self) -> Block;

    fn best_qc(&self) -> QuorumCert;

    fn leaf_block(&self) -> Block;

    fn add_block(
        &self,
        block: &Block,
        receipts: &[Receipt],
        finalized: bool,
    ) -> Result<Option<Fork>, ChainError>;

    fn set_best_qc_candidate(&self, qc: QuorumCert);

    fn update_best_qc(&self);

    fn update_leaf_block(&self);

    fn get_block_header(&self, id: &Digest) -> Option<BlockHeader>;

    fn get_trunk_block(&self, height: u32) -> Option<Block>;
}

/// State access needed by the core: walking a speculative state back to a
/// checkpoint taken before packing.
pub trait StateStore: Send + Sync {
    fn revert_to(&self, root: Digest, checkpoint: u64) -> Result<(), ChainError>;
}

/// Replays a block's transactions against the state rooted at its parent.
pub trait Executor: Send + Sync {
    fn execute(
        &self,
        block: &Block,
        parent: &BlockHeader,
    ) -> Result<(Arc<dyn Stage>, Vec<Receipt>, u64), ChainError>;
}

/// Event/transfer log sink. Batches are prepared and committed per block at
/// finalization time.
pub trait LogDb: Send + Sync {
    fn commit_batch(&self, header: &BlockHeader, receipts: &[Receipt]) -> Result<(), ChainError>;
}

/// External mempool hooks used when proposals are reverted or committed.
pub trait TxPool: Send + Sync {
    fn remove_batch(&self, txs: &[Vec<u8>]);
    fn add_batch(&self, txs: &[Vec<u8>]);
}

/// Staking contract view.
pub trait Staking: Send + Sync {
    fn internal_delegate_list(&self) -> Vec<Delegate>;
}

#[derive(Clone, Debug)]
pub enum OutboundTarget {
    Broadcast,
    Peer(NetAddress),
    Peers(Vec<NetAddress>),
}

#[derive(Clone, Debug)]
pub enum OutboundPayload {
    Consensus(ConsensusMessage),
    /// A freshly committed block, announced to the rest of the network.
    Block(Block),
}

/// One outbound item. The transport owns delivery; the core only names the
/// destination.
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    pub payload: OutboundPayload,
    pub target: OutboundTarget,
}

/// Handle into the transport task.
pub type OutboundSender = Sender<OutboundMessage>;
