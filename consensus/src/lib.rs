#[macro_use]
mod error;
mod aggregator;
mod block_tree;
mod committee;
mod config;
mod leader;
mod messages;
mod pacemaker;
mod pending;
mod reactor;
mod timeout_cert_manager;
mod traits;

pub use crate::aggregator::{majority_two_thirds, SignatureAggregator};
pub use crate::block_tree::{BlockTree, ProposalBlock};
pub use crate::committee::{Committee, CommitteeMember, Delegate};
pub use crate::config::{Export, Parameters, PresetConfig};
pub use crate::error::{ConsensusError, ConsensusResult};
pub use crate::leader::{CommitteeLeader, CommitteeValidator, LeaderState};
pub use crate::messages::{
    CommonHeader, ConsensusMessage, NewViewReason, PMNewViewMessage, PMProposalMessage,
    PMQueryProposalMessage, PMVoteForProposalMessage,
};
pub use crate::pacemaker::{BeatReason, Pacemaker, PacemakerHandle, RecvKBlockInfo};
pub use crate::reactor::{
    ConsensusReactor, ConsensusReceiverHandler, MessageHandler, ReactorCore,
};
pub use crate::timeout_cert_manager::TimeoutCertManager;
pub use crate::traits::{
    BlockBuilder, ChainError, ChainStore, Executor, Fork, KBlockRequest, LogDb, OutboundMessage,
    OutboundPayload, OutboundSender, OutboundTarget, PowReward, ProposedBlockInfo, Receipt, Stage,
    Staking, StateStore, TxPool,
};
