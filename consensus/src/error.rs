use crate::traits::ChainError;
use thiserror::Error;

#[macro_export]
macro_rules! bail {
    ($e:expr) => {
        return Err($e);
    };
}

#[macro_export(local_inner_macros)]
macro_rules! ensure {
    ($cond:expr, $e:expr) => {
        if !($cond) {
            bail!($e);
        }
    };
}

pub type ConsensusResult<T> = Result<T, ConsensusError>;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Serialization error: {0}")]
    CodecError(#[from] rlp::DecoderError),

    #[error("Chain error: {0}")]
    ChainError(#[from] ChainError),

    #[error("Can not address parent at ({height}, {round})")]
    UnknownParent { height: u64, round: u64 },

    #[error("Can not address qc node at ({height}, {round})")]
    UnknownQcNode { height: u64, round: u64 },

    #[error("QC node does not match the qc from the message at ({height}, {round})")]
    QcMismatch { height: u64, round: u64 },

    #[error("Proposal height mismatch: message {expected}, block {actual}")]
    HeightMismatch { expected: u64, actual: u64 },

    #[error("Proposal slot ({height}, {round}) occupied by a different block")]
    SlotOccupied { height: u64, round: u64 },

    #[error("Expired round {round}, current round {current}")]
    ExpiredRound { round: u64, current: u64 },

    #[error("Sender is not in the committee")]
    NotInCommittee,

    #[error("Invalid signature from committee index {0}")]
    InvalidSignature(u32),

    #[error("Voter index mismatch: claimed {claimed}, resolved {resolved}")]
    VoterIndexMismatch { claimed: u32, resolved: u32 },

    #[error("Message digest mismatch")]
    DigestMismatch,

    #[error("QC requires a quorum")]
    QCRequiresQuorum,

    #[error("TC requires a quorum")]
    TCRequiresQuorum,

    #[error("Malformed block at height {0}")]
    MalformedBlock(u64),

    #[error("Block builder failed at ({height}, {round})")]
    BuilderFailed { height: u64, round: u64 },

    #[error("Missing proposal at height {0}")]
    MissingProposal(u64),

    #[error("Committee too small: {size} delegates, minimum {min}")]
    CommitteeTooSmall { size: usize, min: usize },

    #[error("Consensus failure: {0}")]
    ConsensusFailure(String),

    #[error("Unrecoverable: {0}")]
    Unrecoverable(String),
}

impl ConsensusError {
    /// Errors that only mean a reference could not be resolved yet. The
    /// message has been parked in the pending list and must not be treated
    /// as a processing failure by the caller.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ConsensusError::UnknownParent { .. } | ConsensusError::UnknownQcNode { .. }
        )
    }
}
