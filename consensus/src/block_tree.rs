use crate::error::{ConsensusError, ConsensusResult};
use crate::messages::PMProposalMessage;
use crate::traits::ProposedBlockInfo;
use block::{BlockType, QuorumCert};
use crypto::Digest;
use std::collections::HashMap;
use std::fmt;

/// A node of the pacemaker block tree. Parent and justify links are keys
/// resolved through the tree map, so eviction never leaves dangling
/// references and revert is a plain map delete.
pub struct ProposalBlock {
    pub height: u64,
    pub round: u64,
    pub parent_key: Option<(u64, u64)>,
    pub justify: QuorumCert,
    pub proposed_block: Vec<u8>,
    pub proposed_block_info: Option<ProposedBlockInfo>,
    pub proposal_message: Option<PMProposalMessage>,
    pub block_type: BlockType,
    pub voting_digest: Digest,
    pub success_processed: bool,
}

impl ProposalBlock {
    pub fn key(&self) -> (u64, u64) {
        (self.height, self.round)
    }
}

impl fmt::Display for ProposalBlock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "pmBlock(H:{} R:{} {:?} justify:(H:{} R:{}) processed:{})",
            self.height,
            self.round,
            self.block_type,
            self.justify.qc_height,
            self.justify.qc_round,
            self.success_processed
        )
    }
}

/// One in-flight block per height within the current session. The tree
/// does not enforce safety; it is a data structure with deterministic
/// revert semantics, the pacemaker owns the rules.
#[derive(Default)]
pub struct BlockTree {
    blocks: HashMap<u64, ProposalBlock>,
}

impl BlockTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a `(height, round)` reference carried in a message.
    pub fn address_block(&self, height: u64, round: u64) -> Option<&ProposalBlock> {
        self.blocks.get(&height).filter(|b| b.round == round)
    }

    pub fn get(&self, height: u64) -> Option<&ProposalBlock> {
        self.blocks.get(&height)
    }

    pub fn get_mut(&mut self, height: u64) -> Option<&mut ProposalBlock> {
        self.blocks.get_mut(&height)
    }

    pub fn contains(&self, height: u64) -> bool {
        self.blocks.contains_key(&height)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Insert a block. Idempotent on `(height, round)` with identical
    /// content; a different block in the slot indicates a fork and is
    /// rejected for the caller to handle.
    pub fn insert(&mut self, block: ProposalBlock) -> ConsensusResult<bool> {
        match self.blocks.get(&block.height) {
            None => {
                self.blocks.insert(block.height, block);
                Ok(true)
            }
            Some(existing) => {
                if existing.round == block.round && existing.proposed_block == block.proposed_block
                {
                    Ok(false)
                } else {
                    Err(ConsensusError::SlotOccupied {
                        height: block.height,
                        round: block.round,
                    })
                }
            }
        }
    }

    /// Force a block into its slot, replacing whatever was there. Used when
    /// a timeout certificate overrides the in-flight proposal at a height.
    pub fn replace(&mut self, block: ProposalBlock) {
        self.blocks.insert(block.height, block);
    }

    /// Byte-exact check that `qc` certifies this block: the coordinates
    /// match and every voter hash equals the block's voting digest. A QC
    /// with no voter hashes (the genesis or a chain-seed QC) matches on
    /// coordinates alone.
    pub fn block_match_qc(block: &ProposalBlock, qc: &QuorumCert) -> bool {
        if qc.qc_height != block.height || qc.qc_round != block.round {
            return false;
        }
        qc.voter_msg_hash
            .iter()
            .all(|hash| *hash == block.voting_digest)
    }

    /// Evict every entry at `height` and above, ascending, invoking
    /// `on_evict` for each before removal. Returns the evicted keys.
    pub fn revert_to(
        &mut self,
        height: u64,
        mut on_evict: impl FnMut(&ProposalBlock),
    ) -> Vec<(u64, u64)> {
        let mut evicted = Vec::new();
        let mut h = height;
        while let Some(block) = self.blocks.get(&h) {
            on_evict(block);
            evicted.push(block.key());
            self.blocks.remove(&h);
            h += 1;
        }
        evicted
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }
}
