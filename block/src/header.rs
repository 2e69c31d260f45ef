use crypto::{hash256, Digest};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use std::fmt;

/// Role of a block in the epoch pipeline.
///
/// K-blocks terminate an epoch, M-blocks carry regular transactions and
/// S-blocks are the stop-committee placeholders that flush the pipeline
/// after a K-block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockType {
    KBlock,
    MBlock,
    StopCommittee,
}

impl BlockType {
    pub fn to_byte(self) -> u8 {
        match self {
            BlockType::KBlock => 1,
            BlockType::MBlock => 2,
            BlockType::StopCommittee => 255,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(BlockType::KBlock),
            2 => Some(BlockType::MBlock),
            255 => Some(BlockType::StopCommittee),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub parent_id: Digest,
    pub number: u32,
    pub timestamp: u64,
    pub txs_root: Digest,
    pub state_root: Digest,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub total_score: u64,
    pub block_type: BlockType,
    pub last_kblock_height: u32,
    pub proposer_pk: Vec<u8>,
}

impl BlockHeader {
    /// Unique block identifier, the hash of the RLP-encoded header.
    pub fn id(&self) -> Digest {
        hash256(rlp::encode(self))
    }
}

impl fmt::Display for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Header(#{} {:?} parent:{} txsRoot:{} stateRoot:{})",
            self.number, self.block_type, self.parent_id, self.txs_root, self.state_root
        )
    }
}

impl Encodable for BlockHeader {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(11);
        s.append(&self.parent_id);
        s.append(&self.number);
        s.append(&self.timestamp);
        s.append(&self.txs_root);
        s.append(&self.state_root);
        s.append(&self.gas_limit);
        s.append(&self.gas_used);
        s.append(&self.total_score);
        s.append(&self.block_type.to_byte());
        s.append(&self.last_kblock_height);
        s.append(&self.proposer_pk);
    }
}

impl Decodable for BlockHeader {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let block_type = BlockType::from_byte(rlp.val_at(8)?)
            .ok_or(DecoderError::Custom("unknown block type"))?;
        Ok(Self {
            parent_id: rlp.val_at(0)?,
            number: rlp.val_at(1)?,
            timestamp: rlp.val_at(2)?,
            txs_root: rlp.val_at(3)?,
            state_root: rlp.val_at(4)?,
            gas_limit: rlp.val_at(5)?,
            gas_used: rlp.val_at(6)?,
            total_score: rlp.val_at(7)?,
            block_type,
            last_kblock_height: rlp.val_at(9)?,
            proposer_pk: rlp.val_at(10)?,
        })
    }
}
