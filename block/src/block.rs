use crate::header::{BlockHeader, BlockType};
use crate::quorum_cert::QuorumCert;
use crate::violation::Evidence;
use crypto::Digest;
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use std::fmt;

/// Network endpoint of a committee member.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetAddress {
    pub ip: String,
    pub port: u16,
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl Encodable for NetAddress {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.ip);
        s.append(&self.port);
    }
}

impl Decodable for NetAddress {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self {
            ip: rlp.val_at(0)?,
            port: rlp.val_at(1)?,
        })
    }
}

/// Wire form of one committee member, embedded in the first block of an
/// epoch so later validators can rebuild the committee.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitteeInfo {
    pub name: Vec<u8>,
    pub ecdsa_pubkey: Vec<u8>,
    pub net_addr: NetAddress,
    pub bls_pubkey: Vec<u8>,
    pub cs_index: u32,
}

impl Encodable for CommitteeInfo {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(5);
        s.append(&self.name);
        s.append(&self.ecdsa_pubkey);
        s.append(&self.net_addr);
        s.append(&self.bls_pubkey);
        s.append(&self.cs_index);
    }
}

impl Decodable for CommitteeInfo {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self {
            name: rlp.val_at(0)?,
            ecdsa_pubkey: rlp.val_at(1)?,
            net_addr: rlp.val_at(2)?,
            bls_pubkey: rlp.val_at(3)?,
            cs_index: rlp.val_at(4)?,
        })
    }
}

/// Extra payload carried only by K-blocks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KBlockData {
    pub nonce: u64,
}

impl Encodable for KBlockData {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(1);
        s.append(&self.nonce);
    }
}

impl Decodable for KBlockData {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self {
            nonce: rlp.val_at(0)?,
        })
    }
}

/// A full block as shipped inside proposals. Transactions are opaque bytes
/// to the consensus core; packing and execution live behind the builder and
/// executor seams.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Vec<u8>>,
    /// The QC justifying this block's parent chain. Excluded from the
    /// header hash so votes can seal it after packing.
    pub qc: QuorumCert,
    pub kblock_data: KBlockData,
    pub committee_info: Vec<CommitteeInfo>,
    pub evidence: Vec<Evidence>,
}

impl Block {
    pub fn new(header: BlockHeader, txs: Vec<Vec<u8>>) -> Self {
        Self {
            header,
            txs,
            qc: QuorumCert::genesis(),
            kblock_data: KBlockData::default(),
            committee_info: Vec::new(),
            evidence: Vec::new(),
        }
    }

    pub fn id(&self) -> Digest {
        self.header.id()
    }

    pub fn height(&self) -> u64 {
        u64::from(self.header.number)
    }

    pub fn block_type(&self) -> BlockType {
        self.header.block_type
    }

    pub fn set_kblock_data(&mut self, data: KBlockData) {
        self.kblock_data = data;
    }

    /// K-block payload, present only on K-blocks.
    pub fn kblock_data(&self) -> Option<&KBlockData> {
        match self.header.block_type {
            BlockType::KBlock => Some(&self.kblock_data),
            _ => None,
        }
    }

    pub fn evidence(&self) -> Option<&Evidence> {
        self.evidence.first()
    }

    /// Commitment over the raw transactions, the value `txs_root` carries.
    pub fn compute_txs_root(txs: &[Vec<u8>]) -> Digest {
        let mut s = RlpStream::new_list(txs.len());
        for tx in txs {
            s.append(tx);
        }
        crypto::hash256(s.out())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        rlp::encode(self).to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecoderError> {
        rlp::decode(bytes)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Block(#{} {:?} id:{} txs:{})",
            self.header.number,
            self.header.block_type,
            self.id(),
            self.txs.len()
        )
    }
}

impl Encodable for Block {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(6);
        s.append(&self.header);
        s.append_list::<Vec<u8>, _>(&self.txs);
        s.append(&self.qc);
        s.append(&self.kblock_data);
        s.append_list(&self.committee_info);
        s.append_list(&self.evidence);
    }
}

impl Decodable for Block {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self {
            header: rlp.val_at(0)?,
            txs: rlp.list_at(1)?,
            qc: rlp.val_at(2)?,
            kblock_data: rlp.val_at(3)?,
            committee_info: rlp.list_at(4)?,
            evidence: rlp.list_at(5)?,
        })
    }
}
