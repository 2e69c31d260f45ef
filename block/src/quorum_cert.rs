use crypto::{BitArray, Digest};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use std::fmt;

/// Proof that a supermajority of the committee voted for the block at
/// `(qc_height, qc_round)`. The bit-array travels in its canonical string
/// form (`x` set, `_` unset) and is rebuilt by scanning it on decode.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct QuorumCert {
    pub qc_height: u64,
    pub qc_round: u64,
    pub epoch_id: u64,
    pub voter_msg_hash: Vec<Digest>,
    pub voter_agg_sig: Vec<u8>,
    pub voter_bitarray: BitArray,
}

impl QuorumCert {
    pub fn genesis() -> Self {
        Self::default()
    }

    /// The digest every voter signed. Sealing guarantees all entries are
    /// equal, so the first one stands for the set.
    pub fn voting_digest(&self) -> Option<&Digest> {
        self.voter_msg_hash.first()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        rlp::encode(self).to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecoderError> {
        rlp::decode(bytes)
    }
}

impl fmt::Display for QuorumCert {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "QC(H:{} R:{} EpochID:{} Voters:{})",
            self.qc_height,
            self.qc_round,
            self.epoch_id,
            self.voter_bitarray.to_canonical_string()
        )
    }
}

impl fmt::Debug for QuorumCert {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Encodable for QuorumCert {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(6);
        s.append(&self.qc_height);
        s.append(&self.qc_round);
        s.append(&self.epoch_id);
        s.append_list(&self.voter_msg_hash);
        s.append(&self.voter_agg_sig);
        s.append(&self.voter_bitarray.to_canonical_string());
    }
}

impl Decodable for QuorumCert {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let bitarray_str: String = rlp.val_at(5)?;
        Ok(Self {
            qc_height: rlp.val_at(0)?,
            qc_round: rlp.val_at(1)?,
            epoch_id: rlp.val_at(2)?,
            voter_msg_hash: rlp.list_at(3)?,
            voter_agg_sig: rlp.val_at(4)?,
            voter_bitarray: BitArray::from_canonical_str(&bitarray_str),
        })
    }
}
