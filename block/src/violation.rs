use crypto::{BitArray, Digest};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

pub const VIOLATION_DOUBLE_SIGN: u8 = 1;

/// Slashing evidence recorded when a committee member submits two distinct
/// signatures for the same slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    pub kind: u8,
    pub index: u32,
    pub address: Vec<u8>,
    pub signature1: Vec<u8>,
    pub signature2: Vec<u8>,
}

impl Encodable for Violation {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(5);
        s.append(&self.kind);
        s.append(&self.index);
        s.append(&self.address);
        s.append(&self.signature1);
        s.append(&self.signature2);
    }
}

impl Decodable for Violation {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self {
            kind: rlp.val_at(0)?,
            index: rlp.val_at(1)?,
            address: rlp.val_at(2)?,
            signature1: rlp.val_at(3)?,
            signature2: rlp.val_at(4)?,
        })
    }
}

/// Committee-establishment proof embedded in the first M-block of an epoch:
/// the aggregate announce vote and the aggregate notary vote, each with the
/// bit-array naming its signers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Evidence {
    pub voting_sig: Vec<u8>,
    pub voting_msg_hash: Digest,
    pub voting_bitarray: BitArray,
    pub notarize_sig: Vec<u8>,
    pub notarize_msg_hash: Digest,
    pub notarize_bitarray: BitArray,
}

impl Encodable for Evidence {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(6);
        s.append(&self.voting_sig);
        s.append(&self.voting_msg_hash);
        s.append(&self.voting_bitarray.to_canonical_string());
        s.append(&self.notarize_sig);
        s.append(&self.notarize_msg_hash);
        s.append(&self.notarize_bitarray.to_canonical_string());
    }
}

impl Decodable for Evidence {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let voting_str: String = rlp.val_at(2)?;
        let notarize_str: String = rlp.val_at(5)?;
        Ok(Self {
            voting_sig: rlp.val_at(0)?,
            voting_msg_hash: rlp.val_at(1)?,
            voting_bitarray: BitArray::from_canonical_str(&voting_str),
            notarize_sig: rlp.val_at(3)?,
            notarize_msg_hash: rlp.val_at(4)?,
            notarize_bitarray: BitArray::from_canonical_str(&notarize_str),
        })
    }
}
