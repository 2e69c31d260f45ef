use crypto::BitArray;
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use std::fmt;

/// Proof that a supermajority of the committee timed out at
/// `(timeout_height, timeout_round)`. Grants the next proposer a liveness
/// override; discarded after driving one beat.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TimeoutCert {
    pub timeout_height: u64,
    pub timeout_round: u64,
    pub timeout_counter: u32,
    pub timeout_bitarray: BitArray,
    pub timeout_agg_sig: Vec<u8>,
}

impl TimeoutCert {
    pub fn to_bytes(&self) -> Vec<u8> {
        rlp::encode(self).to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecoderError> {
        rlp::decode(bytes)
    }
}

impl fmt::Display for TimeoutCert {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "TC(H:{} R:{} Counter:{} Voters:{})",
            self.timeout_height,
            self.timeout_round,
            self.timeout_counter,
            self.timeout_bitarray.to_canonical_string()
        )
    }
}

impl fmt::Debug for TimeoutCert {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Encodable for TimeoutCert {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(5);
        s.append(&self.timeout_height);
        s.append(&self.timeout_round);
        s.append(&self.timeout_counter);
        s.append(&self.timeout_bitarray.to_canonical_string());
        s.append(&self.timeout_agg_sig);
    }
}

impl Decodable for TimeoutCert {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let bitarray_str: String = rlp.val_at(3)?;
        Ok(Self {
            timeout_height: rlp.val_at(0)?,
            timeout_round: rlp.val_at(1)?,
            timeout_counter: rlp.val_at(2)?,
            timeout_bitarray: BitArray::from_canonical_str(&bitarray_str),
            timeout_agg_sig: rlp.val_at(4)?,
        })
    }
}
