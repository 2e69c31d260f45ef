use crate::committee::Committee;
use block::{Violation, VIOLATION_DOUBLE_SIGN};
use crypto::bls::{self, BlsPublicKey, BlsSignature};
use crypto::{BitArray, Digest};
use log::info;

/// Strict two-thirds majority: `3 * count > 2 * committee_size`.
pub fn majority_two_thirds(count: usize, committee_size: usize) -> bool {
    committee_size > 0 && 3 * count > 2 * committee_size
}

/// Collects committee signatures over one fixed digest, either the votes
/// for a single proposal or one timeout bucket. Sealing freezes it; the
/// aggregate is built from the collected set.
pub struct SignatureAggregator {
    msg_hash: Digest,
    sig_bytes: Vec<Option<Vec<u8>>>,
    pubkeys: Vec<Option<BlsPublicKey>>,
    bitarray: BitArray,
    violations: Vec<Violation>,
    size: usize,
    committee: Committee,
    sealed: bool,
}

impl SignatureAggregator {
    pub fn new(size: usize, msg_hash: Digest, committee: Committee) -> Self {
        Self {
            msg_hash,
            sig_bytes: vec![None; size],
            pubkeys: vec![None; size],
            bitarray: BitArray::new(size),
            violations: Vec::new(),
            size,
            committee,
            sealed: false,
        }
    }

    /// Try to add one signature. Returns false without any effect when the
    /// aggregator is sealed, the index is out of range, the digest differs
    /// from the fixed one, or the slot is already taken. A repeated index
    /// with different signature bytes is recorded as double-sign evidence.
    pub fn add(
        &mut self,
        index: usize,
        msg_hash: Digest,
        signature: Vec<u8>,
        pubkey: BlsPublicKey,
    ) -> bool {
        if self.sealed {
            return false;
        }
        if index >= self.size {
            return false;
        }
        if self.msg_hash != msg_hash {
            return false;
        }
        if self.bitarray.get(index) {
            let stored = self.sig_bytes[index].as_deref().unwrap_or(&[]);
            if stored != signature.as_slice() {
                let address = self
                    .committee
                    .member_by_index(index)
                    .map(|m| m.name.clone())
                    .unwrap_or_default();
                self.violations.push(Violation {
                    kind: VIOLATION_DOUBLE_SIGN,
                    index: index as u32,
                    address,
                    signature1: stored.to_vec(),
                    signature2: signature,
                });
            }
            return false;
        }
        if BlsSignature::from_bytes(&signature).is_none() {
            return false;
        }
        self.bitarray.set(index, true);
        self.sig_bytes[index] = Some(signature);
        self.pubkeys[index] = Some(pubkey);
        info!(
            "Collected signature, count {}, voting {}",
            self.bitarray.count(),
            self.bitarray.to_canonical_string()
        );
        true
    }

    pub fn count(&self) -> usize {
        if self.sealed {
            0
        } else {
            self.bitarray.count()
        }
    }

    pub fn reached_majority(&self) -> bool {
        majority_two_thirds(self.bitarray.count(), self.committee.size())
    }

    /// Freeze the aggregator; no further additions are accepted.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Aggregate signature bytes over the collected set. Empty on failure.
    pub fn aggregate(&self) -> Vec<u8> {
        let sigs: Vec<BlsSignature> = self
            .sig_bytes
            .iter()
            .flatten()
            .filter_map(|bytes| BlsSignature::from_bytes(bytes))
            .collect();
        match bls::aggregate(&sigs) {
            Some(agg) => agg.to_vec(),
            None => Vec::new(),
        }
    }

    pub fn bitarray(&self) -> &BitArray {
        &self.bitarray
    }

    /// One digest per collected signature, index-aligned with the set bits.
    pub fn msg_hashes(&self) -> Vec<Digest> {
        vec![self.msg_hash; self.bitarray.count()]
    }

    pub fn msg_hash(&self) -> &Digest {
        &self.msg_hash
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    /// Pubkeys of the collected signers, ascending by committee index.
    pub fn signer_pubkeys(&self) -> Vec<BlsPublicKey> {
        self.pubkeys.iter().flatten().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::committee::{Committee, CommitteeMember};
    use block::NetAddress;
    use crypto::bls::BlsKeyPair;
    use crypto::hash256;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn committee(n: usize) -> (Committee, Vec<BlsKeyPair>) {
        let keys: Vec<_> = (0..n)
            .map(|i| BlsKeyPair::generate(&mut StdRng::seed_from_u64(i as u64)))
            .collect();
        let members = keys
            .iter()
            .enumerate()
            .map(|(i, kp)| CommitteeMember {
                name: format!("validator-{}", i).into_bytes(),
                ecdsa_pubkey: vec![i as u8; 65],
                net_addr: NetAddress {
                    ip: format!("10.0.0.{}", i),
                    port: 8670,
                },
                bls_pubkey: kp.public_key(),
                cs_index: i as u32,
            })
            .collect();
        (Committee::new(members, 1), keys)
    }

    #[test]
    fn majority_is_strict_two_thirds() {
        assert!(!majority_two_thirds(2, 4));
        assert!(majority_two_thirds(3, 4));
        assert!(!majority_two_thirds(7, 11));
        assert!(majority_two_thirds(8, 11));
        assert!(!majority_two_thirds(0, 0));
    }

    #[test]
    fn collects_until_majority() {
        let (committee, keys) = committee(4);
        let digest = hash256(b"proposal 5 round 0");
        let mut agg = SignatureAggregator::new(4, digest, committee);

        for (i, kp) in keys.iter().enumerate().take(3) {
            let sig = kp.sign(&digest);
            assert!(agg.add(i, digest, sig.to_vec(), kp.public_key()));
        }
        assert_eq!(agg.count(), 3);
        assert!(agg.reached_majority());

        agg.seal();
        assert_eq!(agg.count(), 0);
        assert!(!agg.add(3, digest, keys[3].sign(&digest).to_vec(), keys[3].public_key()));

        let agg_sig = BlsSignature::from_bytes(&agg.aggregate()).unwrap();
        assert!(bls::aggregate_verify(
            &agg_sig,
            &agg.msg_hashes(),
            &agg.signer_pubkeys()
        ));
    }

    #[test]
    fn rejects_wrong_digest_and_out_of_range_index() {
        let (committee, keys) = committee(4);
        let digest = hash256(b"expected");
        let mut agg = SignatureAggregator::new(4, digest, committee);
        let sig = keys[0].sign(&digest).to_vec();
        assert!(!agg.add(0, hash256(b"other"), sig.clone(), keys[0].public_key()));
        assert!(!agg.add(7, digest, sig, keys[0].public_key()));
        assert_eq!(agg.count(), 0);
    }

    #[test]
    fn double_sign_records_violation_without_counting() {
        let (committee, keys) = committee(4);
        let digest = hash256(b"height 5 round 0");
        let mut agg = SignatureAggregator::new(4, digest, committee);

        let first = keys[2].sign(&digest).to_vec();
        assert!(agg.add(2, digest, first.clone(), keys[2].public_key()));

        // Same slot, different bytes: evidence recorded, count unchanged.
        let other_key = BlsKeyPair::generate(&mut StdRng::seed_from_u64(99));
        let second = other_key.sign(&digest).to_vec();
        assert!(!agg.add(2, digest, second.clone(), keys[2].public_key()));
        assert_eq!(agg.count(), 1);

        let violations = agg.violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, VIOLATION_DOUBLE_SIGN);
        assert_eq!(violations[0].index, 2);
        assert_eq!(violations[0].signature1, first);
        assert_eq!(violations[0].signature2, second);

        // Identical resubmission is dropped silently.
        assert!(!agg.add(2, digest, first, keys[2].public_key()));
        assert_eq!(agg.violations().len(), 1);
    }
}
