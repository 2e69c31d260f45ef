//! BLS primitives for committee voting.
//!
//! Uses blst `min_pk` (48-byte G1 public keys, 96-byte G2 signatures).
//! Certificates and aggregators store compressed signature bytes only;
//! native blst objects are parsed at use sites and never escape them.

use crate::Digest;
use blst::min_pk as mpk;
use blst::BLST_ERROR;
use rand::RngCore;
use std::fmt;

/// Domain separation tag for all consensus BLS signatures.
/// Change only with a network upgrade.
pub const BLS_DST: &[u8] = b"POS-CONSENSUS-BLS-v1";

pub const PUBKEY_LEN: usize = 48;
pub const SIGNATURE_LEN: usize = 96;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlsPublicKey(pub [u8; PUBKEY_LEN]);

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlsSignature(pub [u8; SIGNATURE_LEN]);

impl BlsPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let pk = mpk::PublicKey::from_bytes(bytes).ok()?;
        Some(Self(pk.to_bytes()))
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl BlsSignature {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let sig = mpk::Signature::from_bytes(bytes).ok()?;
        Some(Self(sig.to_bytes()))
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl fmt::Debug for BlsPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "BlsPk({})", hex::encode(&self.0[..6]))
    }
}

impl fmt::Debug for BlsSignature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "BlsSig({})", hex::encode(&self.0[..6]))
    }
}

/// Validator signing key. Lives only in validator processes and is never
/// serialized alongside consensus state.
pub struct BlsKeyPair {
    secret: mpk::SecretKey,
}

impl BlsKeyPair {
    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        let mut ikm = [0u8; 32];
        rng.fill_bytes(&mut ikm);
        let secret = mpk::SecretKey::key_gen(&ikm, &[]).expect("32-byte ikm is always valid");
        Self { secret }
    }

    pub fn from_sk_bytes(bytes: &[u8; 32]) -> Option<Self> {
        mpk::SecretKey::from_bytes(bytes)
            .map(|secret| Self { secret })
            .ok()
    }

    pub fn public_key(&self) -> BlsPublicKey {
        BlsPublicKey(self.secret.sk_to_pk().to_bytes())
    }

    pub fn sign(&self, digest: &Digest) -> BlsSignature {
        let sig = self.secret.sign(digest.as_ref(), BLS_DST, &[]);
        BlsSignature(sig.to_bytes())
    }
}

/// Verify a single signature over `digest` against one public key.
pub fn verify(sig: &BlsSignature, digest: &Digest, pk: &BlsPublicKey) -> bool {
    let sig = match mpk::Signature::from_bytes(&sig.0) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    let pk = match mpk::PublicKey::from_bytes(&pk.0) {
        Ok(pk) => pk,
        Err(_) => return false,
    };
    sig.verify(true, digest.as_ref(), BLS_DST, &[], &pk, true) == BLST_ERROR::BLST_SUCCESS
}

/// Aggregate a set of signatures into one. Order independent.
pub fn aggregate(sigs: &[BlsSignature]) -> Option<BlsSignature> {
    if sigs.is_empty() {
        return None;
    }
    let raw: Vec<&[u8]> = sigs.iter().map(|s| &s.0[..]).collect();
    let agg = mpk::AggregateSignature::aggregate_serialized(&raw, true).ok()?;
    Some(BlsSignature(agg.to_signature().to_bytes()))
}

/// Verify an aggregate signature, pairing every signer's public key with the
/// digest that signer signed. `digests` and `pks` are index-aligned.
pub fn aggregate_verify(agg: &BlsSignature, digests: &[Digest], pks: &[BlsPublicKey]) -> bool {
    if digests.len() != pks.len() || pks.is_empty() {
        return false;
    }
    let sig = match mpk::Signature::from_bytes(&agg.0) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    let mut keys = Vec::with_capacity(pks.len());
    for pk in pks {
        match mpk::PublicKey::from_bytes(&pk.0) {
            Ok(pk) => keys.push(pk),
            Err(_) => return false,
        }
    }
    let key_refs: Vec<&mpk::PublicKey> = keys.iter().collect();
    let msgs: Vec<&[u8]> = digests.iter().map(|d| d.as_ref()).collect();
    sig.aggregate_verify(true, &msgs, BLS_DST, &key_refs, true) == BLST_ERROR::BLST_SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash256;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn keypair(seed: u64) -> BlsKeyPair {
        BlsKeyPair::generate(&mut StdRng::seed_from_u64(seed))
    }

    #[test]
    fn sign_and_verify() {
        let kp = keypair(1);
        let digest = hash256(b"vote");
        let sig = kp.sign(&digest);
        assert!(verify(&sig, &digest, &kp.public_key()));
        assert!(!verify(&sig, &hash256(b"other"), &kp.public_key()));
        assert!(!verify(&sig, &digest, &keypair(2).public_key()));
    }

    #[test]
    fn aggregate_verifies_against_exact_signer_set() {
        let kps: Vec<_> = (0..4).map(keypair).collect();
        let digest = hash256(b"proposal at height 7");
        let sigs: Vec<_> = kps.iter().map(|kp| kp.sign(&digest)).collect();

        let agg = aggregate(&sigs[..3]).unwrap();
        let digests = vec![digest; 3];
        let pks: Vec<_> = kps[..3].iter().map(|kp| kp.public_key()).collect();
        assert!(aggregate_verify(&agg, &digests, &pks));

        // A pubkey outside the signer set must fail verification.
        let wrong: Vec<_> = kps[1..4].iter().map(|kp| kp.public_key()).collect();
        assert!(!aggregate_verify(&agg, &digests, &wrong));
    }

    #[test]
    fn aggregation_is_order_independent() {
        let kps: Vec<_> = (0..3).map(keypair).collect();
        let digest = hash256(b"order");
        let sigs: Vec<_> = kps.iter().map(|kp| kp.sign(&digest)).collect();
        let forward = aggregate(&sigs).unwrap();
        let reversed: Vec<_> = sigs.iter().rev().cloned().collect();
        assert_eq!(forward, aggregate(&reversed).unwrap());
    }
}
