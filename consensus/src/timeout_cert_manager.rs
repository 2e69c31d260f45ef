use crate::aggregator::majority_two_thirds;
use crate::messages::{NewViewReason, PMNewViewMessage};
use block::TimeoutCert;
use crypto::bls::{self, BlsSignature};
use crypto::BitArray;
use log::error;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct TimeoutId {
    height: u64,
    round: u64,
}

struct TimeoutVal {
    counter: u64,
    signature: Vec<u8>,
}

#[derive(Default)]
struct Buckets {
    cache: HashMap<TimeoutId, Vec<TimeoutVal>>,
    bitarrays: HashMap<TimeoutId, BitArray>,
}

/// Collects round-timeout signatures per `(height, round)` until two thirds
/// of the committee agree, then seals them into a TimeoutCert. The lock is
/// a conservative precaution; every caller runs on the pacemaker task.
pub struct TimeoutCertManager {
    inner: RwLock<Buckets>,
    committee_size: usize,
}

impl TimeoutCertManager {
    pub fn new(committee_size: usize) -> Self {
        Self {
            inner: RwLock::new(Buckets::default()),
            committee_size,
        }
    }

    /// Record one peer's timeout signature, deduped by committee index.
    pub fn collect_signature(&self, msg: &PMNewViewMessage) {
        if msg.reason != NewViewReason::RoundTimeout {
            return;
        }
        if BlsSignature::from_bytes(&msg.peer_signature).is_none() {
            error!(
                "error convert signature from peer index {}",
                msg.peer_index
            );
            return;
        }

        let id = TimeoutId {
            height: msg.timeout_height,
            round: msg.timeout_round,
        };
        let mut inner = self.inner.write().unwrap();
        let size = self.committee_size;
        let bitarray = inner
            .bitarrays
            .entry(id)
            .or_insert_with(|| BitArray::new(size));
        let index = msg.peer_index as usize;
        if bitarray.get(index) {
            return;
        }
        bitarray.set(index, true);
        inner.cache.entry(id).or_default().push(TimeoutVal {
            counter: msg.timeout_counter,
            signature: msg.peer_signature.clone(),
        });
    }

    pub fn count(&self, height: u64, round: u64) -> usize {
        let inner = self.inner.read().unwrap();
        inner
            .bitarrays
            .get(&TimeoutId { height, round })
            .map(|b| b.count())
            .unwrap_or(0)
    }

    pub fn reached_majority(&self, height: u64, round: u64) -> bool {
        majority_two_thirds(self.count(height, round), self.committee_size)
    }

    /// Seal the bucket into a certificate. None until any signature landed.
    pub fn timeout_cert(&self, height: u64, round: u64) -> Option<TimeoutCert> {
        let inner = self.inner.read().unwrap();
        let id = TimeoutId { height, round };
        let vals = inner.cache.get(&id)?;
        let bitarray = inner.bitarrays.get(&id)?;

        let sigs: Vec<BlsSignature> = vals
            .iter()
            .filter_map(|v| BlsSignature::from_bytes(&v.signature))
            .collect();
        let agg = bls::aggregate(&sigs)?;

        Some(TimeoutCert {
            timeout_height: height,
            timeout_round: round,
            timeout_counter: vals[0].counter as u32,
            timeout_bitarray: bitarray.clone(),
            timeout_agg_sig: agg.to_vec(),
        })
    }

    /// Drop every bucket at or below the sealed coordinates.
    pub fn cleanup(&self, height: u64, round: u64) {
        let mut inner = self.inner.write().unwrap();
        inner
            .cache
            .retain(|k, _| k.height > height && k.round > round);
        inner
            .bitarrays
            .retain(|k, _| k.height > height && k.round > round);
    }
}
