use crate::config::PresetConfig;
use crate::error::{ConsensusError, ConsensusResult};
use block::{CommitteeInfo, NetAddress};
use crypto::bls::BlsPublicKey;
use crypto::hash256;
use std::fmt;

/// A staking delegate as reported by the staking contract. Delegates are
/// candidates; the committee is elected from them at every K-block boundary.
#[derive(Clone, Debug)]
pub struct Delegate {
    pub name: Vec<u8>,
    pub ecdsa_pubkey: Vec<u8>,
    pub bls_pubkey: BlsPublicKey,
    pub voting_power: u64,
    pub net_addr: NetAddress,
}

/// One validator seat for the current epoch. `cs_index` is the member's
/// position in the committee and indexes every bit-array.
#[derive(Clone)]
pub struct CommitteeMember {
    pub name: Vec<u8>,
    pub ecdsa_pubkey: Vec<u8>,
    pub net_addr: NetAddress,
    pub bls_pubkey: BlsPublicKey,
    pub cs_index: u32,
}

impl fmt::Debug for CommitteeMember {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Member({} index:{} addr:{})",
            String::from_utf8_lossy(&self.name),
            self.cs_index,
            self.net_addr
        )
    }
}

/// The ordered validator set for one epoch. The member at index 0 is the
/// epoch leader and proposes round 0; later rounds rotate round-robin.
#[derive(Clone, Debug)]
pub struct Committee {
    pub members: Vec<CommitteeMember>,
    pub epoch_id: u64,
}

impl Committee {
    pub fn new(members: Vec<CommitteeMember>, epoch_id: u64) -> Self {
        Self { members, epoch_id }
    }

    /// Deterministic committee election: delegates are ranked by the hash of
    /// the epoch nonce and their public key, truncated to the preset size.
    pub fn elect(
        delegates: &[Delegate],
        nonce: u64,
        epoch_id: u64,
        preset: &PresetConfig,
    ) -> ConsensusResult<Self> {
        ensure!(
            delegates.len() >= preset.committee_min_size,
            ConsensusError::CommitteeTooSmall {
                size: delegates.len(),
                min: preset.committee_min_size,
            }
        );

        let mut ranked: Vec<&Delegate> = delegates.iter().collect();
        ranked.sort_by_key(|d| {
            let mut seed = nonce.to_le_bytes().to_vec();
            seed.extend_from_slice(&d.ecdsa_pubkey);
            hash256(seed)
        });
        ranked.truncate(preset.committee_max_size);

        let members = ranked
            .into_iter()
            .enumerate()
            .map(|(i, d)| CommitteeMember {
                name: d.name.clone(),
                ecdsa_pubkey: d.ecdsa_pubkey.clone(),
                net_addr: d.net_addr.clone(),
                bls_pubkey: d.bls_pubkey,
                cs_index: i as u32,
            })
            .collect();

        Ok(Self { members, epoch_id })
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn member_by_index(&self, index: usize) -> Option<&CommitteeMember> {
        self.members.get(index)
    }

    /// The proposer seat for a round.
    pub fn round_proposer(&self, round: u64) -> &CommitteeMember {
        &self.members[(round as usize) % self.members.len()]
    }

    pub fn is_round_proposer(&self, round: u64, index: usize) -> bool {
        (round as usize) % self.members.len() == index
    }

    /// Resolve a wire sender (its ECDSA pubkey bytes) to a committee index.
    pub fn index_of_sender(&self, ecdsa_pubkey: &[u8]) -> Option<usize> {
        self.members
            .iter()
            .position(|m| m.ecdsa_pubkey == ecdsa_pubkey)
    }

    pub fn member_by_net_addr(&self, addr: &NetAddress) -> Option<&CommitteeMember> {
        self.members.iter().find(|m| &m.net_addr == addr)
    }

    /// Wire form for embedding in the first block of the epoch.
    pub fn to_committee_info(&self) -> Vec<CommitteeInfo> {
        self.members
            .iter()
            .map(|m| CommitteeInfo {
                name: m.name.clone(),
                ecdsa_pubkey: m.ecdsa_pubkey.clone(),
                net_addr: m.net_addr.clone(),
                bls_pubkey: m.bls_pubkey.to_vec(),
                cs_index: m.cs_index,
            })
            .collect()
    }

    /// Rebuild runtime members from the wire form. Fails on a malformed
    /// BLS pubkey.
    pub fn from_committee_info(infos: &[CommitteeInfo], epoch_id: u64) -> ConsensusResult<Self> {
        let mut members = Vec::with_capacity(infos.len());
        for info in infos {
            let bls_pubkey = BlsPublicKey::from_bytes(&info.bls_pubkey)
                .ok_or(ConsensusError::InvalidSignature(info.cs_index))?;
            members.push(CommitteeMember {
                name: info.name.clone(),
                ecdsa_pubkey: info.ecdsa_pubkey.clone(),
                net_addr: info.net_addr.clone(),
                bls_pubkey,
                cs_index: info.cs_index,
            });
        }
        Ok(Self { members, epoch_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto::bls::BlsKeyPair;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn delegates(n: usize) -> Vec<Delegate> {
        (0..n)
            .map(|i| {
                let kp = BlsKeyPair::generate(&mut StdRng::seed_from_u64(i as u64));
                Delegate {
                    name: format!("validator-{}", i).into_bytes(),
                    ecdsa_pubkey: vec![i as u8; 65],
                    bls_pubkey: kp.public_key(),
                    voting_power: 100,
                    net_addr: NetAddress {
                        ip: format!("10.0.0.{}", i),
                        port: 8670,
                    },
                }
            })
            .collect()
    }

    fn small_preset() -> PresetConfig {
        PresetConfig {
            committee_min_size: 4,
            committee_max_size: 8,
            delegate_max_size: 100,
        }
    }

    #[test]
    fn election_determinism() {
        let ds = delegates(12);
        let a = Committee::elect(&ds, 7, 1, &small_preset()).unwrap();
        let b = Committee::elect(&ds, 7, 1, &small_preset()).unwrap();
        let order = |c: &Committee| c.members.iter().map(|m| m.name.clone()).collect::<Vec<_>>();
        assert_eq!(order(&a), order(&b));
        assert_eq!(a.size(), 8);

        let c = Committee::elect(&ds, 8, 1, &small_preset()).unwrap();
        assert_ne!(order(&a), order(&c));
    }

    #[test]
    fn election_enforces_minimum_size() {
        let ds = delegates(3);
        assert!(matches!(
            Committee::elect(&ds, 1, 1, &small_preset()),
            Err(ConsensusError::CommitteeTooSmall { size: 3, min: 4 })
        ));
    }

    #[test]
    fn proposer_rotates_round_robin() {
        let committee = Committee::elect(&delegates(8), 3, 1, &small_preset()).unwrap();
        let first = committee.round_proposer(0).cs_index;
        assert_eq!(committee.round_proposer(8).cs_index, first);
        assert_ne!(committee.round_proposer(1).cs_index, first);
        assert!(committee.is_round_proposer(2, committee.round_proposer(2).cs_index as usize));
    }

    #[test]
    fn committee_info_round_trip() {
        let committee = Committee::elect(&delegates(8), 3, 9, &small_preset()).unwrap();
        let infos = committee.to_committee_info();
        let rebuilt = Committee::from_committee_info(&infos, 9).unwrap();
        assert_eq!(rebuilt.size(), committee.size());
        for (a, b) in committee.members.iter().zip(rebuilt.members.iter()) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.bls_pubkey, b.bls_pubkey);
            assert_eq!(a.cs_index, b.cs_index);
        }
    }
}
