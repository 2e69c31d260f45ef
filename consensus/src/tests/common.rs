//! Deterministic fakes for every collaborator seam, shared by the
//! pacemaker and reactor tests.

// Each test module includes its own copy; not every copy uses every fake.
#![allow(dead_code)]

use crate::committee::{Committee, CommitteeMember, Delegate};
use crate::messages::{
    now_timestamp, CommonHeader, PMProposalMessage, CONSENSUS_MSG_PM_PROPOSAL,
};
use crate::pacemaker::RecvKBlockInfo;
use crate::traits::{
    BlockBuilder, ChainError, ChainStore, Executor, Fork, KBlockRequest, LogDb, OutboundMessage,
    PowReward, ProposedBlockInfo, Receipt, Stage, Staking, StateStore, TxPool,
};
use block::{
    Block, BlockHeader, BlockType, KBlockData, NetAddress, QuorumCert, TimeoutCert,
};
use crypto::bls::{self, BlsKeyPair};
use crypto::{build_new_view_digest, build_vote_digest, hash256, BitArray, Digest};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{channel, Receiver, Sender};

#[derive(Clone)]
pub struct TestCommittee {
    pub committee: Committee,
    pub keys: Vec<Arc<BlsKeyPair>>,
}

pub fn test_committee(n: usize, epoch_id: u64) -> TestCommittee {
    let keys: Vec<_> = (0..n)
        .map(|i| Arc::new(BlsKeyPair::generate(&mut StdRng::seed_from_u64(1_000 + i as u64))))
        .collect();
    let members = keys
        .iter()
        .enumerate()
        .map(|(i, kp)| CommitteeMember {
            name: format!("validator-{}", i).into_bytes(),
            ecdsa_pubkey: ecdsa_pk(i),
            net_addr: net_addr(i),
            bls_pubkey: kp.public_key(),
            cs_index: i as u32,
        })
        .collect();
    TestCommittee {
        committee: Committee::new(members, epoch_id),
        keys,
    }
}

pub fn ecdsa_pk(i: usize) -> Vec<u8> {
    vec![i as u8 + 1; 65]
}

pub fn net_addr(i: usize) -> NetAddress {
    NetAddress {
        ip: format!("10.0.0.{}", i),
        port: 8670,
    }
}

pub fn delegates_for(tc: &TestCommittee) -> Vec<Delegate> {
    tc.committee
        .members
        .iter()
        .map(|m| Delegate {
            name: m.name.clone(),
            ecdsa_pubkey: m.ecdsa_pubkey.clone(),
            bls_pubkey: m.bls_pubkey,
            voting_power: 100,
            net_addr: m.net_addr.clone(),
        })
        .collect()
}

// ---- blocks ----------------------------------------------------------------

pub fn genesis_block() -> Block {
    let header = BlockHeader {
        parent_id: Digest::default(),
        number: 0,
        timestamp: 1,
        txs_root: Block::compute_txs_root(&[]),
        state_root: hash256(b"genesis-state"),
        gas_limit: 20_000_000,
        gas_used: 0,
        total_score: 0,
        block_type: BlockType::MBlock,
        last_kblock_height: 0,
        proposer_pk: Vec::new(),
    };
    Block::new(header, Vec::new())
}

pub fn child_block(parent: &Block, block_type: BlockType) -> Block {
    let header = BlockHeader {
        parent_id: parent.id(),
        number: parent.header.number + 1,
        timestamp: parent.header.timestamp + 1,
        txs_root: Block::compute_txs_root(&[]),
        state_root: hash256(format!("state-{}", parent.header.number + 1)),
        gas_limit: parent.header.gas_limit,
        gas_used: 0,
        total_score: parent.header.total_score + 1,
        block_type,
        last_kblock_height: match parent.header.block_type {
            BlockType::KBlock => parent.header.number,
            _ => parent.header.last_kblock_height,
        },
        proposer_pk: Vec::new(),
    };
    let mut block = Block::new(header, Vec::new());
    if block_type == BlockType::KBlock {
        block.set_kblock_data(KBlockData { nonce: 0xbeef });
    }
    block
}

/// QC over a proposal at `(height, round)` signed by `signers`.
pub fn make_qc(tc: &TestCommittee, height: u64, round: u64, signers: &[usize]) -> QuorumCert {
    let proposer = tc.committee.round_proposer(round);
    let digest = build_vote_digest(
        &proposer.bls_pubkey.0,
        tc.committee.epoch_id,
        height,
        round,
    );
    let mut bitarray = BitArray::new(tc.committee.size());
    let mut sigs = Vec::new();
    for &i in signers {
        bitarray.set(i, true);
        sigs.push(tc.keys[i].sign(&digest));
    }
    let agg = bls::aggregate(&sigs).expect("non-empty signer set");
    QuorumCert {
        qc_height: height,
        qc_round: round,
        epoch_id: tc.committee.epoch_id,
        voter_msg_hash: vec![digest; signers.len()],
        voter_agg_sig: agg.to_vec(),
        voter_bitarray: bitarray,
    }
}

/// Wrap a pre-built block (with its justify QC already sealed in) as the
/// wire proposal for `(height, round)`.
pub fn proposal_msg(
    tc: &TestCommittee,
    block: &Block,
    height: u64,
    round: u64,
    parent_key: (u64, u64),
    timeout_cert: Option<TimeoutCert>,
) -> PMProposalMessage {
    let proposer = tc.committee.round_proposer(round);
    PMProposalMessage {
        header: CommonHeader {
            height: height as u32,
            round: round as u32,
            sender: proposer.ecdsa_pubkey.clone(),
            timestamp: now_timestamp(),
            msg_type: CONSENSUS_MSG_PM_PROPOSAL,
            epoch_id: tc.committee.epoch_id,
        },
        parent_height: parent_key.0,
        parent_round: parent_key.1,
        proposed_block: block.to_bytes(),
        proposed_block_type: block.block_type().to_byte(),
        timeout_cert,
    }
}

/// Aggregate timeout certificate signed by `signers`.
pub fn make_tc(
    tc: &TestCommittee,
    height: u64,
    round: u64,
    counter: u32,
    signers: &[usize],
) -> TimeoutCert {
    let digest = build_new_view_digest(tc.committee.epoch_id, height, round, u64::from(counter));
    let mut bitarray = BitArray::new(tc.committee.size());
    let mut sigs = Vec::new();
    for &i in signers {
        bitarray.set(i, true);
        sigs.push(tc.keys[i].sign(&digest));
    }
    TimeoutCert {
        timeout_height: height,
        timeout_round: round,
        timeout_counter: counter,
        timeout_bitarray: bitarray,
        timeout_agg_sig: bls::aggregate(&sigs).expect("non-empty signer set").to_vec(),
    }
}

// ---- chain store -----------------------------------------------------------

struct MemChainInner {
    blocks: BTreeMap<u32, (Block, bool)>,
    best_qc: QuorumCert,
    candidate: Option<QuorumCert>,
}

pub struct MemChain {
    inner: Mutex<MemChainInner>,
}

impl MemChain {
    pub fn new(genesis: Block) -> Self {
        let mut blocks = BTreeMap::new();
        blocks.insert(genesis.header.number, (genesis, true));
        Self {
            inner: Mutex::new(MemChainInner {
                blocks,
                best_qc: QuorumCert::genesis(),
                candidate: None,
            }),
        }
    }

    pub fn finalized_heights(&self) -> Vec<u32> {
        self.inner
            .lock()
            .unwrap()
            .blocks
            .iter()
            .filter(|(_, (_, finalized))| *finalized)
            .map(|(h, _)| *h)
            .collect()
    }
}

impl ChainStore for MemChain {
    fn best_block(&self) -> Block {
        let inner = self.inner.lock().unwrap();
        inner
            .blocks
            .values()
            .rev()
            .find(|(_, finalized)| *finalized)
            .map(|(b, _)| b.clone())
            .expect("genesis is always finalized")
    }

    fn best_qc(&self) -> QuorumCert {
        self.inner.lock().unwrap().best_qc.clone()
    }

    fn leaf_block(&self) -> Block {
        let inner = self.inner.lock().unwrap();
        inner
            .blocks
            .values()
            .next_back()
            .map(|(b, _)| b.clone())
            .expect("genesis is always present")
    }

    fn add_block(
        &self,
        block: &Block,
        _receipts: &[Receipt],
        finalized: bool,
    ) -> Result<Option<Fork>, ChainError> {
        let mut inner = self.inner.lock().unwrap();
        let height = block.header.number;
        match inner.blocks.get(&height) {
            Some((existing, existing_finalized)) => {
                if existing.id() != block.id() {
                    return Ok(Some(Fork {
                        ancestor: existing.header.parent_id,
                        branch: vec![block.id()],
                    }));
                }
                if *existing_finalized || !finalized {
                    return Err(ChainError::KnownBlock);
                }
                inner.blocks.insert(height, (block.clone(), true));
                Ok(None)
            }
            None => {
                inner.blocks.insert(height, (block.clone(), finalized));
                Ok(None)
            }
        }
    }

    fn set_best_qc_candidate(&self, qc: QuorumCert) {
        self.inner.lock().unwrap().candidate = Some(qc);
    }

    fn update_best_qc(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(candidate) = inner.candidate.take() {
            if candidate.qc_height >= inner.best_qc.qc_height {
                inner.best_qc = candidate;
            }
        }
    }

    fn update_leaf_block(&self) {}

    fn get_block_header(&self, id: &Digest) -> Option<BlockHeader> {
        let inner = self.inner.lock().unwrap();
        inner
            .blocks
            .values()
            .find(|(b, _)| b.id() == *id)
            .map(|(b, _)| b.header.clone())
    }

    fn get_trunk_block(&self, height: u32) -> Option<Block> {
        let inner = self.inner.lock().unwrap();
        inner.blocks.get(&height).map(|(b, _)| b.clone())
    }
}

// ---- state, execution and logs ---------------------------------------------

pub struct FakeStage {
    root: Digest,
}

impl Stage for FakeStage {
    fn root(&self) -> Digest {
        self.root
    }

    fn commit(&self) -> Result<Digest, ChainError> {
        Ok(self.root)
    }
}

#[derive(Default)]
pub struct MemStateStore {
    pub reverts: Mutex<Vec<(Digest, u64)>>,
}

impl StateStore for MemStateStore {
    fn revert_to(&self, root: Digest, checkpoint: u64) -> Result<(), ChainError> {
        self.reverts.lock().unwrap().push((root, checkpoint));
        Ok(())
    }
}

pub struct FakeExecutor;

impl Executor for FakeExecutor {
    fn execute(
        &self,
        block: &Block,
        _parent: &BlockHeader,
    ) -> Result<(Arc<dyn Stage>, Vec<Receipt>, u64), ChainError> {
        let receipts = if block.header.gas_used > 0 {
            vec![Receipt {
                gas_used: block.header.gas_used,
                reverted: false,
                outputs: Vec::new(),
            }]
        } else {
            Vec::new()
        };
        let stage = Arc::new(FakeStage {
            root: block.header.state_root,
        });
        Ok((stage, receipts, block.height()))
    }
}

#[derive(Default)]
pub struct FakeLogDb {
    pub batches: Mutex<Vec<u32>>,
}

impl LogDb for FakeLogDb {
    fn commit_batch(&self, header: &BlockHeader, _receipts: &[Receipt]) -> Result<(), ChainError> {
        self.batches.lock().unwrap().push(header.number);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTxPool {
    pub removed: Mutex<usize>,
    pub returned: Mutex<usize>,
}

impl TxPool for FakeTxPool {
    fn remove_batch(&self, txs: &[Vec<u8>]) {
        *self.removed.lock().unwrap() += txs.len().max(1);
    }

    fn add_batch(&self, txs: &[Vec<u8>]) {
        *self.returned.lock().unwrap() += txs.len().max(1);
    }
}

pub struct FakeStaking {
    pub delegates: Vec<Delegate>,
}

impl Staking for FakeStaking {
    fn internal_delegate_list(&self) -> Vec<Delegate> {
        self.delegates.clone()
    }
}

/// Packs deterministic empty blocks on top of whatever parent it is given.
pub struct FakeBuilder;

impl FakeBuilder {
    fn info(&self, block: Block, block_type: BlockType) -> ProposedBlockInfo {
        let stage = Arc::new(FakeStage {
            root: block.header.state_root,
        });
        ProposedBlockInfo {
            checkpoint: block.height(),
            stage,
            receipts: Vec::new(),
            remove_txs: Arc::new(|| true),
            return_txs: Arc::new(|| true),
            block_type,
            block,
        }
    }
}

impl BlockBuilder for FakeBuilder {
    fn build_mblock(&self, parent: &Block) -> Option<ProposedBlockInfo> {
        Some(self.info(child_block(parent, BlockType::MBlock), BlockType::MBlock))
    }

    fn build_kblock(
        &self,
        parent: &Block,
        data: &KBlockData,
        _rewards: &[PowReward],
    ) -> Option<ProposedBlockInfo> {
        let mut block = child_block(parent, BlockType::KBlock);
        block.set_kblock_data(data.clone());
        Some(self.info(block, BlockType::KBlock))
    }

    fn build_stop_committee_block(&self, parent: &Block) -> Option<ProposedBlockInfo> {
        Some(self.info(
            child_block(parent, BlockType::StopCommittee),
            BlockType::StopCommittee,
        ))
    }
}

// ---- wiring ----------------------------------------------------------------

pub struct TestNode {
    pub core: Arc<crate::reactor::ReactorCore>,
    pub chain: Arc<MemChain>,
    pub state_store: Arc<MemStateStore>,
    pub logdb: Arc<FakeLogDb>,
    pub txpool: Arc<FakeTxPool>,
    pub rx_outbound: Receiver<OutboundMessage>,
    pub rx_kblock: Receiver<RecvKBlockInfo>,
    pub tx_kblock: Sender<RecvKBlockInfo>,
}

/// Wire a reactor core around in-memory fakes for committee seat `index`.
pub fn test_node(tc: &TestCommittee, index: usize) -> TestNode {
    test_node_with(tc, index, crate::config::Parameters::default())
}

pub fn test_node_with(
    tc: &TestCommittee,
    index: usize,
    params: crate::config::Parameters,
) -> TestNode {
    let (tx_outbound, rx_outbound) = channel(1_000);
    let (tx_kblock, rx_kblock) = channel(16);
    let chain = Arc::new(MemChain::new(genesis_block()));
    let state_store = Arc::new(MemStateStore::default());
    let logdb = Arc::new(FakeLogDb::default());
    let txpool = Arc::new(FakeTxPool::default());
    let core = Arc::new(crate::reactor::ReactorCore::new(
        chain.clone(),
        state_store.clone(),
        Arc::new(FakeExecutor),
        Arc::new(FakeBuilder),
        logdb.clone(),
        txpool.clone(),
        tx_outbound,
        tx_kblock.clone(),
        tc.keys[index].clone(),
        format!("validator-{}", index).into_bytes(),
        ecdsa_pk(index),
        net_addr(index),
        params,
    ));
    TestNode {
        core,
        chain,
        state_store,
        logdb,
        txpool,
        rx_outbound,
        rx_kblock,
        tx_kblock,
    }
}

pub fn set_kblock_request(node: &TestNode, nonce: u64) {
    node.core.set_kblock_request(KBlockRequest {
        data: KBlockData { nonce },
        rewards: vec![PowReward {
            beneficiary: vec![0xaa; 20],
            amount: 500,
        }],
    });
}
