//! Event-loop scenarios driven through the public pacemaker handle, with
//! every collaborator replaced by a deterministic fake. Time is paused so
//! round timers and scheduled beats fire as virtual time advances.

#[path = "common.rs"]
mod common;

use super::*;
use crate::config::Parameters;
use crate::messages::{CommonHeader, CONSENSUS_MSG_PM_NEW_VIEW};
use crate::traits::{ChainStore, OutboundMessage, OutboundPayload};
use block::BlockType;
use common::*;
use tokio::time::{timeout, Instant};

struct Node {
    test: TestNode,
    handle: PacemakerHandle,
    committee: TestCommittee,
}

fn spawn_node(size: usize, my_index: usize) -> Node {
    let committee = test_committee(size, 1);
    let test = test_node(&committee, my_index);
    let (pacemaker, handle) = Pacemaker::new(
        test.core.clone(),
        committee.committee.clone(),
        my_index,
        Parameters::default(),
    );
    pacemaker.start(true);
    Node {
        test,
        handle,
        committee,
    }
}

impl Node {
    async fn deliver_from(&self, sender_index: usize, message: ConsensusMessage) {
        assert!(
            self.handle
                .dispatch(message, net_addr(sender_index))
                .await
        );
        // Let the loop drain before the test continues.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    async fn next_vote(&mut self) -> PMVoteForProposalMessage {
        loop {
            match self.next_outbound().await.payload {
                OutboundPayload::Consensus(ConsensusMessage::Vote(vote)) => return vote,
                _ => continue,
            }
        }
    }

    async fn next_new_view(&mut self) -> PMNewViewMessage {
        loop {
            match self.next_outbound().await.payload {
                OutboundPayload::Consensus(ConsensusMessage::NewView(msg)) => return msg,
                _ => continue,
            }
        }
    }

    async fn next_outbound(&mut self) -> OutboundMessage {
        timeout(Duration::from_secs(600), self.test.rx_outbound.recv())
            .await
            .expect("expected an outbound message")
            .expect("outbound channel open")
    }

    fn new_view_timeout_msg(
        &self,
        sender_index: usize,
        next_height: u64,
        next_round: u64,
        timeout_height: u64,
        timeout_round: u64,
        counter: u64,
        qc: &block::QuorumCert,
    ) -> PMNewViewMessage {
        let digest = crypto::build_new_view_digest(
            self.committee.committee.epoch_id,
            timeout_height,
            timeout_round,
            counter,
        );
        let signature = self.committee.keys[sender_index].sign(&digest);
        PMNewViewMessage {
            header: CommonHeader {
                height: next_height as u32,
                round: next_round as u32,
                sender: ecdsa_pk(sender_index),
                timestamp: crate::messages::now_timestamp(),
                msg_type: CONSENSUS_MSG_PM_NEW_VIEW,
                epoch_id: self.committee.committee.epoch_id,
            },
            reason: NewViewReason::RoundTimeout,
            qc_high: qc.to_bytes(),
            timeout_height,
            timeout_round,
            timeout_counter: counter,
            peer_id: ecdsa_pk(sender_index),
            peer_index: sender_index as u32,
            signed_message_hash: digest,
            peer_signature: signature.to_vec(),
        }
    }
}

/// S1: four chained proposals commit the first block once the three-chain
/// with direct parents is complete.
#[tokio::test(start_paused = true)]
async fn happy_three_chain_commits_first_block() {
    let mut node = spawn_node(5, 4);
    let tc = node.committee.clone();
    let genesis = genesis_block();

    let mut b1 = child_block(&genesis, BlockType::MBlock);
    b1.qc = block::QuorumCert::genesis();
    let qc1 = make_qc(&tc, 1, 0, &[0, 1, 2, 3]);
    let mut b2 = child_block(&b1, BlockType::MBlock);
    b2.qc = qc1;
    let qc2 = make_qc(&tc, 2, 1, &[0, 1, 2, 3]);
    let mut b3 = child_block(&b2, BlockType::MBlock);
    b3.qc = qc2;
    let qc3 = make_qc(&tc, 3, 2, &[0, 1, 2, 3]);
    let mut b4 = child_block(&b3, BlockType::MBlock);
    b4.qc = qc3;

    let msgs = vec![
        proposal_msg(&tc, &b1, 1, 0, (0, 0), None),
        proposal_msg(&tc, &b2, 2, 1, (1, 0), None),
        proposal_msg(&tc, &b3, 3, 2, (2, 1), None),
        proposal_msg(&tc, &b4, 4, 3, (3, 2), None),
    ];
    for (i, msg) in msgs.into_iter().enumerate() {
        node.deliver_from(i, ConsensusMessage::Proposal(msg)).await;
    }

    // One vote per proposal, each bound to its height.
    for height in 1..=4u32 {
        let vote = node.next_vote().await;
        assert_eq!(vote.header.height, height);
        assert_eq!(vote.voter_index, 4);
    }

    // Applying qc3 completes the chain b1 <- b2 <- b3; b1 is final.
    let best = node.test.chain.best_block();
    assert_eq!(best.height(), 1);
    assert_eq!(best.id(), b1.id());
    assert!(node.test.logdb.batches.lock().unwrap().contains(&1));
}

/// S5: a proposal whose parent is unknown is parked, a query goes out, and
/// delivery of the parent replays it to completion.
#[tokio::test(start_paused = true)]
async fn pending_parent_is_parked_and_replayed() {
    let mut node = spawn_node(5, 4);
    let tc = node.committee.clone();
    let genesis = genesis_block();

    let mut b1 = child_block(&genesis, BlockType::MBlock);
    b1.qc = block::QuorumCert::genesis();
    let qc1 = make_qc(&tc, 1, 0, &[0, 1, 2, 3]);
    let mut b2 = child_block(&b1, BlockType::MBlock);
    b2.qc = qc1;

    // Child first: its parent (1, 0) is not in the tree yet.
    node.deliver_from(1, ConsensusMessage::Proposal(proposal_msg(&tc, &b2, 2, 1, (1, 0), None)))
        .await;

    let query = loop {
        match node.next_outbound().await.payload {
            OutboundPayload::Consensus(ConsensusMessage::QueryProposal(q)) => break q,
            _ => continue,
        }
    };
    assert_eq!(query.to_height, 1);
    assert_eq!(query.round, 0);
    assert_eq!(query.return_addr, net_addr(4));

    // Parent arrives; the parked child replays and both get voted.
    node.deliver_from(0, ConsensusMessage::Proposal(proposal_msg(&tc, &b1, 1, 0, (0, 0), None)))
        .await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    let first = node.next_vote().await;
    let second = node.next_vote().await;
    assert_eq!(first.header.height, 1);
    assert_eq!(second.header.height, 2);
}

/// S2, next-leader side: timeout new-views aggregate into a TC and the
/// next proposal carries it.
#[tokio::test(start_paused = true)]
async fn timeout_new_views_form_tc_and_drive_reproposal() {
    let mut node = spawn_node(4, 2);
    let tc = node.committee.clone();
    let genesis = genesis_block();

    let mut b1 = child_block(&genesis, BlockType::MBlock);
    b1.qc = block::QuorumCert::genesis();
    node.deliver_from(0, ConsensusMessage::Proposal(proposal_msg(&tc, &b1, 1, 0, (0, 0), None)))
        .await;
    let _ = node.next_vote().await;

    // Round 1's leader stays silent; peers 0, 1 and 3 time out at (2, 1)
    // and address round 2, where this node proposes.
    let qc1 = make_qc(&tc, 1, 0, &[0, 1, 2, 3]);
    for sender in [0usize, 1, 3] {
        let msg = node.new_view_timeout_msg(sender, 2, 2, 2, 1, 1, &qc1);
        node.deliver_from(sender, ConsensusMessage::NewView(msg)).await;
    }

    // The beat fires after the round interval; the proposal carries the TC.
    let proposal = loop {
        match node.next_outbound().await.payload {
            OutboundPayload::Consensus(ConsensusMessage::Proposal(p)) => break p,
            _ => continue,
        }
    };
    assert_eq!(proposal.header.height, 2);
    assert_eq!(proposal.header.round, 2);
    let cert = proposal.timeout_cert.expect("proposal carries the TC");
    assert_eq!(cert.timeout_height, 2);
    assert_eq!(cert.timeout_round, 1);
    assert_eq!(cert.timeout_counter, 1);
    assert_eq!(cert.timeout_bitarray.to_canonical_string(), "xx_x");
}

/// S2, validator side: a TC proposal reverts the superseded height, gets
/// voted despite the voting-height watermark, and restarts the round timer
/// without resetting the timeout counter.
#[tokio::test(start_paused = true)]
async fn tc_proposal_reverts_and_votes_with_liveness_override() {
    let mut node = spawn_node(4, 3);
    let tc = node.committee.clone();
    let genesis = genesis_block();

    let mut b1 = child_block(&genesis, BlockType::MBlock);
    b1.qc = block::QuorumCert::genesis();
    node.deliver_from(0, ConsensusMessage::Proposal(proposal_msg(&tc, &b1, 1, 0, (0, 0), None)))
        .await;
    let _ = node.next_vote().await;

    // A first block at height 2 is proposed and voted on round 1.
    let qc1 = make_qc(&tc, 1, 0, &[0, 1, 2, 3]);
    let mut b2a = child_block(&b1, BlockType::MBlock);
    b2a.header.timestamp += 1;
    b2a.qc = qc1.clone();
    node.deliver_from(1, ConsensusMessage::Proposal(proposal_msg(&tc, &b2a, 2, 1, (1, 0), None)))
        .await;
    let _ = node.next_vote().await;

    // This validator's own round timer fires once.
    let own_timeout = node.next_new_view().await;
    assert_eq!(own_timeout.reason, NewViewReason::RoundTimeout);
    assert_eq!(own_timeout.timeout_counter, 1);

    // The round-2 leader re-proposes height 2 with the TC attached.
    let cert = make_tc(&tc, 2, 1, 1, &[0, 1, 3]);
    let mut b2b = child_block(&b1, BlockType::MBlock);
    b2b.qc = qc1;
    node.deliver_from(
        2,
        ConsensusMessage::Proposal(proposal_msg(&tc, &b2b, 2, 2, (1, 0), Some(cert))),
    )
    .await;

    // The superseded (2, 1) proposal was walked back before the new vote.
    assert!(!node.test.state_store.reverts.lock().unwrap().is_empty());
    assert!(*node.test.txpool.returned.lock().unwrap() > 0);

    let vote = node.next_vote().await;
    assert_eq!(vote.header.height, 2);
    assert_eq!(vote.header.round, 2);

    // The TC proposal kept the timeout counter: the next firing reports
    // counter 2 from round 2, not a reset.
    let next_timeout = node.next_new_view().await;
    assert_eq!(next_timeout.timeout_counter, 2);
    assert_eq!(next_timeout.timeout_round, 2);
}

/// S4 (pacemaker half): committing a K-block posts the epoch info to the
/// reactor queue and stops the loop.
#[tokio::test(start_paused = true)]
async fn kblock_commit_posts_info_and_stops() {
    let mut node = spawn_node(5, 4);
    let tc = node.committee.clone();
    let genesis = genesis_block();

    let mut b1 = child_block(&genesis, BlockType::KBlock);
    b1.qc = block::QuorumCert::genesis();
    let qc1 = make_qc(&tc, 1, 0, &[0, 1, 2, 3]);
    let mut b2 = child_block(&b1, BlockType::MBlock);
    b2.qc = qc1;
    let qc2 = make_qc(&tc, 2, 1, &[0, 1, 2, 3]);
    let mut b3 = child_block(&b2, BlockType::MBlock);
    b3.qc = qc2;
    let qc3 = make_qc(&tc, 3, 2, &[0, 1, 2, 3]);
    let mut b4 = child_block(&b3, BlockType::MBlock);
    b4.qc = qc3;

    let msgs = vec![
        proposal_msg(&tc, &b1, 1, 0, (0, 0), None),
        proposal_msg(&tc, &b2, 2, 1, (1, 0), None),
        proposal_msg(&tc, &b3, 3, 2, (2, 1), None),
        proposal_msg(&tc, &b4, 4, 3, (3, 2), None),
    ];
    for (i, msg) in msgs.into_iter().enumerate() {
        node.deliver_from(i, ConsensusMessage::Proposal(msg)).await;
    }

    let info = timeout(Duration::from_secs(600), node.test.rx_kblock.recv())
        .await
        .expect("kblock info in time")
        .expect("kblock channel open");
    assert_eq!(
        info,
        RecvKBlockInfo {
            height: 1,
            last_kblock_height: 0,
            nonce: 0xbeef,
            epoch: 1,
        }
    );

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(node.handle.is_stopped());
}

/// Safety property 3: one vote per height, enforced by the voting-height
/// watermark and the single-slot tree.
#[tokio::test(start_paused = true)]
async fn never_votes_twice_at_the_same_height() {
    let mut node = spawn_node(5, 4);
    let tc = node.committee.clone();
    let genesis = genesis_block();

    let mut b1a = child_block(&genesis, BlockType::MBlock);
    b1a.qc = block::QuorumCert::genesis();
    let mut b1b = child_block(&genesis, BlockType::MBlock);
    b1b.header.timestamp += 1;
    b1b.qc = block::QuorumCert::genesis();
    assert_ne!(b1a.id(), b1b.id());

    node.deliver_from(0, ConsensusMessage::Proposal(proposal_msg(&tc, &b1a, 1, 0, (0, 0), None)))
        .await;
    node.deliver_from(1, ConsensusMessage::Proposal(proposal_msg(&tc, &b1b, 1, 1, (0, 0), None)))
        .await;

    let vote = node.next_vote().await;
    assert_eq!(vote.header.height, 1);
    assert_eq!(vote.header.round, 0);

    // Anything else outbound must not be a second vote for height 1.
    tokio::time::sleep(Duration::from_millis(20)).await;
    while let Ok(out) = node.test.rx_outbound.try_recv() {
        if let OutboundPayload::Consensus(ConsensusMessage::Vote(v)) = out.payload {
            panic!("unexpected extra vote at height {}", v.header.height);
        }
    }
}

/// Liveness property 6: the round timer doubles on consecutive timeouts.
#[tokio::test(start_paused = true)]
async fn round_timer_backs_off_exponentially() {
    let mut node = spawn_node(5, 4);
    let start = Instant::now();

    let nv1 = node.next_new_view().await;
    assert_eq!(nv1.reason, NewViewReason::RoundTimeout);
    assert_eq!(nv1.timeout_counter, 1);
    let t1 = start.elapsed();
    // First beat after 1 s, then the 30 s base interval.
    assert!(t1 >= Duration::from_secs(31) && t1 < Duration::from_secs(35));

    let nv2 = node.next_new_view().await;
    assert_eq!(nv2.timeout_counter, 2);
    let t2 = start.elapsed();
    assert!(t2 >= t1 + Duration::from_secs(60) && t2 < t1 + Duration::from_secs(65));

    let nv3 = node.next_new_view().await;
    assert_eq!(nv3.timeout_counter, 3);
    let t3 = start.elapsed();
    assert!(t3 >= t2 + Duration::from_secs(120) && t3 < t2 + Duration::from_secs(125));

    // Rounds advance strictly across timeouts.
    assert!(nv2.timeout_round > nv1.timeout_round);
    assert!(nv3.timeout_round > nv2.timeout_round);
}
