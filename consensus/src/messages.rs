use block::{CommitteeInfo, NetAddress, TimeoutCert};
use crypto::Digest;
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub const CONSENSUS_MSG_ANNOUNCE_COMMITTEE: u8 = 0x01;
pub const CONSENSUS_MSG_COMMIT_COMMITTEE: u8 = 0x02;
pub const CONSENSUS_MSG_NOTARY_ANNOUNCE: u8 = 0x03;
pub const CONSENSUS_MSG_VOTE_FOR_NOTARY: u8 = 0x04;
pub const CONSENSUS_MSG_PM_PROPOSAL: u8 = 0x10;
pub const CONSENSUS_MSG_PM_VOTE_FOR_PROPOSAL: u8 = 0x11;
pub const CONSENSUS_MSG_PM_NEW_VIEW: u8 = 0x12;
pub const CONSENSUS_MSG_PM_QUERY_PROPOSAL: u8 = 0x13;

pub fn now_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Envelope fields shared by every consensus message. The sender is the
/// member's ECDSA pubkey bytes and resolves to a committee index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommonHeader {
    pub height: u32,
    pub round: u32,
    pub sender: Vec<u8>,
    pub timestamp: u64,
    pub msg_type: u8,
    pub epoch_id: u64,
}

impl Encodable for CommonHeader {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(6);
        s.append(&self.height);
        s.append(&self.round);
        s.append(&self.sender);
        s.append(&self.timestamp);
        s.append(&self.msg_type);
        s.append(&self.epoch_id);
    }
}

impl Decodable for CommonHeader {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self {
            height: rlp.val_at(0)?,
            round: rlp.val_at(1)?,
            sender: rlp.val_at(2)?,
            timestamp: rlp.val_at(3)?,
            msg_type: rlp.val_at(4)?,
            epoch_id: rlp.val_at(5)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NewViewReason {
    RoundTimeout,
    HigherQCSeen,
}

impl NewViewReason {
    pub fn to_byte(self) -> u8 {
        match self {
            NewViewReason::RoundTimeout => 1,
            NewViewReason::HigherQCSeen => 2,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(NewViewReason::RoundTimeout),
            2 => Some(NewViewReason::HigherQCSeen),
            _ => None,
        }
    }
}

impl fmt::Display for NewViewReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NewViewReason::RoundTimeout => write!(f, "RoundTimeout"),
            NewViewReason::HigherQCSeen => write!(f, "HigherQCSeen"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PMProposalMessage {
    pub header: CommonHeader,
    pub parent_height: u64,
    pub parent_round: u64,
    pub proposed_block: Vec<u8>,
    pub proposed_block_type: u8,
    pub timeout_cert: Option<TimeoutCert>,
}

impl Encodable for PMProposalMessage {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(6);
        s.append(&self.header);
        s.append(&self.parent_height);
        s.append(&self.parent_round);
        s.append(&self.proposed_block);
        s.append(&self.proposed_block_type);
        match &self.timeout_cert {
            Some(tc) => {
                s.begin_list(1);
                s.append(tc);
            }
            None => {
                s.begin_list(0);
            }
        }
    }
}

impl Decodable for PMProposalMessage {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let tc_slot = rlp.at(5)?;
        let timeout_cert = if tc_slot.item_count()? == 0 {
            None
        } else {
            Some(tc_slot.val_at(0)?)
        };
        Ok(Self {
            header: rlp.val_at(0)?,
            parent_height: rlp.val_at(1)?,
            parent_round: rlp.val_at(2)?,
            proposed_block: rlp.val_at(3)?,
            proposed_block_type: rlp.val_at(4)?,
            timeout_cert,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PMVoteForProposalMessage {
    pub header: CommonHeader,
    pub voter_index: u32,
    pub signed_message_hash: Digest,
    pub voter_signature: Vec<u8>,
    pub cs_voter_pubkey: Vec<u8>,
    pub block_id: Digest,
    pub txs_root: Digest,
    pub state_root: Digest,
}

impl Encodable for PMVoteForProposalMessage {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(8);
        s.append(&self.header);
        s.append(&self.voter_index);
        s.append(&self.signed_message_hash);
        s.append(&self.voter_signature);
        s.append(&self.cs_voter_pubkey);
        s.append(&self.block_id);
        s.append(&self.txs_root);
        s.append(&self.state_root);
    }
}

impl Decodable for PMVoteForProposalMessage {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self {
            header: rlp.val_at(0)?,
            voter_index: rlp.val_at(1)?,
            signed_message_hash: rlp.val_at(2)?,
            voter_signature: rlp.val_at(3)?,
            cs_voter_pubkey: rlp.val_at(4)?,
            block_id: rlp.val_at(5)?,
            txs_root: rlp.val_at(6)?,
            state_root: rlp.val_at(7)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PMNewViewMessage {
    pub header: CommonHeader,
    pub reason: NewViewReason,
    pub qc_high: Vec<u8>,
    pub timeout_height: u64,
    pub timeout_round: u64,
    pub timeout_counter: u64,
    pub peer_id: Vec<u8>,
    pub peer_index: u32,
    pub signed_message_hash: Digest,
    pub peer_signature: Vec<u8>,
}

impl Encodable for PMNewViewMessage {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(10);
        s.append(&self.header);
        s.append(&self.reason.to_byte());
        s.append(&self.qc_high);
        s.append(&self.timeout_height);
        s.append(&self.timeout_round);
        s.append(&self.timeout_counter);
        s.append(&self.peer_id);
        s.append(&self.peer_index);
        s.append(&self.signed_message_hash);
        s.append(&self.peer_signature);
    }
}

impl Decodable for PMNewViewMessage {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let reason = NewViewReason::from_byte(rlp.val_at(1)?)
            .ok_or(DecoderError::Custom("unknown new view reason"))?;
        Ok(Self {
            header: rlp.val_at(0)?,
            reason,
            qc_high: rlp.val_at(2)?,
            timeout_height: rlp.val_at(3)?,
            timeout_round: rlp.val_at(4)?,
            timeout_counter: rlp.val_at(5)?,
            peer_id: rlp.val_at(6)?,
            peer_index: rlp.val_at(7)?,
            signed_message_hash: rlp.val_at(8)?,
            peer_signature: rlp.val_at(9)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PMQueryProposalMessage {
    pub header: CommonHeader,
    pub from_height: u64,
    pub to_height: u64,
    pub round: u64,
    pub return_addr: NetAddress,
}

impl Encodable for PMQueryProposalMessage {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(5);
        s.append(&self.header);
        s.append(&self.from_height);
        s.append(&self.to_height);
        s.append(&self.round);
        s.append(&self.return_addr);
    }
}

impl Decodable for PMQueryProposalMessage {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self {
            header: rlp.val_at(0)?,
            from_height: rlp.val_at(1)?,
            to_height: rlp.val_at(2)?,
            round: rlp.val_at(3)?,
            return_addr: rlp.val_at(4)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnnounceCommitteeMessage {
    pub header: CommonHeader,
    pub announcer_id: Vec<u8>,
    pub committee_id: u32,
    pub committee_size: u32,
    pub nonce: u64,
    pub cs_leader_pubkey: Vec<u8>,
    pub kblock_height: u64,
    pub pow_block_height: u64,
}

impl Encodable for AnnounceCommitteeMessage {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(8);
        s.append(&self.header);
        s.append(&self.announcer_id);
        s.append(&self.committee_id);
        s.append(&self.committee_size);
        s.append(&self.nonce);
        s.append(&self.cs_leader_pubkey);
        s.append(&self.kblock_height);
        s.append(&self.pow_block_height);
    }
}

impl Decodable for AnnounceCommitteeMessage {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self {
            header: rlp.val_at(0)?,
            announcer_id: rlp.val_at(1)?,
            committee_id: rlp.val_at(2)?,
            committee_size: rlp.val_at(3)?,
            nonce: rlp.val_at(4)?,
            cs_leader_pubkey: rlp.val_at(5)?,
            kblock_height: rlp.val_at(6)?,
            pow_block_height: rlp.val_at(7)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitCommitteeMessage {
    pub header: CommonHeader,
    pub committee_id: u32,
    pub committer_id: Vec<u8>,
    pub committer_index: u32,
    pub signed_message_hash: Digest,
    pub committer_signature: Vec<u8>,
    pub cs_committer_pubkey: Vec<u8>,
}

impl Encodable for CommitCommitteeMessage {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(7);
        s.append(&self.header);
        s.append(&self.committee_id);
        s.append(&self.committer_id);
        s.append(&self.committer_index);
        s.append(&self.signed_message_hash);
        s.append(&self.committer_signature);
        s.append(&self.cs_committer_pubkey);
    }
}

impl Decodable for CommitCommitteeMessage {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self {
            header: rlp.val_at(0)?,
            committee_id: rlp.val_at(1)?,
            committer_id: rlp.val_at(2)?,
            committer_index: rlp.val_at(3)?,
            signed_message_hash: rlp.val_at(4)?,
            committer_signature: rlp.val_at(5)?,
            cs_committer_pubkey: rlp.val_at(6)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotaryAnnounceMessage {
    pub header: CommonHeader,
    pub announcer_id: Vec<u8>,
    pub committee_id: u32,
    pub committee_size: u32,
    pub voter_bitarray: String,
    pub voter_agg_signature: Vec<u8>,
    pub committee_actual_size: u32,
    pub committee_actual_members: Vec<CommitteeInfo>,
}

impl Encodable for NotaryAnnounceMessage {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(8);
        s.append(&self.header);
        s.append(&self.announcer_id);
        s.append(&self.committee_id);
        s.append(&self.committee_size);
        s.append(&self.voter_bitarray);
        s.append(&self.voter_agg_signature);
        s.append(&self.committee_actual_size);
        s.append_list(&self.committee_actual_members);
    }
}

impl Decodable for NotaryAnnounceMessage {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self {
            header: rlp.val_at(0)?,
            announcer_id: rlp.val_at(1)?,
            committee_id: rlp.val_at(2)?,
            committee_size: rlp.val_at(3)?,
            voter_bitarray: rlp.val_at(4)?,
            voter_agg_signature: rlp.val_at(5)?,
            committee_actual_size: rlp.val_at(6)?,
            committee_actual_members: rlp.list_at(7)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteForNotaryMessage {
    pub header: CommonHeader,
    pub voter_id: Vec<u8>,
    pub voter_index: u32,
    pub signed_message_hash: Digest,
    pub voter_signature: Vec<u8>,
    pub cs_voter_pubkey: Vec<u8>,
}

impl Encodable for VoteForNotaryMessage {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(6);
        s.append(&self.header);
        s.append(&self.voter_id);
        s.append(&self.voter_index);
        s.append(&self.signed_message_hash);
        s.append(&self.voter_signature);
        s.append(&self.cs_voter_pubkey);
    }
}

impl Decodable for VoteForNotaryMessage {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self {
            header: rlp.val_at(0)?,
            voter_id: rlp.val_at(1)?,
            voter_index: rlp.val_at(2)?,
            signed_message_hash: rlp.val_at(3)?,
            voter_signature: rlp.val_at(4)?,
            cs_voter_pubkey: rlp.val_at(5)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsensusMessage {
    Proposal(PMProposalMessage),
    Vote(PMVoteForProposalMessage),
    NewView(PMNewViewMessage),
    QueryProposal(PMQueryProposalMessage),
    AnnounceCommittee(AnnounceCommitteeMessage),
    CommitCommittee(CommitCommitteeMessage),
    NotaryAnnounce(NotaryAnnounceMessage),
    VoteForNotary(VoteForNotaryMessage),
}

impl ConsensusMessage {
    pub fn header(&self) -> &CommonHeader {
        match self {
            ConsensusMessage::Proposal(m) => &m.header,
            ConsensusMessage::Vote(m) => &m.header,
            ConsensusMessage::NewView(m) => &m.header,
            ConsensusMessage::QueryProposal(m) => &m.header,
            ConsensusMessage::AnnounceCommittee(m) => &m.header,
            ConsensusMessage::CommitCommittee(m) => &m.header,
            ConsensusMessage::NotaryAnnounce(m) => &m.header,
            ConsensusMessage::VoteForNotary(m) => &m.header,
        }
    }

    /// True for the steady-state pacemaker messages, false for the one-shot
    /// committee-formation messages.
    pub fn is_pacemaker_message(&self) -> bool {
        matches!(
            self,
            ConsensusMessage::Proposal(_)
                | ConsensusMessage::Vote(_)
                | ConsensusMessage::NewView(_)
                | ConsensusMessage::QueryProposal(_)
        )
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            ConsensusMessage::Proposal(m) => rlp::encode(m).to_vec(),
            ConsensusMessage::Vote(m) => rlp::encode(m).to_vec(),
            ConsensusMessage::NewView(m) => rlp::encode(m).to_vec(),
            ConsensusMessage::QueryProposal(m) => rlp::encode(m).to_vec(),
            ConsensusMessage::AnnounceCommittee(m) => rlp::encode(m).to_vec(),
            ConsensusMessage::CommitCommittee(m) => rlp::encode(m).to_vec(),
            ConsensusMessage::NotaryAnnounce(m) => rlp::encode(m).to_vec(),
            ConsensusMessage::VoteForNotary(m) => rlp::encode(m).to_vec(),
        }
    }

    /// Decode a wire message, dispatching on the MsgType byte carried in
    /// the common header.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecoderError> {
        let rlp = Rlp::new(bytes);
        let header: CommonHeader = rlp.val_at(0)?;
        match header.msg_type {
            CONSENSUS_MSG_PM_PROPOSAL => Ok(ConsensusMessage::Proposal(rlp::decode(bytes)?)),
            CONSENSUS_MSG_PM_VOTE_FOR_PROPOSAL => Ok(ConsensusMessage::Vote(rlp::decode(bytes)?)),
            CONSENSUS_MSG_PM_NEW_VIEW => Ok(ConsensusMessage::NewView(rlp::decode(bytes)?)),
            CONSENSUS_MSG_PM_QUERY_PROPOSAL => {
                Ok(ConsensusMessage::QueryProposal(rlp::decode(bytes)?))
            }
            CONSENSUS_MSG_ANNOUNCE_COMMITTEE => {
                Ok(ConsensusMessage::AnnounceCommittee(rlp::decode(bytes)?))
            }
            CONSENSUS_MSG_COMMIT_COMMITTEE => {
                Ok(ConsensusMessage::CommitCommittee(rlp::decode(bytes)?))
            }
            CONSENSUS_MSG_NOTARY_ANNOUNCE => {
                Ok(ConsensusMessage::NotaryAnnounce(rlp::decode(bytes)?))
            }
            CONSENSUS_MSG_VOTE_FOR_NOTARY => {
                Ok(ConsensusMessage::VoteForNotary(rlp::decode(bytes)?))
            }
            _ => Err(DecoderError::Custom("unknown message type")),
        }
    }
}

impl fmt::Display for ConsensusMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let h = self.header();
        let name = match self {
            ConsensusMessage::Proposal(_) => "PMProposal",
            ConsensusMessage::Vote(_) => "PMVoteForProposal",
            ConsensusMessage::NewView(m) => {
                return write!(
                    f,
                    "PMNewView({}, H:{} R:{} E:{})",
                    m.reason, h.height, h.round, h.epoch_id
                )
            }
            ConsensusMessage::QueryProposal(_) => "PMQueryProposal",
            ConsensusMessage::AnnounceCommittee(_) => "AnnounceCommittee",
            ConsensusMessage::CommitCommittee(_) => "CommitCommittee",
            ConsensusMessage::NotaryAnnounce(_) => "NotaryAnnounce",
            ConsensusMessage::VoteForNotary(_) => "VoteForNotary",
        };
        write!(f, "{}(H:{} R:{} E:{})", name, h.height, h.round, h.epoch_id)
    }
}
