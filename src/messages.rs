/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The messages validators exchange while deciding a sequence.
//!
//! Every message shares a common header — the [`View`] it belongs to, the sender, and a
//! [`MsgType`] tag — and carries the fields its type requires: a pre-prepare carries the proposal,
//! prepares and commits carry the proposal digest (commits additionally a seal), and round changes
//! optionally carry a [`PreparedCertificate`] justifying a locked proposal.
//!
//! Messages keep a flat wire shape rather than a nested payload enum because the recorded-trace
//! format addresses the fields individually: a timeout marker in a `.flow` file is a message whose
//! digest, proposal, seal and sender are all empty (see
//! [`MessageReq::is_timeout_marker`]).

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::types::{digest, NodeID, Proposal, View};

/// The four message types of the protocol. The declaration order doubles as the processing
/// priority within a round: pre-prepares are consumed before prepares, prepares before commits,
/// commits before round changes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum MsgType {
    PrePrepare,
    Prepare,
    Commit,
    RoundChange,
}

impl Display for MsgType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            MsgType::PrePrepare => "PrePrepare",
            MsgType::Prepare => "Prepare",
            MsgType::Commit => "Commit",
            MsgType::RoundChange => "RoundChange",
        };
        f.write_str(name)
    }
}

/// Evidence that a proposal reached a prepare quorum at some round: attached to a round change to
/// justify re-adopting the proposal in a higher round.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PreparedCertificate {
    pub proposal: Proposal,
    /// The round at which the prepare quorum was observed.
    pub round: u64,
}

/// A single consensus message.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct MessageReq {
    pub msg_type: MsgType,
    pub from: NodeID,
    pub view: View,
    /// Digest of the proposal this message is about. Empty for a round change from a node without
    /// a locked proposal, and inside timeout markers.
    #[serde(default)]
    pub digest: Vec<u8>,
    /// The full proposal. Present only in pre-prepares.
    #[serde(default)]
    pub proposal: Option<Proposal>,
    /// The sender's commit seal over the digest. Present only in commits.
    #[serde(default)]
    pub seal: Option<Vec<u8>>,
    /// Justification for a locked proposal. Present only in round changes from locked nodes.
    #[serde(default)]
    pub certificate: Option<PreparedCertificate>,
}

impl MessageReq {
    pub fn preprepare(from: NodeID, view: View, proposal: Proposal) -> Self {
        Self {
            msg_type: MsgType::PrePrepare,
            from,
            view,
            digest: proposal.hash.clone(),
            proposal: Some(proposal),
            seal: None,
            certificate: None,
        }
    }

    pub fn prepare(from: NodeID, view: View, digest: Vec<u8>) -> Self {
        Self {
            msg_type: MsgType::Prepare,
            from,
            view,
            digest,
            proposal: None,
            seal: None,
            certificate: None,
        }
    }

    pub fn commit(from: NodeID, view: View, digest: Vec<u8>, seal: Vec<u8>) -> Self {
        Self {
            msg_type: MsgType::Commit,
            from,
            view,
            digest,
            proposal: None,
            seal: Some(seal),
            certificate: None,
        }
    }

    pub fn round_change(from: NodeID, view: View, certificate: Option<PreparedCertificate>) -> Self {
        let digest = certificate
            .as_ref()
            .map(|c| c.proposal.hash.clone())
            .unwrap_or_default();
        Self {
            msg_type: MsgType::RoundChange,
            from,
            view,
            digest,
            proposal: None,
            seal: None,
            certificate,
        }
    }

    /// A pseudo-message standing in for a round timeout inside a recorded trace. Recognized by
    /// its empty digest, absent proposal and seal, and empty sender.
    pub fn timeout_marker(msg_type: MsgType, view: View) -> Self {
        Self {
            msg_type,
            from: NodeID::from(""),
            view,
            digest: Vec::new(),
            proposal: None,
            seal: None,
            certificate: None,
        }
    }

    pub fn is_timeout_marker(&self) -> bool {
        self.digest.is_empty()
            && self.proposal.is_none()
            && self.seal.is_none()
            && self.from.is_empty()
    }

    /// Check that the message carries exactly the fields its type requires and that derived
    /// fields are internally consistent. This is a purely structural check; signer and proposer
    /// checks happen at the message log's ingress.
    pub fn check_shape(&self) -> Result<(), &'static str> {
        match self.msg_type {
            MsgType::PrePrepare => {
                let proposal = self.proposal.as_ref().ok_or("pre-prepare without proposal")?;
                if self.digest != proposal.hash {
                    return Err("pre-prepare digest disagrees with declared digest");
                }
                if proposal.hash != digest(&proposal.data) {
                    return Err("proposal hash disagrees with proposal data");
                }
                Ok(())
            }
            MsgType::Prepare => {
                if self.digest.is_empty() {
                    return Err("prepare without digest");
                }
                Ok(())
            }
            MsgType::Commit => {
                if self.digest.is_empty() {
                    return Err("commit without digest");
                }
                if self.seal.is_none() {
                    return Err("commit without seal");
                }
                Ok(())
            }
            MsgType::RoundChange => match &self.certificate {
                Some(cert) => {
                    if cert.proposal.hash != digest(&cert.proposal.data) {
                        return Err("certificate hash disagrees with certificate data");
                    }
                    if self.digest != cert.proposal.hash {
                        return Err("round change digest disagrees with certificate");
                    }
                    if cert.round >= self.view.round {
                        return Err("certificate round not below the round change round");
                    }
                    Ok(())
                }
                None => {
                    if !self.digest.is_empty() {
                        return Err("round change digest without certificate");
                    }
                    Ok(())
                }
            },
        }
    }
}
