use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Relay-assigned identifier of a connected participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A peer as announced by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    #[serde(default)]
    pub name: String,
}

impl PeerInfo {
    pub fn new(id: impl Into<PeerId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Name to show in prompts; falls back to the id when the relay sent none.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            self.id.as_str()
        } else {
            &self.name
        }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Messages this client sends to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    /// Announce a new display name.
    #[serde(rename = "change-name")]
    ChangeName { name: String },

    /// Invite `target` to a call. No media is negotiated yet.
    IncomingCall { target: PeerId },

    /// Caller gives up before the callee answered.
    CancelCall { target: PeerId },

    /// Callee declines the invite.
    CallRejected { target: PeerId },

    /// SDP offer, produced by the accepting side.
    Offer { sdp: String, target: PeerId },

    /// SDP answer to a received offer.
    Answer { sdp: String, target: PeerId },

    IceCandidate {
        candidate: IceCandidate,
        target: PeerId,
    },

    /// Either party hangs up.
    CallEnded { target: PeerId },
}

impl Outbound {
    /// Wire name of the message, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::ChangeName { .. } => "change-name",
            Outbound::IncomingCall { .. } => "incoming_call",
            Outbound::CancelCall { .. } => "cancel_call",
            Outbound::CallRejected { .. } => "call_rejected",
            Outbound::Offer { .. } => "offer",
            Outbound::Answer { .. } => "answer",
            Outbound::IceCandidate { .. } => "ice_candidate",
            Outbound::CallEnded { .. } => "call_ended",
        }
    }

    pub fn target(&self) -> Option<&PeerId> {
        match self {
            Outbound::ChangeName { .. } => None,
            Outbound::IncomingCall { target }
            | Outbound::CancelCall { target }
            | Outbound::CallRejected { target }
            | Outbound::Offer { target, .. }
            | Outbound::Answer { target, .. }
            | Outbound::IceCandidate { target, .. }
            | Outbound::CallEnded { target } => Some(target),
        }
    }
}

/// Messages the relay delivers to this client.
///
/// Relayed call messages identify their origin inconsistently (`sender`,
/// `callee`, `caller` or nothing at all), so every origin field is optional.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// Handshake: the id the relay assigned to us.
    SelfId { user_id: PeerId },

    /// Full presence snapshot.
    UsersList {
        #[serde(deserialize_with = "deserialize_users")]
        users: Vec<PeerInfo>,
    },

    UserJoined { user: PeerInfo },

    UserLeft { user_id: PeerId },

    IncomingCall {
        #[serde(default)]
        user: Option<PeerInfo>,
        #[serde(default)]
        caller: Option<PeerId>,
    },

    CancelCall {
        #[serde(default)]
        sender: Option<PeerId>,
    },

    CallRejected {
        #[serde(default, alias = "sender")]
        callee: Option<PeerId>,
    },

    Offer {
        sdp: String,
        #[serde(default)]
        sender: Option<PeerId>,
    },

    Answer {
        sdp: String,
        #[serde(default, alias = "callee")]
        sender: Option<PeerId>,
    },

    IceCandidate {
        candidate: IceCandidate,
        #[serde(default)]
        sender: Option<PeerId>,
    },

    CallEnded {
        #[serde(default)]
        sender: Option<PeerId>,
    },

    /// Relay-reported failure. Payload shape is not fixed.
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        details: Option<serde_json::Value>,
    },

    #[serde(other)]
    Unknown,
}

impl Inbound {
    /// Peer a relayed call message claims to come from, if it says.
    pub fn origin(&self) -> Option<&PeerId> {
        match self {
            Inbound::IncomingCall { user, caller } => {
                user.as_ref().map(|u| &u.id).or(caller.as_ref())
            }
            Inbound::CancelCall { sender }
            | Inbound::Offer { sender, .. }
            | Inbound::Answer { sender, .. }
            | Inbound::IceCandidate { sender, .. }
            | Inbound::CallEnded { sender } => sender.as_ref(),
            Inbound::CallRejected { callee } => callee.as_ref(),
            _ => None,
        }
    }

    /// Caller of an `incoming_call`, whichever form the relay used.
    pub fn incoming_caller(&self) -> Option<PeerInfo> {
        match self {
            Inbound::IncomingCall {
                user: Some(user), ..
            } => Some(user.clone()),
            Inbound::IncomingCall {
                user: None,
                caller: Some(id),
            } => Some(PeerInfo::new(id.clone(), String::new())),
            _ => None,
        }
    }

    /// Wire name of the message, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Inbound::SelfId { .. } => "self_id",
            Inbound::UsersList { .. } => "users_list",
            Inbound::UserJoined { .. } => "user_joined",
            Inbound::UserLeft { .. } => "user_left",
            Inbound::IncomingCall { .. } => "incoming_call",
            Inbound::CancelCall { .. } => "cancel_call",
            Inbound::CallRejected { .. } => "call_rejected",
            Inbound::Offer { .. } => "offer",
            Inbound::Answer { .. } => "answer",
            Inbound::IceCandidate { .. } => "ice_candidate",
            Inbound::CallEnded { .. } => "call_ended",
            Inbound::Error { .. } => "error",
            Inbound::Unknown => "unknown",
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UserEntry {
    Info(PeerInfo),
    Bare(PeerId),
}

fn deserialize_users<'de, D>(deserializer: D) -> std::result::Result<Vec<PeerInfo>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries = Vec::<UserEntry>::deserialize(deserializer)?;
    Ok(entries
        .into_iter()
        .map(|entry| match entry {
            UserEntry::Info(info) => info,
            UserEntry::Bare(id) => PeerInfo::new(id, String::new()),
        })
        .collect())
}

pub fn encode_outbound(msg: &Outbound) -> Result<String> {
    Ok(serde_json::to_string(msg)?)
}

pub fn decode_inbound(text: &str) -> Result<Inbound> {
    serde_json::from_str(text)
        .map_err(|e| Error::protocol(format!("bad relay message: {}", e)))
}
