use std::fmt;

use peerline_common::helpers::DEFAULT_DISPLAY_NAME;
use peerline_common::PeerId;

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8001/ws";

const DEFAULT_STUN_URLS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun.voipbuster.com:3478",
    "stun:stun.freeswitch.org:3478",
    "stun:stun.miwifi.com:3478",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

pub fn default_ice_servers() -> Vec<IceServerConfig> {
    DEFAULT_STUN_URLS
        .iter()
        .map(|url| IceServerConfig::stun(*url))
        .collect()
}

/// Which local devices a call captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub signaling_url: String,
    pub display_name: String,
    pub ice_servers: Vec<IceServerConfig>,
    pub media: MediaConstraints,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
            ice_servers: default_ice_servers(),
            media: MediaConstraints::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

/// Call lifecycle phase. `Idle` means no session exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Calling,
    Ringing,
    Negotiating,
    Active,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Calling => "calling",
            Phase::Ringing => "ringing",
            Phase::Negotiating => "negotiating",
            Phase::Active => "active",
        };
        f.write_str(name)
    }
}

/// This client's relay identity. Exists between handshake and disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfIdentity {
    pub id: PeerId,
    pub name: String,
}
