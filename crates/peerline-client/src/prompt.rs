//! Call prompt and call view contracts.
//!
//! Prompts never hold protocol state. The buttons they offer come back to the
//! controller as `UserIntent::{Cancel, Accept, Reject}`.

use peerline_common::{PeerId, PeerInfo};
use tracing::debug;

use crate::media::RemoteTrack;

pub trait CallPrompts: Send {
    /// "Calling..." with a cancel action.
    fn show_outgoing(&mut self, callee: &PeerInfo);
    fn dismiss_outgoing(&mut self);
    /// "Incoming call" with accept and reject actions.
    fn show_incoming(&mut self, caller: &PeerInfo);
    fn dismiss_incoming(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scene {
    Start,
    Call,
}

pub trait CallView: Send {
    fn switch_scene(&mut self, scene: Scene);

    fn remote_track(&mut self, _track: &RemoteTrack) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Outgoing,
    Incoming,
}

/// Keeps at most one prompt of each kind open and makes dismissal idempotent.
pub struct PromptTracker {
    prompts: Box<dyn CallPrompts>,
    outgoing: Option<PeerId>,
    incoming: Option<PeerId>,
}

impl PromptTracker {
    pub fn new(prompts: Box<dyn CallPrompts>) -> Self {
        Self {
            prompts,
            outgoing: None,
            incoming: None,
        }
    }

    pub fn show_outgoing(&mut self, callee: &PeerInfo) {
        self.dismiss(PromptKind::Outgoing);
        self.prompts.show_outgoing(callee);
        self.outgoing = Some(callee.id.clone());
    }

    pub fn show_incoming(&mut self, caller: &PeerInfo) {
        self.dismiss(PromptKind::Incoming);
        self.prompts.show_incoming(caller);
        self.incoming = Some(caller.id.clone());
    }

    pub fn dismiss(&mut self, kind: PromptKind) {
        match kind {
            PromptKind::Outgoing => {
                if let Some(peer) = self.outgoing.take() {
                    debug!("Dismissing outgoing prompt for {}", peer);
                    self.prompts.dismiss_outgoing();
                }
            }
            PromptKind::Incoming => {
                if let Some(peer) = self.incoming.take() {
                    debug!("Dismissing incoming prompt for {}", peer);
                    self.prompts.dismiss_incoming();
                }
            }
        }
    }

    pub fn dismiss_all(&mut self) {
        self.dismiss(PromptKind::Outgoing);
        self.dismiss(PromptKind::Incoming);
    }

    pub fn is_open(&self, kind: PromptKind) -> bool {
        match kind {
            PromptKind::Outgoing => self.outgoing.is_some(),
            PromptKind::Incoming => self.incoming.is_some(),
        }
    }
}
