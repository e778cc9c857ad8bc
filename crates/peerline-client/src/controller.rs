//! Call Controller: the call-session state machine.
//!
//! All state lives in one [`CallController`] driven by a single event queue.
//! Handlers never await. Anything asynchronous (capture, SDP generation,
//! description setting) runs as a spawned job whose result comes back as
//! [`Event::Completed`] tagged with the generation of the session that started
//! it. Results and media notifications for any other generation are stale and
//! are dropped after releasing whatever they carry.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use peerline_common::helpers::validate_display_name;
use peerline_common::{Error, IceCandidate, Inbound, Outbound, PeerId, PeerInfo, Result};

use crate::media::{
    ConnectionState, LocalMedia, MediaEvent, MediaEventSink, MediaFactory, MediaSession,
    SessionDescription,
};
use crate::prefs::NamePreference;
use crate::presence::{PresenceSet, PresenceView};
use crate::prompt::{CallPrompts, CallView, PromptKind, PromptTracker, Scene};
use crate::signaling::SignalSink;
use crate::types::{ClientConfig, MediaConstraints, Phase, Role, SelfIdentity};

/// Something the local user asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserIntent {
    Call(PeerId),
    /// Outgoing prompt's cancel action.
    Cancel,
    Accept,
    Reject,
    /// Hang up whatever call exists.
    End,
    ChangeName(String),
    /// Hang up, then close the signaling link.
    Quit,
}

#[derive(Debug)]
pub enum Event {
    Signal(Inbound),
    LinkClosed,
    User(UserIntent),
    Media { generation: u64, event: MediaEvent },
    Completed { generation: u64, outcome: Outcome },
}

/// Local media plus the session it was attached to.
pub struct Prepared {
    media: Arc<dyn MediaSession>,
    local: LocalMedia,
}

impl Prepared {
    async fn release(self) {
        self.local.stop_all();
        if let Err(err) = self.media.close().await {
            warn!("Failed to close media session: {}", err);
        }
    }
}

impl fmt::Debug for Prepared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prepared")
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

/// Result of a spawned job.
#[derive(Debug)]
pub enum Outcome {
    Prepared(Result<Prepared>),
    OfferCreated(Result<String>),
    AnswerCreated(Result<String>),
    AnswerApplied(Result<()>),
    CandidatesAdded { added: usize, failed: usize },
}

type Retirement = Shared<BoxFuture<'static, ()>>;

struct CallSession {
    peer: PeerInfo,
    role: Role,
    phase: Phase,
    generation: u64,
    media: Option<Arc<dyn MediaSession>>,
    local: Option<LocalMedia>,
    /// Received before the remote description was applied.
    remote_candidates: Vec<IceCandidate>,
    /// Gathered before our own description went out.
    local_candidates: Vec<IceCandidate>,
    remote_described: bool,
    local_described: bool,
    describing: bool,
    invite_sent: bool,
}

impl CallSession {
    fn new(peer: PeerInfo, role: Role, phase: Phase, generation: u64) -> Self {
        Self {
            peer,
            role,
            phase,
            generation,
            media: None,
            local: None,
            remote_candidates: Vec::new(),
            local_candidates: Vec::new(),
            remote_described: false,
            local_described: false,
            describing: false,
            invite_sent: false,
        }
    }
}

/// Everything the controller talks to.
pub struct Collaborators {
    pub link: Arc<dyn SignalSink>,
    pub media: Arc<dyn MediaFactory>,
    pub prompts: Box<dyn CallPrompts>,
    pub view: Box<dyn CallView>,
    pub presence: Box<dyn PresenceView>,
}

pub struct CallController {
    identity: Option<SelfIdentity>,
    display_name: String,
    names: Option<NamePreference>,
    presence: PresenceSet,
    presence_view: Box<dyn PresenceView>,
    prompts: PromptTracker,
    view: Box<dyn CallView>,
    link: Arc<dyn SignalSink>,
    factory: Arc<dyn MediaFactory>,
    constraints: MediaConstraints,
    session: Option<CallSession>,
    next_generation: u64,
    jobs_in_flight: usize,
    retiring: Option<Retirement>,
    stopped: bool,
    events: mpsc::UnboundedSender<Event>,
}

impl CallController {
    pub fn new(
        config: &ClientConfig,
        collaborators: Collaborators,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            identity: None,
            display_name: config.display_name.clone(),
            names: None,
            presence: PresenceSet::new(),
            presence_view: collaborators.presence,
            prompts: PromptTracker::new(collaborators.prompts),
            view: collaborators.view,
            link: collaborators.link,
            factory: collaborators.media,
            constraints: config.media,
            session: None,
            next_generation: 0,
            jobs_in_flight: 0,
            retiring: None,
            stopped: false,
            events,
        }
    }

    /// Persist accepted display-name changes.
    pub fn with_name_preference(mut self, names: NamePreference) -> Self {
        self.names = Some(names);
        self
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle::new(self.events.clone())
    }

    pub fn phase(&self) -> Phase {
        self.session.as_ref().map_or(Phase::Idle, |s| s.phase)
    }

    pub fn role(&self) -> Option<Role> {
        self.session.as_ref().map(|s| s.role)
    }

    pub fn peer(&self) -> Option<&PeerInfo> {
        self.session.as_ref().map(|s| &s.peer)
    }

    pub fn generation(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.generation)
    }

    pub fn identity(&self) -> Option<&SelfIdentity> {
        self.identity.as_ref()
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn presence(&self) -> &PresenceSet {
        &self.presence
    }

    /// Remote candidates waiting for the remote description.
    pub fn buffered_candidates(&self) -> usize {
        self.session
            .as_ref()
            .map_or(0, |s| s.remote_candidates.len())
    }

    pub fn has_media(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.media.is_some())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Process events until the link closes and every job has reported back.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        info!("Call controller started");
        while !self.finished() {
            match rx.recv().await {
                Some(event) => self.dispatch(event),
                None => break,
            }
        }
        if let Some(retiring) = self.retiring.take() {
            retiring.await;
        }
        info!("Call controller stopped");
    }

    /// Handle queued events until nothing is in flight, then wait for media
    /// sessions being closed.
    pub async fn settle(&mut self, rx: &mut mpsc::UnboundedReceiver<Event>) {
        loop {
            while let Ok(event) = rx.try_recv() {
                self.dispatch(event);
            }
            if self.jobs_in_flight == 0 {
                break;
            }
            match rx.recv().await {
                Some(event) => self.dispatch(event),
                None => break,
            }
        }
        if let Some(retiring) = self.retiring.clone() {
            retiring.await;
        }
    }

    fn finished(&self) -> bool {
        self.stopped && self.jobs_in_flight == 0
    }

    pub fn dispatch(&mut self, event: Event) {
        match event {
            Event::Signal(msg) => self.on_signal(msg),
            Event::LinkClosed => self.on_link_closed(),
            Event::User(intent) => self.on_user(intent),
            Event::Media { generation, event } => self.on_media(generation, event),
            Event::Completed {
                generation,
                outcome,
            } => {
                self.jobs_in_flight = self.jobs_in_flight.saturating_sub(1);
                self.on_completed(generation, outcome);
            }
        }
    }

    // ---- user intents ----

    fn on_user(&mut self, intent: UserIntent) {
        if self.stopped {
            warn!("Ignoring {:?}: signaling link is closed", intent);
            return;
        }
        match intent {
            UserIntent::Call(target) => self.place_call(target),
            UserIntent::Cancel => self.cancel(),
            UserIntent::Accept => self.accept(),
            UserIntent::Reject => self.reject(),
            UserIntent::End => self.end_call("hung up"),
            UserIntent::ChangeName(name) => self.change_name(&name),
            UserIntent::Quit => {
                self.end_call("quit");
                self.link.close();
            }
        }
    }

    fn place_call(&mut self, target: PeerId) {
        if let Some(session) = &self.session {
            warn!(
                "Cannot call {}: already {} with {}",
                target, session.phase, session.peer.id
            );
            return;
        }
        if self.identity.as_ref().is_some_and(|me| me.id == target) {
            warn!("Refusing to call ourselves");
            return;
        }
        let Some(peer) = self.presence.get(&target).cloned() else {
            warn!("Cannot call {}: peer is not present", target);
            return;
        };

        info!("Calling {} ({})", peer.label(), peer.id);
        let generation = self.begin_session(peer, Role::Caller, Phase::Calling);
        let job = self.prepare_media(generation);
        self.spawn_job(generation, async move { Outcome::Prepared(job.await) });
    }

    fn cancel(&mut self) {
        match self.session.as_ref().map(|s| (s.role, s.phase)) {
            Some((Role::Caller, Phase::Calling | Phase::Negotiating)) => {
                self.end_call("cancelled")
            }
            _ => debug!("No outgoing call to cancel"),
        }
    }

    fn accept(&mut self) {
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.phase == Phase::Ringing)
        else {
            debug!("No incoming call to accept");
            return;
        };
        session.phase = Phase::Negotiating;
        let generation = session.generation;
        info!("Accepted call from {}", session.peer.id);

        self.prompts.dismiss(PromptKind::Incoming);
        let job = self.prepare_media(generation);
        self.spawn_job(generation, async move { Outcome::Prepared(job.await) });
    }

    fn reject(&mut self) {
        if self.phase() == Phase::Ringing {
            self.end_call("rejected");
        } else {
            debug!("No incoming call to reject");
        }
    }

    /// Notify the peer in whatever way fits the current phase, then tear down.
    fn end_call(&mut self, reason: &str) {
        let Some(session) = &self.session else {
            debug!("No call to end");
            return;
        };
        let target = session.peer.id.clone();
        let notice = match session.phase {
            Phase::Calling if session.invite_sent => Some(Outbound::CancelCall { target }),
            Phase::Idle | Phase::Calling => None,
            Phase::Ringing => Some(Outbound::CallRejected { target }),
            Phase::Negotiating | Phase::Active => Some(Outbound::CallEnded { target }),
        };
        if let Some(msg) = notice {
            self.send(msg);
        }
        self.teardown(reason);
    }

    fn change_name(&mut self, raw: &str) {
        let name = match validate_display_name(raw) {
            Ok(name) => name,
            Err(err) => {
                warn!("Rejected display name: {}", err);
                return;
            }
        };
        if name == self.display_name {
            debug!("Display name unchanged");
            return;
        }

        info!("Display name changed to {}", name);
        self.display_name = name.clone();
        if let Some(identity) = self.identity.as_mut() {
            identity.name = name.clone();
        }
        if let Some(names) = &self.names {
            if let Err(err) = names.save(&name) {
                warn!("Failed to save display name: {}", err);
            }
        }
        self.send(Outbound::ChangeName { name });
    }

    // ---- relay messages ----

    fn on_signal(&mut self, msg: Inbound) {
        if self.stopped {
            return;
        }
        let kind = msg.kind();
        let origin = msg.origin().cloned();
        let caller = msg.incoming_caller();
        debug!("<- {}", kind);

        match msg {
            Inbound::SelfId { user_id } => self.on_self_id(user_id),
            Inbound::UsersList { users } => {
                self.presence.replace(users);
                self.presence_view.render(self.presence.peers());
                if self
                    .session
                    .as_ref()
                    .is_some_and(|s| !self.presence.contains(&s.peer.id))
                {
                    self.teardown("peer left");
                }
            }
            Inbound::UserJoined { user } => {
                if self.presence.add(user.clone()) {
                    self.presence_view.peer_added(&user);
                }
            }
            Inbound::UserLeft { user_id } => self.on_user_left(user_id),
            Inbound::IncomingCall { .. } => self.on_incoming_call(caller),
            Inbound::CancelCall { .. } => {
                match self.current_from(origin.as_ref()).map(|s| (s.role, s.phase)) {
                    Some((Role::Callee, Phase::Ringing | Phase::Negotiating)) => {
                        self.teardown("cancelled by caller")
                    }
                    _ => self.ignore(kind),
                }
            }
            Inbound::CallRejected { .. } => {
                match self.current_from(origin.as_ref()).map(|s| (s.role, s.phase)) {
                    Some((Role::Caller, Phase::Calling)) => self.teardown("rejected by callee"),
                    _ => self.ignore(kind),
                }
            }
            Inbound::Offer { sdp, .. } => self.on_offer(origin.as_ref(), sdp),
            Inbound::Answer { sdp, .. } => self.on_answer(origin.as_ref(), sdp),
            Inbound::IceCandidate { candidate, .. } => {
                self.on_remote_candidate(origin.as_ref(), candidate)
            }
            Inbound::CallEnded { .. } => {
                if self.current_from(origin.as_ref()).is_some() {
                    self.teardown("ended by peer");
                } else {
                    self.ignore(kind);
                }
            }
            Inbound::Error { message, details } => {
                warn!(
                    "Relay error: {} {}",
                    message.as_deref().unwrap_or("unspecified"),
                    details.map(|d| d.to_string()).unwrap_or_default()
                );
                self.teardown("relay error");
            }
            Inbound::Unknown => debug!("Ignoring unknown relay message"),
        }
    }

    fn ignore(&self, kind: &str) {
        warn!("Ignoring {} in phase {}", kind, self.phase());
    }

    /// Current session, provided `origin` (when given) is its peer.
    fn current_from(&self, origin: Option<&PeerId>) -> Option<&CallSession> {
        let session = self.session.as_ref()?;
        match origin {
            Some(id) if *id != session.peer.id => None,
            _ => Some(session),
        }
    }

    fn current_from_mut(&mut self, origin: Option<&PeerId>) -> Option<&mut CallSession> {
        let session = self.session.as_mut()?;
        match origin {
            Some(id) if *id != session.peer.id => None,
            _ => Some(session),
        }
    }

    fn on_self_id(&mut self, user_id: PeerId) {
        info!("Relay assigned id {}", user_id);
        if self.presence.set_self(user_id.clone()) {
            self.presence_view.peer_removed(&user_id);
        }
        self.identity = Some(SelfIdentity {
            id: user_id,
            name: self.display_name.clone(),
        });
    }

    fn on_user_left(&mut self, user_id: PeerId) {
        if self.presence.remove(&user_id) {
            self.presence_view.peer_removed(&user_id);
        }
        if self.session.as_ref().is_some_and(|s| s.peer.id == user_id) {
            self.teardown("peer left");
        }
    }

    fn on_incoming_call(&mut self, caller: Option<PeerInfo>) {
        let Some(mut caller) = caller else {
            warn!("incoming_call without a caller");
            return;
        };
        if self.identity.as_ref().is_some_and(|me| me.id == caller.id) {
            warn!("Ignoring incoming_call from ourselves");
            return;
        }
        if caller.name.is_empty() {
            if let Some(known) = self.presence.get(&caller.id) {
                caller.name = known.name.clone();
            }
        }
        if self.yields_to(&caller.id) {
            info!("Crossed invites with {}, answering theirs", caller.id);
            self.teardown("crossed invites");
        }
        if let Some(session) = &self.session {
            if session.peer.id == caller.id {
                debug!("Duplicate invite from {}", caller.id);
            } else {
                info!("Busy, rejecting call from {}", caller.id);
                self.send(Outbound::CallRejected { target: caller.id });
            }
            return;
        }

        info!("Incoming call from {} ({})", caller.label(), caller.id);
        self.prompts.show_incoming(&caller);
        self.begin_session(caller, Role::Callee, Phase::Ringing);
    }

    /// Both sides invited each other. The lower id drops its own invite and
    /// takes the incoming one; the higher id keeps calling.
    fn yields_to(&self, caller: &PeerId) -> bool {
        let Some(me) = &self.identity else {
            return false;
        };
        self.session.as_ref().is_some_and(|s| {
            s.role == Role::Caller
                && s.phase == Phase::Calling
                && s.peer.id == *caller
                && me.id < *caller
        })
    }

    fn on_offer(&mut self, origin: Option<&PeerId>, sdp: String) {
        let Some(session) = self
            .current_from_mut(origin)
            .filter(|s| s.role == Role::Caller && s.phase == Phase::Calling)
        else {
            self.ignore("offer");
            return;
        };
        let Some(media) = session.media.clone() else {
            warn!("Offer arrived before local media was ready");
            return;
        };
        session.phase = Phase::Negotiating;
        session.describing = true;
        let generation = session.generation;
        info!("Offer from {}, answering", session.peer.id);

        self.spawn_job(generation, async move {
            Outcome::AnswerCreated(answer_offer(media, sdp).await)
        });
    }

    fn on_answer(&mut self, origin: Option<&PeerId>, sdp: String) {
        let Some(session) = self.current_from_mut(origin).filter(|s| {
            s.role == Role::Callee
                && s.phase == Phase::Negotiating
                && s.local_described
                && !s.remote_described
                && !s.describing
        }) else {
            self.ignore("answer");
            return;
        };
        let Some(media) = session.media.clone() else {
            return;
        };
        session.describing = true;
        let generation = session.generation;
        debug!("Applying answer from {}", session.peer.id);

        self.spawn_job(generation, async move {
            let result = media
                .set_remote_description(SessionDescription::answer(sdp))
                .await;
            Outcome::AnswerApplied(result)
        });
    }

    fn on_remote_candidate(&mut self, origin: Option<&PeerId>, candidate: IceCandidate) {
        let Some(session) = self.current_from_mut(origin) else {
            self.ignore("ice_candidate");
            return;
        };
        match session.media.clone() {
            Some(media) if session.remote_described => {
                let generation = session.generation;
                self.add_candidates(generation, media, vec![candidate]);
            }
            _ => {
                session.remote_candidates.push(candidate);
                debug!(
                    "Buffered remote candidate ({} pending)",
                    session.remote_candidates.len()
                );
            }
        }
    }

    // ---- media notifications ----

    fn on_media(&mut self, generation: u64, event: MediaEvent) {
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.generation == generation)
        else {
            debug!("Dropping media event from stale session {}", generation);
            return;
        };

        match event {
            MediaEvent::IceCandidate(candidate) => {
                if !session.local_described {
                    session.local_candidates.push(candidate);
                    return;
                }
                let target = session.peer.id.clone();
                self.send(Outbound::IceCandidate { candidate, target });
            }
            MediaEvent::ConnectionState(state) => self.on_connection_state(state),
            MediaEvent::RemoteTrack(track) => {
                info!("Remote {:?} track {} arrived", track.kind, track.id);
                self.view.remote_track(&track);
            }
        }
    }

    fn on_connection_state(&mut self, state: ConnectionState) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        debug!("Media connection {:?} in phase {}", state, session.phase);
        match (state, session.phase) {
            (ConnectionState::Connected, Phase::Negotiating) => {
                session.phase = Phase::Active;
                info!("Call with {} is active", session.peer.id);
                self.prompts.dismiss_all();
                self.view.switch_scene(Scene::Call);
            }
            (ConnectionState::Failed, Phase::Negotiating | Phase::Active) => {
                warn!("Media connection failed");
                self.end_call("media connection failed");
            }
            _ => {}
        }
    }

    // ---- job results ----

    fn on_completed(&mut self, generation: u64, outcome: Outcome) {
        if self.generation() != Some(generation) {
            debug!("Discarding result of stale session {}", generation);
            if let Outcome::Prepared(Ok(prepared)) = outcome {
                prepared.local.stop_all();
                self.retire(prepared.media);
            }
            return;
        }

        match outcome {
            Outcome::Prepared(result) => self.on_prepared(result),
            Outcome::OfferCreated(result) => self.on_offer_created(result),
            Outcome::AnswerCreated(result) => self.on_answer_created(result),
            Outcome::AnswerApplied(result) => self.on_answer_applied(result),
            Outcome::CandidatesAdded { added, failed } => {
                debug!("Added {} remote candidates ({} failed)", added, failed)
            }
        }
    }

    fn on_prepared(&mut self, result: Result<Prepared>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let role = session.role;
        let prepared = match result {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!("Local media unavailable: {}", err);
                match role {
                    Role::Caller => self.session = None,
                    Role::Callee => {
                        let target = session.peer.id.clone();
                        self.send(Outbound::CallRejected { target });
                        self.teardown("local media unavailable");
                    }
                }
                return;
            }
        };

        let media = prepared.media.clone();
        session.media = Some(prepared.media);
        session.local = Some(prepared.local);
        match role {
            Role::Caller => {
                session.invite_sent = true;
                let peer = session.peer.clone();
                self.send(Outbound::IncomingCall {
                    target: peer.id.clone(),
                });
                self.prompts.show_outgoing(&peer);
            }
            Role::Callee => {
                session.describing = true;
                let generation = session.generation;
                self.spawn_job(generation, async move {
                    Outcome::OfferCreated(create_offer(media).await)
                });
            }
        }
    }

    fn on_offer_created(&mut self, result: Result<String>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.describing = false;
        match result {
            Ok(sdp) => {
                session.local_described = true;
                let target = session.peer.id.clone();
                self.send(Outbound::Offer { sdp, target });
                self.flush_local_candidates();
            }
            Err(err) => {
                warn!("Failed to create offer: {}", err);
                self.end_call("negotiation failed");
            }
        }
    }

    fn on_answer_created(&mut self, result: Result<String>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.describing = false;
        match result {
            Ok(sdp) => {
                session.remote_described = true;
                session.local_described = true;
                let target = session.peer.id.clone();
                self.send(Outbound::Answer { sdp, target });
                self.flush_local_candidates();
                self.flush_remote_candidates();
            }
            Err(err) => {
                warn!("Failed to answer offer: {}", err);
                self.end_call("negotiation failed");
            }
        }
    }

    fn on_answer_applied(&mut self, result: Result<()>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.describing = false;
        match result {
            Ok(()) => {
                session.remote_described = true;
                self.flush_remote_candidates();
            }
            Err(err) => {
                warn!("Failed to apply answer: {}", err);
                self.end_call("negotiation failed");
            }
        }
    }

    fn flush_local_candidates(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let candidates = std::mem::take(&mut session.local_candidates);
        let target = session.peer.id.clone();
        for candidate in candidates {
            self.send(Outbound::IceCandidate {
                candidate,
                target: target.clone(),
            });
        }
    }

    fn flush_remote_candidates(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(media) = session.media.clone() else {
            return;
        };
        if session.remote_candidates.is_empty() {
            return;
        }
        let candidates = std::mem::take(&mut session.remote_candidates);
        let generation = session.generation;
        debug!("Applying {} buffered remote candidates", candidates.len());
        self.add_candidates(generation, media, candidates);
    }

    fn add_candidates(
        &mut self,
        generation: u64,
        media: Arc<dyn MediaSession>,
        candidates: Vec<IceCandidate>,
    ) {
        self.spawn_job(generation, async move {
            let (mut added, mut failed) = (0, 0);
            for candidate in candidates {
                match media.add_ice_candidate(candidate).await {
                    Ok(()) => added += 1,
                    Err(err) => {
                        warn!("Failed to add ICE candidate: {}", err);
                        failed += 1;
                    }
                }
            }
            Outcome::CandidatesAdded { added, failed }
        });
    }

    // ---- lifecycle ----

    fn on_link_closed(&mut self) {
        if self.stopped {
            return;
        }
        warn!("Signaling link closed");
        self.teardown("link closed");
        self.identity = None;
        self.presence.clear();
        self.presence_view.render(&[]);
        self.stopped = true;
    }

    fn begin_session(&mut self, peer: PeerInfo, role: Role, phase: Phase) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        debug!("Session {} starts as {:?} in phase {}", generation, role, phase);
        self.session = Some(CallSession::new(peer, role, phase, generation));
        generation
    }

    /// Discard the current session and release everything it holds.
    /// Does nothing when there is no session.
    fn teardown(&mut self, reason: &str) {
        let Some(session) = self.session.take() else {
            return;
        };
        info!(
            "Call with {} over in phase {}: {}",
            session.peer.id, session.phase, reason
        );

        self.prompts.dismiss_all();
        if let Some(local) = &session.local {
            let stopped = local.stop_all();
            debug!("Stopped {} local tracks", stopped);
        }
        if let Some(media) = session.media {
            self.retire(media);
        }
        self.view.switch_scene(Scene::Start);
    }

    /// Close `media` after every earlier retirement has finished.
    fn retire(&mut self, media: Arc<dyn MediaSession>) {
        let previous = self.retiring.take();
        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                previous.await;
            }
            if let Err(err) = media.close().await {
                warn!("Failed to close media session: {}", err);
            }
        });
        self.retiring = Some(
            async move {
                let _ = task.await;
            }
            .boxed()
            .shared(),
        );
    }

    /// Capture local media, then open a media session once the previous one
    /// has closed.
    fn prepare_media(
        &self,
        generation: u64,
    ) -> impl Future<Output = Result<Prepared>> + Send + 'static {
        let factory = self.factory.clone();
        let constraints = self.constraints;
        let sink = MediaEventSink::new(generation, self.events.clone());
        let gate = self.retiring.clone();

        async move {
            let local = factory.acquire_local_media(constraints).await?;
            if let Some(gate) = gate {
                gate.await;
            }
            let media = match factory.open(sink).await {
                Ok(media) => media,
                Err(err) => {
                    local.stop_all();
                    return Err(err);
                }
            };
            let tracks = local.tracks().to_vec();
            let prepared = Prepared { media, local };
            for track in tracks {
                if let Err(err) = prepared.media.add_local_track(track).await {
                    prepared.release().await;
                    return Err(err);
                }
            }
            Ok(prepared)
        }
    }

    fn spawn_job<F>(&mut self, generation: u64, job: F)
    where
        F: Future<Output = Outcome> + Send + 'static,
    {
        let events = self.events.clone();
        self.jobs_in_flight += 1;
        tokio::spawn(async move {
            let outcome = job.await;
            let _ = events.send(Event::Completed {
                generation,
                outcome,
            });
        });
    }

    fn send(&self, msg: Outbound) {
        debug!("-> {} to {:?}", msg.kind(), msg.target());
        if !self.link.send(msg) {
            warn!("Dropped outbound message: signaling link is closed");
        }
    }
}

async fn create_offer(media: Arc<dyn MediaSession>) -> Result<String> {
    let offer = media.create_offer().await?;
    media.set_local_description(offer.clone()).await?;
    Ok(offer.sdp)
}

async fn answer_offer(media: Arc<dyn MediaSession>, sdp: String) -> Result<String> {
    media
        .set_remote_description(SessionDescription::offer(sdp))
        .await?;
    let answer = media.create_answer().await?;
    media.set_local_description(answer.clone()).await?;
    Ok(answer.sdp)
}

/// Cloneable handle for raising user intents from any task or thread.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl ControllerHandle {
    pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx }
    }

    fn intent(&self, intent: UserIntent) -> Result<()> {
        self.tx
            .send(Event::User(intent))
            .map_err(|_| Error::internal("call controller has stopped"))
    }

    pub fn call(&self, peer: impl Into<PeerId>) -> Result<()> {
        self.intent(UserIntent::Call(peer.into()))
    }

    pub fn cancel(&self) -> Result<()> {
        self.intent(UserIntent::Cancel)
    }

    pub fn accept(&self) -> Result<()> {
        self.intent(UserIntent::Accept)
    }

    pub fn reject(&self) -> Result<()> {
        self.intent(UserIntent::Reject)
    }

    pub fn end(&self) -> Result<()> {
        self.intent(UserIntent::End)
    }

    pub fn quit(&self) -> Result<()> {
        self.intent(UserIntent::Quit)
    }

    /// Validates before queueing, so the caller can report bad names.
    pub fn change_name(&self, raw: &str) -> Result<String> {
        let name = validate_display_name(raw)?;
        self.intent(UserIntent::ChangeName(name.clone()))?;
        Ok(name)
    }
}
