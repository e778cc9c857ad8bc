//! In-memory collaborators for driving a `CallController` without a relay,
//! a network or capture devices.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use peerline_client::{
    CallController, CallPrompts, CallView, ClientConfig, Collaborators, Event, LocalMedia,
    LocalTrack, MediaConstraints, MediaEvent, MediaEventSink, MediaFactory, MediaSession,
    PresenceView, RemoteTrack, Scene, SessionDescription, SignalSink, TrackKind, UserIntent,
};
use peerline_common::{Error, IceCandidate, Inbound, Outbound, PeerId, PeerInfo, Result};

#[derive(Default)]
pub struct FakeLink {
    log: Mutex<Vec<Outbound>>,
    undelivered: Mutex<Vec<Outbound>>,
    closed: AtomicBool,
}

impl FakeLink {
    pub fn sent(&self) -> Vec<Outbound> {
        self.log.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.log.lock().unwrap().iter().map(|m| m.kind()).collect()
    }

    pub fn take_undelivered(&self) -> Vec<Outbound> {
        std::mem::take(&mut *self.undelivered.lock().unwrap())
    }
}

impl SignalSink for FakeLink {
    fn send(&self, msg: Outbound) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.log.lock().unwrap().push(msg.clone());
        self.undelivered.lock().unwrap().push(msg);
        true
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub fn local_candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

pub struct FakeSession {
    pub sink: MediaEventSink,
    pub calls: Mutex<Vec<String>>,
    pub candidates: Mutex<Vec<IceCandidate>>,
    pub tracks: Mutex<Vec<Arc<LocalTrack>>>,
    pub closes: AtomicUsize,
    pub fail_offer: bool,
}

impl FakeSession {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.lock().unwrap().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closes.load(Ordering::SeqCst) > 0
    }

    pub fn emit(&self, event: MediaEvent) {
        self.sink.emit(event);
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl MediaSession for FakeSession {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.record("create_offer".into());
        if self.fail_offer {
            return Err(Error::media("offer generation failed"));
        }
        Ok(SessionDescription::offer(format!(
            "offer-{}",
            self.sink.generation()
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record("create_answer".into());
        Ok(SessionDescription::answer(format!(
            "answer-{}",
            self.sink.generation()
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.record(format!("set_local:{}", desc.sdp));
        // Gathering starts once the local description is set.
        self.sink
            .emit(MediaEvent::IceCandidate(local_candidate(self.sink.generation() as u32)));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.record(format!("set_remote:{}", desc.sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn add_local_track(&self, track: Arc<LocalTrack>) -> Result<()> {
        self.tracks.lock().unwrap().push(track);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeFactory {
    pub fail_acquire: AtomicBool,
    pub fail_offer: AtomicBool,
    pub acquired: Mutex<Vec<LocalMedia>>,
    pub sessions: Mutex<Vec<Arc<FakeSession>>>,
    /// Set when a session opened while an earlier one was still open.
    pub overlapped: AtomicBool,
}

impl FakeFactory {
    pub fn acquisitions(&self) -> usize {
        self.acquired.lock().unwrap().len()
    }

    pub fn opened(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn session(&self, index: usize) -> Arc<FakeSession> {
        self.sessions.lock().unwrap()[index].clone()
    }

    pub fn last_session(&self) -> Arc<FakeSession> {
        self.sessions
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no media session was opened")
    }

    pub fn media(&self, index: usize) -> LocalMedia {
        self.acquired.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl MediaFactory for FakeFactory {
    async fn acquire_local_media(&self, constraints: MediaConstraints) -> Result<LocalMedia> {
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(Error::media("camera permission denied"));
        }
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(LocalTrack::new("mic", TrackKind::Audio)));
        }
        if constraints.video {
            tracks.push(Arc::new(LocalTrack::new("cam", TrackKind::Video)));
        }
        let media = LocalMedia::new(tracks);
        self.acquired.lock().unwrap().push(media.clone());
        Ok(media)
    }

    async fn open(&self, sink: MediaEventSink) -> Result<Arc<dyn MediaSession>> {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.iter().any(|s| !s.is_closed()) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        let session = Arc::new(FakeSession {
            sink,
            calls: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            fail_offer: self.fail_offer.load(Ordering::SeqCst),
        });
        sessions.push(session.clone());
        Ok(session)
    }
}

/// Everything the UI collaborators were asked to do, in order.
#[derive(Clone, Default)]
pub struct UiLog(Arc<Mutex<Vec<String>>>);

impl UiLog {
    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == entry).count()
    }

    fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }
}

impl CallPrompts for UiLog {
    fn show_outgoing(&mut self, callee: &PeerInfo) {
        self.push(format!("show_outgoing:{}", callee.id));
    }

    fn dismiss_outgoing(&mut self) {
        self.push("dismiss_outgoing".into());
    }

    fn show_incoming(&mut self, caller: &PeerInfo) {
        self.push(format!("show_incoming:{}", caller.id));
    }

    fn dismiss_incoming(&mut self) {
        self.push("dismiss_incoming".into());
    }
}

impl CallView for UiLog {
    fn switch_scene(&mut self, scene: Scene) {
        self.push(format!("scene:{:?}", scene));
    }

    fn remote_track(&mut self, track: &RemoteTrack) {
        self.push(format!("remote_track:{}", track.id));
    }
}

impl PresenceView for UiLog {
    fn render(&mut self, peers: &[PeerInfo]) {
        self.push(format!("render:{}", peers.len()));
    }

    fn peer_added(&mut self, peer: &PeerInfo) {
        self.push(format!("peer_added:{}", peer.id));
    }

    fn peer_removed(&mut self, id: &PeerId) {
        self.push(format!("peer_removed:{}", id));
    }
}

pub struct Harness {
    pub controller: CallController,
    pub rx: mpsc::UnboundedReceiver<Event>,
    pub link: Arc<FakeLink>,
    pub factory: Arc<FakeFactory>,
    pub ui: UiLog,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(&ClientConfig {
            display_name: "Tester".into(),
            ..Default::default()
        })
    }

    pub fn with_config(config: &ClientConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(FakeLink::default());
        let factory = Arc::new(FakeFactory::default());
        let ui = UiLog::default();
        let controller = CallController::new(
            config,
            Collaborators {
                link: link.clone(),
                media: factory.clone(),
                prompts: Box::new(ui.clone()),
                view: Box::new(ui.clone()),
                presence: Box::new(ui.clone()),
            },
            tx,
        );
        Self {
            controller,
            rx,
            link,
            factory,
            ui,
        }
    }

    pub async fn settle(&mut self) {
        self.controller.settle(&mut self.rx).await;
    }

    pub async fn signal(&mut self, msg: Value) {
        let msg: Inbound = serde_json::from_value(msg).expect("test message must decode");
        self.controller.dispatch(Event::Signal(msg));
        self.settle().await;
    }

    pub async fn user(&mut self, intent: UserIntent) {
        self.controller.dispatch(Event::User(intent));
        self.settle().await;
    }

    pub async fn media(&mut self, event: MediaEvent) {
        self.factory.last_session().emit(event);
        self.settle().await;
    }

    /// Handshake as `me` with `peers` already online.
    pub async fn online(&mut self, me: &str, peers: &[&str]) {
        self.signal(json!({"type": "self_id", "user_id": me})).await;
        let users: Vec<Value> = peers
            .iter()
            .map(|id| json!({"id": id, "name": format!("user-{id}")}))
            .collect();
        self.signal(json!({"type": "users_list", "users": users}))
            .await;
    }

    pub fn sent_offers(&self) -> usize {
        self.link
            .sent()
            .iter()
            .filter(|m| matches!(m, Outbound::Offer { .. }))
            .count()
    }
}

/// What the relay would deliver to the target of `msg` sent by `from`.
pub fn relayed(from: &PeerInfo, msg: &Outbound) -> Value {
    let mut value = serde_json::to_value(msg).expect("outbound encodes");
    let object = value.as_object_mut().expect("outbound is an object");
    object.remove("target");
    match msg {
        Outbound::IncomingCall { .. } => {
            object.insert("user".into(), json!({"id": from.id, "name": from.name}));
        }
        Outbound::CallRejected { .. } => {
            object.insert("callee".into(), json!(from.id));
        }
        _ => {
            object.insert("sender".into(), json!(from.id));
        }
    }
    value
}

/// Deliver everything `from` has sent to `to` until neither side has
/// anything left to say.
pub async fn exchange(a: (&PeerInfo, &mut Harness), b: (&PeerInfo, &mut Harness)) {
    let (a_info, a) = a;
    let (b_info, b) = b;
    loop {
        let to_b = a.link.take_undelivered();
        let to_a = b.link.take_undelivered();
        if to_a.is_empty() && to_b.is_empty() {
            break;
        }
        for msg in to_b {
            if msg.target() == Some(&b_info.id) {
                b.signal(relayed(a_info, &msg)).await;
            }
        }
        for msg in to_a {
            if msg.target() == Some(&a_info.id) {
                a.signal(relayed(b_info, &msg)).await;
            }
        }
    }
}
