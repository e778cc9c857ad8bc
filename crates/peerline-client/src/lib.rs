pub mod controller;
pub mod media;
pub mod prefs;
pub mod presence;
pub mod prompt;
pub mod rtc;
pub mod signaling;
pub mod types;

pub use controller::{CallController, Collaborators, ControllerHandle, Event, Outcome, UserIntent};
pub use media::{
    ConnectionState, LocalMedia, LocalTrack, MediaEvent, MediaEventSink, MediaFactory,
    MediaSession, RemoteTrack, SdpKind, SessionDescription, TrackKind,
};
pub use prefs::NamePreference;
pub use presence::{PresenceSet, PresenceView};
pub use prompt::{CallPrompts, CallView, PromptKind, PromptTracker, Scene};
pub use rtc::{RtcMediaFactory, RtcMediaSession};
pub use signaling::{open_link, signaling_url, LinkHandle, SignalSink, SignalingClient};
pub use types::{
    default_ice_servers, ClientConfig, IceServerConfig, MediaConstraints, Phase, Role,
    SelfIdentity, DEFAULT_SIGNALING_URL,
};
