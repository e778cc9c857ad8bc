use clap::Parser;
use peerline_client::{
    default_ice_servers, open_link, CallController, CallPrompts, CallView, ClientConfig,
    Collaborators, ControllerHandle, IceServerConfig, MediaConstraints, NamePreference,
    PresenceView, RemoteTrack, RtcMediaFactory, Scene, SignalSink, DEFAULT_SIGNALING_URL,
};
use peerline_common::helpers::validate_display_name;
use peerline_common::{PeerId, PeerInfo};
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

const USAGE: &str = "Commands: users, call <id|#n>, accept, reject, cancel, end, name <x>, quit";

#[derive(Parser, Debug)]
#[command(name = "peerline-client")]
struct Args {
    /// Signaling relay address (ws:// or wss://)
    #[arg(long, env = "PEERLINE_SIGNALING_URL", default_value = DEFAULT_SIGNALING_URL)]
    url: String,
    /// Display name for this session (saved to the preference file)
    #[arg(long)]
    name: Option<String>,
    /// Where the display-name preference lives
    #[arg(long, default_value = "peerline-name.json")]
    prefs: PathBuf,
    /// ICE server URL (repeatable); replaces the default STUN list
    #[arg(long = "ice-server", value_name = "URL")]
    ice_servers: Vec<String>,
    #[arg(long, env = "PEERLINE_TURN_USERNAME")]
    turn_username: Option<String>,
    #[arg(long, env = "PEERLINE_TURN_CREDENTIAL")]
    turn_credential: Option<String>,
    /// Send audio only
    #[arg(long, default_value_t = false)]
    no_video: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Users,
    Call(String),
    Accept,
    Reject,
    Cancel,
    End,
    Name(String),
    Help,
    Quit,
}

fn parse_command(line: &str) -> Result<Command, String> {
    let trimmed = line.trim();
    let (verb, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (trimmed, ""),
    };

    let command = match verb {
        "" => return Err("empty command".into()),
        "users" | "ls" => Command::Users,
        "call" if rest.is_empty() => return Err("usage: call <id|#index>".into()),
        "call" => Command::Call(rest.to_string()),
        "accept" => Command::Accept,
        "reject" => Command::Reject,
        "cancel" => Command::Cancel,
        "end" | "hangup" => Command::End,
        "name" if rest.is_empty() => return Err("usage: name <new name>".into()),
        "name" => Command::Name(rest.to_string()),
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command `{}` (try `help`)", other)),
    };
    Ok(command)
}

/// `#N` picks the N-th listed peer (1-based), anything else is an id.
fn resolve_target(target: &str, roster: &[PeerInfo]) -> Result<PeerId, String> {
    match target.strip_prefix('#') {
        Some(index) => {
            let index: usize = index
                .parse()
                .map_err(|_| format!("`{}` is not a list position", target))?;
            index
                .checked_sub(1)
                .and_then(|i| roster.get(i))
                .map(|peer| peer.id.clone())
                .ok_or_else(|| format!("no peer at position {}", index))
        }
        None => Ok(PeerId::new(target)),
    }
}

fn print_roster(roster: &[PeerInfo]) {
    if roster.is_empty() {
        println!("No one else is online.");
        return;
    }
    for (i, peer) in roster.iter().enumerate() {
        println!("  #{} {} ({})", i + 1, peer.label(), peer.id);
    }
}

struct TerminalPrompts;

impl CallPrompts for TerminalPrompts {
    fn show_outgoing(&mut self, callee: &PeerInfo) {
        println!("Calling {}... (`cancel` to hang up)", callee.label());
    }

    fn dismiss_outgoing(&mut self) {}

    fn show_incoming(&mut self, caller: &PeerInfo) {
        println!("Incoming call from {}: `accept` or `reject`", caller.label());
    }

    fn dismiss_incoming(&mut self) {}
}

struct TerminalView;

impl CallView for TerminalView {
    fn switch_scene(&mut self, scene: Scene) {
        match scene {
            Scene::Call => println!("Call connected. `end` to hang up."),
            Scene::Start => println!("No call in progress."),
        }
    }

    fn remote_track(&mut self, track: &RemoteTrack) {
        println!("Receiving {:?} from the peer", track.kind);
    }
}

struct TerminalPresence {
    roster: Vec<PeerInfo>,
    published: watch::Sender<Vec<PeerInfo>>,
}

impl TerminalPresence {
    fn publish(&self) {
        self.published.send_replace(self.roster.clone());
    }
}

impl PresenceView for TerminalPresence {
    fn render(&mut self, peers: &[PeerInfo]) {
        self.roster = peers.to_vec();
        self.publish();
        print_roster(&self.roster);
    }

    fn peer_added(&mut self, peer: &PeerInfo) {
        println!("{} is online", peer.label());
        self.roster.push(peer.clone());
        self.publish();
    }

    fn peer_removed(&mut self, id: &PeerId) {
        if let Some(peer) = self.roster.iter().find(|p| &p.id == id) {
            println!("{} left", peer.label());
        }
        self.roster.retain(|p| &p.id != id);
        self.publish();
    }
}

fn ice_servers(args: &Args) -> Vec<IceServerConfig> {
    if args.ice_servers.is_empty() {
        return default_ice_servers();
    }
    args.ice_servers
        .iter()
        .map(|url| {
            let mut server = IceServerConfig::stun(url.clone());
            if url.starts_with("turn") {
                server.username = args.turn_username.clone();
                server.credential = args.turn_credential.clone();
            }
            server
        })
        .collect()
}

fn spawn_stdin(handle: ControllerHandle, roster: watch::Receiver<Vec<PeerInfo>>) {
    std::thread::spawn(move || {
        eprintln!("{}", USAGE);
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    eprintln!("stdin read error: {}", err);
                    break;
                }
            };
            let command = match parse_command(&line) {
                Ok(command) => command,
                Err(err) => {
                    if !line.trim().is_empty() {
                        eprintln!("{}", err);
                    }
                    continue;
                }
            };

            let sent = match command {
                Command::Users => {
                    print_roster(&roster.borrow());
                    Ok(())
                }
                Command::Call(target) => match resolve_target(&target, &roster.borrow()) {
                    Ok(peer) => handle.call(peer),
                    Err(err) => {
                        eprintln!("{}", err);
                        Ok(())
                    }
                },
                Command::Accept => handle.accept(),
                Command::Reject => handle.reject(),
                Command::Cancel => handle.cancel(),
                Command::End => handle.end(),
                Command::Name(name) => match handle.change_name(&name) {
                    Ok(name) => {
                        println!("Display name set to {}", name);
                        Ok(())
                    }
                    Err(err @ peerline_common::Error::Validation(_)) => {
                        eprintln!("{}", err);
                        Ok(())
                    }
                    Err(err) => Err(err),
                },
                Command::Help => {
                    eprintln!("{}", USAGE);
                    Ok(())
                }
                Command::Quit => {
                    if let Err(err) = handle.quit() {
                        eprintln!("{}", err);
                    }
                    break;
                }
            };
            if let Err(err) = sent {
                eprintln!("{}", err);
                break;
            }
        }
    });
}

fn main() -> anyhow::Result<()> {
    peerline_common::init_tracing();
    let args = Args::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let prefs = NamePreference::new(&args.prefs);
    let display_name = match &args.name {
        Some(name) => {
            let name = validate_display_name(name)?;
            prefs.save(&name)?;
            name
        }
        None => prefs.load_or_init()?,
    };

    let config = ClientConfig {
        signaling_url: args.url.clone(),
        display_name,
        ice_servers: ice_servers(&args),
        media: MediaConstraints {
            audio: true,
            video: !args.no_video,
        },
    };
    info!(
        "Starting as \"{}\" with {} ICE servers",
        config.display_name,
        config.ice_servers.len()
    );

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (link, link_task) =
        open_link(&config.signaling_url, &config.display_name, events_tx.clone()).await?;

    let (roster_tx, roster_rx) = watch::channel(Vec::new());
    let collaborators = Collaborators {
        link: Arc::new(link.clone()),
        media: Arc::new(RtcMediaFactory::new(config.ice_servers.clone())),
        prompts: Box::new(TerminalPrompts),
        view: Box::new(TerminalView),
        presence: Box::new(TerminalPresence {
            roster: Vec::new(),
            published: roster_tx,
        }),
    };
    let controller =
        CallController::new(&config, collaborators, events_tx).with_name_preference(prefs);

    spawn_stdin(controller.handle(), roster_rx);

    let interrupt = controller.handle();
    let fallback = link.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, hanging up and closing signaling link");
            if interrupt.quit().is_err() {
                fallback.close();
            }
        }
    });

    controller.run(events_rx).await;
    if let Err(err) = link_task.await {
        warn!("Signaling task ended abnormally: {}", err);
    }
    Ok(())
}
