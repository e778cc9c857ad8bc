//! Transport Link: the WebSocket connection to the signaling relay.

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use peerline_common::helpers::env_bool;
use peerline_common::{decode_inbound, encode_outbound, Error, Inbound, Outbound};

use crate::controller::Event;

/// Outbound half of the link as the controller sees it.
pub trait SignalSink: Send + Sync {
    /// Queue `msg`. Returns `false`, dropping it, once the link is closed.
    fn send(&self, msg: Outbound) -> bool;

    fn is_open(&self) -> bool;

    /// Close the link once everything already queued has gone out.
    fn close(&self);
}

/// Cloneable sender for a running link.
#[derive(Clone)]
pub struct LinkHandle {
    outbox: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl SignalSink for LinkHandle {
    fn send(&self, msg: Outbound) -> bool {
        if !self.is_open() {
            debug!("Link closed, dropping {}", msg.kind());
            return false;
        }
        self.outbox.send(msg).is_ok()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.shutdown.notify_one();
    }
}

fn insecure_signaling_allowed() -> bool {
    let production = std::env::var("PEERLINE_ENVIRONMENT")
        .map(|v| v.trim().eq_ignore_ascii_case("production"))
        .unwrap_or(false);
    !production || env_bool("PEERLINE_ALLOW_INSECURE_SIGNALING", false)
}

/// Validate the relay address and attach the display name the relay reads
/// at handshake.
pub fn signaling_url(base: &str, display_name: &str) -> peerline_common::Result<Url> {
    build_signaling_url(base, display_name, insecure_signaling_allowed())
}

fn build_signaling_url(
    base: &str,
    display_name: &str,
    allow_insecure: bool,
) -> peerline_common::Result<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| Error::config(format!("invalid signaling URL {}: {}", base, e)))?;
    match url.scheme() {
        "wss" => {}
        "ws" if allow_insecure => {}
        "ws" => {
            return Err(Error::config(
                "refusing ws:// signaling in production; use wss:// or set PEERLINE_ALLOW_INSECURE_SIGNALING=1",
            ))
        }
        other => {
            return Err(Error::config(format!(
                "unsupported signaling scheme {}",
                other
            )))
        }
    }
    url.query_pairs_mut().append_pair("username", display_name);
    Ok(url)
}

pub struct SignalingClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl SignalingClient {
    pub async fn connect(base: &str, display_name: &str) -> Result<Self> {
        let url = signaling_url(base, display_name)?;
        info!("Connecting to signaling relay: {}", base);
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(Error::transport)
            .with_context(|| format!("failed to connect to {}", base))?;
        Ok(Self { ws })
    }

    pub async fn send(&mut self, msg: &Outbound) -> Result<()> {
        let text = encode_outbound(msg)?;
        self.ws
            .send(Message::Text(text))
            .await
            .map_err(Error::transport)?;
        Ok(())
    }

    /// Next decodable relay message, or `None` once the relay closed.
    pub async fn recv(&mut self) -> Result<Option<Inbound>> {
        while let Some(frame) = self.ws.next().await {
            match frame.map_err(Error::transport)? {
                Message::Text(text) => match decode_inbound(&text) {
                    Ok(msg) => return Ok(Some(msg)),
                    Err(e) => warn!("Skipping undecodable relay frame: {}", e),
                },
                Message::Close(frame) => {
                    debug!("Relay closed the link: {:?}", frame);
                    return Ok(None);
                }
                _ => {}
            }
        }
        Ok(None)
    }

    /// Run the link in the background. Every inbound message becomes an
    /// [`Event::Signal`]; when the link ends for any reason a final
    /// [`Event::LinkClosed`] is delivered.
    pub fn spawn(self, events: mpsc::UnboundedSender<Event>) -> (LinkHandle, JoinHandle<()>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        let handle = LinkHandle {
            outbox,
            open: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(Notify::new()),
        };
        let task = tokio::spawn(self.pump(rx, handle.clone(), events));
        (handle, task)
    }

    async fn pump(
        mut self,
        mut outbox: mpsc::UnboundedReceiver<Outbound>,
        handle: LinkHandle,
        events: mpsc::UnboundedSender<Event>,
    ) {
        loop {
            tokio::select! {
                Some(msg) = outbox.recv() => {
                    if let Err(e) = self.send(&msg).await {
                        error!("Failed to send {}: {}", msg.kind(), e);
                        break;
                    }
                }
                result = self.recv() => {
                    match result {
                        Ok(Some(msg)) => {
                            if events.send(Event::Signal(msg)).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            info!("Signaling link closed by relay");
                            break;
                        }
                        Err(e) => {
                            error!("Signaling connection lost: {}", e);
                            break;
                        }
                    }
                }
                _ = handle.shutdown.notified() => {
                    debug!("Closing signaling link");
                    handle.open.store(false, Ordering::SeqCst);
                    while let Ok(msg) = outbox.try_recv() {
                        if let Err(e) = self.send(&msg).await {
                            warn!("Failed to flush {}: {}", msg.kind(), e);
                            break;
                        }
                    }
                    if let Err(e) = self.ws.close(None).await {
                        debug!("Close handshake failed: {}", e);
                    }
                    break;
                }
            }
        }

        handle.open.store(false, Ordering::SeqCst);
        let _ = events.send(Event::LinkClosed);
    }
}

/// Connect and start the link in one step.
pub async fn open_link(
    base: &str,
    display_name: &str,
    events: mpsc::UnboundedSender<Event>,
) -> Result<(LinkHandle, JoinHandle<()>)> {
    let client = SignalingClient::connect(base, display_name)
        .await
        .map_err(|e| anyhow!("signaling unavailable: {:#}", e))?;
    Ok(client.spawn(events))
}
