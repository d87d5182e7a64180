//! Per-name membership registry and broadcast dispatcher.
//!
//! A channel owns its local peers, its federated proxies, its DNS-SD
//! advertisement, and a bounded broadcast buffer drained by a single
//! dispatcher task. The single consumer is what makes broadcast order FIFO
//! per channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use axum::extract::ws::WebSocket;
use tokio::sync::{mpsc, watch, Mutex};

use weft_core::id::generate_id;
use weft_core::name::hash_channel_name;
use weft_core::wire::{encode, BROADCAST_BUFFER};
use weft_core::{WireAction, WireMessage};

use crate::discovery::advertise::DiscoveryService;
use crate::peer::Peer;
use crate::proxy::Proxy;
use crate::transport::{ws, FrameSink, FrameSource};

#[derive(Default)]
pub(crate) struct Roster {
    pub peers: Vec<Arc<Peer>>,
    pub proxies: Vec<Arc<Proxy>>,
}

pub struct Channel {
    name: String,
    hash: String,
    service_path: String,
    proxy_path: String,
    roster: Mutex<Roster>,
    broadcast_tx: mpsc::Sender<WireMessage>,
    discovery: Mutex<Option<DiscoveryService>>,
    stopped: AtomicBool,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Channel {
    /// Create a channel and start its dispatcher. The proxy path is a fresh
    /// opaque URL that remote fabrics can only learn from our DNS-SD record.
    pub fn new(name: &str) -> Result<Arc<Self>> {
        let hash = hash_channel_name(name)?;
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_BUFFER);
        let (done_tx, done_rx) = watch::channel(false);

        let channel = Arc::new(Self {
            name: name.to_string(),
            hash,
            service_path: format!("/{name}"),
            proxy_path: format!("/{}", generate_id()),
            roster: Mutex::new(Roster::default()),
            broadcast_tx,
            discovery: Mutex::new(None),
            stopped: AtomicBool::new(false),
            done_tx,
            done_rx,
        });

        tokio::spawn(dispatcher(channel.clone(), broadcast_rx));
        tracing::info!(channel = %name, "new channel created");
        Ok(channel)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The advertised hash: base64(bcrypt(name)).
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Local join path on the localhost listener.
    pub fn service_path(&self) -> &str {
        &self.service_path
    }

    /// Opaque dial-in path on the network listener.
    pub fn proxy_path(&self) -> &str {
        &self.proxy_path
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    // ── Serving ──────────────────────────────────────────────────────────────

    /// Join an upgraded localhost WebSocket as a new peer.
    pub async fn serve_peer(self: &Arc<Self>, socket: WebSocket) -> Arc<Peer> {
        let (sink, source) = ws::split(socket);
        Peer::start(self, Box::new(sink), Box::new(source)).await
    }

    /// Attach a federated tunnel as a proxy. The dialing side passes
    /// `writeable = true`; an accepted tunnel is read-only.
    pub async fn serve_proxy(
        self: &Arc<Self>,
        sink: Box<dyn FrameSink>,
        source: Box<dyn FrameSource>,
        writeable: bool,
        hash_base64: Option<String>,
    ) -> Arc<Proxy> {
        Proxy::start(self, sink, source, writeable, hash_base64).await
    }

    // ── Broadcast path ───────────────────────────────────────────────────────

    /// Push a message onto the broadcast buffer. Blocks while the buffer is
    /// full: a slow dispatcher throttles producers rather than dropping.
    pub(crate) async fn enqueue(&self, message: WireMessage) {
        let _ = self.broadcast_tx.send(message).await;
    }

    async fn local_broadcast(&self, message: &WireMessage) {
        let peers = self.peers().await;
        let Ok(frame) = encode(WireAction::Broadcast, &message.source, "", &message.data) else {
            return;
        };
        for peer in peers {
            if peer.id() == message.source {
                continue;
            }
            let _ = peer.transport().write(frame.clone()).await;
        }
    }

    async fn remote_broadcast(&self, message: &WireMessage) {
        // A frame that arrived via a proxy is never relayed to another proxy:
        // one reflection suffices on a full mesh of writeable edges.
        if message.from_proxy {
            return;
        }
        let proxies = self.proxies().await;
        let Ok(frame) = encode(WireAction::Broadcast, &message.source, "", &message.data) else {
            return;
        };
        for proxy in proxies {
            if !proxy.writeable() || proxy.id() == message.source {
                continue;
            }
            let _ = proxy.transport().write(frame.clone()).await;
        }
    }

    // ── Roster ───────────────────────────────────────────────────────────────

    /// Register a peer; returns the other peers and all proxies as of the
    /// insertion, for the join choreography.
    pub(crate) async fn add_peer(&self, peer: &Arc<Peer>) -> (Vec<Arc<Peer>>, Vec<Arc<Proxy>>) {
        let mut roster = self.roster.lock().await;
        let others = roster.peers.clone();
        roster.peers.push(peer.clone());
        (others, roster.proxies.clone())
    }

    /// Unregister a peer; returns the remaining peers, the proxies, and the
    /// remaining local peer count.
    pub(crate) async fn remove_peer(&self, id: &str) -> (Vec<Arc<Peer>>, Vec<Arc<Proxy>>, usize) {
        let mut roster = self.roster.lock().await;
        roster.peers.retain(|p| p.id() != id);
        (
            roster.peers.clone(),
            roster.proxies.clone(),
            roster.peers.len(),
        )
    }

    /// Register a proxy; returns the current local peers for roster replay.
    pub(crate) async fn add_proxy(&self, proxy: &Arc<Proxy>) -> Vec<Arc<Peer>> {
        let mut roster = self.roster.lock().await;
        roster.proxies.push(proxy.clone());
        roster.peers.clone()
    }

    /// Unregister a proxy; returns the local peers and their count.
    pub(crate) async fn remove_proxy(&self, id: &str) -> (Vec<Arc<Peer>>, usize) {
        let mut roster = self.roster.lock().await;
        roster.proxies.retain(|q| q.id() != id);
        (roster.peers.clone(), roster.peers.len())
    }

    pub(crate) async fn peers(&self) -> Vec<Arc<Peer>> {
        self.roster.lock().await.peers.clone()
    }

    pub(crate) async fn proxies(&self) -> Vec<Arc<Proxy>> {
        self.roster.lock().await.proxies.clone()
    }

    pub async fn local_peer_count(&self) -> usize {
        self.roster.lock().await.peers.len()
    }

    pub async fn proxy_count(&self) -> usize {
        self.roster.lock().await.proxies.len()
    }

    // ── Discovery ────────────────────────────────────────────────────────────

    /// Attach the channel's DNS-SD advertisement. A channel advertises at
    /// most once; later calls are no-ops.
    pub async fn attach_discovery(&self, service: DiscoveryService) {
        let mut discovery = self.discovery.lock().await;
        if discovery.is_none() {
            *discovery = Some(service);
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Tear the channel down: withdraw the advertisement, close every peer
    /// and proxy transport, and signal `stop_notify` exactly once.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(service) = self.discovery.lock().await.take() {
            service.shutdown();
        }

        let (peers, proxies) = {
            let roster = self.roster.lock().await;
            (roster.peers.clone(), roster.proxies.clone())
        };
        for peer in peers {
            peer.transport().shutdown().await;
        }
        for proxy in proxies {
            proxy.transport().shutdown().await;
        }

        let _ = self.done_tx.send(true);
        tracing::info!(channel = %self.name, "channel stopped");
    }

    /// A receiver that observes channel termination. The fabric drops the
    /// channel from its registry on this signal.
    pub fn stop_notify(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }
}

/// Drain the broadcast buffer in FIFO order and fan each message out.
async fn dispatcher(channel: Arc<Channel>, mut broadcast_rx: mpsc::Receiver<WireMessage>) {
    let mut done = channel.stop_notify();
    loop {
        tokio::select! {
            _ = done.changed() => break,
            message = broadcast_rx.recv() => {
                let Some(message) = message else { break };
                channel.local_broadcast(&message).await;
                channel.remote_broadcast(&message).await;
            }
        }
    }
}
