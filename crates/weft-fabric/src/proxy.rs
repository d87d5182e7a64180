//! A remote channel endpoint reached over a federation tunnel.
//!
//! A proxy mirrors the remote side's peer roster through the connect and
//! disconnect actions arriving on its read side. Direction is permanent for
//! the life of the connection: the side that dialed out is writeable and is
//! the only side that propagates local membership events outward. Broadcast
//! and message frames flow in both directions.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::Mutex;

use weft_core::id::generate_id;
use weft_core::wire::{decode, encode};
use weft_core::{WireAction, WireMessage};

use crate::channel::Channel;
use crate::transport::{FrameSink, FrameSource, MessageHandler, Transport};

pub struct Proxy {
    id: String,
    hash_base64: Option<String>,
    peer_ids: Mutex<HashSet<String>>,
    writeable: bool,
    channel: Weak<Channel>,
    transport: Arc<Transport>,
    active: AtomicBool,
}

impl Proxy {
    /// Bind a tunnel to the channel as a proxy. A writeable proxy replays
    /// the current local roster outward so the remote channel learns our
    /// peers.
    pub(crate) async fn start(
        channel: &Arc<Channel>,
        sink: Box<dyn FrameSink>,
        source: Box<dyn FrameSource>,
        writeable: bool,
        hash_base64: Option<String>,
    ) -> Arc<Proxy> {
        let transport = Transport::new(sink);
        let proxy = Arc::new(Proxy {
            id: generate_id(),
            hash_base64,
            peer_ids: Mutex::new(HashSet::new()),
            writeable,
            channel: Arc::downgrade(channel),
            transport: transport.clone(),
            active: AtomicBool::new(true),
        });
        transport.start(source, proxy.clone());

        let peers = channel.add_proxy(&proxy).await;
        if writeable {
            for peer in &peers {
                proxy
                    .write_wire(WireAction::Connect, &proxy.id, peer.id(), "")
                    .await;
            }
        }

        tracing::info!(
            channel = %channel.name(),
            proxy = %proxy.id,
            writeable,
            "proxy connection established"
        );

        let watcher = proxy.clone();
        tokio::spawn(async move {
            watcher.transport.wait_done().await;
            watcher.finish().await;
        });

        proxy
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn writeable(&self) -> bool {
        self.writeable
    }

    /// The advertised channel hash this proxy was established under, when
    /// known. The dialer knows it from the DNS-SD record; the acceptor from
    /// the SRP username.
    pub fn hash_base64(&self) -> Option<&str> {
        self.hash_base64.as_deref()
    }

    pub(crate) async fn owns_peer(&self, id: &str) -> bool {
        self.peer_ids.lock().await.contains(id)
    }

    pub(crate) async fn peer_ids(&self) -> Vec<String> {
        self.peer_ids.lock().await.iter().cloned().collect()
    }

    pub(crate) fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub(crate) async fn write_wire(&self, action: WireAction, source: &str, target: &str, data: &str) {
        if let Ok(frame) = encode(action, source, target, data) {
            let _ = self.transport.write(frame).await;
        }
    }

    /// Teardown, driven exactly once by the transport's done signal.
    async fn finish(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let Some(channel) = self.channel.upgrade() else {
            return;
        };

        let (peers, peer_count) = channel.remove_proxy(&self.id).await;

        if self.writeable {
            // Best-effort: the tunnel is usually already gone.
            for peer in &peers {
                self.write_wire(WireAction::Disconnect, &self.id, peer.id(), "")
                    .await;
            }
        }

        tracing::info!(channel = %channel.name(), proxy = %self.id, "proxy connection closed");

        if peer_count == 0 {
            channel.stop().await;
        }
    }
}

#[async_trait]
impl MessageHandler for Proxy {
    async fn handle_frame(&self, text: &str) {
        let Some(message) = decode(text) else {
            return;
        };
        let Some(channel) = self.channel.upgrade() else {
            return;
        };

        match message.action {
            WireAction::Connect => {
                if message.target.is_empty() {
                    return;
                }
                self.peer_ids.lock().await.insert(message.target.clone());
                for peer in channel.peers().await {
                    peer.write_wire(WireAction::Connect, peer.id(), &message.target, "")
                        .await;
                }
            }
            WireAction::Disconnect => {
                if message.target.is_empty() {
                    return;
                }
                self.peer_ids.lock().await.remove(&message.target);
                for peer in channel.peers().await {
                    peer.write_wire(WireAction::Disconnect, peer.id(), &message.target, "")
                        .await;
                }
            }
            WireAction::Broadcast => {
                channel
                    .enqueue(WireMessage {
                        action: WireAction::Broadcast,
                        source: message.source,
                        target: String::new(),
                        data: message.data,
                        from_proxy: true,
                    })
                    .await;
            }
            WireAction::Message => {
                // Deliver to the local target only. A message never crosses
                // a second proxy hop.
                let peers = channel.peers().await;
                if let Some(peer) = peers.iter().find(|p| p.id() == message.target) {
                    peer.write_wire(
                        WireAction::Message,
                        &message.source,
                        &message.target,
                        &message.data,
                    )
                    .await;
                }
            }
            WireAction::Status => {}
        }
    }
}
