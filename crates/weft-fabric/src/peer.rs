//! A local member of a channel.
//!
//! Peers interpret wire actions from their own connection and enforce the
//! routing rules: status is echoed back, broadcasts go through the channel
//! dispatcher, unicasts are routed local-first then across proxies, and
//! membership actions are write-only toward clients.
//!
//! Every connect/disconnect frame a peer receives names that peer as the
//! observer: `source` is the receiving peer's own id, `target` the appearing
//! or departing peer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;

use weft_core::id::generate_id;
use weft_core::wire::{decode, encode};
use weft_core::{WireAction, WireMessage};

use crate::channel::Channel;
use crate::transport::{FrameSink, FrameSource, MessageHandler, Transport};

pub struct Peer {
    id: String,
    channel: Weak<Channel>,
    transport: Arc<Transport>,
    active: AtomicBool,
}

impl Peer {
    /// Bind a connection to the channel as a new peer and run the join
    /// choreography: both sides of every existing peer pairing learn each
    /// other, writeable proxies announce the newcomer to their remote
    /// channels, and every mirrored remote roster is replayed into the
    /// newcomer.
    pub(crate) async fn start(
        channel: &Arc<Channel>,
        sink: Box<dyn FrameSink>,
        source: Box<dyn FrameSource>,
    ) -> Arc<Peer> {
        let transport = Transport::new(sink);
        let peer = Arc::new(Peer {
            id: generate_id(),
            channel: Arc::downgrade(channel),
            transport: transport.clone(),
            active: AtomicBool::new(true),
        });
        transport.start(source, peer.clone());

        let (others, proxies) = channel.add_peer(&peer).await;

        for other in &others {
            other
                .write_wire(WireAction::Connect, other.id(), peer.id(), "")
                .await;
            peer.write_wire(WireAction::Connect, peer.id(), other.id(), "")
                .await;
        }

        for proxy in &proxies {
            if proxy.writeable() {
                proxy
                    .write_wire(WireAction::Connect, proxy.id(), peer.id(), "")
                    .await;
            }
        }

        for proxy in &proxies {
            for remote_id in proxy.peer_ids().await {
                peer.write_wire(WireAction::Connect, peer.id(), &remote_id, "")
                    .await;
            }
        }

        tracing::debug!(channel = %channel.name(), peer = %peer.id, "peer joined");

        let watcher = peer.clone();
        tokio::spawn(async move {
            watcher.transport.wait_done().await;
            watcher.finish().await;
        });

        peer
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub(crate) async fn write_wire(&self, action: WireAction, source: &str, target: &str, data: &str) {
        if let Ok(frame) = encode(action, source, target, data) {
            let _ = self.transport.write(frame).await;
        }
    }

    /// Departure choreography, driven exactly once by the transport's done
    /// signal: remaining peers observe the disconnect, writeable proxies
    /// relay it outward, and the last peer out stops the channel.
    async fn finish(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let Some(channel) = self.channel.upgrade() else {
            return;
        };

        let (remaining, proxies, peer_count) = channel.remove_peer(&self.id).await;

        for peer in &remaining {
            peer.write_wire(WireAction::Disconnect, peer.id(), &self.id, "")
                .await;
        }
        for proxy in &proxies {
            if proxy.writeable() {
                proxy
                    .write_wire(WireAction::Disconnect, proxy.id(), &self.id, "")
                    .await;
            }
        }

        tracing::debug!(channel = %channel.name(), peer = %self.id, "peer departed");

        if peer_count == 0 {
            channel.stop().await;
        }
    }

    async fn route_message(&self, channel: &Arc<Channel>, target: &str, data: &str) {
        if target.is_empty() {
            return;
        }

        let peers = channel.peers().await;
        if let Some(peer) = peers.iter().find(|p| p.id() == target) {
            peer.write_wire(WireAction::Message, &self.id, target, data)
                .await;
            return;
        }

        let proxies = channel.proxies().await;
        for proxy in &proxies {
            if proxy.owns_peer(target).await {
                proxy
                    .write_wire(WireAction::Message, &self.id, target, data)
                    .await;
                return;
            }
        }
        // Unknown target: dropped silently, no error response to the sender.
    }
}

#[async_trait]
impl MessageHandler for Peer {
    async fn handle_frame(&self, text: &str) {
        let Some(message) = decode(text) else {
            return;
        };
        let Some(channel) = self.channel.upgrade() else {
            return;
        };

        match message.action {
            WireAction::Status => {
                // Self-identification echo, the only way a client learns
                // its own id.
                self.write_wire(WireAction::Status, &self.id, &self.id, "")
                    .await;
            }
            WireAction::Broadcast => {
                channel
                    .enqueue(WireMessage {
                        action: WireAction::Broadcast,
                        source: self.id.clone(),
                        target: String::new(),
                        data: message.data,
                        from_proxy: false,
                    })
                    .await;
            }
            WireAction::Message => {
                self.route_message(&channel, &message.target, &message.data)
                    .await;
            }
            // Membership notifications are write-only toward clients.
            WireAction::Connect | WireAction::Disconnect => {}
        }
    }
}
