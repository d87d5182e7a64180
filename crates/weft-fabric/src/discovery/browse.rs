//! Periodic mDNS browsing with deferred resolution.
//!
//! Each sweep queries `_nws._tcp.local.` and collects responses for the
//! configured window. Records for our own channels or already-connected
//! proxies are skipped; the rest are bcrypt-matched against every local
//! channel name. A match dials immediately; a miss is cached so that a
//! channel created later can resolve it retroactively. The cache is replaced
//! wholesale at the end of every sweep, which garbage-collects records whose
//! advertiser went away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{timeout, Instant};

use weft_core::name::channel_name_matches;

use crate::channel::Channel;
use crate::service::Fabric;

use super::mdns::{self, ServiceEntry};
use super::record::DnsRecord;

/// The browser's handle on the fabric's mDNS socket.
pub struct BrowseEndpoint {
    pub socket: Arc<UdpSocket>,
    pub entries_rx: Mutex<mpsc::Receiver<ServiceEntry>>,
}

pub struct DiscoveryBrowser {
    fabric: Weak<Fabric>,
    cached: Mutex<HashMap<String, DnsRecord>>,
    in_progress: AtomicBool,
    endpoint: Option<BrowseEndpoint>,
}

impl DiscoveryBrowser {
    /// A browser without an endpoint never sweeps, but its cache and
    /// retroactive-resolution paths still work; the fabric always carries
    /// one so records can be offered to it directly.
    pub fn new(fabric: Weak<Fabric>, endpoint: Option<BrowseEndpoint>) -> Arc<DiscoveryBrowser> {
        Arc::new(DiscoveryBrowser {
            fabric,
            cached: Mutex::new(HashMap::new()),
            in_progress: AtomicBool::new(false),
            endpoint,
        })
    }

    /// Sweep on the configured interval until `done` fires.
    pub async fn run(
        self: Arc<Self>,
        interval_secs: u64,
        timeout_secs: u64,
        mut done: watch::Receiver<bool>,
    ) {
        if self.endpoint.is_none() {
            return;
        }
        tracing::info!(interval_secs, "listening for channel fabrics on the local network");

        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            tokio::select! {
                _ = done.changed() => break,
                _ = ticker.tick() => self.sweep(timeout_secs).await,
            }
        }
    }

    /// One browse cycle. Re-entrant calls while a sweep is collecting are
    /// no-ops.
    pub async fn sweep(&self, timeout_secs: u64) {
        let Some(endpoint) = &self.endpoint else {
            return;
        };
        if self.in_progress.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut entries = endpoint.entries_rx.lock().await;
        // Discard responses that arrived between sweeps.
        while entries.try_recv().is_ok() {}

        if let Err(e) = mdns::query(&endpoint.socket).await {
            tracing::warn!(error = %e, "mDNS query failed");
            self.in_progress.store(false, Ordering::SeqCst);
            return;
        }

        let deadline = Instant::now() + Duration::from_secs(timeout_secs);
        let mut unresolved = HashMap::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let entry = match timeout(remaining, entries.recv()).await {
                Err(_) => break,
                Ok(None) => break,
                Ok(Some(entry)) => entry,
            };
            let Some(record) = DnsRecord::from_entry(&entry) else {
                continue;
            };
            if !self.record_resolved(&record).await {
                unresolved.insert(record.hash_base64.clone(), record);
            }
        }

        // Replace the cache with what this sweep left unresolved.
        *self.cached.lock().await = unresolved;
        self.in_progress.store(false, Ordering::SeqCst);
    }

    /// Hand one record to the browser outside a sweep. Unresolved records
    /// join the cache and wait for a matching channel.
    pub async fn offer_record(&self, record: DnsRecord) {
        if !self.record_resolved(&record).await {
            self.cached
                .lock()
                .await
                .insert(record.hash_base64.clone(), record);
        }
    }

    /// Whether a record is handled: skipped as ours, skipped as already
    /// connected, or resolved and dialed. `false` means cache it.
    async fn record_resolved(&self, record: &DnsRecord) -> bool {
        let Some(fabric) = self.fabric.upgrade() else {
            return true;
        };
        if fabric.is_own_proxy_service(record) {
            return true;
        }
        if fabric.is_active_proxy_service(record).await {
            return true;
        }
        if let Some(channel) = fabric.resolve_record(record).await {
            if let Err(e) = fabric.dial_record(record, &channel).await {
                tracing::warn!(channel = %channel.name(), error = %e, "proxy dial failed");
            }
            return true;
        }
        false
    }

    /// Retroactive resolution: a newly created channel drains every cached
    /// record whose hash verifies against its name and dials it.
    pub async fn resolve_for_channel(&self, channel: &Arc<Channel>) {
        let Some(fabric) = self.fabric.upgrade() else {
            return;
        };

        let records: Vec<DnsRecord> = {
            let mut cached = self.cached.lock().await;
            cached.drain().map(|(_, record)| record).collect()
        };

        let mut keep = HashMap::new();
        for record in records {
            if channel_name_matches(channel.name(), &record.hash_bcrypt) {
                if let Err(e) = fabric.dial_record(&record, channel).await {
                    tracing::warn!(channel = %channel.name(), error = %e, "retroactive proxy dial failed");
                }
            } else {
                keep.insert(record.hash_base64.clone(), record);
            }
        }
        self.cached.lock().await.extend(keep);
    }

    pub async fn cached_record_count(&self) -> usize {
        self.cached.lock().await.len()
    }
}
