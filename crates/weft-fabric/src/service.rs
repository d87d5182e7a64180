//! The per-host fabric service.
//!
//! Owns two listeners (a localhost WebSocket listener where processes
//! create or join channels, and a network tunnel listener where remote
//! fabrics dial in) plus the channel registry, the SRP credential table,
//! and the discovery browser.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::{bail, Context, Result};
use axum::extract::{FromRequestParts, Path, Request, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};

use weft_core::config::{DiscoveryConfig, FabricConfig};
use weft_core::name::{channel_name_matches, valid_channel_name};
use weft_core::wire::{MAX_MESSAGE_SIZE, PROXY_SUBPROTOCOL};
use weft_core::CredentialsStore;

use crate::channel::Channel;
use crate::discovery::browse::BrowseEndpoint;
use crate::discovery::mdns::{self, AdvertRegistry};
use crate::discovery::{DiscoveryBrowser, DiscoveryService, DnsRecord};
use crate::tunnel;

pub struct Fabric {
    host: String,
    local_port: AtomicU16,
    proxy_port: AtomicU16,
    channels: DashMap<String, Arc<Channel>>,
    creds: CredentialsStore,
    adverts: AdvertRegistry,
    browser: OnceLock<Arc<DiscoveryBrowser>>,
    discovery: DiscoveryConfig,
    addr_v4: Ipv4Addr,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Fabric {
    pub fn new(config: FabricConfig) -> Arc<Fabric> {
        let (done_tx, done_rx) = watch::channel(false);
        let host = if config.network.host.is_empty() {
            "localhost".to_string()
        } else {
            config.network.host
        };
        Arc::new(Fabric {
            host,
            local_port: AtomicU16::new(config.network.local_port),
            proxy_port: AtomicU16::new(0),
            channels: DashMap::new(),
            creds: CredentialsStore::new(),
            adverts: mdns::new_registry(),
            browser: OnceLock::new(),
            discovery: config.discovery,
            addr_v4: mdns::local_ipv4(),
            done_tx,
            done_rx,
        })
    }

    /// Bind both listeners and start discovery. Call exactly once.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        // Localhost listener: channel creation and joining.
        let local_listener =
            TcpListener::bind(("127.0.0.1", self.local_port.load(Ordering::SeqCst)))
                .await
                .context("failed to bind local listener")?;
        self.local_port
            .store(local_listener.local_addr()?.port(), Ordering::SeqCst);

        let app = Router::new()
            .route("/", get(serve_console))
            .route("/{name}", get(serve_channel))
            .with_state(self.clone());

        let mut serve_done = self.done_rx.clone();
        tokio::spawn(async move {
            let shutdown = async move {
                while !*serve_done.borrow() {
                    if serve_done.changed().await.is_err() {
                        break;
                    }
                }
            };
            if let Err(e) = axum::serve(local_listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!(error = %e, "local listener failed");
            }
        });

        // Network listener: federated tunnel dial-ins on an OS-chosen port.
        let net_listener = TcpListener::bind(("0.0.0.0", 0))
            .await
            .context("failed to bind network listener")?;
        self.proxy_port
            .store(net_listener.local_addr()?.port(), Ordering::SeqCst);

        let fabric = self.clone();
        let mut accept_done = self.done_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_done.changed() => break,
                    accepted = net_listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            tokio::spawn(fabric.clone().accept_tunnel(stream, addr));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "network accept failed");
                        }
                    }
                }
            }
        });

        // Discovery: the browser always exists so records can be offered to
        // it; the mDNS endpoint and sweep loop only when discovery is on.
        let endpoint = if self.discovery.enabled {
            let (entries_tx, entries_rx) = mpsc::channel(256);
            match mdns::spawn_endpoint(self.adverts.clone(), entries_tx, self.done_rx.clone()) {
                Ok(socket) => Some(BrowseEndpoint {
                    socket,
                    entries_rx: Mutex::new(entries_rx),
                }),
                Err(e) => {
                    tracing::warn!(error = %e, "mDNS unavailable, discovery disabled");
                    None
                }
            }
        } else {
            None
        };
        let sweeping = endpoint.is_some();
        let browser = DiscoveryBrowser::new(Arc::downgrade(self), endpoint);
        let _ = self.browser.set(browser.clone());
        if sweeping {
            tokio::spawn(browser.run(
                self.discovery.interval_secs,
                self.discovery.timeout_secs,
                self.done_rx.clone(),
            ));
        }

        tracing::info!(
            host = %self.host,
            local_port = self.local_port(),
            proxy_port = self.proxy_port(),
            "fabric serving"
        );
        Ok(())
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn local_port(&self) -> u16 {
        self.local_port.load(Ordering::SeqCst)
    }

    pub fn proxy_port(&self) -> u16 {
        self.proxy_port.load(Ordering::SeqCst)
    }

    pub fn browser(&self) -> Option<&Arc<DiscoveryBrowser>> {
        self.browser.get()
    }

    pub fn channel(&self, service_path: &str) -> Option<Arc<Channel>> {
        self.channels.get(service_path).map(|c| c.clone())
    }

    // ── Channels ─────────────────────────────────────────────────────────────

    /// Create or join the channel for `name`. Creation registers SRP
    /// credentials, advertises the channel, and retroactively resolves any
    /// cached discovery records that match the new name.
    pub async fn open_channel(self: &Arc<Self>, name: &str) -> Result<Arc<Channel>> {
        let path = format!("/{name}");
        if let Some(existing) = self.channels.get(&path) {
            return Ok(existing.clone());
        }

        let fresh = Channel::new(name)?;
        let (channel, created) = {
            use dashmap::mapref::entry::Entry;
            match self.channels.entry(path.clone()) {
                Entry::Occupied(entry) => (entry.get().clone(), false),
                Entry::Vacant(entry) => {
                    entry.insert(fresh.clone());
                    (fresh.clone(), true)
                }
            }
        };
        if !created {
            // Lost a creation race; discard the redundant channel.
            fresh.stop().await;
            return Ok(channel);
        }

        self.creds.insert(channel.hash(), name);

        // Deregister when the channel terminates.
        let fabric = self.clone();
        let watched = channel.clone();
        tokio::spawn(async move {
            let mut notify = watched.stop_notify();
            while !*notify.borrow() {
                if notify.changed().await.is_err() {
                    break;
                }
            }
            fabric.channels.remove(watched.service_path());
            fabric.creds.remove(watched.hash());
        });

        if self.discovery.enabled {
            let service = DiscoveryService::register(
                &self.adverts,
                "local",
                &self.host,
                self.proxy_port(),
                channel.hash(),
                channel.proxy_path(),
                Some(self.addr_v4),
                None,
            );
            channel.attach_discovery(service).await;
        }

        if let Some(browser) = self.browser.get() {
            browser.resolve_for_channel(&channel).await;
        }

        Ok(channel)
    }

    // ── Discovery hooks ──────────────────────────────────────────────────────

    /// Does this record advertise one of our own channels?
    pub fn is_own_proxy_service(&self, record: &DnsRecord) -> bool {
        self.channels
            .iter()
            .any(|c| c.value().hash() == record.hash_base64)
    }

    /// Is some proxy already connected under this record's hash?
    pub async fn is_active_proxy_service(&self, record: &DnsRecord) -> bool {
        let channels: Vec<Arc<Channel>> =
            self.channels.iter().map(|c| c.value().clone()).collect();
        for channel in channels {
            for proxy in channel.proxies().await {
                if proxy.hash_base64() == Some(record.hash_base64.as_str()) {
                    return true;
                }
            }
        }
        false
    }

    /// Find the local channel whose name is the preimage of the record's
    /// bcrypt hash.
    pub async fn resolve_record(&self, record: &DnsRecord) -> Option<Arc<Channel>> {
        let channels: Vec<Arc<Channel>> =
            self.channels.iter().map(|c| c.value().clone()).collect();
        channels
            .into_iter()
            .find(|c| channel_name_matches(c.name(), &record.hash_bcrypt))
    }

    /// Dial a discovered record and attach the resulting tunnel to `channel`
    /// as a writeable proxy. IPv4 is tried before IPv6; the first success
    /// wins.
    pub async fn dial_record(&self, record: &DnsRecord, channel: &Arc<Channel>) -> Result<()> {
        let mut addrs: Vec<std::net::IpAddr> = Vec::new();
        if let Some(v4) = record.addr_v4 {
            addrs.push(v4.into());
        }
        if let Some(v6) = record.addr_v6 {
            addrs.push(v6.into());
        }

        for addr in addrs {
            let stream = match TcpStream::connect((addr, record.port)).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!(%addr, port = record.port, error = %e, "tunnel connect failed");
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);

            match tunnel::connect(
                stream,
                &record.hash_base64,
                channel.name(),
                &record.path,
                PROXY_SUBPROTOCOL,
            )
            .await
            {
                Ok((sink, source)) => {
                    tracing::info!(
                        channel = %channel.name(),
                        %addr,
                        port = record.port,
                        "established proxy connection"
                    );
                    channel
                        .serve_proxy(
                            Box::new(sink),
                            Box::new(source),
                            true,
                            Some(record.hash_base64.clone()),
                        )
                        .await;
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(%addr, port = record.port, error = %e, "tunnel handshake failed");
                }
            }
        }

        bail!(
            "could not establish proxy connection to {}:{}",
            record.host,
            record.port
        )
    }

    // ── Inbound tunnels ──────────────────────────────────────────────────────

    /// One accepted network connection: authenticate, check the subprotocol,
    /// route the proxy path to its channel, and attach a read-only proxy.
    async fn accept_tunnel(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let _ = stream.set_nodelay(true);

        let (sink, source, info) = match tunnel::accept(stream, &self.creds).await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::debug!(peer = %addr, error = %e, "inbound tunnel rejected");
                return;
            }
        };

        if info.protocol != PROXY_SUBPROTOCOL {
            tracing::warn!(peer = %addr, protocol = %info.protocol, "unsupported proxy protocol");
            return;
        }

        let channel = self.channels.iter().find_map(|c| {
            let channel = c.value();
            (channel.proxy_path() == info.path && channel.hash() == info.username)
                .then(|| channel.clone())
        });
        let Some(channel) = channel else {
            tracing::warn!(peer = %addr, path = %info.path, "no channel for proxy path");
            return;
        };

        channel
            .serve_proxy(Box::new(sink), Box::new(source), false, Some(info.username))
            .await;
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Close both listeners, stop the browser, and stop every channel.
    pub async fn stop(&self) {
        let _ = self.done_tx.send(true);
        let channels: Vec<Arc<Channel>> =
            self.channels.iter().map(|c| c.value().clone()).collect();
        for channel in channels {
            channel.stop().await;
        }
        tracing::info!("fabric stopped");
    }
}

// ── HTTP surface ──────────────────────────────────────────────────────────────

/// `GET /`: minimal console banner, localhost only.
async fn serve_console(State(fabric): State<Arc<Fabric>>, headers: HeaderMap) -> Response {
    if !host_allowed(&fabric, &headers) {
        return (
            StatusCode::FORBIDDEN,
            "the channel fabric console is only accessible from the local machine",
        )
            .into_response();
    }
    Html("<h2>A weft channel fabric is running on this host</h2>").into_response()
}

/// `GET /<name>` + upgrade: create or join a channel as a local peer.
///
/// The upgrade is extracted by hand so the host and name policies answer
/// first: 403 off-host, 404 for a bad name, 400 for a well-formed request
/// that is not a WebSocket upgrade.
async fn serve_channel(
    State(fabric): State<Arc<Fabric>>,
    Path(name): Path<String>,
    request: Request,
) -> Response {
    let (mut parts, _body) = request.into_parts();

    if !host_allowed(&fabric, &parts.headers) {
        return (
            StatusCode::FORBIDDEN,
            "channels are only accessible from the local machine",
        )
            .into_response();
    }
    if !valid_channel_name(&name) {
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    }
    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(ws) => ws,
        Err(_) => return (StatusCode::BAD_REQUEST, "Bad Request").into_response(),
    };
    // Cap frames at the socket layer, like the tunnel listener's codec cap:
    // an oversized frame aborts mid-read instead of being buffered whole.
    let ws = ws
        .max_message_size(MAX_MESSAGE_SIZE)
        .max_frame_size(MAX_MESSAGE_SIZE);
    let channel = match fabric.open_channel(&name).await {
        Ok(channel) => channel,
        Err(e) => {
            tracing::error!(channel = %name, error = %e, "channel creation failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
        }
    };

    ws.on_upgrade(move |socket| async move {
        let _ = channel.serve_peer(socket).await;
    })
}

fn host_allowed(fabric: &Fabric, headers: &HeaderMap) -> bool {
    let Some(host) = headers.get(header::HOST).and_then(|h| h.to_str().ok()) else {
        return false;
    };
    let port = fabric.local_port();
    [
        format!("localhost:{port}"),
        format!("127.0.0.1:{port}"),
        format!("[::1]:{port}"),
        format!("::1:{port}"),
        format!("{}:{port}", fabric.host()),
    ]
    .iter()
    .any(|allowed| allowed == host)
}
