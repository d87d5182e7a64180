//! Programmatic channel member.
//!
//! Dials a fabric's localhost listener and speaks the same wire protocol as
//! any other peer. Inbound frames are demultiplexed by action into one
//! bounded queue each, so a caller can await exactly the event kind it
//! expects.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use weft_core::wire::{decode, encode, PING_PERIOD, PONG_WAIT, WRITE_WAIT};
use weft_core::{WireAction, WireMessage};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

const QUEUE_DEPTH: usize = 64;

pub struct Client {
    writer: Arc<Mutex<WsSink>>,

    /// Status echoes; `target` carries this client's own peer id.
    pub status: mpsc::Receiver<WireMessage>,
    /// Membership arrivals observed by this peer.
    pub connect: mpsc::Receiver<WireMessage>,
    /// Membership departures observed by this peer.
    pub disconnect: mpsc::Receiver<WireMessage>,
    /// Unicasts addressed to this peer.
    pub message: mpsc::Receiver<WireMessage>,
    /// Broadcasts from every other channel member.
    pub broadcast: mpsc::Receiver<WireMessage>,
}

impl Client {
    /// Dial `ws://host:port/<name>` and start the connection pumps.
    pub async fn dial(url: &str) -> Result<Client> {
        let (socket, _response) = connect_async(url)
            .await
            .context("websocket connection failed")?;
        let (sink, mut stream) = socket.split();
        let writer = Arc::new(Mutex::new(sink));

        let (status_tx, status) = mpsc::channel(QUEUE_DEPTH);
        let (connect_tx, connect) = mpsc::channel(QUEUE_DEPTH);
        let (disconnect_tx, disconnect) = mpsc::channel(QUEUE_DEPTH);
        let (message_tx, message) = mpsc::channel(QUEUE_DEPTH);
        let (broadcast_tx, broadcast) = mpsc::channel(QUEUE_DEPTH);

        // Read pump: demultiplex inbound frames by action. Only a pong
        // refreshes the read deadline.
        let pump_writer = writer.clone();
        tokio::spawn(async move {
            let mut deadline = Instant::now() + PONG_WAIT;
            loop {
                let frame = match timeout_at(deadline, stream.next()).await {
                    Err(_) => break,
                    Ok(None) => break,
                    Ok(Some(Err(_))) => break,
                    Ok(Some(Ok(frame))) => frame,
                };
                match frame {
                    Message::Text(text) => {
                        let Some(wire) = decode(text.as_str()) else {
                            continue;
                        };
                        let queue = match wire.action {
                            WireAction::Status => &status_tx,
                            WireAction::Connect => &connect_tx,
                            WireAction::Disconnect => &disconnect_tx,
                            WireAction::Message => &message_tx,
                            WireAction::Broadcast => &broadcast_tx,
                        };
                        let _ = queue.send(wire).await;
                    }
                    Message::Ping(payload) => {
                        let mut writer = pump_writer.lock().await;
                        if writer.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Message::Pong(_) => {
                        deadline = Instant::now() + PONG_WAIT;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });

        // Write pump: keepalive pings.
        let ping_writer = writer.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_PERIOD);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let mut writer = ping_writer.lock().await;
                if writer.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        });

        Ok(Client {
            writer,
            status,
            connect,
            disconnect,
            message,
            broadcast,
        })
    }

    /// Ask the fabric to echo our peer id.
    pub async fn request_status(&self) -> Result<()> {
        self.send(WireAction::Status, "", "").await
    }

    /// Broadcast `data` to every other member of the channel.
    pub async fn send_broadcast(&self, data: &str) -> Result<()> {
        self.send(WireAction::Broadcast, "", data).await
    }

    /// Send `data` to the member whose id is `target`.
    pub async fn send_message(&self, target: &str, data: &str) -> Result<()> {
        if target.is_empty() {
            bail!("message requires a target peer id");
        }
        self.send(WireAction::Message, target, data).await
    }

    /// Learn our own peer id via the status round trip, the protocol's
    /// only self-identification mechanism.
    pub async fn peer_id(&mut self) -> Result<String> {
        self.request_status().await?;
        let reply = timeout(WRITE_WAIT, self.status.recv())
            .await
            .context("timed out waiting for status echo")?
            .context("connection closed before status echo")?;
        Ok(reply.target)
    }

    pub async fn close(&self) {
        let _ = self.writer.lock().await.close().await;
    }

    async fn send(&self, action: WireAction, target: &str, data: &str) -> Result<()> {
        let frame = encode(action, "", target, data).context("frame encoding failed")?;
        let mut writer = self.writer.lock().await;
        timeout(WRITE_WAIT, writer.send(Message::Text(frame.into())))
            .await
            .context("write deadline exceeded")?
            .context("websocket write failed")?;
        Ok(())
    }
}
