//! Mutually authenticated tunnels between fabrics.
//!
//! A tunnel carries one proxy connection. Authentication is SRP-6a over the
//! 4096-bit group: the dialer's username is the advertised channel hash, the
//! password is the plaintext channel name, and the acceptor derives the
//! verifier from its credential table, so knowledge of the name is necessary
//! and sufficient to authenticate both directions. After the proof exchange
//! the stream switches to ChaCha20-Poly1305-sealed frames with per-direction
//! keys derived from the SRP session key.
//!
//! The dial-side hello carries the proxy path and subprotocol token the
//! acceptor routes on, standing in for the URL path and
//! `Sec-WebSocket-Protocol` header of the WebSocket handshake.

pub mod stream;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use srp::client::SrpClient;
use srp::groups::G_4096;
use srp::server::SrpServer;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use weft_core::name::SRP_SALT;
use weft_core::CredentialsStore;

pub use stream::{TunnelSink, TunnelSource};

/// Upper bound on one tunnel frame: the protocol frame limit plus cipher
/// and framing overhead.
const MAX_TUNNEL_FRAME: usize = weft_core::wire::MAX_MESSAGE_SIZE + 64;

/// Handshake frames are larger than data frames: the 4096-bit group makes
/// each public ephemeral 512 bytes before encoding.
const MAX_HANDSHAKE_FRAME: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("tunnel i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed handshake frame")]
    Malformed,
    #[error("peer closed during handshake")]
    ClosedEarly,
    #[error("authentication failed")]
    Auth,
}

/// What the acceptor learned about a dial during the handshake.
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    /// SRP username: the advertised channel hash the dialer matched.
    pub username: String,
    /// Proxy path the dialer is asking for.
    pub path: String,
    /// Subprotocol token offered by the dialer.
    pub protocol: String,
}

// ── Handshake frames ──────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct ClientHello {
    username: String,
    a_pub: String,
    path: String,
    protocol: String,
}

#[derive(Serialize, Deserialize)]
struct ServerHello {
    salt: String,
    b_pub: String,
}

#[derive(Serialize, Deserialize)]
struct ClientConfirm {
    proof: String,
}

#[derive(Serialize, Deserialize)]
struct ServerConfirm {
    proof: String,
}

// ── Dial side ─────────────────────────────────────────────────────────────────

/// Establish a tunnel as the dialer. `username` is the advertised hash from
/// the discovered record, `password` the channel name being dialed.
pub async fn connect<S>(
    stream: S,
    username: &str,
    password: &str,
    path: &str,
    protocol: &str,
) -> Result<(TunnelSink<S>, TunnelSource<S>), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut framed = handshake_framed(stream);

    let client = SrpClient::<Sha256>::new(&G_4096);
    let mut a = [0u8; 64];
    OsRng.fill_bytes(&mut a);
    let a_pub = client.compute_public_ephemeral(&a);

    send_json(
        &mut framed,
        &ClientHello {
            username: username.to_string(),
            a_pub: BASE64.encode(&a_pub),
            path: path.to_string(),
            protocol: protocol.to_string(),
        },
    )
    .await?;

    let hello: ServerHello = recv_json(&mut framed).await?;
    let salt = decode_field(&hello.salt)?;
    let b_pub = decode_field(&hello.b_pub)?;

    let verifier = client
        .process_reply(&a, username.as_bytes(), password.as_bytes(), &salt, &b_pub)
        .map_err(|_| HandshakeError::Auth)?;

    send_json(
        &mut framed,
        &ClientConfirm {
            proof: BASE64.encode(verifier.proof()),
        },
    )
    .await?;

    let confirm: ServerConfirm = recv_json(&mut framed).await?;
    let server_proof = decode_field(&confirm.proof)?;
    verifier
        .verify_server(&server_proof)
        .map_err(|_| HandshakeError::Auth)?;

    Ok(stream::seal(framed, verifier.key(), stream::Role::Dialer))
}

// ── Accept side ───────────────────────────────────────────────────────────────

/// Establish a tunnel as the acceptor, resolving the dialer's SRP username
/// against the fabric's credential table. An unknown username yields an
/// empty verifier, so the proof exchange fails without revealing whether the
/// hash was known.
pub async fn accept<S>(
    stream: S,
    creds: &CredentialsStore,
) -> Result<(TunnelSink<S>, TunnelSource<S>, TunnelInfo), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut framed = handshake_framed(stream);

    let hello: ClientHello = recv_json(&mut framed).await?;
    let a_pub = decode_field(&hello.a_pub)?;

    let password = creds.lookup(&hello.username).unwrap_or_default();
    let verifier_bytes = SrpClient::<Sha256>::new(&G_4096).compute_verifier(
        hello.username.as_bytes(),
        password.as_bytes(),
        &SRP_SALT,
    );

    let server = SrpServer::<Sha256>::new(&G_4096);
    let mut b = [0u8; 64];
    OsRng.fill_bytes(&mut b);
    let b_pub = server.compute_public_ephemeral(&b, &verifier_bytes);

    send_json(
        &mut framed,
        &ServerHello {
            salt: BASE64.encode(SRP_SALT),
            b_pub: BASE64.encode(&b_pub),
        },
    )
    .await?;

    let confirm: ClientConfirm = recv_json(&mut framed).await?;
    let client_proof = decode_field(&confirm.proof)?;

    let verifier = server
        .process_reply(&b, &verifier_bytes, &a_pub)
        .map_err(|_| HandshakeError::Auth)?;
    verifier
        .verify_client(&client_proof)
        .map_err(|_| HandshakeError::Auth)?;

    send_json(
        &mut framed,
        &ServerConfirm {
            proof: BASE64.encode(verifier.proof()),
        },
    )
    .await?;

    let info = TunnelInfo {
        username: hello.username,
        path: hello.path,
        protocol: hello.protocol,
    };
    let (sink, source) = stream::seal(framed, verifier.key(), stream::Role::Acceptor);
    Ok((sink, source, info))
}

// ── Framing helpers ───────────────────────────────────────────────────────────

fn handshake_framed<S>(stream: S) -> Framed<S, LengthDelimitedCodec>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut codec = LengthDelimitedCodec::new();
    codec.set_max_frame_length(MAX_HANDSHAKE_FRAME.max(MAX_TUNNEL_FRAME));
    Framed::new(stream, codec)
}

async fn send_json<S, T>(
    framed: &mut Framed<S, LengthDelimitedCodec>,
    value: &T,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(value).map_err(|_| HandshakeError::Malformed)?;
    framed.send(Bytes::from(bytes)).await?;
    Ok(())
}

async fn recv_json<S, T>(framed: &mut Framed<S, LengthDelimitedCodec>) -> Result<T, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let bytes = framed
        .next()
        .await
        .ok_or(HandshakeError::ClosedEarly)??;
    serde_json::from_slice(&bytes).map_err(|_| HandshakeError::Malformed)
}

fn decode_field(value: &str) -> Result<Vec<u8>, HandshakeError> {
    BASE64.decode(value).map_err(|_| HandshakeError::Malformed)
}
