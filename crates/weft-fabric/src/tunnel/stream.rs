//! Sealed frame stream running over an authenticated tunnel.
//!
//! Each direction has its own key (derived from the SRP session key) and a
//! monotonically increasing nonce counter. A frame is one length-delimited
//! record holding the AEAD-sealed `[type byte || payload]`. Any decryption
//! failure is terminal for the connection.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::transport::{Frame, FrameSink, FrameSource};

const FRAME_TEXT: u8 = 0x01;
const FRAME_PING: u8 = 0x02;
const FRAME_PONG: u8 = 0x03;
const FRAME_CLOSE: u8 = 0x04;

/// Which side of the handshake this endpoint played. Key assignment is
/// symmetric in it.
#[derive(Debug, Clone, Copy)]
pub enum Role {
    Dialer,
    Acceptor,
}

pub struct TunnelSink<S> {
    inner: SplitSink<Framed<S, LengthDelimitedCodec>, Bytes>,
    cipher: ChaCha20Poly1305,
    counter: u64,
}

pub struct TunnelSource<S> {
    inner: SplitStream<Framed<S, LengthDelimitedCodec>>,
    cipher: ChaCha20Poly1305,
    counter: u64,
}

/// Wrap a post-handshake framed stream in per-direction ciphers.
pub fn seal<S>(
    framed: Framed<S, LengthDelimitedCodec>,
    session_key: &[u8],
    role: Role,
) -> (TunnelSink<S>, TunnelSource<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let dialer_key = blake3::derive_key("weft tunnel dialer->acceptor v1", session_key);
    let acceptor_key = blake3::derive_key("weft tunnel acceptor->dialer v1", session_key);
    let (send_key, recv_key) = match role {
        Role::Dialer => (dialer_key, acceptor_key),
        Role::Acceptor => (acceptor_key, dialer_key),
    };

    let (sink, stream) = framed.split();
    (
        TunnelSink {
            inner: sink,
            cipher: ChaCha20Poly1305::new(Key::from_slice(&send_key)),
            counter: 0,
        },
        TunnelSource {
            inner: stream,
            cipher: ChaCha20Poly1305::new(Key::from_slice(&recv_key)),
            counter: 0,
        },
    )
}

fn nonce_for(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&counter.to_le_bytes());
    Nonce::from(bytes)
}

fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
    Ok(match frame {
        Frame::Text(text) => {
            let mut plain = Vec::with_capacity(1 + text.len());
            plain.push(FRAME_TEXT);
            plain.extend_from_slice(text.as_bytes());
            plain
        }
        Frame::Ping => vec![FRAME_PING],
        Frame::Pong => vec![FRAME_PONG],
        Frame::Close => vec![FRAME_CLOSE],
        Frame::Binary => bail!("binary frames are not part of the tunnel protocol"),
    })
}

fn decode_frame(plain: &[u8]) -> Result<Frame> {
    let (&kind, payload) = plain
        .split_first()
        .ok_or_else(|| anyhow!("empty tunnel frame"))?;
    Ok(match kind {
        FRAME_TEXT => Frame::Text(String::from_utf8(payload.to_vec())?),
        FRAME_PING => Frame::Ping,
        FRAME_PONG => Frame::Pong,
        FRAME_CLOSE => Frame::Close,
        other => bail!("unknown tunnel frame type 0x{other:02x}"),
    })
}

#[async_trait]
impl<S> FrameSink for TunnelSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let plain = encode_frame(&frame)?;
        let sealed = self
            .cipher
            .encrypt(&nonce_for(self.counter), plain.as_slice())
            .map_err(|_| anyhow!("tunnel encryption failed"))?;
        self.counter += 1;
        self.inner.send(Bytes::from(sealed)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // Best-effort close notification; the peer also detects EOF.
        let _ = self.send(Frame::Close).await;
        self.inner.close().await?;
        Ok(())
    }
}

#[async_trait]
impl<S> FrameSource for TunnelSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn next(&mut self) -> Option<Result<Frame>> {
        let sealed = match self.inner.next().await? {
            Ok(bytes) => bytes,
            Err(e) => return Some(Err(e.into())),
        };
        let plain = match self
            .cipher
            .decrypt(&nonce_for(self.counter), sealed.as_ref())
        {
            Ok(plain) => plain,
            Err(_) => return Some(Err(anyhow!("tunnel decryption failed"))),
        };
        self.counter += 1;
        Some(decode_frame(&plain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonces_differ_per_counter() {
        assert_ne!(nonce_for(0), nonce_for(1));
        assert_ne!(nonce_for(1), nonce_for(u64::MAX));
    }

    #[test]
    fn frame_codec_round_trips() {
        for frame in [
            Frame::Text("hello".into()),
            Frame::Ping,
            Frame::Pong,
            Frame::Close,
        ] {
            let plain = encode_frame(&frame).unwrap();
            assert_eq!(decode_frame(&plain).unwrap(), frame);
        }
    }

    #[test]
    fn unknown_frame_type_is_an_error() {
        assert!(decode_frame(&[0x7f, 0x00]).is_err());
        assert!(decode_frame(&[]).is_err());
    }

    #[test]
    fn direction_keys_are_distinct() {
        let dialer = blake3::derive_key("weft tunnel dialer->acceptor v1", b"session");
        let acceptor = blake3::derive_key("weft tunnel acceptor->dialer v1", b"session");
        assert_ne!(dialer, acceptor);
    }
}
