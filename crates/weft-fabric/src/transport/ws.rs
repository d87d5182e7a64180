//! WebSocket framing for local peer connections (axum upgrade sockets).

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};

use super::{Frame, FrameSink, FrameSource};

pub struct WsSink(SplitSink<WebSocket, Message>);

pub struct WsSource(SplitStream<WebSocket>);

/// Split an upgraded socket into transport halves.
pub fn split(socket: WebSocket) -> (WsSink, WsSource) {
    let (sink, stream) = socket.split();
    (WsSink(sink), WsSource(stream))
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Ping => Message::Ping(Vec::new().into()),
            Frame::Pong => Message::Pong(Vec::new().into()),
            Frame::Close | Frame::Binary => Message::Close(None),
        };
        self.0.send(message).await.map_err(anyhow::Error::from)
    }

    async fn close(&mut self) -> Result<()> {
        self.0.close().await.map_err(anyhow::Error::from)
    }
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next(&mut self) -> Option<Result<Frame>> {
        let message = match self.0.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(e.into())),
        };
        Some(Ok(match message {
            Message::Text(text) => Frame::Text(text.to_string()),
            Message::Binary(_) => Frame::Binary,
            Message::Ping(_) => Frame::Ping,
            Message::Pong(_) => Frame::Pong,
            Message::Close(_) => Frame::Close,
        }))
    }
}
