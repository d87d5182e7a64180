//! Connection pumps and keepalive shared by peers and proxies.
//!
//! A [`Transport`] wraps one framed, bidirectional connection: a read pump
//! delivers whole text frames to the attached handler, a write pump keeps the
//! connection alive with periodic pings, and every outbound write is
//! serialized under a per-connection mutex and a write deadline. Any I/O
//! error is terminal for the transport; liveness flows only via the done
//! signal; the handler receives no error callback.

pub mod ws;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::time::{timeout, timeout_at, Instant};

use weft_core::wire::{MAX_MESSAGE_SIZE, PING_PERIOD, PONG_WAIT, WRITE_WAIT};

/// One frame on a transport, reduced to what the fabric routes on.
/// Binary payloads are not part of the protocol and terminate the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary,
    Ping,
    Pong,
    Close,
}

/// Outbound half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Frame) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a connection. `None` means the peer went away.
#[async_trait]
pub trait FrameSource: Send {
    async fn next(&mut self) -> Option<Result<Frame>>;
}

/// Receives each inbound text frame from the read pump.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_frame(&self, text: &str);
}

pub struct Transport {
    writer: Mutex<Box<dyn FrameSink>>,
    open: AtomicBool,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Transport {
    pub fn new(sink: Box<dyn FrameSink>) -> Arc<Self> {
        let (done_tx, done_rx) = watch::channel(false);
        Arc::new(Self {
            writer: Mutex::new(sink),
            open: AtomicBool::new(true),
            done_tx,
            done_rx,
        })
    }

    /// Start the read and write pumps. Call exactly once.
    pub fn start(self: &Arc<Self>, source: Box<dyn FrameSource>, handler: Arc<dyn MessageHandler>) {
        let transport = self.clone();
        tokio::spawn(read_pump(transport, source, handler));
        let transport = self.clone();
        tokio::spawn(write_pump(transport));
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Write one text frame under the write deadline. A deadline overrun or
    /// write error closes the transport.
    pub async fn write(&self, text: String) -> Result<()> {
        self.send_frame(Frame::Text(text)).await
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        if !self.is_open() {
            bail!("transport is closed");
        }
        let mut writer = self.writer.lock().await;
        let result = timeout(WRITE_WAIT, writer.send(frame)).await;
        drop(writer);
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.shutdown().await;
                Err(e)
            }
            Err(_) => {
                self.shutdown().await;
                bail!("write deadline exceeded")
            }
        }
    }

    /// Close the connection and signal done. Idempotent.
    pub async fn shutdown(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let mut writer = self.writer.lock().await;
            let _ = timeout(WRITE_WAIT, writer.close()).await;
        }
        let _ = self.done_tx.send(true);
    }

    /// A receiver that observes the done signal.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }

    /// Block until the transport is closed.
    pub async fn wait_done(&self) {
        let mut done = self.done();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn read_pump(
    transport: Arc<Transport>,
    mut source: Box<dyn FrameSource>,
    handler: Arc<dyn MessageHandler>,
) {
    // Only a pong refreshes the read deadline. Application traffic does not
    // count as liveness; the peer's ping ticker is what keeps an otherwise
    // healthy connection inside the window.
    let mut deadline = Instant::now() + PONG_WAIT;
    loop {
        let frame = match timeout_at(deadline, source.next()).await {
            Err(_) => break,
            Ok(None) => break,
            Ok(Some(Err(_))) => break,
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Frame::Text(text) => {
                if text.len() > MAX_MESSAGE_SIZE {
                    break;
                }
                handler.handle_frame(&text).await;
            }
            Frame::Ping => {
                if transport.send_frame(Frame::Pong).await.is_err() {
                    break;
                }
            }
            Frame::Pong => {
                deadline = Instant::now() + PONG_WAIT;
            }
            Frame::Binary | Frame::Close => break,
        }
    }

    transport.shutdown().await;
}

async fn write_pump(transport: Arc<Transport>) {
    let mut ticker = tokio::time::interval(PING_PERIOD);
    ticker.tick().await; // immediate first tick
    let mut done = transport.done();

    loop {
        tokio::select! {
            _ = done.changed() => break,
            _ = ticker.tick() => {
                if transport.send_frame(Frame::Ping).await.is_err() {
                    break;
                }
            }
        }
    }

    transport.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// A sink whose sends never complete, like a peer that stopped reading
    /// with full socket buffers.
    struct StuckSink;

    #[async_trait]
    impl FrameSink for StuckSink {
        async fn send(&mut self, _frame: Frame) -> Result<()> {
            futures_util::future::pending().await
        }
        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct RecordingSink(tokio::sync::mpsc::UnboundedSender<Frame>);

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send(&mut self, frame: Frame) -> Result<()> {
            let _ = self.0.send(frame);
            Ok(())
        }
        async fn close(&mut self) -> Result<()> {
            let _ = self.0.send(Frame::Close);
            Ok(())
        }
    }

    struct ScriptedSource(Vec<Frame>);

    #[async_trait]
    impl FrameSource for ScriptedSource {
        async fn next(&mut self) -> Option<Result<Frame>> {
            if self.0.is_empty() {
                // Connection stays open but silent.
                futures_util::future::pending().await
            } else {
                Some(Ok(self.0.remove(0)))
            }
        }
    }

    struct CollectingHandler(tokio::sync::mpsc::UnboundedSender<String>);

    #[async_trait]
    impl MessageHandler for CollectingHandler {
        async fn handle_frame(&self, text: &str) {
            let _ = self.0.send(text.to_string());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_write_trips_the_deadline_and_closes() {
        let transport = Transport::new(Box::new(StuckSink));
        let result = transport.write("hello".into()).await;
        assert!(result.is_err());
        assert!(!transport.is_open());
        assert!(*transport.done().borrow());
    }

    #[tokio::test]
    async fn frames_reach_the_handler_and_pings_are_answered() {
        let (sink_tx, mut sink_rx) = tokio::sync::mpsc::unbounded_channel();
        let (text_tx, mut text_rx) = tokio::sync::mpsc::unbounded_channel();

        let transport = Transport::new(Box::new(RecordingSink(sink_tx)));
        let source = ScriptedSource(vec![
            Frame::Text("one".into()),
            Frame::Ping,
            Frame::Text("two".into()),
        ]);
        transport.start(Box::new(source), Arc::new(CollectingHandler(text_tx)));

        assert_eq!(text_rx.recv().await.as_deref(), Some("one"));
        assert_eq!(text_rx.recv().await.as_deref(), Some("two"));

        // The ping in between must have produced an outbound frame
        // (the write pump's immediate ping may arrive first).
        let mut saw_pong = false;
        for _ in 0..3 {
            match sink_rx.recv().await {
                Some(Frame::Pong) => {
                    saw_pong = true;
                    break;
                }
                Some(_) => continue,
                None => break,
            }
        }
        assert!(saw_pong, "inbound ping was not answered with a pong");
    }

    /// Yields one text frame halfway through the pong window, then goes
    /// silent without ever ponging.
    struct LateTextThenSilence(bool);

    #[async_trait]
    impl FrameSource for LateTextThenSilence {
        async fn next(&mut self) -> Option<Result<Frame>> {
            if !self.0 {
                self.0 = true;
                tokio::time::sleep(PONG_WAIT / 2).await;
                Some(Ok(Frame::Text("late".into())))
            } else {
                futures_util::future::pending().await
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn only_pongs_reset_the_read_deadline() {
        let (sink_tx, _sink_rx) = tokio::sync::mpsc::unbounded_channel();
        let (text_tx, mut text_rx) = tokio::sync::mpsc::unbounded_channel();

        let transport = Transport::new(Box::new(RecordingSink(sink_tx)));
        let started = Instant::now();
        transport.start(
            Box::new(LateTextThenSilence(false)),
            Arc::new(CollectingHandler(text_tx)),
        );

        assert_eq!(text_rx.recv().await.as_deref(), Some("late"));
        transport.wait_done().await;

        // The text frame at t = pong_wait/2 must not have pushed the
        // deadline out; death comes at the original pong_wait mark.
        let elapsed = started.elapsed();
        assert!(
            elapsed >= PONG_WAIT && elapsed < PONG_WAIT + PONG_WAIT / 2,
            "read deadline moved: closed after {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn oversized_frame_terminates_the_connection() {
        let (sink_tx, _sink_rx) = tokio::sync::mpsc::unbounded_channel();
        let (text_tx, mut text_rx) = tokio::sync::mpsc::unbounded_channel();

        let transport = Transport::new(Box::new(RecordingSink(sink_tx)));
        let big = "x".repeat(MAX_MESSAGE_SIZE + 1);
        let source = ScriptedSource(vec![Frame::Text(big), Frame::Text("after".into())]);
        transport.start(Box::new(source), Arc::new(CollectingHandler(text_tx)));

        transport.wait_done().await;
        assert!(!transport.is_open());
        assert_eq!(text_rx.recv().await, None, "no frame may follow an oversized one");
    }

    #[tokio::test]
    async fn binary_frame_terminates_the_connection() {
        let (sink_tx, _sink_rx) = tokio::sync::mpsc::unbounded_channel();
        let (text_tx, _text_rx) = tokio::sync::mpsc::unbounded_channel();

        let transport = Transport::new(Box::new(RecordingSink(sink_tx)));
        let source = ScriptedSource(vec![Frame::Binary]);
        transport.start(Box::new(source), Arc::new(CollectingHandler(text_tx)));

        transport.wait_done().await;
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (sink_tx, mut sink_rx) = tokio::sync::mpsc::unbounded_channel();
        let transport = Transport::new(Box::new(RecordingSink(sink_tx)));
        transport.shutdown().await;
        transport.shutdown().await;
        assert_eq!(sink_rx.recv().await, Some(Frame::Close));
        assert!(
            tokio::time::timeout(Duration::from_millis(50), sink_rx.recv())
                .await
                .is_err(),
            "close must be sent exactly once"
        );
    }
}
