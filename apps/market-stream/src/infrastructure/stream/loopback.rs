//! In-Process Loopback Transport
//!
//! A [`Connector`] whose connections terminate in the same process. Each
//! successful connect hands a [`LoopbackPeer`] to the paired
//! [`LoopbackAcceptor`]; the peer plays the feed: it pushes frames to the
//! client, reads what the client wrote, and closes or fails the connection
//! on demand. Dropping a peer looks like an unexpected close to the client.
//!
//! Greeting frames configured with [`LoopbackConnector::with_greeting`] are
//! queued on every new connection before the peer is handed out, so a
//! provider handshake completes without a concurrently running server.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::application::ports::{
    Connection, Connector, FrameSink, FrameSource, TransportError, WireFrame,
};

type Inbound = Result<WireFrame, TransportError>;

#[derive(Debug, Default)]
struct ConnectorState {
    greeting: Vec<String>,
    refuse: bool,
    attempts: u32,
    last_url: Option<String>,
}

/// Connector producing in-process connections.
#[derive(Debug)]
pub struct LoopbackConnector {
    state: Mutex<ConnectorState>,
    accept_tx: mpsc::UnboundedSender<LoopbackPeer>,
}

/// Receives the server end of each new connection.
#[derive(Debug)]
pub struct LoopbackAcceptor {
    rx: mpsc::UnboundedReceiver<LoopbackPeer>,
}

impl LoopbackConnector {
    /// Create a connector and its acceptor.
    #[must_use]
    pub fn pair() -> (Arc<Self>, LoopbackAcceptor) {
        let (accept_tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            state: Mutex::new(ConnectorState::default()),
            accept_tx,
        });
        (connector, LoopbackAcceptor { rx })
    }

    /// Text frames queued to the client on every connection.
    pub fn with_greeting<I, S>(&self, frames: I) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.lock().greeting = frames.into_iter().map(Into::into).collect();
        self
    }

    /// Make subsequent connection attempts fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse = refuse;
    }

    /// Connection attempts so far, refused ones included.
    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().attempts
    }

    /// URL of the most recent attempt.
    #[must_use]
    pub fn last_url(&self) -> Option<String> {
        self.state.lock().last_url.clone()
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, url: &str) -> Result<Connection, TransportError> {
        let greeting = {
            let mut state = self.state.lock();
            state.attempts += 1;
            state.last_url = Some(url.to_string());
            if state.refuse {
                return Err(TransportError::Connect {
                    endpoint: url.to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            state.greeting.clone()
        };

        let (to_client, client_rx) = mpsc::unbounded_channel::<Inbound>();
        let (client_tx, from_client) = mpsc::unbounded_channel::<WireFrame>();

        for text in greeting {
            let _ = to_client.send(Ok(WireFrame::Text(text)));
        }

        // A missing acceptor drops the peer, which the client sees as a close.
        let _ = self.accept_tx.send(LoopbackPeer {
            to_client,
            from_client,
        });

        Ok(Connection {
            sink: Box::new(LoopbackSink { tx: client_tx }),
            source: Box::new(LoopbackSource { rx: client_rx }),
        })
    }
}

impl LoopbackAcceptor {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Option<LoopbackPeer> {
        self.rx.recv().await
    }

    /// The next connection, if one is already pending.
    pub fn try_accept(&mut self) -> Option<LoopbackPeer> {
        self.rx.try_recv().ok()
    }
}

/// Server end of a loopback connection.
#[derive(Debug)]
pub struct LoopbackPeer {
    to_client: mpsc::UnboundedSender<Inbound>,
    from_client: mpsc::UnboundedReceiver<WireFrame>,
}

impl LoopbackPeer {
    /// Push a text frame to the client. Returns `false` if the client is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.push(WireFrame::Text(text.into()))
    }

    /// Push any frame to the client.
    pub fn push(&self, frame: WireFrame) -> bool {
        self.to_client.send(Ok(frame)).is_ok()
    }

    /// Make the client's next read fail.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.to_client
            .send(Err(TransportError::Receive(reason.into())))
            .is_ok()
    }

    /// Next frame written by the client. `None` once the client dropped its
    /// write half.
    pub async fn next_frame(&mut self) -> Option<WireFrame> {
        self.from_client.recv().await
    }

    /// Everything the client has written so far.
    pub fn drain(&mut self) -> Vec<WireFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Text frames the client has written so far.
    pub fn drain_texts(&mut self) -> Vec<String> {
        self.drain()
            .into_iter()
            .filter_map(|frame| match frame {
                WireFrame::Text(text) => Some(text),
                _ => None,
            })
            .collect()
    }
}

struct LoopbackSink {
    tx: mpsc::UnboundedSender<WireFrame>,
}

#[async_trait]
impl FrameSink for LoopbackSink {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx
            .send(WireFrame::Close)
            .map_err(|_| TransportError::Closed)
    }
}

struct LoopbackSource {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl FrameSource for LoopbackSource {
    async fn next_frame(&mut self) -> Option<Result<WireFrame, TransportError>> {
        self.rx.recv().await
    }
}
