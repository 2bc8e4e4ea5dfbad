//! Message-framed transport contract.
//!
//! Concrete sockets (WebSocket, TLS, ...) live outside this crate; the stack
//! only consumes the connect/disconnect/send/receive contract below. The
//! in-memory [`ChannelConnection`] implements it for tests and embedders
//! that already own a framed byte pipe.

use crate::{Error, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

/// CRLF keep-alive frames (RFC 5626 §4.4.1).
pub const KEEPALIVE_REQUEST: &str = "\r\n\r\n";
pub const KEEPALIVE_RESPONSE: &str = "\r\n";

/// Events a connection raises towards the user agent.
#[derive(Debug)]
pub enum TransportEvent {
    Connecting(u32),
    Connected(SipConnection),
    Disconnected(Option<String>),
    Incoming(String, SipConnection),
}

pub type TransportReceiver = UnboundedReceiver<TransportEvent>;
pub type TransportSender = UnboundedSender<TransportEvent>;

/// A live message-framed connection.
///
/// `via_transport` is the token placed in Via headers and Contact transport
/// parameters ("WS", "WSS", "TCP", "TLS", "UDP").
#[derive(Clone, Debug)]
pub enum SipConnection {
    Channel(ChannelConnection),
}

impl SipConnection {
    pub fn via_transport(&self) -> &str {
        match self {
            SipConnection::Channel(c) => c.via_transport(),
        }
    }

    pub fn is_reliable(&self) -> bool {
        match self {
            SipConnection::Channel(_) => true,
        }
    }

    pub fn is_sips(&self) -> bool {
        matches!(self.via_transport(), "WSS" | "TLS")
    }

    pub async fn connect(&self) -> Result<()> {
        match self {
            SipConnection::Channel(c) => c.connect().await,
        }
    }

    pub async fn send(&self, frame: &str) -> Result<()> {
        match self {
            SipConnection::Channel(c) => c.send(frame).await,
        }
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        match self {
            SipConnection::Channel(c) => c.serve_loop(sender).await,
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self {
            SipConnection::Channel(c) => c.close().await,
        }
    }
}

impl std::fmt::Display for SipConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SipConnection::Channel(c) => write!(f, "{}", c),
        }
    }
}

impl From<ChannelConnection> for SipConnection {
    fn from(connection: ChannelConnection) -> Self {
        SipConnection::Channel(connection)
    }
}

struct ChannelInner {
    sink: UnboundedSender<String>,
    incoming: Mutex<Option<UnboundedReceiver<String>>>,
    via_transport: String,
    cancel_token: CancellationToken,
}

/// In-memory framed connection: whatever one side sends, the peer receives.
#[derive(Clone)]
pub struct ChannelConnection {
    inner: Arc<ChannelInner>,
}

impl ChannelConnection {
    /// Creates two connections wired back to back.
    pub fn pair(via_transport: &str) -> (ChannelConnection, ChannelConnection) {
        let (a_sink, b_source) = unbounded_channel();
        let (b_sink, a_source) = unbounded_channel();
        let make = |sink, source| ChannelConnection {
            inner: Arc::new(ChannelInner {
                sink,
                incoming: Mutex::new(Some(source)),
                via_transport: via_transport.to_string(),
                cancel_token: CancellationToken::new(),
            }),
        };
        (make(a_sink, a_source), make(b_sink, b_source))
    }

    pub fn via_transport(&self) -> &str {
        &self.inner.via_transport
    }

    pub async fn connect(&self) -> Result<()> {
        if self.inner.cancel_token.is_cancelled() {
            return Err(Error::TransportError("connection closed".to_string()));
        }
        Ok(())
    }

    pub async fn send(&self, frame: &str) -> Result<()> {
        if self.inner.cancel_token.is_cancelled() {
            return Err(Error::TransportError("connection closed".to_string()));
        }
        self.inner
            .sink
            .send(frame.to_string())
            .map_err(|_| Error::TransportError("peer gone".to_string()))
    }

    /// Pumps inbound frames to the user agent until the peer hangs up or
    /// the connection is closed. May be called once per connection.
    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let incoming = self.inner.incoming.lock().unwrap().take();
        let mut incoming = incoming.ok_or_else(|| {
            Error::TransportError("serve_loop called twice on one connection".to_string())
        })?;
        loop {
            tokio::select! {
                _ = self.inner.cancel_token.cancelled() => return Ok(()),
                frame = incoming.recv() => match frame {
                    Some(frame) => {
                        sender.send(TransportEvent::Incoming(
                            frame,
                            SipConnection::Channel(self.clone()),
                        ))?;
                    }
                    None => return Ok(()),
                },
            }
        }
    }

    /// Receives the next frame directly; test-side counterpart of
    /// `serve_loop`.
    pub async fn recv(&self) -> Option<String> {
        // peers in tests poll without a serve loop
        let mut receiver = self.inner.incoming.lock().unwrap().take()?;
        let frame = receiver.recv().await;
        *self.inner.incoming.lock().unwrap() = Some(receiver);
        frame
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.cancel_token.cancel();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel_token.is_cancelled()
    }
}

impl std::fmt::Display for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} *:*", self.inner.via_transport)
    }
}

impl std::fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} *:*", self.inner.via_transport)
    }
}
