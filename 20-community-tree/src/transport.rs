//! Point-to-point TCP transport.
//!
//! A [`Connection`] carries exactly one request (and at most one reply) and
//! is then closed. The [`Listener`] accepts connections, reads one message
//! from each and hands it to the [`Dispatcher`].

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::select;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::OverlayError;
use crate::message::{Message, read_frame, write_frame};

/// Per-connection time limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    /// Bound on one send or one receive.
    pub io: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(2),
            io: Duration::from_secs(5),
        }
    }
}

/// What a peer sent: a protocol message, or raw text that did not decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Message(Message),
    Unstructured(String),
}

impl Received {
    pub fn into_message(self) -> Option<Message> {
        match self {
            Received::Message(message) => Some(message),
            Received::Unstructured(_) => None,
        }
    }
}

/// One stream socket to a peer. Dropping it releases the socket.
pub struct Connection {
    stream: Option<TcpStream>,
    peer: SocketAddr,
    timeouts: Timeouts,
}

impl Connection {
    pub async fn connect(addr: SocketAddr, timeouts: Timeouts) -> Result<Self, OverlayError> {
        Self::connect_from(addr, None, timeouts).await
    }

    /// Like [`Connection::connect`], but the local end is bound to `source`
    /// when given, so the peer sees that address as the sender.
    pub async fn connect_from(
        addr: SocketAddr,
        source: Option<IpAddr>,
        timeouts: Timeouts,
    ) -> Result<Self, OverlayError> {
        let stream = timeout(timeouts.connect, dial(addr, source))
            .await
            .map_err(|_| OverlayError::timed_out("connect"))??;
        Ok(Self {
            stream: Some(stream),
            peer: addr,
            timeouts,
        })
    }

    /// Wraps a stream accepted by a listener.
    pub fn from_stream(stream: TcpStream, peer: SocketAddr, timeouts: Timeouts) -> Self {
        Self {
            stream: Some(stream),
            peer,
            timeouts,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), OverlayError> {
        let wire = message.encode()?;
        let io_timeout = self.timeouts.io;
        let stream = self.stream_mut()?;
        timeout(io_timeout, write_frame(stream, wire.as_bytes()))
            .await
            .map_err(|_| OverlayError::timed_out("send"))??;
        Ok(())
    }

    /// Reads one frame. A payload that is not UTF-8 or fails to decode comes
    /// back as [`Received::Unstructured`] instead of an error.
    pub async fn receive(&mut self) -> Result<(Received, SocketAddr), OverlayError> {
        let io_timeout = self.timeouts.io;
        let peer = self.peer;
        let stream = self.stream_mut()?;
        let payload = timeout(io_timeout, read_frame(stream))
            .await
            .map_err(|_| OverlayError::timed_out("receive"))??;

        let received = match String::from_utf8(payload) {
            Ok(raw) => match Message::decode(&raw) {
                Ok(message) => Received::Message(message),
                Err(err) => {
                    debug!(%peer, error = %err, "received unstructured payload");
                    Received::Unstructured(raw)
                }
            },
            Err(err) => {
                debug!(%peer, error = %err, "received non-UTF-8 payload");
                Received::Unstructured(String::from_utf8_lossy(err.as_bytes()).into_owned())
            }
        };
        Ok((received, peer))
    }

    /// Sends `message` and waits for the single reply.
    pub async fn request(&mut self, message: &Message) -> Result<Received, OverlayError> {
        self.send(message).await?;
        let (reply, _) = self.receive().await?;
        Ok(reply)
    }

    /// Shuts the socket down. Calling it again is a no-op.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = stream.shutdown().await {
                debug!(peer = %self.peer, error = ?err, "socket shutdown failed");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream, OverlayError> {
        self.stream.as_mut().ok_or_else(|| {
            OverlayError::Transport(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection already closed",
            ))
        })
    }
}

async fn dial(addr: SocketAddr, source: Option<IpAddr>) -> io::Result<TcpStream> {
    let Some(ip) = source else {
        return TcpStream::connect(addr).await;
    };
    let socket = match ip {
        IpAddr::V4(_) => TcpSocket::new_v4()?,
        IpAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.bind(SocketAddr::new(ip, 0))?;
    socket.connect(addr).await
}

/// Accept loop serving one request per inbound connection.
pub struct Listener {
    listener: TcpListener,
    accept_timeout: Duration,
    timeouts: Timeouts,
}

impl Listener {
    pub async fn bind(
        addr: SocketAddr,
        accept_timeout: Duration,
        timeouts: Timeouts,
    ) -> Result<Self, OverlayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| OverlayError::BindFailure { addr, source })?;
        Ok(Self {
            listener,
            accept_timeout,
            timeouts,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until `shutdown` resolves, then waits for in-flight handlers.
    ///
    /// Each accepted connection runs on its own task. Accept timeouts are not
    /// errors; they only give the loop a chance to observe `shutdown`.
    pub async fn serve_until<F>(self, dispatcher: Arc<Dispatcher>, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let Listener {
            listener,
            accept_timeout,
            timeouts,
        } = self;
        tokio::pin!(shutdown);
        let mut handlers = JoinSet::new();

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("listener stopping");
                    break;
                }
                accepted = timeout(accept_timeout, listener.accept()) => match accepted {
                    Err(_) => {}
                    Ok(Ok((stream, peer))) => {
                        let dispatcher = Arc::clone(&dispatcher);
                        handlers.spawn(handle_connection(stream, peer, timeouts, dispatcher));
                    }
                    Ok(Err(err)) => warn!(error = ?err, "failed to accept connection"),
                },
                Some(finished) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(err) = finished {
                        warn!(error = ?err, "connection handler panicked");
                    }
                }
            }
        }

        while let Some(finished) = handlers.join_next().await {
            if let Err(err) = finished {
                warn!(error = ?err, "connection handler panicked");
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    timeouts: Timeouts,
    dispatcher: Arc<Dispatcher>,
) {
    let mut connection = Connection::from_stream(stream, peer, timeouts);
    match connection.receive().await {
        Ok((Received::Message(message), sender)) => {
            let header = message.header();
            if let Err(err) = dispatcher.handle(sender, &mut connection, message).await {
                warn!(%peer, %header, error = %err, "dropping message");
            }
        }
        Ok((Received::Unstructured(raw), _)) => {
            warn!(%peer, len = raw.len(), "dropping unstructured message");
        }
        Err(err) => warn!(%peer, error = %err, "failed to read message"),
    }
    connection.close().await;
}
