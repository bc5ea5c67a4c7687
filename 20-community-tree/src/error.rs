//! Error types shared by the overlay layer.

use std::io;
use std::net::SocketAddr;

use crate::message::Header;

/// Codec failures raised while turning wire strings into messages and back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("invalid message header: {0}")]
    InvalidHeader(String),
}

/// Failures reported by the membership collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("unknown community {0}")]
    UnknownCommunity(String),

    #[error("member {key} is not part of community {community_id}")]
    UnknownMember { community_id: String, key: String },

    #[error("membership store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    /// Socket connect/send/receive failure, including timeouts.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("sender {sender} is not a member of community {community_id:?}")]
    NotAMember {
        community_id: Option<String>,
        sender: SocketAddr,
    },

    #[error("header {0} cannot be handled by this node")]
    UnknownHeader(Header),

    #[error("failed to bind {addr}: {source}")]
    BindFailure {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("content handler failed: {0:#}")]
    Collaborator(#[from] anyhow::Error),
}

impl OverlayError {
    /// Whether the failure belongs to one remote peer rather than to local state.
    ///
    /// Multi-target operations skip such peers and keep going.
    pub fn is_peer_failure(&self) -> bool {
        matches!(self, OverlayError::Transport(_) | OverlayError::Message(_))
    }

    pub(crate) fn timed_out(what: &str) -> Self {
        OverlayError::Transport(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{what} timed out"),
        ))
    }
}
