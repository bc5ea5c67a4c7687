//! Inbound routing.
//!
//! Every message read by the listener goes through [`Dispatcher::handle`]:
//! authenticate the sender, run the handler for the header, relay to the
//! rest of the tree.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::broadcast::{Broadcaster, Exclusions};
use crate::departure::LeaveCoordinator;
use crate::election::ParentElector;
use crate::error::{MessageError, OverlayError};
use crate::membership::{MembershipView, SenderIdentity};
use crate::message::{Header, Message};
use crate::transport::Connection;

/// Handlers for the content headers. The overlay routes to them and relays
/// the message afterwards; what the payload means is up to the implementor.
#[async_trait]
pub trait ContentHandler: Send + Sync {
    /// Pre-membership handshake. Owns the conversation on `connection`.
    async fn invitation(&self, connection: &mut Connection, message: &Message)
    -> anyhow::Result<()>;

    async fn add_member(&self, community_id: &str, content: &str) -> anyhow::Result<()>;

    async fn create_idea(&self, community_id: &str, content: &str) -> anyhow::Result<()>;

    async fn create_opinion(&self, community_id: &str, content: &str) -> anyhow::Result<()>;
}

pub struct Dispatcher {
    membership: Arc<dyn MembershipView>,
    broadcaster: Arc<Broadcaster>,
    elector: Arc<ParentElector>,
    leave: Arc<LeaveCoordinator>,
    content: Arc<dyn ContentHandler>,
}

impl Dispatcher {
    pub fn new(
        membership: Arc<dyn MembershipView>,
        broadcaster: Arc<Broadcaster>,
        elector: Arc<ParentElector>,
        leave: Arc<LeaveCoordinator>,
        content: Arc<dyn ContentHandler>,
    ) -> Self {
        Self {
            membership,
            broadcaster,
            elector,
            leave,
            content,
        }
    }

    pub async fn handle(
        &self,
        sender: SocketAddr,
        connection: &mut Connection,
        message: Message,
    ) -> Result<(), OverlayError> {
        let header = message.header();
        let community_id = if header.is_handshake() {
            None
        } else {
            Some(self.authenticate(sender, &message).await?)
        };

        match (header, community_id) {
            (Header::Invitation, _) => {
                self.content.invitation(connection, &message).await?;
            }
            (Header::AddMember, Some(community_id)) => {
                self.content
                    .add_member(community_id, message.content().unwrap_or_default())
                    .await?;
            }
            (Header::CreateIdea, Some(community_id)) => {
                self.content
                    .create_idea(community_id, message.content().unwrap_or_default())
                    .await?;
            }
            (Header::CreateOpinion, Some(community_id)) => {
                self.content
                    .create_opinion(community_id, message.content().unwrap_or_default())
                    .await?;
            }
            (Header::RequestParent, Some(community_id)) => {
                let requester = member_key(&message)?;
                self.elector
                    .respond_to_parent_request(connection, community_id, requester)
                    .await?;
            }
            (Header::Deconnection, Some(community_id)) => {
                let peer_key = member_key(&message)?;
                self.leave
                    .handle_peer_departure(community_id, peer_key)
                    .await?;
            }
            (Header::Ping, Some(_)) => {
                connection.send(&Message::new(Header::Pong)).await?;
            }
            (
                Header::Ack
                | Header::Accept
                | Header::Data
                | Header::Database
                | Header::Pong
                | Header::Reject,
                _,
            ) => return Err(OverlayError::UnknownHeader(header)),
            (_, None) => {
                return Err(OverlayError::NotAMember {
                    community_id: None,
                    sender,
                });
            }
        }

        if let Some(community_id) = community_id.filter(|_| header.propagates()) {
            let mut exclusions = Exclusions::none().address(sender.ip());
            if header == Header::Deconnection {
                exclusions = exclusions.key(member_key(&message)?);
            }
            let relayed = self
                .broadcaster
                .broadcast(&message, community_id, exclusions)
                .await?;
            debug!(community_id, %header, relayed, "relayed message");
        }
        Ok(())
    }

    /// Checks that the sender belongs to the message's community and
    /// returns that community id.
    async fn authenticate<'m>(
        &self,
        sender: SocketAddr,
        message: &'m Message,
    ) -> Result<&'m str, OverlayError> {
        let not_a_member = || OverlayError::NotAMember {
            community_id: message.community_id().map(str::to_string),
            sender,
        };
        let community_id = message.community_id().ok_or_else(not_a_member)?;

        let mut known = self
            .membership
            .is_member(community_id, SenderIdentity::Address(sender.ip()))
            .await;
        if !known && message.header().authenticates_by_key() {
            if let Some(key) = message.content() {
                known = self
                    .membership
                    .is_member(community_id, SenderIdentity::Key(key))
                    .await;
            }
        }

        if known {
            Ok(community_id)
        } else {
            info!(%sender, community_id, header = %message.header(), "rejecting non-member");
            Err(not_a_member())
        }
    }
}

fn member_key(message: &Message) -> Result<&str, OverlayError> {
    message.content().ok_or_else(|| {
        OverlayError::Message(MessageError::MalformedMessage(format!(
            "{} requires a member key",
            message.header()
        )))
    })
}
