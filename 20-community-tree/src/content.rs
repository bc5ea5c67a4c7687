//! Content handler used by the `community-node` binary.
//!
//! Payloads are taken as plain text: `ADD_MEMBER` carries a member record,
//! ideas and opinions are logged. The admission handshake lives elsewhere,
//! so invitations are declined.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::dispatch::ContentHandler;
use crate::membership::InMemoryMembership;
use crate::message::{Header, Message};
use crate::model::Member;
use crate::transport::Connection;

/// A content message observed by [`RosterContent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posted {
    pub header: Header,
    pub community_id: String,
    pub content: String,
}

pub struct RosterContent {
    membership: Arc<InMemoryMembership>,
    posted: Mutex<Vec<Posted>>,
}

impl RosterContent {
    pub fn new(membership: Arc<InMemoryMembership>) -> Self {
        Self {
            membership,
            posted: Mutex::new(Vec::new()),
        }
    }

    /// Ideas and opinions received so far, oldest first.
    pub async fn posted(&self) -> Vec<Posted> {
        self.posted.lock().await.clone()
    }

    async fn record(&self, header: Header, community_id: &str, content: &str) {
        info!(community_id, %header, len = content.len(), "content received");
        self.posted.lock().await.push(Posted {
            header,
            community_id: community_id.to_string(),
            content: content.to_string(),
        });
    }
}

#[async_trait]
impl ContentHandler for RosterContent {
    async fn invitation(&self, connection: &mut Connection, _message: &Message) -> Result<()> {
        warn!(peer = %connection.peer_addr(), "declining invitation");
        connection.send(&Message::new(Header::Reject)).await?;
        Ok(())
    }

    async fn add_member(&self, community_id: &str, content: &str) -> Result<()> {
        let member = Member::from_record(content).context("invalid ADD_MEMBER payload")?;
        info!(community_id, key = %member.key, address = %member.address, "member added");
        self.membership.add_member(community_id, member).await?;
        Ok(())
    }

    async fn create_idea(&self, community_id: &str, content: &str) -> Result<()> {
        self.record(Header::CreateIdea, community_id, content).await;
        Ok(())
    }

    async fn create_opinion(&self, community_id: &str, content: &str) -> Result<()> {
        self.record(Header::CreateOpinion, community_id, content).await;
        Ok(())
    }
}
