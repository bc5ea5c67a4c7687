//! Parent election.
//!
//! A node attaches to the tree by asking its elders, nearest first, to adopt
//! it. The first elder answering `ACCEPT` becomes its parent. Elections are
//! purely local: two nodes electing at once can build a cycle or split the
//! community, and nothing here detects it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::OverlayError;
use crate::membership::{IdentityProvider, MembershipView};
use crate::message::{Header, Message};
use crate::model::{Member, Relationship};
use crate::transport::{Connection, Received, Timeouts};

/// Position of the local node in one community tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TreeState {
    /// No parent: either the root or a node whose search failed.
    #[default]
    Orphan,
    Searching,
    Attached {
        parent: String,
    },
}

/// Result of answering a `REQUEST_PARENT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentResponse {
    Accepted,
    Rejected,
}

pub struct ParentElector {
    membership: Arc<dyn MembershipView>,
    identity: Arc<dyn IdentityProvider>,
    timeouts: Timeouts,
    source: Option<IpAddr>,
    states: Mutex<HashMap<String, TreeState>>,
}

impl ParentElector {
    pub fn new(
        membership: Arc<dyn MembershipView>,
        identity: Arc<dyn IdentityProvider>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            membership,
            identity,
            timeouts,
            source: None,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Binds outbound connections to `source`.
    pub fn with_source(mut self, source: Option<IpAddr>) -> Self {
        self.source = source;
        self
    }

    pub async fn tree_state(&self, community_id: &str) -> TreeState {
        let states = self.states.lock().await;
        states.get(community_id).cloned().unwrap_or_default()
    }

    /// Forgets the parent of `community_id` after the local node left it.
    pub async fn detach(&self, community_id: &str) {
        self.set_state(community_id, TreeState::Orphan).await;
    }

    /// Searches for a parent among the members that joined before us.
    ///
    /// Candidates are tried one at a time from the most recent elder back to
    /// the founder. `exclude_key` skips a parent that just left. `Ok(None)`
    /// means nobody accepted and the node stays an orphan.
    pub async fn elect_parent(
        &self,
        community_id: &str,
        exclude_key: Option<&str>,
    ) -> Result<Option<Member>, OverlayError> {
        self.set_state(community_id, TreeState::Searching).await;
        let outcome = self.search(community_id, exclude_key).await;

        let state = match &outcome {
            Ok(Some(parent)) => TreeState::Attached {
                parent: parent.key.clone(),
            },
            _ => TreeState::Orphan,
        };
        self.set_state(community_id, state).await;
        outcome
    }

    async fn search(
        &self,
        community_id: &str,
        exclude_key: Option<&str>,
    ) -> Result<Option<Member>, OverlayError> {
        let local = self.identity.self_identity(community_id).await?;
        let mut elders = self
            .membership
            .list_elders(community_id, local.joined_at, exclude_key)
            .await?;
        elders.sort_by_key(|member| member.joined_at);

        let request = Message::for_community(Header::RequestParent, community_id, local.key);
        for candidate in elders.into_iter().rev() {
            match self.ask(&candidate, &request).await {
                Ok(true) => {
                    self.membership
                        .set_relationship(community_id, &candidate.key, Relationship::Parent)
                        .await?;
                    info!(community_id, parent = %candidate.key, "attached to parent");
                    return Ok(Some(candidate));
                }
                Ok(false) => {
                    debug!(community_id, candidate = %candidate.key, "candidate declined");
                }
                Err(err) if err.is_peer_failure() => {
                    debug!(community_id, candidate = %candidate.key, error = %err, "candidate unreachable");
                }
                Err(err) => return Err(err),
            }
        }

        warn!(community_id, "no elder accepted; staying orphan");
        Ok(None)
    }

    /// One attempt: connect, request, wait for the verdict, close.
    async fn ask(&self, candidate: &Member, request: &Message) -> Result<bool, OverlayError> {
        let mut connection = Connection::connect_from(candidate.address, self.source, self.timeouts).await?;
        let reply = connection.request(request).await;
        connection.close().await;

        Ok(matches!(
            reply?,
            Received::Message(message) if message.header() == Header::Accept
        ))
    }

    /// Adopts `requester_key` as a child and answers on the same connection.
    ///
    /// The connection is closed on every path.
    pub async fn respond_to_parent_request(
        &self,
        connection: &mut Connection,
        community_id: &str,
        requester_key: &str,
    ) -> Result<ParentResponse, OverlayError> {
        let response = match self
            .membership
            .set_relationship(community_id, requester_key, Relationship::Child)
            .await
        {
            Ok(()) => {
                info!(community_id, child = %requester_key, "adopted child");
                ParentResponse::Accepted
            }
            Err(err) => {
                warn!(community_id, requester = %requester_key, error = %err, "refusing parent request");
                ParentResponse::Rejected
            }
        };

        let reply = match response {
            ParentResponse::Accepted => Message::new(Header::Accept),
            ParentResponse::Rejected => Message::new(Header::Reject),
        };
        let sent = connection.send(&reply).await;
        connection.close().await;
        sent.map(|()| response)
    }

    async fn set_state(&self, community_id: &str, state: TreeState) {
        let mut states = self.states.lock().await;
        states.insert(community_id.to_string(), state);
    }
}
