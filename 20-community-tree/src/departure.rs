//! Graceful departure and reaction to departing peers.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::broadcast::{Broadcaster, Exclusions};
use crate::election::ParentElector;
use crate::error::OverlayError;
use crate::membership::{IdentityProvider, MembershipView};
use crate::message::{Header, Message};
use crate::model::{Member, Relationship};

pub struct LeaveCoordinator {
    membership: Arc<dyn MembershipView>,
    identity: Arc<dyn IdentityProvider>,
    broadcaster: Arc<Broadcaster>,
    elector: Arc<ParentElector>,
}

impl LeaveCoordinator {
    pub fn new(
        membership: Arc<dyn MembershipView>,
        identity: Arc<dyn IdentityProvider>,
        broadcaster: Arc<Broadcaster>,
        elector: Arc<ParentElector>,
    ) -> Self {
        Self {
            membership,
            identity,
            broadcaster,
            elector,
        }
    }

    /// Tells the neighbors of every community that we are leaving, then
    /// detaches locally. Never fails: a community whose notice could not go
    /// out is still detached.
    pub async fn announce_departure(&self) {
        for community_id in self.membership.communities().await {
            if let Err(err) = self.leave(&community_id).await {
                warn!(community_id, error = %err, "departure notice failed");
            }
            if let Err(err) = self.membership.clear_all_relationships(&community_id).await {
                warn!(community_id, error = %err, "failed to clear relationships");
            }
            self.elector.detach(&community_id).await;
        }
    }

    async fn leave(&self, community_id: &str) -> Result<(), OverlayError> {
        let local = self.identity.self_identity(community_id).await?;
        let notice = Message::for_community(Header::Deconnection, community_id, local.key);
        let notified = self
            .broadcaster
            .broadcast(&notice, community_id, Exclusions::none())
            .await?;
        info!(community_id, notified, "announced departure");
        Ok(())
    }

    /// Forgets `peer_key` as a tree neighbor. Losing the parent triggers a
    /// new election that skips the departed peer; the new parent, if any,
    /// is returned.
    pub async fn handle_peer_departure(
        &self,
        community_id: &str,
        peer_key: &str,
    ) -> Result<Option<Member>, OverlayError> {
        let Some(peer) = self.membership.member(community_id, peer_key).await? else {
            debug!(community_id, peer = %peer_key, "departure of unknown member ignored");
            return Ok(None);
        };

        self.membership
            .set_relationship(community_id, peer_key, Relationship::None)
            .await?;

        match peer.relationship {
            Relationship::Parent => {
                info!(community_id, parent = %peer_key, "parent left; electing a new one");
                self.elector.elect_parent(community_id, Some(peer_key)).await
            }
            Relationship::Child | Relationship::None => Ok(None),
        }
    }
}
