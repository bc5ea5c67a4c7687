//! Best-effort fan-out of one message to the local tree neighbors.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::debug;

use crate::error::OverlayError;
use crate::membership::{IdentityProvider, MembershipView};
use crate::message::Message;
use crate::model::Member;
use crate::transport::{Connection, Timeouts};

/// Identities a broadcast must skip. Owned by each call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exclusions {
    pub keys: HashSet<String>,
    pub addresses: HashSet<IpAddr>,
}

impl Exclusions {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.keys.insert(key.into());
        self
    }

    pub fn address(mut self, address: IpAddr) -> Self {
        self.addresses.insert(address);
        self
    }

    pub fn excludes(&self, member: &Member) -> bool {
        self.keys.contains(&member.key) || self.addresses.contains(&member.ip())
    }
}

pub struct Broadcaster {
    membership: Arc<dyn MembershipView>,
    identity: Arc<dyn IdentityProvider>,
    timeouts: Timeouts,
    source: Option<IpAddr>,
}

impl Broadcaster {
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
        }
    }

    /// Binds outbound connections to `source`.
    pub fn with_source(mut self, source: Option<IpAddr>) -> Self {
        self.source = source;
        self
    }

    /// Sends `message` unchanged to every tree neighbor of `community_id`
    /// that is not excluded and is not the local node.
    ///
    /// Returns how many neighbors accepted the message. An unreachable
    /// neighbor is skipped without retry.
    pub async fn broadcast(
        &self,
        message: &Message,
        community_id: &str,
        exclusions: Exclusions,
    ) -> Result<usize, OverlayError> {
        let local = self.identity.self_identity(community_id).await?;
        let exclusions = exclusions.key(local.key.clone());
        let targets: Vec<Member> = self
            .membership
            .list_neighbors(community_id)
            .await?
            .into_iter()
            .filter(|member| member.address != local.address && !exclusions.excludes(member))
            .collect();

        let mut delivered = 0;
        for member in &targets {
            match self.deliver(member, message).await {
                Ok(()) => delivered += 1,
                Err(err) if err.is_peer_failure() => {
                    debug!(peer = %member.address, key = %member.key, error = %err, "neighbor unreachable");
                }
                Err(err) => return Err(err),
            }
        }
        debug!(
            community_id,
            header = %message.header(),
            delivered,
            targets = targets.len(),
            "broadcast finished"
        );
        Ok(delivered)
    }

    async fn deliver(&self, member: &Member, message: &Message) -> Result<(), OverlayError> {
        let mut connection = Connection::connect_from(member.address, self.source, self.timeouts).await?;
        let sent = connection.send(message).await;
        connection.close().await;
        sent
    }
}
