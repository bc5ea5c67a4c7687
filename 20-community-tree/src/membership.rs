//! Membership collaborator seam.
//!
//! The overlay never owns member records. It reads and tags them through
//! [`MembershipView`] and learns who it is through [`IdentityProvider`].
//! [`InMemoryMembership`] implements both for the binary and for tests.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result, ensure};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::model::{Community, Member, Relationship};

/// How an inbound sender may be recognized as a member.
#[derive(Debug, Clone, Copy)]
pub enum SenderIdentity<'a> {
    Address(IpAddr),
    Key(&'a str),
}

#[async_trait]
pub trait MembershipView: Send + Sync {
    /// Ids of every community the local node belongs to.
    async fn communities(&self) -> Vec<String>;

    async fn member(&self, community_id: &str, key: &str) -> Result<Option<Member>, StoreError>;

    async fn is_member(&self, community_id: &str, sender: SenderIdentity<'_>) -> bool;

    /// Members tagged `Parent` or `Child`.
    async fn list_neighbors(&self, community_id: &str) -> Result<Vec<Member>, StoreError>;

    /// Members that joined strictly before `before`, oldest first.
    async fn list_elders(
        &self,
        community_id: &str,
        before: DateTime<Utc>,
        exclude_key: Option<&str>,
    ) -> Result<Vec<Member>, StoreError>;

    async fn set_relationship(
        &self,
        community_id: &str,
        key: &str,
        relationship: Relationship,
    ) -> Result<(), StoreError>;

    async fn clear_all_relationships(&self, community_id: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// The local node's own member record in `community_id`.
    async fn self_identity(&self, community_id: &str) -> Result<Member, StoreError>;
}

#[derive(Debug, Clone)]
struct CommunityRecord {
    community: Community,
    self_key: String,
    members: BTreeMap<String, Member>,
}

/// Mutex-guarded membership table, one entry per community.
///
/// Every call takes the lock once, so a relationship update is atomic and a
/// neighbor listing is a consistent snapshot.
#[derive(Default)]
pub struct InMemoryMembership {
    communities: Mutex<HashMap<String, CommunityRecord>>,
}

impl InMemoryMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a community together with the local node's own record.
    pub async fn insert_community(&self, community: Community, local: Member) {
        let mut communities = self.communities.lock().await;
        let mut members = BTreeMap::new();
        let self_key = local.key.clone();
        members.insert(local.key.clone(), local);
        communities.insert(
            community.id.clone(),
            CommunityRecord {
                community,
                self_key,
                members,
            },
        );
    }

    /// Adds or replaces a member record. An existing tag is kept.
    pub async fn add_member(&self, community_id: &str, mut member: Member) -> Result<(), StoreError> {
        let mut communities = self.communities.lock().await;
        let record = communities
            .get_mut(community_id)
            .ok_or_else(|| StoreError::UnknownCommunity(community_id.to_string()))?;
        if let Some(existing) = record.members.get(&member.key) {
            member.relationship = existing.relationship;
        }
        record.members.insert(member.key.clone(), member);
        Ok(())
    }

    pub async fn community(&self, community_id: &str) -> Option<Community> {
        let communities = self.communities.lock().await;
        communities
            .get(community_id)
            .map(|record| record.community.clone())
    }

    /// Relationship tags of every other member, keyed by member key.
    pub async fn relationships(&self, community_id: &str) -> BTreeMap<String, Relationship> {
        let communities = self.communities.lock().await;
        communities
            .get(community_id)
            .map(|record| {
                record
                    .members
                    .values()
                    .filter(|member| member.key != record.self_key)
                    .map(|member| (member.key.clone(), member.relationship))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn from_roster(roster: Roster) -> Result<Self> {
        let membership = Self::new();
        for entry in roster.communities {
            let community = Community::new(
                entry.id,
                entry.name,
                entry.description,
                entry.created_at,
            )?;
            let local = entry
                .members
                .iter()
                .find(|member| member.key == entry.self_key)
                .cloned()
                .with_context(|| {
                    format!(
                        "roster for {} does not list self key {}",
                        community.id, entry.self_key
                    )
                })?;
            let community_id = community.id.clone();
            membership.insert_community(community, local).await;
            for member in entry.members {
                membership.add_member(&community_id, member).await?;
            }
        }
        Ok(membership)
    }
}

fn community<'a>(
    communities: &'a HashMap<String, CommunityRecord>,
    community_id: &str,
) -> Result<&'a CommunityRecord, StoreError> {
    communities
        .get(community_id)
        .ok_or_else(|| StoreError::UnknownCommunity(community_id.to_string()))
}

#[async_trait]
impl MembershipView for InMemoryMembership {
    async fn communities(&self) -> Vec<String> {
        let communities = self.communities.lock().await;
        let mut ids: Vec<String> = communities.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn member(&self, community_id: &str, key: &str) -> Result<Option<Member>, StoreError> {
        let communities = self.communities.lock().await;
        Ok(community(&communities, community_id)?.members.get(key).cloned())
    }

    async fn is_member(&self, community_id: &str, sender: SenderIdentity<'_>) -> bool {
        let communities = self.communities.lock().await;
        let Some(record) = communities.get(community_id) else {
            return false;
        };
        match sender {
            SenderIdentity::Key(key) => record.members.contains_key(key),
            SenderIdentity::Address(ip) => record.members.values().any(|member| member.ip() == ip),
        }
    }

    async fn list_neighbors(&self, community_id: &str) -> Result<Vec<Member>, StoreError> {
        let communities = self.communities.lock().await;
        Ok(community(&communities, community_id)?
            .members
            .values()
            .filter(|member| member.relationship.is_tree_neighbor())
            .cloned()
            .collect())
    }

    async fn list_elders(
        &self,
        community_id: &str,
        before: DateTime<Utc>,
        exclude_key: Option<&str>,
    ) -> Result<Vec<Member>, StoreError> {
        let communities = self.communities.lock().await;
        let mut elders: Vec<Member> = community(&communities, community_id)?
            .members
            .values()
            .filter(|member| member.joined_at < before)
            .filter(|member| Some(member.key.as_str()) != exclude_key)
            .cloned()
            .collect();
        elders.sort_by_key(|member| member.joined_at);
        Ok(elders)
    }

    async fn set_relationship(
        &self,
        community_id: &str,
        key: &str,
        relationship: Relationship,
    ) -> Result<(), StoreError> {
        let mut communities = self.communities.lock().await;
        let record = communities
            .get_mut(community_id)
            .ok_or_else(|| StoreError::UnknownCommunity(community_id.to_string()))?;
        if !record.members.contains_key(key) {
            return Err(StoreError::UnknownMember {
                community_id: community_id.to_string(),
                key: key.to_string(),
            });
        }

        // at most one parent per community
        if relationship == Relationship::Parent {
            for member in record.members.values_mut() {
                if member.relationship == Relationship::Parent && member.key != key {
                    member.relationship = Relationship::None;
                }
            }
        }
        if let Some(member) = record.members.get_mut(key) {
            member.relationship = relationship;
        }
        Ok(())
    }

    async fn clear_all_relationships(&self, community_id: &str) -> Result<(), StoreError> {
        let mut communities = self.communities.lock().await;
        let record = communities
            .get_mut(community_id)
            .ok_or_else(|| StoreError::UnknownCommunity(community_id.to_string()))?;
        for member in record.members.values_mut() {
            member.relationship = Relationship::None;
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityProvider for InMemoryMembership {
    async fn self_identity(&self, community_id: &str) -> Result<Member, StoreError> {
        let communities = self.communities.lock().await;
        let record = community(&communities, community_id)?;
        record
            .members
            .get(&record.self_key)
            .cloned()
            .ok_or_else(|| StoreError::UnknownMember {
                community_id: community_id.to_string(),
                key: record.self_key.clone(),
            })
    }
}

/// JSON seed for an [`InMemoryMembership`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Roster {
    pub communities: Vec<RosterCommunity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterCommunity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    /// Key of the local node's own entry in `members`.
    pub self_key: String,
    pub members: Vec<Member>,
}

impl Roster {
    pub async fn load(path: &Path) -> Result<Self> {
        let data = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read roster {}", path.display()))?;
        let roster: Roster = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse roster {}", path.display()))?;
        ensure!(
            !roster.communities.is_empty(),
            "roster {} lists no community",
            path.display()
        );
        Ok(roster)
    }
}
