//! Communities, members and the local tree relationship tag.

use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result, anyhow, ensure};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a member in the local node's view of a community tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relationship {
    #[default]
    None,
    Parent,
    Child,
}

impl Relationship {
    /// Parents and children form the broadcast fan-out set.
    pub fn is_tree_neighbor(self) -> bool {
        !matches!(self, Relationship::None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Community {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl Community {
    pub const NAME_MIN_LENGTH: usize = 4;

    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        let name = name.into();
        ensure!(
            name.chars().count() >= Self::NAME_MIN_LENGTH,
            "community name must have at least {} characters",
            Self::NAME_MIN_LENGTH
        );
        Ok(Self {
            id: id.into(),
            name,
            description: description.into(),
            created_at,
        })
    }
}

/// One participant of a community as seen by the local node.
///
/// Everything but `relationship` is fixed once the record exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Authentication key, unique within the community.
    pub key: String,
    pub address: SocketAddr,
    /// Join time; orders elders during parent election.
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub relationship: Relationship,
}

impl Member {
    pub fn new(key: impl Into<String>, address: SocketAddr, joined_at: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            address,
            joined_at,
            last_seen: None,
            relationship: Relationship::None,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.address.ip()
    }

    /// Plain record form `key,ip,port,joined_at,last_seen` exchanged in
    /// `ADD_MEMBER` payloads once decrypted.
    pub fn to_record(&self) -> String {
        let last_seen = self
            .last_seen
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "None".to_string());
        format!(
            "{},{},{},{},{}",
            self.key,
            self.address.ip(),
            self.address.port(),
            self.joined_at.to_rfc3339(),
            last_seen
        )
    }

    pub fn from_record(record: &str) -> Result<Self> {
        let fields: Vec<&str> = record.trim().splitn(5, ',').collect();
        let [key, ip, port, joined_at, last_seen] = fields[..] else {
            return Err(anyhow!("member record needs 5 fields, got {}", fields.len()));
        };
        ensure!(!key.is_empty(), "member record has an empty key");

        let ip: IpAddr = ip.parse().with_context(|| format!("invalid ip {ip:?}"))?;
        let port: u16 = port.parse().with_context(|| format!("invalid port {port:?}"))?;
        let joined_at = parse_timestamp(joined_at)?;
        let last_seen = match last_seen {
            "None" | "" => None,
            value => Some(parse_timestamp(value)?),
        };

        Ok(Self {
            key: key.to_string(),
            address: SocketAddr::new(ip, port),
            joined_at,
            last_seen,
            relationship: Relationship::None,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp {value:?}"))
}
