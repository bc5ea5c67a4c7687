#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use community_tree::membership::{InMemoryMembership, MembershipView};
use community_tree::transport::{Connection, Received, Timeouts};
use community_tree::{Community, Header, Member, Message, Relationship};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub const COMMUNITY: &str = "c1";

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// `127.0.0.<host>`. Linux routes the whole loopback block, so each test
/// node can own a distinct address.
pub fn loopback(host: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, host))
}

pub fn at(year: i32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).unwrap()
}

pub fn fast_timeouts() -> Timeouts {
    Timeouts {
        connect: Duration::from_millis(500),
        io: Duration::from_secs(1),
    }
}

/// An address nobody listens on.
pub async fn dead_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Store seeded with the local node (`self`) joined at `self_year`.
pub async fn store_with_self(self_addr: SocketAddr, self_year: i32) -> Arc<InMemoryMembership> {
    let membership = Arc::new(InMemoryMembership::new());
    let community = Community::new(COMMUNITY, "garden", "test community", at(1960)).unwrap();
    membership
        .insert_community(community, Member::new("self", self_addr, at(self_year)))
        .await;
    membership
}

pub async fn add(
    membership: &InMemoryMembership,
    key: &str,
    addr: SocketAddr,
    year: i32,
    relationship: Relationship,
) {
    membership
        .add_member(COMMUNITY, Member::new(key, addr, at(year)))
        .await
        .unwrap();
    if relationship != Relationship::None {
        membership
            .set_relationship(COMMUNITY, key, relationship)
            .await
            .unwrap();
    }
}

pub async fn relationship_of(membership: &InMemoryMembership, key: &str) -> Relationship {
    membership
        .member(COMMUNITY, key)
        .await
        .unwrap()
        .map(|member| member.relationship)
        .unwrap_or_default()
}

/// A stand-in peer that records every message it receives and optionally
/// answers each one with a fixed reply.
pub struct FakePeer {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<Message>>>,
    task: JoinHandle<()>,
}

impl FakePeer {
    pub async fn silent() -> Self {
        Self::spawn(LOCALHOST, None).await
    }

    pub async fn silent_on(ip: IpAddr) -> Self {
        Self::spawn(ip, None).await
    }

    pub async fn replying(header: Header) -> Self {
        Self::spawn(LOCALHOST, Some(Message::new(header))).await
    }

    async fn spawn(ip: IpAddr, reply: Option<Message>) -> Self {
        let listener = TcpListener::bind(SocketAddr::new(ip, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&received);

        let task = tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                let mut connection = Connection::from_stream(stream, peer, Timeouts::default());
                if let Ok((Received::Message(message), _)) = connection.receive().await {
                    log.lock().await.push(message);
                    if let Some(reply) = &reply {
                        let _ = connection.send(reply).await;
                    }
                }
                connection.close().await;
            }
        });

        Self {
            addr,
            received,
            task,
        }
    }

    pub async fn received(&self) -> Vec<Message> {
        self.received.lock().await.clone()
    }

    /// Waits until at least `count` messages arrived and returns them all.
    pub async fn wait_for(&self, count: usize) -> Vec<Message> {
        for _ in 0..100 {
            let received = self.received().await;
            if received.len() >= count {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "peer {} received {} messages, expected {count}",
            self.addr,
            self.received().await.len()
        );
    }
}

impl Drop for FakePeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Both ends of one loopback connection: `(client, server)`.
pub async fn connection_pair() -> (Connection, Connection) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(
        Connection::connect(addr, fast_timeouts()),
        listener.accept()
    );
    let (stream, peer) = accepted.unwrap();
    (
        client.unwrap(),
        Connection::from_stream(stream, peer, fast_timeouts()),
    )
}
