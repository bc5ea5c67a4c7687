mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use community_tree::broadcast::Broadcaster;
use community_tree::content::RosterContent;
use community_tree::departure::LeaveCoordinator;
use community_tree::dispatch::Dispatcher;
use community_tree::election::ParentElector;
use community_tree::membership::{InMemoryMembership, MembershipView};
use community_tree::transport::Received;
use community_tree::{Header, Message, OverlayError, Relationship};

use common::{
    COMMUNITY, FakePeer, add, connection_pair, dead_address, fast_timeouts, relationship_of,
    store_with_self,
};

const SENDER_KEY: &str = "s";

fn sender() -> SocketAddr {
    "10.0.0.9:1664".parse().unwrap()
}

struct Harness {
    store: Arc<InMemoryMembership>,
    content: Arc<RosterContent>,
    dispatcher: Dispatcher,
    parent: FakePeer,
    child: FakePeer,
}

/// Local node with a parent and a child listening on loopback, plus a
/// member `s` at a remote address that plays the sender.
async fn harness() -> Harness {
    let parent = FakePeer::replying(Header::Accept).await;
    let child = FakePeer::silent().await;

    let store = store_with_self(dead_address().await, 2000).await;
    add(&store, "p", parent.addr, 1990, Relationship::Parent).await;
    add(&store, "c", child.addr, 2010, Relationship::Child).await;
    add(&store, SENDER_KEY, sender(), 2011, Relationship::Child).await;

    let timeouts = fast_timeouts();
    let broadcaster = Arc::new(Broadcaster::new(store.clone(), store.clone(), timeouts));
    let elector = Arc::new(ParentElector::new(store.clone(), store.clone(), timeouts));
    let leave = Arc::new(LeaveCoordinator::new(
        store.clone(),
        store.clone(),
        Arc::clone(&broadcaster),
        Arc::clone(&elector),
    ));
    let content = Arc::new(RosterContent::new(store.clone()));
    let dispatcher = Dispatcher::new(
        store.clone(),
        broadcaster,
        elector,
        leave,
        content.clone(),
    );

    Harness {
        store,
        content,
        dispatcher,
        parent,
        child,
    }
}

impl Harness {
    async fn dispatch(&self, from: SocketAddr, message: Message) -> Result<(), OverlayError> {
        let (_client, mut server) = connection_pair().await;
        self.dispatcher.handle(from, &mut server, message).await
    }
}

#[tokio::test]
async fn strangers_are_rejected() -> Result<()> {
    let h = harness().await;
    let stranger: SocketAddr = "10.0.0.66:1664".parse()?;
    let idea = Message::for_community(Header::CreateIdea, COMMUNITY, "hello");

    let err = h.dispatch(stranger, idea.clone()).await.unwrap_err();
    assert!(matches!(err, OverlayError::NotAMember { .. }));

    let err = h
        .dispatch(sender(), Message::new(Header::CreateIdea).with_content("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, OverlayError::NotAMember { community_id: None, .. }));

    let err = h
        .dispatch(sender(), idea.with_community("elsewhere"))
        .await
        .unwrap_err();
    assert!(matches!(err, OverlayError::NotAMember { .. }));

    assert!(h.content.posted().await.is_empty());
    assert!(h.parent.received().await.is_empty());
    assert!(h.child.received().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn invitation_skips_membership_check() -> Result<()> {
    let h = harness().await;
    let (mut client, mut server) = connection_pair().await;
    let stranger: SocketAddr = "10.0.0.66:1664".parse()?;

    h.dispatcher
        .handle(stranger, &mut server, Message::new(Header::Invitation).with_content("hi"))
        .await?;
    let (reply, _) = client.receive().await?;
    assert_eq!(reply, Received::Message(Message::new(Header::Reject)));
    Ok(())
}

#[tokio::test]
async fn ideas_are_handled_and_relayed() -> Result<()> {
    let h = harness().await;
    let idea = Message::for_community(Header::CreateIdea, COMMUNITY, "nonce,tag,cipher");

    h.dispatch(sender(), idea.clone()).await?;

    let posted = h.content.posted().await;
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].content, "nonce,tag,cipher");
    assert_eq!(h.parent.wait_for(1).await, vec![idea.clone()]);
    assert_eq!(h.child.wait_for(1).await, vec![idea]);
    Ok(())
}

#[tokio::test]
async fn relay_skips_the_senders_address() -> Result<()> {
    let h = harness().await;
    let opinion = Message::for_community(Header::CreateOpinion, COMMUNITY, "agree");

    // the loopback neighbors share the sender's address
    h.dispatch(h.child.addr, opinion).await?;

    assert_eq!(h.content.posted().await.len(), 1);
    assert!(h.parent.received().await.is_empty());
    assert!(h.child.received().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn new_members_are_stored_and_relayed() -> Result<()> {
    let h = harness().await;
    let record = "newbie,10.0.0.20,1664,2021-01-01T00:00:00+00:00,None";
    let add_member = Message::for_community(Header::AddMember, COMMUNITY, record);

    h.dispatch(sender(), add_member.clone()).await?;

    let newbie = h.store.member(COMMUNITY, "newbie").await?;
    assert_eq!(newbie.map(|m| m.address), Some("10.0.0.20:1664".parse()?));
    assert_eq!(h.child.wait_for(1).await, vec![add_member]);
    Ok(())
}

#[tokio::test]
async fn ping_gets_pong_and_is_not_relayed() -> Result<()> {
    let h = harness().await;
    let (mut client, mut server) = connection_pair().await;

    h.dispatcher
        .handle(sender(), &mut server, Message::new(Header::Ping).with_community(COMMUNITY))
        .await?;
    let (reply, _) = client.receive().await?;
    assert_eq!(reply, Received::Message(Message::new(Header::Pong)));
    assert!(h.parent.received().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn parent_request_authenticates_by_key() -> Result<()> {
    let h = harness().await;
    add(&h.store, "kid", "10.0.0.30:1664".parse()?, 2015, Relationship::None).await;
    let (mut client, mut server) = connection_pair().await;
    // not the address on record
    let roaming: SocketAddr = "10.0.0.77:1664".parse()?;

    h.dispatcher
        .handle(
            roaming,
            &mut server,
            Message::for_community(Header::RequestParent, COMMUNITY, "kid"),
        )
        .await?;
    let (reply, _) = client.receive().await?;
    assert_eq!(reply, Received::Message(Message::new(Header::Accept)));
    assert_eq!(relationship_of(&h.store, "kid").await, Relationship::Child);
    assert!(h.parent.received().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn departure_untags_and_relays() -> Result<()> {
    let h = harness().await;
    let notice = Message::for_community(Header::Deconnection, COMMUNITY, SENDER_KEY);

    h.dispatch(sender(), notice.clone()).await?;

    assert_eq!(relationship_of(&h.store, SENDER_KEY).await, Relationship::None);
    assert_eq!(relationship_of(&h.store, "p").await, Relationship::Parent);
    assert_eq!(h.parent.wait_for(1).await, vec![notice.clone()]);
    assert_eq!(h.child.wait_for(1).await, vec![notice]);
    Ok(())
}

#[tokio::test]
async fn departure_without_key_is_malformed() {
    let h = harness().await;
    let err = h
        .dispatch(
            sender(),
            Message::new(Header::Deconnection).with_community(COMMUNITY),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OverlayError::Message(_)));
}

#[tokio::test]
async fn reply_headers_are_not_dispatched() {
    let h = harness().await;
    for header in [Header::Ack, Header::Accept, Header::Pong, Header::Data] {
        let err = h
            .dispatch(sender(), Message::new(header).with_community(COMMUNITY))
            .await
            .unwrap_err();
        assert!(matches!(err, OverlayError::UnknownHeader(got) if got == header));
    }
}

#[tokio::test]
async fn departure_from_a_stranger_is_not_trusted() -> Result<()> {
    let h = harness().await;
    let stranger: SocketAddr = "10.0.0.66:1664".parse()?;
    // a known member key, sent from an address that is not on record
    let forged = Message::for_community(Header::Deconnection, COMMUNITY, "p");

    let err = h.dispatch(stranger, forged).await.unwrap_err();
    assert!(matches!(err, OverlayError::NotAMember { .. }));
    assert_eq!(relationship_of(&h.store, "p").await, Relationship::Parent);
    assert!(h.child.received().await.is_empty());
    Ok(())
}
