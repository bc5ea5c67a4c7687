//! Node supervisor: wires the overlay components together and owns the
//! accept loop's task handle.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broadcast::Broadcaster;
use crate::config::NodeConfig;
use crate::departure::LeaveCoordinator;
use crate::dispatch::{ContentHandler, Dispatcher};
use crate::election::ParentElector;
use crate::error::OverlayError;
use crate::membership::{IdentityProvider, MembershipView};
use crate::message::{Header, Message};
use crate::model::Member;
use crate::transport::{Connection, Listener, Received, Timeouts};

pub struct Node {
    local_addr: SocketAddr,
    broadcaster: Arc<Broadcaster>,
    elector: Arc<ParentElector>,
    leave: Arc<LeaveCoordinator>,
    stop_tx: oneshot::Sender<()>,
    listener_task: JoinHandle<()>,
}

impl Node {
    /// Binds the listener and starts serving. A bind failure is returned
    /// as [`OverlayError::BindFailure`] and nothing is spawned.
    ///
    /// When `config.listen` names a specific IP, outbound connections leave
    /// from that IP as well.
    pub async fn start(
        config: NodeConfig,
        membership: Arc<dyn MembershipView>,
        identity: Arc<dyn IdentityProvider>,
        content: Arc<dyn ContentHandler>,
    ) -> Result<Self, OverlayError> {
        let source = Some(config.listen.ip()).filter(|ip| !ip.is_unspecified());
        let broadcaster = Arc::new(
            Broadcaster::new(
                Arc::clone(&membership),
                Arc::clone(&identity),
                config.timeouts,
            )
            .with_source(source),
        );
        let elector = Arc::new(
            ParentElector::new(
                Arc::clone(&membership),
                Arc::clone(&identity),
                config.timeouts,
            )
            .with_source(source),
        );
        let leave = Arc::new(LeaveCoordinator::new(
            Arc::clone(&membership),
            identity,
            Arc::clone(&broadcaster),
            Arc::clone(&elector),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            membership,
            Arc::clone(&broadcaster),
            Arc::clone(&elector),
            Arc::clone(&leave),
            content,
        ));

        let listener = Listener::bind(config.listen, config.accept_timeout, config.timeouts).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "node listening");

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let listener_task = tokio::spawn(async move {
            listener
                .serve_until(dispatcher, async move {
                    let _ = stop_rx.await;
                })
                .await;
        });

        Ok(Self {
            local_addr,
            broadcaster,
            elector,
            leave,
            stop_tx,
            listener_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn elector(&self) -> &Arc<ParentElector> {
        &self.elector
    }

    pub fn leave_coordinator(&self) -> &Arc<LeaveCoordinator> {
        &self.leave
    }

    /// Finds an initial parent after joining `community_id`.
    pub async fn join_community(&self, community_id: &str) -> Result<Option<Member>, OverlayError> {
        self.elector.elect_parent(community_id, None).await
    }

    /// Announces departure everywhere, stops accepting and waits for the
    /// accept loop and its in-flight handlers to finish.
    pub async fn shutdown(self) {
        self.leave.announce_departure().await;
        self.stop().await;
    }

    /// Stops serving without telling anyone.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(());
        if let Err(err) = self.listener_task.await {
            warn!(error = ?err, "listener task failed");
        }
        info!(local_addr = %self.local_addr, "node stopped");
    }
}

/// Liveness probe: sends `PING` for `community_id` and expects `PONG`.
pub async fn ping(
    target: SocketAddr,
    community_id: &str,
    timeouts: Timeouts,
) -> Result<bool, OverlayError> {
    let mut connection = Connection::connect(target, timeouts).await?;
    let reply = connection
        .request(&Message::new(Header::Ping).with_community(community_id))
        .await;
    connection.close().await;

    Ok(matches!(
        reply?,
        Received::Message(message) if message.header() == Header::Pong
    ))
}
