use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use tracing::{info, warn};

use community_tree::cli::{Cli, Command, PingArgs, ServeArgs};
use community_tree::config::NodeConfig;
use community_tree::content::RosterContent;
use community_tree::membership::{InMemoryMembership, MembershipView, Roster};
use community_tree::node::{self, Node};
use community_tree::transport::Timeouts;

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Ping(args) => probe(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let roster = Roster::load(&args.roster).await?;
    let membership = Arc::new(InMemoryMembership::from_roster(roster).await?);
    let content = Arc::new(RosterContent::new(Arc::clone(&membership)));

    let config = NodeConfig {
        timeouts: Timeouts {
            connect: Duration::from_secs(args.connect_timeout),
            io: Duration::from_secs(args.io_timeout),
        },
        ..NodeConfig::new(args.listen)
    };
    let node = Node::start(config, membership.clone(), membership.clone(), content).await?;
    println!("node listening on {}", node.local_addr());

    if args.join {
        for community_id in membership.communities().await {
            match node.join_community(&community_id).await {
                Ok(Some(parent)) => info!(community_id, parent = %parent.key, "joined tree"),
                Ok(None) => info!(community_id, "no parent found; acting as root"),
                Err(err) => warn!(community_id, error = %err, "parent election failed"),
            }
        }
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = ?err, "failed to install ctrl-c handler");
    }
    node.shutdown().await;
    Ok(())
}

async fn probe(args: PingArgs) -> Result<()> {
    if node::ping(args.target, &args.community, Timeouts::default()).await? {
        println!("PONG from {}", args.target);
        Ok(())
    } else {
        bail!("{} did not answer PONG", args.target)
    }
}
