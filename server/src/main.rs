use clap::{Args, Parser, Subcommand};
use log::{error, info};
use server::{Component, Group, JsonSerializer, Node, NodeConfig, Serializer};
use std::sync::Arc;
use std::time::Duration;

const REGISTRATION_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Cluster node of the RPC runtime.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Run the membership master
    Master {
        #[command(flatten)]
        common: Common,
    },
    /// Run a service node that registers with a master
    Node {
        /// Address of the master's service listener
        #[arg(short, long)]
        master: String,

        #[command(flatten)]
        common: Common,
    },
}

#[derive(Args, Debug)]
struct Common {
    /// Address for inter-node links
    #[arg(short, long, default_value = "127.0.0.1:34567")]
    listen: String,

    /// Accept clients on this address
    #[arg(short, long)]
    client_addr: Option<String>,

    /// Node id, unique within the cluster (defaults to the process id)
    #[arg(long)]
    node_id: Option<u64>,

    /// Deadline for forwarded calls in milliseconds
    #[arg(long, default_value = "5000")]
    call_timeout_ms: u64,

    /// Host the demo `Room` service
    #[arg(long)]
    demo: bool,

    /// Log every dispatched route
    #[arg(long)]
    debug: bool,
}

impl Common {
    fn apply(&self, mut config: NodeConfig) -> NodeConfig {
        if let Some(addr) = &self.client_addr {
            config = config.with_client_addr(addr.clone());
        }
        if let Some(node_id) = self.node_id {
            config = config.with_node_id(node_id);
        }
        config
            .with_call_timeout(Duration::from_millis(self.call_timeout_ms))
            .with_debug(self.debug)
    }
}

/// A chat room: `Room.Join <uid>` binds and joins the lobby, `Room.Say <text>`
/// broadcasts to everyone in it.
fn demo_room() -> Component {
    let lobby = Group::new("lobby");
    let join_lobby = Arc::clone(&lobby);
    let say_lobby = Arc::clone(&lobby);

    Component::new("Room")
        .method("Join", move |session, payload| {
            let lobby = Arc::clone(&join_lobby);
            async move {
                let uid = String::from_utf8_lossy(&payload)
                    .trim()
                    .parse::<i64>()
                    .map_err(|e| format!("uid must be a number: {e}"))?;
                session.bind(uid)?;
                let leaving = Arc::clone(&lobby);
                session.on_closed(move |s| {
                    let _ = leaving.leave(s.id());
                });
                lobby.add(Arc::clone(&session))?;
                lobby.broadcast_typed(&JsonSerializer, "onJoin", &uid)?;
                Ok(Some(JsonSerializer.marshal(&lobby.members())?))
            }
        })
        .method("Say", move |session, payload| {
            let lobby = Arc::clone(&say_lobby);
            async move {
                let text = String::from_utf8_lossy(&payload).to_string();
                let report = lobby.broadcast_typed(&JsonSerializer, "onMessage", &(session.uid(), text))?;
                Ok(Some(report.delivered.to_string().into_bytes()))
            }
        })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let cli = Cli::parse();
    let (config, common) = match &cli.role {
        Role::Master { common } => (common.apply(NodeConfig::new(&common.listen).master()), common),
        Role::Node { master, common } => (
            common.apply(NodeConfig::new(&common.listen).with_master_addr(master.clone())),
            common,
        ),
    };

    let mut builder = Node::builder(config);
    if common.demo {
        builder = builder.register(demo_room())?;
    }
    let node = builder.startup().await?;

    if !node.is_master() {
        info!("Waiting for the master to accept this node...");
        tokio::select! {
            result = node.wait_registered(REGISTRATION_WAIT) => {
                if let Err(e) = result {
                    error!("Registration failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                node.shutdown().await;
                return Ok(());
            }
        }
    }

    info!("Node {} is up, press Ctrl+C to stop", node.node_id());
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down gracefully...");
    node.shutdown().await;

    Ok(())
}
