use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use locdir::cli::{Cli, Command};
use locdir::client;
use locdir::node::{Node, NodeConfig};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            let node = Node::bind(NodeConfig {
                role: args.role,
                peer_port: args.peer_port,
                listen: args.listen,
                max_clients: args.max_clients,
                max_users: args.max_users,
            })
            .await?;
            info!("{} listening on {}", args.role.label(), node.client_addr()?);
            if let Err(error) = node.run_until_ctrl_c().await {
                warn!("node exited with an error: {error:?}");
                return Err(error);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }
    Ok(())
}
