// postmesh node binary
//
//   postmesh run --port 8888 --data-dir ./node-a
//   postmesh token --port 8888 --data-dir ./node-a --advertise-host 192.168.1.20
//
// `run` turns every stdin line into a post and logs status periodically.

use clap::{Args, Parser, Subcommand};
use postmesh::discovery::{LanConfig, DEFAULT_LAN_PORT};
use postmesh::post::{PostPolicy, DEFAULT_PSEUDONYM};
use postmesh::transport::{DEFAULT_PORT, DEFAULT_PROXY_PORT};
use postmesh::{MeshError, NetworkController, NodeConfig};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Pseudonymous micro-posting node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node; each line on stdin becomes a post
    Run(RunArgs),
    /// Print this node's discovery token and exit
    Token(TokenArgs),
}

#[derive(Args)]
struct NodeArgs {
    /// Listen port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// SOCKS port of the local anonymizing proxy
    #[arg(long, default_value_t = DEFAULT_PROXY_PORT)]
    proxy_port: u16,
    /// Directory for identity, posts and peers; in memory when omitted
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Host other nodes should dial
    #[arg(long)]
    advertise_host: Option<String>,
    /// Network secret peers must present
    #[arg(long)]
    secret: Option<String>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    node: NodeArgs,
    /// Interface to listen on
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,
    /// Route all traffic through the proxy from the start
    #[arg(long)]
    anonymize: bool,
    /// Discovery token of a peer to join through (repeatable)
    #[arg(long = "bootstrap", value_name = "TOKEN")]
    bootstrap: Vec<String>,
    /// Pseudonym for posts read from stdin
    #[arg(long, default_value = DEFAULT_PSEUDONYM)]
    pseudonym: String,
    /// Seconds between status log lines
    #[arg(long, default_value_t = 60)]
    status_interval: u64,
    /// Announce this node on the local network and register peers that answer
    #[arg(long)]
    lan: bool,
    /// UDP port for local network announces
    #[arg(long, default_value_t = DEFAULT_LAN_PORT)]
    lan_port: u16,
    /// Keep at most this many posts, dropping the oldest
    #[arg(long)]
    max_posts: Option<usize>,
}

#[derive(Args)]
struct TokenArgs {
    #[command(flatten)]
    node: NodeArgs,
}

impl NodeArgs {
    fn config(&self) -> NodeConfig {
        let mut config = NodeConfig::new(self.port, self.proxy_port);
        if let Some(dir) = &self.data_dir {
            config = config.with_data_dir(dir);
        }
        if let Some(host) = &self.advertise_host {
            config = config.with_advertised_host(host);
        }
        if let Some(secret) = &self.secret {
            config = config.with_shared_secret(secret);
        }
        config
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,postmesh=debug".into()))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Token(args) => token(args),
    };

    if let Err(e) = result {
        error!(error = %e, "postmesh failed");
        std::process::exit(1);
    }
}

fn token(args: TokenArgs) -> Result<(), MeshError> {
    if args.node.data_dir.is_none() {
        warn!("No --data-dir given; this token names a throwaway identity");
    }
    let node = NetworkController::with_config(args.node.config())?;
    println!("{}", node.generate_discovery_token()?);
    node.cleanup();
    Ok(())
}

async fn run(args: RunArgs) -> Result<(), MeshError> {
    let config = args
        .node
        .config()
        .with_bind_address(args.bind.clone())
        .with_anonymize_on_start(args.anonymize);
    let config = match args.max_posts {
        Some(max) => config.with_post_policy(PostPolicy::default().with_max_posts(max)),
        None => config,
    };
    let config = if args.lan {
        config.with_lan(LanConfig::new().enabled().with_port(args.lan_port))
    } else {
        config
    };
    let node = NetworkController::with_config(config)?;
    node.start().await?;

    println!("{}", node.generate_discovery_token()?);
    for token in &args.bootstrap {
        match node.parse_discovery_token(token) {
            Ok(peer) => info!(peer = %peer.peer_id(), address = %peer.address(), "Joining through peer"),
            Err(e) => warn!(error = %e, "Ignoring bootstrap token"),
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut status = tokio::time::interval(Duration::from_secs(args.status_interval.max(1)));

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let content = line.trim();
                    if content.is_empty() {
                        continue;
                    }
                    if let Err(e) = node.create_post(content, &args.pseudonym) {
                        warn!(error = %e, "Post rejected");
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "Stopped reading stdin");
                    stdin_open = false;
                }
            },
            _ = status.tick() => {
                let s = node.status();
                info!(
                    peers = s.peers_count,
                    known = s.discovery_peers_count,
                    cold = s.cold_peers_count,
                    posts = s.posts_count,
                    anonymized = s.anonymization_enabled,
                    degraded = s.degraded,
                    "Status"
                );
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    node.cleanup();
    Ok(())
}
