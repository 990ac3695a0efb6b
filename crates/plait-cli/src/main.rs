//! PLAIT CLI
//!
//! Multi-link peer-to-peer tunnels for messages and resumable file transfer

mod config;
mod progress;

use anyhow::Context;
use clap::{Parser, Subcommand};
use crossbeam_channel::Receiver;
use plait_core::{
    Event, FileHash, Registry, Route, StaticAcceptor, TunnelHandle, TunnelStatus,
};
use plait_files::FsWriter;
use plait_transport::{Driver, DriverConfig, UdpConfig, UdpSubstrate};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use config::Config;
use progress::{TransferProgress, format_bytes, format_quality};

/// PLAIT - braided peer-to-peer tunnels
#[derive(Parser)]
#[command(name = "plait")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept tunnels, print messages and serve shared files
    Serve {
        /// Files to share
        #[arg(long)]
        share: Vec<PathBuf>,

        /// Listen address (overrides the config file)
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// Forward relay traffic for other peers
        #[arg(long)]
        relay: bool,
    },

    /// Send a text message to a peer
    Send {
        /// Peer address
        #[arg(long, required = true)]
        peer: Vec<SocketAddr>,

        /// Reach the peer through this bouncer as well
        #[arg(long)]
        via: Option<SocketAddr>,

        /// Message text
        text: String,

        /// Seconds to wait for confirmation
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Download a shared file from a peer
    Fetch {
        /// Peer address
        #[arg(long, required = true)]
        peer: Vec<SocketAddr>,

        /// Reach the peer through this bouncer as well
        #[arg(long)]
        via: Option<SocketAddr>,

        /// Content hash (hex)
        #[arg(long)]
        hash: String,

        /// File size in bytes
        #[arg(long)]
        size: u64,

        /// Output path; an interrupted download resumes from here
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Print the content hash of a file
    Hash {
        /// File to hash
        file: PathBuf,
    },

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    if let Commands::Init { force } = cli.command {
        if config_path.exists() && !force {
            anyhow::bail!("{} already exists (use --force)", config_path.display());
        }
        Config::default().save(&config_path)?;
        println!("Wrote {}", config_path.display());
        return Ok(());
    }
    let config = Config::load_or_default(&config_path)?;
    config.validate()?;

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(level).init();

    match cli.command {
        Commands::Serve { share, bind, relay } => serve(share, bind, relay, &config).await,
        Commands::Send {
            peer,
            via,
            text,
            timeout,
        } => send(peer, via, text, Duration::from_secs(timeout), &config).await,
        Commands::Fetch {
            peer,
            via,
            hash,
            size,
            output,
        } => fetch(peer, via, &hash, size, output, &config).await,
        Commands::Hash { file } => {
            let (hash, size) = plait_files::hash_file(&file)?;
            println!("{}  {}  {}", hex::encode(hash), size, file.display());
            Ok(())
        }
        Commands::Init { .. } => Ok(()),
    }
}

/// Running engine: registry, socket and driver
struct Node {
    registry: Arc<Registry>,
    events: Receiver<Event>,
    driver: Driver,
}

impl Node {
    async fn start(bind: SocketAddr, relay: bool, config: &Config) -> anyhow::Result<Self> {
        let udp = UdpConfig {
            relay,
            ..UdpConfig::default()
        };
        let substrate = Arc::new(UdpSubstrate::bind(bind, &udp).await?);
        tracing::info!(local = %substrate.local_addr()?, relay, "node listening");

        let (registry, events) = Registry::new(config.registry_config(), substrate.clone());
        let registry = Arc::new(registry);
        let driver = Driver::spawn(
            registry.clone(),
            substrate,
            DriverConfig {
                tick_interval: Duration::from_millis(config.node.tick_ms),
            },
        );
        Ok(Self {
            registry,
            events,
            driver,
        })
    }

    fn open(&self, peers: &[SocketAddr], via: Option<SocketAddr>, config: &Config) -> anyhow::Result<TunnelHandle> {
        let mut routes: Vec<Route> = peers.iter().copied().map(Route::direct).collect();
        if let (Some(bouncer), Some(first)) = (via, peers.first()) {
            routes.push(Route::bounced(*first, bouncer));
        }
        let handle = self.registry.open_tunnel(
            config.identity(),
            &routes,
            config.node.bootstrap.as_bytes(),
        );
        if !handle.is_valid() {
            anyhow::bail!("could not open a tunnel");
        }
        Ok(handle)
    }

    /// Next event, or `None` once `deadline` passes
    async fn next_event(&self, deadline: Instant) -> Option<Event> {
        loop {
            if let Ok(event) = self.events.try_recv() {
                return Some(event);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn stop(self) {
        self.driver.shutdown().await;
    }
}

/// Accept tunnels and serve files until interrupted
async fn serve(share: Vec<PathBuf>, bind: Option<SocketAddr>, relay: bool, config: &Config) -> anyhow::Result<()> {
    let bind = match bind {
        Some(addr) => addr,
        None => config.parse_listen_addr()?,
    };
    let node = Node::start(bind, relay || config.node.relay, config).await?;
    node.registry.set_acceptor(Arc::new(
        StaticAcceptor::new(config.node.app_id)
            .with_peer(config.node.bootstrap.as_bytes().to_vec(), config.identity()),
    ));

    for path in &share {
        let (info, reader) = plait_files::open_shared(path)
            .with_context(|| format!("cannot share {}", path.display()))?;
        node.registry.share_file(info.hash, info.size, reader);
        println!(
            "Sharing {}  {}  ({})",
            hex::encode(info.hash),
            path.display(),
            format_bytes(info.size)
        );
    }
    println!("Listening on {bind} (press Ctrl+C to stop)");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut status = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = status.tick() => {
                for handle in node.registry.handles() {
                    if let Some(q) = node.registry.link_quality(handle, 30_000) {
                        tracing::info!(tunnel = %handle, quality = %format_quality(q.latency_ms, q.loss_rate), "tunnel quality");
                    }
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(50)) => {
                for event in node.events.try_iter() {
                    report(&event);
                }
            }
        }
    }

    println!("\nShutting down...");
    for handle in node.registry.handles() {
        node.registry.close_tunnel(handle);
    }
    node.stop().await;
    Ok(())
}

fn report(event: &Event) {
    match event {
        Event::MessageReceived { tunnel, data } => {
            println!("[{tunnel}] {}", String::from_utf8_lossy(data));
        }
        Event::Connected { tunnel } => println!("[{tunnel}] connected"),
        Event::Disconnected { tunnel } => println!("[{tunnel}] disconnected"),
        Event::FileRequested { tunnel, hash } => {
            println!("[{tunnel}] serving {}", hex::encode(hash));
        }
        Event::FileUnrequested { tunnel, hash } => {
            println!("[{tunnel}] done serving {}", hex::encode(hash));
        }
        other => tracing::debug!(event = ?other, "event"),
    }
}

/// Send one message and wait for the peer to confirm it
async fn send(
    peers: Vec<SocketAddr>,
    via: Option<SocketAddr>,
    text: String,
    timeout: Duration,
    config: &Config,
) -> anyhow::Result<()> {
    let node = Node::start("0.0.0.0:0".parse()?, false, config).await?;
    let handle = node.open(&peers, via, config)?;
    node.registry.send_message(handle, text.into_bytes(), 1);

    let deadline = Instant::now() + timeout;
    let mut outcome = None;
    while let Some(event) = node.next_event(deadline).await {
        if let Event::MessageSent { cookie: 1, success, .. } = event {
            outcome = Some(success);
            break;
        }
    }
    node.registry.close_tunnel(handle);
    node.stop().await;

    match outcome {
        Some(true) => {
            println!("Delivered");
            Ok(())
        }
        Some(false) => anyhow::bail!("message was not delivered"),
        None => anyhow::bail!("no confirmation within {}s", timeout.as_secs()),
    }
}

/// Download a shared file, resuming a previous attempt at the same path
async fn fetch(
    peers: Vec<SocketAddr>,
    via: Option<SocketAddr>,
    hash_hex: &str,
    size: u64,
    output: PathBuf,
    config: &Config,
) -> anyhow::Result<()> {
    let hash: FileHash = hex::decode(hash_hex)?
        .try_into()
        .map_err(|_| anyhow::anyhow!("hash must be 32 bytes of hex"))?;

    let node = Node::start("0.0.0.0:0".parse()?, false, config).await?;
    let handle = node.open(&peers, via, config)?;
    let writer = FsWriter::create(&output)?;
    let download = node
        .registry
        .start_download(handle, hash, size, Box::new(writer))
        .context("download could not start")?;

    let label = output
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("download")
        .to_string();
    let progress = TransferProgress::new(size, &label);
    let mut result = Err(anyhow::anyhow!("tunnel closed"));
    loop {
        if let Some((done, _)) = node.registry.download_progress(handle, download) {
            progress.update(done);
        }
        let Some(event) = node.next_event(Instant::now() + Duration::from_millis(200)).await else {
            if node.registry.status(handle) == Some(TunnelStatus::Closed) {
                break;
            }
            continue;
        };
        match event {
            Event::FileDownloaded { download: id, .. } if id == download => {
                progress.finish_with_message(format!("Fetched {label}"));
                result = Ok(());
                break;
            }
            Event::FileInterrupted {
                download: id,
                reason,
                ..
            } if id == download => {
                progress.abandon_with_message(format!("Interrupted: {reason}"));
                result = Err(anyhow::anyhow!("download interrupted: {reason}"));
                break;
            }
            _ => {}
        }
    }
    node.registry.close_tunnel(handle);
    node.stop().await;
    result?;

    let (actual, _) = plait_files::hash_file(&output)?;
    if actual != hash {
        anyhow::bail!("hash mismatch: got {}", hex::encode(actual));
    }
    println!("Verified {}", hex::encode(hash));
    Ok(())
}
