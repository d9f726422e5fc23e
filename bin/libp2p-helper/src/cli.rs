//! CLI definition and entrypoint to the executable.

use clap::{ArgAction, Parser};
use lh_config::HelperConfig;
use lh_network_libp2p::{
    dial_bootstrap_peers, load_or_generate_keypair, HelperNetwork, Multiaddr,
};
use lh_rpc::RpcServer;
use std::{path::PathBuf, time::Duration};
use tokio::runtime::Builder;
use tokio_util::compat::{TokioAsyncReadCompatExt as _, TokioAsyncWriteCompatExt as _};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

/// The helper cli interface.
///
/// The helper reads framed requests from stdin and writes responses and notifications to stdout.
/// Logs go to stderr.
#[derive(Debug, Parser)]
#[command(author, version, about = "libp2p stream helper", long_about = None)]
pub struct Cli {
    /// Path to the YAML configuration file.
    ///
    /// Defaults are used for every field missing from the file, or for all of them if the file
    /// does not exist.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Listen on this multiaddr instead of the configured ones. May be repeated.
    #[arg(long = "listen", value_name = "MULTIADDR")]
    pub listen_addrs: Vec<Multiaddr>,

    /// Dial this peer on startup in addition to the configured bootstrap peers. May be repeated.
    #[arg(long = "peer", value_name = "MULTIADDR")]
    pub bootstrap_peers: Vec<Multiaddr>,

    /// Path to the libp2p keypair. Generated on first use.
    #[arg(long, value_name = "FILE")]
    pub keypair: Option<PathBuf>,

    /// Timeout for opening an outbound stream, e.g. "10s" or "500ms".
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    pub open_stream_timeout: Option<Duration>,

    /// Write the effective configuration to this path and exit.
    #[arg(long, value_name = "FILE")]
    pub write_config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace).
    ///
    /// RUST_LOG directives take precedence.
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Parse the arguments of the current process.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Load the configuration file and apply command line overrides.
    pub fn helper_config(&self) -> eyre::Result<HelperConfig> {
        let mut config = match &self.config {
            Some(path) => HelperConfig::load(path)?,
            None => HelperConfig::default(),
        };

        if !self.listen_addrs.is_empty() {
            config.network.listen_addrs = self.listen_addrs.clone();
        }
        config.network.bootstrap_peers.extend(self.bootstrap_peers.iter().cloned());
        if let Some(keypair) = &self.keypair {
            config.network.keypair_path = Some(keypair.clone());
        }
        if let Some(timeout) = self.open_stream_timeout {
            config.network.open_stream_timeout = timeout;
        }

        Ok(config)
    }

    /// The default log level for the verbosity flag.
    fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }

    /// Install the global tracing subscriber.
    ///
    /// Stdout carries the rpc transport so every log line is written to stderr.
    fn init_tracing(&self) -> eyre::Result<()> {
        let filter = EnvFilter::builder()
            .with_default_directive(self.log_level().into())
            .from_env_lossy();
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init()
            .map_err(|e| eyre::eyre!("failed to init tracing: {e}"))
    }

    /// Start the libp2p host and serve rpc requests over stdio until the client disconnects.
    pub fn run(self) -> eyre::Result<()> {
        self.init_tracing()?;
        let config = self.helper_config()?;

        if let Some(path) = &self.write_config {
            config.store(path)?;
            info!(target: "helper-config", ?path, "configuration written");
            return Ok(());
        }

        let runtime = Builder::new_multi_thread()
            .thread_name("libp2p-helper")
            .enable_io()
            .enable_time()
            .build()?;

        runtime.block_on(serve_stdio(config))
    }
}

/// How long to wait for the network task after the rpc transport closes.
const NETWORK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Run the helper on the current runtime.
async fn serve_stdio(config: HelperConfig) -> eyre::Result<()> {
    let keypair = load_or_generate_keypair(config.network.keypair_path.as_deref())?;
    let network = HelperNetwork::new(&config.network, keypair)?;
    let handle = network
        .network_handle()
        .ok_or_else(|| eyre::eyre!("network handle unavailable"))?;
    info!(target: "helper-network", peer_id = %network.local_peer_id(), "starting helper");

    let network_task = tokio::spawn(network.run());
    dial_bootstrap_peers(&handle, &config.network.bootstrap_peers).await;

    let server = RpcServer::new(handle, &config);
    let res =
        server.serve(tokio::io::stdin().compat(), tokio::io::stdout().compat_write()).await;

    // the network stops once the last handle is dropped
    match tokio::time::timeout(NETWORK_SHUTDOWN_TIMEOUT, network_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!(target: "helper-network", %e, "network task failed"),
        Ok(Err(e)) => warn!(target: "helper-network", %e, "network task panicked"),
        Err(_) => warn!(target: "helper-network", "network task still running at exit"),
    }

    res
}
