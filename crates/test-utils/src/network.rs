//! Local libp2p networks for integration tests.

use eyre::eyre;
use lh_config::HelperConfig;
use lh_network_libp2p::{load_or_generate_keypair, HelperNetwork, Multiaddr, NetworkHandle, Protocol};
use std::{net::Ipv4Addr, time::Duration};
use tracing::debug;

/// How long fixtures wait for a network to start listening.
const LISTEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Config for a helper listening on an OS-assigned localhost port with an ephemeral identity.
pub fn localhost_config() -> HelperConfig {
    let mut config = HelperConfig::default();
    config.network.listen_addrs =
        vec![Multiaddr::empty().with(Protocol::Ip4(Ipv4Addr::LOCALHOST)).with(Protocol::Tcp(0))];
    config.network.keypair_path = None;
    config.network.open_stream_timeout = Duration::from_secs(5);
    config
}

/// Start a network task and return its handle once it is listening.
///
/// The task ends when every clone of the handle is dropped.
pub async fn spawn_test_network(config: &HelperConfig) -> eyre::Result<NetworkHandle> {
    let keypair = load_or_generate_keypair(config.network.keypair_path.as_deref())?;
    let network = HelperNetwork::new(&config.network, keypair)?;
    let handle = network.network_handle().ok_or_else(|| eyre!("network handle unavailable"))?;
    tokio::spawn(network.run());

    let addrs = wait_for_listeners(&handle).await?;
    debug!(target: "helper-network", ?addrs, "test network listening");
    Ok(handle)
}

/// Poll until the network reports at least one listen address.
pub async fn wait_for_listeners(handle: &NetworkHandle) -> eyre::Result<Vec<Multiaddr>> {
    tokio::time::timeout(LISTEN_TIMEOUT, async {
        loop {
            let addrs = handle.listeners().await?;
            if !addrs.is_empty() {
                return Ok::<_, eyre::Report>(addrs);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| eyre!("network did not start listening"))?
}
