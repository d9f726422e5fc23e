//! Persisted node identity.

use eyre::WrapErr as _;
use libp2p::identity::Keypair;
use std::{fs, path::Path};
use tracing::info;

/// Load the node's keypair from `path`, or generate a new ed25519 keypair.
///
/// A generated keypair is written to `path` (protobuf encoding) so the node keeps its peer id
/// across restarts. Without a path the keypair is ephemeral.
pub fn load_or_generate_keypair(path: Option<&Path>) -> eyre::Result<Keypair> {
    let Some(path) = path else {
        let keypair = Keypair::generate_ed25519();
        info!(target: "helper-network", peer_id = %keypair.public().to_peer_id(), "generated ephemeral keypair");
        return Ok(keypair);
    };

    if path.exists() {
        let bytes = fs::read(path)
            .wrap_err_with(|| format!("failed to read keypair at {}", path.display()))?;
        let keypair = Keypair::from_protobuf_encoding(&bytes)
            .wrap_err_with(|| format!("invalid keypair at {}", path.display()))?;
        info!(target: "helper-network", peer_id = %keypair.public().to_peer_id(), path = %path.display(), "loaded keypair");
        return Ok(keypair);
    }

    let keypair = Keypair::generate_ed25519();
    let bytes = keypair.to_protobuf_encoding().wrap_err("failed to encode keypair")?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)
        .wrap_err_with(|| format!("failed to write keypair to {}", path.display()))?;
    info!(target: "helper-network", peer_id = %keypair.public().to_peer_id(), path = %path.display(), "generated new keypair");

    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use super::load_or_generate_keypair;
    use tempfile::TempDir;

    #[test]
    fn test_generated_keypair_is_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("node.key");

        let first = load_or_generate_keypair(Some(&path)).unwrap();
        assert!(path.exists());
        let second = load_or_generate_keypair(Some(&path)).unwrap();

        assert_eq!(first.public().to_peer_id(), second.public().to_peer_id());
    }

    #[test]
    fn test_invalid_keypair_file_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.key");
        std::fs::write(&path, b"not a keypair").unwrap();

        assert!(load_or_generate_keypair(Some(&path)).is_err());
    }

    #[test]
    fn test_ephemeral_keypairs_differ() {
        let a = load_or_generate_keypair(None).unwrap();
        let b = load_or_generate_keypair(None).unwrap();
        assert_ne!(a.public().to_peer_id(), b.public().to_peer_id());
    }
}
