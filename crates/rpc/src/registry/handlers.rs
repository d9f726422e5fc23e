//! Registry of protocols accepted from remote peers.

use crate::error::HelperResult;
use lh_network_libp2p::StreamProtocol;
use std::{collections::HashMap, fmt};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A running accept task for one protocol.
///
/// The task owns the host registration `I`. It hands the registration back when cancelled so a
/// replacement handler can keep using it; the task returns `None` when the host ended the
/// registration.
pub struct ProtocolHandler<I> {
    /// Stops the accept task.
    cancel: CancellationToken,
    /// The accept task.
    task: JoinHandle<Option<I>>,
}

impl<I> ProtocolHandler<I> {
    /// Create a new instance of Self.
    pub(crate) fn new(cancel: CancellationToken, task: JoinHandle<Option<I>>) -> Self {
        Self { cancel, task }
    }

    /// Stop the accept task and return the host registration if it is still alive.
    async fn stop(self) -> Option<I> {
        self.cancel.cancel();
        match self.task.await {
            Ok(registration) => registration,
            Err(e) => {
                debug!(target: "stream-registry", ?e, "accept task failed");
                None
            }
        }
    }
}

/// Maps protocols to their accept task.
///
/// Mutations hold the lock while the previous accept task shuts down. That never involves network
/// I/O, and it keeps concurrent add/remove calls for the same protocol linearizable.
pub struct ProtocolHandlers<I> {
    handlers: Mutex<HashMap<StreamProtocol, ProtocolHandler<I>>>,
}

impl<I> Default for ProtocolHandlers<I> {
    fn default() -> Self {
        Self { handlers: Mutex::new(HashMap::new()) }
    }
}

impl<I> fmt::Debug for ProtocolHandlers<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolHandlers").finish_non_exhaustive()
    }
}

impl<I: Send + 'static> ProtocolHandlers<I> {
    /// Install a handler for `protocol`, replacing any existing one.
    ///
    /// `spawn` receives the previous handler's host registration, if any, and starts the new accept
    /// task. If `spawn` fails the protocol is left unregistered.
    pub(crate) async fn register<F>(&self, protocol: StreamProtocol, spawn: F) -> HelperResult<()>
    where
        F: FnOnce(Option<I>) -> HelperResult<ProtocolHandler<I>>,
    {
        let mut handlers = self.handlers.lock().await;
        let previous = match handlers.remove(&protocol) {
            Some(handler) => handler.stop().await,
            None => None,
        };
        let handler = spawn(previous)?;
        handlers.insert(protocol, handler);
        Ok(())
    }

    /// Remove the handler for `protocol` and drop its host registration.
    ///
    /// Returns false if the protocol was not registered.
    pub(crate) async fn remove(&self, protocol: &StreamProtocol) -> bool {
        let mut handlers = self.handlers.lock().await;
        match handlers.remove(protocol) {
            Some(handler) => {
                drop(handler.stop().await);
                true
            }
            None => false,
        }
    }

    /// Remove every handler.
    pub(crate) async fn clear(&self) {
        let mut handlers = self.handlers.lock().await;
        for (_, handler) in handlers.drain() {
            drop(handler.stop().await);
        }
    }

    pub async fn contains(&self, protocol: &StreamProtocol) -> bool {
        self.handlers.lock().await.contains_key(protocol)
    }

    /// Registered protocols, sorted.
    pub async fn protocols(&self) -> Vec<StreamProtocol> {
        let mut protocols: Vec<_> = self.handlers.lock().await.keys().cloned().collect();
        protocols.sort_by(|a, b| a.as_ref().cmp(b.as_ref()));
        protocols
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    /// Spawn an accept task that holds `registration` until cancelled.
    fn spawn_holder(registration: u32) -> ProtocolHandler<u32> {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            token.cancelled().await;
            Some(registration)
        });
        ProtocolHandler::new(cancel, task)
    }

    #[tokio::test]
    async fn test_replacement_reuses_registration() {
        let handlers = ProtocolHandlers::default();
        let protocol = StreamProtocol::new("/mina/99");
        let fresh = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let fresh = fresh.clone();
            handlers
                .register(protocol.clone(), |previous| {
                    let registration = previous.unwrap_or_else(|| {
                        fresh.fetch_add(1, Ordering::SeqCst);
                        42
                    });
                    Ok(spawn_holder(registration))
                })
                .await
                .unwrap();
        }

        // only the first add created a registration
        assert_eq!(fresh.load(Ordering::SeqCst), 1);
        assert_eq!(handlers.protocols().await, vec![protocol]);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let handlers = ProtocolHandlers::default();
        let protocol = StreamProtocol::new("/mina/99");

        assert!(!handlers.remove(&protocol).await);
        handlers.register(protocol.clone(), |_| Ok(spawn_holder(1))).await.unwrap();
        assert!(handlers.contains(&protocol).await);
        assert!(handlers.remove(&protocol).await);
        assert!(!handlers.contains(&protocol).await);
        assert!(!handlers.remove(&protocol).await);
    }

    #[tokio::test]
    async fn test_failed_spawn_leaves_protocol_unregistered() {
        let handlers = ProtocolHandlers::<u32>::default();
        let protocol = StreamProtocol::new("/mina/99");

        let res = handlers
            .register(protocol.clone(), |_| {
                Err(crate::error::HelperError::MalformedRequest("nope".into()))
            })
            .await;
        assert!(res.is_err());
        assert!(!handlers.contains(&protocol).await);
    }
}
