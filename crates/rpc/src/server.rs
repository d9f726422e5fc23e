//! Serve RPC requests from the client transport.

use crate::{
    app::App,
    codec::RpcCodec,
    dispatch::Dispatcher,
    messages::{RpcRequest, RpcResponse, ServerMessage},
};
use eyre::eyre;
use futures::{AsyncRead, AsyncWrite};
use lh_config::HelperConfig;
use lh_network_libp2p::Host;
use std::io;
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The RPC server for one client.
///
/// Requests are read from the client transport and dispatched concurrently. Responses and push
/// notifications share one queue drained by a single writer task, so frames never interleave.
#[derive(Debug)]
pub struct RpcServer<H: Host> {
    /// Dispatcher for incoming requests.
    dispatcher: Dispatcher<H>,
    /// Receiving end of the outbound queue.
    outbound: mpsc::Receiver<ServerMessage>,
    /// Max decompressed frame size.
    max_message_size: usize,
}

impl<H: Host> RpcServer<H> {
    /// Create the application state and the outbound queue.
    pub fn new(host: H, config: &HelperConfig) -> Self {
        let (tx, outbound) = mpsc::channel(config.rpc.outbound_channel_capacity.max(1));
        let app = App::new(host, config, tx.clone());
        Self {
            dispatcher: Dispatcher::new(app, tx),
            outbound,
            max_message_size: config.rpc.max_message_size,
        }
    }

    /// The application state.
    pub fn app(&self) -> &App<H> {
        self.dispatcher.app()
    }

    /// Serve until the client transport ends or a fatal error occurs.
    ///
    /// Requests still in flight when the transport ends are answered before returning. Open streams
    /// and protocol handlers are torn down on the way out.
    pub async fn serve<R, W>(self, mut reader: R, writer: W) -> eyre::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let Self { dispatcher, outbound, max_message_size } = self;
        let app = dispatcher.app().clone();
        let shutdown = app.shutdown_token();

        let writer_done = CancellationToken::new();
        let writer_task =
            tokio::spawn(write_messages(writer, outbound, max_message_size, writer_done.clone()));

        let mut codec = RpcCodec::new(max_message_size);
        let mut in_flight = JoinSet::new();
        info!(target: "rpc-dispatch", "serving rpc requests");

        let res = loop {
            // reap finished requests
            while in_flight.try_join_next().is_some() {}

            let frame = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Err(eyre!("fatal error, helper shutting down")),
                frame = codec.read_message::<_, RpcRequest>(&mut reader) => frame,
            };

            match frame {
                Ok(Some(request)) => {
                    let dispatcher = dispatcher.clone();
                    in_flight.spawn(async move { dispatcher.respond(request).await });
                }
                Ok(None) => {
                    info!(target: "rpc-dispatch", "client transport closed");
                    break Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    warn!(target: "rpc-dispatch", %e, "skipping undecodable frame");
                }
                Err(e) => break Err(eyre!("client transport failed: {e}")),
            }
        };

        // answer everything already accepted
        while let Some(res) = in_flight.join_next().await {
            if let Err(e) = res {
                error!(target: "rpc-dispatch", ?e, "request task failed");
            }
        }
        app.teardown().await;

        writer_done.cancel();
        if let Err(e) = writer_task.await {
            error!(target: "rpc-dispatch", ?e, "writer task failed");
        }

        res
    }
}

/// Write queued messages to the client until `done` is cancelled and the queue is drained.
async fn write_messages<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<ServerMessage>,
    max_message_size: usize,
    done: CancellationToken,
) where
    W: AsyncWrite + Send + Unpin,
{
    let mut codec = RpcCodec::new(max_message_size);
    loop {
        let msg = tokio::select! {
            biased;
            msg = outbound.recv() => msg,
            _ = done.cancelled() => None,
        };

        let Some(msg) = msg else {
            debug!(target: "rpc-dispatch", "writer finished");
            return;
        };

        let written = codec.write_message(&mut writer, &msg).await;
        let res = match written {
            // nothing was written, the transport is still aligned
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                error!(target: "rpc-dispatch", %e, "failed to encode message for client");
                match msg {
                    // the request still gets exactly one response
                    ServerMessage::Response(response) => {
                        let fallback = RpcResponse::error(response.seqno, e);
                        codec.write_message(&mut writer, &ServerMessage::Response(fallback)).await
                    }
                    ServerMessage::Push(_) => Ok(()),
                }
            }
            res => res,
        };

        if let Err(e) = res {
            error!(target: "rpc-dispatch", %e, "client transport failed");
            return;
        }
    }
}

#[cfg(test)]
#[path = "tests/server_tests.rs"]
mod server_tests;
