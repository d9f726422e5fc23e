//! Route requests to their operation and frame the result.

use crate::{
    app::App,
    error::HelperResult,
    messages::{Request, RpcRequest, RpcResponse, ServerMessage, Success},
};
use lh_network_libp2p::Host;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

/// Dispatches requests concurrently and queues one response per request.
#[derive(Debug)]
pub struct Dispatcher<H: Host> {
    /// Application state passed to every operation.
    app: App<H>,
    /// Responses for the client writer.
    outbound: mpsc::Sender<ServerMessage>,
}

impl<H: Host> Clone for Dispatcher<H> {
    fn clone(&self) -> Self {
        Self { app: self.app.clone(), outbound: self.outbound.clone() }
    }
}

impl<H: Host> Dispatcher<H> {
    /// Create a new instance of Self.
    pub fn new(app: App<H>, outbound: mpsc::Sender<ServerMessage>) -> Self {
        Self { app, outbound }
    }

    pub fn app(&self) -> &App<H> {
        &self.app
    }

    /// Handle `request` and queue the response for the client writer.
    pub async fn respond(&self, request: RpcRequest) {
        let response = self.dispatch(request).await;
        if self.outbound.send(ServerMessage::Response(response)).await.is_err() {
            debug!(target: "rpc-dispatch", "client writer closed, dropping response");
        }
    }

    /// Handle a request and return its response.
    ///
    /// The response always carries the request's seqno. Errors become error responses; a fatal
    /// error additionally stops the helper.
    pub async fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        let RpcRequest { seqno, body } = request;

        let result = match Request::decode(&body) {
            Ok(request) => {
                trace!(target: "rpc-dispatch", seqno, kind = request.kind(), "dispatching request");
                handle_request(&self.app, request).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(success) => RpcResponse::success(seqno, success),
            Err(e) => {
                if e.is_fatal() {
                    error!(target: "rpc-dispatch", seqno, %e, "fatal error, shutting down");
                    self.app.shutdown_token().cancel();
                } else {
                    debug!(target: "rpc-dispatch", seqno, %e, "request failed");
                }
                RpcResponse::error(seqno, e)
            }
        }
    }
}

/// The dispatch table.
async fn handle_request<H: Host>(app: &App<H>, request: Request) -> HelperResult<Success> {
    match request {
        Request::AddStreamHandler { protocol } => app.add_stream_handler(protocol).await,
        Request::RemoveStreamHandler { protocol } => app.remove_stream_handler(protocol).await,
        Request::OpenStream { protocol_id, peer } => app.open_stream(peer.id, protocol_id).await,
        Request::CloseStream { stream_id } => app.close_stream(stream_id.id).await,
        Request::ResetStream { stream_id } => app.reset_stream(stream_id.id).await,
        Request::SendStream { msg } => app.send_stream(msg.stream_id.id, msg.data).await,
        Request::AddPeer { multiaddr } => app.add_peer(multiaddr).await,
        Request::GetListeningAddrs => app.listening_addrs().await,
        Request::ListPeers => app.list_peers().await,
    }
}
