//! Helper IT tests between two libp2p hosts on localhost.

use assert_matches::assert_matches;
use lh_network_libp2p::{Host as _, Multiaddr, NetworkHandle};
use lh_rpc::{
    messages::{PeerRef, Push, Request, RpcRequest, RpcResponse, ServerMessage, StreamMessage, Success},
    App, Dispatcher,
};
use lh_test_utils::{init_test_tracing, localhost_config, spawn_test_network, wait_for_listeners};
use std::time::Duration;
use tokio::{sync::mpsc, time::timeout};

const MINA: &str = "/mina/99";

/// A helper on a real libp2p host.
struct TestHelper {
    app: App<NetworkHandle>,
    dispatcher: Dispatcher<NetworkHandle>,
    pushes: mpsc::Receiver<ServerMessage>,
    listen_addr: Multiaddr,
}

impl TestHelper {
    async fn spawn() -> eyre::Result<Self> {
        let config = localhost_config();
        let handle = spawn_test_network(&config).await?;
        let listen_addr = wait_for_listeners(&handle).await?.remove(0);

        let (tx, pushes) = mpsc::channel(100);
        let app = App::new(handle, &config, tx.clone());
        let dispatcher = Dispatcher::new(app.clone(), tx);
        Ok(Self { app, dispatcher, pushes, listen_addr })
    }

    fn peer_id(&self) -> String {
        self.app.host().local_peer_id().to_string()
    }

    async fn request(&self, seqno: u64, request: Request) -> eyre::Result<RpcResponse> {
        let response = self.dispatcher.dispatch(RpcRequest::new(seqno, &request)?).await;
        assert_eq!(response.seqno, seqno);
        Ok(response)
    }

    async fn open(&self, remote: &TestHelper, seqno: u64) -> eyre::Result<(u64, RpcResponse)> {
        let response = self
            .request(
                seqno,
                Request::OpenStream { protocol_id: MINA.into(), peer: PeerRef { id: remote.peer_id() } },
            )
            .await?;
        let id = assert_matches!(
            response.as_success(),
            Some(Success::OpenStream { stream_id, .. }) => stream_id.id
        );
        Ok((id, response))
    }

    async fn next_push(&mut self) -> eyre::Result<Push> {
        loop {
            let msg = timeout(Duration::from_secs(10), self.pushes.recv())
                .await?
                .ok_or_else(|| eyre::eyre!("push channel closed"))?;
            if let ServerMessage::Push(push) = msg {
                return Ok(push);
            }
        }
    }
}

/// Two helpers where `a` dialed `b` and both accept `/mina/99`.
async fn connected_helpers() -> eyre::Result<(TestHelper, TestHelper)> {
    init_test_tracing();
    let a = TestHelper::spawn().await?;
    let b = TestHelper::spawn().await?;

    let response = a.request(1, Request::AddPeer { multiaddr: b.listen_addr.to_string() }).await?;
    assert_matches!(response.as_success(), Some(Success::AddPeer { peer }) if peer.id == b.peer_id());

    let response = a.request(9900, Request::AddStreamHandler { protocol: MINA.into() }).await?;
    assert_eq!(response, RpcResponse::success(9900, Success::AddStreamHandler));
    let response = b.request(9901, Request::AddStreamHandler { protocol: MINA.into() }).await?;
    assert_eq!(response, RpcResponse::success(9901, Success::AddStreamHandler));

    Ok((a, b))
}

#[tokio::test]
async fn test_open_stream_returns_live_peer_info() -> eyre::Result<()> {
    let (a, mut b) = connected_helpers().await?;

    let (id, response) = a.open(&b, 9900).await?;
    assert_eq!(response.seqno, 9900);
    assert_eq!(id, a.app.streams().counter());
    assert!(a.app.streams().contains(id));

    let peer = assert_matches!(response.as_success(), Some(Success::OpenStream { peer, .. }) => peer.clone());
    assert_eq!(peer.id, b.peer_id());
    // the dialed listener comes first
    assert_eq!(peer.addresses.first(), Some(&b.listen_addr.to_string()));

    let push = b.next_push().await?;
    let inbound = assert_matches!(push, Push::IncomingStream { stream_id, peer, protocol } => {
        assert_eq!(peer.id, a.peer_id());
        assert_eq!(protocol, MINA);
        stream_id.id
    });
    let handle = b.app.streams().lookup(inbound).expect("inbound stream registered");
    assert_eq!(handle.protocol().as_ref(), MINA);
    Ok(())
}

#[tokio::test]
async fn test_close_stream() -> eyre::Result<()> {
    let (a, b) = connected_helpers().await?;
    let (id, _) = a.open(&b, 9904).await?;

    let response = a.request(4778, Request::CloseStream { stream_id: id.into() }).await?;
    assert_eq!(response, RpcResponse::success(4778, Success::CloseStream));
    assert!(a.app.streams().lookup(id).is_none());

    let response = a.request(4779, Request::CloseStream { stream_id: id.into() }).await?;
    assert_eq!(response, RpcResponse::error(4779, format!("unknown stream id: {id}")));
    Ok(())
}

#[tokio::test]
async fn test_reset_stream() -> eyre::Result<()> {
    let (a, b) = connected_helpers().await?;
    let (id, _) = a.open(&b, 9902).await?;

    let response = a.request(114558, Request::ResetStream { stream_id: id.into() }).await?;
    assert_eq!(response, RpcResponse::success(114558, Success::ResetStream));
    assert!(!a.app.streams().contains(id));

    let response = a
        .request(114559, Request::SendStream { msg: StreamMessage { stream_id: id.into(), data: vec![1] } })
        .await?;
    assert_eq!(response, RpcResponse::error(114559, format!("unknown stream id: {id}")));
    Ok(())
}

#[tokio::test]
async fn test_send_stream() -> eyre::Result<()> {
    let (a, mut b) = connected_helpers().await?;
    let (id, _) = a.open(&b, 9903).await?;

    let response = a
        .request(
            4458,
            Request::SendStream {
                msg: StreamMessage { stream_id: id.into(), data: b"somedata".to_vec() },
            },
        )
        .await?;
    assert_eq!(response, RpcResponse::success(4458, Success::SendStream));
    assert!(a.app.streams().contains(id));

    let inbound = assert_matches!(b.next_push().await?, Push::IncomingStream { stream_id, .. } => stream_id);

    // data may arrive in several chunks
    let mut received = Vec::new();
    while received.len() < b"somedata".len() {
        let data = assert_matches!(
            b.next_push().await?,
            Push::IncomingStreamData { stream_id, data } if stream_id == inbound => data
        );
        received.extend(data);
    }
    assert_eq!(received, b"somedata");
    Ok(())
}

#[tokio::test]
async fn test_removed_handler_rejects_streams() -> eyre::Result<()> {
    let (a, b) = connected_helpers().await?;

    let response = b.request(1023, Request::RemoveStreamHandler { protocol: MINA.into() }).await?;
    assert_eq!(response, RpcResponse::success(1023, Success::RemoveStreamHandler));

    let response = a
        .request(
            1026,
            Request::OpenStream { protocol_id: MINA.into(), peer: PeerRef { id: b.peer_id() } },
        )
        .await?;
    assert_eq!(response, RpcResponse::error(1026, "libp2p error: protocol not supported"));
    Ok(())
}

#[tokio::test]
async fn test_remote_close_completes_stream() -> eyre::Result<()> {
    let (mut a, mut b) = connected_helpers().await?;
    let (id, _) = a.open(&b, 1).await?;
    let inbound = assert_matches!(b.next_push().await?, Push::IncomingStream { stream_id, .. } => stream_id);

    let response = b.request(2, Request::CloseStream { stream_id: inbound }).await?;
    assert_eq!(response, RpcResponse::success(2, Success::CloseStream));

    assert_eq!(a.next_push().await?, Push::StreamComplete { stream_id: id.into() });
    assert!(!a.app.streams().contains(id));
    Ok(())
}

#[tokio::test]
async fn test_readd_handler_after_remove() -> eyre::Result<()> {
    let (a, mut b) = connected_helpers().await?;

    let response = b.request(2, Request::RemoveStreamHandler { protocol: MINA.into() }).await?;
    assert_eq!(response, RpcResponse::success(2, Success::RemoveStreamHandler));
    let response = b.request(3, Request::AddStreamHandler { protocol: MINA.into() }).await?;
    assert_eq!(response, RpcResponse::success(3, Success::AddStreamHandler));

    let (_, response) = a.open(&b, 4).await?;
    assert_eq!(response.seqno, 4);
    assert_matches!(b.next_push().await?, Push::IncomingStream { peer, .. } if peer.id == a.peer_id());
    Ok(())
}

#[tokio::test]
async fn test_handler_cycles_on_one_helper() -> eyre::Result<()> {
    init_test_tracing();
    let helper = TestHelper::spawn().await?;

    for seqno in [1, 3, 5] {
        let response = helper.request(seqno, Request::AddStreamHandler { protocol: MINA.into() }).await?;
        assert_eq!(response, RpcResponse::success(seqno, Success::AddStreamHandler));
        let response =
            helper.request(seqno + 1, Request::RemoveStreamHandler { protocol: MINA.into() }).await?;
        assert_eq!(response, RpcResponse::success(seqno + 1, Success::RemoveStreamHandler));
    }
    Ok(())
}
