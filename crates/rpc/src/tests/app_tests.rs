//! Tests for the RPC operations against in-memory hosts.

use super::*;
use crate::{
    dispatch::Dispatcher,
    messages::{PeerRef, Request, RpcRequest, RpcResponse, StreamMessage},
};
use assert_matches::assert_matches;
use lh_test_utils::{MockHost, MockNetwork};
use tokio::time::timeout;

const MINA: &str = "/mina/99";

/// An app on a mock host with its push receiver.
struct TestNode {
    app: App<MockHost>,
    dispatcher: Dispatcher<MockHost>,
    pushes: mpsc::Receiver<ServerMessage>,
}

impl TestNode {
    fn new(host: MockHost) -> Self {
        Self::with_config(host, HelperConfig::default())
    }

    fn with_config(host: MockHost, config: HelperConfig) -> Self {
        let (tx, pushes) = mpsc::channel(100);
        let app = App::new(host, &config, tx.clone());
        let dispatcher = Dispatcher::new(app.clone(), tx);
        Self { app, dispatcher, pushes }
    }

    fn peer_id(&self) -> String {
        self.app.host().local_peer_id().to_string()
    }

    async fn request(&self, seqno: u64, request: Request) -> RpcResponse {
        let envelope = RpcRequest::new(seqno, &request).unwrap();
        self.dispatcher.dispatch(envelope).await
    }

    /// The next push notification.
    async fn next_push(&mut self) -> Push {
        loop {
            let msg = timeout(Duration::from_secs(5), self.pushes.recv())
                .await
                .expect("push before timeout")
                .expect("push channel open");
            if let ServerMessage::Push(push) = msg {
                return push;
            }
        }
    }

    /// Open a stream to `remote` and return its id.
    async fn open(&self, remote: &TestNode, seqno: u64) -> u64 {
        let response = self
            .request(
                seqno,
                Request::OpenStream {
                    protocol_id: MINA.into(),
                    peer: PeerRef { id: remote.peer_id() },
                },
            )
            .await;
        assert_eq!(response.seqno, seqno);
        match response.as_success() {
            Some(Success::OpenStream { stream_id, .. }) => stream_id.id,
            other => panic!("unexpected response: {other:?} {:?}", response.as_error()),
        }
    }
}

/// Two connected nodes where `b` accepts `/mina/99`.
async fn connected_pair() -> (TestNode, TestNode) {
    let network = MockNetwork::new();
    let a = TestNode::new(network.host());
    let b = TestNode::new(network.host());
    a.app.host().connect(b.app.host().address()).await.unwrap();

    let response = b.request(9901, Request::AddStreamHandler { protocol: MINA.into() }).await;
    assert_eq!(response, RpcResponse::success(9901, Success::AddStreamHandler));
    (a, b)
}

#[tokio::test]
async fn test_open_stream_registers_on_both_sides() {
    let network = MockNetwork::new();
    let a = TestNode::new(network.host());
    let mut b = TestNode::new(network.host());
    a.app.host().connect(b.app.host().address()).await.unwrap();

    let res_a = a.request(9900, Request::AddStreamHandler { protocol: MINA.into() }).await;
    let res_b = b.request(9901, Request::AddStreamHandler { protocol: MINA.into() }).await;
    assert_eq!(res_a, RpcResponse::success(9900, Success::AddStreamHandler));
    assert_eq!(res_b, RpcResponse::success(9901, Success::AddStreamHandler));

    let response = a
        .request(
            9900,
            Request::OpenStream { protocol_id: MINA.into(), peer: PeerRef { id: b.peer_id() } },
        )
        .await;
    assert_eq!(response.seqno, 9900);
    let (stream_id, peer) = assert_matches!(
        response.as_success(),
        Some(Success::OpenStream { stream_id, peer }) => (stream_id.id, peer.clone())
    );
    assert_eq!(stream_id, a.app.streams().counter());
    assert!(a.app.streams().contains(stream_id));
    assert_eq!(peer.id, b.peer_id());
    assert_eq!(peer.addresses, vec![b.app.host().address().to_string()]);

    // b registered the inbound side
    let push = b.next_push().await;
    let inbound = assert_matches!(push, Push::IncomingStream { stream_id, peer, protocol } => {
        assert_eq!(peer.id, a.peer_id());
        assert_eq!(protocol, MINA);
        stream_id.id
    });
    let handle = b.app.streams().lookup(inbound).unwrap();
    assert_eq!(handle.protocol().as_ref(), MINA);
    assert_eq!(handle.state(), StreamState::Open);
}

#[tokio::test]
async fn test_stream_ids_strictly_increase() {
    let (a, b) = connected_pair().await;
    let mut ids = Vec::new();
    for seqno in 0..5 {
        ids.push(a.open(&b, seqno).await);
    }
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(a.app.streams().ids(), ids);
}

#[tokio::test]
async fn test_close_is_terminal() {
    let (a, mut b) = connected_pair().await;
    let id = a.open(&b, 9904).await;

    let response = a.request(4778, Request::CloseStream { stream_id: id.into() }).await;
    assert_eq!(response, RpcResponse::success(4778, Success::CloseStream));
    assert!(!a.app.streams().contains(id));

    let unknown = format!("unknown stream id: {id}");
    for (seqno, request) in [
        (1, Request::CloseStream { stream_id: id.into() }),
        (2, Request::ResetStream { stream_id: id.into() }),
        (
            3,
            Request::SendStream {
                msg: StreamMessage { stream_id: id.into(), data: b"late".to_vec() },
            },
        ),
    ] {
        let response = a.request(seqno, request).await;
        assert_eq!(response, RpcResponse::error(seqno, &unknown));
    }

    // the remote side observes the close
    let inbound = assert_matches!(b.next_push().await, Push::IncomingStream { stream_id, .. } => stream_id);
    assert_eq!(b.next_push().await, Push::StreamComplete { stream_id: inbound });
    assert!(!b.app.streams().contains(inbound.id));
}

#[tokio::test]
async fn test_reset_is_terminal() {
    let (a, b) = connected_pair().await;
    let id = a.open(&b, 9902).await;

    let response = a.request(114558, Request::ResetStream { stream_id: id.into() }).await;
    assert_eq!(response, RpcResponse::success(114558, Success::ResetStream));
    assert!(!a.app.streams().contains(id));

    let response = a.request(114559, Request::ResetStream { stream_id: id.into() }).await;
    assert_matches!(response.as_error(), Some(e) if e == format!("unknown stream id: {id}"));
}

#[tokio::test]
async fn test_send_keeps_stream_open_and_delivers() {
    let (a, mut b) = connected_pair().await;
    let id = a.open(&b, 9903).await;
    let inbound = assert_matches!(b.next_push().await, Push::IncomingStream { stream_id, .. } => stream_id);

    let response = a
        .request(
            4458,
            Request::SendStream {
                msg: StreamMessage { stream_id: id.into(), data: b"somedata".to_vec() },
            },
        )
        .await;
    assert_eq!(response, RpcResponse::success(4458, Success::SendStream));
    assert!(a.app.streams().contains(id));
    assert_eq!(a.app.streams().lookup(id).unwrap().state(), StreamState::Open);

    // a single small write arrives as one chunk on the in-memory pipe
    assert_eq!(
        b.next_push().await,
        Push::IncomingStreamData { stream_id: inbound, data: b"somedata".to_vec() }
    );
}

#[tokio::test]
async fn test_failed_send_resets_stream() {
    let (a, mut b) = connected_pair().await;
    a.app.host().network().set_broken_writes(true);
    let id = a.open(&b, 9905).await;
    a.app.host().network().set_broken_writes(false);
    assert_matches!(b.next_push().await, Push::IncomingStream { .. });

    // the write fails while the reader is still waiting for data
    let response = a
        .request(4459, Request::SendStream { msg: StreamMessage { stream_id: id.into(), data: b"lost".to_vec() } })
        .await;
    assert_eq!(response.seqno, 4459);
    assert_matches!(response.as_error(), Some(e) if e.starts_with("stream error"));
    assert!(!a.app.streams().contains(id));

    let response = a
        .request(4460, Request::SendStream { msg: StreamMessage { stream_id: id.into(), data: vec![1] } })
        .await;
    assert_eq!(response, RpcResponse::error(4460, format!("unknown stream id: {id}")));
}

#[tokio::test]
async fn test_removed_handler_is_not_supported() {
    let (a, b) = connected_pair().await;

    let response = b.request(1023, Request::RemoveStreamHandler { protocol: MINA.into() }).await;
    assert_eq!(response, RpcResponse::success(1023, Success::RemoveStreamHandler));
    assert!(!b.app.handlers().contains(&StreamProtocol::new(MINA)).await);

    let response = a
        .request(
            1026,
            Request::OpenStream { protocol_id: MINA.into(), peer: PeerRef { id: b.peer_id() } },
        )
        .await;
    assert_eq!(response, RpcResponse::error(1026, "libp2p error: protocol not supported"));
    assert!(a.app.streams().is_empty());
}

#[tokio::test]
async fn test_remove_unknown_handler_succeeds() {
    let node = TestNode::new(MockNetwork::new().host());
    let response = node.request(5, Request::RemoveStreamHandler { protocol: "/never".into() }).await;
    assert_eq!(response, RpcResponse::success(5, Success::RemoveStreamHandler));
}

#[tokio::test]
async fn test_readding_handler_keeps_accepting() {
    let (a, mut b) = connected_pair().await;
    let response = b.request(2, Request::AddStreamHandler { protocol: MINA.into() }).await;
    assert_eq!(response, RpcResponse::success(2, Success::AddStreamHandler));
    assert_eq!(b.app.handlers().protocols().await, vec![StreamProtocol::new(MINA)]);

    a.open(&b, 3).await;
    assert_matches!(b.next_push().await, Push::IncomingStream { .. });
}

#[tokio::test]
async fn test_handler_can_be_added_after_removal() {
    let (a, mut b) = connected_pair().await;

    let response = b.request(1, Request::RemoveStreamHandler { protocol: MINA.into() }).await;
    assert_eq!(response, RpcResponse::success(1, Success::RemoveStreamHandler));
    let response = b.request(2, Request::AddStreamHandler { protocol: MINA.into() }).await;
    assert_eq!(response, RpcResponse::success(2, Success::AddStreamHandler));

    a.open(&b, 3).await;
    assert_matches!(b.next_push().await, Push::IncomingStream { .. });
}

#[tokio::test]
async fn test_remote_reset_tears_down_local_stream() {
    let (mut a, mut b) = connected_pair().await;
    let id = a.open(&b, 1).await;
    let inbound = assert_matches!(b.next_push().await, Push::IncomingStream { stream_id, .. } => stream_id);

    let response = b.request(2, Request::ResetStream { stream_id: inbound }).await;
    assert_eq!(response, RpcResponse::success(2, Success::ResetStream));

    // the pipe is gone, so a's reader sees the end of the stream and removes it
    assert_eq!(a.next_push().await, Push::StreamComplete { stream_id: id.into() });
    assert!(!a.app.streams().contains(id));

    let response = a
        .request(3, Request::SendStream { msg: StreamMessage { stream_id: id.into(), data: vec![1] } })
        .await;
    assert_eq!(response, RpcResponse::error(3, format!("unknown stream id: {id}")));
}

#[tokio::test]
async fn test_invalid_fields_are_malformed() {
    let (a, b) = connected_pair().await;

    let response = a
        .request(
            1,
            Request::OpenStream { protocol_id: MINA.into(), peer: PeerRef { id: "not-a-peer".into() } },
        )
        .await;
    assert_matches!(response.as_error(), Some(e) if e.starts_with("malformed request: invalid peer id"));

    let response = a
        .request(2, Request::OpenStream { protocol_id: "mina".into(), peer: PeerRef { id: b.peer_id() } })
        .await;
    assert_matches!(response.as_error(), Some(e) if e.starts_with("malformed request: invalid protocol id"));

    let response = a.request(3, Request::AddStreamHandler { protocol: String::new() }).await;
    assert_matches!(response.as_error(), Some(e) if e.starts_with("malformed request"));

    let response = a.request(4, Request::AddPeer { multiaddr: "nonsense".into() }).await;
    assert_matches!(response.as_error(), Some(e) if e.starts_with("malformed request: invalid multiaddr"));
}

#[tokio::test]
async fn test_undecodable_body_keeps_seqno() {
    let node = TestNode::new(MockNetwork::new().host());
    let response = node.dispatcher.dispatch(RpcRequest { seqno: 77, body: vec![0xff; 3] }).await;
    assert_eq!(response.seqno, 77);
    assert_matches!(response.as_error(), Some(e) if e.starts_with("malformed request"));
}

#[tokio::test]
async fn test_open_stream_times_out() {
    let network = MockNetwork::new();
    let mut config = HelperConfig::default();
    config.network.open_stream_timeout = Duration::from_millis(20);
    let a = TestNode::with_config(network.host(), config);
    let b = TestNode::new(network.host());
    b.request(1, Request::AddStreamHandler { protocol: MINA.into() }).await;

    network.set_open_delay(Some(Duration::from_secs(5)));
    let response = a
        .request(2, Request::OpenStream { protocol_id: MINA.into(), peer: PeerRef { id: b.peer_id() } })
        .await;
    assert_eq!(response, RpcResponse::error(2, "libp2p error: timed out after 20ms"));
    assert!(a.app.streams().is_empty());
}

#[tokio::test]
async fn test_peer_operations() {
    let network = MockNetwork::new();
    let a = TestNode::new(network.host());
    let b = TestNode::new(network.host());
    let b_addr = b.app.host().address().to_string();

    let response = a.request(1, Request::AddPeer { multiaddr: b_addr.clone() }).await;
    let peer = assert_matches!(response.as_success(), Some(Success::AddPeer { peer }) => peer.clone());
    assert_eq!(peer.id, b.peer_id());
    assert_eq!(peer.addresses, vec![b_addr.clone()]);

    let response = a.request(2, Request::ListPeers).await;
    assert_eq!(response, RpcResponse::success(2, Success::ListPeers { peers: vec![peer] }));

    let response = b.request(3, Request::GetListeningAddrs).await;
    assert_eq!(response, RpcResponse::success(3, Success::GetListeningAddrs { addrs: vec![b_addr] }));
}

#[tokio::test]
async fn test_concurrent_opens_get_distinct_ids() {
    let (a, b) = connected_pair().await;
    let peer = b.peer_id();

    let tasks: Vec<_> = (0..16)
        .map(|seqno| {
            let dispatcher = a.dispatcher.clone();
            let peer = peer.clone();
            tokio::spawn(async move {
                let request = Request::OpenStream { protocol_id: MINA.into(), peer: PeerRef { id: peer } };
                dispatcher.dispatch(RpcRequest::new(seqno, &request).unwrap()).await
            })
        })
        .collect();

    let mut ids = Vec::new();
    for (seqno, task) in tasks.into_iter().enumerate() {
        let response = task.await.unwrap();
        assert_eq!(response.seqno, seqno as u64);
        ids.push(assert_matches!(response.as_success(), Some(Success::OpenStream { stream_id, .. }) => stream_id.id));
    }

    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 16);
    assert_eq!(a.app.streams().len(), 16);
    assert_eq!(a.app.streams().counter(), 16);
}

#[tokio::test]
async fn test_teardown_resets_everything() {
    let (a, b) = connected_pair().await;
    a.open(&b, 1).await;
    a.open(&b, 2).await;

    b.app.teardown().await;
    assert!(b.app.handlers().protocols().await.is_empty());
    assert!(b.app.streams().is_empty());

    a.app.teardown().await;
    assert!(a.app.streams().is_empty());
}
