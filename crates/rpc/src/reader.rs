//! Background reader for an open stream.

use crate::{
    app::App,
    messages::{Push, StreamId},
    registry::StreamState,
};
use futures::{io::ReadHalf, AsyncReadExt as _};
use lh_network_libp2p::Host;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Forward everything read from a stream to the client as [Push::IncomingStreamData].
///
/// This task is the only reader of the stream. It exits when `shutdown` is cancelled by a close or
/// reset. On EOF or a read error it removes the stream from the registry itself and notifies the
/// client, unless a request already removed it.
pub(crate) async fn read_stream<H: Host>(
    app: App<H>,
    id: u64,
    shutdown: CancellationToken,
    mut reader: ReadHalf<H::Stream>,
) {
    let stream_id = StreamId::from(id);
    let mut buf = vec![0u8; app.read_buffer_size()];

    loop {
        let read = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                trace!(target: "stream-registry", id, "reader cancelled");
                return;
            }
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                debug!(target: "stream-registry", id, "remote closed stream");
                if app.release_stream(id, StreamState::Closed).await {
                    app.push(Push::StreamComplete { stream_id }).await;
                }
                return;
            }
            Ok(n) => {
                trace!(target: "stream-registry", id, bytes = n, "read from stream");
                let push = app.push(Push::IncomingStreamData { stream_id, data: buf[..n].to_vec() });
                // a full outbound channel must not delay close or reset
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return,
                    _ = push => {}
                }
            }
            Err(e) => {
                debug!(target: "stream-registry", id, ?e, "stream read failed");
                if app.release_stream(id, StreamState::Reset).await {
                    app.push(Push::StreamLost { stream_id, reason: e.to_string() }).await;
                }
                return;
            }
        }
    }
}
