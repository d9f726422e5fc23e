//! Registry of open streams.

use crate::error::{HelperError, HelperResult};
use futures::{io::WriteHalf, AsyncRead, AsyncWrite, AsyncWriteExt as _};
use lh_network_libp2p::{PeerId, StreamProtocol};
use parking_lot::Mutex;
use std::{
    collections::{hash_map::Entry, HashMap},
    fmt, io,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
    },
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// The lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    /// Registered and usable.
    Open = 0,
    /// Gracefully closed, either locally or by the remote peer.
    Closed = 1,
    /// Abruptly terminated.
    Reset = 2,
}

impl StreamState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Closed,
            _ => Self::Reset,
        }
    }
}

/// A registered stream.
///
/// The background reader owns the read half. The handle owns the write half and the means to stop
/// the reader.
pub struct StreamHandle<S> {
    /// The id assigned by the registry.
    id: u64,
    /// The remote peer.
    peer_id: PeerId,
    /// The negotiated protocol.
    protocol: StreamProtocol,
    /// Write half of the connection. `None` after teardown.
    ///
    /// Sends hold the lock for the whole write so a close waits for in-flight sends.
    writer: tokio::sync::Mutex<Option<WriteHalf<S>>>,
    /// [StreamState] as u8.
    state: AtomicU8,
    /// Cancelled by a reset. Aborts in-flight sends.
    abort: CancellationToken,
    /// Cancelled by any teardown. Stops the reader.
    ///
    /// Child of `abort`.
    shutdown: CancellationToken,
    /// The background reader task.
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl<S> fmt::Debug for StreamHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("peer_id", &self.peer_id)
            .field("protocol", &self.protocol)
            .field("state", &self.state())
            .finish()
    }
}

impl<S> StreamHandle<S> {
    /// Create a new instance of Self.
    pub fn new(id: u64, peer_id: PeerId, protocol: StreamProtocol, writer: WriteHalf<S>) -> Self {
        let abort = CancellationToken::new();
        let shutdown = abort.child_token();
        Self {
            id,
            peer_id,
            protocol,
            writer: tokio::sync::Mutex::new(Some(writer)),
            state: AtomicU8::new(StreamState::Open as u8),
            abort,
            shutdown,
            reader: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn protocol(&self) -> &StreamProtocol {
        &self.protocol
    }

    /// The current lifecycle state.
    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Token the background reader must observe.
    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Attach the background reader task.
    pub(crate) fn set_reader(&self, reader: JoinHandle<()>) {
        *self.reader.lock() = Some(reader);
    }

    /// Move out of `Open`. Only the registry calls this, under its lock.
    fn terminate(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl<S> StreamHandle<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Write `data` and flush.
    ///
    /// Fails if the stream was reset while waiting for the writer or while writing.
    pub(crate) async fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = tokio::select! {
            biased;
            _ = self.abort.cancelled() => return Err(reset_error()),
            writer = self.writer.lock() => writer,
        };
        let writer = writer.as_mut().ok_or_else(reset_error)?;

        tokio::select! {
            biased;
            _ = self.abort.cancelled() => Err(reset_error()),
            res = async {
                writer.write_all(data).await?;
                writer.flush().await
            } => res,
        }
    }

    /// Stop the reader, wait for in-flight sends, then flush and close the write half.
    pub(crate) async fn close(&self) -> io::Result<()> {
        self.stop_reader().await;
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            writer.close().await?;
        }
        trace!(target: "stream-registry", id = self.id, "stream closed");
        Ok(())
    }

    /// Abort in-flight sends, stop the reader and drop the connection without flushing.
    pub(crate) async fn reset(&self) {
        self.abort.cancel();
        self.stop_reader().await;
        drop(self.writer.lock().await.take());
        trace!(target: "stream-registry", id = self.id, "stream reset");
    }

    /// Teardown performed by the reader task itself after EOF or a read error.
    ///
    /// The reader cannot join itself, so its handle is detached instead.
    pub(crate) async fn release_from_reader(&self, state: StreamState) {
        if state == StreamState::Reset {
            self.abort.cancel();
        }
        self.shutdown.cancel();
        drop(self.reader.lock().take());

        let writer = self.writer.lock().await.take();
        if let (Some(mut writer), StreamState::Closed) = (writer, state) {
            // the remote side finished writing, finish ours
            if let Err(e) = writer.close().await {
                debug!(target: "stream-registry", id = self.id, ?e, "failed to close writer");
            }
        }
    }

    /// Cancel the reader and wait for it to exit.
    async fn stop_reader(&self) {
        self.shutdown.cancel();
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                debug!(target: "stream-registry", id = self.id, ?e, "reader task failed");
            }
        }
    }
}

/// Error returned to sends on a stream that was reset.
fn reset_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "stream reset")
}

/// Maps stream ids to open streams and issues new ids.
pub struct StreamRegistry<S> {
    /// The last issued id.
    counter: AtomicU64,
    /// Open streams.
    ///
    /// The lock is only held for the map operation itself.
    streams: Mutex<HashMap<u64, Arc<StreamHandle<S>>>>,
}

impl<S> fmt::Debug for StreamRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("counter", &self.counter())
            .field("open", &self.len())
            .finish()
    }
}

impl<S> Default for StreamRegistry<S> {
    fn default() -> Self {
        Self { counter: AtomicU64::new(0), streams: Mutex::new(HashMap::new()) }
    }
}

impl<S> StreamRegistry<S> {
    /// Issue the next stream id. The first id is 1.
    pub fn allocate(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The last issued id.
    pub fn counter(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Register an open stream.
    pub fn insert(&self, handle: Arc<StreamHandle<S>>) -> HelperResult<()> {
        let mut streams = self.streams.lock();
        match streams.entry(handle.id) {
            Entry::Occupied(_) => Err(HelperError::DuplicateStreamId(handle.id)),
            Entry::Vacant(entry) => {
                entry.insert(handle);
                Ok(())
            }
        }
    }

    /// Return the stream registered under `id`.
    pub fn lookup(&self, id: u64) -> Option<Arc<StreamHandle<S>>> {
        self.streams.lock().get(&id).cloned()
    }

    /// Remove the stream registered under `id` and move it to `state`.
    ///
    /// Both happen under the registry lock, so no caller observes a registered stream that is not
    /// `Open`. Only one caller gets the handle back and performs teardown.
    pub fn remove(&self, id: u64, state: StreamState) -> Option<Arc<StreamHandle<S>>> {
        let mut streams = self.streams.lock();
        let handle = streams.remove(&id)?;
        handle.terminate(state);
        Some(handle)
    }

    /// Remove every stream, moving each to `state`.
    pub fn drain(&self, state: StreamState) -> Vec<Arc<StreamHandle<S>>> {
        let mut streams = self.streams.lock();
        streams
            .drain()
            .map(|(_, handle)| {
                handle.terminate(state);
                handle
            })
            .collect()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.streams.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered ids in ascending order.
    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.streams.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
