//! Relay session - pumps frames between the child connection and the remote
//! handle.
//!
//! Flow:
//! 1. Read and validate the header (tags + function definition)
//! 2. Build the remote handle, register tags and the inbound handler, connect
//! 3. Relay until the child closes, the remote ends, or either side fails
//!
//! The connection is split: the outbound loop owns the read half, the
//! inbound writer task owns the write half. The writer task starts on the
//! first inbound event and is guarded so it can only start once.

use std::io;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::bridge::codec::{HeaderCodec, TagDataCodec};
use crate::bridge::protocol::{Handshake, SessionId, TaggedFrame, decode_handshake};
use crate::error::BridgeError;
use crate::remote::{InboundHandler, Registration, RemoteConnector, RemoteHandle};

/// Lifecycle of one bridge run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingProcess,
    AwaitingConnection,
    AwaitingHandshake,
    Relaying,
    Terminated,
}

/// Why a run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The child closed its end of the connection at a frame boundary.
    ChildClosed,
    /// The remote session ended.
    RemoteClosed,
    /// The child process exited successfully.
    ChildExited,
    /// Torn down because another task finished first.
    Shutdown,
}

/// Shared, observable session state.
#[derive(Debug)]
pub struct StateTracker {
    id: SessionId,
    tx: watch::Sender<SessionState>,
}

impl StateTracker {
    pub fn new(id: SessionId) -> Self {
        let (tx, _) = watch::channel(SessionState::AwaitingProcess);
        Self { id, tx }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn current(&self) -> SessionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    pub fn enter(&self, state: SessionState) {
        let from = self.tx.send_replace(state);
        if from != state {
            tracing::debug!(session = %self.id, ?from, to = ?state, "Session state changed");
        }
    }
}

/// Remote-side parameters consumed, not interpreted, by the session.
#[derive(Clone, Default)]
pub struct SessionParams {
    /// Configured function name; only used to flag a mismatch with the
    /// definition's name.
    pub function_name: Option<String>,
    pub dispatcher_addr: String,
    pub credential: String,
    /// Definition document to use instead of the in-band one.
    pub definition_override: Option<String>,
}

/// Frames buffered for the child before the relay is failed.
const INBOUND_QUEUE_CAPACITY: usize = 1024;

type InboundParts = (
    mpsc::Receiver<TaggedFrame>,
    FramedWrite<OwnedWriteHalf, TagDataCodec>,
    mpsc::Sender<io::Error>,
);

enum WriterState {
    Pending(InboundParts),
    Running(JoinHandle<()>),
    Closed,
}

/// One-shot starter for the inbound writer task.
///
/// Only the caller that finds `Pending` spawns the writer. Once closed the
/// gate never starts it.
struct InboundGate {
    state: Mutex<WriterState>,
    runtime: tokio::runtime::Handle,
    span: tracing::Span,
}

impl InboundGate {
    fn new(parts: InboundParts) -> Self {
        Self {
            state: Mutex::new(WriterState::Pending(parts)),
            runtime: tokio::runtime::Handle::current(),
            span: tracing::Span::current(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start(&self) {
        let mut state = self.lock();
        let (frames, writer, errors) = match mem::replace(&mut *state, WriterState::Closed) {
            WriterState::Pending(parts) => parts,
            other => {
                *state = other;
                return;
            }
        };

        tracing::debug!(parent: &self.span, "Starting inbound writer");
        let handle = self
            .runtime
            .spawn(write_inbound(frames, writer, errors).instrument(self.span.clone()));
        *state = WriterState::Running(handle);
    }

    fn started(&self) -> bool {
        matches!(*self.lock(), WriterState::Running(_))
    }

    /// Stop the writer, or drop the write half if it never started.
    fn abort(&self) {
        let previous = mem::replace(&mut *self.lock(), WriterState::Closed);
        if let WriterState::Running(handle) = previous {
            handle.abort();
        }
    }
}

/// Handler the remote calls for every event: queue it and wake the writer.
fn inbound_handler(
    frames: mpsc::Sender<TaggedFrame>,
    errors: mpsc::Sender<io::Error>,
    gate: Arc<InboundGate>,
) -> InboundHandler {
    Arc::new(move |frame: TaggedFrame| {
        let tag = frame.tag;
        match frames.try_send(frame) {
            Ok(()) => gate.start(),
            Err(TrySendError::Full(_)) => {
                tracing::error!(tag, "Inbound queue full, child is not reading");
                let _ = errors.try_send(io::Error::other(
                    "inbound queue full: child is not reading",
                ));
            }
            Err(TrySendError::Closed(_)) => {
                tracing::trace!(tag, "Inbound frame dropped, session is closing");
            }
        }
    })
}

async fn write_inbound(
    mut frames: mpsc::Receiver<TaggedFrame>,
    mut writer: FramedWrite<OwnedWriteHalf, TagDataCodec>,
    errors: mpsc::Sender<io::Error>,
) {
    while let Some(frame) = frames.recv().await {
        let tag = frame.tag;
        if let Err(e) = writer.send(frame).await {
            tracing::error!(tag, error = %e, "Failed to write frame to child");
            let _ = errors.try_send(e);
            return;
        }
    }
    tracing::debug!("Inbound writer exiting");
}

/// Established session, ready to relay.
pub struct RelaySession {
    handshake: Handshake,
    reader: FramedRead<OwnedReadHalf, TagDataCodec>,
    remote: Arc<dyn RemoteHandle>,
    gate: Arc<InboundGate>,
    inbound_errors: mpsc::Receiver<io::Error>,
    state: Arc<StateTracker>,
}

impl RelaySession {
    /// Perform the handshake on `stream` and connect the remote handle.
    pub async fn establish(
        stream: UnixStream,
        connector: &dyn RemoteConnector,
        params: SessionParams,
        state: Arc<StateTracker>,
    ) -> Result<Self, BridgeError> {
        state.enter(SessionState::AwaitingHandshake);

        let (read_half, write_half) = stream.into_split();
        let mut header_reader = FramedRead::new(read_half, HeaderCodec::new());

        let raw = match header_reader.next().await {
            Some(Ok(raw)) => raw,
            Some(Err(e)) => return Err(BridgeError::Decode(e.to_string())),
            None => {
                return Err(BridgeError::Decode(
                    "connection closed before header".to_string(),
                ));
            }
        };
        let handshake = decode_handshake(&raw, params.definition_override)?;
        tracing::info!(
            name = %handshake.name(),
            tags = ?handshake.tags,
            "Handshake complete"
        );

        if let Some(configured) = params.function_name.as_deref()
            && !configured.is_empty()
            && configured != handshake.name()
        {
            tracing::warn!(
                configured,
                definition = %handshake.name(),
                "Configured function name differs from definition; registering definition name"
            );
        }

        let remote = connector.create(Registration {
            name: handshake.name().to_string(),
            dispatcher_addr: params.dispatcher_addr,
            credential: params.credential,
            definition: handshake.definition_raw.clone(),
        });
        remote.set_observed_tags(&handshake.tags);

        let (frames_tx, frames_rx) = mpsc::channel::<TaggedFrame>(INBOUND_QUEUE_CAPACITY);
        // A single failure ends the relay; later ones are dropped.
        let (errors_tx, errors_rx) = mpsc::channel(1);
        let writer = FramedWrite::new(write_half, TagDataCodec);
        let gate = Arc::new(InboundGate::new((frames_rx, writer, errors_tx.clone())));
        let handler = inbound_handler(frames_tx, errors_tx, Arc::clone(&gate));
        remote.set_handler(handler);

        remote.connect().await.map_err(BridgeError::Connect)?;
        tracing::info!(session = %state.id(), "Remote handle connected");

        state.enter(SessionState::Relaying);

        Ok(Self {
            handshake,
            reader: header_reader.map_decoder(|_| TagDataCodec),
            remote,
            gate,
            inbound_errors: errors_rx,
            state,
        })
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// Whether the inbound writer has been started by a remote event.
    pub fn inbound_started(&self) -> bool {
        self.gate.started()
    }

    /// Relay until the first termination trigger, then tear down.
    pub async fn relay(mut self, shutdown: CancellationToken) -> Result<Termination, BridgeError> {
        let remote = Arc::clone(&self.remote);
        let reader = &mut self.reader;

        let outbound = async {
            loop {
                match reader.next().await {
                    Some(Ok(frame)) => remote.write(frame).await,
                    Some(Err(e)) => return Err(BridgeError::RelayIo(e)),
                    None => {
                        tracing::debug!("Child closed connection");
                        return Ok(Termination::ChildClosed);
                    }
                }
            }
        };

        let result = tokio::select! {
            result = outbound => result,
            _ = remote.wait() => {
                tracing::info!("Remote session ended");
                Ok(Termination::RemoteClosed)
            }
            Some(e) = self.inbound_errors.recv() => Err(BridgeError::RelayIo(e)),
            _ = shutdown.cancelled() => Ok(Termination::Shutdown),
        };

        self.gate.abort();
        self.remote.close().await;
        self.state.enter(SessionState::Terminated);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gate_starts_writer_once_under_concurrent_events() {
        let (host, child) = UnixStream::pair().unwrap();
        let (_read, write) = host.into_split();
        let (frames_tx, frames_rx) = mpsc::channel(8);
        let (errors_tx, _errors_rx) = mpsc::channel(1);
        let gate = Arc::new(InboundGate::new((
            frames_rx,
            FramedWrite::new(write, TagDataCodec),
            errors_tx,
        )));

        let threads: Vec<_> = (0..8u32)
            .map(|i| {
                let gate = Arc::clone(&gate);
                let frames_tx = frames_tx.clone();
                std::thread::spawn(move || {
                    frames_tx
                        .try_send(TaggedFrame::new(i, i.to_le_bytes().to_vec()))
                        .unwrap();
                    gate.start();
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert!(gate.started());

        let mut reader = FramedRead::new(child, TagDataCodec);
        let mut tags = Vec::new();
        for _ in 0..8 {
            let frame = reader.next().await.unwrap().unwrap();
            assert_eq!(&frame.payload[..], &frame.tag.to_le_bytes()[..]);
            tags.push(frame.tag);
        }
        tags.sort_unstable();
        assert_eq!(tags, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn start_after_abort_never_spawns_writer() {
        let (host, child) = UnixStream::pair().unwrap();
        let (_read, write) = host.into_split();
        let (frames_tx, frames_rx) = mpsc::channel(8);
        let (errors_tx, _errors_rx) = mpsc::channel(1);
        let gate = InboundGate::new((frames_rx, FramedWrite::new(write, TagDataCodec), errors_tx));

        gate.abort();
        assert!(frames_tx.try_send(TaggedFrame::new(1, b"late".to_vec())).is_err());
        gate.start();

        assert!(!gate.started());
        let mut reader = FramedRead::new(child, TagDataCodec);
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn full_inbound_queue_fails_the_relay() {
        let (host, _child) = UnixStream::pair().unwrap();
        let (_read, write) = host.into_split();
        let (frames_tx, frames_rx) = mpsc::channel(2);
        let (errors_tx, mut errors_rx) = mpsc::channel(1);
        let gate = Arc::new(InboundGate::new((
            frames_rx,
            FramedWrite::new(write, TagDataCodec),
            errors_tx.clone(),
        )));
        let handler = inbound_handler(frames_tx, errors_tx, Arc::clone(&gate));

        // The child never reads, so the writer stalls on the first frame.
        for tag in 0..10 {
            handler(TaggedFrame::new(tag, vec![0u8; 1 << 20]));
        }

        let err = errors_rx.recv().await.unwrap();
        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert!(err.to_string().contains("inbound queue full"), "{err}");
        gate.abort();
    }

    #[tokio::test]
    async fn state_tracker_publishes_transitions() {
        let tracker = StateTracker::new(SessionId::new());
        let mut rx = tracker.subscribe();
        assert_eq!(tracker.current(), SessionState::AwaitingProcess);

        tracker.enter(SessionState::AwaitingConnection);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), SessionState::AwaitingConnection);
    }
}
