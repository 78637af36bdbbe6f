//! One connection: reader task -> bounded queue -> dispatcher task.
//!
//! ```text
//! socket --> reader --(mpsc, depth = cpus)--> dispatcher --> MessageHandler
//!   ^                                                             |
//!   +---------------------- SessionHandle::send <-----------------+
//! ```
//!
//! A full queue blocks the reader, which stops reading the socket, which
//! lets TCP flow control stall the remote sender. Any I/O or framing error
//! closes the session; reconnecting is the caller's business.
//!
//! A handler that answers while the peer may still be streaming at it must
//! use [`SessionHandle::post`] rather than `send`. If both dispatchers block
//! in `send` with both queues full, neither side reads again. `post` hands
//! the message to a per-session writer task and returns at once, so the
//! dispatcher keeps draining the queue.

pub mod state;

pub use state::SessionState;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};
use crate::protocol::Message;
use crate::wire::{read_frame, Frame, FrameError, Scrambler, DEFAULT_SLICE_SIZE};

/// Queue depth between reader and dispatcher.
pub fn default_queue_depth() -> usize {
    num_cpus::get().max(2)
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub scrambler: Scrambler,
    /// Maximum frame slice
    pub slice_size: usize,
    pub queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scrambler: Scrambler::disabled(),
            slice_size: DEFAULT_SLICE_SIZE,
            queue_depth: default_queue_depth(),
        }
    }
}

/// Callbacks invoked by a session.
///
/// `on_message` runs on the dispatcher, one message at a time in arrival
/// order. An error (or panic) from it is logged and the loop continues.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, session: &SessionHandle, message: Message) -> anyhow::Result<()>;

    /// After a whole message has been written.
    fn on_sent(&self, _session: &SessionHandle, _message: &Message) {}

    /// Peer sent bytes that do not form a valid frame or message. Followed by `on_error`.
    fn on_data_error(&self, _session: &SessionHandle, _error: &SyncError) {}

    /// The session failed. Called at most once.
    fn on_error(&self, _session: &SessionHandle, _error: &SyncError) {}

    /// The session closed, by error or on request. Called exactly once.
    fn on_closed(&self, _session: &SessionHandle) {}
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Inner {
    peer: String,
    config: SessionConfig,
    writer: Mutex<BoxedWriter>,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
    closed: AtomicBool,
    handler: Arc<dyn MessageHandler>,
    outbox: mpsc::UnboundedSender<Message>,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// Cheap, cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Start the reader and dispatcher tasks for a connected transport.
pub fn spawn<R, W>(
    reader: R,
    writer: W,
    peer: impl Into<String>,
    config: SessionConfig,
    handler: Arc<dyn MessageHandler>,
) -> SessionHandle
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (state, _) = watch::channel(SessionState::Connected);
    let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
    let (outbox, posted) = mpsc::unbounded_channel();

    let handle = SessionHandle {
        inner: Arc::new(Inner {
            peer: peer.into(),
            config,
            writer: Mutex::new(Box::new(writer)),
            state,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            handler,
            outbox,
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }),
    };

    debug!(peer = %handle.inner.peer, "Session started");
    tokio::spawn(read_loop(handle.clone(), reader, tx));
    tokio::spawn(dispatch_loop(handle.clone(), rx));
    tokio::spawn(outbox_loop(handle.clone(), posted));
    handle
}

impl SessionHandle {
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Move forward in the lifecycle. Returns false if the move is not allowed.
    pub fn set_state(&self, next: SessionState) -> bool {
        let moved = self.inner.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if moved {
            debug!(peer = %self.inner.peer, state = %next, "Session state changed");
        }
        moved
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            messages_sent: self.inner.messages_sent.load(Ordering::Relaxed),
            messages_received: self.inner.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.inner.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Frame, scramble and write one message. Its frames are written
    /// back-to-back under the writer lock, so messages never interleave.
    pub async fn send(&self, message: impl Into<Message>) -> Result<()> {
        let message = message.into();
        if self.is_closed() {
            return Err(SyncError::SessionClosed);
        }

        let frames = Frame::split(message.encode(), self.inner.config.slice_size);
        let mut wire = BytesMut::with_capacity(frames.iter().map(Frame::encoded_len).sum());
        for frame in &frames {
            let mut raw = frame.encode();
            self.inner.config.scrambler.apply(&mut raw);
            wire.extend_from_slice(&raw);
        }

        let written = {
            let mut writer = self.inner.writer.lock().await;
            match writer.write_all(&wire).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };

        match written {
            Ok(()) => {
                self.inner.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .bytes_sent
                    .fetch_add(wire.len() as u64, Ordering::Relaxed);
                debug!(
                    peer = %self.inner.peer,
                    kind = ?message.kind(),
                    request_id = ?message.request_id(),
                    frames = frames.len(),
                    "Sent message"
                );
                self.inner.handler.on_sent(self, &message);
                Ok(())
            }
            Err(e) => {
                let err = SyncError::Io(e);
                self.fail(&err);
                Err(err)
            }
        }
    }

    /// Queue a message for the writer task and return without waiting for
    /// the socket. Posted messages go out in posting order; a write failure
    /// closes the session like a failed `send`.
    pub fn post(&self, message: impl Into<Message>) -> Result<()> {
        if self.is_closed() {
            return Err(SyncError::SessionClosed);
        }
        self.inner
            .outbox
            .send(message.into())
            .map_err(|_| SyncError::SessionClosed)
    }

    /// Close on request. Blocked reader/dispatcher tasks observe the
    /// cancellation and exit.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(peer = %self.inner.peer, "Closing session");
        self.teardown();
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }

    fn fail(&self, err: &SyncError) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match err {
            SyncError::Framing(_) | SyncError::Integrity(_) => {
                error!(peer = %self.inner.peer, "Malformed data, closing session: {}", err);
                self.inner.handler.on_data_error(self, err);
            }
            _ => {
                warn!(peer = %self.inner.peer, "Session failed: {}", err);
            }
        }
        self.inner.handler.on_error(self, err);
        self.teardown();
    }

    fn teardown(&self) {
        self.inner.state.send_replace(SessionState::Closed);
        self.inner.cancel.cancel();

        let stats = self.stats();
        debug!(
            peer = %self.inner.peer,
            sent = stats.messages_sent,
            received = stats.messages_received,
            "Session closed"
        );

        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            let inner = self.inner.clone();
            rt.spawn(async move {
                let mut writer = inner.writer.lock().await;
                let _ = writer.shutdown().await;
            });
        }
        self.inner.handler.on_closed(self);
    }
}

/// Read frames until one whole message has been reassembled.
async fn read_message<R: AsyncRead + Unpin>(
    r: &mut R,
    scrambler: &Scrambler,
) -> Result<(Message, usize)> {
    let first = read_frame(r, scrambler).await?;
    if first.sequence != 0 {
        return Err(FrameError::OutOfSequence {
            expected: 0,
            actual: first.sequence,
        }
        .into());
    }

    let total = first.total_length as usize;
    let mut wire_bytes = first.encoded_len();
    let mut body = BytesMut::with_capacity(total);
    body.extend_from_slice(&first.data);

    let mut next = 1;
    while body.len() < total {
        let frame = read_frame(r, scrambler).await?;
        if frame.sequence != next {
            return Err(FrameError::OutOfSequence {
                expected: next,
                actual: frame.sequence,
            }
            .into());
        }
        if frame.total_length != first.total_length {
            return Err(FrameError::LengthMismatch {
                expected: first.total_length,
                actual: frame.total_length,
            }
            .into());
        }
        if frame.data.is_empty() {
            return Err(FrameError::InvalidSliceLength(0).into());
        }
        wire_bytes += frame.encoded_len();
        body.extend_from_slice(&frame.data);
        next += 1;
    }

    if body.len() != total {
        return Err(FrameError::LengthMismatch {
            expected: first.total_length,
            actual: body.len() as i64,
        }
        .into());
    }

    let message = Message::decode(body.freeze())?;
    Ok((message, wire_bytes))
}

async fn read_loop<R>(handle: SessionHandle, mut reader: R, tx: mpsc::Sender<Message>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let cancel = handle.inner.cancel.clone();
    let scrambler = handle.inner.config.scrambler;

    let outcome: Result<()> = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            next = read_message(&mut reader, &scrambler) => next,
        };

        let (message, wire_bytes) = match next {
            Ok(m) => m,
            Err(e) => break Err(e),
        };
        handle
            .inner
            .messages_received
            .fetch_add(1, Ordering::Relaxed);
        handle
            .inner
            .bytes_received
            .fetch_add(wire_bytes as u64, Ordering::Relaxed);
        debug!(
            peer = %handle.inner.peer,
            kind = ?message.kind(),
            request_id = ?message.request_id(),
            "Received message"
        );

        // Blocks while the dispatcher is behind.
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            queued = tx.send(message) => {
                if queued.is_err() {
                    break Ok(());
                }
            }
        }
    };

    if let Err(e) = outcome {
        handle.fail(&e);
    }
}

async fn dispatch_loop(handle: SessionHandle, mut rx: mpsc::Receiver<Message>) {
    let cancel = handle.inner.cancel.clone();
    loop {
        // Messages already queued are still delivered after cancellation.
        let message = tokio::select! {
            biased;
            message = rx.recv() => match message {
                Some(m) => m,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        let kind = message.kind();
        let handler = handle.inner.handler.clone();
        let session = handle.clone();
        // Spawned so a panicking handler is reported instead of killing the loop.
        let outcome =
            tokio::spawn(async move { handler.on_message(&session, message).await }).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(peer = %handle.inner.peer, ?kind, "Message handler failed: {:#}", e);
            }
            Err(e) => {
                error!(peer = %handle.inner.peer, ?kind, "Message handler panicked: {}", e);
            }
        }
    }
    rx.close();
}

async fn outbox_loop(handle: SessionHandle, mut posted: mpsc::UnboundedReceiver<Message>) {
    let cancel = handle.inner.cancel.clone();
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = posted.recv() => match message {
                Some(m) => m,
                None => break,
            },
        };
        if handle.send(message).await.is_err() {
            break;
        }
    }
    posted.close();
}
