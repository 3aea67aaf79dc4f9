//! Multiplexed session: frame routing, writer, keepalive

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, trace, warn};

use super::stream::{MuxStream, StreamState};
use super::{MuxConfig, Role};
use crate::codec::{Frame, FrameCodec};
use crate::error::MuxError;
use crate::message::{GoAwayReason, Message, ResetCode};
use crate::stream_id::StreamId;

/// Frames queued together are written as one transport message up to this size
const COALESCE_LIMIT: usize = 64 * 1024;

/// Time allowed for the final GoAway and transport close during teardown
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Something the peer initiated
pub enum Incoming {
    /// A stream opened by the peer
    Stream(MuxStream),
    /// The peer reported how many local connections it is serving
    Heartbeat { active_streams: u32 },
}

/// Receiving half for peer-initiated events; ends when the session closes
pub struct MuxIncoming {
    rx: mpsc::Receiver<Incoming>,
}

impl MuxIncoming {
    pub async fn next(&mut self) -> Option<Incoming> {
        self.rx.recv().await
    }
}

pub(crate) struct Shared {
    pub(crate) role: Role,
    pub(crate) config: MuxConfig,
    streams: Mutex<HashMap<StreamId, Arc<StreamState>>>,
    next_id: AtomicU64,
    outbound: mpsc::UnboundedSender<Frame>,
    cancel: CancellationToken,
    closed: AtomicBool,
    close_reason: Mutex<Option<GoAwayReason>>,
    last_received: Mutex<Instant>,
    ping_nonce: AtomicU64,
}

impl Shared {
    /// Queue a frame for the writer. False once the writer is gone.
    pub(crate) fn send(&self, frame: Frame) -> bool {
        self.outbound.send(frame).is_ok()
    }

    pub(crate) fn remove_stream(&self, id: StreamId) {
        self.streams.lock().remove(&id);
    }

    fn lookup(&self, id: StreamId) -> Option<Arc<StreamState>> {
        self.streams.lock().get(&id).cloned()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn allocate_id(&self) -> Result<StreamId, MuxError> {
        let id = self.next_id.fetch_add(2, Ordering::Relaxed);
        if id > u32::MAX as u64 {
            return Err(MuxError::StreamIdsExhausted);
        }
        Ok(StreamId::new(id as u32))
    }

    /// Tear the session down. Every stream is reset before this returns.
    fn close(&self, reason: GoAwayReason, message: &str, notify_peer: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.close_reason.lock() = Some(reason);

        if notify_peer {
            self.send(Frame::control(Message::GoAway {
                reason,
                message: message.to_string(),
            }));
        }

        let streams: Vec<_> = self.streams.lock().drain().map(|(_, s)| s).collect();
        let count = streams.len();
        for stream in streams {
            stream.mark_reset(ResetCode::SessionClosed);
        }

        self.cancel.cancel();
        debug!(?reason, streams = count, "Mux session closed: {}", message);
    }
}

/// Handle to a multiplexed session. Cheap to clone.
#[derive(Clone)]
pub struct MuxSession {
    shared: Arc<Shared>,
}

impl MuxSession {
    /// Start a session over a message transport
    ///
    /// Spawns the reader, writer and keepalive tasks on the current runtime.
    pub fn spawn<R, W>(reader: R, writer: W, role: Role, config: MuxConfig) -> (Self, MuxIncoming)
    where
        R: Stream<Item = io::Result<Bytes>> + Send + 'static,
        W: Sink<Bytes, Error = io::Error> + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::channel(config.accept_backlog.max(1));

        let shared = Arc::new(Shared {
            role,
            next_id: AtomicU64::new(role.first_stream_id() as u64),
            config,
            streams: Mutex::new(HashMap::new()),
            outbound: outbound_tx,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            last_received: Mutex::new(Instant::now()),
            ping_nonce: AtomicU64::new(1),
        });

        tokio::spawn(read_loop(shared.clone(), Box::pin(reader), incoming_tx));
        tokio::spawn(write_loop(shared.clone(), Box::pin(writer), outbound_rx));
        tokio::spawn(keepalive_loop(shared.clone()));

        (Self { shared }, MuxIncoming { rx: incoming_rx })
    }

    /// Open a stream and wait for the peer to accept it
    pub async fn open_stream(&self, open_timeout: Duration) -> Result<MuxStream, MuxError> {
        let shared = &self.shared;
        if shared.is_closed() {
            return Err(MuxError::Closed(self.close_reason()));
        }

        let id = shared.allocate_id()?;
        let (tx, rx) = oneshot::channel();
        let state = StreamState::new(id, shared.config.initial_window, Some(tx));
        shared.streams.lock().insert(id, state.clone());
        if shared.is_closed() {
            shared.remove_stream(id);
            return Err(MuxError::Closed(self.close_reason()));
        }

        // From here on, dropping `stream` resets and unregisters it.
        let stream = MuxStream::new(state, shared.clone());
        if !shared.send(Frame::new(id, Message::StreamOpen)) {
            return Err(MuxError::Closed(self.close_reason()));
        }

        match tokio::time::timeout(open_timeout, rx).await {
            Ok(Ok(Ok(()))) => {
                trace!(stream = %id, "Stream opened");
                Ok(stream)
            }
            Ok(Ok(Err(ResetCode::SessionClosed))) | Ok(Err(_)) => {
                Err(MuxError::Closed(self.close_reason()))
            }
            Ok(Ok(Err(code))) => Err(MuxError::Refused(code)),
            Err(_) => Err(MuxError::OpenTimeout(open_timeout)),
        }
    }

    /// Report the number of live local connections to the peer
    pub fn send_heartbeat(&self, active_streams: u32) -> Result<(), MuxError> {
        if self.shared.is_closed()
            || !self
                .shared
                .send(Frame::control(Message::Heartbeat { active_streams }))
        {
            return Err(MuxError::Closed(self.close_reason()));
        }
        Ok(())
    }

    /// Close the session, resetting all of its streams before returning
    pub fn close(&self, reason: GoAwayReason) {
        self.shared.close(reason, &format!("{:?}", reason), true);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Why the session closed, if it has
    pub fn close_reason(&self) -> Option<GoAwayReason> {
        *self.shared.close_reason.lock()
    }

    /// Resolves once the session is closed
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.shared.cancel.cancelled()
    }

    /// A token cancelled when the session closes (use for per-stream child tokens)
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Number of streams currently registered
    pub fn stream_count(&self) -> usize {
        self.shared.streams.lock().len()
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }
}

impl fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxSession")
            .field("role", &self.shared.role)
            .field("closed", &self.is_closed())
            .field("streams", &self.stream_count())
            .finish()
    }
}

async fn read_loop<R>(shared: Arc<Shared>, mut reader: Pin<Box<R>>, incoming: mpsc::Sender<Incoming>)
where
    R: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();

    loop {
        let chunk = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            chunk = reader.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                *shared.last_received.lock() = Instant::now();
                buf.extend_from_slice(&bytes);
                loop {
                    match codec.decode(&mut buf) {
                        Ok(Some(frame)) => {
                            if !handle_frame(&shared, frame, &incoming) {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Invalid frame from peer: {}", e);
                            shared.close(GoAwayReason::ProtocolViolation, &e.to_string(), true);
                            return;
                        }
                    }
                }
            }
            Some(Err(e)) => {
                debug!("Transport read failed: {}", e);
                shared.close(GoAwayReason::TransportFailure, &e.to_string(), false);
                break;
            }
            None => {
                debug!("Transport closed by peer");
                shared.close(GoAwayReason::TransportFailure, "transport closed", false);
                break;
            }
        }
    }
}

/// Route one frame. Returns false when the session must stop reading.
fn handle_frame(shared: &Arc<Shared>, frame: Frame, incoming: &mpsc::Sender<Incoming>) -> bool {
    let id = frame.stream_id;

    if frame.message.is_control() != (id == StreamId::CONTROL) {
        shared.close(
            GoAwayReason::ProtocolViolation,
            &format!("{:?} addressed to {}", frame.message.message_type(), id),
            true,
        );
        return false;
    }

    match frame.message {
        Message::StreamOpen => {
            if shared.role.allocates(id) {
                shared.close(
                    GoAwayReason::ProtocolViolation,
                    &format!("peer opened {} from our id range", id),
                    true,
                );
                return false;
            }

            let state = StreamState::new(id, shared.config.initial_window, None);
            {
                let mut streams = shared.streams.lock();
                if streams.contains_key(&id) {
                    drop(streams);
                    shared.close(
                        GoAwayReason::ProtocolViolation,
                        &format!("duplicate open of {}", id),
                        true,
                    );
                    return false;
                }
                streams.insert(id, state.clone());
            }

            let stream = MuxStream::new(state.clone(), shared.clone());
            match incoming.try_send(Incoming::Stream(stream)) {
                Ok(()) => {
                    shared.send(Frame::new(id, Message::StreamAccept));
                }
                Err(rejected) => {
                    // Marked first so the dropped handle does not send Cancel.
                    state.mark_reset(ResetCode::Refused);
                    drop(rejected);
                    debug!(stream = %id, "Refusing stream, accept backlog full");
                    shared.send(Frame::new(
                        id,
                        Message::StreamReset {
                            code: ResetCode::Refused,
                        },
                    ));
                }
            }
        }
        Message::StreamAccept => {
            if let Some(stream) = shared.lookup(id) {
                stream.accepted();
            }
        }
        Message::Data(data) => match shared.lookup(id) {
            Some(stream) => {
                if let Err(code) = stream.push_data(data) {
                    warn!(stream = %id, "Peer exceeded stream window");
                    shared.send(Frame::new(id, Message::StreamReset { code }));
                }
            }
            None => trace!(stream = %id, "Data for unknown stream dropped"),
        },
        Message::WindowUpdate { credit } => {
            if let Some(stream) = shared.lookup(id) {
                stream.add_credit(credit);
            }
        }
        Message::StreamClose => {
            if let Some(stream) = shared.lookup(id) {
                stream.remote_close();
            }
        }
        Message::StreamReset { code } => {
            if let Some(stream) = shared.lookup(id) {
                trace!(stream = %id, ?code, "Stream reset by peer");
                stream.mark_reset(code);
            }
        }
        Message::Ping { nonce } => {
            shared.send(Frame::control(Message::Pong { nonce }));
        }
        Message::Pong { nonce } => {
            trace!(nonce, "Keepalive pong");
        }
        Message::Heartbeat { active_streams } => {
            if incoming
                .try_send(Incoming::Heartbeat { active_streams })
                .is_err()
            {
                trace!("Heartbeat dropped, incoming queue full");
            }
        }
        Message::GoAway { reason, message } => {
            debug!(?reason, "Peer is going away: {}", message);
            shared.close(reason, &message, false);
            return false;
        }
    }
    true
}

async fn write_loop<W>(shared: Arc<Shared>, mut writer: Pin<Box<W>>, mut rx: mpsc::UnboundedReceiver<Frame>)
where
    W: Sink<Bytes, Error = io::Error> + Send + 'static,
{
    let mut codec = FrameCodec::new();
    let write_timeout = shared.config.write_timeout;

    loop {
        // Queued frames go out before the cancellation is noticed, so a
        // GoAway queued by `close` still reaches the peer.
        let first = tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = shared.cancel.cancelled() => break,
        };

        let mut buf = BytesMut::new();
        encode_into(&mut codec, first, &mut buf);
        while buf.len() < COALESCE_LIMIT {
            match rx.try_recv() {
                Ok(frame) => encode_into(&mut codec, frame, &mut buf),
                Err(_) => break,
            }
        }
        if buf.is_empty() {
            continue;
        }

        let timeout = if shared.is_closed() {
            CLOSE_GRACE
        } else {
            write_timeout
        };
        match tokio::time::timeout(timeout, writer.send(buf.freeze())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Transport write failed: {}", e);
                shared.close(GoAwayReason::TransportFailure, &e.to_string(), false);
                break;
            }
            Err(_) => {
                warn!("Transport write timed out after {:?}", timeout);
                shared.close(GoAwayReason::TransportFailure, "write timed out", false);
                break;
            }
        }
    }

    let _ = tokio::time::timeout(CLOSE_GRACE, writer.close()).await;
}

fn encode_into(codec: &mut FrameCodec, frame: Frame, buf: &mut BytesMut) {
    let stream_id = frame.stream_id;
    if let Err(e) = codec.encode(frame, buf) {
        warn!(stream = %stream_id, "Dropping unencodable frame: {}", e);
    }
}

async fn keepalive_loop(shared: Arc<Shared>) {
    let period = shared.config.keepalive_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {
                let silent = shared.last_received.lock().elapsed();
                if silent >= shared.config.keepalive_timeout {
                    warn!("No traffic from peer for {:?}, closing session", silent);
                    shared.close(GoAwayReason::KeepaliveTimeout, "keepalive timeout", true);
                    break;
                }
                let nonce = shared.ping_nonce.fetch_add(1, Ordering::Relaxed);
                shared.send(Frame::control(Message::Ping { nonce }));
            }
        }
    }
}
