//! Logical streams inside a multiplexed session

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;
use tokio::time::Sleep;

use super::session::Shared;
use crate::codec::Frame;
use crate::message::{Message, ResetCode};
use crate::stream_id::StreamId;

/// Per-stream state shared between the session reader and the stream handle
pub(crate) struct StreamState {
    pub(crate) id: StreamId,
    inner: Mutex<StreamInner>,
}

struct StreamInner {
    recv_buf: VecDeque<Bytes>,
    /// Credit the peer still holds for sending to us
    recv_window: u32,
    /// Bytes consumed by the reader but not yet returned as credit
    unacked: u32,
    read_waker: Option<Waker>,
    send_credit: u32,
    write_waker: Option<Waker>,
    remote_fin: bool,
    local_fin: bool,
    reset: Option<ResetCode>,
    open_reply: Option<oneshot::Sender<Result<(), ResetCode>>>,
}

impl StreamState {
    pub(crate) fn new(
        id: StreamId,
        window: u32,
        open_reply: Option<oneshot::Sender<Result<(), ResetCode>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            inner: Mutex::new(StreamInner {
                recv_buf: VecDeque::new(),
                recv_window: window,
                unacked: 0,
                read_waker: None,
                send_credit: window,
                write_waker: None,
                remote_fin: false,
                local_fin: false,
                reset: None,
                open_reply,
            }),
        })
    }

    /// Queue payload from the peer. Fails if the peer overran its credit.
    pub(crate) fn push_data(&self, data: Bytes) -> Result<(), ResetCode> {
        let waker = {
            let mut inner = self.inner.lock();
            if inner.reset.is_some() || inner.remote_fin {
                return Ok(());
            }
            let len = data.len() as u32;
            if len > inner.recv_window {
                inner.reset = Some(ResetCode::FlowControl);
                let wakers = [inner.read_waker.take(), inner.write_waker.take()];
                drop(inner);
                wakers.into_iter().flatten().for_each(Waker::wake);
                return Err(ResetCode::FlowControl);
            }
            inner.recv_window -= len;
            if !data.is_empty() {
                inner.recv_buf.push_back(data);
            }
            inner.read_waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    pub(crate) fn add_credit(&self, credit: u32) {
        let waker = {
            let mut inner = self.inner.lock();
            inner.send_credit = inner.send_credit.saturating_add(credit);
            inner.write_waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub(crate) fn remote_close(&self) {
        let waker = {
            let mut inner = self.inner.lock();
            inner.remote_fin = true;
            inner.read_waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Complete a pending local open
    pub(crate) fn accepted(&self) {
        if let Some(reply) = self.inner.lock().open_reply.take() {
            let _ = reply.send(Ok(()));
        }
    }

    /// Mark the stream reset; wakes both directions and fails a pending open
    pub(crate) fn mark_reset(&self, code: ResetCode) {
        let (wakers, reply) = {
            let mut inner = self.inner.lock();
            if inner.reset.is_none() {
                inner.reset = Some(code);
            }
            (
                [inner.read_waker.take(), inner.write_waker.take()],
                inner.open_reply.take(),
            )
        };
        if let Some(reply) = reply {
            let _ = reply.send(Err(code));
        }
        wakers.into_iter().flatten().for_each(Waker::wake);
    }

    pub(crate) fn is_reset(&self) -> bool {
        self.inner.lock().reset.is_some()
    }
}

fn reset_error(code: ResetCode) -> io::Error {
    let kind = match code {
        ResetCode::Timeout => io::ErrorKind::TimedOut,
        ResetCode::Refused => io::ErrorKind::ConnectionRefused,
        ResetCode::SessionClosed => io::ErrorKind::ConnectionAborted,
        _ => io::ErrorKind::ConnectionReset,
    };
    io::Error::new(kind, format!("stream reset: {:?}", code))
}

/// One logical byte stream inside a [`MuxSession`](super::MuxSession)
///
/// Implements [`AsyncRead`] and [`AsyncWrite`]. `shutdown` half-closes the
/// stream; dropping it before both sides have finished resets it.
pub struct MuxStream {
    state: Arc<StreamState>,
    shared: Arc<Shared>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl MuxStream {
    pub(crate) fn new(state: Arc<StreamState>, shared: Arc<Shared>) -> Self {
        Self {
            state,
            shared,
            write_deadline: None,
        }
    }

    /// Stream id, unique within the parent session
    pub fn id(&self) -> StreamId {
        self.state.id
    }

    /// Abort the stream immediately
    pub fn reset(&self) {
        if !self.state.is_reset() {
            self.state.mark_reset(ResetCode::Cancel);
            self.shared.send(Frame::new(
                self.state.id,
                Message::StreamReset {
                    code: ResetCode::Cancel,
                },
            ));
        }
    }
}

impl fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxStream").field("id", &self.state.id).finish()
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut credit_update = None;

        let result = {
            let mut inner = this.state.inner.lock();
            if let Some(front) = inner.recv_buf.front_mut() {
                let n = front.len().min(buf.remaining());
                buf.put_slice(&front.split_to(n));
                if front.is_empty() {
                    inner.recv_buf.pop_front();
                }

                inner.unacked += n as u32;
                let threshold = this.shared.config.initial_window / 2;
                if inner.unacked >= threshold && inner.reset.is_none() && !inner.remote_fin {
                    let credit = inner.unacked;
                    inner.recv_window += credit;
                    inner.unacked = 0;
                    credit_update = Some(credit);
                }
                Poll::Ready(Ok(()))
            } else if inner.remote_fin {
                Poll::Ready(Ok(()))
            } else if let Some(code) = inner.reset {
                Poll::Ready(Err(reset_error(code)))
            } else {
                inner.read_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        };

        if let Some(credit) = credit_update {
            this.shared
                .send(Frame::new(this.state.id, Message::WindowUpdate { credit }));
        }
        result
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        {
            let mut inner = this.state.inner.lock();
            if let Some(code) = inner.reset {
                return Poll::Ready(Err(reset_error(code)));
            }
            if inner.local_fin {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "stream already closed for writing",
                )));
            }
            if inner.send_credit > 0 {
                let n = buf
                    .len()
                    .min(inner.send_credit as usize)
                    .min(this.shared.config.max_frame_payload);
                inner.send_credit -= n as u32;
                drop(inner);

                this.write_deadline = None;
                let frame = Frame::new(this.state.id, Message::Data(Bytes::copy_from_slice(&buf[..n])));
                if !this.shared.send(frame) {
                    return Poll::Ready(Err(reset_error(ResetCode::SessionClosed)));
                }
                return Poll::Ready(Ok(n));
            }
            inner.write_waker = Some(cx.waker().clone());
        }

        let timeout = this.shared.config.write_timeout;
        let deadline = this
            .write_deadline
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
        if deadline.as_mut().poll(cx).is_ready() {
            this.write_deadline = None;
            this.state.mark_reset(ResetCode::Timeout);
            this.shared.send(Frame::new(
                this.state.id,
                Message::StreamReset {
                    code: ResetCode::Timeout,
                },
            ));
            return Poll::Ready(Err(reset_error(ResetCode::Timeout)));
        }
        Poll::Pending
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let send_fin = {
            let mut inner = this.state.inner.lock();
            if inner.reset.is_some() || inner.local_fin {
                false
            } else {
                inner.local_fin = true;
                true
            }
        };
        if send_fin {
            this.shared
                .send(Frame::new(this.state.id, Message::StreamClose));
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        let unfinished = {
            let inner = self.state.inner.lock();
            inner.reset.is_none() && !(inner.local_fin && inner.remote_fin)
        };
        if unfinished {
            self.reset();
        }
        self.shared.remove_stream(self.state.id);
    }
}
