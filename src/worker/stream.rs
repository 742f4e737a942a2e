//! Byte-plane wrappers composed by the pipeline:
//! pause gate -> progress meter -> hash tee.

use bytes::Bytes;
use futures::{ready, Stream};
use md5::{Digest, Md5};
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::source::ByteStream;

/// Pause switch shared between the consuming stream and the control plane.
///
/// `pause` raises a flag; the stream parks on its next poll and stores its
/// waker. `resume` clears the flag and wakes the parked poll. Both are
/// idempotent, and in-flight chunks are never interrupted: the gate is only
/// consulted at chunk boundaries.
pub struct PauseGate {
    state: Mutex<GateState>,
}

struct GateState {
    paused: bool,
    waker: Option<Waker>,
}

impl PauseGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                paused: false,
                waker: None,
            }),
        }
    }

    pub fn pause(&self) {
        self.state.lock().paused = true;
    }

    pub fn resume(&self) {
        let mut state = self.state.lock();
        state.paused = false;
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    fn poll_pass(&self, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.state.lock();
        if state.paused {
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        } else {
            Poll::Ready(())
        }
    }
}

/// Synchronous per-chunk progress callback; receives the cumulative count.
pub type ProgressFn = Box<dyn Fn(u64) + Send + Sync>;

pin_project! {
    /// Stream wrapper with a pause gate, a cumulative byte counter, and a
    /// progress callback invoked after every delivered chunk.
    ///
    /// Cancellation of the task token surfaces as an I/O error on the next
    /// poll; a parked pause wait is woken by cancellation as well, so a
    /// paused task still unwinds promptly.
    pub struct PausableProgressStream {
        inner: ByteStream,
        gate: Arc<PauseGate>,
        total_read: u64,
        on_progress: ProgressFn,
        cancel_observed: bool,
        #[pin]
        cancelled: WaitForCancellationFutureOwned,
    }
}

impl PausableProgressStream {
    pub fn new(inner: ByteStream, cancel: CancellationToken, on_progress: ProgressFn) -> Self {
        Self {
            inner,
            gate: Arc::new(PauseGate::new()),
            total_read: 0,
            on_progress,
            cancel_observed: false,
            cancelled: cancel.cancelled_owned(),
        }
    }

    /// Handle for pause/resume from the control plane.
    pub fn gate(&self) -> Arc<PauseGate> {
        self.gate.clone()
    }
}

impl Stream for PausableProgressStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if !*this.cancel_observed && this.cancelled.as_mut().poll(cx).is_ready() {
            *this.cancel_observed = true;
        }
        if *this.cancel_observed {
            return Poll::Ready(Some(Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "task cancelled",
            ))));
        }

        ready!(this.gate.poll_pass(cx));

        match ready!(this.inner.as_mut().poll_next(cx)) {
            Some(Ok(chunk)) => {
                if !chunk.is_empty() {
                    *this.total_read += chunk.len() as u64;
                    (this.on_progress)(*this.total_read);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            other => Poll::Ready(other),
        }
    }
}

/// Shared handle to the digest accumulated by a [`HashingStream`].
#[derive(Clone)]
pub struct DigestHandle {
    hasher: Arc<Mutex<Md5>>,
}

impl DigestHandle {
    /// Hex digest of everything that has flowed through so far.
    pub fn finalize_hex(&self) -> String {
        format!("{:x}", self.hasher.lock().clone().finalize())
    }
}

pin_project! {
    /// Tee: forwards chunks unchanged while folding them into an MD5 digest.
    pub struct HashingStream<S> {
        #[pin]
        inner: S,
        hasher: Arc<Mutex<Md5>>,
    }
}

impl<S> HashingStream<S> {
    pub fn new(inner: S) -> (Self, DigestHandle) {
        let hasher = Arc::new(Mutex::new(Md5::new()));
        let handle = DigestHandle {
            hasher: hasher.clone(),
        };
        (Self { inner, hasher }, handle)
    }
}

impl<S> Stream for HashingStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>>,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match ready!(this.inner.poll_next(cx)) {
            Some(Ok(chunk)) => {
                this.hasher.lock().update(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            other => Poll::Ready(other),
        }
    }
}
