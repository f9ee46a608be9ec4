use std::sync::{Arc, Mutex};

use n0_error::StackError;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    body::{self, Body},
    message::Response,
    tee::{MultiTee, TeeHandle},
};

/// Fan-out failed before every waiter was served.
#[derive(StackError)]
pub(crate) enum FanOutError {
    /// The proxy's lifetime context was cancelled mid-delivery.
    Cancelled,
}

/// Outcome of [`ResponseState::attach`].
pub(crate) enum Attach {
    /// The waiter was queued for fan-out or served directly.
    Joined,
    /// Reading has commenced; the waiter cannot join this state. The sender
    /// is handed back so the caller can retry against a fresh state.
    Sealed(oneshot::Sender<Response>),
}

/// Per-key rendezvous between one leader and any number of followers.
///
/// Before the upstream response arrives the state collects waiters; once the
/// leader hands the response over, every waiter receives a copy of the head
/// with its own piped body and the state keeps the response head around so
/// stragglers can still join until the tee emits its first byte.
#[derive(Debug)]
pub(crate) struct ResponseState {
    /// Key the state is currently registered under; rewritten on rekey.
    key: Mutex<String>,
    inner: Mutex<Inner>,
    pipe_capacity: usize,
}

#[derive(Debug, Default)]
struct Inner {
    waiters: Vec<oneshot::Sender<Response>>,
    tee: Option<Arc<TeeHandle>>,
    head: Option<Response>,
}

impl ResponseState {
    pub(crate) fn new(key: String, pipe_capacity: usize) -> Self {
        Self {
            key: Mutex::new(key),
            inner: Mutex::new(Inner::default()),
            pipe_capacity,
        }
    }

    /// Returns the key this state is registered under.
    pub(crate) fn current_key(&self) -> String {
        self.key.lock().expect("state key lock poisoned").clone()
    }

    /// Records the key after the registry moved this state aside.
    pub(crate) fn set_key(&self, key: String) {
        *self.key.lock().expect("state key lock poisoned") = key;
    }

    /// Returns true once a streaming fan-out has been armed.
    pub(crate) fn has_tee(&self) -> bool {
        self.inner.lock().expect("state lock poisoned").tee.is_some()
    }

    /// Attaches a follower to this state.
    ///
    /// While the response is still outstanding the sender joins the waiter
    /// list. After fan-out has begun the follower is served directly: a fresh
    /// pipe is registered with the tee and the stored head is delivered with
    /// the pipe's read end as its body. This late-join window closes when the
    /// tee emits its first byte.
    pub(crate) fn attach(&self, waiter: oneshot::Sender<Response>) -> Attach {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        if let Some(head) = &inner.head {
            match &inner.tee {
                Some(tee) => {
                    let (reader, writer) = body::pipe(self.pipe_capacity);
                    if tee.add_sink(writer).is_err() {
                        return Attach::Sealed(waiter);
                    }
                    let mut response = head.head();
                    response.body = Body::Pipe(reader);
                    waiter.send(response).ok();
                }
                // The response had no body, so there is nothing to stream;
                // serve the stored head as-is.
                None => {
                    waiter.send(head.head()).ok();
                }
            }
            return Attach::Joined;
        }
        inner.waiters.push(waiter);
        Attach::Joined
    }

    /// The leader's hand-off of the upstream response.
    ///
    /// Serves every waiter in attach order with a head copy and a piped body,
    /// then arms the tee over the upstream body and the collected pipe write
    /// ends. The returned response is the leader's view: its body is the tee,
    /// and reading it drives the fan-out.
    ///
    /// Note: if `lifetime` is cancelled mid-delivery the fan-out aborts;
    /// undelivered waiters and the collected write ends are dropped, which
    /// ends every already-delivered body at EOF.
    pub(crate) fn handle_response(
        &self,
        lifetime: &CancellationToken,
        mut response: Response,
        on_close: Box<dyn FnOnce() + Send>,
    ) -> Result<Response, FanOutError> {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        let has_body = !response.body.is_empty();
        inner.head = Some(response.head());
        let waiters = std::mem::take(&mut inner.waiters);
        debug!(waiters = waiters.len(), has_body, "fanning out response");
        let mut writers = Vec::with_capacity(if has_body { waiters.len() } else { 0 });
        for waiter in waiters {
            if lifetime.is_cancelled() {
                return Err(FanOutError::Cancelled);
            }
            let mut copy = response.head();
            if has_body {
                let (reader, writer) = body::pipe(self.pipe_capacity);
                writers.push(writer);
                copy.body = Body::Pipe(reader);
            }
            waiter.send(copy).ok();
        }
        if has_body {
            let upstream = std::mem::replace(&mut response.body, Body::Empty);
            let tee = MultiTee::new(upstream, writers).with_close_hook(on_close);
            inner.tee = Some(tee.handle());
            response.body = Body::Tee(Box::new(tee));
        }
        Ok(response)
    }
}
