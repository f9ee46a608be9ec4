//! Multi-sink duplication of a single response body.
//!
//! This module provides [`MultiTee`], a readable stream that pulls from one
//! source body and writes every chunk it reads to any number of pipe sinks.
//! Sinks may join until the first byte has been read; closing the tee drains
//! the unread remainder through to the sinks before shutting them down, so a
//! leader that stops reading early never truncates its followers.

use std::{
    io,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use bytes::Bytes;
use n0_error::StackError;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf},
    task::JoinSet,
};
use tracing::{debug, warn};

use crate::body::Body;

/// Scratch buffer size for draining the source at close.
const DRAIN_BUF_LEN: usize = 4096;

/// Errors surfaced when registering a sink on a tee.
#[derive(StackError)]
pub enum TeeError {
    /// The tee has already emitted at least one byte; no new sink may join.
    ReadingCommenced,
}

/// Phases of a tee's life. Sinks may only join in `Fresh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// No byte has been read from the source yet.
    Fresh,
    /// At least one byte has been delivered; the sink list is sealed.
    Emitting,
    /// The tee has been closed or dropped.
    Closed,
}

/// Sink registry shared between the tee reader and late-join admission.
#[derive(Debug)]
pub(crate) struct TeeHandle {
    inner: Mutex<Sinks>,
}

#[derive(Debug)]
struct Sinks {
    phase: Phase,
    sinks: Vec<DuplexStream>,
}

impl TeeHandle {
    fn new(sinks: Vec<DuplexStream>) -> Self {
        Self {
            inner: Mutex::new(Sinks {
                phase: Phase::Fresh,
                sinks,
            }),
        }
    }

    /// Registers another sink. Fails once the first byte has been emitted.
    pub(crate) fn add_sink(&self, sink: DuplexStream) -> Result<(), TeeError> {
        let mut inner = self.inner.lock().expect("tee sink lock poisoned");
        if inner.phase != Phase::Fresh {
            return Err(TeeError::ReadingCommenced);
        }
        inner.sinks.push(sink);
        Ok(())
    }

    /// Seals the sink list and takes it for one chunk's worth of writes.
    ///
    /// The seal and the take happen under one lock, so a concurrent
    /// [`add_sink`](Self::add_sink) either lands before the seal and receives
    /// this chunk, or observes `ReadingCommenced`.
    fn begin_chunk(&self) -> Vec<DuplexStream> {
        let mut inner = self.inner.lock().expect("tee sink lock poisoned");
        if inner.phase == Phase::Fresh {
            inner.phase = Phase::Emitting;
        }
        std::mem::take(&mut inner.sinks)
    }

    /// Returns a sink once its write for the current chunk has finished.
    fn return_sink(&self, sink: DuplexStream) {
        let mut inner = self.inner.lock().expect("tee sink lock poisoned");
        inner.sinks.push(sink);
    }

    /// Takes every sink and refuses all future joins.
    fn take_all(&self) -> Vec<DuplexStream> {
        let mut inner = self.inner.lock().expect("tee sink lock poisoned");
        inner.phase = Phase::Closed;
        std::mem::take(&mut inner.sinks)
    }
}

/// Duplicates one readable body into any number of pipe sinks.
///
/// Reading the tee pulls a chunk from the source, hands it to the caller and
/// fans it out to every sink in the background; the next read waits until all
/// of the previous chunk's sink writes have finished. Every byte therefore
/// reaches every sink in source order, paced end-to-end by the slowest sink.
///
/// Sink write failures never abort the tee: a sink whose read end was dropped
/// is skipped silently, other write errors are logged and the remaining sinks
/// keep receiving data.
#[derive(derive_more::Debug)]
pub struct MultiTee {
    source: Body,
    handle: Arc<TeeHandle>,
    /// Write barrier: one task per in-flight sink write for the last chunk.
    writes: JoinSet<DuplexStream>,
    #[debug(skip)]
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl MultiTee {
    /// Creates a tee over the source body with an initial set of sinks.
    pub fn new(source: Body, sinks: Vec<DuplexStream>) -> Self {
        Self {
            source,
            handle: Arc::new(TeeHandle::new(sinks)),
            writes: JoinSet::new(),
            on_close: None,
        }
    }

    /// Invokes the hook once, when the tee is closed or dropped.
    pub(crate) fn with_close_hook(mut self, hook: Box<dyn FnOnce() + Send>) -> Self {
        self.on_close = Some(hook);
        self
    }

    /// Returns the shared sink registry used for late joins.
    pub(crate) fn handle(&self) -> Arc<TeeHandle> {
        Arc::clone(&self.handle)
    }

    /// Registers another sink. Fails with [`TeeError::ReadingCommenced`] once
    /// the first byte has been read from the source.
    pub fn add_sink(&self, sink: DuplexStream) -> Result<(), TeeError> {
        self.handle.add_sink(sink)
    }

    /// Drains the source to end-of-stream, writing through to the sinks,
    /// closes the source and then shuts down every sink.
    pub async fn close(mut self) -> io::Result<()> {
        if let Err(err) = self.drain().await {
            debug!("drain at close stopped early: {err}");
        }
        while let Some(joined) = self.writes.join_next().await {
            match joined {
                Ok(sink) => self.handle.return_sink(sink),
                Err(err) => warn!("sink write task failed: {err}"),
            }
        }
        let result = self.source.close().await;
        for mut sink in self.handle.take_all() {
            self.writes.spawn(async move {
                sink.shutdown().await.ok();
                sink
            });
        }
        while self.writes.join_next().await.is_some() {}
        if let Some(hook) = self.on_close.take() {
            hook();
        }
        result
    }

    /// Reads the remaining source bytes so the sinks receive the full body.
    async fn drain(&mut self) -> io::Result<()> {
        let mut buf = [0u8; DRAIN_BUF_LEN];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
        }
    }
}

impl AsyncRead for MultiTee {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // Barrier: the previous chunk must have landed in every sink before
        // the source is read again.
        loop {
            match this.writes.poll_join_next(cx) {
                Poll::Ready(Some(Ok(sink))) => this.handle.return_sink(sink),
                Poll::Ready(Some(Err(err))) => warn!("sink write task failed: {err}"),
                Poll::Ready(None) => break,
                Poll::Pending => return Poll::Pending,
            }
        }
        let before = out.filled().len();
        match Pin::new(&mut this.source).poll_read(cx, out) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
            Poll::Ready(Ok(())) => {}
        }
        let chunk = &out.filled()[before..];
        if chunk.is_empty() {
            return Poll::Ready(Ok(()));
        }
        let sinks = this.handle.begin_chunk();
        if !sinks.is_empty() {
            // The caller may reuse its buffer as soon as this read returns,
            // so the chunk is copied out before the writes are dispatched.
            let chunk = Bytes::copy_from_slice(chunk);
            for mut sink in sinks {
                let chunk = chunk.clone();
                this.writes.spawn(async move {
                    match sink.write_all(&chunk).await {
                        Ok(()) => {}
                        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {}
                        Err(err) => warn!("sink write failed: {err}"),
                    }
                    sink
                });
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for MultiTee {
    fn drop(&mut self) {
        // Dropping an unclosed tee drops the sinks so followers see EOF.
        drop(self.handle.take_all());
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}
