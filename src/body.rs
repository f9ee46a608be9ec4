use std::{
    fmt, io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncReadExt, DuplexStream, ReadBuf};

use crate::tee::MultiTee;

/// Creates the pipe backing one follower body.
///
/// The first half is the follower's read end, the second the tee's sink.
/// The capacity is the back-pressure window between the tee and that
/// follower: a slow reader stalls the sink write, the tee's barrier stalls
/// the next source read, and the leader runs at the slowest follower's pace.
pub(crate) fn pipe(capacity: usize) -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(capacity)
}

/// A response body: a readable, closable byte stream.
///
/// Followers of a collapsed request receive [`Body::Pipe`] bodies fed by the
/// leader's [`Body::Tee`]; reading the tee pulls from the upstream and fans
/// every chunk out to all pipes.
pub enum Body {
    /// No body.
    Empty,
    /// A byte stream handed over by an upstream client.
    Reader(Box<dyn AsyncRead + Send + Unpin>),
    /// The read end of a follower's pipe.
    Pipe(DuplexStream),
    /// The leader's view of the upstream body. Reading it drives the fan-out.
    Tee(Box<MultiTee>),
}

impl Body {
    /// Wraps an arbitrary byte stream.
    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::Reader(Box::new(reader))
    }

    /// Returns true when there is no body to read.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Closes the body, releasing the underlying stream.
    ///
    /// For a tee body this first drains the upstream to end-of-stream so
    /// every follower still receives the full payload. Closing an already
    /// closed body is a no-op.
    pub async fn close(&mut self) -> io::Result<()> {
        match std::mem::replace(self, Self::Empty) {
            // Boxing here keeps the future finite for nested proxies, where
            // a tee's source can itself be a tee.
            Self::Tee(tee) => Box::pin(tee.close()).await,
            // Dropping a pipe or reader releases it; a tee writing into a
            // dropped pipe observes BrokenPipe.
            Self::Empty | Self::Reader(_) | Self::Pipe(_) => Ok(()),
        }
    }

    /// Reads the body to end-of-stream, closes it and returns the bytes.
    pub async fn collect(&mut self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.read_to_end(&mut bytes).await?;
        self.close().await?;
        Ok(bytes)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Reader(_) => f.write_str("Reader"),
            Self::Pipe(_) => f.write_str("Pipe"),
            Self::Tee(_) => f.write_str("Tee"),
        }
    }
}

impl AsyncRead for Body {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Empty => Poll::Ready(Ok(())),
            Self::Reader(reader) => Pin::new(reader).poll_read(cx, out),
            Self::Pipe(pipe) => Pin::new(pipe).poll_read(cx, out),
            Self::Tee(tee) => Pin::new(tee.as_mut()).poll_read(cx, out),
        }
    }
}
