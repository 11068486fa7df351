//! Session relay copy
//!
//! Copies bytes between a client stream and an upstream stream, one fixed
//! buffer per direction. The relay ends as soon as EITHER direction finishes
//! (EOF, read error or write error); the caller then drops both streams,
//! which closes them. An optional idle timer ends the relay when neither
//! direction has moved a byte for the configured duration.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Instant, Sleep};
use tracing::debug;

/// Default per-direction buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// Why a relay stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyEnd {
    /// The client to upstream direction finished first
    ClientToUpstream,
    /// The upstream to client direction finished first
    UpstreamToClient,
    /// No bytes moved for the idle timeout
    IdleTimeout,
}

/// Result of a relay
#[derive(Debug, Clone, Copy)]
pub struct CopyResult {
    /// Bytes transferred from client to upstream
    pub client_to_upstream: u64,
    /// Bytes transferred from upstream to client
    pub upstream_to_client: u64,
    /// Direction (or timer) that ended the relay
    pub end: CopyEnd,
}

impl CopyResult {
    /// Total bytes transferred in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.client_to_upstream + self.upstream_to_client
    }
}

/// State for one direction of transfer
struct TransferState {
    buf: Box<[u8]>,
    read_done: bool,
    pos: usize,
    cap: usize,
    bytes_transferred: u64,
}

impl TransferState {
    fn new(buf_size: usize) -> Self {
        Self {
            buf: vec![0u8; buf_size.max(1)].into_boxed_slice(),
            read_done: false,
            pos: 0,
            cap: 0,
            bytes_transferred: 0,
        }
    }

    /// Drive this direction. `Ready` means the direction is finished.
    fn poll_transfer<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<()>>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            if self.pos < self.cap {
                let n = match writer.as_mut().poll_write(cx, &self.buf[self.pos..self.cap]) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write zero bytes",
                        )));
                    }
                    Poll::Ready(Ok(n)) => n,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                };
                self.pos += n;
                self.bytes_transferred += n as u64;

                if self.pos == self.cap {
                    self.pos = 0;
                    self.cap = 0;
                }
            } else if self.read_done {
                // Pass the half-close on before the session is torn down
                return writer.as_mut().poll_shutdown(cx);
            } else {
                let mut read_buf = ReadBuf::new(&mut self.buf);
                match reader.as_mut().poll_read(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => {
                        let n = read_buf.filled().len();
                        if n == 0 {
                            self.read_done = true;
                        } else {
                            self.cap = n;
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }
        }
    }
}

/// Idle timer reset whenever either direction makes progress
struct IdleTimer {
    timeout: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl IdleTimer {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sleep: Box::pin(sleep(timeout)),
        }
    }

    fn reset(&mut self) {
        self.sleep.as_mut().reset(Instant::now() + self.timeout);
    }
}

/// Relay future: ready when the first direction finishes
struct Relay<'a, A, B> {
    client: &'a mut A,
    upstream: &'a mut B,
    client_to_upstream: TransferState,
    upstream_to_client: TransferState,
    idle: Option<IdleTimer>,
}

impl<A, B> Relay<'_, A, B> {
    fn result(&self, end: CopyEnd) -> CopyResult {
        CopyResult {
            client_to_upstream: self.client_to_upstream.bytes_transferred,
            upstream_to_client: self.upstream_to_client.bytes_transferred,
            end,
        }
    }

    fn moved(&self) -> u64 {
        self.client_to_upstream.bytes_transferred + self.upstream_to_client.bytes_transferred
    }
}

impl<A, B> Future for Relay<'_, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    type Output = CopyResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let before = this.moved();

        match this.client_to_upstream.poll_transfer(
            cx,
            Pin::new(&mut *this.client),
            Pin::new(&mut *this.upstream),
        ) {
            Poll::Ready(Ok(())) => return Poll::Ready(this.result(CopyEnd::ClientToUpstream)),
            Poll::Ready(Err(e)) => {
                debug!(error = %e, "client->upstream ended with error");
                return Poll::Ready(this.result(CopyEnd::ClientToUpstream));
            }
            Poll::Pending => {}
        }

        match this.upstream_to_client.poll_transfer(
            cx,
            Pin::new(&mut *this.upstream),
            Pin::new(&mut *this.client),
        ) {
            Poll::Ready(Ok(())) => return Poll::Ready(this.result(CopyEnd::UpstreamToClient)),
            Poll::Ready(Err(e)) => {
                debug!(error = %e, "upstream->client ended with error");
                return Poll::Ready(this.result(CopyEnd::UpstreamToClient));
            }
            Poll::Pending => {}
        }

        let progressed = this.moved() != before;
        if let Some(idle) = this.idle.as_mut() {
            if progressed {
                idle.reset();
            }
            if idle.sleep.as_mut().poll(cx).is_ready() {
                return Poll::Ready(this.result(CopyEnd::IdleTimeout));
            }
        }

        Poll::Pending
    }
}

/// Relay bytes between `client` and `upstream` until the first direction
/// finishes.
///
/// I/O errors end the relay like EOF does; they are logged at debug level
/// and not returned. Streams are left to the caller to drop.
///
/// # Arguments
///
/// * `client` - Accepted client stream
/// * `upstream` - Dialed outbound stream
/// * `buf_size` - Buffer size per direction
/// * `idle_timeout` - End the relay after this long without traffic
pub async fn relay_streams<A, B>(
    client: &mut A,
    upstream: &mut B,
    buf_size: usize,
    idle_timeout: Option<Duration>,
) -> CopyResult
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    Relay {
        client,
        upstream,
        client_to_upstream: TransferState::new(buf_size),
        upstream_to_client: TransferState::new(buf_size),
        idle: idle_timeout.map(IdleTimer::new),
    }
    .await
}
