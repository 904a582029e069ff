use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::WaitForCancellationFutureOwned;

use super::{HandoffMode, Role, Signal};
use crate::error::TransportError;

/// One write, as seen by the reading side.
#[derive(Debug)]
struct Chunk {
    data: Bytes,
    /// Fired once `data` has been fully delivered (rendezvous mode only).
    consumed: Option<oneshot::Sender<()>>,
}

impl Chunk {
    fn finish(self) {
        if let Some(tx) = self.consumed {
            // The writer may have given up after `closing` was set.
            let _ = tx.send(());
        }
    }
}

/// A rendezvous write that has been queued but not yet consumed.
#[derive(Debug)]
struct InFlight {
    len: usize,
    consumed: oneshot::Receiver<()>,
}

type ClosingWait = Pin<Box<WaitForCancellationFutureOwned>>;

/// One end of an in-memory full-duplex byte stream.
///
/// Reads suspend the calling task until the peer writes or the shared
/// `closing` signal is set. Once `closing` is set, reads fail with
/// [`TransportError::Closed`] and writes succeed without transmitting.
///
/// Chunks are delivered in write order. A read returns at most the requested
/// length; the rest of the chunk is kept for the next read.
///
/// In [`HandoffMode::Rendezvous`] a write stays pending until the peer has
/// read all of it. If both ends block writing to each other at once, both
/// writes complete and the bytes stay queued, so two peers that each flush
/// before reading cannot deadlock.
pub struct DuplexEndpoint {
    role: Role,
    mode: HandoffMode,
    inbox: mpsc::UnboundedReceiver<Chunk>,
    outbox: mpsc::UnboundedSender<Chunk>,
    pending: Option<Chunk>,
    in_flight: Option<InFlight>,
    closing: Signal,
    read_closing: Option<ClosingWait>,
    write_closing: Option<ClosingWait>,
}

impl std::fmt::Debug for DuplexEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexEndpoint")
            .field("role", &self.role)
            .field("mode", &self.mode)
            .field("pending", &self.pending.as_ref().map(|c| c.data.len()))
            .field("in_flight", &self.in_flight.as_ref().map(|w| w.len))
            .field("closing", &self.closing.is_set())
            .finish()
    }
}

impl DuplexEndpoint {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn mode(&self) -> HandoffMode {
        self.mode
    }

    pub fn is_closing(&self) -> bool {
        self.closing.is_set()
    }

    /// Accepted for API parity with a socket; the simulated transport has no
    /// deadlines.
    pub fn set_read_timeout(&mut self, _timeout: Option<Duration>) {}

    /// See [`DuplexEndpoint::set_read_timeout`].
    pub fn set_write_timeout(&mut self, _timeout: Option<Duration>) {}

    fn closed(&self) -> io::Error {
        TransportError::Closed { role: self.role }.into()
    }

    /// Poll the shared closing signal, registering `cx` for wakeup.
    fn poll_closing(slot: &mut Option<ClosingWait>, closing: &Signal, cx: &mut Context<'_>) -> bool {
        let wait = slot.get_or_insert_with(|| Box::pin(closing.wait_owned()));
        wait.as_mut().poll(cx).is_ready()
    }

    /// Drive a queued rendezvous write to completion.
    ///
    /// The write counts as done when the peer consumed it, the peer went
    /// away, or the transport started closing. It is also released when a
    /// peer chunk is waiting in our inbox: that peer is blocked writing to
    /// us and cannot read until we do.
    fn poll_in_flight(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let Some(write) = self.in_flight.as_mut() else {
            return Poll::Ready(Ok(0));
        };
        let len = write.len;
        let done = match Pin::new(&mut write.consumed).poll(cx) {
            Poll::Ready(_) => true,
            Poll::Pending => {
                self.closing.is_set()
                    || self.peer_is_writing(cx)
                    || Self::poll_closing(&mut self.write_closing, &self.closing, cx)
            }
        };
        if done {
            self.in_flight = None;
            Poll::Ready(Ok(len))
        } else {
            Poll::Pending
        }
    }

    /// True when the peer has an unconsumed chunk queued for us, or has
    /// dropped its end. A received chunk is parked in `pending` for the next
    /// read, so nothing is lost.
    fn peer_is_writing(&mut self, cx: &mut Context<'_>) -> bool {
        if self.pending.is_some() {
            return true;
        }
        match self.inbox.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                self.pending = Some(chunk);
                true
            }
            Poll::Ready(None) => true,
            Poll::Pending => false,
        }
    }
}

impl AsyncRead for DuplexEndpoint {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closing.is_set() {
            return Poll::Ready(Err(this.closed()));
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let mut chunk = match this.pending.take() {
            Some(chunk) => chunk,
            None => match this.inbox.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => chunk,
                // Peer dropped its endpoint: end of stream.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => {
                    if Self::poll_closing(&mut this.read_closing, &this.closing, cx) {
                        return Poll::Ready(Err(this.closed()));
                    }
                    return Poll::Pending;
                }
            },
        };

        let n = buf.remaining().min(chunk.data.len());
        buf.put_slice(&chunk.data.split_to(n));
        if chunk.data.is_empty() {
            chunk.finish();
        } else {
            this.pending = Some(chunk);
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for DuplexEndpoint {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        // A retried write after `Pending` carries the same bytes that are
        // already queued; only report completion.
        if this.in_flight.is_some() {
            return this.poll_in_flight(cx);
        }
        if this.closing.is_set() {
            return Poll::Ready(Ok(buf.len()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let (tx, rx) = match this.mode {
            HandoffMode::Rendezvous => {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            }
            HandoffMode::Buffered => (None, None),
        };
        let chunk = Chunk {
            data: Bytes::copy_from_slice(buf),
            consumed: tx,
        };
        if this.outbox.send(chunk).is_err() {
            return Poll::Ready(Err(TransportError::PeerGone { role: this.role }.into()));
        }

        match rx {
            Some(consumed) => {
                this.in_flight = Some(InFlight {
                    len: buf.len(),
                    consumed,
                });
                this.poll_in_flight(cx)
            }
            None => Poll::Ready(Ok(buf.len())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    /// Closing is driven by the shared signal, not by the endpoint.
    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Two cross-wired endpoints modelling a single connection.
#[derive(Debug)]
pub struct TransportPair {
    client: DuplexEndpoint,
    server: DuplexEndpoint,
}

impl TransportPair {
    /// Create a client/server pair observing `closing`.
    pub fn new(mode: HandoffMode, closing: Signal) -> Self {
        Self::between(Role::Client, Role::Server, mode, closing)
    }

    /// Create a pair with explicit role labels. Writes on the first endpoint
    /// are read from the second and vice versa.
    pub fn between(a: Role, b: Role, mode: HandoffMode, closing: Signal) -> Self {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let endpoint = |role, inbox, outbox, closing| DuplexEndpoint {
            role,
            mode,
            inbox,
            outbox,
            pending: None,
            in_flight: None,
            closing,
            read_closing: None,
            write_closing: None,
        };
        Self {
            client: endpoint(a, a_rx, a_tx, closing.clone()),
            server: endpoint(b, b_rx, b_tx, closing),
        }
    }

    pub fn split(self) -> (DuplexEndpoint, DuplexEndpoint) {
        (self.client, self.server)
    }
}

/// Create a client/server pair with its own closing signal, which is returned
/// alongside the endpoints.
pub fn duplex(mode: HandoffMode) -> (DuplexEndpoint, DuplexEndpoint, Signal) {
    let closing = Signal::new();
    let (client, server) = TransportPair::new(mode, closing.clone()).split();
    (client, server, closing)
}
