//! Translation between transport push-streams and `Stream`s.
//!
//! Both adapters route every streaming direction through this module:
//! [`InboundStream`] turns an [`Inbound`] into a `Stream`, and [`pump`] drives
//! a `Stream` into an [`Outbound`]. Each direction produces exactly one
//! terminal signal and releases its half of the call on every terminal path.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures_util::{Stream, StreamExt};
use tokio_util::sync::WaitForCancellationFutureOwned;

use crate::{Error, Inbound, Outbound, Result};

enum BridgeState<M> {
    Open {
        inbound: Inbound<M>,
        cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    },
    Done,
}

/// A `Stream` reading the inbound half of a call.
///
/// Yields each message in transport order. A transport error is yielded once
/// and ends the stream. The end of the inbound ends the stream, unless the call
/// was cancelled, in which case a [`Cancelled`](crate::ErrorKind::Cancelled)
/// error is yielded first. The `Inbound` is dropped as soon as the stream
/// terminates or is dropped.
pub struct InboundStream<M> {
    method: String,
    state: BridgeState<M>,
}

impl<M> Unpin for InboundStream<M> {}

impl<M> InboundStream<M> {
    #[must_use]
    pub fn new(inbound: Inbound<M>, method: &str) -> Self {
        let cancelled = Box::pin(inbound.control().cancelled_owned());
        Self {
            method: method.to_string(),
            state: BridgeState::Open { inbound, cancelled },
        }
    }

    /// Returns true once the stream produced its terminal signal.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        matches!(self.state, BridgeState::Done)
    }

    /// Returns true if the transport already ended this direction and nothing
    /// is left to read, even if the stream has not been polled to its end.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        match &self.state {
            BridgeState::Open { inbound, .. } => inbound.is_drained(),
            BridgeState::Done => true,
        }
    }
}

impl<M> Stream for InboundStream<M> {
    type Item = Result<M>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let BridgeState::Open { inbound, cancelled } = &mut this.state else {
            return Poll::Ready(None);
        };

        let terminal = if inbound.control().is_cancelled() {
            Some(Err(Error::cancelled(&this.method)))
        } else {
            match inbound.poll_recv(cx) {
                Poll::Ready(Some(Ok(msg))) => return Poll::Ready(Some(Ok(msg))),
                Poll::Ready(Some(Err(err))) => Some(Err(err)),
                Poll::Ready(None) if inbound.control().is_cancelled() => {
                    Some(Err(Error::cancelled(&this.method)))
                }
                Poll::Ready(None) => None,
                Poll::Pending => match cancelled.as_mut().poll(cx) {
                    Poll::Ready(()) => Some(Err(Error::cancelled(&this.method))),
                    Poll::Pending => return Poll::Pending,
                },
            }
        };

        match &terminal {
            Some(Err(err)) => tracing::debug!("{} inbound terminated: {err}", this.method),
            _ => tracing::debug!("{} inbound completed", this.method),
        }
        this.state = BridgeState::Done;
        Poll::Ready(terminal)
    }
}

/// What to do with an error yielded by the source of a [`pump`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnError {
    /// Cancel the call (the client forwarding its request stream).
    Abort,
    /// Send the error to the peer as the terminal event (the server answering).
    Forward,
}

/// How a [`pump`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpOutcome {
    /// The source completed and the outbound was half-closed.
    Completed,
    /// The source yielded an error, handled according to [`OnError`].
    Failed(Error),
    /// The call was cancelled or the reader went away; the source was dropped.
    Cancelled,
}

/// Drives `source` into `outbound` until one of them terminates.
///
/// The next item is only pulled from `source` after the previous one was
/// accepted by the reader, so nothing is buffered ahead of the transport. The
/// source is dropped before this returns, on every path.
pub async fn pump<M, S>(source: S, outbound: &mut Outbound<M>, on_error: OnError) -> PumpOutcome
where
    S: Stream<Item = Result<M>>,
{
    let control = outbound.control().clone();
    let mut source = std::pin::pin!(source);
    loop {
        let next = tokio::select! {
            biased;
            () = control.cancelled() => return PumpOutcome::Cancelled,
            next = source.next() => next,
        };
        match next {
            Some(Ok(msg)) => {
                if !outbound.write(msg).await {
                    return PumpOutcome::Cancelled;
                }
            }
            Some(Err(err)) => {
                match on_error {
                    OnError::Abort => control.cancel(),
                    OnError::Forward => {
                        outbound.error(err.clone()).await;
                    }
                }
                return PumpOutcome::Failed(err);
            }
            None => {
                outbound.end();
                return PumpOutcome::Completed;
            }
        }
    }
}
