use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    task::{Context, Poll},
};

use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture, WaitForCancellationFutureOwned};

use crate::{Error, Result};

/// Completion callback of a call whose response is a single message.
pub type Callback<M> = Box<dyn FnOnce(Result<M>) + Send>;

/// Call-level state shared by both ends of one transport call.
///
/// Cancellation is a property of the call, not of either half: once one side
/// cancels, both sides observe it. A call created with
/// [`uncancellable`](Self::uncancellable) ignores `cancel`.
#[derive(Debug)]
pub struct CallControl {
    token: CancellationToken,
    cancellable: bool,
    cancels: AtomicUsize,
}

impl CallControl {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            token: CancellationToken::new(),
            cancellable: true,
            cancels: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn uncancellable() -> Arc<Self> {
        Arc::new(Self {
            token: CancellationToken::new(),
            cancellable: false,
            cancels: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn is_cancellable(&self) -> bool {
        self.cancellable
    }

    /// Cancels the call.
    pub fn cancel(&self) {
        if !self.cancellable {
            return;
        }
        self.cancels.fetch_add(1, Ordering::AcqRel);
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the call is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    #[must_use]
    pub fn cancelled_owned(&self) -> WaitForCancellationFutureOwned {
        self.token.clone().cancelled_owned()
    }

    /// How many times [`cancel`](Self::cancel) was invoked on this call.
    #[must_use]
    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::Acquire)
    }
}

/// Creates the two halves of one direction of a streaming call.
///
/// The pipe is bounded by `capacity`, so a writer waits until the reader has
/// room and a slow reader slows the writer down.
#[must_use]
pub fn pipe<M>(capacity: usize, control: &Arc<CallControl>) -> (Outbound<M>, Inbound<M>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        Outbound {
            tx: Some(tx),
            control: control.clone(),
        },
        Inbound {
            rx,
            control: control.clone(),
        },
    )
}

/// The readable half of a streaming call.
///
/// Events are messages (`Ok`), a failure (`Err`) and the end of the stream
/// (the channel closing). Whether the end was caused by a cancellation is read
/// from the [`CallControl`]. Dropping the `Inbound` detaches the reader, which
/// the writer observes through [`Outbound::is_closed`].
#[derive(Debug)]
pub struct Inbound<M> {
    rx: mpsc::Receiver<Result<M>>,
    control: Arc<CallControl>,
}

impl<M> Inbound<M> {
    pub async fn recv(&mut self) -> Option<Result<M>> {
        self.rx.recv().await
    }

    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<M>>> {
        self.rx.poll_recv(cx)
    }

    /// Returns true if the writer has ended and every event was read.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.rx.is_closed() && self.rx.is_empty()
    }

    #[must_use]
    pub fn control(&self) -> &Arc<CallControl> {
        &self.control
    }
}

/// The writable half of a streaming call.
#[derive(Debug)]
pub struct Outbound<M> {
    tx: Option<mpsc::Sender<Result<M>>>,
    control: Arc<CallControl>,
}

impl<M> Outbound<M> {
    /// Writes `msg`, waiting until the reader accepts it.
    ///
    /// Returns false if the message was dropped: the call was cancelled, the
    /// writable side was already ended, or the reader went away.
    pub async fn write(&mut self, msg: M) -> bool {
        self.send(Ok(msg)).await
    }

    /// Sends `err` as the terminal event and ends the writable side.
    pub async fn error(&mut self, err: Error) -> bool {
        let sent = self.send(Err(err)).await;
        self.end();
        sent
    }

    /// Half-closes the call: no further messages will be written.
    pub fn end(&mut self) {
        self.tx = None;
    }

    /// Returns true if writes can no longer reach the reader.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().is_none_or(mpsc::Sender::is_closed)
    }

    #[must_use]
    pub fn control(&self) -> &Arc<CallControl> {
        &self.control
    }

    async fn send(&mut self, event: Result<M>) -> bool {
        if self.control.is_cancelled() {
            tracing::trace!("write after cancel dropped");
            return false;
        }
        let Some(tx) = &self.tx else {
            return false;
        };
        tokio::select! {
            biased;
            () = self.control.cancelled() => false,
            sent = tx.send(event) => sent.is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[tokio::test]
    async fn test_pipe_in_order() {
        let control = CallControl::new();
        let (mut outbound, mut inbound) = pipe::<u32>(4, &control);
        assert!(outbound.write(1).await);
        assert!(outbound.write(2).await);
        outbound.end();
        assert!(!outbound.write(3).await);

        assert_eq!(inbound.recv().await, Some(Ok(1)));
        assert!(!inbound.is_drained());
        assert_eq!(inbound.recv().await, Some(Ok(2)));
        assert!(inbound.is_drained());
        assert_eq!(inbound.recv().await, None);
    }

    #[tokio::test]
    async fn test_error_ends_pipe() {
        let control = CallControl::new();
        let (mut outbound, mut inbound) = pipe::<u32>(1, &control);
        assert!(outbound.error(Error::kind(ErrorKind::NoResponse)).await);
        assert!(outbound.is_closed());
        assert_eq!(
            inbound.recv().await,
            Some(Err(Error::kind(ErrorKind::NoResponse)))
        );
        assert_eq!(inbound.recv().await, None);
    }

    #[tokio::test]
    async fn test_write_after_cancel_is_dropped() {
        let control = CallControl::new();
        let (mut outbound, mut inbound) = pipe::<u32>(1, &control);
        assert!(outbound.write(1).await);

        // the pipe is full, so this write parks until the cancel wakes it.
        let blocked = tokio::spawn(async move {
            let sent = outbound.write(2).await;
            (sent, outbound)
        });
        tokio::task::yield_now().await;
        control.cancel();
        let (sent, mut outbound) = blocked.await.unwrap();
        assert!(!sent);
        assert!(!outbound.write(3).await);

        assert_eq!(inbound.recv().await, Some(Ok(1)));
        drop(outbound);
        assert_eq!(inbound.recv().await, None);
        assert!(inbound.control().is_cancelled());
        assert_eq!(control.cancel_count(), 1);
    }

    #[tokio::test]
    async fn test_reader_detach_is_visible() {
        let control = CallControl::new();
        let (mut outbound, inbound) = pipe::<u32>(1, &control);
        assert!(!outbound.is_closed());
        drop(inbound);
        assert!(outbound.is_closed());
        assert!(!outbound.write(1).await);
    }

    #[test]
    fn test_uncancellable() {
        let control = CallControl::uncancellable();
        control.cancel();
        assert!(!control.is_cancelled());
        assert_eq!(control.cancel_count(), 0);
    }
}
