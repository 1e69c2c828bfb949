use std::sync::{Arc, Mutex, PoisonError};

use futures_util::{Stream, StreamExt, stream};
use tokio_util::sync::CancellationToken;

use crate::{CallControl, CancelToken, CancellationRegistry, Result};

#[derive(Debug, Default)]
struct HoldSlot {
    token: Mutex<Option<CancelToken>>,
    /// Cancelled by `Hold::release` and when the call finishes.
    released: CancellationToken,
}

/// Server-side view of one call, handed to the implementation.
#[derive(Clone)]
pub struct Context {
    method: String,
    control: Arc<CallControl>,
    held: CancellationRegistry,
    slot: Arc<HoldSlot>,
}

impl Context {
    pub(crate) fn new(method: &str, control: Arc<CallControl>, held: CancellationRegistry) -> Self {
        Self {
            method: method.to_string(),
            control,
            held,
            slot: Arc::default(),
        }
    }

    /// Path of the method being served, e.g. "Greeter/sayHello".
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Returns true once the client cancelled the call.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.control.cancelled().await;
    }

    /// Keeps the streaming response open past the last emission of the
    /// implementation.
    ///
    /// The call is tracked in the server's held registry until it terminates.
    /// Holding is idempotent: later calls return a handle to the same hold.
    pub fn hold(&self) -> Hold {
        let mut token = self.slot.token.lock().unwrap_or_else(PoisonError::into_inner);
        if token.is_none() && !self.slot.released.is_cancelled() {
            let control = self.control.clone();
            *token = Some(self.held.register(move || control.cancel()));
            tracing::debug!("{} held open", self.method);
        }
        Hold {
            method: self.method.clone(),
            control: self.control.clone(),
            slot: self.slot.clone(),
        }
    }

    /// Drops the held token, if any. Called once the call has terminated.
    pub(crate) fn finish(&self) {
        self.slot.released.cancel();
        let token = self.slot.token.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(token) = token {
            token.retire();
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("method", &self.method)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A held streaming response.
///
/// Ends normally on [`release`](Self::release); takes the cancellation path if
/// the client cancels or the held registry is torn down.
#[derive(Clone)]
pub struct Hold {
    method: String,
    control: Arc<CallControl>,
    slot: Arc<HoldSlot>,
}

impl Hold {
    pub fn release(&self) {
        if !self.slot.released.is_cancelled() {
            tracing::debug!("{} released", self.method);
            self.slot.released.cancel();
        }
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.slot.released.is_cancelled()
    }

    /// Resolves once the hold is released or the call is cancelled.
    pub async fn released(&self) {
        tokio::select! {
            () = self.slot.released.cancelled() => {}
            () = self.control.cancelled() => {}
        }
    }

    /// An empty stream that stays open until [`released`](Self::released)
    /// resolves. Chain it after the emissions of a streaming response.
    pub fn open<M>(&self) -> impl Stream<Item = Result<M>> + Send + 'static + use<M>
    where
        M: Send + 'static,
    {
        let hold = self.clone();
        stream::once(async move { hold.released().await }).filter_map(|()| async { None })
    }
}

impl std::fmt::Debug for Hold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hold")
            .field("method", &self.method)
            .field("released", &self.is_released())
            .finish()
    }
}
