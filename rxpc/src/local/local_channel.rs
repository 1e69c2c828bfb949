use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;

use crate::{
    CallControl, Callback, Channel, Inbound, Incoming, Outbound, Responder, Router, ServerCall,
    pipe,
};

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone, clap::Args)]
pub struct LocalChannelConfig {
    /// Capacity of each streaming pipe, in messages.
    #[serde_inline_default(1)]
    #[arg(long, default_value_t = 1)]
    pub capacity: usize,
}

impl Default for LocalChannelConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

/// In-process transport: every call is dispatched straight into a [`Router`].
///
/// Streaming directions are bounded pipes, so a slow reader on either side
/// slows the writer down.
pub struct LocalChannel<M> {
    router: Arc<Router<M>>,
    config: LocalChannelConfig,
}

impl<M: Send + 'static> LocalChannel<M> {
    #[must_use]
    pub fn new(router: Arc<Router<M>>) -> Self {
        Self::with_config(router, &LocalChannelConfig::default())
    }

    #[must_use]
    pub fn with_config(router: Arc<Router<M>>, config: &LocalChannelConfig) -> Self {
        Self {
            router,
            config: config.clone(),
        }
    }

    #[must_use]
    pub fn router(&self) -> &Arc<Router<M>> {
        &self.router
    }

    fn dispatch(&self, method: &str, control: &Arc<CallControl>, request: Incoming<M>, responder: Responder<M>) {
        tracing::trace!("local dispatch {method}");
        self.router.dispatch(
            ServerCall {
                method: method.to_string(),
                control: control.clone(),
                request,
            },
            responder,
        );
    }
}

impl<M: Send + 'static> Channel<M> for LocalChannel<M> {
    fn unary(&self, method: &str, request: M, callback: Callback<M>) -> Arc<CallControl> {
        let control = CallControl::new();
        self.dispatch(method, &control, Incoming::Single(request), Responder::Single(callback));
        control
    }

    fn server_streaming(&self, method: &str, request: M) -> Inbound<M> {
        let control = CallControl::new();
        let (replies, inbound) = pipe(self.config.capacity, &control);
        self.dispatch(method, &control, Incoming::Single(request), Responder::Stream(replies));
        inbound
    }

    fn client_streaming(&self, method: &str, callback: Callback<M>) -> Outbound<M> {
        let control = CallControl::new();
        let (outbound, requests) = pipe(self.config.capacity, &control);
        self.dispatch(method, &control, Incoming::Stream(requests), Responder::Single(callback));
        outbound
    }

    fn bidi_streaming(&self, method: &str) -> (Outbound<M>, Inbound<M>) {
        let control = CallControl::new();
        let (outbound, requests) = pipe(self.config.capacity, &control);
        let (replies, inbound) = pipe(self.config.capacity, &control);
        self.dispatch(method, &control, Incoming::Stream(requests), Responder::Stream(replies));
        (outbound, inbound)
    }
}

impl<M> std::fmt::Debug for LocalChannel<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalChannel")
            .field("router", &self.router)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorKind, bridge::InboundStream};
    use futures_util::StreamExt;
    use tokio::sync::oneshot;

    #[test]
    fn test_default_config() {
        assert_eq!(LocalChannelConfig::default().capacity, 1);
        let config: LocalChannelConfig = serde_json::from_str(r#"{"capacity": 8}"#).unwrap();
        assert_eq!(config.capacity, 8);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let channel = LocalChannel::<u32>::new(Arc::default());
        let (tx, rx) = oneshot::channel();
        channel.unary("Nope/nothing", 1, Box::new(move |r: crate::Result<u32>| {
            let _ = tx.send(r);
        }));
        assert_eq!(rx.await.unwrap().unwrap_err().kind, ErrorKind::MethodNotFound);

        let inbound = channel.server_streaming("Nope/nothing", 1);
        let replies: Vec<_> = InboundStream::new(inbound, "Nope/nothing").collect().await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].as_ref().unwrap_err().kind, ErrorKind::MethodNotFound);
    }
}
