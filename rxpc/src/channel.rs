use std::sync::Arc;

use crate::{CallControl, Callback, Inbound, Outbound};

/// Client side of an RPC transport.
///
/// One method per call shape, addressed by the method path
/// (e.g. "Greeter/sayHello"). A unary response is delivered through the
/// callback exactly once; a streaming response arrives through the returned
/// [`Inbound`]. Every call carries a [`CallControl`]; calls whose control is
/// cancellable are tracked by the client's cancellation registry.
pub trait Channel<M>: Send + Sync + 'static {
    fn unary(&self, method: &str, request: M, callback: Callback<M>) -> Arc<CallControl>;

    fn server_streaming(&self, method: &str, request: M) -> Inbound<M>;

    fn client_streaming(&self, method: &str, callback: Callback<M>) -> Outbound<M>;

    fn bidi_streaming(&self, method: &str) -> (Outbound<M>, Inbound<M>);
}
