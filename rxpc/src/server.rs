use std::{collections::HashMap, sync::Arc};

use foldhash::fast::RandomState;
use futures_util::{
    Stream, StreamExt, future,
    stream::{self, BoxStream},
};

use crate::{
    CallControl, Callback, CancellationRegistry, Context, Error, ErrorKind, Inbound,
    MethodDescriptor, Outbound, Result, ServiceDescriptor, TaskSupervisor,
    bridge::{InboundStream, OnError, pump},
};

/// A boxed reactive sequence of messages.
pub type RxStream<M> = BoxStream<'static, Result<M>>;

/// A method implementation: maps the request sequence to the response sequence.
///
/// Unary requests arrive as a one-element sequence. For unary responses only
/// the first emission is used.
pub type Implementation<M> = Arc<dyn Fn(RxStream<M>, Context) -> RxStream<M> + Send + Sync>;

/// Implementations of the methods of one service, keyed by method name.
pub struct Implementations<M> {
    methods: HashMap<String, Implementation<M>, RandomState>,
}

impl<M> Default for Implementations<M> {
    fn default() -> Self {
        Self {
            methods: HashMap::default(),
        }
    }
}

impl<M: Send + 'static> Implementations<M> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn add<F, S>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(RxStream<M>, Context) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<M>> + Send + 'static,
    {
        let implementation: Implementation<M> = Arc::new(move |requests, ctx| f(requests, ctx).boxed());
        self.methods.insert(name.to_string(), implementation);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.methods.keys()
    }
}

/// The request of an incoming call, as the transport delivers it.
pub enum Incoming<M> {
    Single(M),
    Stream(Inbound<M>),
}

/// How the transport expects the response.
pub enum Responder<M> {
    Single(Callback<M>),
    Stream(Outbound<M>),
}

impl<M> Responder<M> {
    pub(crate) async fn fail(self, err: Error) {
        match self {
            Self::Single(callback) => callback(Err(err)),
            Self::Stream(mut outbound) => {
                outbound.error(err).await;
            }
        }
    }
}

/// One incoming call.
pub struct ServerCall<M> {
    /// Path of the called method, e.g. "Greeter/sayHello".
    pub method: String,
    pub control: Arc<CallControl>,
    pub request: Incoming<M>,
}

/// Serves one method of a wrapped service.
///
/// Each call is served on its own task, tracked by the adapter's supervisor.
pub struct Handler<M> {
    path: String,
    descriptor: MethodDescriptor,
    implementation: Implementation<M>,
    held: CancellationRegistry,
    supervisor: Arc<TaskSupervisor>,
}

impl<M> Clone for Handler<M> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            descriptor: self.descriptor.clone(),
            implementation: self.implementation.clone(),
            held: self.held.clone(),
            supervisor: self.supervisor.clone(),
        }
    }
}

impl<M: Send + 'static> Handler<M> {
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }

    /// Serves `call`, answering through `responder`.
    pub fn handle(&self, call: ServerCall<M>, responder: Responder<M>) {
        if self.supervisor.is_stopped() {
            let err = Error::new(
                ErrorKind::TransportClosed,
                format!("{} is shutting down", self.path),
            );
            tracing::warn!("{err}");
            tokio::spawn(responder.fail(err));
            return;
        }

        let guard = self.supervisor.start_async_task();
        let this = self.clone();
        tokio::spawn(async move {
            let control = call.control.clone();
            let serve = this.serve(call, responder);
            tokio::pin!(serve);
            tokio::select! {
                biased;
                () = &mut serve => {}
                () = guard.stopped() => {
                    control.cancel();
                    serve.await;
                }
            }
            drop(guard);
        });
    }

    async fn serve(&self, call: ServerCall<M>, responder: Responder<M>) {
        let ServerCall {
            control, request, ..
        } = call;

        let request_shape = matches!(request, Incoming::Stream(_));
        let response_shape = matches!(responder, Responder::Stream(_));
        if request_shape != self.descriptor.is_request_streaming()
            || response_shape != self.descriptor.is_response_streaming()
        {
            let err = Error::contract(format!("{} called with the wrong call shape", self.path));
            tracing::warn!("{err}");
            responder.fail(err).await;
            return;
        }

        let ctx = Context::new(&self.path, control, self.held.clone());
        let requests: RxStream<M> = match request {
            Incoming::Single(msg) => stream::once(future::ready(Ok(msg))).boxed(),
            Incoming::Stream(inbound) => InboundStream::new(inbound, &self.path).boxed(),
        };
        tracing::debug!("{} serving", self.path);
        let responses = (self.implementation)(requests, ctx.clone());

        match responder {
            Responder::Single(callback) => {
                let result = first_response(responses, &ctx).await;
                match &result {
                    Ok(_) => tracing::debug!("{} responded", self.path),
                    Err(err) => tracing::debug!("{} failed: {err}", self.path),
                }
                callback(result);
            }
            Responder::Stream(mut outbound) => {
                let outcome = pump(responses, &mut outbound, OnError::Forward).await;
                tracing::debug!("{} response stream finished: {outcome:?}", self.path);
            }
        }
        ctx.finish();
    }
}

/// The first terminal signal of a unary response, or `Cancelled` if the
/// client gave up first. The response stream is dropped on return.
async fn first_response<M>(mut responses: RxStream<M>, ctx: &Context) -> Result<M> {
    tokio::select! {
        biased;
        next = responses.next() => next.unwrap_or_else(|| {
            Err(Error::new(
                ErrorKind::NoResponse,
                format!("{} completed without a response", ctx.method()),
            ))
        }),
        () = ctx.cancelled() => Err(Error::cancelled(ctx.method())),
    }
}

/// Takes the single message of a unary request sequence.
///
/// # Errors
///
/// Returns the error of the sequence, or a `ContractViolation` if it ended
/// without a message.
pub async fn single_request<M>(mut requests: RxStream<M>) -> Result<M> {
    requests
        .next()
        .await
        .unwrap_or_else(|| Err(Error::contract("request sequence ended without a message".into())))
}

/// Wraps a service implementation into the handlers a transport invokes.
///
/// # Examples
///
/// ```rust,no_run
/// # use rxpc::{Implementations, MethodDescriptor, Router, ServerAdapter, ServiceDescriptor};
/// # use futures_util::StreamExt;
/// # #[tokio::main]
/// # async fn main() {
/// let greeter = ServiceDescriptor::new("Greeter")
///     .with_method(MethodDescriptor::unary("sayHello"));
/// let implementations = Implementations::<String>::new()
///     .add("sayHello", |requests, _ctx| {
///         requests.map(|name| name.map(|name| format!("Hello {name}!")))
///     });
/// let adapter = ServerAdapter::wrap(&greeter, implementations);
///
/// let mut router = Router::default();
/// router.add_handlers(&adapter);
/// // ... serve calls through the router ...
/// adapter.shutdown().await;
/// # }
/// ```
pub struct ServerAdapter<M> {
    service: String,
    handlers: HashMap<String, Handler<M>, RandomState>,
    held: CancellationRegistry,
    supervisor: Arc<TaskSupervisor>,
}

impl<M: Send + 'static> ServerAdapter<M> {
    /// Builds a handler for every method of `service` that has an
    /// implementation. Implementations without a method descriptor are
    /// skipped.
    #[must_use]
    pub fn wrap(service: &ServiceDescriptor, implementations: Implementations<M>) -> Self {
        let held = CancellationRegistry::default();
        let supervisor = Arc::new(TaskSupervisor::create());
        let mut implementations = implementations.methods;

        let handlers = service
            .methods
            .iter()
            .filter_map(|method| {
                let path = service.path(&method.name);
                let Some(implementation) = implementations.remove(&method.name) else {
                    tracing::debug!("{path} has no implementation");
                    return None;
                };
                let handler = Handler {
                    path,
                    descriptor: method.clone(),
                    implementation,
                    held: held.clone(),
                    supervisor: supervisor.clone(),
                };
                Some((method.name.clone(), handler))
            })
            .collect();

        for name in implementations.keys() {
            tracing::warn!(
                "{}: implementation {name} has no method descriptor, skipped",
                service.name
            );
        }

        Self {
            service: service.name.clone(),
            handlers,
            held,
            supervisor,
        }
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service
    }

    #[must_use]
    pub fn handler(&self, method: &str) -> Option<&Handler<M>> {
        self.handlers.get(method)
    }

    pub fn handlers(&self) -> impl Iterator<Item = &Handler<M>> {
        self.handlers.values()
    }

    pub fn method_names(&self) -> impl Iterator<Item = &String> {
        self.handlers.keys()
    }

    /// The held streaming responses still open.
    #[must_use]
    pub fn held(&self) -> &CancellationRegistry {
        &self.held
    }

    /// Number of calls being served.
    #[must_use]
    pub fn running(&self) -> u64 {
        self.supervisor.running()
    }

    /// Cancels every held streaming response, returns how many there were.
    pub fn release_held(&self) -> usize {
        self.held.cancel_all()
    }

    /// Stops accepting calls, cancels the calls in flight and waits until
    /// every handler task has finished.
    pub async fn shutdown(&self) {
        self.supervisor.stop();
        let released = self.release_held();
        tracing::debug!(
            "{} shutting down, {released} held, {} running",
            self.service,
            self.running()
        );
        self.supervisor.all_stopped().await;
    }
}

impl<M> std::fmt::Debug for ServerAdapter<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerAdapter")
            .field("service", &self.service)
            .field("methods", &self.handlers.keys())
            .field("held", &self.held)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn service() -> ServiceDescriptor {
        ServiceDescriptor::new("Math")
            .with_method(MethodDescriptor::unary("double"))
            .with_method(MethodDescriptor::unary("silent"))
            .with_method(MethodDescriptor::unary("slow"))
            .with_method(MethodDescriptor::server_streaming("count"))
            .with_method(MethodDescriptor::server_streaming("watch"))
            .with_method(MethodDescriptor::client_streaming("sum"))
            .with_method(MethodDescriptor::unary("missing"))
    }

    fn implementations() -> Implementations<u32> {
        Implementations::<u32>::new()
            .add("double", |requests, _| requests.map(|r| r.map(|v| v * 2)))
            .add("silent", |_, _| stream::empty())
            .add("slow", |_, _| stream::pending())
            .add("count", |requests, _| {
                stream::once(single_request(requests)).flat_map(|n| match n {
                    Ok(n) => stream::iter((0..n).map(Ok)).boxed(),
                    Err(err) => stream::iter([Err(err)]).boxed(),
                })
            })
            .add("watch", |_, ctx| {
                let hold = ctx.hold();
                stream::iter([Ok(1)]).chain(hold.open())
            })
            .add("sum", |requests, _| {
                stream::once(requests.fold(Ok(0), |acc: Result<u32>, r| async move {
                    Ok::<_, Error>(acc? + r?)
                }))
            })
            .add("extra", |requests, _| requests)
    }

    fn adapter() -> ServerAdapter<u32> {
        ServerAdapter::wrap(&service(), implementations())
    }

    fn unary_call(handler: &Handler<u32>, request: u32) -> (Arc<CallControl>, oneshot::Receiver<Result<u32>>) {
        let control = CallControl::new();
        let (tx, rx) = oneshot::channel();
        handler.handle(
            ServerCall {
                method: handler.path().to_string(),
                control: control.clone(),
                request: Incoming::Single(request),
            },
            Responder::Single(Box::new(move |r: Result<u32>| {
                let _ = tx.send(r);
            })),
        );
        (control, rx)
    }

    fn streaming_call(handler: &Handler<u32>, request: u32) -> (Arc<CallControl>, InboundStream<u32>) {
        let control = CallControl::new();
        let (outbound, inbound) = pipe(1, &control);
        handler.handle(
            ServerCall {
                method: handler.path().to_string(),
                control: control.clone(),
                request: Incoming::Single(request),
            },
            Responder::Stream(outbound),
        );
        (control, InboundStream::new(inbound, handler.path()))
    }

    #[tokio::test]
    async fn test_wrap_skips_unmatched() {
        let adapter = adapter();
        let mut names: Vec<_> = adapter.method_names().cloned().collect();
        names.sort();
        assert_eq!(names, ["count", "double", "silent", "slow", "sum", "watch"]);
        assert!(adapter.handler("extra").is_none());
        assert_eq!(adapter.handler("double").unwrap().path(), "Math/double");
        assert_eq!(adapter.service_name(), "Math");
    }

    #[tokio::test]
    async fn test_unary() {
        let adapter = adapter();
        let (_, rx) = unary_call(adapter.handler("double").unwrap(), 21);
        assert_eq!(rx.await.unwrap(), Ok(42));

        let (_, rx) = unary_call(adapter.handler("silent").unwrap(), 1);
        assert_eq!(rx.await.unwrap().unwrap_err().kind, ErrorKind::NoResponse);
    }

    #[tokio::test]
    async fn test_unary_peer_cancel() {
        let adapter = adapter();
        let (control, rx) = unary_call(adapter.handler("slow").unwrap(), 1);
        tokio::task::yield_now().await;
        control.cancel();
        assert!(rx.await.unwrap().unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_server_streaming() {
        let adapter = adapter();
        let (_, replies) = streaming_call(adapter.handler("count").unwrap(), 3);
        let replies: Vec<_> = replies.collect().await;
        assert_eq!(replies, vec![Ok(0), Ok(1), Ok(2)]);
    }

    #[tokio::test]
    async fn test_client_streaming() {
        let adapter = adapter();
        let handler = adapter.handler("sum").unwrap();
        let control = CallControl::new();
        let (mut requests, inbound) = pipe(1, &control);
        let (tx, rx) = oneshot::channel();
        handler.handle(
            ServerCall {
                method: handler.path().to_string(),
                control: control.clone(),
                request: Incoming::Stream(inbound),
            },
            Responder::Single(Box::new(move |r: Result<u32>| {
                let _ = tx.send(r);
            })),
        );
        for v in [1, 2, 3] {
            assert!(requests.write(v).await);
        }
        requests.end();
        assert_eq!(rx.await.unwrap(), Ok(6));
    }

    #[tokio::test]
    async fn test_client_streaming_peer_cancel() {
        let adapter = adapter();
        let handler = adapter.handler("sum").unwrap();
        let control = CallControl::new();
        let (mut requests, inbound) = pipe(1, &control);
        let (tx, rx) = oneshot::channel();
        handler.handle(
            ServerCall {
                method: handler.path().to_string(),
                control: control.clone(),
                request: Incoming::Stream(inbound),
            },
            Responder::Single(Box::new(move |r: Result<u32>| {
                let _ = tx.send(r);
            })),
        );
        assert!(requests.write(1).await);
        assert!(requests.write(2).await);

        // cancelled mid-stream: the sum sees Cancelled, not a short stream.
        control.cancel();
        assert!(rx.await.unwrap().unwrap_err().is_cancelled());
        assert!(!requests.write(3).await);
        while adapter.running() != 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(adapter.held().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_shape() {
        let adapter = adapter();
        let (_, replies) = streaming_call(adapter.handler("double").unwrap(), 3);
        let replies: Vec<_> = replies.collect().await;
        assert_eq!(replies.len(), 1);
        assert_eq!(
            replies[0].as_ref().unwrap_err().kind,
            ErrorKind::ContractViolation
        );
    }

    #[tokio::test]
    async fn test_held_release_by_peer_cancel() {
        let adapter = adapter();
        let (control, mut replies) = streaming_call(adapter.handler("watch").unwrap(), 0);
        assert_eq!(replies.next().await, Some(Ok(1)));
        assert_eq!(adapter.held().len(), 1);

        control.cancel();
        assert!(replies.next().await.unwrap().unwrap_err().is_cancelled());
        while !adapter.held().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn test_release_held_cancels() {
        let adapter = adapter();
        let mut calls = Vec::new();
        for _ in 0..3 {
            let (control, mut replies) = streaming_call(adapter.handler("watch").unwrap(), 0);
            assert_eq!(replies.next().await, Some(Ok(1)));
            calls.push((control, replies));
        }
        assert_eq!(adapter.held().len(), 3);
        assert_eq!(adapter.release_held(), 3);
        assert!(adapter.held().is_empty());
        for (control, mut replies) in calls {
            assert!(replies.next().await.unwrap().unwrap_err().is_cancelled());
            assert_eq!(control.cancel_count(), 1);
        }
    }

    #[tokio::test]
    async fn test_shutdown() {
        let adapter = adapter();
        let (control, mut replies) = streaming_call(adapter.handler("watch").unwrap(), 0);
        assert_eq!(replies.next().await, Some(Ok(1)));
        let (slow, rx) = unary_call(adapter.handler("slow").unwrap(), 1);
        tokio::task::yield_now().await;
        assert_eq!(adapter.running(), 2);

        adapter.shutdown().await;
        assert_eq!(adapter.running(), 0);
        assert!(adapter.held().is_empty());
        assert!(control.is_cancelled());
        assert!(slow.is_cancelled());
        assert!(rx.await.unwrap().unwrap_err().is_cancelled());

        let (_, rx) = unary_call(adapter.handler("double").unwrap(), 1);
        assert_eq!(rx.await.unwrap().unwrap_err().kind, ErrorKind::TransportClosed);
    }
}
