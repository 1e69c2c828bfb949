use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};

use foldhash::fast::RandomState;
use futures_util::{
    Stream, StreamExt,
    stream::{BoxStream, FusedStream},
};
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use tokio::{sync::oneshot, task::AbortHandle};
use tokio_util::sync::WaitForCancellationFutureOwned;

use crate::{
    CallControl, CancelToken, CancellationRegistry, Channel, Error, ErrorKind, MethodDescriptor, MethodFlags,
    Outbound, Result, ServiceDescriptor,
    bridge::{InboundStream, OnError, pump},
};

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone, clap::Args)]
pub struct ClientConfig {
    /// Appended to each method name to form the name of its stream-returning
    /// entry. An empty suffix makes the entries take the original names.
    #[serde_inline_default("Rx".to_string())]
    #[arg(long, default_value = "Rx")]
    pub method_suffix: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

/// The argument of a call: one message, or a stream of messages for methods
/// with a streaming request.
pub enum Request<M> {
    Single(M),
    Stream(BoxStream<'static, Result<M>>),
}

impl<M> Request<M> {
    pub fn single(msg: M) -> Self {
        Self::Single(msg)
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<M>> + Send + 'static,
    {
        Self::Stream(stream.boxed())
    }

    fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }
}

impl<M> std::fmt::Debug for Request<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single(_) => f.write_str("Request::Single"),
            Self::Stream(_) => f.write_str("Request::Stream"),
        }
    }
}

/// Lifecycle of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    /// Created, the transport call has not started yet.
    Idle,
    Active,
    Completed,
    Cancelled,
    Errored,
}

impl CallStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Errored)
    }
}

/// A stream-returning entry for one method of a service.
pub struct RxMethod<M> {
    descriptor: MethodDescriptor,
    path: String,
    channel: Arc<dyn Channel<M>>,
    registry: CancellationRegistry,
}

impl<M> std::fmt::Debug for RxMethod<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxMethod")
            .field("descriptor", &self.descriptor)
            .field("path", &self.path)
            .finish()
    }
}

impl<M> Clone for RxMethod<M> {
    fn clone(&self) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            path: self.path.clone(),
            channel: self.channel.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<M: Send + 'static> RxMethod<M> {
    #[must_use]
    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Prepares a call of this method.
    ///
    /// Nothing is sent until the returned stream is first polled. Dropping the
    /// stream before it terminates cancels the call.
    ///
    /// # Errors
    ///
    /// Returns a `ContractViolation` if the kind of `request` does not match the
    /// method: a streaming-request method needs [`Request::Stream`], every other
    /// method needs [`Request::Single`].
    pub fn call(&self, request: Request<M>) -> Result<CallStream<M>> {
        if request.is_stream() != self.descriptor.is_request_streaming() {
            let msg = if self.descriptor.is_request_streaming() {
                format!("{} requires a request stream", self.path)
            } else {
                format!("{} takes a single request", self.path)
            };
            tracing::warn!("{msg}");
            return Err(Error::contract(msg));
        }

        tracing::debug!("{} called", self.path);
        Ok(CallStream {
            path: self.path.clone(),
            state: CallState::Idle(Start {
                channel: self.channel.clone(),
                registry: self.registry.clone(),
                flags: self.descriptor.flags,
                request,
            }),
        })
    }

    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub fn unary(&self, request: M) -> Result<CallStream<M>> {
        self.call(Request::single(request))
    }

    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub fn streaming<S>(&self, requests: S) -> Result<CallStream<M>>
    where
        S: Stream<Item = Result<M>> + Send + 'static,
    {
        self.call(Request::stream(requests))
    }
}

struct Start<M> {
    channel: Arc<dyn Channel<M>>,
    registry: CancellationRegistry,
    flags: MethodFlags,
    request: Request<M>,
}

struct ActiveCall<M> {
    control: Arc<CallControl>,
    response: Response<M>,
    token: Option<CancelToken>,
    pump: Option<AbortHandle>,
}

enum CallState<M> {
    Idle(Start<M>),
    Active(ActiveCall<M>),
    Done(CallStatus),
}

enum Response<M> {
    Single {
        rx: oneshot::Receiver<Result<M>>,
        cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    },
    Stream(InboundStream<M>),
}

enum Step<M> {
    Next(M),
    Last(M),
    End(Option<Error>),
}

impl<M: Send + 'static> Start<M> {
    fn begin(self, path: &str) -> ActiveCall<M> {
        let Start {
            channel,
            registry,
            flags,
            request,
        } = self;
        let streaming_response = flags.contains(MethodFlags::ResponseStreaming);

        let (control, response, pump) = match request {
            Request::Single(msg) if streaming_response => {
                let inbound = channel.server_streaming(path, msg);
                let control = inbound.control().clone();
                (control, Response::Stream(InboundStream::new(inbound, path)), None)
            }
            Request::Single(msg) => {
                let (tx, rx) = oneshot::channel();
                let control = channel.unary(path, msg, Box::new(move |result: Result<M>| {
                    let _ = tx.send(result);
                }));
                let cancelled = Box::pin(control.cancelled_owned());
                (control, Response::Single { rx, cancelled }, None)
            }
            Request::Stream(requests) if streaming_response => {
                let (outbound, inbound) = channel.bidi_streaming(path);
                let control = inbound.control().clone();
                let pump = spawn_pump(requests, outbound, path);
                (
                    control,
                    Response::Stream(InboundStream::new(inbound, path)),
                    Some(pump),
                )
            }
            Request::Stream(requests) => {
                let (tx, rx) = oneshot::channel();
                let outbound = channel.client_streaming(path, Box::new(move |result: Result<M>| {
                    let _ = tx.send(result);
                }));
                let control = outbound.control().clone();
                let cancelled = Box::pin(control.cancelled_owned());
                let pump = spawn_pump(requests, outbound, path);
                (control, Response::Single { rx, cancelled }, Some(pump))
            }
        };

        let token = control.is_cancellable().then(|| {
            let control = control.clone();
            registry.register(move || control.cancel())
        });
        tracing::debug!("{path} started");

        ActiveCall {
            control,
            response,
            token,
            pump,
        }
    }
}

fn spawn_pump<M: Send + 'static>(
    requests: BoxStream<'static, Result<M>>,
    mut outbound: Outbound<M>,
    path: &str,
) -> AbortHandle {
    let path = path.to_string();
    tokio::spawn(async move {
        let outcome = pump(requests, &mut outbound, OnError::Abort).await;
        tracing::debug!("{path} request stream finished: {outcome:?}");
    })
    .abort_handle()
}

impl<M> ActiveCall<M> {
    /// The call ended on its own: drop the token without running it.
    fn retire(self) {
        if let Some(token) = &self.token {
            token.retire();
        }
        if let Some(pump) = &self.pump {
            pump.abort();
        }
    }

    /// The consumer went away. The transport call is cancelled unless it
    /// already terminated on its own.
    fn release(mut self, path: &str) {
        if self.control.is_cancelled() || self.response.has_terminated() {
            tracing::debug!("{path} dropped after the transport finished");
            self.retire();
        } else {
            tracing::debug!("{path} dropped while active, cancelling");
            self.cancel();
        }
    }

    fn cancel(self) {
        if let Some(token) = &self.token {
            token.cancel();
        }
        if let Some(pump) = &self.pump {
            pump.abort();
        }
    }
}

impl<M> Response<M> {
    /// Whether the transport already delivered its terminal event.
    fn has_terminated(&mut self) -> bool {
        match self {
            Self::Single { rx, .. } => !matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)),
            Self::Stream(stream) => stream.is_drained(),
        }
    }

    fn poll_step(&mut self, path: &str, cx: &mut Context<'_>) -> Poll<Step<M>> {
        match self {
            Self::Single { rx, cancelled } => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(Ok(msg))) => Poll::Ready(Step::Last(msg)),
                Poll::Ready(Ok(Err(err))) => Poll::Ready(Step::End(Some(err))),
                Poll::Ready(Err(_)) => Poll::Ready(Step::End(Some(Error::new(
                    ErrorKind::TransportClosed,
                    format!("{path} dropped its callback"),
                )))),
                Poll::Pending => cancelled
                    .as_mut()
                    .poll(cx)
                    .map(|()| Step::End(Some(Error::cancelled(path)))),
            },
            Self::Stream(stream) => stream.poll_next_unpin(cx).map(|item| match item {
                Some(Ok(msg)) => Step::Next(msg),
                Some(Err(err)) => Step::End(Some(err)),
                None => Step::End(None),
            }),
        }
    }
}

/// The response of one call, as a `Stream`.
///
/// Yields the response message(s) in order, then ends; a failure is yielded
/// as the last item. Produces exactly one terminal signal.
///
/// The transport call starts on first poll. While the call is active its
/// cancel token sits in the client's registry; the token is removed when the
/// call terminates, and invoked if the stream is dropped first.
pub struct CallStream<M> {
    path: String,
    state: CallState<M>,
}

impl<M> Unpin for CallStream<M> {}

impl<M> std::fmt::Debug for CallStream<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallStream")
            .field("path", &self.path)
            .field("status", &self.status())
            .finish()
    }
}

impl<M> CallStream<M> {
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn status(&self) -> CallStatus {
        match &self.state {
            CallState::Idle(_) => CallStatus::Idle,
            CallState::Active(_) => CallStatus::Active,
            CallState::Done(status) => *status,
        }
    }

    /// The cancel token of the active call, if the transport call is
    /// cancellable. Cancelling it ends the stream with a `Cancelled` error.
    #[must_use]
    pub fn cancel_token(&self) -> Option<CancelToken> {
        match &self.state {
            CallState::Active(active) => active.token.clone(),
            _ => None,
        }
    }

    fn finish(&mut self, status: CallStatus) {
        if let CallState::Active(active) = std::mem::replace(&mut self.state, CallState::Done(status)) {
            tracing::debug!("{} {status:?}", self.path);
            active.retire();
        }
    }
}

impl<M: Send + 'static> Stream for CallStream<M> {
    type Item = Result<M>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if matches!(this.state, CallState::Idle(_)) {
            let state = std::mem::replace(&mut this.state, CallState::Done(CallStatus::Idle));
            if let CallState::Idle(start) = state {
                this.state = CallState::Active(start.begin(&this.path));
            }
        }

        let CallState::Active(active) = &mut this.state else {
            return Poll::Ready(None);
        };
        let step = ready!(active.response.poll_step(&this.path, cx));
        Poll::Ready(match step {
            Step::Next(msg) => Some(Ok(msg)),
            Step::Last(msg) => {
                this.finish(CallStatus::Completed);
                Some(Ok(msg))
            }
            Step::End(None) => {
                this.finish(CallStatus::Completed);
                None
            }
            Step::End(Some(err)) => {
                let status = if err.is_cancelled() {
                    CallStatus::Cancelled
                } else {
                    CallStatus::Errored
                };
                this.finish(status);
                Some(Err(err))
            }
        })
    }
}

impl<M: Send + 'static> FusedStream for CallStream<M> {
    fn is_terminated(&self) -> bool {
        matches!(self.state, CallState::Done(_))
    }
}

impl<M> Drop for CallStream<M> {
    fn drop(&mut self) {
        let state = std::mem::replace(&mut self.state, CallState::Done(CallStatus::Cancelled));
        if let CallState::Active(active) = state {
            active.release(&self.path);
        }
    }
}

/// The stream-returning entries of one service.
pub struct ServiceClient<M> {
    name: String,
    methods: HashMap<String, RxMethod<M>, RandomState>,
}

impl<M> ServiceClient<M> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn method(&self, name: &str) -> Option<&RxMethod<M>> {
        self.methods.get(name)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &String> {
        self.methods.keys()
    }
}

/// Client API wrapping a [`Channel`] with stream-returning methods.
///
/// Every method of every service gets an entry named
/// `<method><method_suffix>`. The original callback-style methods remain
/// reachable through [`channel`](Self::channel). All calls issued through one
/// `ClientApi` share its [`CancellationRegistry`].
///
/// # Examples
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use futures_util::StreamExt;
/// # use rxpc::{ClientApi, ClientConfig, LocalChannel, MethodDescriptor, Router, ServiceDescriptor};
/// # #[tokio::main]
/// # async fn main() -> rxpc::Result<()> {
/// let greeter = ServiceDescriptor::new("Greeter")
///     .with_method(MethodDescriptor::server_streaming("sayMultiHello"));
/// let channel = Arc::new(LocalChannel::new(Arc::new(Router::<String>::default())));
/// let api = ClientApi::create(channel, &[greeter], &ClientConfig::default());
///
/// let mut replies = api
///     .method("Greeter", "sayMultiHelloRx")?
///     .unary("Brody".to_string())?;
/// while let Some(reply) = replies.next().await {
///     println!("{}", reply?);
/// }
/// assert!(api.registry().is_empty());
/// # Ok(())
/// # }
/// ```
pub struct ClientApi<M> {
    channel: Arc<dyn Channel<M>>,
    services: HashMap<String, ServiceClient<M>, RandomState>,
    registry: CancellationRegistry,
}

impl<M: Send + 'static> ClientApi<M> {
    pub fn create(
        channel: Arc<dyn Channel<M>>,
        services: &[ServiceDescriptor],
        config: &ClientConfig,
    ) -> Self {
        let registry = CancellationRegistry::default();
        let services = services
            .iter()
            .map(|service| {
                let methods = service
                    .methods
                    .iter()
                    .map(|method| {
                        let name = format!("{}{}", method.name, config.method_suffix);
                        let entry = RxMethod {
                            descriptor: method.clone(),
                            path: service.path(&method.name),
                            channel: channel.clone(),
                            registry: registry.clone(),
                        };
                        (name, entry)
                    })
                    .collect();
                let client = ServiceClient {
                    name: service.name.clone(),
                    methods,
                };
                (service.name.clone(), client)
            })
            .collect();

        Self {
            channel,
            services,
            registry,
        }
    }

    /// The wrapped transport, for callback-style calls.
    #[must_use]
    pub fn channel(&self) -> &Arc<dyn Channel<M>> {
        &self.channel
    }

    /// The cancel tokens of every call still in flight.
    #[must_use]
    pub fn registry(&self) -> &CancellationRegistry {
        &self.registry
    }

    #[must_use]
    pub fn service(&self, name: &str) -> Option<&ServiceClient<M>> {
        self.services.get(name)
    }

    pub fn service_names(&self) -> impl Iterator<Item = &String> {
        self.services.keys()
    }

    /// Looks up the entry `method` of `service`.
    ///
    /// # Errors
    ///
    /// Returns `MethodNotFound` if there is no such entry.
    pub fn method(&self, service: &str, method: &str) -> Result<&RxMethod<M>> {
        self.service(service)
            .and_then(|s| s.method(method))
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::MethodNotFound,
                    format!("method not found: {service}/{method}"),
                )
            })
    }

    /// Cancels every call still in flight and returns how many there were.
    pub fn close(&self) -> usize {
        self.registry.cancel_all()
    }
}

impl<M> std::fmt::Debug for ClientApi<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientApi")
            .field("services", &self.services.keys())
            .field("registry", &self.registry)
            .finish()
    }
}
