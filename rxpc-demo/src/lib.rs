use std::{sync::Arc, time::Duration};

use futures_util::{StreamExt, stream};
use rxpc::{
    ClientApi, ClientConfig, Context, Error, Implementations, LocalChannel, LocalChannelConfig,
    MethodDescriptor, Result, Router, RxMethod, RxStream, ServerAdapter, ServiceDescriptor,
    single_request,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_inline_default::serde_inline_default;

pub const GREETER: &str = "Greeter";

/// Messages travel as JSON values.
pub type Message = serde_json::Value;

#[serde_inline_default]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HelloRequest {
    pub name: String,
    #[serde_inline_default(1)]
    pub num_greetings: usize,
    /// When false, `sayMultiHello` keeps the stream open after the last
    /// greeting until the call is cancelled or the server releases it.
    #[serde_inline_default(true)]
    pub do_complete: bool,
    #[serde_inline_default(0)]
    pub interval_ms: u64,
}

impl HelloRequest {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            num_greetings: 1,
            do_complete: true,
            interval_ms: 0,
        }
    }

    #[must_use]
    pub fn with_greetings(mut self, num_greetings: usize) -> Self {
        self.num_greetings = num_greetings;
        self
    }

    #[must_use]
    pub fn with_interval(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    #[must_use]
    pub fn held(mut self) -> Self {
        self.do_complete = false;
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HelloReply {
    pub message: String,
}

impl HelloReply {
    #[must_use]
    pub fn to(name: &str) -> Self {
        Self {
            message: reply(name),
        }
    }
}

#[must_use]
pub fn reply(name: &str) -> String {
    format!("Hello {name}!")
}

/// # Errors
///
/// Returns `SerdeJsonError` if `value` cannot be represented as JSON.
pub fn to_message<T: Serialize>(value: &T) -> Result<Message> {
    Ok(serde_json::to_value(value)?)
}

/// # Errors
///
/// Returns `SerdeJsonError` if `msg` does not match `T`.
pub fn from_message<T: DeserializeOwned>(msg: Message) -> Result<T> {
    Ok(serde_json::from_value(msg)?)
}

#[must_use]
pub fn greeter() -> ServiceDescriptor {
    ServiceDescriptor::new(GREETER)
        .with_method(MethodDescriptor::unary("sayHello"))
        .with_method(MethodDescriptor::server_streaming("sayMultiHello"))
        .with_method(MethodDescriptor::client_streaming("streamSayHello"))
}

#[must_use]
pub fn implementations() -> Implementations<Message> {
    Implementations::<Message>::new()
        .add("sayHello", |requests, _| stream::once(say_hello(requests)))
        .add("sayMultiHello", say_multi_hello)
        .add("streamSayHello", |requests, _| {
            stream::once(stream_say_hello(requests))
        })
}

async fn say_hello(requests: RxStream<Message>) -> Result<Message> {
    let request: HelloRequest = from_message(single_request(requests).await?)?;
    to_message(&HelloReply::to(&request.name))
}

fn say_multi_hello(requests: RxStream<Message>, ctx: Context) -> RxStream<Message> {
    stream::once(single_request(requests))
        .flat_map(move |request| match request.and_then(from_message::<HelloRequest>) {
            Ok(request) => greetings(&request, &ctx),
            Err(err) => stream::iter([Err(err)]).boxed(),
        })
        .boxed()
}

fn greetings(request: &HelloRequest, ctx: &Context) -> RxStream<Message> {
    let interval = Duration::from_millis(request.interval_ms);
    let message = to_message(&HelloReply::to(&request.name));
    let replies = stream::iter(0..request.num_greetings).then(move |i| {
        let message = message.clone();
        async move {
            if i > 0 && !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
            message
        }
    });

    if request.do_complete {
        replies.boxed()
    } else {
        let hold = ctx.hold();
        replies.chain(hold.open()).boxed()
    }
}

/// Answers the last request of the stream.
async fn stream_say_hello(mut requests: RxStream<Message>) -> Result<Message> {
    let mut last = None;
    while let Some(request) = requests.next().await {
        last = Some(from_message::<HelloRequest>(request?)?);
    }
    let request = last.ok_or_else(|| Error::contract("streamSayHello needs a request".into()))?;
    to_message(&HelloReply::to(&request.name))
}

/// A Greeter server and a client talking to it in-process.
pub struct Greeter {
    pub api: ClientApi<Message>,
    pub server: ServerAdapter<Message>,
    suffix: String,
}

impl Greeter {
    #[must_use]
    pub fn start(client: &ClientConfig, channel: &LocalChannelConfig) -> Self {
        let server = ServerAdapter::wrap(&greeter(), implementations());
        let mut router = Router::default();
        router.add_handlers(&server);
        let channel = Arc::new(LocalChannel::with_config(Arc::new(router), channel));
        let api = ClientApi::create(channel, &[greeter()], client);
        Self {
            api,
            server,
            suffix: client.method_suffix.clone(),
        }
    }

    /// The stream-returning entry of a Greeter method, e.g. "sayHello".
    ///
    /// # Errors
    ///
    /// Returns `MethodNotFound` for a method the Greeter does not have.
    pub fn method(&self, name: &str) -> Result<&RxMethod<Message>> {
        self.api.method(GREETER, &format!("{name}{}", self.suffix))
    }
}

impl Default for Greeter {
    fn default() -> Self {
        Self::start(&ClientConfig::default(), &LocalChannelConfig::default())
    }
}
