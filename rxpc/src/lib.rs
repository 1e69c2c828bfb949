#![forbid(unsafe_code)]

mod error;
pub use error::{Error, ErrorKind, Result};

mod method;
pub use method::{MethodDescriptor, MethodFlags, ServiceDescriptor};

mod registry;
pub use registry::{CancelToken, CancellationRegistry};

mod call;
pub use call::{CallControl, Callback, Inbound, Outbound, pipe};

pub mod bridge;
pub use bridge::{InboundStream, OnError, PumpOutcome, pump};

mod channel;
pub use channel::Channel;

mod task_supervisor;
pub use task_supervisor::{TaskSupervisor, TaskSupervisorGuard};

mod context;
pub use context::{Context, Hold};

mod server;
pub use server::{
    Handler, Implementation, Implementations, Incoming, Responder, RxStream, ServerAdapter,
    ServerCall, single_request,
};

mod router;
pub use router::Router;

mod client;
pub use client::{CallStatus, CallStream, ClientApi, ClientConfig, Request, RxMethod, ServiceClient};

mod local;
pub use local::{LocalChannel, LocalChannelConfig};
