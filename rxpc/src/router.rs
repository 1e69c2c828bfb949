use foldhash::fast::RandomState;
use std::collections::HashMap;

use crate::{
    Handler, Responder, ServerAdapter, ServerCall,
    error::{Error, ErrorKind},
};

/// Dispatch table from method path ("Service/method") to [`Handler`].
pub struct Router<M> {
    handlers: HashMap<String, Handler<M>, RandomState>,
}

impl<M> Default for Router<M> {
    fn default() -> Self {
        Self {
            handlers: HashMap::default(),
        }
    }
}

impl<M: Send + 'static> Router<M> {
    pub fn add_handler(&mut self, handler: Handler<M>) {
        self.handlers.insert(handler.path().to_string(), handler);
    }

    /// Registers every handler of `adapter`.
    pub fn add_handlers(&mut self, adapter: &ServerAdapter<M>) {
        self.handlers.extend(
            adapter
                .handlers()
                .map(|handler| (handler.path().to_string(), handler.clone())),
        );
    }

    pub fn method_names(&self) -> impl Iterator<Item = &String> {
        self.handlers.keys()
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.handlers.contains_key(path)
    }

    pub fn dispatch(&self, call: ServerCall<M>, responder: Responder<M>) {
        if let Some(handler) = self.handlers.get(&call.method) {
            handler.handle(call, responder);
        } else {
            tokio::spawn(async move {
                let m = format!("method not found: {}", call.method);
                tracing::error!("{m}");
                responder.fail(Error::new(ErrorKind::MethodNotFound, m)).await;
            });
        }
    }
}

impl<M> std::fmt::Debug for Router<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("methods", &self.handlers.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        CallControl, Implementations, Incoming, MethodDescriptor, ServiceDescriptor,
    };
    use futures_util::StreamExt;
    use tokio::sync::oneshot;

    fn call(router: &Router<String>, method: &str) -> oneshot::Receiver<crate::Result<String>> {
        let (tx, rx) = oneshot::channel();
        router.dispatch(
            ServerCall {
                method: method.to_string(),
                control: CallControl::new(),
                request: Incoming::Single("Rust".to_string()),
            },
            Responder::Single(Box::new(move |r: crate::Result<String>| {
                let _ = tx.send(r);
            })),
        );
        rx
    }

    #[tokio::test]
    async fn test_dispatch() {
        let service = ServiceDescriptor::new("Greeter").with_method(MethodDescriptor::unary("sayHello"));
        let implementations = Implementations::<String>::new().add("sayHello", |requests, _| {
            requests.map(|name| name.map(|name| format!("Hello {name}!")))
        });
        let adapter = ServerAdapter::wrap(&service, implementations);
        let mut router = Router::default();
        router.add_handlers(&adapter);
        assert!(router.contains("Greeter/sayHello"));
        assert_eq!(router.method_names().count(), 1);

        assert_eq!(
            call(&router, "Greeter/sayHello").await.unwrap(),
            Ok("Hello Rust!".to_string())
        );
        let err = call(&router, "Greeter/sayBye").await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::MethodNotFound);
        assert_eq!(err.msg, "method not found: Greeter/sayBye");
    }
}
