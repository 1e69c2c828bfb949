use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Cardinality flags of an RPC method.
///
/// A method without flags is unary in both directions:
/// - `RequestStreaming`: the caller sends a stream of messages
/// - `ResponseStreaming`: the callee replies with a stream of messages
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone, Copy, Hash)]
#[repr(transparent)]
#[serde(transparent)]
pub struct MethodFlags(u8);

bitflags! {
    impl MethodFlags: u8 {
        /// Many request messages.
        const RequestStreaming = 1;
        /// Many response messages.
        const ResponseStreaming = 2;
    }
}

/// Static description of one method of a service.
///
/// Cardinalities are fixed when the descriptor table is built, so adapters
/// never have to inspect live call objects to learn a method's shape.
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct MethodDescriptor {
    pub name: String,
    pub flags: MethodFlags,
}

impl MethodDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>, flags: MethodFlags) -> Self {
        Self {
            name: name.into(),
            flags,
        }
    }

    #[must_use]
    pub fn unary(name: impl Into<String>) -> Self {
        Self::new(name, MethodFlags::empty())
    }

    #[must_use]
    pub fn server_streaming(name: impl Into<String>) -> Self {
        Self::new(name, MethodFlags::ResponseStreaming)
    }

    #[must_use]
    pub fn client_streaming(name: impl Into<String>) -> Self {
        Self::new(name, MethodFlags::RequestStreaming)
    }

    #[must_use]
    pub fn bidi_streaming(name: impl Into<String>) -> Self {
        Self::new(
            name,
            MethodFlags::RequestStreaming | MethodFlags::ResponseStreaming,
        )
    }

    #[must_use]
    pub fn is_request_streaming(&self) -> bool {
        self.flags.contains(MethodFlags::RequestStreaming)
    }

    #[must_use]
    pub fn is_response_streaming(&self) -> bool {
        self.flags.contains(MethodFlags::ResponseStreaming)
    }
}

/// A named table of method descriptors.
///
/// # Examples
///
/// ```rust
/// # use rxpc::{MethodDescriptor, ServiceDescriptor};
/// let greeter = ServiceDescriptor::new("Greeter")
///     .with_method(MethodDescriptor::unary("sayHello"))
///     .with_method(MethodDescriptor::server_streaming("sayMultiHello"));
/// assert_eq!(greeter.path("sayHello"), "Greeter/sayHello");
/// assert!(greeter.method("sayMultiHello").unwrap().is_response_streaming());
/// ```
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_method(mut self, method: MethodDescriptor) -> Self {
        self.methods.push(method);
        self
    }

    #[must_use]
    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// The fully qualified method name used for routing (e.g. "Greeter/sayHello").
    #[must_use]
    pub fn path(&self, method: &str) -> String {
        format!("{}/{}", self.name, method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_shapes() {
        let unary = MethodDescriptor::unary("a");
        assert!(!unary.is_request_streaming());
        assert!(!unary.is_response_streaming());

        let bidi = MethodDescriptor::bidi_streaming("b");
        assert!(bidi.is_request_streaming());
        assert!(bidi.is_response_streaming());

        assert!(MethodDescriptor::client_streaming("c").is_request_streaming());
        assert!(!MethodDescriptor::client_streaming("c").is_response_streaming());
    }

    #[test]
    fn test_descriptor_serde() {
        let service = ServiceDescriptor::new("Greeter")
            .with_method(MethodDescriptor::server_streaming("sayMultiHello"));
        let value = serde_json::to_value(&service).unwrap();
        assert_eq!(value["methods"][0]["flags"], 2);

        let back: ServiceDescriptor = serde_json::from_value(value).unwrap();
        assert_eq!(back, service);
        assert!(back.method("missing").is_none());
    }
}
