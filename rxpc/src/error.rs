use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The call was cancelled before it could complete.
    Cancelled,
    /// The caller broke the calling contract of a method.
    ContractViolation,
    MethodNotFound,
    /// A unary implementation finished without producing a value.
    NoResponse,
    TransportClosed,
    SerdeJsonError,
    #[serde(untagged)]
    Unknown(String),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub msg: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, msg: String) -> Self {
        Self { kind, msg }
    }

    #[must_use]
    pub fn kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            msg: String::default(),
        }
    }

    /// The error a call terminates with when its peer went away on purpose.
    #[must_use]
    pub fn cancelled(method: &str) -> Self {
        Self::new(ErrorKind::Cancelled, format!("call to {method} cancelled"))
    }

    #[must_use]
    pub fn contract(msg: String) -> Self {
        Self::new(ErrorKind::ContractViolation, msg)
    }

    /// Returns true if the call ended because it was cancelled rather than
    /// because something failed.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::kind(kind)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self {
            kind: ErrorKind::SerdeJsonError,
            msg: value.to_string(),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.msg.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            write!(f, "{:?}: {}", self.kind, self.msg)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
