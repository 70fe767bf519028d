//! Crate-wide error type.
//!
//! Every failure carries one of a small set of status-like codes. Layers that
//! want to leave a causal trail wrap errors with [`Error::context`], so a
//! caller sees messages such as `stage echo: find rpc: not found: service foo`
//! while [`Error::code`] still reports the root cause.

use std::fmt;

use tonic::{Code as GrpcCode, Status};

/// Result type for maestro operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error category, independent of how many context layers wrap it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Unavailable,
    Internal,
    Unknown,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Code::InvalidArgument => "invalid argument",
            Code::NotFound => "not found",
            Code::AlreadyExists => "already exists",
            Code::FailedPrecondition => "failed precondition",
            Code::Unavailable => "unavailable",
            Code::Internal => "internal",
            Code::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Errors that can occur while discovering, linking or running stages.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal: {0}")]
    Internal(String),

    #[error("unknown: {0}")]
    Unknown(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Error::AlreadyExists(msg.into())
    }

    pub fn failed_precondition(msg: impl Into<String>) -> Self {
        Error::FailedPrecondition(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Error::Unavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Error::Unknown(msg.into())
    }

    /// Wrap this error with a layer label.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Root code, looking through every context layer.
    pub fn code(&self) -> Code {
        match self {
            Error::InvalidArgument(_) => Code::InvalidArgument,
            Error::NotFound(_) => Code::NotFound,
            Error::AlreadyExists(_) => Code::AlreadyExists,
            Error::FailedPrecondition(_) => Code::FailedPrecondition,
            Error::Unavailable(_) => Code::Unavailable,
            Error::Internal(_) => Code::Internal,
            Error::Unknown(_) => Code::Unknown,
            Error::Context { source, .. } => source.code(),
        }
    }
}

/// Adds context to the error side of a `Result`.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.context(f()))
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        let msg = status.message().to_string();
        match status.code() {
            GrpcCode::InvalidArgument | GrpcCode::OutOfRange => Error::InvalidArgument(msg),
            GrpcCode::NotFound => Error::NotFound(msg),
            GrpcCode::AlreadyExists => Error::AlreadyExists(msg),
            GrpcCode::FailedPrecondition | GrpcCode::Unimplemented => {
                Error::FailedPrecondition(msg)
            }
            GrpcCode::Unavailable | GrpcCode::DeadlineExceeded => Error::Unavailable(msg),
            GrpcCode::Internal | GrpcCode::DataLoss => Error::Internal(msg),
            _ => Error::Unknown(msg),
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        let msg = err.to_string();
        match err.code() {
            Code::InvalidArgument => Status::invalid_argument(msg),
            Code::NotFound => Status::not_found(msg),
            Code::AlreadyExists => Status::already_exists(msg),
            Code::FailedPrecondition => Status::failed_precondition(msg),
            Code::Unavailable => Status::unavailable(msg),
            Code::Internal => Status::internal(msg),
            Code::Unknown => Status::unknown(msg),
        }
    }
}
