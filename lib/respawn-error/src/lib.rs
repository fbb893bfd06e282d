//! Error primitives shared across the workspace.
//!
//! Two shapes of error live here: [`GenericError`], an opaque error used wherever the caller only needs to report or
//! propagate a failure, and [`JobError`], the classified failure of a single job or execution unit. A `JobError`
//! always carries an [`ErrorKind`], which is what reboot strategies match against when deciding whether a failure is
//! severe enough to replace the process.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{borrow::Cow, fmt, sync::Arc};

use serde::{Deserialize, Serialize};

/// An opaque, context-carrying error.
pub type GenericError = anyhow::Error;

/// Macro for constructing a generic error.
///
/// The resulting value evaluates to [`GenericError`], and can be constructed from a string literal, a format string
/// (with arguments accepted, in the same order as `std::format!`), or a value which implements `Debug` and `Display`,
/// such as an existing error that implements `std::error::Error`.
#[macro_export]
macro_rules! generic_error {
    ($msg:literal $(,)?) => { $crate::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::_anyhow!($fmt, $($arg)*) };
}

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

pub(crate) mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}

// NOTE: We're wrapping `anyhow::Context` because otherwise the extension methods overlap with `snafu::ResultExt`, and
// most crates in the workspace want both.
/// Extension methods for attaching context to errors.
pub trait ErrorContext<T, E>: private::Sealed {
    /// Wrap the error value with additional context.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: fmt::Display + Send + Sync + 'static;

    /// Wrap the error value with additional context that is evaluated lazily only once an error does occur.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: fmt::Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: fmt::Display + Send + Sync + 'static,
    {
        <Self as anyhow::Context<T, E>>::context(self, context)
    }

    fn with_error_context<C, F>(self, context: F) -> Result<T, GenericError>
    where
        C: fmt::Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        <Self as anyhow::Context<T, E>>::with_context(self, context)
    }
}

/// Discriminator for a class of job failure.
///
/// Kinds are compared by exact string equality: `io.timeout` and `io` are unrelated kinds. Kinds are cheap to clone.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorKind(Arc<str>);

impl ErrorKind {
    /// Kind assigned to failures that were not classified by their producer.
    pub const UNCLASSIFIED: &'static str = "unclassified";

    /// Kind assigned to execution units that panicked.
    pub const PANIC: &'static str = "panic";

    /// Creates a new `ErrorKind` from the given name.
    pub fn new<S: AsRef<str>>(name: S) -> Self {
        Self(name.as_ref().into())
    }

    /// Creates the kind used for failures without an explicit classification.
    pub fn unclassified() -> Self {
        Self::new(Self::UNCLASSIFIED)
    }

    /// Creates the kind used for panicking execution units.
    pub fn panic() -> Self {
        Self::new(Self::PANIC)
    }

    /// Returns the kind as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ErrorKind {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ErrorKind {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

/// A classified failure of a single job or execution unit.
///
/// Job errors never unwind past the dispatch boundary: they are reported, counted, and handed to the reboot strategy,
/// but the worker process keeps running unless the strategy decides otherwise.
#[derive(Debug)]
pub struct JobError {
    kind: ErrorKind,
    source: GenericError,
}

impl JobError {
    /// Creates a new `JobError` of the given kind, wrapping `source`.
    pub fn new<K, E>(kind: K, source: E) -> Self
    where
        K: Into<ErrorKind>,
        E: Into<GenericError>,
    {
        Self {
            kind: kind.into(),
            source: source.into(),
        }
    }

    /// Creates a new `JobError` of the given kind from a plain message.
    pub fn msg<K, M>(kind: K, message: M) -> Self
    where
        K: Into<ErrorKind>,
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self {
            kind: kind.into(),
            source: GenericError::msg(message),
        }
    }

    /// Creates a `JobError` describing a panic, using the panic payload as the message when it is a string.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message: Cow<'static, str> = if let Some(s) = payload.downcast_ref::<&'static str>() {
            Cow::Borrowed(*s)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            Cow::Owned(s.clone())
        } else {
            Cow::Borrowed("execution unit panicked")
        };

        Self::msg(ErrorKind::panic(), message)
    }

    /// Returns the kind of this failure.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Returns the underlying error.
    pub fn source_error(&self) -> &GenericError {
        &self.source
    }

    /// Consumes the error, returning the kind and the underlying error.
    pub fn into_parts(self) -> (ErrorKind, GenericError) {
        (self.kind, self.source)
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.source)
    }
}

impl std::error::Error for JobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.source)
    }
}

impl From<GenericError> for JobError {
    fn from(source: GenericError) -> Self {
        Self {
            kind: ErrorKind::unclassified(),
            source,
        }
    }
}
