//! Bus error model.

use core::fmt;

use thiserror::Error;

/// Integration-level error.
///
/// These indicate a misconfigured pipeline or a failing collaborator (transport,
/// transaction), never a failure of the application's own message handling.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The pipeline state does not carry a transaction context.
    #[error("could not find a transaction context in the current pipeline state")]
    MissingTransactionContext,

    /// The pipeline state does not carry the received transport message.
    #[error("could not find the transport message in the current pipeline state")]
    MissingTransportMessage,

    /// The pipeline state does not carry a deserialized message.
    #[error("could not find the logical message in the current pipeline state")]
    MissingLogicalMessage,

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// Sending or receiving through the transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Committing the transaction failed.
    #[error("commit failed: {0}")]
    Commit(String),
}

impl BusError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn commit(msg: impl Into<String>) -> Self {
        Self::Commit(msg.into())
    }
}

/// Generic application failure raised by message handlers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ApplicationError(pub String);

/// Failure that must never be retried.
///
/// The default fail-fast policy recognises this type anywhere in an error's chain.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct FailFastError(pub String);

/// Raised by handlers that observed the shutdown token.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Default)]
#[error("the operation was cancelled")]
pub struct OperationCancelled;

/// Failure of a message handler or pipeline step.
///
/// Wraps an [`anyhow::Error`] and remembers the Rust type name of the error it was
/// created from, so captured snapshots can report what kind of failure occurred.
/// Any `std::error::Error` converts into it with `?`.
///
/// Like `anyhow::Error`, this type deliberately does not implement
/// `std::error::Error` itself (that would collide with the blanket `From`).
pub struct HandlerError {
    type_name: &'static str,
    inner: anyhow::Error,
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self {
            type_name: std::any::type_name::<E>(),
            inner: anyhow::Error::new(error),
        }
    }
}

impl HandlerError {
    /// Shorthand for an [`ApplicationError`] with the given message.
    pub fn msg(message: impl fmt::Display) -> Self {
        ApplicationError(message.to_string()).into()
    }

    /// Adopt an error that was already erased into `anyhow::Error`.
    pub fn from_anyhow(error: anyhow::Error) -> Self {
        Self {
            type_name: std::any::type_name::<anyhow::Error>(),
            inner: error,
        }
    }

    /// Type name of the original error.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Wrap the error with additional context, keeping the original type name.
    pub fn context<C>(self, context: C) -> Self
    where
        C: fmt::Display + Send + Sync + 'static,
    {
        Self {
            type_name: self.type_name,
            inner: self.inner.context(context),
        }
    }

    /// True when an error of type `E` appears anywhere in the chain.
    pub fn is<E>(&self) -> bool
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.downcast_ref::<E>().is_some()
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        // anyhow resolves both context layers and the wrapped error here.
        self.inner.downcast_ref::<E>()
    }

    /// True when the failure is a shutdown signal rather than a handling error.
    pub fn is_cancellation(&self) -> bool {
        self.is::<OperationCancelled>()
    }

    pub fn as_anyhow(&self) -> &anyhow::Error {
        &self.inner
    }

    pub fn into_anyhow(self) -> anyhow::Error {
        self.inner
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}
