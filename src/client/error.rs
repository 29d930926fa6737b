use std::error::Error as StdError;
use std::io;

use thiserror::Error;

use crate::BoxError;

/// Errors surfaced by an exchange.
///
/// HTTP status codes are never errors: a response carrying a 4xx or 5xx status is a
/// successful exchange.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Establishing the connection failed.
    #[error("dial: {0}")]
    Dial(#[source] BoxError),

    /// The response headers did not arrive within the response-header timeout.
    #[error("timeout awaiting response headers")]
    ResponseHeaderTimeout,

    /// The exchange was canceled, either because its total deadline elapsed or because
    /// a caller canceled it explicitly.
    #[error("request canceled")]
    Canceled,

    /// A failure which the transport reports as temporary, and which is therefore
    /// worth retrying.
    #[error("temporary failure: {0}")]
    Temporary(#[source] BoxError),

    /// Any other failure of the underlying transport.
    #[error("transport: {0}")]
    Transport(#[source] BoxError),

    /// The TLS configuration could not be built.
    #[error("tls: {0}")]
    Tls(#[source] BoxError),

    /// The transport has been closed and no longer accepts requests.
    #[error("transport closed")]
    Closed,

    /// The deadline monitor task failed to shut down cleanly.
    #[error("deadline monitor: {0}")]
    Monitor(#[source] tokio::task::JoinError),
}

impl Error {
    /// Wrap an error which should be considered temporary (and so retryable).
    pub fn temporary<E: Into<BoxError>>(error: E) -> Self {
        Error::Temporary(error.into())
    }

    /// Wrap any other transport error.
    pub fn transport<E: Into<BoxError>>(error: E) -> Self {
        Error::Transport(error.into())
    }

    /// Did this error come from establishing a connection?
    pub fn is_dial(&self) -> bool {
        matches!(self, Error::Dial(_))
    }

    /// Was this exchange canceled (usually by its total deadline)?
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }

    /// Is this a timeout observed by the underlying transport?
    ///
    /// Deadline cancellation is reported by [`Error::is_canceled`] instead.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ResponseHeaderTimeout)
    }

    /// Did the transport mark this failure as temporary?
    pub fn is_temporary(&self) -> bool {
        matches!(self, Error::Temporary(_))
    }
}

impl From<hyper_util::client::legacy::Error> for Error {
    fn from(error: hyper_util::client::legacy::Error) -> Self {
        let dial = error.is_connect();
        let error: BoxError = match network_failure(&error) {
            Some(failure) => Box::new(NetworkFailure {
                message: format!("{error}: {failure}"),
                source: error,
            }),
            None => error.into(),
        };

        if dial {
            Error::Dial(error)
        } else {
            Error::Transport(error)
        }
    }
}

/// A client error restated so its message ends with the conventional text for the
/// underlying network failure (`connection refused`, `unexpected EOF.`, ...).
#[derive(Debug, Error)]
#[error("{message}")]
struct NetworkFailure {
    message: String,
    #[source]
    source: hyper_util::client::legacy::Error,
}

/// The conventional message for the first recognizable network failure in `error`'s chain.
fn network_failure(error: &(dyn StdError + 'static)) -> Option<&'static str> {
    let mut next = Some(error);
    while let Some(error) = next {
        if let Some(error) = error.downcast_ref::<io::Error>() {
            match error.kind() {
                io::ErrorKind::ConnectionRefused => return Some("connection refused"),
                io::ErrorKind::ConnectionReset => return Some("connection reset by peer."),
                io::ErrorKind::UnexpectedEof => return Some("unexpected EOF."),
                _ => {}
            }
        }

        if let Some(error) = error.downcast_ref::<hyper::Error>() {
            if error.is_incomplete_message() {
                return Some("unexpected EOF.");
            }
        }

        next = error.source();
    }

    None
}
