//! Error types for this crate.

use std::fmt::Display;

use futures_channel::oneshot;

use crate::pending::OperationKind;

/// A convenience type alias for a `Result` with an `Error` type.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in this crate.
///
/// Errors are cheap to clone so that a single failure can be delivered to every caller waiting on
/// the same operation.
#[derive(Debug, Clone)]
pub struct Error {
    data: ErrorData,
}

/// The kind of error that occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// The peripheral is not known to the registry.
    NotFound,
    /// The peripheral is already in, or cannot leave, the requested state.
    AlreadyInState,
    /// The radio has no resources left for the command.
    Busy,
    /// The caller's deadline elapsed before the operation completed.
    Timeout,
    /// The link dropped while the operation was outstanding.
    ConnectionLost,
    /// A GATT request was made to a peripheral that is not connected.
    NotConnected,
    /// The adapter is powered off, unsupported or unauthorized.
    Unavailable,
    /// The radio stack reported a failure.
    Radio(bleman_radio::error::ErrorKind),
    /// The operation was canceled.
    Canceled,
    /// A broadcast channel lagged.
    Lagged,
}

#[derive(Debug, Clone)]
enum ErrorData {
    Radio {
        operation: OperationKind,
        error: bleman_radio::Error,
    },
    Simple(ErrorKind),
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.data {
            ErrorData::Radio { operation, error } => write!(f, "{operation} failed: {error}"),
            ErrorData::Simple(kind) => kind.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.data {
            ErrorData::Radio { error, .. } => Some(error),
            ErrorData::Simple(_) => None,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error {
            data: ErrorData::Simple(kind),
        }
    }
}

impl From<oneshot::Canceled> for Error {
    fn from(_value: oneshot::Canceled) -> Self {
        ErrorKind::Canceled.into()
    }
}

impl From<async_broadcast::RecvError> for Error {
    fn from(_value: async_broadcast::RecvError) -> Self {
        ErrorKind::Lagged.into()
    }
}

impl Error {
    /// Wraps a radio failure with the operation it interrupted.
    pub(crate) fn radio(operation: OperationKind, error: bleman_radio::Error) -> Self {
        Error {
            data: ErrorData::Radio { operation, error },
        }
    }

    /// If the radio stack reported this error, returns a reference to its error.
    pub fn get_ref(&self) -> Option<&bleman_radio::Error> {
        match &self.data {
            ErrorData::Radio { error, .. } => Some(error),
            ErrorData::Simple(_) => None,
        }
    }

    /// If the radio stack reported this error, returns its error.
    pub fn into_inner(self) -> Option<bleman_radio::Error> {
        match self.data {
            ErrorData::Radio { error, .. } => Some(error),
            ErrorData::Simple(_) => None,
        }
    }

    /// The operation the radio was performing when it failed.
    pub fn operation(&self) -> Option<OperationKind> {
        match &self.data {
            ErrorData::Radio { operation, .. } => Some(*operation),
            ErrorData::Simple(_) => None,
        }
    }

    /// Returns the kind of error.
    pub fn kind(&self) -> ErrorKind {
        match &self.data {
            ErrorData::Radio { error, .. } => error.kind().into(),
            ErrorData::Simple(kind) => *kind,
        }
    }
}

impl From<bleman_radio::error::ErrorKind> for ErrorKind {
    fn from(kind: bleman_radio::error::ErrorKind) -> Self {
        match kind {
            bleman_radio::error::ErrorKind::Busy => ErrorKind::Busy,
            kind => ErrorKind::Radio(kind),
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::NotFound => f.write_str("peripheral not found"),
            ErrorKind::AlreadyInState => f.write_str("already in state"),
            ErrorKind::Busy => f.write_str("radio busy"),
            ErrorKind::Timeout => f.write_str("timed out"),
            ErrorKind::ConnectionLost => f.write_str("connection lost"),
            ErrorKind::NotConnected => f.write_str("not connected"),
            ErrorKind::Unavailable => f.write_str("adapter unavailable"),
            ErrorKind::Radio(kind) => kind.fmt(f),
            ErrorKind::Canceled => f.write_str("canceled"),
            ErrorKind::Lagged => f.write_str("lagged"),
        }
    }
}

#[cfg(test)]
mod tests {
    use bleman_radio::error::{AttError, ErrorKind as RadioErrorKind};

    use super::*;

    #[test]
    fn radio_errors_keep_operation_context() {
        let err = Error::radio(
            OperationKind::Read,
            bleman_radio::Error::from(AttError::READ_NOT_PERMITTED),
        );
        assert_eq!(err.kind(), ErrorKind::Radio(RadioErrorKind::Att(AttError::READ_NOT_PERMITTED)));
        assert_eq!(err.operation(), Some(OperationKind::Read));
        assert_eq!(err.to_string(), "read failed: read not permitted");
    }

    #[test]
    fn radio_busy_surfaces_as_busy() {
        let err = Error::radio(OperationKind::Write, RadioErrorKind::Busy.into());
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert!(err.get_ref().is_some());
    }
}
