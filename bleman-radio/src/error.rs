use std::fmt::Display;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

/// A failure reported by the radio stack.
#[derive(Debug, Clone)]
pub struct Error {
    data: ErrorData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// The peer answered with an ATT error response.
    Att(AttError),
    /// The controller reported a non-zero HCI status.
    Hci(u8),
    /// The stack has no free resources for another command.
    Busy,
    /// The stack does not implement the requested command.
    NotSupported,
    Other,
}

/// An ATT protocol error code (Core Specification Vol 3, Part F, §3.4.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttError(pub u8);

impl AttError {
    pub const INVALID_HANDLE: Self = Self(0x01);
    pub const READ_NOT_PERMITTED: Self = Self(0x02);
    pub const WRITE_NOT_PERMITTED: Self = Self(0x03);
    pub const INVALID_PDU: Self = Self(0x04);
    pub const INSUFFICIENT_AUTHENTICATION: Self = Self(0x05);
    pub const REQUEST_NOT_SUPPORTED: Self = Self(0x06);
    pub const INVALID_OFFSET: Self = Self(0x07);
    pub const INSUFFICIENT_AUTHORIZATION: Self = Self(0x08);
    pub const PREPARE_QUEUE_FULL: Self = Self(0x09);
    pub const ATTRIBUTE_NOT_FOUND: Self = Self(0x0a);
    pub const ATTRIBUTE_NOT_LONG: Self = Self(0x0b);
    pub const ENCRYPTION_KEY_SIZE_TOO_SHORT: Self = Self(0x0c);
    pub const INVALID_ATTRIBUTE_VALUE_LENGTH: Self = Self(0x0d);
    pub const UNLIKELY_ERROR: Self = Self(0x0e);
    pub const INSUFFICIENT_ENCRYPTION: Self = Self(0x0f);
    pub const UNSUPPORTED_GROUP_TYPE: Self = Self(0x10);
    pub const INSUFFICIENT_RESOURCES: Self = Self(0x11);
    pub const DATABASE_OUT_OF_SYNC: Self = Self(0x12);
    pub const VALUE_NOT_ALLOWED: Self = Self(0x13);
}

#[derive(Debug, Clone)]
enum ErrorData {
    Stack {
        kind: ErrorKind,
        message: Arc<str>,
    },
    Simple(ErrorKind),
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.data {
            ErrorData::Stack { kind, message } => write!(f, "{kind}: {message}"),
            ErrorData::Simple(kind) => kind.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error {
            data: ErrorData::Simple(kind),
        }
    }
}

impl From<AttError> for Error {
    fn from(error: AttError) -> Self {
        ErrorKind::Att(error).into()
    }
}

impl Error {
    /// Creates an error carrying the stack's own description of the failure.
    pub fn new(kind: ErrorKind, message: impl Into<Arc<str>>) -> Self {
        Error {
            data: ErrorData::Stack {
                kind,
                message: message.into(),
            },
        }
    }

    /// The stack's description, if one was provided.
    pub fn message(&self) -> Option<&str> {
        match &self.data {
            ErrorData::Stack { message, .. } => Some(message),
            ErrorData::Simple(_) => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match &self.data {
            ErrorData::Stack { kind, .. } => *kind,
            ErrorData::Simple(kind) => *kind,
        }
    }
}

impl Display for AttError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            AttError::INVALID_HANDLE => f.write_str("invalid handle"),
            AttError::READ_NOT_PERMITTED => f.write_str("read not permitted"),
            AttError::WRITE_NOT_PERMITTED => f.write_str("write not permitted"),
            AttError::INVALID_PDU => f.write_str("invalid PDU"),
            AttError::INSUFFICIENT_AUTHENTICATION => f.write_str("insufficient authentication"),
            AttError::REQUEST_NOT_SUPPORTED => f.write_str("request not supported"),
            AttError::INVALID_OFFSET => f.write_str("invalid offset"),
            AttError::INSUFFICIENT_AUTHORIZATION => f.write_str("insufficient authorization"),
            AttError::PREPARE_QUEUE_FULL => f.write_str("prepare queue full"),
            AttError::ATTRIBUTE_NOT_FOUND => f.write_str("attribute not found"),
            AttError::ATTRIBUTE_NOT_LONG => f.write_str("attribute not long"),
            AttError::ENCRYPTION_KEY_SIZE_TOO_SHORT => {
                f.write_str("encryption key size too short")
            }
            AttError::INVALID_ATTRIBUTE_VALUE_LENGTH => {
                f.write_str("invalid attribute value length")
            }
            AttError::UNLIKELY_ERROR => f.write_str("unlikely error"),
            AttError::INSUFFICIENT_ENCRYPTION => f.write_str("insufficient encryption"),
            AttError::UNSUPPORTED_GROUP_TYPE => f.write_str("unsupported group type"),
            AttError::INSUFFICIENT_RESOURCES => f.write_str("insufficient resources"),
            AttError::DATABASE_OUT_OF_SYNC => f.write_str("database out of sync"),
            AttError::VALUE_NOT_ALLOWED => f.write_str("value not allowed"),
            AttError(code @ 0x80..=0x9f) => write!(f, "application error ({code:#04x})"),
            AttError(code) => write!(f, "unknown ATT error ({code:#04x})"),
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Att(att_error) => att_error.fmt(f),
            ErrorKind::Hci(status) => write!(f, "HCI status {status:#04x}"),
            ErrorKind::Busy => f.write_str("radio busy"),
            ErrorKind::NotSupported => f.write_str("operation not supported"),
            ErrorKind::Other => f.write_str("other error"),
        }
    }
}
