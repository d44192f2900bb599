//! Defines error types.

use std::fmt::Debug;

/// The error type for GATT client operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub(crate) fn new<S: ToString>(kind: ErrorKind, message: S) -> Self {
        Error {
            kind,
            message: message.to_string(),
        }
    }

    /// Returns the corresponding [`ErrorKind`] for this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the message for this error.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Checks if this error means the connection failed, or was lost.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::ConnectionFailed | ErrorKind::NotConnected
        )
    }

    /// Returns the raw status code reported by the radio, if any.
    pub fn status(&self) -> Option<GattStatus> {
        match self.kind {
            ErrorKind::Protocol(status) => Some(status),
            _ => None,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error {
            kind,
            message: String::new(),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", &self.kind)
        } else {
            write!(f, "{}: {}", &self.kind, &self.message)
        }
    }
}

impl std::error::Error for Error {}

/// A list of general categories of GATT client error.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// connection failed
    ConnectionFailed,
    /// the Bluetooth device isn't connected
    NotConnected,
    /// timed out
    Timeout,
    /// not found
    NotFound,
    /// more than one attribute matches the given UUID
    AmbiguousMatch,
    /// the characteristic is not writable
    Unwritable,
    /// protocol error: {0}
    Protocol(GattStatus),
    /// the Bluetooth operation is unsupported
    NotSupported,
    /// the same operation is already in progress
    AlreadyInProgress,
    /// invalid parameter
    InvalidParameter,
    /// an internal error has occured
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::ConnectionFailed => f.write_str("connection failed"),
            ErrorKind::NotConnected => f.write_str("the Bluetooth device isn't connected"),
            ErrorKind::Timeout => f.write_str("timed out"),
            ErrorKind::NotFound => f.write_str("not found"),
            ErrorKind::AmbiguousMatch => {
                f.write_str("more than one attribute matches the given UUID")
            }
            ErrorKind::Unwritable => f.write_str("the characteristic is not writable"),
            ErrorKind::Protocol(status) => write!(f, "protocol error: {status}"),
            ErrorKind::NotSupported => f.write_str("the Bluetooth operation is unsupported"),
            ErrorKind::AlreadyInProgress => f.write_str("the same operation is already in progress"),
            ErrorKind::InvalidParameter => f.write_str("invalid parameter"),
            ErrorKind::Internal => f.write_str("an internal error has occured"),
        }
    }
}

/// Status code reported by the radio stack in a completion callback.
///
/// Values below `0x80` are Attribute Protocol errors (Bluetooth Core Specification,
/// Vol 3, Part F, §3.4.1.1); the rest are stack-specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GattStatus(i32);

impl GattStatus {
    /// The operation completed successfully.
    pub const SUCCESS: GattStatus = GattStatus(0x00);
    /// The attribute cannot be read.
    pub const READ_NOT_PERMITTED: GattStatus = GattStatus(0x02);
    /// The attribute cannot be written.
    pub const WRITE_NOT_PERMITTED: GattStatus = GattStatus(0x03);
    /// The attribute requires authentication before it can be read or written.
    pub const INSUFFICIENT_AUTHENTICATION: GattStatus = GattStatus(0x05);
    /// Attribute server does not support the request received from the client.
    pub const REQUEST_NOT_SUPPORTED: GattStatus = GattStatus(0x06);
    /// Offset specified was past the end of the attribute.
    pub const INVALID_OFFSET: GattStatus = GattStatus(0x07);
    /// The attribute requires authorization before it can be read or written.
    pub const INSUFFICIENT_AUTHORIZATION: GattStatus = GattStatus(0x08);
    /// The attribute value length is invalid for the operation.
    pub const INVALID_ATTRIBUTE_VALUE_LENGTH: GattStatus = GattStatus(0x0d);
    /// The attribute requires encryption before it can be read or written.
    pub const INSUFFICIENT_ENCRYPTION: GattStatus = GattStatus(0x0f);
    /// The server requests the client to rediscover the database.
    pub const DATABASE_OUT_OF_SYNC: GattStatus = GattStatus(0x12);
    /// Internal error of the local stack.
    pub const GATT_INTERNAL_ERROR: GattStatus = GattStatus(0x81);
    /// Generic stack error, typically a dropped link or a stale attribute cache.
    pub const GATT_ERROR: GattStatus = GattStatus(0x85);
    /// The link is congested.
    pub const CONNECTION_CONGESTED: GattStatus = GattStatus(0x8f);
    /// The operation failed for an unspecified reason.
    pub const GATT_FAILURE: GattStatus = GattStatus(0x101);

    /// Converts a raw status code to a [`GattStatus`].
    pub const fn from_raw(val: i32) -> Self {
        GattStatus(val)
    }

    /// Returns the raw status code.
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Checks if the status reports success.
    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }

    /// Checks if the status belongs to the class of failures caused by a stale
    /// attribute cache on the local side.
    pub fn is_stale_cache_failure(&self) -> bool {
        matches!(
            *self,
            Self::GATT_INTERNAL_ERROR | Self::GATT_ERROR | Self::GATT_FAILURE
        )
    }

    /// Checks if the status is an Attribute Protocol error code.
    pub fn is_att_error(&self) -> bool {
        (0x01..0x80).contains(&self.0)
    }
}

impl std::fmt::Display for GattStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            GattStatus::SUCCESS => f.write_str("The operation completed successfully."),
            GattStatus::READ_NOT_PERMITTED => f.write_str("The attribute cannot be read."),
            GattStatus::WRITE_NOT_PERMITTED => f.write_str("The attribute cannot be written."),
            GattStatus::INSUFFICIENT_AUTHENTICATION => f.write_str("The attribute requires authentication before it can be read or written."),
            GattStatus::REQUEST_NOT_SUPPORTED => f.write_str("Attribute server does not support the request received from the client."),
            GattStatus::INVALID_OFFSET => f.write_str("Offset specified was past the end of the attribute."),
            GattStatus::INSUFFICIENT_AUTHORIZATION => f.write_str("The attribute requires authorization before it can be read or written."),
            GattStatus::INVALID_ATTRIBUTE_VALUE_LENGTH => f.write_str("The attribute value length is invalid for the operation."),
            GattStatus::INSUFFICIENT_ENCRYPTION => f.write_str("The attribute requires encryption before it can be read or written."),
            GattStatus::DATABASE_OUT_OF_SYNC => f.write_str("The server requests the client to rediscover the database."),
            GattStatus::GATT_INTERNAL_ERROR => f.write_str("Internal error of the local stack."),
            GattStatus::GATT_ERROR => f.write_str("Generic GATT error."),
            GattStatus::CONNECTION_CONGESTED => f.write_str("The link is congested."),
            GattStatus::GATT_FAILURE => f.write_str("The operation failed."),
            _ => write!(f, "Unknown status 0x{:02x}", self.0),
        }
    }
}

impl From<i32> for GattStatus {
    fn from(number: i32) -> Self {
        GattStatus(number)
    }
}

impl From<GattStatus> for i32 {
    fn from(val: GattStatus) -> Self {
        val.0
    }
}

impl From<GattStatus> for Error {
    fn from(status: GattStatus) -> Self {
        ErrorKind::Protocol(status).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_message() {
        let err = Error::new(ErrorKind::NotFound, "no service 180d");
        assert_eq!(err.to_string(), "not found: no service 180d");

        let err: Error = ErrorKind::Timeout.into();
        assert_eq!(err.to_string(), "timed out");
    }

    #[test]
    fn protocol_error_keeps_raw_status() {
        let err: Error = GattStatus::from_raw(133).into();
        assert_eq!(err.kind(), ErrorKind::Protocol(GattStatus::GATT_ERROR));
        assert_eq!(err.status().map(GattStatus::raw), Some(133));
        assert!(!err.is_connection_error());
    }

    #[test]
    fn stale_cache_class() {
        assert!(GattStatus::GATT_ERROR.is_stale_cache_failure());
        assert!(GattStatus::GATT_INTERNAL_ERROR.is_stale_cache_failure());
        assert!(!GattStatus::READ_NOT_PERMITTED.is_stale_cache_failure());
        assert!(GattStatus::READ_NOT_PERMITTED.is_att_error());
        assert_eq!(GattStatus::from_raw(0x9a).to_string(), "Unknown status 0x9a");
    }
}
