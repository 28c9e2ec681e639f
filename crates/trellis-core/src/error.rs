//! Status codes and error types.

use core::fmt;

/// Terminal status codes for a call.
///
/// These are the canonical RPC status codes; `Ok` is 0 so that a call that
/// finishes without anyone setting a status can still report something
/// meaningful (`Unknown`) distinct from success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl StatusCode {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Cancelled),
            2 => Some(Self::Unknown),
            3 => Some(Self::InvalidArgument),
            4 => Some(Self::DeadlineExceeded),
            5 => Some(Self::NotFound),
            6 => Some(Self::AlreadyExists),
            7 => Some(Self::PermissionDenied),
            8 => Some(Self::ResourceExhausted),
            9 => Some(Self::FailedPrecondition),
            10 => Some(Self::Aborted),
            11 => Some(Self::OutOfRange),
            12 => Some(Self::Unimplemented),
            13 => Some(Self::Internal),
            14 => Some(Self::Unavailable),
            15 => Some(Self::DataLoss),
            16 => Some(Self::Unauthenticated),
            _ => None,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Unknown => write!(f, "unknown"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::NotFound => write!(f, "not found"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::ResourceExhausted => write!(f, "resource exhausted"),
            Self::FailedPrecondition => write!(f, "failed precondition"),
            Self::Aborted => write!(f, "aborted"),
            Self::OutOfRange => write!(f, "out of range"),
            Self::Unimplemented => write!(f, "unimplemented"),
            Self::Internal => write!(f, "internal error"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::DataLoss => write!(f, "data loss"),
            Self::Unauthenticated => write!(f, "unauthenticated"),
        }
    }
}

/// Synchronous errors returned when a batch is submitted.
///
/// These never mutate shared state beyond rolling back the ops being
/// submitted; the batch as a whole is rejected or accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    /// An op of this kind is already in flight on the call.
    TooManyOperations,
    /// An op of this kind was already performed and cannot repeat.
    AlreadyInvoked,
    /// Application-supplied metadata is not legal header content.
    InvalidMetadata,
    /// Unknown bits set in an op's flags field.
    InvalidFlags,
    /// More ops in one batch than the engine supports.
    BatchTooBig { count: usize, max: usize },
    /// The op is not valid for this side of the call (e.g. sending a
    /// status from a client).
    WrongCallRole,
    /// A send-message payload that cannot be framed.
    InvalidMessage,
    /// The call was already destroyed.
    AlreadyShutdown,
    /// No completion queue is bound to the call.
    NoCompletionQueue,
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyOperations => write!(f, "an operation of this kind is already in flight"),
            Self::AlreadyInvoked => write!(f, "operation already invoked on this call"),
            Self::InvalidMetadata => write!(f, "metadata is not legal header content"),
            Self::InvalidFlags => write!(f, "unknown flag bits"),
            Self::BatchTooBig { count, max } => {
                write!(f, "batch of {count} ops exceeds max {max}")
            }
            Self::WrongCallRole => write!(f, "operation not valid for this side of the call"),
            Self::InvalidMessage => write!(f, "send-message payload cannot be framed"),
            Self::AlreadyShutdown => write!(f, "call already destroyed"),
            Self::NoCompletionQueue => write!(f, "no completion queue bound to the call"),
        }
    }
}

impl std::error::Error for BatchError {}

/// The resolved terminal status of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalStatus {
    pub code: StatusCode,
    pub details: Option<String>,
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.details {
            Some(details) => write!(f, "{}: {details}", self.code),
            None => write!(f, "{}", self.code),
        }
    }
}
