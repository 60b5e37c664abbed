use thiserror::Error;

/// RPC status codes carried in `grpc-status` trailing metadata.
///
/// The numeric values are wire-visible and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// Call completed successfully.
    Ok,
    /// Call was cancelled by the caller.
    Cancelled,
    /// Unknown error, e.g. a missing or unparseable status.
    Unknown,
    /// Client specified an invalid argument.
    InvalidArgument,
    /// Deadline expired before the call completed.
    DeadlineExceeded,
    /// Requested entity was not found.
    NotFound,
    /// Entity already exists.
    AlreadyExists,
    /// Caller lacks permission.
    PermissionDenied,
    /// A resource (quota, buffer space) has been exhausted.
    ResourceExhausted,
    /// System is not in a state required for the operation.
    FailedPrecondition,
    /// Operation was aborted.
    Aborted,
    /// Operation was attempted past a valid range.
    OutOfRange,
    /// Operation is not implemented by the server.
    Unimplemented,
    /// Internal invariant broken.
    Internal,
    /// Service is currently unavailable; retrying may help.
    Unavailable,
    /// Unrecoverable data loss or corruption.
    DataLoss,
    /// Request lacks valid authentication credentials.
    Unauthenticated,
}

impl StatusCode {
    /// Numeric wire value.
    pub fn code(self) -> i32 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::Cancelled => 1,
            StatusCode::Unknown => 2,
            StatusCode::InvalidArgument => 3,
            StatusCode::DeadlineExceeded => 4,
            StatusCode::NotFound => 5,
            StatusCode::AlreadyExists => 6,
            StatusCode::PermissionDenied => 7,
            StatusCode::ResourceExhausted => 8,
            StatusCode::FailedPrecondition => 9,
            StatusCode::Aborted => 10,
            StatusCode::OutOfRange => 11,
            StatusCode::Unimplemented => 12,
            StatusCode::Internal => 13,
            StatusCode::Unavailable => 14,
            StatusCode::DataLoss => 15,
            StatusCode::Unauthenticated => 16,
        }
    }

    /// Parses a numeric wire value.
    pub fn from_code(code: i32) -> Option<StatusCode> {
        Some(match code {
            0 => StatusCode::Ok,
            1 => StatusCode::Cancelled,
            2 => StatusCode::Unknown,
            3 => StatusCode::InvalidArgument,
            4 => StatusCode::DeadlineExceeded,
            5 => StatusCode::NotFound,
            6 => StatusCode::AlreadyExists,
            7 => StatusCode::PermissionDenied,
            8 => StatusCode::ResourceExhausted,
            9 => StatusCode::FailedPrecondition,
            10 => StatusCode::Aborted,
            11 => StatusCode::OutOfRange,
            12 => StatusCode::Unimplemented,
            13 => StatusCode::Internal,
            14 => StatusCode::Unavailable,
            15 => StatusCode::DataLoss,
            16 => StatusCode::Unauthenticated,
            _ => return None,
        })
    }

    /// Canonical upper-snake name, as used in service-config
    /// `retryableStatusCodes` lists.
    pub fn name(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Aborted => "ABORTED",
            StatusCode::OutOfRange => "OUT_OF_RANGE",
            StatusCode::Unimplemented => "UNIMPLEMENTED",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::DataLoss => "DATA_LOSS",
            StatusCode::Unauthenticated => "UNAUTHENTICATED",
        }
    }

    /// Parses a canonical status name.
    pub fn from_name(name: &str) -> Option<StatusCode> {
        Some(match name {
            "OK" => StatusCode::Ok,
            "CANCELLED" => StatusCode::Cancelled,
            "UNKNOWN" => StatusCode::Unknown,
            "INVALID_ARGUMENT" => StatusCode::InvalidArgument,
            "DEADLINE_EXCEEDED" => StatusCode::DeadlineExceeded,
            "NOT_FOUND" => StatusCode::NotFound,
            "ALREADY_EXISTS" => StatusCode::AlreadyExists,
            "PERMISSION_DENIED" => StatusCode::PermissionDenied,
            "RESOURCE_EXHAUSTED" => StatusCode::ResourceExhausted,
            "FAILED_PRECONDITION" => StatusCode::FailedPrecondition,
            "ABORTED" => StatusCode::Aborted,
            "OUT_OF_RANGE" => StatusCode::OutOfRange,
            "UNIMPLEMENTED" => StatusCode::Unimplemented,
            "INTERNAL" => StatusCode::Internal,
            "UNAVAILABLE" => StatusCode::Unavailable,
            "DATA_LOSS" => StatusCode::DataLoss,
            "UNAUTHENTICATED" => StatusCode::Unauthenticated,
            _ => return None,
        })
    }
}

/// Errors produced and propagated by the client channel.
///
/// The channel never invents statuses outside this vocabulary; transport and
/// metadata errors are wrapped via [`ChannelError::wrap`] so their cause chain
/// is preserved for the retry orchestrator.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// The call was cancelled.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The deadline expired before completion.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The target or a collaborator is unavailable.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// A buffer or quota limit was hit.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// An internal invariant was broken.
    #[error("internal: {0}")]
    Internal(String),

    /// A wrapping error referencing one or more causes.
    #[error("{message}")]
    Referencing {
        /// Description of the wrapping context.
        message: String,
        /// Child errors, most significant first.
        children: Vec<ChannelError>,
    },
}

impl ChannelError {
    /// Wraps `child` with a contextual message.
    pub fn wrap(message: impl Into<String>, child: ChannelError) -> ChannelError {
        ChannelError::Referencing {
            message: message.into(),
            children: vec![child],
        }
    }

    /// Wraps several causes with a contextual message.
    pub fn wrap_all(message: impl Into<String>, children: Vec<ChannelError>) -> ChannelError {
        ChannelError::Referencing {
            message: message.into(),
            children,
        }
    }

    /// The status code this error maps to.
    ///
    /// A referencing error takes the status of its first child.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ChannelError::Cancelled(_) => StatusCode::Cancelled,
            ChannelError::DeadlineExceeded => StatusCode::DeadlineExceeded,
            ChannelError::Unavailable(_) => StatusCode::Unavailable,
            ChannelError::ResourceExhausted(_) => StatusCode::ResourceExhausted,
            ChannelError::Internal(_) => StatusCode::Internal,
            ChannelError::Referencing { children, .. } => children
                .first()
                .map(ChannelError::status_code)
                .unwrap_or(StatusCode::Unknown),
        }
    }
}

/// Result alias used throughout the channel core.
pub type Result<T> = std::result::Result<T, ChannelError>;
