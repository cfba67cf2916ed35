//! Custom error types for slotwarden.
//!
//! Every failure that ends a run is a [`SlotError::Classified`] carrying a
//! [`FailureKind`]; the kind decides which terminal [`AccountStatus`] the
//! ledger records before the error is handed back to the caller.

use std::path::PathBuf;
use thiserror::Error;

use crate::driver::DriverError;
use crate::ledger::AccountStatus;

/// Classified failure tags used for both reporting and control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The login form never appeared within the retry budget.
    LoginFormNotFound,
    /// Credentials were submitted but the site rejected them or never
    /// showed the post-login marker.
    LoginRejected,
    /// A challenge page was still present after the retry budget.
    ChallengeUnresolved,
    /// The authenticated marker is missing after login.
    SessionNotAuthenticated,
    /// The location code is absent from configuration.
    UnknownLocation,
    /// The availability view could not be read.
    CalendarUnavailable,
    /// The availability view was polled to the ceiling without a slot.
    NoAvailability,
    /// The confirm control was missing or the follow-up navigation failed.
    ConfirmationFailed,
    /// Transport level failure; overrides any step classification.
    Network,
    /// The site announced maintenance.
    Maintenance,
    /// The run was asked to stop.
    Cancelled,
    /// Anything else.
    Unexpected,
}

impl FailureKind {
    /// Terminal status recorded for this kind of failure.
    #[must_use]
    pub fn status(&self) -> AccountStatus {
        match self {
            Self::LoginFormNotFound | Self::LoginRejected => AccountStatus::LoginFailed,
            Self::ChallengeUnresolved => AccountStatus::ChallengeBlocked,
            Self::SessionNotAuthenticated => AccountStatus::SessionExpired,
            Self::CalendarUnavailable => AccountStatus::CalendarError,
            Self::NoAvailability | Self::ConfirmationFailed => AccountStatus::BookingFailed,
            Self::Network => AccountStatus::NetworkError,
            Self::Maintenance => AccountStatus::SiteMaintenance,
            Self::UnknownLocation | Self::Cancelled | Self::Unexpected => AccountStatus::Failed,
        }
    }

    /// Stable upper-case tag, e.g. `LOGIN_FORM_NOT_FOUND`.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::LoginFormNotFound => "LOGIN_FORM_NOT_FOUND",
            Self::LoginRejected => "LOGIN_REJECTED",
            Self::ChallengeUnresolved => "CHALLENGE_UNRESOLVED",
            Self::SessionNotAuthenticated => "SESSION_NOT_AUTHENTICATED",
            Self::UnknownLocation => "UNKNOWN_LOCATION",
            Self::CalendarUnavailable => "CALENDAR_UNAVAILABLE",
            Self::NoAvailability => "NO_AVAILABILITY",
            Self::ConfirmationFailed => "CONFIRMATION_FAILED",
            Self::Network => "NETWORK",
            Self::Maintenance => "MAINTENANCE",
            Self::Cancelled => "CANCELLED",
            Self::Unexpected => "UNEXPECTED",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Main error type for slotwarden operations
#[derive(Error, Debug)]
pub enum SlotError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // Workflow Errors
    // =========================================================================
    /// A classified failure that terminates the run
    #[error("{kind}: {detail}")]
    Classified { kind: FailureKind, detail: String },

    /// The page collaborator failed outside of any classifying context
    #[error("Page driver error: {0}")]
    Driver(#[from] DriverError),

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    /// Ledger or artifact persistence failed
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    /// A shared lock was poisoned by a panicking writer
    #[error("Lock poisoned: {what}")]
    LockPoisoned { what: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SlotError {
    /// Create a classified failure
    pub fn classified(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self::Classified {
            kind,
            detail: detail.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create a persistence error
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    /// The failure kind, if this error is classified.
    #[must_use]
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::Classified { kind, .. } => Some(*kind),
            Self::Driver(e) if e.is_transport() => Some(FailureKind::Network),
            _ => None,
        }
    }

    /// Terminal status this error is recorded as.
    #[must_use]
    pub fn status(&self) -> AccountStatus {
        self.kind()
            .map_or(AccountStatus::Failed, |kind| kind.status())
    }

    /// Check if this error is a transport failure
    pub fn is_network(&self) -> bool {
        self.kind() == Some(FailureKind::Network)
    }

    /// Check if this error points at configuration drift
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::InvalidConfig { .. }
                | Self::Classified {
                    kind: FailureKind::UnknownLocation,
                    ..
                }
        )
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            Self::Classified {
                kind: FailureKind::UnknownLocation,
                ..
            } => 7,
            Self::Classified {
                kind: FailureKind::Cancelled,
                ..
            } => 130,
            Self::Persistence { .. } | Self::LockPoisoned { .. } | Self::Io(_) | Self::Json(_) => 3,
            _ => 1,
        }
    }
}

/// Type alias for slotwarden results
pub type Result<T> = std::result::Result<T, SlotError>;
