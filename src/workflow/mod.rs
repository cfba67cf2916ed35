//! Workflow engine: the ordered step table and the per-session state machine.
//!
//! # Architecture
//!
//! ```text
//! WorkflowEngine::run(identity, secret, location)
//!   ├── ledger.record_status(INITIALIZING, "Starting workflow")
//!   ├── for step in Step::ALL (until PaymentReached)
//!   │     ├── cancellation check (between steps only)
//!   │     ├── steps::execute(step)
//!   │     │     ├── ok  -> current_step += 1, record progress status
//!   │     │     └── err -> classify, record terminal status, return error
//!   └── PaymentReached -> save BookingRecord, record BOOKED
//! ```
//!
//! # Classification
//!
//! A step failure is classified in this order:
//!
//! 1. transport errors (network, navigation) are always `NETWORK_ERROR`
//! 2. errors already carrying a [`FailureKind`] keep it
//! 3. anything else gets the step's default kind ([`Step::default_failure`])
//!
//! The terminal status is written to the ledger before the error is returned.

mod steps;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::artifacts::BookingRecord;
use crate::config::{BotConfig, LocationConfig};
use crate::driver::PageDriver;
use crate::error::{FailureKind, Result, SlotError};
use crate::ledger::{AccountStatus, StatusLedger};
use crate::notify::NotificationSink;
use crate::timing::TimingPolicy;
use steps::StepContext;

/// The canonical ordered step table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Step {
    Initialize,
    BypassChallenge,
    Authenticate,
    VerifyLogin,
    SelectRegion,
    SelectLocation,
    BookingDetail,
    PersonalInfo,
    Calendar,
    Confirmation,
    PaymentReached,
}

impl Step {
    /// Every step, in execution order.
    pub const ALL: [Step; 11] = [
        Step::Initialize,
        Step::BypassChallenge,
        Step::Authenticate,
        Step::VerifyLogin,
        Step::SelectRegion,
        Step::SelectLocation,
        Step::BookingDetail,
        Step::PersonalInfo,
        Step::Calendar,
        Step::Confirmation,
        Step::PaymentReached,
    ];

    /// Label used when a step index is out of range.
    pub const UNKNOWN_LABEL: &'static str = "Unknown";

    /// Position in [`Step::ALL`].
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Step at `index`, if any.
    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Human-readable label.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Initialize => "Initialize",
            Self::BypassChallenge => "BypassChallenge",
            Self::Authenticate => "Authenticate",
            Self::VerifyLogin => "VerifyLogin",
            Self::SelectRegion => "SelectRegion",
            Self::SelectLocation => "SelectLocation",
            Self::BookingDetail => "BookingDetail",
            Self::PersonalInfo => "PersonalInfo",
            Self::Calendar => "Calendar",
            Self::Confirmation => "Confirmation",
            Self::PaymentReached => "PaymentReached",
        }
    }

    /// Label for a step index, or `"Unknown"` when out of range.
    #[must_use]
    pub fn label_for(index: usize) -> &'static str {
        Self::from_index(index).map_or(Self::UNKNOWN_LABEL, Self::label)
    }

    /// The step after this one.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        Self::from_index(self.index() + 1)
    }

    /// Only the payment page ends the sequence.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::PaymentReached
    }

    /// Entry precondition: the session must already be authenticated.
    #[must_use]
    pub fn requires_authentication(self) -> bool {
        self.index() >= Self::VerifyLogin.index()
    }

    /// Status recorded once this step completes.
    #[must_use]
    pub fn progress_status(self) -> AccountStatus {
        match self {
            Self::Initialize | Self::BypassChallenge => AccountStatus::Initializing,
            Self::Authenticate | Self::VerifyLogin => AccountStatus::LoggedIn,
            Self::PaymentReached => AccountStatus::Booked,
            _ => AccountStatus::Booking,
        }
    }

    /// Classification for failures that carry no kind of their own.
    #[must_use]
    pub fn default_failure(self) -> FailureKind {
        match self {
            Self::BypassChallenge => FailureKind::ChallengeUnresolved,
            Self::Authenticate => FailureKind::LoginRejected,
            Self::VerifyLogin => FailureKind::SessionNotAuthenticated,
            Self::Calendar => FailureKind::CalendarUnavailable,
            Self::Confirmation => FailureKind::ConfirmationFailed,
            Self::Initialize
            | Self::SelectRegion
            | Self::SelectLocation
            | Self::BookingDetail
            | Self::PersonalInfo
            | Self::PaymentReached => FailureKind::Unexpected,
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One workflow run for one identity. Never persisted.
#[derive(Debug, Clone)]
pub struct AccountSession {
    pub identity: String,
    /// Location code as requested; replaced by the configured spelling once
    /// resolved.
    pub location_code: String,
    /// Set by the Initialize step.
    pub location: Option<LocationConfig>,
    pub current_step: usize,
    pub status: AccountStatus,
    pub authenticated: bool,
}

impl AccountSession {
    pub fn new(identity: impl Into<String>, location_code: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            location_code: location_code.into(),
            location: None,
            current_step: 0,
            status: AccountStatus::Initializing,
            authenticated: false,
        }
    }

    /// The step the session is on, if in range.
    #[must_use]
    pub fn step(&self) -> Option<Step> {
        Step::from_index(self.current_step)
    }
}

/// Decide the failure kind for an error raised in `step`.
#[must_use]
pub fn classify(step: Step, err: &SlotError) -> FailureKind {
    if err.is_network() {
        return FailureKind::Network;
    }
    err.kind().unwrap_or_else(|| step.default_failure())
}

fn failure_detail(err: &SlotError) -> String {
    match err {
        SlotError::Classified { detail, .. } => detail.clone(),
        other => other.to_string(),
    }
}

/// Drives one session through the step table.
///
/// The engine owns its page exclusively; the ledger and sink may be shared
/// with other engines.
pub struct WorkflowEngine {
    config: Arc<BotConfig>,
    driver: Arc<dyn PageDriver>,
    ledger: Arc<StatusLedger>,
    sink: Arc<dyn NotificationSink>,
    timing: Arc<TimingPolicy>,
    results_dir: PathBuf,
    cancel: CancellationToken,
}

impl WorkflowEngine {
    /// Create an engine with OS-seeded timing, the configured results
    /// directory and a token that is never cancelled.
    pub fn new(
        config: Arc<BotConfig>,
        driver: Arc<dyn PageDriver>,
        ledger: Arc<StatusLedger>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let timing = Arc::new(TimingPolicy::new(config.timing.clone()));
        let results_dir = config.results_dir.clone();
        Self {
            config,
            driver,
            ledger,
            sink,
            timing,
            results_dir,
            cancel: CancellationToken::new(),
        }
    }

    /// Use a specific timing policy.
    #[must_use]
    pub fn with_timing(mut self, timing: Arc<TimingPolicy>) -> Self {
        self.timing = timing;
        self
    }

    /// Observe `cancel` between steps and monitor iterations.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Write booking artifacts into `dir`.
    #[must_use]
    pub fn with_results_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.results_dir = dir.into();
        self
    }

    /// Run the workflow for `identity` against `location_code`.
    ///
    /// Returns the booking record when the payment page is reached. Every
    /// failure is recorded in the ledger before it is returned; the run is
    /// never retried here.
    pub async fn run(&self, identity: &str, secret: &str, location_code: &str) -> Result<BookingRecord> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "session",
            identity = identity,
            location = location_code,
            run_id = %run_id
        );
        self.run_session(identity, secret, location_code)
            .instrument(span)
            .await
    }

    async fn run_session(&self, identity: &str, secret: &str, location_code: &str) -> Result<BookingRecord> {
        let mut session = AccountSession::new(identity, location_code);
        self.ledger.begin_run(identity)?;
        self.ledger
            .record_status(identity, 0, AccountStatus::Initializing, "Starting workflow")?;

        let ctx = StepContext {
            config: &self.config,
            driver: self.driver.as_ref(),
            timing: &self.timing,
            sink: self.sink.as_ref(),
            cancel: &self.cancel,
            results_dir: &self.results_dir,
        };

        for step in Step::ALL {
            session.current_step = step.index();
            info!("Step {}: {}", step.index(), step);

            if self.cancel.is_cancelled() {
                let err = SlotError::classified(
                    FailureKind::Cancelled,
                    format!("Cancelled before {step}"),
                );
                return Err(self.fail(&mut session, step, err));
            }

            if step.requires_authentication() && !session.authenticated {
                let err = SlotError::classified(
                    FailureKind::SessionNotAuthenticated,
                    format!("{step} requires an authenticated session"),
                );
                return Err(self.fail(&mut session, step, err));
            }

            if step.is_terminal() {
                let record = match steps::payment_reached(&ctx, &session).await {
                    Ok(record) => record,
                    Err(e) => return Err(self.fail(&mut session, step, e)),
                };
                session.status = AccountStatus::Booked;
                self.ledger.record_status(
                    identity,
                    session.current_step,
                    AccountStatus::Booked,
                    format!("Reached payment page: {}", record.page_url),
                )?;
                info!("Run complete for {} at {}", identity, record.location);
                return Ok(record);
            }

            if let Err(e) = steps::execute(&ctx, &mut session, step, secret).await {
                return Err(self.fail(&mut session, step, e));
            }

            session.current_step = step.index() + 1;
            session.status = step.progress_status();
            self.ledger.record_status(
                identity,
                session.current_step,
                session.status,
                format!("Completed {step}"),
            )?;
        }

        // The step table always ends with PaymentReached.
        Err(SlotError::classified(
            FailureKind::Unexpected,
            "Step table ended without reaching the payment page",
        ))
    }

    /// Classify `err`, record the terminal status and return the error to
    /// raise. A ledger failure replaces the step error.
    fn fail(&self, session: &mut AccountSession, step: Step, err: SlotError) -> SlotError {
        let kind = classify(step, &err);
        let detail = failure_detail(&err);
        let status = kind.status();
        session.status = status;

        error!(
            step = %step,
            status = %status,
            "Workflow failed at {}: {}",
            step,
            detail
        );

        if let Err(record_err) =
            self.ledger
                .record_status(&session.identity, session.current_step, status, detail.as_str())
        {
            error!("Could not record failure for {}: {}", session.identity, record_err);
            return record_err;
        }

        SlotError::classified(kind, detail)
    }
}
