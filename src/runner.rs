//! Concurrent session runner.
//!
//! Runs many account sessions at once, each with its own page, bounded by
//! `maxConcurrentSessions`. Sessions share the ledger, the notification sink
//! and one cancellation token; nothing else crosses session boundaries.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::artifacts::BookingRecord;
use crate::config::BotConfig;
use crate::driver::{DriverResult, PageDriver};
use crate::error::{FailureKind, Result, SlotError};
use crate::ledger::{AccountStatus, StatusLedger};
use crate::notify::NotificationSink;
use crate::timing::TimingPolicy;
use crate::workflow::WorkflowEngine;

/// Opens one isolated page per session.
#[async_trait]
pub trait PageFactory: Send + Sync {
    /// Open a fresh page for `identity`.
    async fn open(&self, identity: &str) -> DriverResult<Arc<dyn PageDriver>>;

    /// Called once the session for `identity` has finished with its page.
    async fn release(&self, _identity: &str) {}
}

/// One session to run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub identity: String,
    pub secret: String,
    pub location: String,
}

impl RunRequest {
    pub fn new(
        identity: impl Into<String>,
        secret: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            secret: secret.into(),
            location: location.into(),
        }
    }
}

/// Result of one session.
#[derive(Debug)]
pub struct RunReport {
    pub identity: String,
    pub location: String,
    pub outcome: Result<BookingRecord>,
}

impl RunReport {
    /// Whether the payment page was reached.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Terminal status of the session.
    #[must_use]
    pub fn status(&self) -> AccountStatus {
        match &self.outcome {
            Ok(_) => AccountStatus::Booked,
            Err(e) => e.status(),
        }
    }
}

/// Runs sessions concurrently under a shared ledger and sink.
pub struct SessionRunner {
    config: Arc<BotConfig>,
    factory: Arc<dyn PageFactory>,
    ledger: Arc<StatusLedger>,
    sink: Arc<dyn NotificationSink>,
    timing: Arc<TimingPolicy>,
    results_dir: PathBuf,
    cancel: CancellationToken,
}

impl SessionRunner {
    pub fn new(
        config: Arc<BotConfig>,
        factory: Arc<dyn PageFactory>,
        ledger: Arc<StatusLedger>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let timing = Arc::new(TimingPolicy::new(config.timing.clone()));
        let results_dir = config.results_dir.clone();
        Self {
            config,
            factory,
            ledger,
            sink,
            timing,
            results_dir,
            cancel: CancellationToken::new(),
        }
    }

    /// Use a specific timing policy for every session.
    #[must_use]
    pub fn with_timing(mut self, timing: Arc<TimingPolicy>) -> Self {
        self.timing = timing;
        self
    }

    /// Share `cancel` with every session.
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

    /// Token observed by every session.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run every request and return one report per request, in input order.
    ///
    /// Requests still waiting for a slot when cancellation fires are not
    /// started and report a cancelled outcome without a ledger entry.
    pub async fn run_all(&self, requests: Vec<RunRequest>) -> Vec<RunReport> {
        let limit = self.config.max_concurrent_sessions.max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        info!(
            "Running {} sessions, at most {} at a time",
            requests.len(),
            limit
        );

        let handles: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let semaphore = Arc::clone(&semaphore);
                let session = SessionTask {
                    config: Arc::clone(&self.config),
                    factory: Arc::clone(&self.factory),
                    ledger: Arc::clone(&self.ledger),
                    sink: Arc::clone(&self.sink),
                    timing: Arc::clone(&self.timing),
                    results_dir: self.results_dir.clone(),
                    cancel: self.cancel.clone(),
                };
                let identity = request.identity.clone();
                let location = request.location.clone();
                let handle = tokio::spawn(async move {
                    let permit = tokio::select! {
                        biased;
                        () = session.cancel.cancelled() => None,
                        permit = semaphore.acquire_owned() => permit.ok(),
                    };
                    let Some(_permit) = permit else {
                        info!("Skipping {}: shutdown requested", request.identity);
                        let err = SlotError::classified(
                            FailureKind::Cancelled,
                            "Cancelled before the session started",
                        );
                        return failed(request, err);
                    };
                    session.run(request).await
                });
                (identity, location, handle)
            })
            .collect();

        let (meta, handles): (Vec<_>, Vec<_>) = handles
            .into_iter()
            .map(|(identity, location, handle)| ((identity, location), handle))
            .unzip();

        join_all(handles)
            .await
            .into_iter()
            .zip(meta)
            .map(|(joined, (identity, location))| {
                joined.unwrap_or_else(|e| {
                    error!("Session task for {} panicked: {}", identity, e);
                    RunReport {
                        identity,
                        location,
                        outcome: Err(SlotError::classified(
                            FailureKind::Unexpected,
                            format!("Session task panicked: {e}"),
                        )),
                    }
                })
            })
            .collect()
    }
}

fn failed(request: RunRequest, err: SlotError) -> RunReport {
    RunReport {
        identity: request.identity,
        location: request.location,
        outcome: Err(err),
    }
}

/// Everything one spawned session owns.
struct SessionTask {
    config: Arc<BotConfig>,
    factory: Arc<dyn PageFactory>,
    ledger: Arc<StatusLedger>,
    sink: Arc<dyn NotificationSink>,
    timing: Arc<TimingPolicy>,
    results_dir: PathBuf,
    cancel: CancellationToken,
}

impl SessionTask {
    async fn run(self, request: RunRequest) -> RunReport {
        let page = match self.factory.open(&request.identity).await {
            Ok(page) => page,
            Err(e) => {
                let err = SlotError::from(e);
                warn!("Could not open a page for {}: {}", request.identity, err);
                if let Err(record_err) =
                    self.ledger
                        .record_status(&request.identity, 0, err.status(), err.to_string())
                {
                    return failed(request, record_err);
                }
                return failed(request, err);
            }
        };

        let engine = WorkflowEngine::new(
            self.config,
            page,
            self.ledger,
            self.sink,
        )
        .with_timing(self.timing)
        .with_results_dir(self.results_dir)
        .with_cancellation(self.cancel);

        let outcome = engine
            .run(&request.identity, &request.secret, &request.location)
            .await;
        self.factory.release(&request.identity).await;

        RunReport {
            identity: request.identity,
            location: request.location,
            outcome,
        }
    }
}
