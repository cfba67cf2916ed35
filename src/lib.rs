//! Slotwarden - session-based booking workflow engine
//!
//! Drives one account at a time through a gated, multi-page booking flow:
//! challenge page, login, region and location selection, form pages, an
//! availability view that is polled until a slot opens, and confirmation.
//! Every transition is recorded in a durable per-account ledger.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`workflow`] - The ordered step table and the per-session state machine
//! - [`ledger`] - Status taxonomy, audit history and atomic persistence
//! - [`retry`] - Bounded retries around flaky preconditions
//! - [`monitor`] - Time-bounded availability polling
//! - [`timing`] - Randomised pacing between page actions
//! - [`notify`] - Anomaly notifications and the alert log
//! - [`runner`] - Concurrent sessions with a shared ledger
//! - [`driver`] - The page-automation collaborator interface
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Error types and failure classification
//! - [`testing`] - Scripted page and sink doubles
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use slotwarden::{AlertLogSink, BotConfig, StatusLedger, WorkflowEngine};
//!
//! let config = Arc::new(BotConfig::load(".".as_ref())?);
//! let results = config.results_dir_in(".".as_ref());
//! let ledger = Arc::new(StatusLedger::open(&results)?);
//! let sink = Arc::new(AlertLogSink::new(&results));
//!
//! let engine = WorkflowEngine::new(config, page, ledger, sink);
//! let booking = engine.run("a@x.com", "secret", "PAR").await?;
//! ```

pub mod artifacts;
pub mod config;
pub mod driver;
pub mod error;
pub mod ledger;
pub mod monitor;
pub mod notify;
pub mod retry;
pub mod runner;
pub mod signals;
pub mod testing;
pub mod timing;
pub mod workflow;

// Re-export commonly used types
pub use error::{FailureKind, Result, SlotError};

pub use artifacts::{save_booking, BookingRecord};
pub use config::{BotConfig, DelayRange, LocationConfig, Selectors};
pub use driver::{DriverError, Element, ElementState, PageDriver, WaitPolicy};
pub use ledger::{AccountRecord, AccountStatus, HistoryEntry, StatusLedger};
pub use monitor::{AvailabilityMonitor, MonitorOutcome};
pub use notify::{AlertLogSink, Anomaly, NotificationSink};
pub use retry::{RetryGovernor, RetryPolicy};
pub use runner::{PageFactory, RunReport, RunRequest, SessionRunner};
pub use timing::TimingPolicy;
pub use workflow::{AccountSession, Step, WorkflowEngine};
