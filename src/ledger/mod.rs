//! Status ledger: per-account audit trail and current-status snapshot.
//!
//! # Architecture
//!
//! ```text
//! StatusLedger
//!   ├── accounts: identity -> AccountRecord
//!   │     ├── status, success, last_error, total_attempts, last_updated
//!   │     └── history: [HistoryEntry]  (append-only)
//!   └── store: LedgerStore (account_history.json, rewritten on every update)
//! ```
//!
//! # Durability
//!
//! [`StatusLedger::record_status`] writes the complete snapshot before it
//! returns. A status that anyone can observe has therefore already been
//! persisted; a crash loses at most the step that was in flight.
//!
//! Writes are serialised through one mutex per ledger, so the last writer for
//! an identity always sees that identity's full history.

pub mod persistence;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SlotError};
use crate::workflow::Step;
pub use persistence::{LedgerSnapshot, LedgerStore, LEDGER_FILE};

/// Status taxonomy for an account run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    /// Run started, not yet authenticated.
    Initializing,
    /// Authentication failed (terminal).
    LoginFailed,
    /// Authenticated.
    LoggedIn,
    /// Moving through the booking pages.
    Booking,
    /// Reached the payment page (terminal, success).
    Booked,
    /// Generic failure (terminal).
    Failed,
    /// Challenge page never cleared (terminal).
    ChallengeBlocked,
    /// No slot could be booked (terminal).
    BookingFailed,
    /// Availability view unreadable (terminal).
    CalendarError,
    /// Session no longer authenticated (terminal).
    SessionExpired,
    /// Transport failure (terminal).
    NetworkError,
    /// Site under maintenance (terminal).
    SiteMaintenance,
}

impl AccountStatus {
    /// Wire name, e.g. `LOGIN_FAILED`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::LoginFailed => "LOGIN_FAILED",
            Self::LoggedIn => "LOGGED_IN",
            Self::Booking => "BOOKING",
            Self::Booked => "BOOKED",
            Self::Failed => "FAILED",
            Self::ChallengeBlocked => "CHALLENGE_BLOCKED",
            Self::BookingFailed => "BOOKING_FAILED",
            Self::CalendarError => "CALENDAR_ERROR",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::NetworkError => "NETWORK_ERROR",
            Self::SiteMaintenance => "SITE_MAINTENANCE",
        }
    }

    /// No further steps run after a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Initializing | Self::LoggedIn | Self::Booking)
    }

    /// The single success status.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Booked)
    }

    /// Terminal and not success.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.is_terminal() && !self.is_success()
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub status: AccountStatus,
    pub details: String,
    /// Label of the step the run was on.
    pub step: String,
    /// Per-account counter, starting at 1.
    pub attempt: u64,
}

/// Aggregate view of one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub status: AccountStatus,
    pub history: Vec<HistoryEntry>,
    pub last_updated: DateTime<Utc>,
    pub total_attempts: u64,
    pub last_error: Option<String>,
    pub success: bool,
}

impl AccountRecord {
    /// An empty record.
    #[must_use]
    pub fn new(status: AccountStatus, now: DateTime<Utc>) -> Self {
        Self {
            status,
            history: Vec::new(),
            last_updated: now,
            total_attempts: 0,
            last_error: None,
            success: false,
        }
    }

    /// The most recent history entry.
    #[must_use]
    pub fn last_entry(&self) -> Option<&HistoryEntry> {
        self.history.last()
    }
}

/// Append-only status history for every identity, persisted on each update.
#[derive(Debug)]
pub struct StatusLedger {
    store: Option<LedgerStore>,
    accounts: Mutex<LedgerSnapshot>,
}

impl StatusLedger {
    /// Open the ledger in `dir`, loading any existing history.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let store = LedgerStore::new(dir);
        let accounts = store.load()?;
        Ok(Self {
            store: Some(store),
            accounts: Mutex::new(accounts),
        })
    }

    /// A ledger that is never written to disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            store: None,
            accounts: Mutex::new(LedgerSnapshot::new()),
        }
    }

    /// Path of the persisted ledger, if any.
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        self.store.as_ref().map(LedgerStore::ledger_file_path)
    }

    fn accounts(&self) -> Result<MutexGuard<'_, LedgerSnapshot>> {
        self.accounts.lock().map_err(|_| SlotError::LockPoisoned {
            what: "status ledger".to_string(),
        })
    }

    /// Put `record` in place for `identity` and persist the whole ledger.
    ///
    /// If the save fails the previous record is restored, so readers never
    /// see a state that is not on disk.
    fn commit(
        &self,
        accounts: &mut LedgerSnapshot,
        identity: &str,
        record: AccountRecord,
    ) -> Result<()> {
        let Some(store) = &self.store else {
            accounts.insert(identity.to_string(), record);
            return Ok(());
        };

        let previous = accounts.insert(identity.to_string(), record);
        if let Err(e) = store.save(accounts) {
            match previous {
                Some(previous) => accounts.insert(identity.to_string(), previous),
                None => accounts.remove(identity),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Mark the start of a new run for `identity`.
    ///
    /// A previous run's success flag does not carry over. Unknown identities
    /// are left alone until their first recorded status.
    pub fn begin_run(&self, identity: &str) -> Result<()> {
        let mut accounts = self.accounts()?;
        let Some(record) = accounts.get(identity).filter(|r| r.success) else {
            return Ok(());
        };

        let mut record = record.clone();
        record.success = false;
        self.commit(&mut accounts, identity, record)
    }

    /// Record a status change for `identity`.
    ///
    /// `step_index` is the engine's current step; it is stamped on the entry
    /// as the step label (`"Unknown"` when out of range). The full ledger is
    /// persisted before the change becomes visible; on a failed save the
    /// ledger is unchanged.
    pub fn record_status(
        &self,
        identity: &str,
        step_index: usize,
        status: AccountStatus,
        details: impl Into<String>,
    ) -> Result<HistoryEntry> {
        let details = details.into();
        let now = Utc::now();
        let step = Step::label_for(step_index).to_string();

        let mut accounts = self.accounts()?;
        let mut record = accounts
            .get(identity)
            .cloned()
            .unwrap_or_else(|| AccountRecord::new(status, now));

        record.status = status;
        record.total_attempts += 1;
        if status.is_success() {
            record.success = true;
        } else if status.is_failure() {
            record.last_error = Some(details.clone());
        }

        let entry = HistoryEntry {
            timestamp: now,
            status,
            details,
            step,
            attempt: record.total_attempts,
        };
        record.history.push(entry.clone());
        record.last_updated = now;

        self.commit(&mut accounts, identity, record)?;
        drop(accounts);

        info!(
            identity = identity,
            status = %status,
            step = %entry.step,
            "Account {} status updated to {}: {}",
            identity,
            status,
            entry.details
        );

        Ok(entry)
    }

    /// Current record for `identity`.
    pub fn get(&self, identity: &str) -> Result<Option<AccountRecord>> {
        Ok(self.accounts()?.get(identity).cloned())
    }

    /// A copy of every record.
    pub fn snapshot(&self) -> Result<LedgerSnapshot> {
        Ok(self.accounts()?.clone())
    }

    /// Re-read the persisted ledger, replacing the in-memory view.
    pub fn reload(&self) -> Result<()> {
        if let Some(store) = &self.store {
            let loaded = store.load()?;
            *self.accounts()? = loaded;
        }
        Ok(())
    }

    /// Human-readable report for `identity`.
    ///
    /// Unknown identities get a "no history" line rather than an error.
    pub fn report(&self, identity: &str) -> Result<String> {
        Ok(match self.accounts()?.get(identity) {
            Some(record) => render_report(identity, record),
            None => no_history(identity),
        })
    }
}

/// Sentinel report line for an identity with no history.
#[must_use]
pub fn no_history(identity: &str) -> String {
    format!("No history found for account {identity}")
}

/// Render the report for one record.
#[must_use]
pub fn render_report(identity: &str, record: &AccountRecord) -> String {
    let mut lines = vec![
        format!("Account Report for {identity}"),
        format!("Current Status: {}", record.status),
        format!("Total Attempts: {}", record.total_attempts),
        format!("Last Updated: {}", record.last_updated.to_rfc3339()),
        format!("Success: {}", if record.success { "Yes" } else { "No" }),
    ];

    if let Some(err) = &record.last_error {
        lines.push(format!("Last Error: {err}"));
    }

    lines.push("\nDetailed History:".to_string());

    for entry in &record.history {
        lines.push(format!("\n[{}]", entry.timestamp.to_rfc3339()));
        lines.push(format!("Attempt #{}", entry.attempt));
        lines.push(format!("Status: {}", entry.status));
        lines.push(format!("Step: {}", entry.step));
        if !entry.details.is_empty() {
            lines.push(format!("Details: {}", entry.details));
        }
    }

    lines.join("\n")
}
