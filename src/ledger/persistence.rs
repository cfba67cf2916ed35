//! On-disk form of the status ledger.
//!
//! ```text
//! <results>/account_history.json          identity -> AccountRecord
//! <results>/account_history.json.lock     fs2 lock: writers exclusive, readers shared
//! <results>/account_history.json.tmp      next snapshot, renamed over the ledger
//! <results>/account_history.json.corrupt  last ledger that failed to parse
//! ```
//!
//! The ledger is small and rewritten wholesale on every status change, so a
//! reader only ever sees a complete snapshot: either the one before a write or
//! the one after it.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use super::AccountRecord;
use crate::error::{Result, SlotError};

/// Ledger file name.
pub const LEDGER_FILE: &str = "account_history.json";

/// Persisted form of the ledger: identity to record.
pub type LedgerSnapshot = BTreeMap<String, AccountRecord>;

/// Reads and writes `account_history.json` in one results directory.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    dir: PathBuf,
}

impl LedgerStore {
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Results directory holding the ledger.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn ledger_file_path(&self) -> PathBuf {
        self.dir.join(LEDGER_FILE)
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{LEDGER_FILE}.{suffix}"))
    }

    /// Staging file for the next snapshot.
    #[must_use]
    pub fn tmp_file_path(&self) -> PathBuf {
        self.sibling("tmp")
    }

    /// Lock file shared by every process writing this ledger.
    #[must_use]
    pub fn lock_file_path(&self) -> PathBuf {
        self.sibling("lock")
    }

    /// Where an unparseable ledger is moved.
    #[must_use]
    pub fn quarantine_path(&self) -> PathBuf {
        self.sibling("corrupt")
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.ledger_file_path().exists()
    }

    /// Replace the ledger with `snapshot`.
    ///
    /// Returns only after the new snapshot is synced and renamed into place;
    /// on error the previous ledger file is untouched.
    pub fn save(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        let json = serde_json::to_vec_pretty(snapshot)?;

        fs::create_dir_all(&self.dir)?;
        let _guard = self.lock_exclusive()?;

        let staging = self.tmp_file_path();
        let mut file = File::create(&staging)?;
        file.write_all(&json)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&staging, self.ledger_file_path())?;
        debug!(
            "Ledger saved ({} accounts) to {}",
            snapshot.len(),
            self.ledger_file_path().display()
        );
        Ok(())
    }

    /// Read the ledger; a missing file is an empty ledger.
    ///
    /// A ledger that no longer parses is moved to [`Self::quarantine_path`]
    /// with a warning and an empty ledger is returned, so history written
    /// from now on is not mixed with the damaged file.
    pub fn load(&self) -> Result<LedgerSnapshot> {
        let _guard = self.lock_shared()?;

        let bytes = match fs::read(self.ledger_file_path()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LedgerSnapshot::new()),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                self.quarantine(&e);
                Ok(LedgerSnapshot::new())
            }
        }
    }

    fn quarantine(&self, cause: &serde_json::Error) {
        let aside = self.quarantine_path();
        warn!(
            "Ledger {} is unreadable ({}); moving it to {} and starting empty",
            self.ledger_file_path().display(),
            cause,
            aside.display()
        );
        if let Err(e) = fs::rename(self.ledger_file_path(), &aside) {
            warn!("Could not move the unreadable ledger aside: {}", e);
        }
    }

    fn lock_exclusive(&self) -> Result<File> {
        let file = File::create(self.lock_file_path())?;
        file.lock_exclusive()
            .map_err(|e| SlotError::persistence(format!("Ledger lock unavailable: {e}")))?;
        Ok(file)
    }

    /// Shared lock, if any writer has ever created the lock file.
    fn lock_shared(&self) -> Result<Option<File>> {
        let file = match File::open(self.lock_file_path()) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        file.lock_shared()
            .map_err(|e| SlotError::persistence(format!("Ledger lock unavailable: {e}")))?;
        Ok(Some(file))
    }
}
