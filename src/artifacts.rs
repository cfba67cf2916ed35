//! Success artifacts written when a run reaches the payment page.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SlotError};

/// Evidence that a run reached the payment page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRecord {
    pub identity: String,
    /// Canonical location code.
    pub location: String,
    pub timestamp: DateTime<Utc>,
    /// URL of the final (payment) page.
    pub page_url: String,
}

impl BookingRecord {
    /// Create a record stamped with the current time.
    pub fn new(
        identity: impl Into<String>,
        location: impl Into<String>,
        page_url: impl Into<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            location: location.into(),
            timestamp: Utc::now(),
            page_url: page_url.into(),
        }
    }

    /// Base file name, `booking_YYYYmmdd_HHMMSS`.
    #[must_use]
    pub fn file_stem(&self) -> String {
        format!("booking_{}", self.timestamp.format("%Y%m%d_%H%M%S"))
    }
}

/// Write `record` into `dir` as a new JSON file and return its path.
///
/// Existing artifacts are never overwritten; a second booking within the same
/// second gets a numeric suffix.
pub fn save_booking(dir: &Path, record: &BookingRecord) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let json = serde_json::to_string_pretty(record)?;
    let stem = record.file_stem();

    for n in 0..100u32 {
        let name = if n == 0 {
            format!("{stem}.json")
        } else {
            format!("{stem}_{n}.json")
        };
        let path = dir.join(name);

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(json.as_bytes())?;
                file.sync_all()?;
                info!("Booking record saved to {}", path.display());
                return Ok(path);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Err(SlotError::persistence(format!(
        "Too many booking records named {stem} in {}",
        dir.display()
    )))
}
