//! Notification sink adapter.
//!
//! The engine reports anomalies (configuration drift, challenge pages that
//! never clear, login pages that changed shape) through a
//! [`NotificationSink`]. Delivery is best-effort: a failed notification is
//! logged and the run carries on.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, warn};

/// Alert log file name inside the results directory.
pub const ALERT_LOG_FILE: &str = "security_alerts.log";

const SEPARATOR_WIDTH: usize = 50;

/// Receives anomaly notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one notification. Returns `false` if delivery failed.
    async fn notify(&self, issue_type: &str, detail: &str, identity: Option<&str>) -> bool;
}

/// Workflow anomalies that warrant a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    /// The location code is not configured.
    UnknownLocation { code: String },
    /// A challenge page was still present after every retry.
    ChallengeUnresolved { location: String },
    /// The login form never appeared.
    LoginFormChanged,
    /// Login did not produce an authenticated page.
    AuthenticationFailure { reason: String },
    /// The availability view was watched to the ceiling without a match.
    StaleCalendarSelectors,
}

impl Anomaly {
    /// Short issue type used as the alert subject.
    #[must_use]
    pub fn issue_type(&self) -> &'static str {
        match self {
            Self::UnknownLocation { .. } => "Invalid Center",
            Self::ChallengeUnresolved { .. } => "Challenge Detection",
            Self::LoginFormChanged => "Authentication Form Changed",
            Self::AuthenticationFailure { .. } => "Authentication Failure",
            Self::StaleCalendarSelectors => "Calendar Selectors May Have Changed",
        }
    }

    /// Human-readable detail line.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::UnknownLocation { code } => {
                format!("Unknown location code: {code}. The workflow cannot proceed.")
            }
            Self::ChallengeUnresolved { location } => format!(
                "Challenge page on {location} did not clear. The session was likely flagged."
            ),
            Self::LoginFormChanged => "Login form selectors no longer match. The site may have \
                 changed its authentication page."
                .to_string(),
            Self::AuthenticationFailure { reason } => format!(
                "Could not detect a logged-in page ({reason}). The site may have changed its \
                 login flow or the credentials are invalid."
            ),
            Self::StaleCalendarSelectors => "Watched the availability view for the full time \
                 budget without a match. Either nothing is available or the slot selectors \
                 are stale."
                .to_string(),
        }
    }

    /// Build the alert record for this anomaly.
    #[must_use]
    pub fn alert(&self, identity: Option<&str>) -> Alert {
        Alert::new(self.issue_type(), self.detail(), identity)
    }
}

/// One alert as written to the alert log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub issue_type: String,
    pub detail: String,
    pub identity: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    /// Create an alert stamped with the current time.
    pub fn new(issue_type: impl Into<String>, detail: impl Into<String>, identity: Option<&str>) -> Self {
        Self {
            issue_type: issue_type.into(),
            detail: detail.into(),
            identity: identity.map(str::to_string),
            timestamp: Utc::now(),
        }
    }

    /// Subject line.
    #[must_use]
    pub fn subject(&self) -> String {
        format!("Slotwarden Alert: {}", self.issue_type)
    }

    /// Log block, starting with the separator line.
    #[must_use]
    pub fn render(&self) -> String {
        let mut block = format!("\n{}\n", "=".repeat(SEPARATOR_WIDTH));
        block.push_str(&self.subject());
        block.push_str("\n\n");
        block.push_str(&format!("Type: {}\n", self.issue_type));
        block.push_str(&format!("Details: {}\n", self.detail));
        if let Some(identity) = &self.identity {
            block.push_str(&format!("Account: {identity}\n"));
        }
        block.push_str(&format!(
            "\nTimestamp: {}\n",
            self.timestamp.format("%Y-%m-%d %H:%M:%S")
        ));
        block
    }
}

/// Sink that appends alerts to `security_alerts.log`.
#[derive(Debug, Clone)]
pub struct AlertLogSink {
    path: PathBuf,
}

impl AlertLogSink {
    /// Sink writing into `<results_dir>/security_alerts.log`.
    #[must_use]
    pub fn new(results_dir: impl AsRef<Path>) -> Self {
        Self {
            path: results_dir.as_ref().join(ALERT_LOG_FILE),
        }
    }

    /// Path of the alert log.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, alert: &Alert) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(alert.render().as_bytes())
    }
}

#[async_trait]
impl NotificationSink for AlertLogSink {
    async fn notify(&self, issue_type: &str, detail: &str, identity: Option<&str>) -> bool {
        let alert = Alert::new(issue_type, detail, identity);
        match self.append(&alert) {
            Ok(()) => {
                warn!(
                    identity = identity.unwrap_or("-"),
                    "Security alert logged: {}", issue_type
                );
                true
            }
            Err(e) => {
                error!("Error writing alert to {}: {}", self.path.display(), e);
                false
            }
        }
    }
}

/// Send `anomaly` to `sink`; a delivery failure is logged, never returned.
pub async fn raise(sink: &dyn NotificationSink, anomaly: &Anomaly, identity: Option<&str>) -> bool {
    let delivered = sink
        .notify(anomaly.issue_type(), &anomaly.detail(), identity)
        .await;
    if !delivered {
        error!(
            identity = identity.unwrap_or("-"),
            "Notification '{}' could not be delivered",
            anomaly.issue_type()
        );
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;
    use tempfile::TempDir;

    #[test]
    fn test_alert_render() {
        let alert = Anomaly::UnknownLocation {
            code: "XYZ".to_string(),
        }
        .alert(Some("a@x.com"));
        let block = alert.render();

        assert!(block.starts_with(&format!("\n{}\n", "=".repeat(50))));
        assert!(block.contains("Slotwarden Alert: Invalid Center"));
        assert!(block.contains("Type: Invalid Center"));
        assert!(block.contains("Details: Unknown location code: XYZ"));
        assert!(block.contains("Account: a@x.com"));
        assert!(block.contains("Timestamp: "));
    }

    #[test]
    fn test_alert_without_identity_omits_account() {
        let block = Anomaly::LoginFormChanged.alert(None).render();
        assert!(!block.contains("Account:"));
    }

    #[tokio::test]
    async fn test_alert_log_sink_appends() {
        let temp = TempDir::new().unwrap();
        let sink = AlertLogSink::new(temp.path().join("results"));

        assert!(sink.notify("First", "one", Some("a@x.com")).await);
        assert!(sink.notify("Second", "two", None).await);

        let log = fs::read_to_string(sink.path()).unwrap();
        assert_eq!(log.matches(&"=".repeat(50)).count(), 2);
        let first = log.find("Type: First").unwrap();
        let second = log.find("Type: Second").unwrap();
        assert!(first < second);
    }

    #[tokio::test]
    async fn test_alert_log_sink_failure_returns_false() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("not-a-dir");
        fs::write(&blocker, "file").unwrap();
        let sink = AlertLogSink::new(&blocker);

        assert!(!sink.notify("X", "y", None).await);
    }

    #[tokio::test]
    async fn test_raise_forwards_anomaly() {
        let sink = RecordingSink::new();
        let anomaly = Anomaly::ChallengeUnresolved {
            location: "PAR".to_string(),
        };

        assert!(raise(&sink, &anomaly, Some("a@x.com")).await);

        let sent = sink.notifications();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].issue_type, "Challenge Detection");
        assert_eq!(sent[0].identity.as_deref(), Some("a@x.com"));
    }

    #[tokio::test]
    async fn test_raise_swallows_delivery_failure() {
        let sink = RecordingSink::new().failing();
        assert!(!raise(&sink, &Anomaly::LoginFormChanged, None).await);
        assert_eq!(sink.notifications().len(), 1);
    }
}
