//! Configuration management for slotwarden.
//!
//! All tunables (delay ranges, retry budgets, polling cadence, selectors and
//! the location table) live in one JSON document, `settings.json`, inside the
//! working directory. Every section has defaults so a partial file is valid.
//!
//! # Example settings.json
//!
//! ```json
//! {
//!   "resultsDir": "results",
//!   "maxConcurrentSessions": 2,
//!   "monitor": { "timeCeilingSecs": 600 },
//!   "locations": {
//!     "PAR": { "name": "Paris", "url": "https://appointments.example.com/fr/par" }
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SlotError};

/// Settings file name inside the working directory.
pub const SETTINGS_FILE: &str = "settings.json";

/// Longest single delay, in seconds, that a range may ask for.
pub const MAX_DELAY_SECS: f64 = 3600.0;

/// Closed interval of seconds sampled uniformly by the timing policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayRange {
    pub min_secs: f64,
    pub max_secs: f64,
}

impl DelayRange {
    /// Create a range; bounds are reordered if given backwards.
    #[must_use]
    pub fn new(min_secs: f64, max_secs: f64) -> Self {
        if min_secs <= max_secs {
            Self { min_secs, max_secs }
        } else {
            Self {
                min_secs: max_secs,
                max_secs: min_secs,
            }
        }
    }

    /// A range that always yields the same value.
    #[must_use]
    pub fn fixed(secs: f64) -> Self {
        Self::new(secs, secs)
    }

    /// A zero-length range; handy in tests.
    #[must_use]
    pub fn zero() -> Self {
        Self::fixed(0.0)
    }

    fn is_valid(&self) -> bool {
        self.min_secs.is_finite()
            && self.max_secs.is_finite()
            && self.min_secs >= 0.0
            && self.min_secs <= self.max_secs
            && self.max_secs <= MAX_DELAY_SECS
    }
}

/// Pacing between actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimingConfig {
    /// Used when a caller asks for "a delay" without bounds.
    pub default_delay: DelayRange,
    /// Between typed characters.
    pub typing: DelayRange,
    /// After focusing a field and before typing.
    pub focus: DelayRange,
    /// Between scroll increments.
    pub scroll_step: DelayRange,
    /// Occasional pause while scrolling.
    pub scroll_pause: DelayRange,
    /// Probability of a pause after each scroll increment.
    pub scroll_pause_probability: f64,
    /// Smallest scroll increment in pixels.
    pub scroll_min_px: u32,
    /// Largest scroll increment in pixels.
    pub scroll_max_px: u32,
    /// Upper bound on increments in each direction.
    pub scroll_max_increments: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            default_delay: DelayRange::new(1.0, 3.0),
            typing: DelayRange::new(0.05, 0.15),
            focus: DelayRange::new(0.1, 0.3),
            scroll_step: DelayRange::new(0.1, 0.3),
            scroll_pause: DelayRange::new(0.5, 1.0),
            scroll_pause_probability: 0.2,
            scroll_min_px: 100,
            scroll_max_px: 300,
            scroll_max_increments: 50,
        }
    }
}

/// Retry budgets for flaky preconditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Attempts for login-form detection and challenge waits (1-indexed).
    pub max_attempts: u32,
    /// Wait between attempts.
    pub backoff: DelayRange,
    /// How long one attempt waits for the login form.
    pub login_form_timeout_secs: u64,
    /// How long one attempt waits for a challenge marker to clear.
    pub challenge_timeout_secs: u64,
    /// How long to wait for the post-login or error marker.
    pub login_result_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: DelayRange::new(5.0, 8.0),
            login_form_timeout_secs: 10,
            challenge_timeout_secs: 90,
            login_result_timeout_secs: 10,
        }
    }
}

/// Availability polling cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MonitorConfig {
    /// Sleep between polls.
    pub poll_interval: DelayRange,
    /// Chance of forcing a reload after an empty poll.
    pub refresh_probability: f64,
    /// Chance of emitting the stale-selector diagnostic on exhaustion.
    pub diagnostic_probability: f64,
    /// Wall-clock ceiling for one monitoring session.
    pub time_ceiling_secs: u64,
    /// Optional cap on poll iterations.
    pub max_iterations: Option<u32>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DelayRange::new(3.0, 5.0),
            refresh_probability: 0.1,
            diagnostic_probability: 0.1,
            time_ceiling_secs: 30 * 60,
            max_iterations: None,
        }
    }
}

impl MonitorConfig {
    /// The time ceiling as a duration.
    #[must_use]
    pub fn time_ceiling(&self) -> Duration {
        Duration::from_secs(self.time_ceiling_secs)
    }
}

/// Selectors handed to the page driver. Their syntax is whatever the driver
/// understands; the engine treats them as opaque strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Selectors {
    pub challenge_markers: Vec<String>,
    pub login_link: String,
    pub email_input: String,
    pub password_input: String,
    pub login_submit: String,
    pub post_login_marker: String,
    pub login_error_marker: String,
    pub authenticated_marker: String,
    pub required_fields: String,
    pub select_option: String,
    pub form_submit: String,
    pub book_button: String,
    pub available_slot: String,
    pub confirm_button: String,
}

impl Default for Selectors {
    fn default() -> Self {
        Self {
            challenge_markers: vec![
                "#challenge-running".to_string(),
                "#challenge-stage".to_string(),
                "#challenge-form".to_string(),
                "iframe[title='Widget containing a Cloudflare security challenge']".to_string(),
            ],
            login_link: r#"a:text("Login"), button:text("Login"), a:text("Sign in")"#.to_string(),
            email_input: r#"input[type="email"], input[name="username"]"#.to_string(),
            password_input: r#"input[type="password"]"#.to_string(),
            login_submit: r#"button[type="submit"], input[type="submit"]"#.to_string(),
            post_login_marker: ".user-info".to_string(),
            login_error_marker: ".error-message".to_string(),
            authenticated_marker: ".user-profile, .user-account, .account-info, .logout-link"
                .to_string(),
            required_fields: "input[required], select[required]".to_string(),
            select_option: "option".to_string(),
            form_submit: r#"button[type="submit"]:visible"#.to_string(),
            book_button: r#"a:text("Book Appointment"), button:text("Book Appointment"), a:text("Book an appointment")"#.to_string(),
            available_slot: ".available".to_string(),
            confirm_button: r#"button:text("Confirm"), input[value="Confirm"]"#.to_string(),
        }
    }
}

/// One bookable location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationConfig {
    /// Display name.
    pub name: String,
    /// Landing page for the location; hosts the login flow.
    pub url: String,
    /// Booking form page, when it differs from the landing page.
    #[serde(default)]
    pub booking_url: Option<String>,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BotConfig {
    pub timing: TimingConfig,
    pub retry: RetryConfig,
    pub monitor: MonitorConfig,
    pub selectors: Selectors,
    /// Page text fragments that mean the site is down for maintenance.
    pub maintenance_markers: Vec<String>,
    /// Region selection page.
    pub region_url: String,
    /// Location code to location; codes are matched case-insensitively.
    pub locations: BTreeMap<String, LocationConfig>,
    /// Where the ledger, booking artifacts and alert log are written.
    pub results_dir: PathBuf,
    /// Upper bound on concurrently running sessions.
    pub max_concurrent_sessions: usize,
    /// Default timeout for navigation waits.
    pub page_timeout_secs: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        let mut locations = BTreeMap::new();
        for (code, name) in [("PAR", "Paris"), ("LYS", "Lyon"), ("MRS", "Marseille")] {
            let slug = code.to_lowercase();
            locations.insert(
                code.to_string(),
                LocationConfig {
                    name: name.to_string(),
                    url: format!("https://appointments.example.com/{slug}"),
                    booking_url: Some(format!("https://appointments.example.com/formGroup/{slug}")),
                },
            );
        }

        Self {
            timing: TimingConfig::default(),
            retry: RetryConfig::default(),
            monitor: MonitorConfig::default(),
            selectors: Selectors::default(),
            maintenance_markers: vec![
                "site under maintenance".to_string(),
                "scheduled maintenance".to_string(),
            ],
            region_url: "https://appointments.example.com/".to_string(),
            locations,
            results_dir: PathBuf::from("results"),
            max_concurrent_sessions: 2,
            page_timeout_secs: 30,
        }
    }
}

impl BotConfig {
    /// Load configuration from `<dir>/settings.json`, or defaults if absent.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = Self::settings_path(dir);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| SlotError::config_with_path(e.to_string(), path.clone()))?;
        let config: BotConfig = serde_json::from_str(&content)
            .map_err(|e| SlotError::config_with_path(e.to_string(), path.clone()))?;
        Ok(config)
    }

    /// Get the settings.json path for a directory
    pub fn settings_path(dir: &Path) -> PathBuf {
        dir.join(SETTINGS_FILE)
    }

    /// Results directory, resolved against `dir` when relative.
    pub fn results_dir_in(&self, dir: &Path) -> PathBuf {
        if self.results_dir.is_absolute() {
            self.results_dir.clone()
        } else {
            dir.join(&self.results_dir)
        }
    }

    /// Look up a location code, ignoring case.
    ///
    /// Returns the canonical (configured) code alongside the location.
    pub fn resolve_location(&self, code: &str) -> Option<(&str, &LocationConfig)> {
        let wanted = code.trim();
        self.locations
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(wanted))
            .map(|(key, loc)| (key.as_str(), loc))
    }

    /// Default navigation timeout.
    #[must_use]
    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }

    /// Check the configuration for values the engine cannot work with.
    ///
    /// Returns one message per problem; an empty list means the
    /// configuration is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        let ranges = [
            ("timing.defaultDelay", self.timing.default_delay),
            ("timing.typing", self.timing.typing),
            ("timing.focus", self.timing.focus),
            ("timing.scrollStep", self.timing.scroll_step),
            ("timing.scrollPause", self.timing.scroll_pause),
            ("retry.backoff", self.retry.backoff),
            ("monitor.pollInterval", self.monitor.poll_interval),
        ];
        for (field, range) in ranges {
            if !range.is_valid() {
                problems.push(format!(
                    "{field}: invalid range {}..{}",
                    range.min_secs, range.max_secs
                ));
            }
        }

        let probabilities = [
            ("timing.scrollPauseProbability", self.timing.scroll_pause_probability),
            ("monitor.refreshProbability", self.monitor.refresh_probability),
            ("monitor.diagnosticProbability", self.monitor.diagnostic_probability),
        ];
        for (field, p) in probabilities {
            if !(0.0..=1.0).contains(&p) {
                problems.push(format!("{field}: {p} is not a probability"));
            }
        }

        if self.timing.scroll_min_px > self.timing.scroll_max_px {
            problems.push("timing.scrollMinPx exceeds timing.scrollMaxPx".to_string());
        }
        if self.retry.max_attempts == 0 {
            problems.push("retry.maxAttempts must be at least 1".to_string());
        }
        if self.monitor.time_ceiling_secs == 0 {
            problems.push("monitor.timeCeilingSecs must be positive".to_string());
        }
        if self.max_concurrent_sessions == 0 {
            problems.push("maxConcurrentSessions must be at least 1".to_string());
        }
        if self.locations.is_empty() {
            problems.push("locations: no locations configured".to_string());
        }
        for (code, loc) in &self.locations {
            if loc.url.trim().is_empty() {
                problems.push(format!("locations.{code}: empty url"));
            }
        }

        problems
    }
}
