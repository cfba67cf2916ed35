//! End-to-end workflow scenarios against a scripted page.

use std::path::PathBuf;
use std::sync::Arc;

use slotwarden::testing::{MockPage, RecordingSink};
use slotwarden::{
    AccountRecord, AccountStatus, BookingRecord, BotConfig, DelayRange, DriverError, Element,
    FailureKind, NotificationSink, PageDriver, StatusLedger, TimingPolicy, WorkflowEngine,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Zero pacing, no random refreshes or diagnostics, and a monitor that can
/// poll three times (t = 0, 5, 10) before its 12 second ceiling.
fn quiet_config() -> BotConfig {
    let mut config = BotConfig::default();
    config.timing.default_delay = DelayRange::zero();
    config.timing.typing = DelayRange::zero();
    config.timing.focus = DelayRange::zero();
    config.timing.scroll_step = DelayRange::zero();
    config.timing.scroll_pause = DelayRange::zero();
    config.monitor.poll_interval = DelayRange::fixed(5.0);
    config.monitor.time_ceiling_secs = 12;
    config.monitor.refresh_probability = 0.0;
    config.monitor.diagnostic_probability = 0.0;
    config
}

struct Harness {
    config: Arc<BotConfig>,
    page: Arc<MockPage>,
    ledger: Arc<StatusLedger>,
    sink: Arc<RecordingSink>,
    cancel: CancellationToken,
    results: PathBuf,
    _temp: TempDir,
}

impl Harness {
    fn new(build: impl FnOnce(&BotConfig) -> MockPage) -> Self {
        let config = quiet_config();
        let page = build(&config);
        let temp = TempDir::new().expect("Failed to create temp dir");
        let results = temp.path().join("results");
        Self {
            ledger: Arc::new(StatusLedger::open(&results).expect("open ledger")),
            config: Arc::new(config),
            page: Arc::new(page),
            sink: Arc::new(RecordingSink::new()),
            cancel: CancellationToken::new(),
            results,
            _temp: temp,
        }
    }

    async fn run(&self, identity: &str, location: &str) -> slotwarden::Result<BookingRecord> {
        let page: Arc<dyn PageDriver> = self.page.clone();
        let sink: Arc<dyn NotificationSink> = self.sink.clone();
        WorkflowEngine::new(Arc::clone(&self.config), page, Arc::clone(&self.ledger), sink)
            .with_timing(Arc::new(TimingPolicy::seeded(self.config.timing.clone(), 7)))
            .with_results_dir(&self.results)
            .with_cancellation(self.cancel.clone())
            .run(identity, "hunter2", location)
            .await
    }

    fn record(&self, identity: &str) -> AccountRecord {
        self.ledger
            .get(identity)
            .expect("ledger readable")
            .expect("record exists")
    }

    fn last_step(&self, identity: &str) -> String {
        self.record(identity)
            .last_entry()
            .expect("history not empty")
            .step
            .clone()
    }
}

fn booking_flow(config: &BotConfig) -> MockPage {
    MockPage::booking_flow(&config.selectors)
}

// =========================================================================
// Success
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_reaches_payment_when_slot_appears_on_second_poll() {
    let h = Harness::new(|c| {
        booking_flow(c).with_elements_after(
            &c.selectors.available_slot,
            2,
            vec![Element::new("slot-7", "td"), Element::new("slot-8", "td")],
        )
    });

    let booking = h.run("a@x.com", "PAR").await.expect("run should succeed");

    assert_eq!(booking.identity, "a@x.com");
    assert_eq!(booking.location, "PAR");
    assert_eq!(booking.page_url, "https://appointments.example.com/payment");

    let record = h.record("a@x.com");
    assert!(record.success);
    assert_eq!(record.status, AccountStatus::Booked);
    assert_eq!(record.history.len(), 12);
    for (i, entry) in record.history.iter().enumerate() {
        assert_eq!(entry.attempt, i as u64 + 1);
    }
    assert_eq!(h.last_step("a@x.com"), "PaymentReached");

    let clicked = h.page.clicked();
    assert!(clicked.contains(&"slot-7".to_string()));
    assert!(!clicked.contains(&"slot-8".to_string()));
    assert_eq!(clicked.last().map(String::as_str), Some("confirm"));
    assert_eq!(h.page.query_count(&h.config.selectors.available_slot), 2);

    let artifacts: Vec<_> = std::fs::read_dir(&h.results)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| name.starts_with("booking_"))
        .collect();
    assert_eq!(artifacts.len(), 1);
    assert!(h.sink.notifications().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_location_code_is_case_insensitive() {
    let h = Harness::new(booking_flow);

    let booking = h.run("a@x.com", "par").await.unwrap();

    assert_eq!(booking.location, "PAR");
    assert!(h
        .page
        .navigations()
        .contains(&"https://appointments.example.com/par".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_required_fields_get_placeholders() {
    let h = Harness::new(|c| {
        booking_flow(c)
            .with_elements_after(
                &c.selectors.required_fields,
                1,
                vec![
                    Element::new("name", "input").with_attr("type", "text"),
                    Element::new("phone", "input").with_attr("type", "tel"),
                    Element::new("consent", "input").with_attr("type", "checkbox"),
                    Element::new("country", "select"),
                    Element::new("dob", "input").with_attr("type", "date"),
                ],
            )
            .with_children(
                "country",
                &c.selectors.select_option,
                vec![
                    Element::new("opt-0", "option").with_attr("value", ""),
                    Element::new("opt-1", "option").with_attr("value", "FR"),
                    Element::new("opt-2", "option").with_attr("value", "DE"),
                ],
            )
    });

    h.run("a@x.com", "PAR").await.unwrap();

    assert_eq!(h.page.typed_text("name"), "Sample text");
    assert_eq!(h.page.typed_text("phone"), "Sample text");
    assert_eq!(h.page.typed_text("dob"), "");
    assert!(h.page.checked().contains(&"consent".to_string()));
    assert!(h
        .page
        .selected()
        .contains(&("country".to_string(), "FR".to_string())));
}

#[tokio::test(start_paused = true)]
async fn test_missing_book_button_is_best_effort() {
    let h = Harness::new(|c| booking_flow(c).without_element(&c.selectors.book_button));

    assert!(h.run("a@x.com", "PAR").await.is_ok());
}

// =========================================================================
// Configuration drift
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_unknown_location_fails_before_navigation() {
    let h = Harness::new(booking_flow);

    let err = h.run("a@x.com", "XYZ").await.unwrap_err();

    assert_eq!(err.kind(), Some(FailureKind::UnknownLocation));
    assert!(err.is_configuration());
    assert!(h.page.navigations().is_empty());

    let sent = h.sink.notifications();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].issue_type, "Invalid Center");
    assert_eq!(sent[0].identity.as_deref(), Some("a@x.com"));

    let record = h.record("a@x.com");
    assert_eq!(record.status, AccountStatus::Failed);
    assert!(!record.success);
    assert_eq!(h.last_step("a@x.com"), "Initialize");
}

// =========================================================================
// Authentication
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_missing_post_login_marker_is_login_failed() {
    let h = Harness::new(|c| booking_flow(c).without_element(&c.selectors.post_login_marker));

    let err = h.run("a@x.com", "PAR").await.unwrap_err();

    assert_eq!(err.status(), AccountStatus::LoginFailed);
    let record = h.record("a@x.com");
    assert_eq!(record.status, AccountStatus::LoginFailed);
    let last = record.last_entry().unwrap();
    assert_eq!(last.status, AccountStatus::LoginFailed);
    assert_eq!(last.step, "Authenticate");
    assert!(!record.success);
    assert!(record.last_error.is_some());
    assert_eq!(h.sink.count_of("Authentication Failure"), 1);
    assert_eq!(h.page.typed_text("email"), "a@x.com");
    assert_eq!(h.page.typed_text("password"), "hunter2");
}

#[tokio::test(start_paused = true)]
async fn test_login_error_marker_is_login_failed() {
    let h = Harness::new(|c| {
        booking_flow(c).with_element(
            &c.selectors.login_error_marker,
            Element::new("err", "div").with_text(" Invalid credentials "),
        )
    });

    let err = h.run("a@x.com", "PAR").await.unwrap_err();

    assert_eq!(err.kind(), Some(FailureKind::LoginRejected));
    assert_eq!(
        h.record("a@x.com").last_error.as_deref(),
        Some("Login error: Invalid credentials")
    );
}

#[tokio::test(start_paused = true)]
async fn test_login_form_never_appears() {
    let h = Harness::new(|c| booking_flow(c).without_element(&c.selectors.email_input));

    let err = h.run("a@x.com", "PAR").await.unwrap_err();

    assert_eq!(err.kind(), Some(FailureKind::LoginFormNotFound));
    assert_eq!(h.record("a@x.com").status, AccountStatus::LoginFailed);
    assert_eq!(h.sink.count_of("Authentication Form Changed"), 1);
    assert_eq!(h.page.reload_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_login_link_is_followed() {
    let h = Harness::new(|c| {
        booking_flow(c).with_element(&c.selectors.login_link, Element::new("login-link", "a"))
    });

    h.run("a@x.com", "PAR").await.unwrap();

    assert_eq!(h.page.clicked().first().map(String::as_str), Some("login-link"));
}

#[tokio::test(start_paused = true)]
async fn test_missing_authenticated_marker_is_session_expired() {
    let h = Harness::new(|c| booking_flow(c).without_element(&c.selectors.authenticated_marker));

    let err = h.run("a@x.com", "PAR").await.unwrap_err();

    assert_eq!(err.status(), AccountStatus::SessionExpired);
    assert_eq!(h.last_step("a@x.com"), "VerifyLogin");
}

// =========================================================================
// Challenge pages, maintenance and transport
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_challenge_that_never_clears_is_blocked() {
    let h = Harness::new(|c| {
        let marker = &c.selectors.challenge_markers[0];
        booking_flow(c)
            .with_element(marker, Element::new("challenge", "div"))
            .with_sticky(marker)
    });

    let err = h.run("a@x.com", "PAR").await.unwrap_err();

    assert_eq!(err.status(), AccountStatus::ChallengeBlocked);
    assert_eq!(h.last_step("a@x.com"), "BypassChallenge");
    assert_eq!(h.sink.count_of("Challenge Detection"), 1);
    assert_eq!(h.page.reload_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_challenge_that_clears_continues() {
    let h = Harness::new(|c| {
        booking_flow(c).with_element(
            &c.selectors.challenge_markers[1],
            Element::new("challenge", "div"),
        )
    });

    assert!(h.run("a@x.com", "PAR").await.is_ok());
    assert_eq!(h.page.reload_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_maintenance_page() {
    let h = Harness::new(|c| {
        booking_flow(c).with_content_at(
            "https://appointments.example.com/par",
            "<h1>Site Under Maintenance</h1>",
        )
    });

    let err = h.run("a@x.com", "PAR").await.unwrap_err();

    assert_eq!(err.status(), AccountStatus::SiteMaintenance);
    assert_eq!(h.last_step("a@x.com"), "BypassChallenge");
}

#[tokio::test(start_paused = true)]
async fn test_network_error_overrides_step_classification() {
    let h = Harness::new(|c| {
        booking_flow(c).failing_navigation(
            "https://appointments.example.com/",
            DriverError::Network("connection reset".into()),
        )
    });

    let err = h.run("a@x.com", "PAR").await.unwrap_err();

    assert!(err.is_network());
    let record = h.record("a@x.com");
    assert_eq!(record.status, AccountStatus::NetworkError);
    assert_eq!(h.last_step("a@x.com"), "SelectRegion");
}

#[tokio::test(start_paused = true)]
async fn test_navigation_failure_during_confirmation_is_network() {
    let h = Harness::new(|c| {
        booking_flow(c).failing_navigation_wait(DriverError::Navigation("aborted".into()))
    });

    let err = h.run("a@x.com", "PAR").await.unwrap_err();

    assert_eq!(err.status(), AccountStatus::NetworkError);
}

// =========================================================================
// Calendar and confirmation
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_no_availability_is_booking_failed() {
    let h = Harness::new(|c| booking_flow(c).without_element(&c.selectors.available_slot));

    let err = h.run("a@x.com", "PAR").await.unwrap_err();

    assert_eq!(err.kind(), Some(FailureKind::NoAvailability));
    assert_eq!(h.record("a@x.com").status, AccountStatus::BookingFailed);
    assert_eq!(h.last_step("a@x.com"), "Calendar");
    assert_eq!(h.page.query_count(&h.config.selectors.available_slot), 3);
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_calendar_is_calendar_error() {
    let h = Harness::new(|c| {
        booking_flow(c).failing_query(
            &c.selectors.available_slot,
            DriverError::Script("calendar widget crashed".into()),
        )
    });

    let err = h.run("a@x.com", "PAR").await.unwrap_err();

    assert_eq!(err.status(), AccountStatus::CalendarError);
    assert_eq!(h.last_step("a@x.com"), "Calendar");
}

#[tokio::test(start_paused = true)]
async fn test_missing_confirm_control_is_booking_failed() {
    let h = Harness::new(|c| booking_flow(c).without_element(&c.selectors.confirm_button));

    let err = h.run("a@x.com", "PAR").await.unwrap_err();

    assert_eq!(err.kind(), Some(FailureKind::ConfirmationFailed));
    assert_eq!(h.record("a@x.com").status, AccountStatus::BookingFailed);
    assert_eq!(h.last_step("a@x.com"), "Confirmation");
}

#[tokio::test(start_paused = true)]
async fn test_confirmation_timeout_is_booking_failed() {
    let h = Harness::new(|c| {
        booking_flow(c).failing_navigation_wait(DriverError::timeout(
            "navigation",
            std::time::Duration::from_secs(30),
        ))
    });

    let err = h.run("a@x.com", "PAR").await.unwrap_err();

    assert_eq!(err.status(), AccountStatus::BookingFailed);
    assert_eq!(h.last_step("a@x.com"), "Confirmation");
}

// =========================================================================
// Cancellation and durability
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_cancelled_before_start_records_failure() {
    let h = Harness::new(booking_flow);
    h.cancel.cancel();

    let err = h.run("a@x.com", "PAR").await.unwrap_err();

    assert_eq!(err.kind(), Some(FailureKind::Cancelled));
    assert!(h.page.navigations().is_empty());
    assert_eq!(h.record("a@x.com").status, AccountStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_monitoring() {
    let h = Harness::new(|c| booking_flow(c).without_element(&c.selectors.available_slot));
    let trigger = h.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(120)).await;
        trigger.cancel();
    });

    let mut config = (*h.config).clone();
    config.monitor.time_ceiling_secs = 3600;
    let page: Arc<dyn PageDriver> = h.page.clone();
    let sink: Arc<dyn NotificationSink> = h.sink.clone();
    let err = WorkflowEngine::new(Arc::new(config), page, Arc::clone(&h.ledger), sink)
        .with_results_dir(&h.results)
        .with_cancellation(h.cancel.clone())
        .run("a@x.com", "pw", "PAR")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), Some(FailureKind::Cancelled));
    assert_eq!(h.last_step("a@x.com"), "Calendar");
}

#[tokio::test(start_paused = true)]
async fn test_history_survives_reopen() {
    let h = Harness::new(|c| booking_flow(c).without_element(&c.selectors.post_login_marker));
    h.run("a@x.com", "PAR").await.unwrap_err();

    let reopened = StatusLedger::open(&h.results).unwrap();

    assert_eq!(
        reopened.get("a@x.com").unwrap().unwrap().history,
        h.record("a@x.com").history
    );
}

#[tokio::test(start_paused = true)]
async fn test_second_run_resets_success_flag() {
    let h = Harness::new(booking_flow);
    h.run("a@x.com", "PAR").await.unwrap();
    assert!(h.record("a@x.com").success);

    h.run("a@x.com", "XYZ").await.unwrap_err();

    let record = h.record("a@x.com");
    assert!(!record.success);
    assert_eq!(record.history.len(), 14);
}
