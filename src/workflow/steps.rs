//! Per-step actions.

use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{AccountSession, Step};
use crate::artifacts::{save_booking, BookingRecord};
use crate::config::{BotConfig, LocationConfig};
use crate::driver::{DriverError, DriverResult, Element, ElementState, PageDriver, WaitPolicy};
use crate::error::{FailureKind, Result, SlotError};
use crate::monitor::{AvailabilityMonitor, MonitorOutcome};
use crate::notify::{raise, Anomaly, NotificationSink};
use crate::retry::{RetryGovernor, RetryPolicy};
use crate::timing::TimingPolicy;

/// Placeholder written into required free-text fields.
const SAMPLE_TEXT: &str = "Sample text";

/// Everything a step needs besides the session itself.
pub(super) struct StepContext<'a> {
    pub config: &'a BotConfig,
    pub driver: &'a dyn PageDriver,
    pub timing: &'a TimingPolicy,
    pub sink: &'a dyn NotificationSink,
    pub cancel: &'a CancellationToken,
    pub results_dir: &'a Path,
}

impl StepContext<'_> {
    fn governor(&self) -> RetryGovernor<'_> {
        RetryGovernor::new(self.timing)
    }

    fn policy(&self, exhausted: FailureKind) -> RetryPolicy {
        RetryPolicy::from_config(&self.config.retry, exhausted)
    }
}

/// Run the action of a non-terminal step.
pub(super) async fn execute(
    ctx: &StepContext<'_>,
    session: &mut AccountSession,
    step: Step,
    secret: &str,
) -> Result<()> {
    match step {
        Step::Initialize => initialize(ctx, session).await,
        Step::BypassChallenge => bypass_challenge(ctx, session).await,
        Step::Authenticate => authenticate(ctx, session, secret).await,
        Step::VerifyLogin => verify_login(ctx, session).await,
        Step::SelectRegion => select_region(ctx).await,
        Step::SelectLocation => select_location(ctx, session).await,
        Step::BookingDetail => booking_detail(ctx, session).await,
        Step::PersonalInfo => personal_info(ctx).await,
        Step::Calendar => calendar(ctx, session).await,
        Step::Confirmation => confirmation(ctx).await,
        Step::PaymentReached => Err(SlotError::classified(
            FailureKind::Unexpected,
            "PaymentReached has no action",
        )),
    }
}

/// Resolve the location code. Unknown codes notify and fail before any
/// navigation happens.
async fn initialize(ctx: &StepContext<'_>, session: &mut AccountSession) -> Result<()> {
    let Some((code, location)) = ctx.config.resolve_location(&session.location_code) else {
        let code = session.location_code.clone();
        raise(
            ctx.sink,
            &Anomaly::UnknownLocation { code: code.clone() },
            Some(&session.identity),
        )
        .await;
        return Err(SlotError::classified(
            FailureKind::UnknownLocation,
            format!("Unknown location code: {code}"),
        ));
    };

    info!("Target location {} ({})", code, location.name);
    session.location_code = code.to_string();
    session.location = Some(location.clone());
    Ok(())
}

fn location_of(session: &AccountSession) -> Result<&LocationConfig> {
    session.location.as_ref().ok_or_else(|| {
        SlotError::classified(
            FailureKind::Unexpected,
            format!("Location {} was never resolved", session.location_code),
        )
    })
}

async fn bypass_challenge(ctx: &StepContext<'_>, session: &AccountSession) -> Result<()> {
    let location = location_of(session)?;
    open_page(ctx, &location.url).await?;

    let driver = ctx.driver;
    let markers = ctx.config.selectors.challenge_markers.as_slice();
    let timeout = Duration::from_secs(ctx.config.retry.challenge_timeout_secs);
    let result = ctx
        .governor()
        .with_recovery(
            &ctx.policy(FailureKind::ChallengeUnresolved),
            "challenge clearance",
            move |_| challenge_cleared(driver, markers, timeout),
            move || async move { driver.reload().await.map_err(SlotError::from) },
        )
        .await;

    match result {
        Ok(_) => {
            ctx.timing.default_delay().await;
            ctx.timing.scroll(ctx.driver).await;
            Ok(())
        }
        Err(e) => {
            if e.kind() == Some(FailureKind::ChallengeUnresolved) {
                raise(
                    ctx.sink,
                    &Anomaly::ChallengeUnresolved {
                        location: session.location_code.clone(),
                    },
                    Some(&session.identity),
                )
                .await;
            }
            Err(e)
        }
    }
}

/// True when no challenge marker is present, or every present marker went
/// away within `timeout`.
async fn challenge_cleared(
    driver: &dyn PageDriver,
    markers: &[String],
    timeout: Duration,
) -> Result<bool> {
    for marker in markers {
        if driver.find(marker).await?.is_none() {
            continue;
        }
        info!("Challenge marker {} present, waiting for it to clear", marker);
        match driver.wait_for(marker, ElementState::Hidden, timeout).await {
            Ok(_) => debug!("Challenge marker {} cleared", marker),
            Err(DriverError::Timeout { .. }) => return Ok(false),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

async fn authenticate(
    ctx: &StepContext<'_>,
    session: &mut AccountSession,
    secret: &str,
) -> Result<()> {
    let selectors = &ctx.config.selectors;
    let driver = ctx.driver;

    if let Some(link) = driver.find(&selectors.login_link).await? {
        debug!("Opening login page");
        driver.click(&link).await?;
        best_effort(
            driver.wait_for_navigation(ctx.config.page_timeout()).await,
            "waiting for login page",
        )?;
        ctx.timing.default_delay().await;
    }

    let form_timeout = Duration::from_secs(ctx.config.retry.login_form_timeout_secs);
    let form = ctx
        .governor()
        .with_recovery(
            &ctx.policy(FailureKind::LoginFormNotFound),
            "login form",
            move |_| element_visible(driver, &selectors.email_input, form_timeout),
            move || async move { driver.reload().await.map_err(SlotError::from) },
        )
        .await;
    if let Err(e) = form {
        if e.kind() == Some(FailureKind::LoginFormNotFound) {
            raise(ctx.sink, &Anomaly::LoginFormChanged, Some(&session.identity)).await;
        }
        return Err(e);
    }

    let email = required(driver, &selectors.email_input, FailureKind::LoginFormNotFound).await?;
    let password =
        required(driver, &selectors.password_input, FailureKind::LoginFormNotFound).await?;

    ctx.timing.type_text(driver, &email, &session.identity).await;
    ctx.timing.default_delay().await;
    ctx.timing.type_text(driver, &password, secret).await;
    ctx.timing.default_delay().await;

    let submit = required(driver, &selectors.login_submit, FailureKind::LoginRejected).await?;
    driver.click(&submit).await?;

    let result_timeout = Duration::from_secs(ctx.config.retry.login_result_timeout_secs);
    let marker = match driver
        .wait_for(&selectors.post_login_marker, ElementState::Visible, result_timeout)
        .await
    {
        Ok(found) => found,
        Err(DriverError::Timeout { .. }) => None,
        Err(e) => return Err(e.into()),
    };
    let login_error = driver.find(&selectors.login_error_marker).await?;

    let rejection = match (marker, login_error) {
        (_, Some(err)) => Some(format!("Login error: {}", err.text.trim())),
        (None, None) => Some("post-login marker never appeared".to_string()),
        (Some(_), None) => None,
    };

    if let Some(reason) = rejection {
        raise(
            ctx.sink,
            &Anomaly::AuthenticationFailure {
                reason: reason.clone(),
            },
            Some(&session.identity),
        )
        .await;
        return Err(SlotError::classified(FailureKind::LoginRejected, reason));
    }

    info!("Logged in as {}", session.identity);
    session.authenticated = true;
    Ok(())
}

async fn verify_login(ctx: &StepContext<'_>, session: &mut AccountSession) -> Result<()> {
    let marker = &ctx.config.selectors.authenticated_marker;
    if ctx.driver.find(marker).await?.is_some() {
        return Ok(());
    }

    session.authenticated = false;
    let reason = "authenticated marker missing after login".to_string();
    raise(
        ctx.sink,
        &Anomaly::AuthenticationFailure {
            reason: reason.clone(),
        },
        Some(&session.identity),
    )
    .await;
    Err(SlotError::classified(
        FailureKind::SessionNotAuthenticated,
        reason,
    ))
}

async fn select_region(ctx: &StepContext<'_>) -> Result<()> {
    open_page(ctx, &ctx.config.region_url).await?;
    ctx.timing.default_delay().await;
    Ok(())
}

async fn select_location(ctx: &StepContext<'_>, session: &AccountSession) -> Result<()> {
    let location = location_of(session)?;
    open_page(ctx, &location.url).await?;
    ctx.timing.default_delay().await;
    ctx.timing.scroll(ctx.driver).await;
    Ok(())
}

async fn booking_detail(ctx: &StepContext<'_>, session: &AccountSession) -> Result<()> {
    let location = location_of(session)?;
    if let Some(url) = &location.booking_url {
        open_page(ctx, url).await?;
    }
    ctx.timing.default_delay().await;
    ctx.timing.scroll(ctx.driver).await;

    fill_required_fields(ctx).await?;

    match ctx.driver.find(&ctx.config.selectors.form_submit).await? {
        Some(submit) => {
            ctx.driver.click(&submit).await?;
            best_effort(
                ctx.driver
                    .wait_for_navigation(ctx.config.page_timeout())
                    .await,
                "waiting for booking form submission",
            )?;
        }
        None => warn!("No submit control on the booking form, continuing"),
    }
    Ok(())
}

async fn personal_info(ctx: &StepContext<'_>) -> Result<()> {
    ctx.timing.default_delay().await;
    fill_required_fields(ctx).await?;

    match ctx.driver.find(&ctx.config.selectors.book_button).await? {
        Some(button) => {
            ctx.driver.click(&button).await?;
            best_effort(
                ctx.driver
                    .wait_for_navigation(ctx.config.page_timeout())
                    .await,
                "waiting for the availability view",
            )?;
        }
        None => warn!("Could not find the book button, continuing"),
    }
    Ok(())
}

async fn calendar(ctx: &StepContext<'_>, session: &AccountSession) -> Result<()> {
    let monitor = AvailabilityMonitor::new(
        &ctx.config.monitor,
        &ctx.config.selectors.available_slot,
        ctx.timing,
        ctx.sink,
    );

    let outcome = match monitor
        .watch(ctx.driver, ctx.cancel, Some(&session.identity))
        .await
    {
        Ok(outcome) => outcome,
        Err(e) if e.is_network() => return Err(e),
        Err(e) => {
            return Err(SlotError::classified(
                FailureKind::CalendarUnavailable,
                format!("Availability view unreadable: {e}"),
            ))
        }
    };

    match outcome {
        MonitorOutcome::Found { iteration, .. } => {
            info!("Selected a slot after {} polls", iteration);
            ctx.timing.default_delay().await;
            Ok(())
        }
        MonitorOutcome::Exhausted { iterations } => Err(SlotError::classified(
            FailureKind::NoAvailability,
            format!("No availability after {iterations} polls"),
        )),
        MonitorOutcome::Cancelled { iterations } => Err(SlotError::classified(
            FailureKind::Cancelled,
            format!("Cancelled while watching availability ({iterations} polls)"),
        )),
    }
}

async fn confirmation(ctx: &StepContext<'_>) -> Result<()> {
    ctx.timing.default_delay().await;
    let confirm = required(
        ctx.driver,
        &ctx.config.selectors.confirm_button,
        FailureKind::ConfirmationFailed,
    )
    .await?;
    ctx.driver.click(&confirm).await?;

    match ctx
        .driver
        .wait_for_navigation(ctx.config.page_timeout())
        .await
    {
        Ok(()) => Ok(()),
        Err(e) if e.is_transport() => Err(e.into()),
        Err(e) => Err(SlotError::classified(
            FailureKind::ConfirmationFailed,
            format!("Confirmation did not navigate: {e}"),
        )),
    }
}

/// Build and persist the booking record. The payment itself is never made.
pub(super) async fn payment_reached(
    ctx: &StepContext<'_>,
    session: &AccountSession,
) -> Result<BookingRecord> {
    let url = ctx.driver.current_url().await?;
    info!("Reached payment page, stopping");

    let record = BookingRecord::new(&session.identity, &session.location_code, url);
    if let Err(e) = save_booking(ctx.results_dir, &record) {
        error!("Error saving booking record: {}", e);
    }
    Ok(record)
}

/// Navigate, then fail with `SITE_MAINTENANCE` if the page says so.
async fn open_page(ctx: &StepContext<'_>, url: &str) -> Result<()> {
    debug!("Navigating to {}", url);
    ctx.driver.navigate(url, WaitPolicy::NetworkIdle).await?;
    check_maintenance(ctx).await
}

async fn check_maintenance(ctx: &StepContext<'_>) -> Result<()> {
    let markers = &ctx.config.maintenance_markers;
    if markers.is_empty() {
        return Ok(());
    }

    let content = match ctx.driver.content().await {
        Ok(content) => content.to_lowercase(),
        Err(e) if e.is_transport() => return Err(e.into()),
        Err(e) => {
            warn!("Could not read page content for maintenance check: {}", e);
            return Ok(());
        }
    };

    match markers
        .iter()
        .find(|m| content.contains(&m.to_lowercase()))
    {
        Some(marker) => Err(SlotError::classified(
            FailureKind::Maintenance,
            format!("Site reports maintenance ({marker})"),
        )),
        None => Ok(()),
    }
}

/// Fill every required field with a type-appropriate placeholder.
///
/// Individual field failures are logged; transport failures still abort.
async fn fill_required_fields(ctx: &StepContext<'_>) -> Result<()> {
    let driver = ctx.driver;
    let fields = driver.find_all(&ctx.config.selectors.required_fields).await?;
    if fields.is_empty() {
        debug!("No required fields on this page");
        return Ok(());
    }

    for field in &fields {
        let outcome = match (field.tag.as_str(), field.input_type().as_str()) {
            ("select", _) => choose_first_option(ctx, field).await,
            (_, "checkbox") => driver.check(field).await,
            ("textarea", _) | (_, "text" | "email" | "tel") => {
                driver.fill(field, SAMPLE_TEXT).await
            }
            (tag, kind) => {
                debug!("Leaving required {} field of type '{}' alone", tag, kind);
                Ok(())
            }
        };
        best_effort(outcome, "filling a required field")?;
        ctx.timing.delay(ctx.config.timing.focus).await;
    }

    info!("Filled {} required fields", fields.len());
    Ok(())
}

async fn choose_first_option(ctx: &StepContext<'_>, select: &Element) -> DriverResult<()> {
    let options = ctx
        .driver
        .find_within(select, &ctx.config.selectors.select_option)
        .await?;
    match options
        .iter()
        .filter_map(|o| o.attr("value"))
        .find(|v| !v.is_empty())
    {
        Some(value) => ctx.driver.select_option(select, value).await,
        None => {
            warn!("Required select {} has no non-empty option", select.id);
            Ok(())
        }
    }
}

async fn element_visible(driver: &dyn PageDriver, selector: &str, timeout: Duration) -> Result<bool> {
    match driver.wait_for(selector, ElementState::Visible, timeout).await {
        Ok(found) => Ok(found.is_some()),
        Err(DriverError::Timeout { .. }) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn required(driver: &dyn PageDriver, selector: &str, missing: FailureKind) -> Result<Element> {
    driver
        .find(selector)
        .await?
        .ok_or_else(|| SlotError::classified(missing, format!("Control not found: {selector}")))
}

/// Log a non-transport driver failure and carry on.
fn best_effort<T>(result: DriverResult<T>, what: &str) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_transport() => Err(e.into()),
        Err(e) => {
            warn!("Failed {}: {}", what, e);
            Ok(())
        }
    }
}
