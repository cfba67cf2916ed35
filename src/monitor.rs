//! Availability monitor: time-bounded polling of the slot listing.
//!
//! Each iteration queries the listing for the "available" selector. The
//! earliest-listed match is clicked and returned. Otherwise the monitor sleeps
//! a jittered interval and occasionally reloads the page. When the time
//! ceiling (or the optional iteration cap) is hit, it gives up; "nothing
//! available" is an expected outcome, so exhaustion is a value, not an error.

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::driver::{Element, PageDriver};
use crate::error::Result;
use crate::notify::{raise, Anomaly, NotificationSink};
use crate::timing::TimingPolicy;

/// How a monitoring session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// A slot was found and clicked on `iteration` (1-indexed).
    Found { iteration: u32, element: Element },
    /// The ceiling was reached without a match.
    Exhausted { iterations: u32 },
    /// The cancellation token fired.
    Cancelled { iterations: u32 },
}

impl MonitorOutcome {
    /// Number of polls performed.
    #[must_use]
    pub fn iterations(&self) -> u32 {
        match self {
            Self::Found { iteration, .. } => *iteration,
            Self::Exhausted { iterations } | Self::Cancelled { iterations } => *iterations,
        }
    }
}

/// Polls one page for availability.
pub struct AvailabilityMonitor<'a> {
    config: &'a MonitorConfig,
    slot_selector: &'a str,
    timing: &'a TimingPolicy,
    sink: &'a dyn NotificationSink,
}

impl<'a> AvailabilityMonitor<'a> {
    pub fn new(
        config: &'a MonitorConfig,
        slot_selector: &'a str,
        timing: &'a TimingPolicy,
        sink: &'a dyn NotificationSink,
    ) -> Self {
        Self {
            config,
            slot_selector,
            timing,
            sink,
        }
    }

    /// Poll until a slot is found, the ceiling is reached, or `cancel` fires.
    ///
    /// Errors come only from querying the listing or clicking the match.
    pub async fn watch(
        &self,
        driver: &dyn PageDriver,
        cancel: &CancellationToken,
        identity: Option<&str>,
    ) -> Result<MonitorOutcome> {
        let started = Instant::now();
        let ceiling = self.config.time_ceiling();
        let mut iteration = 0u32;

        info!(
            "Watching for availability (ceiling {}s)",
            ceiling.as_secs()
        );

        loop {
            if cancel.is_cancelled() {
                info!("Availability watch cancelled after {} polls", iteration);
                return Ok(MonitorOutcome::Cancelled {
                    iterations: iteration,
                });
            }

            iteration += 1;
            let slots = driver.find_all(self.slot_selector).await?;
            if let Some(first) = slots.into_iter().next() {
                info!("Slot available on poll {}", iteration);
                driver.click(&first).await?;
                return Ok(MonitorOutcome::Found {
                    iteration,
                    element: first,
                });
            }
            debug!("No availability on poll {}", iteration);

            let capped = self
                .config
                .max_iterations
                .is_some_and(|max| iteration >= max);
            if capped {
                break;
            }

            // No poll may start at or after the ceiling.
            let wait = self.timing.sample(self.config.poll_interval);
            if started.elapsed().saturating_add(wait) >= ceiling {
                break;
            }
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Availability watch cancelled while waiting");
                    return Ok(MonitorOutcome::Cancelled { iterations: iteration });
                }
                () = tokio::time::sleep(wait) => {}
            }

            if self.timing.chance(self.config.refresh_probability) {
                debug!("Refreshing availability view");
                if let Err(e) = driver.reload().await {
                    warn!("Refresh failed: {}", e);
                }
            }
        }

        info!(
            "No availability after {} polls in {}s",
            iteration,
            started.elapsed().as_secs()
        );
        if self.timing.chance(self.config.diagnostic_probability) {
            raise(self.sink, &Anomaly::StaleCalendarSelectors, identity).await;
        }

        Ok(MonitorOutcome::Exhausted {
            iterations: iteration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DelayRange, TimingConfig};
    use crate::driver::DriverError;
    use crate::testing::{MockPage, RecordingSink};
    use std::time::Duration;

    const SLOT: &str = ".available";

    fn config(ceiling_secs: u64) -> MonitorConfig {
        MonitorConfig {
            poll_interval: DelayRange::fixed(5.0),
            refresh_probability: 0.0,
            diagnostic_probability: 0.0,
            time_ceiling_secs: ceiling_secs,
            max_iterations: None,
        }
    }

    fn timing() -> TimingPolicy {
        TimingPolicy::seeded(TimingConfig::default(), 21)
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_without_error() {
        let page = MockPage::new();
        let sink = RecordingSink::new();
        let timing = timing();
        let cfg = config(60);
        let monitor = AvailabilityMonitor::new(&cfg, SLOT, &timing, &sink);
        let start = Instant::now();

        let outcome = monitor
            .watch(&page, &CancellationToken::new(), Some("a@x.com"))
            .await
            .unwrap();

        assert_eq!(outcome, MonitorOutcome::Exhausted { iterations: 12 });
        assert_eq!(start.elapsed(), Duration::from_secs(55));
        assert!(page.clicked().is_empty());
        assert!(sink.notifications().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_found_on_iteration_k_stops_polling() {
        let page = MockPage::new().with_elements_after(
            SLOT,
            2,
            vec![Element::new("slot-1", "td"), Element::new("slot-2", "td")],
        );
        let sink = RecordingSink::new();
        let timing = timing();
        let cfg = config(12);
        let monitor = AvailabilityMonitor::new(&cfg, SLOT, &timing, &sink);

        let outcome = monitor
            .watch(&page, &CancellationToken::new(), None)
            .await
            .unwrap();

        match outcome {
            MonitorOutcome::Found { iteration, element } => {
                assert_eq!(iteration, 2);
                assert_eq!(element.id, "slot-1");
            }
            other => panic!("expected Found, got {other:?}"),
        }
        assert_eq!(page.clicked(), vec!["slot-1".to_string()]);
        assert_eq!(page.query_count(SLOT), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_before_sleeping_past_ceiling() {
        let page = MockPage::new();
        let sink = RecordingSink::new();
        let timing = timing();
        let cfg = config(12);
        let monitor = AvailabilityMonitor::new(&cfg, SLOT, &timing, &sink);
        let start = Instant::now();

        let outcome = monitor
            .watch(&page, &CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(outcome, MonitorOutcome::Exhausted { iterations: 3 });
        assert_eq!(page.query_count(SLOT), 3);
        assert!(start.elapsed() <= Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ceiling_shorter_than_interval_polls_once() {
        let page = MockPage::new();
        let sink = RecordingSink::new();
        let timing = timing();
        let cfg = config(3);
        let monitor = AvailabilityMonitor::new(&cfg, SLOT, &timing, &sink);
        let start = Instant::now();

        let outcome = monitor
            .watch(&page, &CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(outcome, MonitorOutcome::Exhausted { iterations: 1 });
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_iteration_cap() {
        let page = MockPage::new();
        let sink = RecordingSink::new();
        let timing = timing();
        let mut cfg = config(3600);
        cfg.max_iterations = Some(3);
        let monitor = AvailabilityMonitor::new(&cfg, SLOT, &timing, &sink);

        let outcome = monitor
            .watch(&page, &CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(outcome, MonitorOutcome::Exhausted { iterations: 3 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_and_diagnostic_when_certain() {
        let page = MockPage::new();
        let sink = RecordingSink::new();
        let timing = timing();
        let mut cfg = config(3600);
        cfg.max_iterations = Some(3);
        cfg.refresh_probability = 1.0;
        cfg.diagnostic_probability = 1.0;
        let monitor = AvailabilityMonitor::new(&cfg, SLOT, &timing, &sink);

        monitor
            .watch(&page, &CancellationToken::new(), Some("a@x.com"))
            .await
            .unwrap();

        assert_eq!(page.reload_count(), 2);
        let sent = sink.notifications();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].issue_type, "Calendar Selectors May Have Changed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_first_poll() {
        let page = MockPage::new();
        let sink = RecordingSink::new();
        let timing = timing();
        let cfg = config(60);
        let monitor = AvailabilityMonitor::new(&cfg, SLOT, &timing, &sink);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = monitor.watch(&page, &cancel, None).await.unwrap();

        assert_eq!(outcome, MonitorOutcome::Cancelled { iterations: 0 });
        assert_eq!(page.query_count(SLOT), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_wait() {
        let page = MockPage::new();
        let sink = RecordingSink::new();
        let timing = timing();
        let cfg = config(600);
        let monitor = AvailabilityMonitor::new(&cfg, SLOT, &timing, &sink);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            trigger.cancel();
        });

        let outcome = monitor.watch(&page, &cancel, None).await.unwrap();

        assert_eq!(outcome, MonitorOutcome::Cancelled { iterations: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_listing_error_propagates() {
        let page = MockPage::new().failing_query(SLOT, DriverError::Script("gone".into()));
        let sink = RecordingSink::new();
        let timing = timing();
        let cfg = config(60);
        let monitor = AvailabilityMonitor::new(&cfg, SLOT, &timing, &sink);

        let result = monitor.watch(&page, &CancellationToken::new(), None).await;

        assert!(result.is_err());
    }
}
