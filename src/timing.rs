//! Randomised pacing between page actions.
//!
//! Every delay suspends only the calling task. Pacing is best-effort:
//! [`TimingPolicy::type_text`] and [`TimingPolicy::scroll`] log driver
//! failures and return instead of propagating them.

use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::config::{DelayRange, TimingConfig, MAX_DELAY_SECS};
use crate::driver::{Element, PageDriver};

/// Source of bounded random delays and coin flips.
#[derive(Debug)]
pub struct TimingPolicy {
    config: TimingConfig,
    rng: Mutex<StdRng>,
}

impl TimingPolicy {
    /// Create a policy seeded from the operating system.
    #[must_use]
    pub fn new(config: TimingConfig) -> Self {
        Self {
            config,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Create a policy with a fixed seed, for reproducible runs.
    #[must_use]
    pub fn seeded(config: TimingConfig, seed: u64) -> Self {
        Self {
            config,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// The pacing configuration.
    #[must_use]
    pub fn config(&self) -> &TimingConfig {
        &self.config
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut rng)
    }

    /// Sample a duration uniformly from `range`.
    ///
    /// Bounds are clamped to `[0, MAX_DELAY_SECS]`; a non-finite range
    /// yields zero.
    #[must_use]
    pub fn sample(&self, range: DelayRange) -> Duration {
        if !range.min_secs.is_finite() || !range.max_secs.is_finite() {
            return Duration::ZERO;
        }
        let min = range.min_secs.clamp(0.0, MAX_DELAY_SECS);
        let max = range.max_secs.clamp(min, MAX_DELAY_SECS);
        let secs = if max > min {
            self.with_rng(|rng| rng.random_range(min..=max))
        } else {
            min
        };
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
    }

    /// True with probability `p` (clamped to `[0, 1]`).
    #[must_use]
    pub fn chance(&self, p: f64) -> bool {
        let p = if p.is_nan() { 0.0 } else { p.clamp(0.0, 1.0) };
        self.with_rng(|rng| rng.random_bool(p))
    }

    /// Uniform integer in `[min, max]`.
    #[must_use]
    pub fn pick(&self, min: u32, max: u32) -> u32 {
        let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
        self.with_rng(|rng| rng.random_range(lo..=hi))
    }

    /// Suspend for a duration sampled from `range`.
    pub async fn delay(&self, range: DelayRange) {
        let wait = self.sample(range);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Suspend for a duration sampled from `[min_secs, max_secs]`.
    pub async fn delay_secs(&self, min_secs: f64, max_secs: f64) {
        self.delay(DelayRange::new(min_secs, max_secs)).await;
    }

    /// Suspend for the configured default delay.
    pub async fn default_delay(&self) {
        self.delay(self.config.default_delay).await;
    }

    /// Type `text` into `element` one character at a time.
    ///
    /// Returns `false` if the driver failed part way; the failure is logged
    /// and the caller carries on.
    pub async fn type_text(&self, driver: &dyn PageDriver, element: &Element, text: &str) -> bool {
        if let Err(e) = driver.click(element).await {
            warn!("Could not focus field before typing: {}", e);
        }
        self.delay(self.config.focus).await;
        if let Err(e) = driver.fill(element, "").await {
            warn!("Could not clear field before typing: {}", e);
        }

        for ch in text.chars() {
            if let Err(e) = driver.type_char(element, ch).await {
                warn!("Typing interrupted: {}", e);
                return false;
            }
            self.delay(self.config.typing).await;
        }
        true
    }

    /// Scroll down the page and back up in uneven increments.
    ///
    /// Skipped when the page fits in the viewport.
    pub async fn scroll(&self, driver: &dyn PageDriver) {
        let page_height = match driver.evaluate("document.body.scrollHeight").await {
            Ok(v) => v.as_f64().unwrap_or(0.0),
            Err(e) => {
                warn!("Scroll skipped, page height unavailable: {}", e);
                return;
            }
        };
        let viewport_height = match driver.evaluate("window.innerHeight").await {
            Ok(v) => v.as_f64().unwrap_or(0.0),
            Err(e) => {
                warn!("Scroll skipped, viewport height unavailable: {}", e);
                return;
            }
        };

        if page_height <= viewport_height {
            debug!("Page fits in viewport, not scrolling");
            return;
        }

        let cfg = &self.config;
        let mut position = 0.0_f64;
        let mut increments = 0;
        while position < page_height && increments < cfg.scroll_max_increments {
            let step = self.pick(cfg.scroll_min_px, cfg.scroll_max_px);
            if let Err(e) = driver
                .evaluate(&format!("window.scrollBy(0, {step})"))
                .await
            {
                warn!("Scrolling down failed: {}", e);
                return;
            }
            position += f64::from(step);
            increments += 1;
            self.delay(cfg.scroll_step).await;
            if self.chance(cfg.scroll_pause_probability) {
                self.delay(cfg.scroll_pause).await;
            }
        }

        self.delay(cfg.scroll_pause).await;

        increments = 0;
        while position > 0.0 && increments < cfg.scroll_max_increments {
            let step = self.pick(cfg.scroll_min_px, cfg.scroll_max_px);
            if let Err(e) = driver
                .evaluate(&format!("window.scrollBy(0, -{step})"))
                .await
            {
                warn!("Scrolling up failed: {}", e);
                return;
            }
            position = (position - f64::from(step)).max(0.0);
            increments += 1;
            self.delay(cfg.scroll_step).await;
        }
    }
}
