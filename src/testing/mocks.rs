//! Scripted test doubles for the page driver and the notification sink.
//!
//! These mocks record every interaction so tests can assert on what the
//! engine did, and let tests script when elements appear.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Selectors;
use crate::driver::{DriverError, DriverResult, Element, ElementState, PageDriver, WaitPolicy};
use crate::notify::{Alert, NotificationSink};
use crate::runner::PageFactory;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Elements registered under one selector.
#[derive(Debug, Clone)]
struct Listing {
    elements: Vec<Element>,
    /// Query number (1-indexed) from which the elements are present.
    from_query: u32,
}

/// Everything the mock page has observed.
#[derive(Debug, Default)]
struct Recorded {
    navigations: Vec<String>,
    clicks: Vec<String>,
    values: HashMap<String, String>,
    checked: Vec<String>,
    selected: Vec<(String, String)>,
    scripts: Vec<String>,
    reloads: u32,
    queries: HashMap<String, u32>,
}

/// Mock implementation of a browser page.
///
/// Selectors are matched by exact string. Waiting for something that never
/// shows up sleeps for the full timeout (use paused tokio time in tests) and
/// then fails with [`DriverError::Timeout`].
///
/// # Example
///
/// ```rust,ignore
/// let page = MockPage::new()
///     .with_element("#email", Element::new("email", "input"))
///     .with_elements_after(".available", 2, vec![Element::new("slot", "td")]);
///
/// // ... run code against &page ...
/// assert_eq!(page.clicked(), vec!["slot".to_string()]);
/// ```
#[derive(Debug, Default)]
pub struct MockPage {
    listings: HashMap<String, Listing>,
    children: HashMap<(String, String), Vec<Element>>,
    sticky: HashSet<String>,
    query_errors: HashMap<String, DriverError>,
    navigate_errors: HashMap<String, DriverError>,
    navigation_wait_error: Option<DriverError>,
    content: HashMap<String, String>,
    default_content: String,
    page_height: f64,
    viewport_height: f64,
    final_url: Option<String>,
    typing_fails: bool,
    recorded: Mutex<Recorded>,
}

impl MockPage {
    /// Create an empty page: nothing matches, every wait times out.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A page where every step of the booking flow succeeds on the first
    /// try, given the selectors in use.
    #[must_use]
    pub fn booking_flow(selectors: &Selectors) -> Self {
        Self::new()
            .with_element(
                &selectors.email_input,
                Element::new("email", "input").with_attr("type", "email"),
            )
            .with_element(
                &selectors.password_input,
                Element::new("password", "input").with_attr("type", "password"),
            )
            .with_element(&selectors.login_submit, Element::new("login-submit", "button"))
            .with_element(&selectors.post_login_marker, Element::new("user-info", "div"))
            .with_element(&selectors.authenticated_marker, Element::new("logout", "a"))
            .with_element(&selectors.book_button, Element::new("book", "a"))
            .with_element(&selectors.available_slot, Element::new("slot-1", "td"))
            .with_element(&selectors.confirm_button, Element::new("confirm", "button"))
            .with_final_url("https://appointments.example.com/payment")
    }

    /// Register an element present from the first query.
    #[must_use]
    pub fn with_element(self, selector: &str, element: Element) -> Self {
        self.with_elements_after(selector, 1, vec![element])
    }

    /// Register elements that only appear from query number `from_query`.
    #[must_use]
    pub fn with_elements_after(
        mut self,
        selector: &str,
        from_query: u32,
        elements: Vec<Element>,
    ) -> Self {
        self.listings.insert(
            selector.to_string(),
            Listing {
                elements,
                from_query: from_query.max(1),
            },
        );
        self
    }

    /// Remove whatever is registered under `selector`.
    #[must_use]
    pub fn without_element(mut self, selector: &str) -> Self {
        self.listings.remove(selector);
        self
    }

    /// Register children of `parent_id` matching `selector`.
    #[must_use]
    pub fn with_children(mut self, parent_id: &str, selector: &str, children: Vec<Element>) -> Self {
        self.children
            .insert((parent_id.to_string(), selector.to_string()), children);
        self
    }

    /// Make `selector` never disappear when waited on as hidden.
    #[must_use]
    pub fn with_sticky(mut self, selector: &str) -> Self {
        self.sticky.insert(selector.to_string());
        self
    }

    /// Fail every query for `selector`.
    #[must_use]
    pub fn failing_query(mut self, selector: &str, error: DriverError) -> Self {
        self.query_errors.insert(selector.to_string(), error);
        self
    }

    /// Fail navigation to `url`.
    #[must_use]
    pub fn failing_navigation(mut self, url: &str, error: DriverError) -> Self {
        self.navigate_errors.insert(url.to_string(), error);
        self
    }

    /// Fail every `wait_for_navigation`.
    #[must_use]
    pub fn failing_navigation_wait(mut self, error: DriverError) -> Self {
        self.navigation_wait_error = Some(error);
        self
    }

    /// Page content served after navigating to `url`.
    #[must_use]
    pub fn with_content_at(mut self, url: &str, content: &str) -> Self {
        self.content.insert(url.to_string(), content.to_string());
        self
    }

    /// Page content served when no per-url content is set.
    #[must_use]
    pub fn with_content(mut self, content: &str) -> Self {
        self.default_content = content.to_string();
        self
    }

    /// Heights reported to scroll scripts.
    #[must_use]
    pub fn with_page_height(mut self, page: f64, viewport: f64) -> Self {
        self.page_height = page;
        self.viewport_height = viewport;
        self
    }

    /// URL reported by `current_url` regardless of navigation.
    #[must_use]
    pub fn with_final_url(mut self, url: &str) -> Self {
        self.final_url = Some(url.to_string());
        self
    }

    /// Make every `type_char` fail.
    #[must_use]
    pub fn failing_typing(mut self) -> Self {
        self.typing_fails = true;
        self
    }

    fn query(&self, selector: &str) -> DriverResult<Vec<Element>> {
        let count = {
            let mut recorded = lock(&self.recorded);
            let count = recorded.queries.entry(selector.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if let Some(err) = self.query_errors.get(selector) {
            return Err(err.clone());
        }
        Ok(self
            .listings
            .get(selector)
            .filter(|listing| count >= listing.from_query)
            .map(|listing| listing.elements.clone())
            .unwrap_or_default())
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// URLs navigated to, in order.
    pub fn navigations(&self) -> Vec<String> {
        lock(&self.recorded).navigations.clone()
    }

    /// Ids of clicked elements, in order.
    pub fn clicked(&self) -> Vec<String> {
        lock(&self.recorded).clicks.clone()
    }

    /// Current value of the element with `id`, as filled and typed.
    pub fn typed_text(&self, id: &str) -> String {
        lock(&self.recorded)
            .values
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Ids of checked checkboxes.
    pub fn checked(&self) -> Vec<String> {
        lock(&self.recorded).checked.clone()
    }

    /// `(select id, value)` pairs chosen.
    pub fn selected(&self) -> Vec<(String, String)> {
        lock(&self.recorded).selected.clone()
    }

    /// Evaluated scripts containing `needle`.
    pub fn scripts_matching(&self, needle: &str) -> Vec<String> {
        lock(&self.recorded)
            .scripts
            .iter()
            .filter(|s| s.contains(needle))
            .cloned()
            .collect()
    }

    /// Number of reloads.
    pub fn reload_count(&self) -> u32 {
        lock(&self.recorded).reloads
    }

    /// Number of queries made for `selector`.
    pub fn query_count(&self, selector: &str) -> u32 {
        lock(&self.recorded)
            .queries
            .get(selector)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl PageDriver for MockPage {
    async fn navigate(&self, url: &str, _wait: WaitPolicy) -> DriverResult<()> {
        lock(&self.recorded).navigations.push(url.to_string());
        match self.navigate_errors.get(url) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn reload(&self) -> DriverResult<()> {
        lock(&self.recorded).reloads += 1;
        Ok(())
    }

    async fn find(&self, selector: &str) -> DriverResult<Option<Element>> {
        Ok(self.query(selector)?.into_iter().next())
    }

    async fn find_all(&self, selector: &str) -> DriverResult<Vec<Element>> {
        self.query(selector)
    }

    async fn find_within(&self, parent: &Element, selector: &str) -> DriverResult<Vec<Element>> {
        Ok(self
            .children
            .get(&(parent.id.clone(), selector.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn click(&self, element: &Element) -> DriverResult<()> {
        lock(&self.recorded).clicks.push(element.id.clone());
        Ok(())
    }

    async fn fill(&self, element: &Element, text: &str) -> DriverResult<()> {
        lock(&self.recorded)
            .values
            .insert(element.id.clone(), text.to_string());
        Ok(())
    }

    async fn type_char(&self, element: &Element, ch: char) -> DriverResult<()> {
        if self.typing_fails {
            return Err(DriverError::Other("keyboard unavailable".to_string()));
        }
        lock(&self.recorded)
            .values
            .entry(element.id.clone())
            .or_default()
            .push(ch);
        Ok(())
    }

    async fn check(&self, element: &Element) -> DriverResult<()> {
        lock(&self.recorded).checked.push(element.id.clone());
        Ok(())
    }

    async fn select_option(&self, element: &Element, value: &str) -> DriverResult<()> {
        lock(&self.recorded)
            .selected
            .push((element.id.clone(), value.to_string()));
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> DriverResult<serde_json::Value> {
        lock(&self.recorded).scripts.push(script.to_string());
        let value = match script {
            "document.body.scrollHeight" => serde_json::json!(self.page_height),
            "window.innerHeight" => serde_json::json!(self.viewport_height),
            _ => serde_json::Value::Null,
        };
        Ok(value)
    }

    async fn current_url(&self) -> DriverResult<String> {
        if let Some(url) = &self.final_url {
            return Ok(url.clone());
        }
        Ok(lock(&self.recorded)
            .navigations
            .last()
            .cloned()
            .unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn content(&self) -> DriverResult<String> {
        let url = lock(&self.recorded).navigations.last().cloned();
        Ok(url
            .and_then(|u| self.content.get(&u).cloned())
            .unwrap_or_else(|| self.default_content.clone()))
    }

    async fn wait_for(
        &self,
        selector: &str,
        state: ElementState,
        timeout: Duration,
    ) -> DriverResult<Option<Element>> {
        match state {
            ElementState::Hidden => {
                if self.sticky.contains(selector) {
                    tokio::time::sleep(timeout).await;
                    return Err(DriverError::timeout(selector, timeout));
                }
                Ok(None)
            }
            ElementState::Visible | ElementState::Attached => {
                match self.query(selector)?.into_iter().next() {
                    Some(element) => Ok(Some(element)),
                    None => {
                        tokio::time::sleep(timeout).await;
                        Err(DriverError::timeout(selector, timeout))
                    }
                }
            }
        }
    }

    async fn wait_for_navigation(&self, _timeout: Duration) -> DriverResult<()> {
        match &self.navigation_wait_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// Mock notification sink that keeps every alert in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    alerts: Mutex<Vec<Alert>>,
    fails: bool,
}

impl RecordingSink {
    /// Create a sink that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record alerts but report delivery failure.
    #[must_use]
    pub fn failing(mut self) -> Self {
        self.fails = true;
        self
    }

    /// Alerts received so far.
    pub fn notifications(&self) -> Vec<Alert> {
        lock(&self.alerts).clone()
    }

    /// Alerts received with `issue_type`.
    pub fn count_of(&self, issue_type: &str) -> usize {
        lock(&self.alerts)
            .iter()
            .filter(|a| a.issue_type == issue_type)
            .count()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, issue_type: &str, detail: &str, identity: Option<&str>) -> bool {
        lock(&self.alerts).push(Alert::new(issue_type, detail, identity));
        !self.fails
    }
}

type PageBuilder = dyn Fn(&str) -> MockPage + Send + Sync;

/// Page factory handing out a fresh [`MockPage`] per identity.
pub struct MockPageFactory {
    build: Box<PageBuilder>,
    pages: Mutex<Vec<(String, Arc<MockPage>)>>,
}

impl MockPageFactory {
    /// Build pages with `build(identity)`.
    pub fn new(build: impl Fn(&str) -> MockPage + Send + Sync + 'static) -> Self {
        Self {
            build: Box::new(build),
            pages: Mutex::new(Vec::new()),
        }
    }

    /// Pages created so far, with the identity each was opened for.
    pub fn pages(&self) -> Vec<(String, Arc<MockPage>)> {
        lock(&self.pages).clone()
    }
}

#[async_trait]
impl PageFactory for MockPageFactory {
    async fn open(&self, identity: &str) -> DriverResult<Arc<dyn PageDriver>> {
        let page = Arc::new((self.build)(identity));
        lock(&self.pages).push((identity.to_string(), Arc::clone(&page)));
        let driver: Arc<dyn PageDriver> = page;
        Ok(driver)
    }
}
