//! Page-automation collaborator interface.
//!
//! The engine never talks to a browser directly. Each session owns one
//! [`PageDriver`] for its lifetime; stealth payloads, user agents and headers
//! are applied by whoever constructs the driver.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by a page driver.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    /// A wait expired.
    #[error("Timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },

    /// A selector matched nothing when an element was required.
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    /// Connection level failure (DNS, reset, TLS).
    #[error("Network error: {0}")]
    Network(String),

    /// Navigation did not complete.
    #[error("Navigation failed: {0}")]
    Navigation(String),

    /// Script evaluation failed in the page.
    #[error("Script error: {0}")]
    Script(String),

    /// The page or browser context is gone.
    #[error("Page closed")]
    Closed,

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl DriverError {
    /// Check if this error is a transport failure.
    ///
    /// Transport failures are recorded as `NETWORK_ERROR` regardless of the
    /// step they occur in.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Navigation(_))
    }

    /// Create a timeout error
    pub fn timeout(what: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            timeout,
        }
    }
}

/// Result type for driver calls.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// When a navigation is considered complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WaitPolicy {
    /// `load` event fired.
    Load,
    /// DOM parsed.
    DomContentLoaded,
    /// No network activity for a short window.
    #[default]
    NetworkIdle,
}

/// Element state awaited by [`PageDriver::wait_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementState {
    /// Present and visible.
    Visible,
    /// Absent or hidden.
    Hidden,
    /// Present in the DOM.
    Attached,
}

/// Snapshot of a page element as seen by the driver.
///
/// `id` is an opaque handle the driver understands; the other fields are
/// captured at lookup time and are not kept in sync with the page.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    /// Driver-specific handle.
    pub id: String,
    /// Lower-case tag name, e.g. `input`, `select`.
    pub tag: String,
    /// Attributes at lookup time.
    pub attributes: BTreeMap<String, String>,
    /// Visible text content.
    pub text: String,
}

impl Element {
    /// Create an element snapshot.
    pub fn new(id: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tag: tag.into().to_lowercase(),
            attributes: BTreeMap::new(),
            text: String::new(),
        }
    }

    /// Add an attribute.
    #[must_use]
    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }

    /// Set the visible text.
    #[must_use]
    pub fn with_text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    /// Attribute lookup.
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// The `type` attribute, lower-cased; empty when absent.
    #[must_use]
    pub fn input_type(&self) -> String {
        self.attr("type").unwrap_or_default().to_lowercase()
    }
}

/// Abstraction over one isolated browser page.
///
/// Implementations must be safe to move into a task; one session uses one
/// driver exclusively, so no internal cross-session synchronisation is needed.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Navigate to `url` and wait according to `wait`.
    async fn navigate(&self, url: &str, wait: WaitPolicy) -> DriverResult<()>;

    /// Reload the current page.
    async fn reload(&self) -> DriverResult<()>;

    /// First element matching `selector`, if any.
    async fn find(&self, selector: &str) -> DriverResult<Option<Element>>;

    /// All elements matching `selector`, in document order.
    async fn find_all(&self, selector: &str) -> DriverResult<Vec<Element>>;

    /// All descendants of `parent` matching `selector`, in document order.
    async fn find_within(&self, parent: &Element, selector: &str) -> DriverResult<Vec<Element>>;

    /// Click an element.
    async fn click(&self, element: &Element) -> DriverResult<()>;

    /// Replace the value of an input.
    async fn fill(&self, element: &Element, text: &str) -> DriverResult<()>;

    /// Emit a single character of keyboard input into an element.
    async fn type_char(&self, element: &Element, ch: char) -> DriverResult<()>;

    /// Check a checkbox.
    async fn check(&self, element: &Element) -> DriverResult<()>;

    /// Select an option of a `<select>` by value.
    async fn select_option(&self, element: &Element, value: &str) -> DriverResult<()>;

    /// Evaluate a script and return its JSON value.
    async fn evaluate(&self, script: &str) -> DriverResult<serde_json::Value>;

    /// URL of the current page.
    async fn current_url(&self) -> DriverResult<String>;

    /// Full HTML content of the current page.
    async fn content(&self) -> DriverResult<String>;

    /// Wait until `selector` reaches `state`.
    ///
    /// Returns the element for [`ElementState::Visible`] and
    /// [`ElementState::Attached`], `None` for [`ElementState::Hidden`].
    async fn wait_for(
        &self,
        selector: &str,
        state: ElementState,
        timeout: Duration,
    ) -> DriverResult<Option<Element>>;

    /// Wait for the navigation triggered by the last action to settle.
    async fn wait_for_navigation(&self, timeout: Duration) -> DriverResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(DriverError::Network("reset".into()).is_transport());
        assert!(DriverError::Navigation("aborted".into()).is_transport());
        assert!(!DriverError::Closed.is_transport());
        assert!(!DriverError::timeout("#x", Duration::from_secs(1)).is_transport());
        assert!(!DriverError::ElementNotFound("#x".into()).is_transport());
    }

    #[test]
    fn test_element_builder() {
        let el = Element::new("e1", "INPUT")
            .with_attr("type", "Email")
            .with_text("hello");
        assert_eq!(el.tag, "input");
        assert_eq!(el.input_type(), "email");
        assert_eq!(el.attr("missing"), None);
        assert_eq!(el.text, "hello");
    }

    #[test]
    fn test_wait_policy_default_is_network_idle() {
        assert_eq!(WaitPolicy::default(), WaitPolicy::NetworkIdle);
    }
}
