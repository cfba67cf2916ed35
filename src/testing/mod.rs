//! Testing infrastructure for slotwarden.
//!
//! Scripted doubles for the external collaborators (the page driver, the
//! notification sink and the page factory) so the engine can be exercised
//! end to end without a browser.
//!
//! # Example
//!
//! ```rust,ignore
//! use slotwarden::testing::{MockPage, RecordingSink};
//!
//! let config = BotConfig::default();
//! let page = MockPage::booking_flow(&config.selectors)
//!     .without_element(&config.selectors.post_login_marker);
//! let sink = RecordingSink::new();
//! ```

pub mod mocks;

pub use mocks::*;
