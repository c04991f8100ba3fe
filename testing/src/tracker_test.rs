//! Ergonomic testing utilities for the session state machine
//!
//! This module provides a fluent API for testing event application with
//! readable Given-When-Then syntax.

#![allow(clippy::module_name_repetitions)] // TrackerTest is the natural name

use funnel_recovery_core::config::EligibilityRules;
use funnel_recovery_core::event::Event;
use funnel_recovery_core::session::SessionState;
use funnel_recovery_runtime::tracker;

/// Type alias for state assertion functions
type StateAssertion = Box<dyn FnOnce(&SessionState)>;

/// Fluent API for testing the tracker with Given-When-Then syntax
///
/// # Example
///
/// ```ignore
/// use funnel_recovery_testing::{EventBuilder, TrackerTest, design_session};
///
/// let key = design_session("ds-1");
/// TrackerTest::new()
///     .given_events(vec![EventBuilder::new(&key, EventType::ThemeSelected).id(1).build()])
///     .when_event(EventBuilder::new(&key, EventType::PhotoUploaded).id(2).build())
///     .then_state(|state| {
///         assert_eq!(state.photo_count, 1);
///         assert!(state.eligible_for_abandonment);
///     })
///     .run();
/// ```
pub struct TrackerTest {
    rules: EligibilityRules,
    history: Vec<Event>,
    initial_state: Option<SessionState>,
    events: Vec<Event>,
    state_assertions: Vec<StateAssertion>,
}

impl TrackerTest {
    /// Create a new tracker test with default eligibility rules
    #[must_use]
    pub fn new() -> Self {
        Self {
            rules: EligibilityRules::default(),
            history: Vec::new(),
            initial_state: None,
            events: Vec::new(),
            state_assertions: Vec::new(),
        }
    }

    /// Set the eligibility rules for the test
    #[must_use]
    pub const fn with_rules(mut self, rules: EligibilityRules) -> Self {
        self.rules = rules;
        self
    }

    /// Start from the state these events replay to (Given)
    #[must_use]
    pub fn given_events(mut self, events: Vec<Event>) -> Self {
        self.history = events;
        self
    }

    /// Start from an explicit state (Given); takes precedence over history
    #[must_use]
    pub fn given_state(mut self, state: SessionState) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Add an event to apply (When); may be called repeatedly
    #[must_use]
    pub fn when_event(mut self, event: Event) -> Self {
        self.events.push(event);
        self
    }

    /// Add an assertion about the resulting state (Then)
    #[must_use]
    pub fn then_state<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&SessionState) + 'static,
    {
        self.state_assertions.push(Box::new(assertion));
        self
    }

    /// Run the test and execute all assertions
    ///
    /// # Panics
    ///
    /// Panics if no event was given with `when_event()` or if any assertion fails.
    #[allow(clippy::panic)] // Test code can panic
    #[allow(clippy::expect_used)] // Test code can use expect
    pub fn run(self) {
        assert!(!self.events.is_empty(), "At least one event must be set with when_event()");

        let initial = self
            .initial_state
            .or_else(|| tracker::replay(&self.history, &self.rules));
        let state = self
            .events
            .iter()
            .fold(initial, |state, event| {
                Some(tracker::apply_event(state, event, &self.rules))
            })
            .expect("applying an event always yields a state");

        for assertion in self.state_assertions {
            assertion(&state);
        }
    }
}

impl Default for TrackerTest {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers::{EventBuilder, cart_item, design_session};
    use funnel_recovery_core::event::EventType;
    use funnel_recovery_core::session::SessionStatus;

    #[test]
    fn photo_makes_design_eligible() {
        let key = design_session("ds-1");
        TrackerTest::new()
            .given_events(vec![EventBuilder::new(&key, EventType::ThemeSelected).theme("BDAY").id(1).build()])
            .when_event(EventBuilder::new(&key, EventType::PhotoUploaded).id(2).build())
            .then_state(|state| {
                assert_eq!(state.status, SessionStatus::InProgress);
                assert_eq!(state.photo_count, 1);
                assert_eq!(state.theme.as_deref(), Some("BDAY"));
                assert!(state.eligible_for_abandonment);
            })
            .run();
    }

    #[test]
    fn checkout_makes_cart_ineligible() {
        let key = cart_item("ci-1");
        TrackerTest::new()
            .given_events(vec![EventBuilder::new(&key, EventType::AddedToCart).id(1).build()])
            .when_event(EventBuilder::new(&key, EventType::CheckoutStarted).id(2).build())
            .then_state(|state| {
                assert!(state.in_checkout);
                assert!(!state.eligible_for_abandonment);
            })
            .run();
    }

    #[test]
    fn logged_out_design_is_never_eligible_by_default() {
        let key = design_session("ds-1");
        TrackerTest::new()
            .when_event(EventBuilder::new(&key, EventType::PhotoUploaded).anonymous().build())
            .then_state(|state| assert!(!state.eligible_for_abandonment))
            .run();
    }

    #[test]
    fn relaxed_rules_allow_logged_out_subjects() {
        let key = design_session("ds-1");
        TrackerTest::new()
            .with_rules(EligibilityRules {
                require_photos: false,
                require_logged_in: false,
            })
            .when_event(EventBuilder::new(&key, EventType::TextEdited).anonymous().build())
            .then_state(|state| assert!(state.eligible_for_abandonment))
            .run();
    }
}
