//! Session State Tracker: the pure state machine behind every subject.
//!
//! [`apply_event`] folds one event into a subject's state. It performs no I/O
//! and reads no clock, so feeding the same ordered events from the same
//! starting point always produces the same state. Ingestion uses it
//! incrementally; [`replay`] uses it to rebuild a subject from scratch.
//!
//! # Transitions
//!
//! | From          | Event                                        | To            |
//! |---------------|----------------------------------------------|---------------|
//! | (none)        | any                                          | `started`, then as below |
//! | `started`/`in_progress` | activity                           | `in_progress` |
//! | `started`/`in_progress` | `design_completed`/`payment_completed` | `completed` |
//! | `started`/`in_progress` | `removed_from_cart` (cart item)    | `removed`     |
//! | `in_progress` | abandonment marker                           | `abandoned`   |
//! | `abandoned`   | `*_resumed`/`*_recovered`/completion         | `converted`   |
//! | `abandoned`   | anything else                                | `abandoned`   |
//! | terminal      | anything                                     | unchanged     |
//!
//! Recovery email tracking events (`recovery_email_*`, `recovery_link_clicked`)
//! never count as activity.

use chrono::{DateTime, Duration, Utc};
use funnel_recovery_core::config::EligibilityRules;
use funnel_recovery_core::event::{Event, EventType};
use funnel_recovery_core::session::{SessionState, SessionStatus};
use funnel_recovery_core::subject::SubjectType;

/// Fold `event` into `state` (or into a fresh state when `None`).
///
/// The returned state keeps the input's `version`; only the store moves it.
#[must_use]
pub fn apply_event(
    state: Option<SessionState>,
    event: &Event,
    rules: &EligibilityRules,
) -> SessionState {
    let mut state = state.unwrap_or_else(|| {
        SessionState::new(&event.subject_key(), event.customer_id.clone(), event.occurred_at)
    });

    state.last_event_id = Some(event.id);
    state.last_event_at = Some(event.occurred_at);
    if state.customer_id.is_none() {
        state.customer_id.clone_from(&event.customer_id);
    }

    match state.status {
        SessionStatus::Started | SessionStatus::InProgress => apply_while_open(&mut state, event),
        SessionStatus::Abandoned => apply_while_abandoned(&mut state, event),
        SessionStatus::Converted | SessionStatus::Completed | SessionStatus::Removed => {}
    }

    state.eligible_for_abandonment = is_eligible(&state, rules);
    state
}

fn apply_while_abandoned(state: &mut SessionState, event: &Event) {
    let converts = event.event_type.is_recovery()
        || matches!(
            event.event_type,
            EventType::DesignCompleted | EventType::PaymentCompleted
        );
    if converts {
        state.status = SessionStatus::Converted;
        state.converted_at = Some(event.occurred_at);
        state.updated_at = event.occurred_at;
    }
}

fn apply_while_open(state: &mut SessionState, event: &Event) {
    let at = event.occurred_at;
    match event.event_type {
        EventType::DesignAbandoned | EventType::CartAbandoned => {
            if state.status == SessionStatus::InProgress {
                state.status = SessionStatus::Abandoned;
                state.abandoned_at.get_or_insert(at);
                state.updated_at = at;
            }
            return;
        }
        EventType::RecoveryEmailSent
        | EventType::RecoveryEmailOpened
        | EventType::RecoveryLinkClicked => return,
        EventType::DesignCompleted | EventType::PaymentCompleted => {
            state.status = SessionStatus::Completed;
            state.closed_at = Some(at);
            state.in_checkout = false;
            state.updated_at = at;
            return;
        }
        EventType::RemovedFromCart if state.subject_type == SubjectType::CartItem => {
            state.status = SessionStatus::Removed;
            state.item_present = false;
            state.closed_at = Some(at);
            state.updated_at = at;
            return;
        }
        EventType::PhotoUploaded => state.photo_count = state.photo_count.saturating_add(1),
        EventType::PhotoRemoved => state.photo_count = state.photo_count.saturating_sub(1),
        EventType::CheckoutStarted | EventType::PaymentAttempted => state.in_checkout = true,
        // A failed payment puts the item back in the cart.
        EventType::PaymentFailed => state.in_checkout = false,
        _ => {}
    }

    if let Some(theme) = event.theme() {
        state.theme = Some(theme.to_string());
    }
    if state.subject_type == SubjectType::CartItem {
        state.item_present = true;
    }
    state.status = SessionStatus::InProgress;
    state.last_activity_at = at;
    state.updated_at = at;
}

/// Eligibility predicate for the abandonment sweep.
///
/// A subject is eligible when it is `in_progress`, meets its content rule
/// (a photo for design sessions when photos are required; an item that is
/// in the cart and not in checkout for cart items) and, when logged-in
/// customers are required, has a customer.
#[must_use]
pub fn is_eligible(state: &SessionState, rules: &EligibilityRules) -> bool {
    if state.status != SessionStatus::InProgress {
        return false;
    }
    let has_content = match state.subject_type {
        SubjectType::DesignSession => !rules.require_photos || state.photo_count >= 1,
        SubjectType::CartItem => state.item_present && !state.in_checkout,
    };
    let has_owner = !rules.require_logged_in || state.customer_id.is_some();
    has_content && has_owner
}

/// Whether `state` should be abandoned at `now` for the given threshold.
///
/// Elapsed inactivity must exceed the threshold (`now - last_activity_at > threshold`);
/// a subject idle for exactly the threshold is not yet due.
#[must_use]
pub fn is_due(
    state: &SessionState,
    now: DateTime<Utc>,
    threshold: Duration,
    rules: &EligibilityRules,
) -> bool {
    is_eligible(state, rules) && now - state.last_activity_at > threshold
}

/// Detector transition: abandon `state` at `now` if it is due.
///
/// Returns `None` when the subject is not (or no longer) due, which makes a
/// repeated sweep a no-op.
#[must_use]
pub fn mark_abandoned(
    state: &SessionState,
    now: DateTime<Utc>,
    threshold: Duration,
    rules: &EligibilityRules,
) -> Option<SessionState> {
    if !is_due(state, now, threshold, rules) || state.abandoned_at.is_some() {
        return None;
    }
    let mut next = state.clone();
    next.status = SessionStatus::Abandoned;
    next.abandoned_at = Some(now);
    next.eligible_for_abandonment = false;
    next.updated_at = now;
    Some(next)
}

/// Rebuild a subject from its ordered events. `None` for an empty stream.
#[must_use]
pub fn replay<'a>(
    events: impl IntoIterator<Item = &'a Event>,
    rules: &EligibilityRules,
) -> Option<SessionState> {
    events
        .into_iter()
        .fold(None, |state, event| Some(apply_event(state, event, rules)))
}

/// Keep a committed abandonment when a replayed state lost it.
///
/// A full replay can run before the detector's marker event is visible in the
/// stream. The stored abandonment still stands: the subject stays abandoned,
/// or becomes converted if the replay shows it finishing.
#[must_use]
pub fn retain_abandonment(mut replayed: SessionState, stored: &SessionState) -> SessionState {
    let Some(abandoned_at) = stored.abandoned_at else {
        return replayed;
    };
    if replayed.abandoned_at.is_some() {
        return replayed;
    }
    replayed.abandoned_at = Some(abandoned_at);
    replayed.eligible_for_abandonment = false;
    match replayed.status {
        SessionStatus::Completed | SessionStatus::Converted => {
            replayed.status = SessionStatus::Converted;
            replayed.converted_at = replayed.converted_at.or(replayed.closed_at);
            replayed.closed_at = None;
        }
        SessionStatus::Started | SessionStatus::InProgress | SessionStatus::Removed => {
            replayed.status = SessionStatus::Abandoned;
            replayed.closed_at = None;
        }
        SessionStatus::Abandoned => {}
    }
    replayed
}
