//! Abandonment and recovery rules.
//!
//! [`EngineConfig`] is the structured configuration object every tick receives
//! explicitly. Its JSON shape is the admin settings document:
//!
//! ```json
//! {
//!   "designAbandonment": { "timeoutMinutes": 60, "maxRecoveryEmails": 3,
//!                          "emailDelayMinutes": [120, 1440, 4320],
//!                          "includeDiscountOnAttempt": 2, "discountPercent": 10 },
//!   "cartAbandonment":   { "timeoutMinutes": 30, "maxRecoveryEmails": 2,
//!                          "emailDelayMinutes": [60, 1440],
//!                          "includeDiscountOnAttempt": 2, "discountAmount": 5000 },
//!   "eligibility":       { "requirePhotos": true, "requireLoggedIn": true },
//!   "global":            { "enableRecoveryEmails": true,
//!                          "quietHoursStart": "22:00", "quietHoursEnd": "08:00",
//!                          "timezone": "Asia/Seoul", "maxEmailsPerCustomerPerDay": 1 }
//! }
//! ```
//!
//! Missing fields take their defaults. [`ConfigHandle`] holds the live value
//! and swaps it atomically on reload, so a running worker picks up new rules
//! on its next tick without a restart.

use crate::error::ValidationError;
use crate::subject::SubjectType;
use chrono::{Duration, NaiveTime};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;

/// Per-subject-type abandonment and recovery rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbandonmentRule {
    /// Inactivity after which an eligible subject is abandoned.
    pub timeout_minutes: u32,
    /// Recovery attempts per abandoned subject.
    pub max_recovery_emails: u32,
    /// Delay before attempt N is `email_delay_minutes[N - 1]`; the last entry
    /// repeats when the list is shorter than `max_recovery_emails`.
    pub email_delay_minutes: Vec<u32>,
    /// Attempt that carries a discount code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_discount_on_attempt: Option<u32>,
    /// Percentage discount offered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount_percent: Option<u32>,
    /// Fixed amount discount offered (minor currency units).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount_amount: Option<u64>,
}

/// Discount attached to a recovery attempt.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Discount {
    /// Percentage off.
    Percent(u32),
    /// Fixed amount off.
    Amount(u64),
}

impl Discount {
    /// Human-facing value for template variables (`10%`, `5000`).
    #[must_use]
    pub fn display_value(self) -> String {
        match self {
            Self::Percent(pct) => format!("{pct}%"),
            Self::Amount(amount) => amount.to_string(),
        }
    }
}

impl AbandonmentRule {
    fn design_default() -> Self {
        Self {
            timeout_minutes: 60,
            max_recovery_emails: 3,
            email_delay_minutes: vec![120, 1440, 4320],
            include_discount_on_attempt: Some(2),
            discount_percent: Some(10),
            discount_amount: None,
        }
    }

    fn cart_default() -> Self {
        Self {
            timeout_minutes: 30,
            max_recovery_emails: 2,
            email_delay_minutes: vec![60, 1440],
            include_discount_on_attempt: Some(2),
            discount_percent: None,
            discount_amount: Some(5000),
        }
    }

    /// Inactivity threshold.
    #[must_use]
    pub fn threshold(&self) -> Duration {
        Duration::minutes(i64::from(self.timeout_minutes))
    }

    /// Delay before `attempt_number` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt_number: u32) -> Duration {
        let index = attempt_number.saturating_sub(1) as usize;
        let minutes = self
            .email_delay_minutes
            .get(index)
            .or_else(|| self.email_delay_minutes.last())
            .copied()
            .unwrap_or(0);
        Duration::minutes(i64::from(minutes))
    }

    /// Discount for `attempt_number`, if that attempt carries one.
    /// A percentage wins over a fixed amount when both are configured.
    #[must_use]
    pub fn discount_for_attempt(&self, attempt_number: u32) -> Option<Discount> {
        if self.include_discount_on_attempt != Some(attempt_number) {
            return None;
        }
        self.discount_percent
            .map(Discount::Percent)
            .or_else(|| self.discount_amount.map(Discount::Amount))
    }

    fn validate(&self, section: &str) -> Result<(), ValidationError> {
        if self.timeout_minutes == 0 {
            return Err(ValidationError::config(
                format!("{section}.timeoutMinutes"),
                "must be greater than zero",
            ));
        }
        if self.max_recovery_emails == 0 {
            return Err(ValidationError::config(
                format!("{section}.maxRecoveryEmails"),
                "must be at least 1",
            ));
        }
        if self.email_delay_minutes.is_empty() {
            return Err(ValidationError::config(
                format!("{section}.emailDelayMinutes"),
                "must not be empty",
            ));
        }
        if let Some(attempt) = self.include_discount_on_attempt {
            if attempt == 0 || attempt > self.max_recovery_emails {
                return Err(ValidationError::config(
                    format!("{section}.includeDiscountOnAttempt"),
                    format!("must be between 1 and {}", self.max_recovery_emails),
                ));
            }
        }
        if self.discount_percent.is_some_and(|pct| pct > 100) {
            return Err(ValidationError::config(
                format!("{section}.discountPercent"),
                "must not exceed 100",
            ));
        }
        Ok(())
    }
}

/// Which subjects may be abandoned at all.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EligibilityRules {
    /// Design sessions need at least one photo.
    pub require_photos: bool,
    /// Subjects need a known customer.
    pub require_logged_in: bool,
}

impl Default for EligibilityRules {
    fn default() -> Self {
        Self {
            require_photos: true,
            require_logged_in: true,
        }
    }
}

/// Cross-cutting send policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalSettings {
    /// Master switch for the send tick.
    pub enable_recovery_emails: bool,
    /// Local `HH:MM` at which quiet hours begin.
    pub quiet_hours_start: String,
    /// Local `HH:MM` at which quiet hours end.
    pub quiet_hours_end: String,
    /// IANA timezone for quiet hours, daily caps and daily aggregates.
    pub timezone: String,
    /// Recovery emails per customer per local calendar day.
    pub max_emails_per_customer_per_day: u32,
    /// Retries after a transient delivery failure before giving up.
    pub max_delivery_retries: u32,
    /// How far in the future an ingested `occurredAt` may be.
    pub clock_skew_tolerance_seconds: u32,
    /// Rows a single tick examines.
    pub batch_size: u32,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            enable_recovery_emails: true,
            quiet_hours_start: "22:00".to_string(),
            quiet_hours_end: "08:00".to_string(),
            timezone: "Asia/Seoul".to_string(),
            max_emails_per_customer_per_day: 1,
            max_delivery_retries: 2,
            clock_skew_tolerance_seconds: 300,
            batch_size: 500,
        }
    }
}

impl GlobalSettings {
    /// Parsed timezone.
    ///
    /// # Errors
    ///
    /// [`ValidationError::InvalidConfig`] for an unknown IANA name.
    pub fn tz(&self) -> Result<Tz, ValidationError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| ValidationError::config("global.timezone", e.to_string()))
    }

    /// Parsed quiet-hour window; `None` when start equals end (disabled).
    ///
    /// # Errors
    ///
    /// [`ValidationError::InvalidConfig`] when either bound is not `HH:MM`.
    pub fn quiet_hours(&self) -> Result<Option<QuietHours>, ValidationError> {
        let start = parse_hhmm(&self.quiet_hours_start, "global.quietHoursStart")?;
        let end = parse_hhmm(&self.quiet_hours_end, "global.quietHoursEnd")?;
        Ok((start != end).then_some(QuietHours { start, end }))
    }

    /// Clock-skew tolerance as a duration.
    #[must_use]
    pub fn clock_skew_tolerance(&self) -> Duration {
        Duration::seconds(i64::from(self.clock_skew_tolerance_seconds))
    }
}

fn parse_hhmm(value: &str, field: &str) -> Result<NaiveTime, ValidationError> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .map_err(|_| ValidationError::config(field, format!("expected HH:MM, got '{value}'")))
}

/// Local-time window during which no email is sent. May wrap past midnight.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QuietHours {
    /// Inclusive start.
    pub start: NaiveTime,
    /// Exclusive end.
    pub end: NaiveTime,
}

impl QuietHours {
    /// Whether `time` falls inside the window.
    #[must_use]
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start < self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// Complete engine configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Rule for design sessions.
    pub design_abandonment: AbandonmentRule,
    /// Rule for cart items.
    pub cart_abandonment: AbandonmentRule,
    /// Eligibility predicate inputs.
    pub eligibility: EligibilityRules,
    /// Send policy.
    pub global: GlobalSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            design_abandonment: AbandonmentRule::design_default(),
            cart_abandonment: AbandonmentRule::cart_default(),
            eligibility: EligibilityRules::default(),
            global: GlobalSettings::default(),
        }
    }
}

const SECTIONS: [&str; 4] = ["designAbandonment", "cartAbandonment", "eligibility", "global"];

impl EngineConfig {
    /// Rule for a subject type.
    #[must_use]
    pub const fn rule(&self, subject_type: SubjectType) -> &AbandonmentRule {
        match subject_type {
            SubjectType::DesignSession => &self.design_abandonment,
            SubjectType::CartItem => &self.cart_abandonment,
        }
    }

    /// Check every value is usable.
    ///
    /// # Errors
    ///
    /// The first [`ValidationError::InvalidConfig`] found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.design_abandonment.validate("designAbandonment")?;
        self.cart_abandonment.validate("cartAbandonment")?;
        self.global.tz()?;
        self.global.quiet_hours()?;
        if self.global.max_emails_per_customer_per_day == 0 {
            return Err(ValidationError::config(
                "global.maxEmailsPerCustomerPerDay",
                "must be at least 1",
            ));
        }
        if self.global.batch_size == 0 {
            return Err(ValidationError::config("global.batchSize", "must be at least 1"));
        }
        Ok(())
    }

    /// Parse and validate a full settings document.
    ///
    /// # Errors
    ///
    /// [`ValidationError::InvalidConfig`] for malformed JSON or invalid values.
    pub fn from_json(json: &str) -> Result<Self, ValidationError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ValidationError::config("$", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply a partial settings document: each top-level section present in
    /// `patch` is merged key-by-key over the current section; sections not
    /// mentioned are kept as they are. The result is validated.
    ///
    /// # Errors
    ///
    /// [`ValidationError::InvalidConfig`] when `patch` is not an object, a
    /// section is not an object, or the merged configuration is invalid.
    pub fn merged(&self, patch: &Value) -> Result<Self, ValidationError> {
        let Value::Object(patch) = patch else {
            return Err(ValidationError::config("$", "expected a JSON object"));
        };
        let mut current =
            serde_json::to_value(self).map_err(|e| ValidationError::config("$", e.to_string()))?;

        for section in SECTIONS {
            let Some(section_patch) = patch.get(section) else {
                continue;
            };
            let Value::Object(fields) = section_patch else {
                return Err(ValidationError::config(section, "expected a JSON object"));
            };
            if let Some(Value::Object(target)) = current.get_mut(section) {
                for (key, value) in fields {
                    target.insert(key.clone(), value.clone());
                }
            }
        }

        let merged: Self = serde_json::from_value(current)
            .map_err(|e| ValidationError::config("$", e.to_string()))?;
        merged.validate()?;
        Ok(merged)
    }
}

/// Live, reloadable configuration.
///
/// Cloning the handle shares the underlying value. Readers take a cheap
/// [`Arc`] snapshot at the start of a tick and pass it down explicitly.
#[derive(Clone, Debug)]
pub struct ConfigHandle {
    sender: Arc<watch::Sender<Arc<EngineConfig>>>,
}

impl ConfigHandle {
    /// Wrap a validated configuration.
    ///
    /// # Errors
    ///
    /// [`ValidationError::InvalidConfig`] if `config` is invalid.
    pub fn new(config: EngineConfig) -> Result<Self, ValidationError> {
        config.validate()?;
        let (sender, _) = watch::channel(Arc::new(config));
        Ok(Self {
            sender: Arc::new(sender),
        })
    }

    /// Current configuration.
    #[must_use]
    pub fn snapshot(&self) -> Arc<EngineConfig> {
        Arc::clone(&self.sender.borrow())
    }

    /// Replace the configuration. Invalid values leave the current one in place.
    ///
    /// # Errors
    ///
    /// [`ValidationError::InvalidConfig`] if `config` is invalid.
    pub fn replace(&self, config: EngineConfig) -> Result<(), ValidationError> {
        config.validate()?;
        self.sender.send_replace(Arc::new(config));
        Ok(())
    }

    /// Merge a partial settings document into the current configuration.
    ///
    /// # Errors
    ///
    /// [`ValidationError::InvalidConfig`] if the patch or the result is invalid.
    pub fn apply_patch(&self, patch: &Value) -> Result<Arc<EngineConfig>, ValidationError> {
        let merged = Arc::new(self.snapshot().merged(patch)?);
        self.sender.send_replace(Arc::clone(&merged));
        Ok(merged)
    }

    /// Receiver notified on every change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<EngineConfig>> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.design_abandonment.threshold(), Duration::minutes(60));
        assert_eq!(config.cart_abandonment.threshold(), Duration::minutes(30));
        assert_eq!(
            config.design_abandonment.delay_for_attempt(1),
            Duration::minutes(120)
        );
    }

    #[test]
    fn delay_falls_back_to_last_entry() {
        let mut rule = AbandonmentRule::cart_default();
        rule.max_recovery_emails = 4;
        assert_eq!(rule.delay_for_attempt(2), Duration::minutes(1440));
        assert_eq!(rule.delay_for_attempt(4), Duration::minutes(1440));
    }

    #[test]
    fn discount_only_on_configured_attempt() {
        let config = EngineConfig::default();
        assert_eq!(config.design_abandonment.discount_for_attempt(1), None);
        assert_eq!(
            config.design_abandonment.discount_for_attempt(2),
            Some(Discount::Percent(10))
        );
        assert_eq!(
            config.cart_abandonment.discount_for_attempt(2),
            Some(Discount::Amount(5000))
        );
    }

    #[test]
    fn quiet_hours_wrap_midnight() {
        let quiet = GlobalSettings::default().quiet_hours().unwrap().unwrap();
        let at = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        assert!(quiet.contains(at(22, 0)));
        assert!(quiet.contains(at(3, 30)));
        assert!(!quiet.contains(at(8, 0)));
        assert!(!quiet.contains(at(21, 59)));
    }

    #[test]
    fn equal_quiet_bounds_disable_the_window() {
        let global = GlobalSettings {
            quiet_hours_start: "00:00".to_string(),
            quiet_hours_end: "00:00".to_string(),
            ..GlobalSettings::default()
        };
        assert_eq!(global.quiet_hours().unwrap(), None);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.cart_abandonment.email_delay_minutes.clear();
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidConfig { field, .. }) if field == "cartAbandonment.emailDelayMinutes"
        ));

        let mut config = EngineConfig::default();
        config.global.timezone = "Mars/Olympus".to_string();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.design_abandonment.include_discount_on_attempt = Some(9);
        assert!(config.validate().is_err());
    }

    #[test]
    fn merge_is_shallow_per_section() {
        let config = EngineConfig::default();
        let merged = config
            .merged(&json!({
                "designAbandonment": { "timeoutMinutes": 45 },
                "global": { "enableRecoveryEmails": false }
            }))
            .unwrap();

        assert_eq!(merged.design_abandonment.timeout_minutes, 45);
        assert_eq!(merged.design_abandonment.max_recovery_emails, 3);
        assert!(!merged.global.enable_recovery_emails);
        assert_eq!(merged.global.timezone, "Asia/Seoul");
        assert_eq!(merged.cart_abandonment, config.cart_abandonment);
    }

    #[test]
    fn invalid_merge_is_rejected() {
        let config = EngineConfig::default();
        assert!(config
            .merged(&json!({ "cartAbandonment": { "timeoutMinutes": 0 } }))
            .is_err());
        assert!(config.merged(&json!([1, 2])).is_err());
    }

    #[test]
    fn partial_document_takes_defaults() {
        let config = EngineConfig::from_json(r#"{"global": {"timezone": "UTC"}}"#).unwrap();
        assert_eq!(config.global.timezone, "UTC");
        assert_eq!(config.global.max_emails_per_customer_per_day, 1);
        assert_eq!(config.design_abandonment.timeout_minutes, 60);
    }

    #[test]
    fn handle_reload_is_visible_to_snapshots() {
        let handle = ConfigHandle::new(EngineConfig::default()).unwrap();
        let before = handle.snapshot();
        handle
            .apply_patch(&json!({ "cartAbandonment": { "timeoutMinutes": 15 } }))
            .unwrap();
        assert_eq!(before.cart_abandonment.timeout_minutes, 30);
        assert_eq!(handle.snapshot().cart_abandonment.timeout_minutes, 15);

        let mut bad = EngineConfig::default();
        bad.global.batch_size = 0;
        assert!(handle.replace(bad).is_err());
        assert_eq!(handle.snapshot().cart_abandonment.timeout_minutes, 15);
    }
}
