//! Recording email sender.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use funnel_recovery_core::email::{DeliveryReceipt, EmailMessage, EmailSender};
use funnel_recovery_core::error::DeliveryError;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct Outbox {
    sent: Vec<EmailMessage>,
    delivered: HashMap<String, String>,
    attempts: usize,
    scripted_failures: VecDeque<DeliveryError>,
    failing: Option<DeliveryError>,
}

/// Email sender that records messages instead of delivering them.
///
/// Like a real provider it deduplicates on [`EmailMessage::dedup_key`]: a
/// second send with the same key returns the original receipt and records
/// nothing.
#[derive(Clone, Debug, Default)]
pub struct MockEmailSender {
    outbox: Arc<RwLock<Outbox>>,
}

impl MockEmailSender {
    /// Create a sender that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next send with `error` (queued; one failure per call).
    pub fn fail_next(&self, error: DeliveryError) {
        self.outbox
            .write()
            .unwrap()
            .scripted_failures
            .push_back(error);
    }

    /// Fail every send with `error` until [`MockEmailSender::recover`].
    pub fn fail_always(&self, error: DeliveryError) {
        self.outbox.write().unwrap().failing = Some(error);
    }

    /// Stop failing.
    pub fn recover(&self) {
        let mut outbox = self.outbox.write().unwrap();
        outbox.failing = None;
        outbox.scripted_failures.clear();
    }

    /// Delivered messages, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<EmailMessage> {
        self.outbox.read().unwrap().sent.clone()
    }

    /// Number of delivered messages.
    #[must_use]
    pub fn sent_count(&self) -> usize {
        self.outbox.read().unwrap().sent.len()
    }

    /// Number of `send` calls, failed and deduplicated ones included.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.outbox.read().unwrap().attempts
    }
}

impl EmailSender for MockEmailSender {
    fn send<'a>(
        &'a self,
        message: &'a EmailMessage,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryReceipt, DeliveryError>> + Send + 'a>> {
        Box::pin(async move {
            let mut outbox = self.outbox.write().unwrap();
            outbox.attempts += 1;
            if let Some(error) = outbox.scripted_failures.pop_front() {
                return Err(error);
            }
            if let Some(error) = &outbox.failing {
                return Err(error.clone());
            }
            if let Some(delivery_id) = outbox.delivered.get(&message.dedup_key) {
                return Ok(DeliveryReceipt {
                    delivery_id: delivery_id.clone(),
                });
            }
            let delivery_id = format!("msg-{}", outbox.sent.len() + 1);
            outbox
                .delivered
                .insert(message.dedup_key.clone(), delivery_id.clone());
            outbox.sent.push(message.clone());
            Ok(DeliveryReceipt { delivery_id })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use funnel_recovery_core::subject::CustomerId;
    use std::collections::BTreeMap;

    fn message(dedup_key: &str) -> EmailMessage {
        EmailMessage {
            recipient: CustomerId::new("cust-1"),
            template_id: "design_abandoned_attempt_1".to_string(),
            variables: BTreeMap::new(),
            dedup_key: dedup_key.to_string(),
        }
    }

    #[test]
    fn deduplicates_on_key() {
        let sender = MockEmailSender::new();
        let first = tokio_test::block_on(sender.send(&message("c:1"))).unwrap();
        let second = tokio_test::block_on(sender.send(&message("c:1"))).unwrap();
        assert_eq!(first, second);
        assert_eq!(sender.sent_count(), 1);
        assert_eq!(sender.attempts(), 2);
    }

    #[test]
    fn scripted_failures_are_consumed_in_order() {
        let sender = MockEmailSender::new();
        sender.fail_next(DeliveryError::transient("timeout"));
        assert!(tokio_test::block_on(sender.send(&message("c:1"))).is_err());
        assert!(tokio_test::block_on(sender.send(&message("c:1"))).is_ok());
    }
}
