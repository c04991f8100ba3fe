//! Email sender that writes messages to the log instead of a provider.

use funnel_recovery_core::email::{DeliveryReceipt, EmailMessage, EmailSender};
use funnel_recovery_core::error::DeliveryError;
use std::future::Future;
use std::pin::Pin;
use tracing::info;

/// Logs every message at `info` and acknowledges it.
///
/// The delivery id is derived from the dedup key, so a repeated send of the
/// same attempt returns the same receipt.
#[derive(Copy, Clone, Debug, Default)]
pub struct ConsoleEmailSender;

impl EmailSender for ConsoleEmailSender {
    fn send<'a>(
        &'a self,
        message: &'a EmailMessage,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryReceipt, DeliveryError>> + Send + 'a>> {
        Box::pin(async move {
            info!(
                recipient = message.recipient.as_str(),
                template = %message.template_id,
                dedup_key = %message.dedup_key,
                variables = ?message.variables,
                "Recovery email"
            );
            Ok(DeliveryReceipt {
                delivery_id: format!("console-{}", message.dedup_key),
            })
        })
    }
}
