//! Outbound email collaborator.
//!
//! The engine never talks to an email provider directly. The scheduler builds
//! an [`EmailMessage`] and hands it to an [`EmailSender`] injected at startup.
//! Each message carries a `dedup_key` (campaign id plus attempt number) that
//! implementations must honour: a second send with a key that was already
//! delivered returns the original receipt instead of sending again.

use crate::error::DeliveryError;
use crate::subject::CustomerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

/// A rendered-by-template email request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailMessage {
    /// Customer to deliver to.
    pub recipient: CustomerId,
    /// Template id, e.g. `cart_abandoned_attempt_1`.
    pub template_id: String,
    /// Template variables.
    pub variables: BTreeMap<String, String>,
    /// Provider-side idempotency key.
    pub dedup_key: String,
}

/// Successful hand-off to the provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    /// Provider delivery id.
    pub delivery_id: String,
}

/// Email delivery abstraction.
pub trait EmailSender: Send + Sync {
    /// Send (or idempotently re-acknowledge) a message.
    ///
    /// # Errors
    ///
    /// [`DeliveryError`] with `retryable` set for transient failures.
    fn send<'a>(
        &'a self,
        message: &'a EmailMessage,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryReceipt, DeliveryError>> + Send + 'a>>;
}
