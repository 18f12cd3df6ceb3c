use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use switchboard_core::{Envelope, SwitchboardResult};
use uuid::Uuid;

/// Broker confirmation that a message was accepted for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Id of the accepted message.
    pub message_id: Uuid,
    /// Topic it was published to.
    pub topic: String,
}

/// Puts an unsettled message back on its topic.
pub trait Redeliver: Send + Sync {
    /// Queue `envelope` for another delivery.
    fn redeliver(&self, envelope: Envelope);
}

/// Settlement handle for one delivery.
///
/// Dropping the handle without calling [`AckHandle::ack`] has the same
/// effect as [`AckHandle::nack`]: the message is redelivered.
pub struct AckHandle {
    envelope: Option<Envelope>,
    redeliver: Option<Arc<dyn Redeliver>>,
}

impl AckHandle {
    /// Create a new handle that redelivers `envelope` unless acknowledged.
    pub fn new(envelope: Envelope, redeliver: Arc<dyn Redeliver>) -> Self {
        Self {
            envelope: Some(envelope),
            redeliver: Some(redeliver),
        }
    }

    /// A handle for channels that settle on receipt.
    pub fn auto() -> Self {
        Self {
            envelope: None,
            redeliver: None,
        }
    }

    /// Settle the message; it will not be delivered again.
    pub fn ack(mut self) {
        self.redeliver = None;
        self.envelope = None;
    }

    /// Hand the message back for redelivery.
    pub fn nack(self) {
        drop(self);
    }
}

impl Drop for AckHandle {
    fn drop(&mut self) {
        if let (Some(envelope), Some(redeliver)) = (self.envelope.take(), self.redeliver.take()) {
            tracing::debug!(
                message_id = %envelope.message_id,
                topic = %envelope.topic,
                "Message not acknowledged; redelivering"
            );
            redeliver.redeliver(envelope);
        }
    }
}

/// A message handed to a consumer together with its settlement handle.
pub struct Delivery {
    /// The message.
    pub envelope: Envelope,
    /// Settles the message.
    pub handle: AckHandle,
}

impl Delivery {
    /// Acknowledge the message.
    pub fn ack(self) {
        self.handle.ack();
    }

    /// Reject the message so it is redelivered.
    pub fn nack(self) {
        self.handle.nack();
    }
}

/// Lazy stream of deliveries from one topic.
pub type Subscription = BoxStream<'static, Delivery>;

/// At-least-once publish/subscribe transport.
///
/// Consumers of the same topic compete for messages. Handlers must be
/// idempotent: an un-acked message is delivered again with a higher
/// `delivery_count`.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Name used in logs and health reports.
    fn name(&self) -> &str;
    /// Publish `envelope` on `topic`.
    async fn publish(&self, topic: &str, envelope: Envelope) -> SwitchboardResult<Ack>;
    /// Subscribe to `topic` as one of its competing consumers.
    async fn consume(&self, topic: &str) -> SwitchboardResult<Subscription>;
    /// Check that the broker is reachable.
    async fn ping(&self) -> SwitchboardResult<()>;
}
