use crate::channel::{Ack, AckHandle, Delivery, MessageChannel, Redeliver, Subscription};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use switchboard_core::{Envelope, SwitchboardError, SwitchboardResult};
use tokio::sync::Notify;
use tracing::debug;

const HISTORY_LIMIT: usize = 10_000;
const DEFAULT_BACKLOG_LIMIT: usize = 1_000;

#[derive(Clone)]
struct Topic {
    queue: Arc<Mutex<VecDeque<Envelope>>>,
    ready: Arc<Notify>,
    subscribers: Arc<AtomicUsize>,
}

impl Topic {
    fn new() -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            ready: Arc::new(Notify::new()),
            subscribers: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn push(&self, envelope: Envelope) {
        self.queue.lock().push_back(envelope);
        self.ready.notify_one();
    }

    async fn pop(&self) -> Envelope {
        loop {
            let next = self.queue.lock().pop_front();
            if let Some(envelope) = next {
                return envelope;
            }
            self.ready.notified().await;
        }
    }
}

impl Redeliver for Topic {
    fn redeliver(&self, envelope: Envelope) {
        self.push(envelope);
    }
}

/// Counts a live subscription for as long as its stream exists.
struct Subscriber(Arc<AtomicUsize>);

impl Subscriber {
    fn join(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count.clone())
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-process message channel with at-least-once delivery.
///
/// Each topic is a single queue shared by all of its consumers. While a
/// topic has no subscriber its backlog is capped and the oldest messages
/// are dropped first; a subscribed topic keeps everything until it is
/// consumed. Every publish is also kept in a per-topic history so callers
/// can inspect what went out.
pub struct MemoryChannel {
    name: String,
    topics: Mutex<HashMap<String, Topic>>,
    history: Mutex<HashMap<String, VecDeque<Envelope>>>,
    backlog_limit: usize,
    available: AtomicBool,
}

impl MemoryChannel {
    /// Create a new channel with the default backlog limit.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            topics: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            backlog_limit: DEFAULT_BACKLOG_LIMIT,
            available: AtomicBool::new(true),
        }
    }

    /// Messages kept on a topic nobody consumes. At least 1.
    pub fn with_backlog_limit(mut self, limit: usize) -> Self {
        self.backlog_limit = limit.max(1);
        self
    }

    /// Simulate a broker outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Everything published to `topic` so far, oldest first.
    pub fn published(&self, topic: &str) -> Vec<Envelope> {
        self.history
            .lock()
            .get(topic)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of messages published to `topic` still in the history.
    pub fn published_count(&self, topic: &str) -> usize {
        self.history.lock().get(topic).map_or(0, VecDeque::len)
    }

    /// Messages waiting on `topic` for a consumer.
    pub fn backlog(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map_or(0, |t| t.queue.lock().len())
    }

    fn topic(&self, name: &str) -> Topic {
        self.topics
            .lock()
            .entry(name.to_string())
            .or_insert_with(Topic::new)
            .clone()
    }

    fn check_available(&self) -> SwitchboardResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SwitchboardError::ChannelUnavailable(format!(
                "channel '{}' is offline",
                self.name
            )))
        }
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, topic: &str, mut envelope: Envelope) -> SwitchboardResult<Ack> {
        self.check_available()?;
        envelope.topic = topic.to_string();
        let ack = Ack {
            message_id: envelope.message_id,
            topic: topic.to_string(),
        };
        {
            let mut history = self.history.lock();
            let entries = history.entry(topic.to_string()).or_default();
            if entries.len() >= HISTORY_LIMIT {
                entries.pop_front();
            }
            entries.push_back(envelope.clone());
        }

        let queue = self.topic(topic);
        if queue.subscribers.load(Ordering::SeqCst) == 0 {
            let mut backlog = queue.queue.lock();
            while backlog.len() >= self.backlog_limit {
                if let Some(dropped) = backlog.pop_front() {
                    debug!(
                        topic,
                        message_id = %dropped.message_id,
                        "Topic has no subscriber; dropping oldest message"
                    );
                }
            }
        }
        queue.push(envelope);
        Ok(ack)
    }

    async fn consume(&self, topic: &str) -> SwitchboardResult<Subscription> {
        self.check_available()?;
        let topic = self.topic(topic);
        let subscriber = Subscriber::join(&topic.subscribers);
        let redeliver: Arc<dyn Redeliver> = Arc::new(topic.clone());
        let stream = futures_util::stream::unfold(
            (topic, redeliver, subscriber),
            |(topic, redeliver, subscriber)| async move {
                let mut envelope = topic.pop().await;
                envelope.delivery_count += 1;
                let handle = AckHandle::new(envelope.clone(), redeliver.clone());
                Some((Delivery { envelope, handle }, (topic, redeliver, subscriber)))
            },
        );
        Ok(stream.boxed())
    }

    async fn ping(&self) -> SwitchboardResult<()> {
        self.check_available()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next(sub: &mut Subscription) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .expect("delivery timed out")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn test_publish_then_consume() {
        let channel = MemoryChannel::default();
        let envelope = Envelope::new("ignored", serde_json::json!({"n": 1}));
        let ack = channel.publish("tasks.default", envelope).await.unwrap();
        assert_eq!(ack.topic, "tasks.default");

        let mut sub = channel.consume("tasks.default").await.unwrap();
        let delivery = next(&mut sub).await;
        assert_eq!(delivery.envelope.message_id, ack.message_id);
        assert_eq!(delivery.envelope.topic, "tasks.default");
        assert_eq!(delivery.envelope.delivery_count, 1);
        delivery.ack();
        assert_eq!(channel.published_count("tasks.default"), 1);
    }

    #[tokio::test]
    async fn test_nack_redelivers_with_higher_count() {
        let channel = MemoryChannel::default();
        channel
            .publish("t", Envelope::new("t", serde_json::Value::Null))
            .await
            .unwrap();
        let mut sub = channel.consume("t").await.unwrap();

        let first = next(&mut sub).await;
        let id = first.envelope.message_id;
        first.nack();

        let second = next(&mut sub).await;
        assert_eq!(second.envelope.message_id, id);
        assert_eq!(second.envelope.delivery_count, 2);
        assert!(second.envelope.is_redelivery());
        second.ack();
    }

    #[tokio::test]
    async fn test_dropped_handle_redelivers() {
        let channel = MemoryChannel::default();
        channel
            .publish("t", Envelope::new("t", serde_json::Value::Null))
            .await
            .unwrap();
        let mut sub = channel.consume("t").await.unwrap();
        {
            let _unsettled = next(&mut sub).await;
        }
        let again = next(&mut sub).await;
        assert_eq!(again.envelope.delivery_count, 2);
        again.ack();

        let nothing = tokio::time::timeout(Duration::from_millis(50), sub.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_competing_consumers_share_topic() {
        let channel = MemoryChannel::default();
        for i in 0..4 {
            channel
                .publish("t", Envelope::new("t", serde_json::json!(i)))
                .await
                .unwrap();
        }
        let mut a = channel.consume("t").await.unwrap();
        let mut b = channel.consume("t").await.unwrap();
        let mut seen = Vec::new();
        for _ in 0..2 {
            let d = next(&mut a).await;
            seen.push(d.envelope.payload.as_i64().unwrap());
            d.ack();
            let d = next(&mut b).await;
            seen.push(d.envelope.payload.as_i64().unwrap());
            d.ack();
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_unconsumed_topic_keeps_newest() {
        let channel = MemoryChannel::default().with_backlog_limit(3);
        for i in 0..5 {
            channel
                .publish("tasks.events", Envelope::new("t", serde_json::json!(i)))
                .await
                .unwrap();
        }
        assert_eq!(channel.backlog("tasks.events"), 3);
        assert_eq!(channel.published_count("tasks.events"), 5);

        let mut sub = channel.consume("tasks.events").await.unwrap();
        for expected in 2..5 {
            let d = next(&mut sub).await;
            assert_eq!(d.envelope.payload.as_i64().unwrap(), expected);
            d.ack();
        }
        let nothing = tokio::time::timeout(Duration::from_millis(50), sub.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_subscribed_topic_is_not_capped() {
        let channel = MemoryChannel::default().with_backlog_limit(2);
        let mut sub = channel.consume("t").await.unwrap();
        for i in 0..5 {
            channel
                .publish("t", Envelope::new("t", serde_json::json!(i)))
                .await
                .unwrap();
        }
        assert_eq!(channel.backlog("t"), 5);
        for expected in 0..5 {
            let d = next(&mut sub).await;
            assert_eq!(d.envelope.payload.as_i64().unwrap(), expected);
            d.ack();
        }

        drop(sub);
        for i in 0..5 {
            channel
                .publish("t", Envelope::new("t", serde_json::json!(i)))
                .await
                .unwrap();
        }
        assert_eq!(channel.backlog("t"), 2);
    }

    #[tokio::test]
    async fn test_offline_channel() {
        let channel = MemoryChannel::default();
        channel.set_available(false);
        let err = channel
            .publish("t", Envelope::new("t", serde_json::Value::Null))
            .await
            .unwrap_err();
        assert!(err.is_dependency_outage());
        assert!(channel.consume("t").await.is_err());
        assert!(channel.ping().await.is_err());
        assert_eq!(channel.published_count("t"), 0);

        channel.set_available(true);
        assert!(channel.ping().await.is_ok());
    }
}
