#![allow(clippy::unwrap_used, clippy::expect_used)]

use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use switchboard_channels::topics;
use switchboard_channels::{MemoryChannel, MessageChannel};
use switchboard_core::{AgentReport, Envelope, Priority, TaskSubmission};
use uuid::Uuid;

#[tokio::test]
async fn typed_submission_round_trips_through_priority_topic() {
    let channel = MemoryChannel::default();
    let submission =
        TaskSubmission::new("code_gen", serde_json::json!({"spec": "x"})).with_priority(Priority::Critical);
    let topic = topics::submission_topic(submission.priority);
    channel
        .publish(topic, Envelope::encode(topic, &submission).unwrap())
        .await
        .unwrap();

    assert_eq!(channel.published_count(topics::TASKS_DEFAULT), 0);
    let mut sub = channel.consume(topics::TASKS_HIGH).await.unwrap();
    let delivery = tokio::time::timeout(Duration::from_secs(1), sub.next())
        .await
        .unwrap()
        .unwrap();
    let decoded: TaskSubmission = delivery.envelope.decode().unwrap();
    assert_eq!(decoded.task_id, submission.task_id);
    delivery.ack();
}

#[tokio::test]
async fn consumer_spawned_before_publish_receives_message() {
    let channel = Arc::new(MemoryChannel::default());
    let mut sub = channel.consume(topics::AGENT_RESULTS).await.unwrap();

    let consumer = tokio::spawn(async move {
        let delivery = sub.next().await.unwrap();
        let report: AgentReport = delivery.envelope.decode().unwrap();
        delivery.ack();
        report
    });

    let task_id = Uuid::new_v4();
    let report = AgentReport::success(task_id, "coder-1", serde_json::json!("done"));
    channel
        .publish(
            topics::AGENT_RESULTS,
            Envelope::encode(topics::AGENT_RESULTS, &report).unwrap(),
        )
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(1), consumer)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.task_id, task_id);
    assert!(received.ok);
}
