#![allow(clippy::unwrap_used, clippy::expect_used)]

use switchboard_core::*;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// 1. Envelope encode / decode
// ---------------------------------------------------------------------------

#[test]
fn envelope_carries_typed_body() {
    let submission = TaskSubmission::new("code_gen", serde_json::json!({"spec": "greet"}))
        .with_priority(Priority::High);
    let envelope = Envelope::encode("tasks.high", &submission).unwrap();

    assert_eq!(envelope.topic, "tasks.high");
    assert_eq!(envelope.delivery_count, 0);
    assert!(!envelope.is_redelivery());

    let decoded: TaskSubmission = envelope.decode().unwrap();
    assert_eq!(decoded.task_id, submission.task_id);
    assert_eq!(decoded.capability_required, "code_gen");
    assert_eq!(decoded.priority, Priority::High);
}

#[test]
fn envelope_decode_rejects_wrong_shape() {
    let envelope = Envelope::new("agents.results", serde_json::json!({"nope": 1}));
    let err = envelope.decode::<AgentReport>().unwrap_err();
    assert!(matches!(err, SwitchboardError::Json(_)));
}

#[test]
fn envelope_correlation() {
    let correlation = Uuid::new_v4();
    let envelope = Envelope::new("t", serde_json::Value::Null).with_correlation(correlation);
    assert_eq!(envelope.correlation_id, Some(correlation));
}

// ---------------------------------------------------------------------------
// 2. Wire types
// ---------------------------------------------------------------------------

#[test]
fn submission_defaults_when_fields_missing() {
    let id = Uuid::new_v4();
    let json = serde_json::json!({
        "task_id": id,
        "capability_required": "research",
    });
    let submission: TaskSubmission = serde_json::from_value(json).unwrap();
    assert_eq!(submission.priority, Priority::Normal);
    assert!(submission.payload.is_null());
}

#[test]
fn priority_expedited() {
    assert!(!Priority::Low.is_expedited());
    assert!(!Priority::Normal.is_expedited());
    assert!(Priority::High.is_expedited());
    assert!(Priority::Critical.is_expedited());
    assert_eq!(serde_json::to_string(&Priority::Critical).unwrap(), "\"critical\"");
}

#[test]
fn agent_report_constructors() {
    let task_id = Uuid::new_v4();
    let ok = AgentReport::success(task_id, "coder-1", serde_json::json!({"ok": true}))
        .with_duration(42);
    assert!(ok.ok);
    assert!(ok.error.is_none());
    assert_eq!(ok.duration_ms, 42);

    let failed = AgentReport::failure(task_id, "coder-1", "compilation error");
    assert!(!failed.ok);
    assert_eq!(failed.error.as_deref(), Some("compilation error"));
    assert!(failed.output.is_null());
}

// ---------------------------------------------------------------------------
// 3. Error Display and classification
// ---------------------------------------------------------------------------

#[test]
fn error_display_and_from_impls() {
    let err = SwitchboardError::NoCapableAgent("code_gen".to_string());
    assert_eq!(err.to_string(), "No capable agent for 'code_gen'");

    let err = SwitchboardError::InvalidTransition {
        from: "queued".to_string(),
        to: "succeeded".to_string(),
    };
    assert_eq!(err.to_string(), "Invalid transition: queued -> succeeded");

    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
    let err: SwitchboardError = io_err.into();
    assert!(matches!(err, SwitchboardError::Io(_)));
    assert!(err.to_string().contains("file missing"));

    let json_err = serde_json::from_str::<serde_json::Value>("{bad").unwrap_err();
    let err: SwitchboardError = json_err.into();
    assert!(err.to_string().starts_with("JSON error:"));
}

#[test]
fn error_classification() {
    assert!(SwitchboardError::Conflict("task:1".into()).is_conflict());
    assert!(!SwitchboardError::NotFound("task:1".into()).is_conflict());

    assert!(SwitchboardError::StoreUnavailable("down".into()).is_dependency_outage());
    assert!(SwitchboardError::ChannelUnavailable("down".into()).is_dependency_outage());
    assert!(SwitchboardError::SecretUnavailable("down".into()).is_dependency_outage());
    assert!(!SwitchboardError::Timeout("slow".into()).is_dependency_outage());
}

#[test]
fn progress_update_caps_percent() {
    let task_id = Uuid::new_v4();
    let update = ProgressUpdate::new(task_id, "coder-1", 140).with_note("compiling");
    assert_eq!(update.percent, 100);
    assert_eq!(update.note.as_deref(), Some("compiling"));

    let envelope = Envelope::encode("agents.progress", &update).unwrap();
    let decoded: ProgressUpdate = envelope.decode().unwrap();
    assert_eq!(decoded.task_id, task_id);
    assert_eq!(decoded.agent_id, "coder-1");
}
