//! End-to-end orchestration tests: thread events in, agent frames back, state
//! checked through the public API with an in-memory store and loopback sinks.

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use threadhub::error::{is_not_found, is_validation};
use threadhub::orchestrator::{
    AgentRegistry, AssignmentScheduler, Coordinator, Dispatch, EventSink, FrameOutcome,
    JobCreation, JobManager, MessageTracker, NewMessage, OrchestratorEvent, ThreadEvent,
};
use threadhub::store::{JobKind, MessageStatus, Store};
use threadhub::transport::dedup::DEFAULT_RETENTION;
use threadhub::transport::{DeliverySettings, FrameSink, MemorySink};

// ─────────────────────────────────────────────────────────────────────────────
// Fixtures
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingEvents(Mutex<Vec<OrchestratorEvent>>);

impl EventSink for RecordingEvents {
    fn emit(&self, event: OrchestratorEvent) {
        self.0.lock().push(event);
    }
}

impl RecordingEvents {
    fn names(&self) -> Vec<&'static str> {
        self.0.lock().iter().map(OrchestratorEvent::name).collect()
    }
}

fn coordinator() -> (Coordinator, Arc<RecordingEvents>) {
    let events = Arc::new(RecordingEvents::default());
    let settings = DeliverySettings {
        retry_interval: Duration::from_secs(3600),
        ..DeliverySettings::default()
    };
    let coordinator = Coordinator::new(
        Store::open_in_memory().unwrap(),
        events.clone(),
        settings,
        DEFAULT_RETENTION,
    );
    (coordinator, events)
}

fn slack_thread(ts: &str) -> JobKind {
    JobKind::SlackThread {
        channel_id: "C042".into(),
        thread_ts: ts.into(),
        integration_id: "slack_int".into(),
    }
}

fn thread_event(ts: &str, platform_id: &str, text: &str) -> ThreadEvent {
    ThreadEvent {
        organization_id: "org_1".into(),
        thread: slack_thread(ts),
        platform_message_id: platform_id.into(),
        text: text.into(),
    }
}

async fn connect(coordinator: &Coordinator, connection_id: &str) -> Arc<MemorySink> {
    let sink = Arc::new(MemorySink::new());
    let dyn_sink: Arc<dyn FrameSink> = sink.clone();
    coordinator
        .connect_agent(connection_id, "org_1", "claude", dyn_sink)
        .await
        .unwrap();
    sink
}

/// Wait until the dispatch lane has written at least `count` frames.
async fn frames(sink: &MemorySink, count: usize) -> Vec<Value> {
    for _ in 0..200 {
        let frames = sink.json_frames();
        if frames.len() >= count {
            return frames;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {count} frames, got {}: {:?}",
        sink.frames().len(),
        sink.frames()
    );
}

fn agent_frame(id: &str, kind: &str, payload: Value) -> String {
    json!({ "id": id, "type": kind, "payload": payload }).to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Job, message and assignment scenarios
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn new_job_becomes_idle_only_after_its_timestamp_ages() {
    let jobs = JobManager::new(Store::open_in_memory().unwrap());
    let (job, status) = jobs
        .get_or_create_job_for_thread("org_1", &slack_thread("1.1"))
        .unwrap();
    assert_eq!(status, JobCreation::Created);
    assert!(jobs.get_idle_jobs("org_1", 1).unwrap().is_empty());

    jobs.set_updated_at(&job.id, "org_1", Utc::now() - ChronoDuration::minutes(10))
        .unwrap();
    let idle = jobs.get_idle_jobs("org_1", 5).unwrap();
    assert_eq!(idle.iter().map(|j| j.id.as_str()).collect::<Vec<_>>(), vec![job.id.as_str()]);
}

#[test]
fn job_with_active_message_is_never_idle() {
    let store = Store::open_in_memory().unwrap();
    let jobs = JobManager::new(store.clone());
    let tracker = MessageTracker::new(store);
    let (job, _) = jobs
        .get_or_create_job_for_thread("org_1", &slack_thread("1.1"))
        .unwrap();
    let message = tracker
        .record(&NewMessage {
            job_id: &job.id,
            organization_id: "org_1",
            integration_id: "slack_int",
            platform_message_id: "p1",
            text: "hi",
        })
        .unwrap();

    for status in [MessageStatus::Queued, MessageStatus::InProgress] {
        tracker.update_status(&message.id, "org_1", status).unwrap();
        jobs.set_updated_at(&job.id, "org_1", Utc::now() - ChronoDuration::days(365))
            .unwrap();
        assert!(jobs.get_idle_jobs("org_1", 0).unwrap().is_empty(), "{status}");
    }

    tracker
        .update_status(&message.id, "org_1", MessageStatus::Completed)
        .unwrap();
    jobs.set_updated_at(&job.id, "org_1", Utc::now() - ChronoDuration::days(365))
        .unwrap();
    assert_eq!(jobs.get_idle_jobs("org_1", 0).unwrap().len(), 1);
}

#[test]
fn assignment_round_trip_controls_availability() {
    let store = Store::open_in_memory().unwrap();
    let agents = AgentRegistry::new(store.clone());
    let jobs = JobManager::new(store.clone());
    let scheduler = AssignmentScheduler::new(store);

    let agent = agents.upsert_active_agent("conn_a", "org_1", "claude").unwrap();
    assert_eq!(agents.get_available_agents("org_1").unwrap().len(), 1);
    let (job, _) = jobs
        .get_or_create_job_for_thread("org_1", &slack_thread("1.1"))
        .unwrap();

    scheduler.assign_agent_to_job(&agent.id, &job.id, "org_1").unwrap();
    assert!(agents.get_available_agents("org_1").unwrap().is_empty());
    assert_eq!(
        scheduler
            .get_active_agent_job_assignments(&agent.id, "org_1")
            .unwrap()
            .len(),
        1
    );

    scheduler
        .unassign_agent_from_job(&agent.id, &job.id, "org_1")
        .unwrap();
    let available = agents.get_available_agents("org_1").unwrap();
    assert_eq!(available.len(), 1);
    assert_eq!(available[0].id, agent.id);
}

#[test]
fn deleting_job_removes_all_its_messages() {
    let store = Store::open_in_memory().unwrap();
    let jobs = JobManager::new(store.clone());
    let tracker = MessageTracker::new(store);
    let (job, _) = jobs
        .get_or_create_job_for_thread("org_1", &slack_thread("1.1"))
        .unwrap();

    let mut ids = Vec::new();
    for (platform_id, status) in [
        ("p1", MessageStatus::Queued),
        ("p2", MessageStatus::InProgress),
        ("p3", MessageStatus::Completed),
    ] {
        let message = tracker
            .record(&NewMessage {
                job_id: &job.id,
                organization_id: "org_1",
                integration_id: "slack_int",
                platform_message_id: platform_id,
                text: "work",
            })
            .unwrap();
        tracker.update_status(&message.id, "org_1", status).unwrap();
        ids.push(message.id);
    }

    jobs.delete_job(&job.id, "org_1").unwrap();
    assert!(jobs.get_job(&job.id, "org_1").unwrap().is_none());
    for id in &ids {
        assert!(tracker.get(id, "org_1").unwrap().is_none());
    }
    assert!(is_not_found(&jobs.delete_job(&job.id, "org_1").unwrap_err()));
}

#[test]
fn organizations_never_see_each_other() {
    let store = Store::open_in_memory().unwrap();
    let agents = AgentRegistry::new(store.clone());
    let jobs = JobManager::new(store);
    agents.upsert_active_agent("conn_a", "org_1", "claude").unwrap();
    let (job, _) = jobs
        .get_or_create_job_for_thread("org_1", &slack_thread("1.1"))
        .unwrap();

    assert!(agents.get_available_agents("org_2").unwrap().is_empty());
    assert!(jobs.get_job(&job.id, "org_2").unwrap().is_none());
    let (other, status) = jobs
        .get_or_create_job_for_thread("org_2", &slack_thread("1.1"))
        .unwrap();
    assert_eq!(status, JobCreation::Created);
    assert_ne!(other.id, job.id);
}

// ─────────────────────────────────────────────────────────────────────────────
// Coordinator flows
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn first_event_starts_conversation_on_free_agent() {
    let (coordinator, events) = coordinator();
    let sink = connect(&coordinator, "conn_a").await;

    let dispatch = coordinator
        .handle_thread_event(&thread_event("1.1", "p1", "fix the flaky test"))
        .unwrap();
    let Dispatch::Delivered {
        job_id,
        job,
        processed_message_id,
        envelope_id,
        ..
    } = dispatch
    else {
        panic!("expected delivery, got {dispatch:?}");
    };
    assert_eq!(job, JobCreation::Created);

    let sent = frames(&sink, 1).await;
    assert_eq!(sent[0]["id"], envelope_id.as_str());
    assert_eq!(sent[0]["type"], "start_conversation");
    assert_eq!(sent[0]["payload"]["job_id"], job_id.as_str());
    assert_eq!(sent[0]["payload"]["processed_message_id"], processed_message_id.as_str());
    assert_eq!(sent[0]["payload"]["message"], "fix the flaky test");
    assert!(events.names().contains(&"agent_assigned"));
}

#[tokio::test]
async fn follow_up_in_same_thread_goes_to_same_agent() {
    let (coordinator, _) = coordinator();
    let sinks = [
        ("conn_a", connect(&coordinator, "conn_a").await),
        ("conn_b", connect(&coordinator, "conn_b").await),
    ];

    let first = coordinator
        .handle_thread_event(&thread_event("1.1", "p1", "first"))
        .unwrap();
    let second = coordinator
        .handle_thread_event(&thread_event("1.1", "p2", "second"))
        .unwrap();

    let (Dispatch::Delivered { agent_id: a, .. }, Dispatch::Delivered { agent_id: b, job, .. }) =
        (&first, &second)
    else {
        panic!("expected two deliveries: {first:?} {second:?}");
    };
    assert_eq!(a, b);
    assert_eq!(*job, JobCreation::AlreadyExists);

    let agent = coordinator
        .agents()
        .get_agent_by_id(a, "org_1")
        .unwrap()
        .unwrap();
    let (_, sink) = sinks
        .iter()
        .find(|(id, _)| *id == agent.ws_connection_id)
        .unwrap();
    let sent = frames(sink, 2).await;
    assert_eq!(sent[0]["type"], "start_conversation");
    assert_eq!(sent[1]["type"], "user_message");
    assert_eq!(sent[1]["payload"]["message"], "second");
}

#[tokio::test]
async fn first_message_for_bound_job_goes_to_its_holder() {
    let (coordinator, events) = coordinator();
    let _sink_a = connect(&coordinator, "conn_a").await;
    let sink_b = connect(&coordinator, "conn_b").await;

    let (job, _) = coordinator
        .jobs()
        .get_or_create_job_for_thread("org_1", &slack_thread("1.1"))
        .unwrap();
    let holder = coordinator
        .agents()
        .get_agent_by_ws_connection_id("conn_b", "org_1")
        .unwrap()
        .unwrap();
    coordinator
        .scheduler()
        .assign_agent_to_job(&holder.id, &job.id, "org_1")
        .unwrap();

    let dispatch = coordinator
        .handle_thread_event(&thread_event("1.1", "p1", "picked up later"))
        .unwrap();
    let Dispatch::Delivered { agent_id, job: creation, .. } = &dispatch else {
        panic!("expected delivery to the holder, got {dispatch:?}");
    };
    assert_eq!(*agent_id, holder.id);
    assert_eq!(*creation, JobCreation::AlreadyExists);

    let sent = frames(&sink_b, 1).await;
    assert_eq!(sent[0]["type"], "user_message");
    assert!(!events.names().contains(&"agent_assigned"));
}

#[tokio::test]
async fn platform_redelivery_is_recorded_once() {
    let (coordinator, _) = coordinator();
    let event = thread_event("1.1", "p1", "hello");
    let first = coordinator.handle_thread_event(&event).unwrap();
    let again = coordinator.handle_thread_event(&event).unwrap();

    let Dispatch::Queued {
        processed_message_id,
        job_id,
        ..
    } = first
    else {
        panic!("no agent connected, expected queued: {first:?}");
    };
    assert_eq!(
        again,
        Dispatch::Duplicate {
            processed_message_id: processed_message_id.clone()
        }
    );
    assert_eq!(
        coordinator
            .messages()
            .list_for_job(&job_id, "org_1")
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn queued_work_is_dispatched_when_an_agent_connects() {
    let (coordinator, _) = coordinator();
    let dispatch = coordinator
        .handle_thread_event(&thread_event("1.1", "p1", "waiting"))
        .unwrap();
    assert!(matches!(dispatch, Dispatch::Queued { .. }));

    let sink = connect(&coordinator, "conn_a").await;
    let sent = frames(&sink, 1).await;
    assert_eq!(sent[0]["type"], "start_conversation");
    assert_eq!(sent[0]["payload"]["message"], "waiting");
}

#[tokio::test]
async fn agent_reports_progress_and_reply() {
    let (coordinator, events) = coordinator();
    let sink = connect(&coordinator, "conn_a").await;
    let Dispatch::Delivered {
        job_id,
        processed_message_id,
        envelope_id,
        ..
    } = coordinator
        .handle_thread_event(&thread_event("1.1", "p1", "go"))
        .unwrap()
    else {
        panic!("expected delivery");
    };
    frames(&sink, 1).await;

    let ack =
        json!({"type": "acknowledgement", "payload": {"message_id": envelope_id}}).to_string();
    assert_eq!(
        coordinator.handle_agent_frame("conn_a", &ack).unwrap(),
        FrameOutcome::Acknowledged {
            message_id: envelope_id.clone(),
            known: true
        }
    );

    let started = agent_frame(
        "msg_agent_1",
        "processing_started",
        json!({"job_id": job_id, "processed_message_id": processed_message_id}),
    );
    coordinator.handle_agent_frame("conn_a", &started).unwrap();
    assert_eq!(
        coordinator
            .messages()
            .get(&processed_message_id, "org_1")
            .unwrap()
            .unwrap()
            .status,
        MessageStatus::InProgress
    );

    let reply = agent_frame(
        "msg_agent_2",
        "assistant_message",
        json!({"job_id": job_id, "processed_message_id": processed_message_id, "message": "done"}),
    );
    coordinator.handle_agent_frame("conn_a", &reply).unwrap();
    assert_eq!(
        coordinator
            .messages()
            .active_count_for_job(&job_id, "org_1")
            .unwrap(),
        0
    );

    let recorded = events.0.lock().clone();
    assert!(recorded.iter().any(|event| matches!(
        event,
        OrchestratorEvent::MessageAcknowledged { message_id, .. } if *message_id == envelope_id
    )));
    assert!(recorded.iter().any(|event| matches!(
        event,
        OrchestratorEvent::AssistantReply { message, thread, .. }
            if message == "done" && *thread == slack_thread("1.1")
    )));

    // One start_conversation plus an ack for each of the two agent frames.
    let sent = frames(&sink, 3).await;
    let acked: Vec<&str> = sent
        .iter()
        .filter(|frame| frame["type"] == "acknowledgement")
        .filter_map(|frame| frame["payload"]["message_id"].as_str())
        .collect();
    assert_eq!(acked, vec!["msg_agent_1", "msg_agent_2"]);
}

#[tokio::test]
async fn reports_from_an_agent_not_holding_the_job_are_rejected() {
    let (coordinator, events) = coordinator();
    let _sink_a = connect(&coordinator, "conn_a").await;
    let _sink_b = connect(&coordinator, "conn_b").await;
    let Dispatch::Delivered {
        job_id,
        processed_message_id,
        agent_id,
        ..
    } = coordinator
        .handle_thread_event(&thread_event("1.1", "p1", "go"))
        .unwrap()
    else {
        panic!("expected delivery");
    };
    let holder = coordinator
        .agents()
        .get_agent_by_id(&agent_id, "org_1")
        .unwrap()
        .unwrap();
    let other = if holder.ws_connection_id == "conn_a" {
        "conn_b"
    } else {
        "conn_a"
    };

    let reply = agent_frame(
        "msg_intruder",
        "assistant_message",
        json!({"job_id": job_id, "processed_message_id": processed_message_id, "message": "x"}),
    );
    let err = coordinator.handle_agent_frame(other, &reply).unwrap_err();
    assert!(is_validation(&err));
    assert_eq!(
        coordinator
            .messages()
            .get(&processed_message_id, "org_1")
            .unwrap()
            .unwrap()
            .status,
        MessageStatus::Queued
    );
    assert!(!events.names().contains(&"assistant_reply"));
}

#[tokio::test]
async fn replayed_agent_frame_has_one_effect_and_two_acks() {
    let (coordinator, events) = coordinator();
    let sink = connect(&coordinator, "conn_a").await;
    let Dispatch::Delivered {
        job_id,
        processed_message_id,
        ..
    } = coordinator
        .handle_thread_event(&thread_event("1.1", "p1", "go"))
        .unwrap()
    else {
        panic!("expected delivery");
    };

    let reply = agent_frame(
        "msg_agent_9",
        "assistant_message",
        json!({"job_id": job_id, "processed_message_id": processed_message_id, "message": "done"}),
    );
    assert!(matches!(
        coordinator.handle_agent_frame("conn_a", &reply).unwrap(),
        FrameOutcome::StatusUpdated { .. }
    ));
    assert_eq!(
        coordinator.handle_agent_frame("conn_a", &reply).unwrap(),
        FrameOutcome::Duplicate
    );

    let replies = events
        .names()
        .into_iter()
        .filter(|name| *name == "assistant_reply")
        .count();
    assert_eq!(replies, 1);

    let sent = frames(&sink, 3).await;
    let acks = sent
        .iter()
        .filter(|frame| frame["payload"]["message_id"] == "msg_agent_9")
        .count();
    assert_eq!(acks, 2);
}

#[tokio::test]
async fn idle_sweep_releases_agent_for_queued_work() {
    let (coordinator, events) = coordinator();
    let sink = connect(&coordinator, "conn_a").await;

    let Dispatch::Delivered {
        job_id,
        processed_message_id,
        ..
    } = coordinator
        .handle_thread_event(&thread_event("1.1", "p1", "first thread"))
        .unwrap()
    else {
        panic!("expected delivery");
    };
    let waiting = coordinator
        .handle_thread_event(&thread_event("2.2", "p2", "second thread"))
        .unwrap();
    assert!(matches!(waiting, Dispatch::Queued { .. }));

    let reply = agent_frame(
        "msg_agent_1",
        "assistant_message",
        json!({"job_id": job_id, "processed_message_id": processed_message_id, "message": "ok"}),
    );
    coordinator.handle_agent_frame("conn_a", &reply).unwrap();
    coordinator
        .jobs()
        .set_updated_at(&job_id, "org_1", Utc::now() - ChronoDuration::minutes(10))
        .unwrap();

    let report = coordinator.sweep_idle_jobs(5).unwrap();
    assert_eq!(report.idle_jobs, 1);
    assert_eq!(report.released, 1);
    assert_eq!(report.dispatched, 1);
    assert!(events.0.lock().iter().any(|event| matches!(
        event,
        OrchestratorEvent::JobIdle { job_id: idle, .. } if *idle == job_id
    )));
    assert!(coordinator
        .scheduler()
        .assignment_for_job(&job_id, "org_1")
        .unwrap()
        .is_none());

    let sent = frames(&sink, 3).await;
    let conversations: Vec<&Value> = sent
        .iter()
        .filter(|frame| frame["type"] == "start_conversation")
        .collect();
    assert_eq!(conversations.len(), 2);
    assert_eq!(conversations[1]["payload"]["message"], "second thread");

    // A second sweep finds nothing new to release.
    assert_eq!(coordinator.sweep_idle_jobs(5).unwrap().released, 0);
    assert!(coordinator
        .agents()
        .get_agent_by_job_id(&job_id, "org_1")
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn disconnect_hands_queued_work_to_another_agent() {
    let (coordinator, events) = coordinator();
    connect(&coordinator, "conn_a").await;

    let Dispatch::Delivered { job_id, .. } = coordinator
        .handle_thread_event(&thread_event("1.1", "p1", "before drop"))
        .unwrap()
    else {
        panic!("expected delivery");
    };

    coordinator.disconnect_agent("conn_a").await.unwrap();
    assert!(events.names().contains(&"agent_unassigned"));
    assert!(coordinator.hub().get("conn_a").is_none());

    let sink_b = connect(&coordinator, "conn_b").await;
    let sent = frames(&sink_b, 1).await;
    assert_eq!(sent[0]["type"], "start_conversation");
    assert_eq!(sent[0]["payload"]["job_id"], job_id.as_str());
    assert_eq!(sent[0]["payload"]["message"], "before drop");
}

#[tokio::test]
async fn unknown_frames_are_acked_and_ignored() {
    let (coordinator, _) = coordinator();
    let sink = connect(&coordinator, "conn_a").await;
    let outcome = coordinator
        .handle_agent_frame("conn_a", &agent_frame("msg_t", "telemetry", json!({"cpu": 1})))
        .unwrap();
    assert_eq!(
        outcome,
        FrameOutcome::Ignored {
            kind: "telemetry".into()
        }
    );
    let sent = frames(&sink, 1).await;
    assert_eq!(sent[0]["type"], "acknowledgement");
}

#[tokio::test]
async fn frames_on_unknown_connection_are_not_found() {
    let (coordinator, _) = coordinator();
    let err = coordinator
        .handle_agent_frame("conn_ghost", r#"{"type":"ping"}"#)
        .unwrap_err();
    assert!(is_not_found(&err));
}
