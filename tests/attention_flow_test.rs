use boxcraft::attention::{AttentionAlert, AttentionOptions, AttentionQueue};
use boxcraft::dispatcher::EventDispatcher;
use boxcraft::monitor::{self, Monitor};
use boxcraft::{tracker, LifecycleEvent, ManagedSession, SessionStatus, SharedSessions};
use std::io::Write;
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

fn pre_tool_use(session_id: &str) -> LifecycleEvent {
    LifecycleEvent::PreToolUse {
        timestamp: boxcraft::now_millis(),
        session_id: session_id.into(),
        tool: "Edit".into(),
        tool_use_id: "toolu_01".into(),
        input: serde_json::json!({"file_path": "src/lib.rs"}),
    }
}

fn stop(session_id: &str) -> LifecycleEvent {
    LifecycleEvent::Stop {
        timestamp: boxcraft::now_millis(),
        session_id: session_id.into(),
        reason: Some("end_turn".into()),
    }
}

#[test]
fn finished_session_is_routed_to_attention() {
    let dispatcher: EventDispatcher<SharedSessions> = EventDispatcher::new();
    tracker::attach(&dispatcher);
    let sessions: SharedSessions = Arc::new(Mutex::new(vec![ManagedSession::local(
        "S1",
        "api",
        Some("/work/api".into()),
    )]));

    let alerts = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&alerts);
    let queue = AttentionQueue::new(AttentionOptions {
        on_alert: Some(Box::new(move |alert: &AttentionAlert| {
            sink.lock().unwrap().push(alert.clone());
        })),
        ..Default::default()
    });
    queue.process_status_changes(&sessions.lock().unwrap());

    dispatcher.publish(pre_tool_use("S1"), Arc::clone(&sessions));
    assert_eq!(sessions.lock().unwrap()[0].status, SessionStatus::Working);
    assert!(queue
        .process_status_changes(&sessions.lock().unwrap())
        .is_empty());

    dispatcher.publish(stop("S1"), Arc::clone(&sessions));
    assert_eq!(sessions.lock().unwrap()[0].status, SessionStatus::Idle);

    let snapshot = sessions.lock().unwrap().clone();
    let finished = queue.process_status_changes(&snapshot);
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].id, "S1");
    assert_eq!(queue.get_queue(), vec!["S1"]);

    let alerts = alerts.lock().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].session_name, "api");
    assert!(alerts[0].sound && alerts[0].notification);

    assert_eq!(queue.get_next(&snapshot).unwrap().id, "S1");
    assert!(queue.get_queue().is_empty());
}

#[test]
fn duplicate_adds_keep_first_position() {
    let queue = AttentionQueue::default();
    assert!(queue.add("A"));
    assert!(!queue.add("A"));
    assert!(queue.add("B"));
    assert_eq!(queue.get_queue(), vec!["A", "B"]);
}

#[test]
fn replay_from_event_log_file() {
    let mut log = NamedTempFile::new().unwrap();
    let lines = [
        serde_json::json!({"type": "session_start", "timestamp": 1, "sessionId": "s1", "cwd": "/work/web"}),
        serde_json::json!({"type": "session_start", "timestamp": 1, "sessionId": "s2", "cwd": "/work/api"}),
        serde_json::json!({"type": "user_prompt_submit", "timestamp": 2, "sessionId": "s1", "prompt": "fix the build"}),
        serde_json::json!({"type": "user_prompt_submit", "timestamp": 2, "sessionId": "s2", "prompt": "add tests"}),
        serde_json::json!({"type": "notification", "timestamp": 3, "sessionId": "s2", "message": "Claude needs your permission to use Bash", "notificationType": "permission_prompt"}),
        serde_json::json!({"type": "stop", "timestamp": 4, "sessionId": "s1"}),
        serde_json::json!({"type": "session_end", "timestamp": 5, "sessionId": "s2", "reason": "exit"}),
    ];
    for line in &lines {
        writeln!(log, "{line}").unwrap();
    }
    writeln!(log, "{{truncated").unwrap();
    log.flush().unwrap();

    let monitor = Monitor::default();
    let file = std::fs::File::open(log.path()).unwrap();
    let summary = monitor::replay(&monitor, std::io::BufReader::new(file)).unwrap();
    assert_eq!(summary.events, lines.len());
    assert_eq!(summary.skipped, 1);

    assert_eq!(monitor.session("s1").unwrap().status, SessionStatus::Idle);
    assert_eq!(monitor.session("s2").unwrap().status, SessionStatus::Offline);
    assert_eq!(monitor.attention().get_queue(), vec!["s1"]);
    assert_eq!(monitor.next_attention().unwrap().name, "web");
}
