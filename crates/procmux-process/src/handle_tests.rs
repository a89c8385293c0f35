use super::*;

use tokio::process::Command;

use crate::spawn::spawn_worker;

/// A quiet worker whose stdin we can own in tests.
async fn cat_handle() -> ChildHandle {
    let worker = spawn_worker(Command::new("cat")).expect("spawn cat");
    ChildHandle::new(
        worker.pid,
        worker.stdin,
        Instant::now() + Duration::from_secs(5),
    )
}

#[tokio::test]
async fn test_probe_pass_makes_idle() {
    let mut h = cat_handle().await;
    assert_eq!(h.state(), ChildState::Starting);

    assert!(matches!(
        h.on_stdout_line("v1.2.3", "PASS", "FAIL"),
        LineOutcome::Buffered
    ));
    assert!(matches!(
        h.on_stdout_line("PASS", "PASS", "FAIL"),
        LineOutcome::Ready
    ));
    assert_eq!(h.state(), ChildState::Idle);
    assert!(!h.has_attempt_output(), "probe output must be discarded");
}

#[tokio::test]
async fn test_task_roundtrip_pass() {
    let mut h = cat_handle().await;
    h.on_stdout_line("PASS", "PASS", "FAIL");
    assert!(h.begin_task(Instant::now() + Duration::from_secs(1)));
    assert_eq!(h.state(), ChildState::Busy);

    h.on_stdout_line("HELLO", "PASS", "FAIL");
    h.on_stdout_line("WORLD", "PASS", "FAIL");
    let outcome = h.on_stdout_line("PASS", "PASS", "FAIL");
    match outcome {
        LineOutcome::Completed(c) => {
            assert!(!c.failed);
            assert_eq!(c.stdout, "HELLO\nWORLD");
            assert_eq!(c.stderr, "");
        }
        other => panic!("expected completion, got {other:?}"),
    }
    assert_eq!(h.state(), ChildState::Idle);
    assert_eq!(h.task_count(), 1);
}

#[tokio::test]
async fn test_fail_marker_completion() {
    let mut h = cat_handle().await;
    h.on_stdout_line("PASS", "PASS", "FAIL");
    h.begin_task(Instant::now() + Duration::from_secs(1));
    h.on_stdout_line("unknown command", "PASS", "FAIL");
    match h.on_stdout_line("FAIL", "PASS", "FAIL") {
        LineOutcome::Completed(c) => {
            assert!(c.failed);
            assert_eq!(c.stdout, "unknown command");
        }
        other => panic!("expected completion, got {other:?}"),
    }
    // A fail marker completes the task; the worker itself stays usable.
    assert_eq!(h.state(), ChildState::Idle);
    assert_eq!(h.task_count(), 1);
}

#[tokio::test]
async fn test_stderr_accumulates_into_completion() {
    let mut h = cat_handle().await;
    h.on_stdout_line("PASS", "PASS", "FAIL");
    h.begin_task(Instant::now() + Duration::from_secs(1));
    h.on_stderr_line("warning: something");
    match h.on_stdout_line("PASS", "PASS", "FAIL") {
        LineOutcome::Completed(c) => {
            assert!(!c.failed);
            assert_eq!(c.stderr, "warning: something");
        }
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn test_markers_are_trimmed_before_comparison() {
    let mut h = cat_handle().await;
    assert!(matches!(
        h.on_stdout_line("  PASS \r", "PASS", "FAIL"),
        LineOutcome::Ready
    ));
}

#[tokio::test]
async fn test_line_while_idle_is_unexpected() {
    let mut h = cat_handle().await;
    h.on_stdout_line("PASS", "PASS", "FAIL");
    assert!(matches!(
        h.on_stdout_line("spurious", "PASS", "FAIL"),
        LineOutcome::Unexpected
    ));
}

#[tokio::test]
async fn test_begin_task_requires_idle() {
    let mut h = cat_handle().await;
    assert!(!h.begin_task(Instant::now()), "starting worker not assignable");
    h.on_stdout_line("PASS", "PASS", "FAIL");
    assert!(h.begin_task(Instant::now() + Duration::from_secs(1)));
    assert!(!h.begin_task(Instant::now()), "busy worker not assignable");
}

#[tokio::test]
async fn test_ending_swallows_chatter() {
    let mut h = cat_handle().await;
    h.on_stdout_line("PASS", "PASS", "FAIL");
    h.begin_ending(Instant::now() + Duration::from_millis(50));
    assert_eq!(h.state(), ChildState::Ending);
    assert!(matches!(
        h.on_stdout_line("bye", "PASS", "FAIL"),
        LineOutcome::Ignored
    ));
}

#[tokio::test]
async fn test_note_exit_reports_prior_state_and_pins_dead() {
    let mut h = cat_handle().await;
    h.on_stdout_line("PASS", "PASS", "FAIL");
    h.begin_task(Instant::now() + Duration::from_secs(1));
    assert_eq!(h.note_exit(), ChildState::Busy);
    assert_eq!(h.state(), ChildState::Dead);
    // Dead is terminal: further protocol input changes nothing.
    assert!(matches!(
        h.on_stdout_line("PASS", "PASS", "FAIL"),
        LineOutcome::Ignored
    ));
    h.begin_ending(Instant::now());
    assert_eq!(h.state(), ChildState::Dead);
}

#[tokio::test]
async fn test_deadline_bookkeeping() {
    let now = Instant::now();
    let mut h = cat_handle().await;
    assert!(!h.deadline_passed(now), "spawn deadline is in the future");
    assert!(h.deadline_passed(now + Duration::from_secs(6)));

    h.on_stdout_line("PASS", "PASS", "FAIL");
    assert!(
        !h.deadline_passed(now + Duration::from_secs(60)),
        "idle worker has no deadline"
    );
    h.begin_task(now + Duration::from_millis(100));
    assert!(h.deadline_passed(now + Duration::from_millis(100)));
}

#[tokio::test]
async fn test_send_command_reaches_child() {
    // cat echoes stdin to stdout, so a written command comes straight back.
    let worker = spawn_worker(Command::new("cat")).expect("spawn cat");
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let pid = worker.pid;
    crate::spawn::spawn_output_pump(
        pid,
        worker.child,
        worker.stdout,
        worker.stderr,
        Newline::Lf,
        tx,
    );
    let mut h = ChildHandle::new(pid, worker.stdin, Instant::now() + Duration::from_secs(5));
    h.send_command("version", Newline::Lf).await.unwrap();

    match rx.recv().await.unwrap() {
        crate::spawn::WorkerMsg::Line { line, .. } => assert_eq!(line, "version"),
        other => panic!("expected echoed line, got {other:?}"),
    }
    h.kill(true);
}
