//! Integration tests for the GDB controller
//!
//! These tests drive the whole startup and shutdown sequence against an
//! in-process fake GDB.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{config, controller, eventually, exited_events, record_events, FakeSettings, QuitBehavior};
use gdbcontrol::*;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_initialize_without_program_waits_for_prompt() {
    let (control, fake) = controller(config(SessionKind::Run), FakeSettings::default());
    let events = record_events(&control);

    assert_ok!(control.initialize().await);

    assert!(control.is_connected());
    assert!(!control.is_exited());
    assert!(control.can_interrupt());
    assert_eq!(fake.journal()[0], "spawn:fake-gdb");
    assert_eq!(control.console_mode().await, ConsoleMode::Enhanced);
    assert_eq!(control.features().await, vec!["python", "thread-info"]);
    assert_eq!(
        *events.lock().unwrap(),
        vec![ControlEvent::Started(control.context().clone())]
    );

    control.shutdown().await;
}

#[tokio::test]
async fn test_program_is_passed_on_the_command_line() {
    let config = SessionConfig {
        program: Some("/tmp/hello".into()),
        ..config(SessionKind::Run)
    };
    let (control, fake) = controller(config, FakeSettings::default());
    assert_ok!(control.initialize().await);
    assert_eq!(fake.journal()[0], "spawn:fake-gdb --interpreter mi /tmp/hello");
    control.shutdown().await;
}

#[tokio::test]
async fn test_missing_prompt_times_out_and_destroys_process() {
    let config = SessionConfig {
        launch_timeout_ms: 150,
        ..config(SessionKind::Run)
    };
    let settings = FakeSettings {
        print_prompt: false,
        ..FakeSettings::default()
    };
    let (control, fake) = controller(config, settings);

    let err = assert_err!(control.initialize().await);
    assert!(matches!(err, ControlError::LaunchTimeout { .. }));
    assert_eq!(fake.count("destroy"), 1);
    assert!(!control.is_connected());
    assert!(control.resources().await.is_released());
    assert!(control.shutdown().await.is_empty());
}

#[tokio::test]
async fn test_failed_console_probe_falls_back_to_basic_console() {
    let settings = FakeSettings {
        console_probe_ok: false,
        ..FakeSettings::default()
    };
    let (control, fake) = controller(config(SessionKind::Run), settings);

    assert_ok!(control.initialize().await);
    assert!(control.is_connected());
    assert_eq!(control.console_mode().await, ConsoleMode::Basic);
    assert!(fake.position("cmd:-interpreter-exec console \"echo\"").is_some());

    control.shutdown().await;
}

#[tokio::test]
async fn test_spawn_failure_surfaces_launch_error() {
    let settings = FakeSettings {
        fail_spawn: true,
        ..FakeSettings::default()
    };
    let (control, _fake) = controller(config(SessionKind::Run), settings);
    let events = record_events(&control);

    match control.initialize().await {
        Err(ControlError::Launch { command_line, .. }) => assert_eq!(command_line, "fake-gdb"),
        other => panic!("Expected launch error, got {:?}", other),
    }
    assert!(events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_gdb_dying_during_handshake_rolls_back() {
    let settings = FakeSettings {
        die_on_first_command: Some(9),
        ..FakeSettings::default()
    };
    let (control, fake) = controller(config(SessionKind::Run), settings);
    let events = record_events(&control);

    let err = assert_err!(control.initialize().await);
    assert!(matches!(err, ControlError::ProcessExited), "got {:?}", err);
    assert_eq!(fake.count("cmd:-interpreter-exec console \"echo\""), 1);

    assert!(control.resources().await.is_released());
    assert!(!control.is_connected());
    assert!(control.is_exited());
    assert_eq!(exited_events(&events), vec![9]);
    assert!(control.inferior().is_none());
}

#[tokio::test]
async fn test_round_trip_releases_everything() {
    let (control, fake) = controller(config(SessionKind::Run), FakeSettings::default());
    let events = record_events(&control);

    assert_ok!(control.initialize().await);
    let resources = control.resources().await;
    assert!(resources.process && resources.monitor && resources.command_stream);
    assert!(resources.processors && resources.registered);
    assert_eq!(control.events().listener_count(), 2);

    let failures = control.shutdown().await;
    assert!(failures.is_empty(), "{:?}", failures);

    assert!(control.resources().await.is_released());
    assert_eq!(control.events().listener_count(), 1);
    assert_eq!(fake.count("destroy"), 1);
    assert!(control.is_exited());
    assert_eq!(control.exit_code(), Some(137));
    assert_eq!(exited_events(&events), vec![137]);
    assert!(control.inferior().is_none());
}

#[tokio::test]
async fn test_attach_destroy_interrupts_running_inferior_first() {
    let (control, fake) = controller(config(SessionKind::Attach), FakeSettings::default());
    assert_ok!(control.initialize().await);

    let inferior = control.inferior().unwrap();
    assert_eq!(inferior.state(), InferiorState::Running);
    inferior.destroy().await;

    let interrupt = fake.position("interrupt").unwrap();
    let detach = fake.position("cmd:-target-detach").unwrap();
    assert!(interrupt < detach);
    assert!(inferior.is_disposed());
    assert_eq!(inferior.state(), InferiorState::Terminated);
    assert!(!control.is_connected());

    control.shutdown().await;
}

#[tokio::test]
async fn test_core_destroy_only_disposes() {
    let (control, fake) = controller(config(SessionKind::Core), FakeSettings::default());
    assert_ok!(control.initialize().await);

    let inferior = control.inferior().unwrap();
    assert_eq!(inferior.state(), InferiorState::Stopped);
    let before = fake.journal().len();
    inferior.destroy().await;

    assert_eq!(fake.journal().len(), before);
    assert_eq!(fake.count("interrupt"), 0);
    assert!(inferior.is_disposed());

    control.shutdown().await;
}

#[tokio::test]
async fn test_run_destroy_kills_inferior_through_gdb() {
    let (control, fake) = controller(config(SessionKind::Run), FakeSettings::default());
    assert_ok!(control.initialize().await);

    fake.emit("*stopped,reason=\"breakpoint-hit\"");
    let inferior = control.inferior().unwrap();
    assert!(eventually(|| inferior.state() == InferiorState::Stopped).await);

    inferior.destroy().await;
    assert_eq!(fake.count("cmd:-interpreter-exec console \"kill\""), 1);
    assert_eq!(fake.count("interrupt"), 0);
    assert!(inferior.is_disposed());

    control.shutdown().await;
}

#[tokio::test]
async fn test_run_destroy_interrupts_running_inferior_before_kill() {
    let (control, fake) = controller(config(SessionKind::Run), FakeSettings::default());
    assert_ok!(control.initialize().await);

    let inferior = control.inferior().unwrap();
    assert_eq!(inferior.state(), InferiorState::Running);

    inferior.destroy().await;
    let interrupt = fake.position("interrupt").unwrap();
    let kill = fake.position("cmd:-interpreter-exec console \"kill\"").unwrap();
    assert!(interrupt < kill);
    assert!(inferior.is_disposed());

    control.shutdown().await;
}

#[tokio::test]
async fn test_destroy_after_shutdown_is_a_no_op() {
    let (control, fake) = controller(config(SessionKind::Run), FakeSettings::default());
    assert_ok!(control.initialize().await);
    let inferior = control.inferior().unwrap();
    control.shutdown().await;

    let before = fake.journal().len();
    inferior.destroy().await;
    assert_eq!(fake.journal().len(), before);
    assert!(inferior.is_disposed());
}

async fn terminate_counting(control: &GdbControl) -> (TerminateOutcome, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = tokio::sync::oneshot::channel();
    {
        let calls = calls.clone();
        control.terminate_with(move |outcome| {
            calls.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(outcome);
        });
    }
    (rx.await.unwrap(), calls)
}

#[tokio::test]
async fn test_terminate_acknowledged() {
    let (control, fake) = controller(config(SessionKind::Run), FakeSettings::default());
    let events = record_events(&control);
    assert_ok!(control.initialize().await);

    let (outcome, calls) = terminate_counting(&control).await;
    assert_eq!(outcome, TerminateOutcome::QuitAcknowledged);

    // The running inferior is interrupted before GDB is asked to quit.
    assert!(fake.position("interrupt").unwrap() < fake.position("cmd:-gdb-exit").unwrap());
    assert!(eventually(|| control.is_exited()).await);
    assert_eq!(control.exit_code(), Some(0));
    assert!(!control.is_connected());
    assert!(eventually(|| exited_events(&events) == vec![0]).await);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(fake.count("destroy"), 0);

    control.shutdown().await;
    assert_eq!(exited_events(&events), vec![0]);
}

#[tokio::test]
async fn test_terminate_grace_expires_on_hung_gdb() {
    let config = SessionConfig {
        terminate_grace_ms: 150,
        ..config(SessionKind::Run)
    };
    let settings = FakeSettings {
        quit: QuitBehavior::Hang,
        ..FakeSettings::default()
    };
    let (control, fake) = controller(config, settings);
    assert_ok!(control.initialize().await);

    let (outcome, calls) = terminate_counting(&control).await;
    assert_eq!(outcome, TerminateOutcome::GraceExpired);
    assert_eq!(fake.count("destroy"), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    control.shutdown().await;
}

#[tokio::test]
async fn test_failed_quit_falls_back_to_destroy() {
    let settings = FakeSettings {
        quit: QuitBehavior::FailAfter(Duration::from_millis(20)),
        ..FakeSettings::default()
    };
    let (control, fake) = controller(config(SessionKind::Run), settings);
    assert_ok!(control.initialize().await);

    let (outcome, calls) = terminate_counting(&control).await;
    assert_eq!(outcome, TerminateOutcome::QuitFailed { destroyed: true });
    assert_eq!(fake.count("destroy"), 1);

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    control.shutdown().await;
}

#[tokio::test]
async fn test_failed_quit_does_not_destroy_exited_gdb() {
    let config = SessionConfig {
        exit_poll_ms: 60_000,
        ..config(SessionKind::Run)
    };
    let (control, fake) = controller(config, FakeSettings::default());
    assert_ok!(control.initialize().await);

    // The monitor has not noticed yet, so only a fresh poll sees the exit.
    fake.crash(5);
    let (outcome, _calls) = terminate_counting(&control).await;
    assert_eq!(outcome, TerminateOutcome::QuitFailed { destroyed: false });
    assert_eq!(fake.count("destroy"), 0);

    control.shutdown().await;
    assert_eq!(control.exit_code(), Some(5));
}

#[tokio::test]
async fn test_late_quit_failure_after_grace_is_ignored() {
    let config = SessionConfig {
        terminate_grace_ms: 50,
        ..config(SessionKind::Run)
    };
    let settings = FakeSettings {
        quit: QuitBehavior::FailAfter(Duration::from_millis(200)),
        ..FakeSettings::default()
    };
    let (control, fake) = controller(config, settings);
    assert_ok!(control.initialize().await);

    let (outcome, calls) = terminate_counting(&control).await;
    assert_eq!(outcome, TerminateOutcome::GraceExpired);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(fake.count("destroy"), 1);

    control.shutdown().await;
}

#[tokio::test]
async fn test_crash_raises_single_exit_event() {
    let (control, fake) = controller(config(SessionKind::Run), FakeSettings::default());
    let events = record_events(&control);
    assert_ok!(control.initialize().await);

    fake.crash(3);
    assert!(eventually(|| !exited_events(&events).is_empty()).await);
    assert!(control.is_exited());
    assert!(!control.is_connected());
    assert_eq!(
        control.inferior().map(|inferior| inferior.state()),
        Some(InferiorState::Terminated)
    );

    // Outstanding and new commands fail once processing has stopped.
    assert!(control.queue_command(MiCommand::list_features()).await.is_err());

    control.shutdown().await;
    assert_eq!(exited_events(&events), vec![3]);
    assert_eq!(control.exit_code(), Some(3));
}

#[tokio::test]
async fn test_connected_is_never_true_after_exit() {
    let (control, fake) = controller(config(SessionKind::Run), FakeSettings::default());
    let check = |control: &GdbControl| {
        assert!(!(control.is_exited() && control.is_connected()));
    };

    check(&control);
    assert_ok!(control.initialize().await);
    check(&control);
    assert!(control.is_connected());

    fake.emit("*stopped,reason=\"signal-received\"");
    let inferior = control.inferior().unwrap();
    assert!(eventually(|| inferior.state() == InferiorState::Stopped).await);
    check(&control);
    assert!(control.is_connected());

    fake.emit("*running,thread-id=\"all\"");
    assert!(eventually(|| inferior.state() == InferiorState::Running).await);
    check(&control);

    fake.crash(1);
    assert!(eventually(|| control.is_exited()).await);
    check(&control);
    assert!(!control.is_connected());

    control.shutdown().await;
    check(&control);
    assert!(!control.is_connected());
}

#[tokio::test]
async fn test_inferior_exit_auto_terminates_gdb() {
    let (control, fake) = controller(config(SessionKind::Run), FakeSettings::default());
    let events = record_events(&control);
    assert_ok!(control.initialize().await);

    fake.emit("=thread-group-exited,id=\"i1\",exit-code=\"012\"");
    let inferior = control.inferior().unwrap();
    assert!(eventually(|| inferior.state() == InferiorState::Terminated).await);
    assert_eq!(inferior.exit_code(), Some(10));
    assert!(!control.is_connected());

    assert!(eventually(|| exited_events(&events) == vec![0]).await);
    assert_eq!(fake.count("cmd:-gdb-exit"), 1);
    assert_eq!(fake.count("interrupt"), 0);

    control.shutdown().await;
}

#[tokio::test]
async fn test_remote_session_survives_inferior_exit() {
    let (control, fake) = controller(config(SessionKind::Remote), FakeSettings::default());
    assert_ok!(control.initialize().await);

    fake.emit("=thread-group-exited,id=\"i1\"");
    let inferior = control.inferior().unwrap();
    assert!(eventually(|| inferior.state() == InferiorState::Terminated).await);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fake.count("cmd:-gdb-exit"), 0);
    assert!(!control.is_exited());

    control.shutdown().await;
}

#[tokio::test]
async fn test_start_program_breaks_then_runs() {
    let config = SessionConfig {
        stop_at: Some("main".into()),
        ..config(SessionKind::Run)
    };
    let (control, fake) = controller(config, FakeSettings::default());
    assert_ok!(control.initialize().await);

    assert_ok!(control.start_program().await);
    let breakpoint = fake.position("cmd:-break-insert -t main").unwrap();
    let run = fake.position("cmd:-exec-run").unwrap();
    assert!(breakpoint < run);

    control.shutdown().await;
}

#[tokio::test]
async fn test_remote_start_continues() {
    let (control, fake) = controller(config(SessionKind::Remote), FakeSettings::default());
    assert_ok!(control.initialize().await);
    assert_ok!(control.start_program().await);
    assert_eq!(fake.count("cmd:-exec-continue"), 1);
    assert_eq!(fake.count("cmd:-exec-run"), 0);
    control.shutdown().await;
}

#[tokio::test]
async fn test_environment_and_terminal_setup() {
    let config = SessionConfig {
        inferior_tty: Some("/dev/pts/9".into()),
        ..config(SessionKind::Run)
    };
    let (control, fake) = controller(config, FakeSettings::default());
    assert_ok!(control.initialize().await);
    assert_eq!(fake.count("cmd:-inferior-tty-set /dev/pts/9"), 1);

    assert_ok!(control.set_environment([("LANG", "C"), ("TERM", "dumb")], true).await);
    let journal = fake.journal();
    let unset = fake.position("cmd:-interpreter-exec console \"unset environment\"").unwrap();
    let lang = fake.position("cmd:-gdb-set environment LANG=C").unwrap();
    assert!(unset < lang);
    assert!(journal.contains(&"cmd:-gdb-set environment TERM=dumb".to_string()));

    control.shutdown().await;
}

#[tokio::test]
async fn test_attach_skips_terminal_setup() {
    let config = SessionConfig {
        inferior_tty: Some("/dev/pts/9".into()),
        ..config(SessionKind::Attach)
    };
    let (control, fake) = controller(config, FakeSettings::default());
    assert_ok!(control.initialize().await);
    assert_eq!(fake.count("cmd:-inferior-tty-set /dev/pts/9"), 0);
    control.shutdown().await;
}

#[tokio::test]
async fn test_second_initialize_is_rejected() {
    let (control, _fake) = controller(config(SessionKind::Run), FakeSettings::default());
    assert_ok!(control.initialize().await);
    assert!(matches!(
        control.initialize().await,
        Err(ControlError::InvalidState(_))
    ));
    control.shutdown().await;
    assert!(control.shutdown().await.is_empty());
}

#[tokio::test]
async fn test_interrupt_and_destroy_reach_the_process() {
    let (control, fake) = controller(config(SessionKind::Run), FakeSettings::default());
    assert_ok!(control.initialize().await);

    control.interrupt().await;
    assert_eq!(fake.count("interrupt"), 1);

    control.destroy().await;
    assert_eq!(fake.count("destroy"), 1);
    assert!(eventually(|| control.is_exited()).await);
    assert_eq!(control.exit_code(), Some(137));

    control.shutdown().await;
    assert_eq!(fake.count("destroy"), 1);
}

#[tokio::test]
async fn test_interrupt_is_skipped_without_capability() {
    let settings = FakeSettings {
        supports_interrupt: false,
        ..FakeSettings::default()
    };
    let (control, fake) = controller(config(SessionKind::Run), settings);
    assert_ok!(control.initialize().await);
    assert!(!control.can_interrupt());

    control.interrupt().await;
    assert_eq!(fake.count("interrupt"), 0);

    control.shutdown().await;
}
