mod common;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use common::{events_until, ok, wait_for_status, FakeRunner, Workspace, TWO_DEVICES};
use pifleet::config::testbed::Testbed;
use pifleet::device::{Operation, RejectReason, RunOutput, Status};
use pifleet::remote::RemoteCommand;
use pifleet::{Error, EventBus, Fleet, FleetEvent};

fn load(workspace: &Workspace, runner: &Arc<FakeRunner>) -> (Fleet, pifleet::EventStream) {
    let (events, stream) = EventBus::channel();
    let (fleet, report) =
        Fleet::load(workspace.settings(), runner.clone(), events).expect("fleet loads");
    assert!(report.is_clean(), "unexpected warnings: {}", report);
    (fleet, stream)
}

fn is_batch_finished(event: &FleetEvent) -> bool {
    matches!(event, FleetEvent::BatchFinished { .. })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_devices_come_online_and_fetch_output_once() {
    let workspace = Workspace::new(TWO_DEVICES);
    let runner = FakeRunner::new();
    let (fleet, _stream) = load(&workspace, &runner);

    wait_for_status(&fleet, "pi-01", Status::Online).await;
    wait_for_status(&fleet, "pi-02", Status::Online).await;

    // Several more polls report the same status
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(runner.calls(RemoteCommand::ReadOutputOnce, "10.0.0.1").len(), 1);
    assert_eq!(runner.calls(RemoteCommand::ReadOutputOnce, "10.0.0.2").len(), 1);
    assert!(runner.follows("10.0.0.1").is_empty());
    assert!(runner.calls(RemoteCommand::Status, "10.0.0.1").len() > 1);

    let snapshot = fleet.snapshot("pi-01").unwrap();
    assert_eq!(snapshot.project, "Blink");
    assert!(snapshot.project_valid);
    assert_eq!(snapshot.argv, "--delay 500 --pin 17");

    fleet.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_offline_device_recovers_with_fresh_output() {
    let workspace = Workspace::new(TWO_DEVICES);
    let runner = FakeRunner::new();
    runner.set_status("10.0.0.1", 255, "No route to host\n");
    let (fleet, mut stream) = load(&workspace, &runner);

    wait_for_status(&fleet, "pi-01", Status::Offline).await;
    assert_eq!(fleet.snapshot("pi-01").unwrap().error, "No route to host");
    assert!(runner.calls(RemoteCommand::ReadOutputOnce, "10.0.0.1").is_empty());

    runner.set_status("10.0.0.1", 2, "");
    let seen = events_until(&mut stream, |e| {
        matches!(
            e,
            FleetEvent::StatusChanged { device, current: Status::Online, .. } if device == "pi-01"
        )
    })
    .await;

    assert!(seen.contains(&FleetEvent::OutputReset {
        device: "pi-01".to_string()
    }));
    assert!(seen.iter().any(|e| matches!(
        e,
        FleetEvent::StatusChanged { device, current: Status::Offline, error: Some(error), .. }
            if device == "pi-01" && error == "No route to host"
    )));

    wait_for_status(&fleet, "pi-01", Status::Online).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fleet.snapshot("pi-01").unwrap().error, "");
    assert_eq!(runner.calls(RemoteCommand::ReadOutputOnce, "10.0.0.1").len(), 1);
    assert!(runner.follows("10.0.0.1").is_empty());

    fleet.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batch_finishes_once_after_every_device() {
    let workspace = Workspace::new(TWO_DEVICES);
    let runner = FakeRunner::new();
    let (fleet, mut stream) = load(&workspace, &runner);
    wait_for_status(&fleet, "pi-01", Status::Online).await;
    wait_for_status(&fleet, "pi-02", Status::Online).await;

    let report = fleet
        .dispatch(Operation::Compile, &["pi-01", "pi-02"])
        .unwrap();
    assert_eq!(report.dispatched, vec!["pi-01", "pi-02"]);
    assert!(report.rejected.is_empty());

    let seen = events_until(&mut stream, is_batch_finished).await;
    assert!(seen.contains(&FleetEvent::BatchStarted {
        operation: Operation::Compile,
        devices: 2
    }));
    let finished: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            FleetEvent::ActionFinished {
                device, success, ..
            } => Some((device.clone(), *success)),
            _ => None,
        })
        .collect();
    assert_eq!(finished.len(), 2);
    assert!(finished.iter().all(|(_, success)| *success));

    // No second completion
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Some(event) = stream.try_recv() {
        assert!(!is_batch_finished(&event), "duplicate {:?}", event);
    }
    assert!(!fleet.is_busy());

    fleet.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_save_passes_projects_directory() {
    let workspace = Workspace::new(TWO_DEVICES);
    let runner = FakeRunner::new();
    runner.set_result(RemoteCommand::Save, ok("makefile was saved successfully.\n"));
    let (fleet, mut stream) = load(&workspace, &runner);
    wait_for_status(&fleet, "pi-01", Status::Online).await;

    fleet.dispatch(Operation::Save, &["pi-01"]).unwrap();
    let seen = events_until(&mut stream, is_batch_finished).await;

    assert!(seen.contains(&FleetEvent::ActionFinished {
        device: "pi-01".to_string(),
        operation: Operation::Save,
        success: true,
        text: "makefile was saved successfully.\n".to_string(),
    }));

    let saves = runner.calls(RemoteCommand::Save, "10.0.0.1");
    assert_eq!(saves.len(), 1);
    assert_eq!(saves[0].project, "Blink");
    assert_eq!(
        saves[0].extra.as_deref(),
        Some(workspace.dir.path().join("projects").display().to_string().as_str())
    );

    fleet.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_action_reports_stderr() {
    let workspace = Workspace::new(TWO_DEVICES);
    let runner = FakeRunner::new();
    runner.set_result(
        RemoteCommand::Compile,
        RunOutput {
            exit_code: Some(254),
            stdout: String::new(),
            stderr: "main.c:3: error: expected ';'\n".to_string(),
        },
    );
    let (fleet, mut stream) = load(&workspace, &runner);
    wait_for_status(&fleet, "pi-02", Status::Online).await;

    fleet.dispatch(Operation::Compile, &["pi-02"]).unwrap();
    let seen = events_until(&mut stream, is_batch_finished).await;

    assert!(seen.contains(&FleetEvent::ActionFinished {
        device: "pi-02".to_string(),
        operation: Operation::Compile,
        success: false,
        text: "main.c:3: error: expected ';'\n".to_string(),
    }));
    assert_eq!(fleet.snapshot("pi-02").unwrap().status, Status::Online);

    fleet.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejected_dispatch_starts_no_batch() {
    let workspace = Workspace::new(TWO_DEVICES);
    let runner = FakeRunner::new();
    let (fleet, mut stream) = load(&workspace, &runner);
    wait_for_status(&fleet, "pi-01", Status::Online).await;
    wait_for_status(&fleet, "pi-02", Status::Online).await;

    let report = fleet
        .dispatch(Operation::Stop, &["pi-01", "pi-02", "pi-99"])
        .unwrap();
    assert!(report.dispatched.is_empty());

    let messages: Vec<String> = report.rejected.iter().map(|r| r.to_string()).collect();
    assert_eq!(
        messages,
        vec![
            "Application Blink is not running on pi-01.",
            "Application Plain is not running on pi-02.",
            "Unknown device: pi-99.",
        ]
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Some(event) = stream.try_recv() {
        assert!(
            !matches!(event, FleetEvent::BatchStarted { .. }),
            "unexpected {:?}",
            event
        );
    }
    assert!(!fleet.is_busy());
    assert!(runner.calls(RemoteCommand::Stop, "10.0.0.1").is_empty());

    fleet.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_selection_is_an_error() {
    let workspace = Workspace::new(TWO_DEVICES);
    let runner = FakeRunner::new();
    let (fleet, _stream) = load(&workspace, &runner);

    let names: [&str; 0] = [];
    let err = fleet.dispatch(Operation::Save, &names).unwrap_err();
    assert!(matches!(err, Error::NothingSelected));

    fleet.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_device_with_unknown_project_is_polled_but_not_dispatched() {
    let workspace = Workspace::new(
        "[pi-03]\naddress=10.0.0.3\nproject=Ghost\nargs=\n",
    );
    let runner = FakeRunner::new();
    let (events, _stream) = EventBus::channel();
    let (fleet, _report) = Fleet::load(workspace.settings(), runner.clone(), events).unwrap();

    wait_for_status(&fleet, "pi-03", Status::Online).await;
    let snapshot = fleet.snapshot("pi-03").unwrap();
    assert_eq!(snapshot.project, "Ghost");
    assert!(!snapshot.project_valid);

    let report = fleet.dispatch(Operation::Compile, &["pi-03"]).unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(report.rejected[0].reason, RejectReason::NoProject);
    assert_eq!(
        report.rejected[0].to_string(),
        "No valid project is assigned to pi-03."
    );

    fleet.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_busy_fleet_refuses_dispatch_and_refresh() {
    let workspace = Workspace::new(TWO_DEVICES);
    let runner = FakeRunner::new();
    runner.set_action_delay(Duration::from_millis(300));
    let (mut fleet, mut stream) = load(&workspace, &runner);
    wait_for_status(&fleet, "pi-01", Status::Online).await;
    wait_for_status(&fleet, "pi-02", Status::Online).await;

    fleet.dispatch(Operation::Compile, &["pi-01", "pi-02"]).unwrap();
    assert!(fleet.is_busy());

    let err = fleet.dispatch(Operation::Save, &["pi-01"]).unwrap_err();
    assert!(matches!(err, Error::Busy(2)));
    assert!(matches!(fleet.refresh().await, Err(Error::Busy(_))));

    events_until(&mut stream, is_batch_finished).await;
    assert!(!fleet.is_busy());

    let report = fleet.dispatch(Operation::Save, &["pi-01"]).unwrap();
    assert_eq!(report.dispatched, vec!["pi-01"]);
    events_until(&mut stream, is_batch_finished).await;

    fleet.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_follows_output_until_stopped() {
    let workspace = Workspace::new(TWO_DEVICES);
    let runner = FakeRunner::new();
    // Leaves time to script the status before the action settles
    runner.set_action_delay(Duration::from_millis(100));
    let (fleet, mut stream) = load(&workspace, &runner);
    wait_for_status(&fleet, "pi-01", Status::Online).await;

    fleet.dispatch(Operation::Start, &["pi-01"]).unwrap();
    runner.set_status("10.0.0.1", 1, "");
    events_until(&mut stream, is_batch_finished).await;
    wait_for_status(&fleet, "pi-01", Status::AppRunning).await;

    let starts = runner.calls(RemoteCommand::Start, "10.0.0.1");
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].extra.as_deref(), Some("--delay 500 --pin 17"));

    let follow = tokio::time::timeout(common::WAIT, async {
        loop {
            if let Some(follow) = runner.follows("10.0.0.1").pop() {
                return follow;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("output follow started");

    follow.chunk("tick 1\n");
    follow.chunk("tick 2\n");
    let seen = events_until(&mut stream, |e| {
        matches!(e, FleetEvent::Output { chunk, .. } if chunk == "tick 2\n")
    })
    .await;
    let chunks: Vec<&str> = seen
        .iter()
        .filter_map(|e| match e {
            FleetEvent::Output { device, chunk } if device == "pi-01" => Some(chunk.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(chunks, vec!["tick 1\n", "tick 2\n"]);

    // Start is refused while the application runs
    let report = fleet.dispatch(Operation::Start, &["pi-01"]).unwrap();
    assert_eq!(
        report.rejected[0].to_string(),
        "Application Blink is already running on pi-01."
    );

    fleet.dispatch(Operation::Stop, &["pi-01"]).unwrap();
    runner.set_status("10.0.0.1", 2, "");
    events_until(&mut stream, is_batch_finished).await;
    wait_for_status(&fleet, "pi-01", Status::Online).await;

    tokio::time::timeout(common::WAIT, async {
        while !follow.cancelled() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("follow cancelled after stop");
    assert_eq!(runner.follows("10.0.0.1").len(), 1);

    fleet.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_keeps_output_already_followed() {
    let workspace = Workspace::new(TWO_DEVICES);
    let runner = FakeRunner::new();
    runner.set_action_delay(Duration::from_millis(400));
    let (fleet, mut stream) = load(&workspace, &runner);
    wait_for_status(&fleet, "pi-01", Status::Online).await;

    // The application is seen running while the start call is still pending
    fleet.dispatch(Operation::Start, &["pi-01"]).unwrap();
    runner.set_status("10.0.0.1", 1, "");
    wait_for_status(&fleet, "pi-01", Status::AppRunning).await;

    let follow = tokio::time::timeout(common::WAIT, async {
        loop {
            if let Some(follow) = runner.follows("10.0.0.1").pop() {
                return follow;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("output follow started");
    follow.chunk("booting\n");

    let seen = events_until(&mut stream, is_batch_finished).await;
    let first_chunk = seen
        .iter()
        .position(|e| matches!(e, FleetEvent::Output { chunk, .. } if chunk == "booting\n"))
        .expect("chunk delivered before the start settled");
    assert!(
        !seen[first_chunk..].iter().any(|e| matches!(
            e,
            FleetEvent::OutputReset { device } if device == "pi-01"
        )),
        "output reset after streamed chunk: {:?}",
        seen
    );
    assert!(seen.iter().any(|e| matches!(
        e,
        FleetEvent::ActionFinished { operation: Operation::Start, success: true, .. }
    )));
    assert_eq!(runner.follows("10.0.0.1").len(), 1);

    fleet.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_follow_connection_loss_marks_device_offline() {
    let workspace = Workspace::new(TWO_DEVICES);
    let runner = FakeRunner::new();
    runner.set_status("10.0.0.2", 1, "");
    let (fleet, _stream) = load(&workspace, &runner);
    wait_for_status(&fleet, "pi-02", Status::AppRunning).await;

    let follow = tokio::time::timeout(common::WAIT, async {
        loop {
            if let Some(follow) = runner.follows("10.0.0.2").pop() {
                return follow;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("output follow started");

    runner.set_status("10.0.0.2", 255, "Connection reset");
    follow.end(255, "Connection reset by peer\n");

    wait_for_status(&fleet, "pi-02", Status::Offline).await;
    let error = fleet.snapshot("pi-02").unwrap().error;
    assert!(error.starts_with("Connection reset"), "error was {:?}", error);

    fleet.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_cancels_running_follow() {
    let workspace = Workspace::new(TWO_DEVICES);
    let runner = FakeRunner::new();
    runner.set_status("10.0.0.1", 1, "");
    let (fleet, _stream) = load(&workspace, &runner);
    wait_for_status(&fleet, "pi-01", Status::AppRunning).await;

    let follow = tokio::time::timeout(common::WAIT, async {
        loop {
            if let Some(follow) = runner.follows("10.0.0.1").pop() {
                return follow;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("output follow started");

    tokio::time::timeout(common::WAIT, fleet.shutdown())
        .await
        .expect("shutdown completes");
    assert!(follow.cancelled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_assign_and_arguments_rewrite_testbed() {
    let workspace = Workspace::new(TWO_DEVICES);
    let runner = FakeRunner::new();
    let (mut fleet, _stream) = load(&workspace, &runner);

    fleet.assign("pi-02", "Blink").unwrap();
    fleet.set_argument("pi-02", "delay", "250").unwrap();
    fleet.set_argument("pi-01", "pin", "").unwrap();

    let saved = Testbed::load(&workspace.testbed).unwrap();
    assert_eq!(saved.devices[1].project, "Blink");
    assert_eq!(saved.devices[1].args.get("delay").map(String::as_str), Some("250"));
    assert!(!saved.devices[0].args.contains_key("pin"));

    let mut rx = fleet.device("pi-02").unwrap().subscribe();
    tokio::time::timeout(common::WAIT, async {
        while rx.borrow_and_update().argv != "--delay 250 --pin " {
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("argv resolved");
    assert!(fleet.snapshot("pi-02").unwrap().project_valid);

    assert!(matches!(
        fleet.assign("pi-02", "Ghost"),
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        fleet.set_argument("pi-02", "a,b", "1"),
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        fleet.assign("pi-99", "Blink"),
        Err(Error::UnknownDevice(_))
    ));

    fleet.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_refresh_picks_up_testbed_changes() {
    let workspace = Workspace::new(TWO_DEVICES);
    let runner = FakeRunner::new();
    let (mut fleet, _stream) = load(&workspace, &runner);
    wait_for_status(&fleet, "pi-01", Status::Online).await;

    let mut testbed = Testbed::load(&workspace.testbed).unwrap();
    testbed.devices.truncate(1);
    testbed.save(&workspace.testbed).unwrap();

    let report = fleet.refresh().await.unwrap();
    assert!(report.is_clean());
    let names: Vec<&str> = fleet.devices().map(|d| d.name()).collect();
    assert_eq!(names, vec!["pi-01"]);
    assert!(fleet.device("pi-02").is_none());
    wait_for_status(&fleet, "pi-01", Status::Online).await;

    fleet.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_leaves_no_events_behind_after_drain() {
    let workspace = Workspace::new(TWO_DEVICES);
    let runner = FakeRunner::new();
    runner.set_status("10.0.0.1", 1, "");
    let (mut fleet, mut stream) = load(&workspace, &runner);
    wait_for_status(&fleet, "pi-01", Status::AppRunning).await;
    let follow = tokio::time::timeout(common::WAIT, async {
        loop {
            if let Some(follow) = runner.follows("10.0.0.1").pop() {
                return follow;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("output followed");
    follow.chunk("old fleet\n");

    fleet.stop().await.unwrap();
    assert_eq!(fleet.devices().count(), 0);
    assert!(follow.cancelled());

    while stream.try_recv().is_some() {}
    follow.chunk("too late\n");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(stream.try_recv(), None);

    let report = fleet.reload().unwrap();
    assert!(report.is_clean());
    assert_eq!(fleet.devices().count(), 2);
    wait_for_status(&fleet, "pi-01", Status::AppRunning).await;

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_load_reports_duplicate_and_incomplete_devices() {
    let workspace = Workspace::new(
        "[pi-01]\naddress=10.0.0.1\nproject=Blink\n\n\
         [pi-01]\naddress=10.0.0.9\nproject=Blink\n\n\
         [pi-04]\nproject=Plain\n",
    );
    let runner = FakeRunner::new();
    let (events, _stream) = EventBus::channel();
    let (fleet, report) = Fleet::load(workspace.settings(), runner, events).unwrap();

    assert_eq!(fleet.devices().count(), 1);
    assert_eq!(report.warnings.len(), 2);
    assert!(report
        .warnings
        .iter()
        .any(|w| w == "No address was set for Client pi-04."));

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_missing_configuration_is_fatal() {
    let workspace = Workspace::new(TWO_DEVICES);
    let runner = FakeRunner::new();

    let missing = workspace.settings().with_testbed(workspace.dir.path().join("nope.txt"));
    let (events, _stream) = EventBus::channel();
    assert!(matches!(
        Fleet::load(missing, runner.clone(), events),
        Err(Error::Config(_))
    ));

    fs::remove_dir_all(workspace.dir.path().join("projects")).unwrap();
    let (events, _stream) = EventBus::channel();
    let err = Fleet::load(workspace.settings(), runner, events).err().unwrap();
    assert!(err.to_string().contains("doesn't exist"));
}
