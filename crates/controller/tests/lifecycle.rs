//! End-to-end lifecycle tests against in-memory collaborators

mod support;

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use support::{count, last_position, position, Harness, JUNIT_CLEAN, JUNIT_FAILING};
use testenv_common::{
    ArtifactKind, FaultKind, RunOutcome, RunReport, StatusState, RUN_REPORT_FILE,
};

const REPORTS: &str = "/workspace/reports";
const COVERAGE: &str = "/workspace/coverage";

#[tokio::test]
async fn test_passing_run_reports_success_and_cleans_up() {
    let h = Harness::new();
    h.engine.with_report(REPORTS, "junit.xml", JUNIT_CLEAN);
    h.engine.with_report(COVERAGE, "lcov.info", "TN:");

    let controller = h.controller("101");
    let report = controller.run(CancellationToken::new()).await;

    assert_eq!(report.outcome, RunOutcome::Passed);
    assert_eq!(report.outcome.exit_code(), 0);
    assert_eq!(report.identity, "env-build-101");
    assert_eq!(report.branch.as_deref(), Some("main"));
    assert_eq!(report.structured_result.unwrap().tests, 4);
    assert!(report.teardown_warnings.is_empty());

    let states = h.reporter.states.lock().clone();
    assert_eq!(states, vec![StatusState::Pending, StatusState::Success]);

    // Nothing belonging to the build survives
    assert!(h.engine.containers().is_empty());
    assert!(h.engine.networks().is_empty());

    let written: RunReport = serde_json::from_str(
        &std::fs::read_to_string(h.output_dir().join(RUN_REPORT_FILE)).unwrap(),
    )
    .unwrap();
    assert_eq!(written.outcome, RunOutcome::Passed);
}

#[tokio::test]
async fn test_clean_report_overrides_nonzero_exit_code() {
    let h = Harness::new();
    h.engine.set_test_exit_code(1);
    h.engine.with_report(REPORTS, "junit.xml", JUNIT_CLEAN);

    let report = h.controller("7").run(CancellationToken::new()).await;

    assert_eq!(report.outcome, RunOutcome::Passed);
    assert_eq!(report.exit_code, Some(1));
    assert_eq!(report.outcome.exit_code(), 0);
}

#[tokio::test]
async fn test_reported_failures_fail_despite_zero_exit_code() {
    let h = Harness::new();
    h.engine.set_test_exit_code(0);
    h.engine.with_report(REPORTS, "junit.xml", JUNIT_FAILING);

    let report = h.controller("7").run(CancellationToken::new()).await;

    assert!(matches!(
        report.outcome,
        RunOutcome::Failed {
            failures: 2,
            errors: 0,
            exit_code: Some(0)
        }
    ));
    assert_eq!(report.outcome.exit_code(), 1);
    assert_eq!(h.reporter.last(), Some(StatusState::Failure));
}

#[tokio::test]
async fn test_exit_code_decides_without_structured_result() {
    let h = Harness::new();
    h.engine.set_test_exit_code(3);

    let report = h.controller("7").run(CancellationToken::new()).await;

    assert!(matches!(
        report.outcome,
        RunOutcome::Failed {
            exit_code: Some(3),
            ..
        }
    ));
    assert!(report.structured_result.is_none());
}

#[tokio::test]
async fn test_artifacts_collected_and_published_on_every_exit_code() {
    for exit_code in [0, 1] {
        let h = Harness::new();
        h.engine.set_test_exit_code(exit_code);
        h.engine.with_report(REPORTS, "junit.xml", JUNIT_FAILING);
        h.engine.with_report(COVERAGE, "lcov.info", "TN:");

        let report = h.controller("55").run(CancellationToken::new()).await;

        assert_eq!(report.artifacts.len(), 2, "exit code {}", exit_code);
        assert!(h.output_dir().join("reports/junit.xml").is_file());
        assert!(h.output_dir().join("coverage/lcov.info").is_file());

        let kinds: Vec<ArtifactKind> = h.publisher.published.lock().iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, vec![ArtifactKind::TestReport, ArtifactKind::Coverage]);

        // Reports leave the session before it is removed
        let session_rm = last_position(&h.events, "rm env-build-55-runner-").unwrap();
        assert!(position(&h.events, "copy out").unwrap() < session_rm);
    }
}

#[tokio::test]
async fn test_stale_reports_are_replaced() {
    let h = Harness::new();
    let stale = h.output_dir().join("reports");
    std::fs::create_dir_all(&stale).unwrap();
    std::fs::write(stale.join("junit.xml"), JUNIT_FAILING).unwrap();

    // This run produces no reports at all
    let report = h.controller("8").run(CancellationToken::new()).await;

    assert!(!stale.exists());
    assert!(report.structured_result.is_none());
    assert_eq!(report.outcome, RunOutcome::Passed);
}

#[tokio::test]
async fn test_session_waits_for_every_service() {
    let h = Harness::new();
    h.prober.fail_times("database", 2);
    h.prober.fail_times("app", 1);

    let report = h.controller("9").run(CancellationToken::new()).await;
    assert_eq!(report.outcome, RunOutcome::Passed);

    assert_eq!(count(&h.events, "probe database"), 3);
    assert_eq!(count(&h.events, "probe app"), 2);

    // Dependency order: app is not polled before database is healthy
    let db_ready = position(&h.events, "probe database true").unwrap();
    assert!(position(&h.events, "probe app").unwrap() > db_ready);

    let app_ready = position(&h.events, "probe app true").unwrap();
    let session = position(&h.events, "create session").unwrap();
    assert!(session > app_ready);
    assert!(position(&h.events, "compose up").unwrap() < position(&h.events, "probe").unwrap());
}

#[tokio::test]
async fn test_session_joins_internal_network() {
    let h = Harness::new();
    h.controller("12").run(CancellationToken::new()).await;

    let events = h.events.lock().clone();
    let create = events
        .iter()
        .find(|e| e.starts_with("create session"))
        .unwrap();
    assert!(create.starts_with("create session env-build-12-runner-"));
    assert!(create.ends_with("on env-build-12_default"));
}

#[tokio::test]
async fn test_unready_service_is_environment_fault() {
    let h = Harness::new();
    h.prober.never_ready("app");

    let report = h.controller("13").run(CancellationToken::new()).await;

    match &report.outcome {
        RunOutcome::Fault { kind, message } => {
            assert_eq!(*kind, FaultKind::EnvironmentNotReady);
            assert!(message.contains("app"));
        }
        other => panic!("expected fault, got {:?}", other),
    }
    assert_eq!(report.outcome.exit_code(), 2);
    assert_eq!(h.reporter.last(), Some(StatusState::Error));

    assert_eq!(count(&h.events, "probe app"), 3);
    assert_eq!(count(&h.events, "compose logs env-build-13 app 50"), 1);
    assert_eq!(count(&h.events, "create session"), 0);

    let logs = std::fs::read_to_string(h.output_dir().join("service-logs.txt")).unwrap();
    assert!(logs.contains("could not bind socket"));

    // Teardown still happened
    assert!(h.engine.containers().is_empty());
}

#[tokio::test]
async fn test_failed_install_is_execution_fault() {
    let h = Harness::new();
    h.engine.fail_install();
    h.engine.with_report(COVERAGE, "lcov.info", "TN:");

    let report = h.controller("14").run(CancellationToken::new()).await;

    assert!(matches!(
        report.outcome,
        RunOutcome::Fault {
            kind: FaultKind::ExecutionFault,
            ..
        }
    ));
    assert_eq!(count(&h.events, "exec npm run test:e2e"), 0);
    assert!(h.engine.containers().is_empty());

    // Whatever the session left behind is still collected and published
    assert_eq!(report.artifacts, vec![h.output_dir().join("coverage")]);
    assert_eq!(h.publisher.published.lock().len(), 1);
}

#[tokio::test]
async fn test_session_setup_failures_are_execution_faults() {
    for fail in ["create", "copy"] {
        let h = Harness::new();
        match fail {
            "create" => h.engine.fail_create_session(),
            _ => h.engine.fail_copy_in(),
        }

        let report = h.controller("19").run(CancellationToken::new()).await;

        match &report.outcome {
            RunOutcome::Fault { kind, message } => {
                assert_eq!(*kind, FaultKind::ExecutionFault, "{}", fail);
                assert!(
                    message.contains("runner session") || message.contains("sources"),
                    "{}",
                    message
                );
            }
            other => panic!("expected fault, got {:?}", other),
        }
        assert_eq!(report.outcome.exit_code(), 2);
        assert_eq!(count(&h.events, "exec npm"), 0);
        assert!(h.engine.containers().is_empty());
        assert_eq!(h.reporter.last(), Some(StatusState::Error));
    }
}

#[tokio::test]
async fn test_cancellation_still_tears_down() {
    let h = Harness::new();
    h.engine.hang_tests();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let events = h.events.clone();
    tokio::spawn(async move {
        // Cancel once the workload is running
        while position(&events, "exec npm run test:e2e").is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        trigger.cancel();
    });

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        h.controller("15").run(cancel),
    )
    .await
    .expect("run must return promptly after cancellation");

    assert!(matches!(
        report.outcome,
        RunOutcome::Fault {
            kind: FaultKind::Cancelled,
            ..
        }
    ));
    assert_eq!(report.outcome.exit_code(), 2);
    assert!(count(&h.events, "exec npm run test:e2e") == 1);
    assert!(last_position(&h.events, "compose down").unwrap() > position(&h.events, "exec npm run").unwrap());
    assert!(h.engine.containers().is_empty());
    assert_eq!(h.reporter.last(), Some(StatusState::Error));
}

#[tokio::test]
async fn test_cancelled_run_keeps_partial_reports() {
    let h = Harness::new();
    h.engine.hang_tests();
    h.engine.with_report(REPORTS, "junit.xml", JUNIT_FAILING);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let events = h.events.clone();
    tokio::spawn(async move {
        while position(&events, "exec npm run test:e2e").is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        trigger.cancel();
    });

    let report = tokio::time::timeout(Duration::from_secs(10), h.controller("20").run(cancel))
        .await
        .expect("run must return promptly after cancellation");

    assert!(matches!(
        report.outcome,
        RunOutcome::Fault {
            kind: FaultKind::Cancelled,
            ..
        }
    ));

    // Reports leave the session before anything is removed
    let copied = position(&h.events, "copy out env-build-20-runner-").unwrap();
    assert!(copied > position(&h.events, "exec npm run test:e2e").unwrap());
    assert!(copied < position(&h.events, "rm env-build-20-runner-").unwrap());

    assert!(h.output_dir().join("reports/junit.xml").is_file());
    assert_eq!(report.artifacts, vec![h.output_dir().join("reports")]);
    let kinds: Vec<ArtifactKind> = h.publisher.published.lock().iter().map(|(k, _)| *k).collect();
    assert_eq!(kinds, vec![ArtifactKind::TestReport]);
    assert!(h.engine.containers().is_empty());
}

#[tokio::test]
async fn test_teardown_failures_become_warnings() {
    let h = Harness::new();
    h.engine.with_report(REPORTS, "junit.xml", JUNIT_CLEAN);
    let controller = h.controller("21");
    h.engine.fail_compose_down();
    h.engine.stick("env-build-21-runner-");

    let report = controller.run(CancellationToken::new()).await;

    assert_eq!(report.outcome, RunOutcome::Passed);
    assert_eq!(report.outcome.exit_code(), 0);
    assert_eq!(h.reporter.last(), Some(StatusState::Success));

    let warnings = &report.teardown_warnings;
    assert!(warnings.iter().any(|w| w.contains("compose down for env-build-21 failed")));
    assert!(warnings.iter().any(|w| w.starts_with("failed to remove runner session env-build-21-runner-")));

    // The sweep still removed the service containers compose down left behind
    assert_eq!(h.engine.containers().len(), 1);
    assert!(h.engine.containers()[0].starts_with("env-build-21-runner-"));
}

#[tokio::test]
async fn test_unreachable_status_endpoint_is_warning() {
    let h = Harness::new();
    h.reporter.go_unreachable();

    let report = h.controller("22").run(CancellationToken::new()).await;

    assert_eq!(report.outcome, RunOutcome::Passed);
    let status_warnings = report
        .teardown_warnings
        .iter()
        .filter(|w| w.starts_with("failed to report"))
        .count();
    assert_eq!(status_warnings, 2);
    assert!(h.engine.containers().is_empty());
}

#[tokio::test]
async fn test_failed_publish_is_warning() {
    let h = Harness::new();
    h.engine.set_test_exit_code(1);
    h.engine.with_report(REPORTS, "junit.xml", JUNIT_FAILING);
    h.publisher.fill_up();

    let report = h.controller("23").run(CancellationToken::new()).await;

    assert!(matches!(report.outcome, RunOutcome::Failed { failures: 2, .. }));
    assert_eq!(report.outcome.exit_code(), 1);
    assert_eq!(report.artifacts.len(), 1);
    assert!(report
        .teardown_warnings
        .iter()
        .any(|w| w.starts_with("failed to publish") && w.contains("archive volume full")));
    assert!(h.output_dir().join(RUN_REPORT_FILE).is_file());
}

#[tokio::test]
async fn test_teardown_is_idempotent() {
    let h = Harness::new();
    let controller = h.controller("16");
    controller.run(CancellationToken::new()).await;

    let before = h.events.lock().len();
    assert!(controller.teardown(None).await.is_empty());
    assert!(controller.teardown(None).await.is_empty());

    // Repeated teardown finds nothing left to remove
    let removals = h.events.lock()[before..]
        .iter()
        .filter(|e| e.starts_with("rm ") || e.starts_with("network rm"))
        .count();
    assert_eq!(removals, 0);
}

#[tokio::test]
async fn test_runs_do_not_touch_other_builds() {
    let h = Harness::new();
    h.engine.add_container("env-build-10-app-1");
    h.engine.add_container("env-build-10-runner-deadbeef");
    h.engine.add_network("env-build-10_default");

    let report = h.controller("1").run(CancellationToken::new()).await;
    assert_eq!(report.outcome, RunOutcome::Passed);

    assert_eq!(
        h.engine.containers(),
        vec!["env-build-10-app-1", "env-build-10-runner-deadbeef"]
    );
    assert_eq!(h.engine.networks(), vec!["env-build-10_default"]);
}

#[tokio::test]
async fn test_dirty_ports_abort_before_bring_up() {
    let h = Harness::new();
    h.ports.occupy_stubbornly(5432);

    let report = h.controller("17").run(CancellationToken::new()).await;

    match &report.outcome {
        RunOutcome::Fault { kind, message } => {
            assert_eq!(*kind, FaultKind::EnvironmentDirty);
            assert!(message.contains("5432"));
        }
        other => panic!("expected fault, got {:?}", other),
    }
    assert_eq!(count(&h.events, "compose build"), 0);
    assert_eq!(count(&h.events, "create session"), 0);
}

#[tokio::test]
async fn test_busy_ports_are_freed_before_services_start() {
    let h = Harness::new();
    h.ports.occupy(3000);
    h.engine.publish(3000, "e2e-app-old");

    let report = h.controller("18").run(CancellationToken::new()).await;
    assert_eq!(report.outcome, RunOutcome::Passed);

    let freed = position(&h.events, "release 3000").unwrap();
    assert!(position(&h.events, "rm e2e-app-old").unwrap() < freed);
    assert!(freed < position(&h.events, "compose up").unwrap());
}
