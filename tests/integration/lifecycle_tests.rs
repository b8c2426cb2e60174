//! Integration tests for the orchestrated build-then-serve lifecycle.

use serve_harness::models::state::SessionState;
use serve_harness::{AppError, Harness};

use super::test_helpers::{default_serve, FakeApp, TEST_TIMEOUT};

/// Build body that records each invocation before doing a normal build.
const COUNTING_BUILD: &str = r#"echo build >> builds.log
    mkdir -p .next
    printf 'abc123\n' > .next/BUILD_ID"#;

fn build_count(app: &FakeApp) -> usize {
    std::fs::read_to_string(app.path().join("builds.log"))
        .map(|log| log.lines().count())
        .unwrap_or(0)
}

/// A second start without a stop fails and spawns nothing new.
#[tokio::test]
async fn second_start_fails_with_already_started() {
    let app = FakeApp::new(COUNTING_BUILD, &default_serve());
    let mut harness = Harness::new(app.config());

    harness.start().await.expect("first start");
    let pid = harness.pid();

    let err = harness.start().await.expect_err("second start");

    assert!(matches!(err, AppError::AlreadyStarted), "got {err}");
    assert_eq!(build_count(&app), 1, "no second build may run");
    assert_eq!(harness.pid(), pid, "the first server is untouched");
    assert_eq!(harness.state(), SessionState::Ready);

    harness.stop().await.expect("stop");
}

/// After a stop the same harness can start again; output keeps growing.
#[tokio::test]
async fn restart_after_stop_appends_output() {
    let app = FakeApp::new(COUNTING_BUILD, &default_serve());
    let mut harness = Harness::new(app.config());

    harness.start().await.expect("first start");
    harness.stop().await.expect("first stop");
    let first_len = harness.output_bytes().await.len();

    tokio::time::timeout(TEST_TIMEOUT, harness.start())
        .await
        .expect("restart within timeout")
        .expect("restart");

    assert_eq!(build_count(&app), 2);
    assert_eq!(harness.state(), SessionState::Ready);
    assert!(harness.output_bytes().await.len() > first_len);

    harness.stop().await.expect("second stop");
}

/// A crashed server does not block a fresh start.
#[tokio::test]
async fn restart_after_crash_is_allowed() {
    let app = FakeApp::new(
        COUNTING_BUILD,
        "if [ -f crashed ]; then\n      echo \"info  - started server on 0.0.0.0:3000, url: http://localhost:3000\"\n      exec sleep 30\n    fi\n    touch crashed\n    exit 9",
    );
    let mut harness = Harness::new(app.config());

    let err = harness.start().await.expect_err("first run crashes");
    assert!(matches!(err, AppError::UnexpectedExit(Some(9))), "got {err}");

    let ready = harness.start().await.expect("second run serves");
    assert_eq!(ready.url.port(), Some(3000));

    harness.stop().await.expect("stop");
}

/// Lifecycle states are observable in order through the watch receiver.
#[tokio::test]
async fn state_watch_ends_ready() {
    let app = FakeApp::healthy();
    let mut harness = Harness::new(app.config());
    let state = harness.watch_state();
    assert_eq!(*state.borrow(), SessionState::Idle);

    harness.start().await.expect("start");

    assert_eq!(*state.borrow(), SessionState::Ready);
    harness.stop().await.expect("stop");
    assert_eq!(*state.borrow(), SessionState::Stopped);
}
