//! Integration tests for the long-running serve sub-run and readiness
//! detection.

use std::time::Duration;

use serve_harness::harness::spawner::ProcessSpec;
use serve_harness::models::state::SessionState;
use serve_harness::{AppError, Harness};
use url::Url;

use super::test_helpers::{FakeApp, DEFAULT_BUILD, READY_LINE, TEST_TIMEOUT};

/// The announced URL is parsed from the readiness line.
#[tokio::test]
async fn readiness_line_yields_announced_url() {
    let app = FakeApp::healthy();
    let mut harness = Harness::new(app.config());

    let ready = tokio::time::timeout(TEST_TIMEOUT, harness.start())
        .await
        .expect("start within timeout")
        .expect("start succeeds");

    let expected = Url::parse("http://localhost:3000").expect("url");
    assert_eq!(ready.url, expected);
    assert_eq!(harness.url(), Some(&expected));
    assert_eq!(ready.build_id, "abc123");
    assert_eq!(ready.session_id, harness.id());
    assert_eq!(harness.state(), SessionState::Ready);
    assert!(harness.is_running());

    harness.stop().await.expect("stop");
}

/// Only the first readiness line counts; a repeated announcement with a
/// different URL is ignored.
#[tokio::test]
async fn first_readiness_line_wins() {
    let serve = format!(
        "echo \"{READY_LINE}\"\n    echo \"info  - started server on 0.0.0.0:4000, url: http://localhost:4000\"\n    exec sleep 30"
    );
    let app = FakeApp::new(DEFAULT_BUILD, &serve);
    let mut harness = Harness::new(app.config());

    let ready = harness.start().await.expect("start succeeds");

    assert_eq!(ready.url.port(), Some(3000));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.url().and_then(Url::port), Some(3000));

    harness.stop().await.expect("stop");
}

/// A readiness marker printed without a trailing newline is still detected.
#[tokio::test]
async fn readiness_without_trailing_newline() {
    let app = FakeApp::new(
        DEFAULT_BUILD,
        "printf 'info  - started server on 0.0.0.0:3000, url: http://localhost:3000'\n    exec sleep 30",
    );
    let mut config = app.config();
    config.timeouts.ready_timeout_seconds = 10;
    let mut harness = Harness::new(config);

    let ready = tokio::time::timeout(TEST_TIMEOUT, harness.start())
        .await
        .expect("start within timeout")
        .expect("start succeeds");

    assert_eq!(ready.url.as_str(), "http://localhost:3000/");
    assert_eq!(harness.config().timeouts.ready_timeout_seconds, 10);

    harness.stop().await.expect("stop");
}

/// A server exiting before it announces itself fails the start instead of
/// hanging, and the exit is not also pushed to the fatal channel.
#[tokio::test]
async fn exit_before_readiness_fails_start() {
    let app = FakeApp::new(DEFAULT_BUILD, "echo \"booting\"\n    exit 7");
    let mut harness = Harness::new(app.config());
    let mut fatal = harness.take_fatal_errors().expect("fatal receiver");

    let err = tokio::time::timeout(TEST_TIMEOUT, harness.start())
        .await
        .expect("start within timeout")
        .expect_err("server died early");

    assert!(matches!(err, AppError::UnexpectedExit(Some(7))), "got {err}");
    assert_eq!(harness.state(), SessionState::Errored);
    assert!(!harness.is_running());
    assert!(fatal.try_recv().is_err(), "caller already received the error");
}

/// An unexpected exit after readiness reaches the fatal channel.
#[tokio::test]
async fn exit_after_readiness_is_fatal() {
    let serve = format!("echo \"{READY_LINE}\"\n    sleep 1\n    exit 3");
    let app = FakeApp::new(DEFAULT_BUILD, &serve);
    let mut harness = Harness::new(app.config());
    let mut fatal = harness.take_fatal_errors().expect("fatal receiver");
    let mut state = harness.watch_state();

    harness.start().await.expect("start succeeds");

    let err = tokio::time::timeout(TEST_TIMEOUT, fatal.recv())
        .await
        .expect("fatal error within timeout")
        .expect("channel open");
    assert!(matches!(err, AppError::UnexpectedExit(Some(3))), "got {err}");

    state
        .wait_for(|s| *s == SessionState::Errored)
        .await
        .expect("state sender alive");
    assert!(!harness.is_running());
    assert!(!harness.is_stopping());
}

/// A silent server trips the configured readiness timeout and is killed.
#[tokio::test]
async fn silent_server_times_out() {
    let app = FakeApp::new(DEFAULT_BUILD, "echo \"still booting\"\n    exec sleep 30");
    let mut config = app.config();
    config.timeouts.ready_timeout_seconds = 1;
    let mut harness = Harness::new(config);

    let err = tokio::time::timeout(TEST_TIMEOUT, harness.start())
        .await
        .expect("start within timeout")
        .expect_err("readiness never comes");

    assert!(
        matches!(err, AppError::ReadyTimeout(limit) if limit == Duration::from_secs(1)),
        "got {err}"
    );
    assert!(!harness.is_running());
    assert_eq!(harness.state(), SessionState::Errored);
}

/// A readiness line with an unparsable URL fails the start.
#[tokio::test]
async fn invalid_announced_url_fails_start() {
    let app = FakeApp::new(
        DEFAULT_BUILD,
        "echo \"info  - started server on 0.0.0.0:3000, url: not a url\"\n    exec sleep 30",
    );
    let mut harness = Harness::new(app.config());

    let err = harness.start().await.expect_err("url is invalid");

    assert!(matches!(err, AppError::InvalidUrl(_)), "got {err}");
    assert!(!harness.is_running());
}

/// The serve step refuses to run before any successful build.
#[tokio::test]
async fn serve_step_requires_a_build() {
    let app = FakeApp::healthy();
    let config = app.config();
    let mut harness = Harness::new(config.clone());

    let err = harness
        .start_serve_step(&ProcessSpec::serve(&config))
        .await
        .expect_err("no build yet");

    assert!(matches!(err, AppError::InvalidTransition(_)), "got {err}");
    assert_eq!(harness.state(), SessionState::Idle);
}
