//! Unit tests for `AppError` display format and exit-code extraction.

use std::time::Duration;

use serve_harness::AppError;

#[test]
fn build_failed_display_includes_code() {
    let err = AppError::BuildFailed(1);
    assert_eq!(err.to_string(), "build failed: exited with code 1");
}

#[test]
fn unexpected_exit_display_distinguishes_signal() {
    assert_eq!(
        AppError::UnexpectedExit(Some(3)).to_string(),
        "unexpected exit: server exited with code 3"
    );
    assert_eq!(
        AppError::UnexpectedExit(None).to_string(),
        "unexpected exit: server terminated by signal"
    );
}

#[test]
fn display_prefixes_are_distinct() {
    let rendered = [
        AppError::Config("x".into()).to_string(),
        AppError::AlreadyStarted.to_string(),
        AppError::Spawn("x".into()).to_string(),
        AppError::InvalidUrl("x".into()).to_string(),
        AppError::ReadyTimeout(Duration::from_secs(1)).to_string(),
        AppError::NotRunning.to_string(),
        AppError::InvalidTransition("x".into()).to_string(),
        AppError::Io("x".into()).to_string(),
    ];
    let prefixes: std::collections::HashSet<_> = rendered
        .iter()
        .map(|s| s.split(':').next().unwrap_or_default().to_owned())
        .collect();
    assert_eq!(prefixes.len(), rendered.len());
}

#[test]
fn messages_have_no_trailing_period() {
    for err in [
        AppError::AlreadyStarted,
        AppError::NotRunning,
        AppError::BuildFailed(2),
        AppError::ReadyTimeout(Duration::from_secs(30)),
    ] {
        let s = err.to_string();
        assert!(!s.ends_with('.'), "error message must not end with a period: {s}");
    }
}

#[test]
fn exit_code_is_exposed_for_exit_errors_only() {
    assert_eq!(AppError::BuildFailed(1).exit_code(), Some(1));
    assert_eq!(AppError::UnexpectedExit(Some(9)).exit_code(), Some(9));
    assert_eq!(AppError::UnexpectedExit(None).exit_code(), None);
    assert_eq!(AppError::AlreadyStarted.exit_code(), None);
}

#[test]
fn io_errors_convert() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    let err: AppError = io.into();
    assert!(matches!(err, AppError::Io(ref msg) if msg == "gone"));
}

#[test]
fn url_errors_convert() {
    let parse = url::Url::parse("not a url").expect_err("invalid");
    let err: AppError = parse.into();
    assert!(err.to_string().starts_with("invalid url:"));
}
