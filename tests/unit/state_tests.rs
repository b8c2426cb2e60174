//! Unit tests for the session lifecycle state machine.

use serve_harness::models::state::SessionState;

const ALL: [SessionState; 7] = [
    SessionState::Idle,
    SessionState::Building,
    SessionState::Built,
    SessionState::Starting,
    SessionState::Ready,
    SessionState::Stopped,
    SessionState::Errored,
];

#[test]
fn happy_path_is_allowed() {
    let path = [
        SessionState::Idle,
        SessionState::Building,
        SessionState::Built,
        SessionState::Starting,
        SessionState::Ready,
        SessionState::Stopped,
        SessionState::Building,
    ];
    for pair in path.windows(2) {
        assert!(
            pair[0].can_transition_to(pair[1]),
            "{:?} -> {:?} should be allowed",
            pair[0],
            pair[1]
        );
    }
}

#[test]
fn failures_lead_to_errored() {
    assert!(SessionState::Building.can_transition_to(SessionState::Errored));
    assert!(SessionState::Starting.can_transition_to(SessionState::Errored));
    assert!(SessionState::Ready.can_transition_to(SessionState::Errored));
    assert!(SessionState::Errored.can_transition_to(SessionState::Building));
}

#[test]
fn serve_requires_a_finished_build() {
    assert!(!SessionState::Idle.can_transition_to(SessionState::Starting));
    assert!(!SessionState::Stopped.can_transition_to(SessionState::Starting));
    assert!(!SessionState::Errored.can_transition_to(SessionState::Starting));
}

#[test]
fn live_states_cannot_rebuild() {
    for state in [SessionState::Building, SessionState::Starting, SessionState::Ready] {
        assert!(!state.can_transition_to(SessionState::Building), "{state:?}");
        assert!(!state.is_restartable(), "{state:?}");
        assert!(state.has_live_process(), "{state:?}");
    }
}

#[test]
fn no_self_transitions() {
    for state in ALL {
        assert!(!state.can_transition_to(state), "{state:?} -> itself");
    }
}

#[test]
fn restartable_states_have_no_live_process() {
    for state in ALL.into_iter().filter(|s| s.is_restartable()) {
        assert!(!state.has_live_process(), "{state:?}");
    }
}

#[test]
fn default_is_idle() {
    assert_eq!(SessionState::default(), SessionState::Idle);
}

#[test]
fn serializes_snake_case() {
    let json = serde_json::to_string(&SessionState::Errored).expect("serialize");
    assert_eq!(json, "\"errored\"");
}
