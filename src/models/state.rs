//! Session lifecycle state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a harness session.
///
/// The happy path is `Idle -> Building -> Built -> Starting -> Ready ->
/// Stopped`. `Errored` is reached from `Building` on a failed build and from
/// `Starting`/`Ready` when the server exits on its own.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No child process has been spawned yet.
    #[default]
    Idle,
    /// The build sub-run is executing.
    Building,
    /// The build sub-run exited successfully.
    Built,
    /// The serve sub-run is spawned and the readiness marker is pending.
    Starting,
    /// The serve sub-run announced its URL.
    Ready,
    /// The serve sub-run was terminated through an explicit stop.
    Stopped,
    /// A sub-run failed or the server exited without a stop request.
    Errored,
}

impl SessionState {
    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle | Self::Stopped | Self::Errored, Self::Building)
                | (Self::Building, Self::Built | Self::Errored)
                | (Self::Built, Self::Starting)
                | (Self::Starting, Self::Ready)
                | (Self::Starting | Self::Ready, Self::Stopped | Self::Errored)
        )
    }

    /// Whether a fresh `start` may begin from this state.
    #[must_use]
    pub fn is_restartable(self) -> bool {
        matches!(self, Self::Idle | Self::Stopped | Self::Errored)
    }

    /// Whether a child process is expected to be alive in this state.
    #[must_use]
    pub fn has_live_process(self) -> bool {
        matches!(self, Self::Building | Self::Starting | Self::Ready)
    }
}
