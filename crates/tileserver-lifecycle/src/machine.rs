//! Renewal state machine
//!
//! Pure: maps `(state, input)` to the actions the driver must run, in order.
//! Nothing here touches the network, the disk or the clock.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Obtaining,
    Serving,
    Renewing,
    Reloading,
    Terminated,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Obtaining => "obtaining",
            LifecycleState::Serving => "serving",
            LifecycleState::Renewing => "renewing",
            LifecycleState::Reloading => "reloading",
            LifecycleState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// What the cache held at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Unexpired material for the configured domains
    Valid,
    /// Nothing usable: absent, unreadable or already expired
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalEvent {
    WillRenew,
    DidRenew,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Graceful,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Start { cache: CacheStatus },
    RenewalDue,
    ChallengeSucceeded,
    ChallengeFailed,
    Persisted,
    PersistFailed,
    GenerationFailed,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    BeginChallenge,
    Emit(RenewalEvent),
    StopGeneration,
    PersistMaterial,
    InstallMaterial,
    StartGeneration,
    ScheduleRenewal,
    ScheduleRetry,
    Exit(ExitReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("input {input:?} is not accepted while {state}")]
pub struct TransitionError {
    pub state: LifecycleState,
    pub input: Input,
}

#[derive(Debug, Clone)]
pub struct RenewalMachine {
    state: LifecycleState,
    renewals: u64,
}

impl Default for RenewalMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RenewalMachine {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Idle,
            renewals: 0,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Completed renewals; only ever increases
    pub fn renewals(&self) -> u64 {
        self.renewals
    }

    pub fn handle(&mut self, input: Input) -> Result<Vec<Action>, TransitionError> {
        use Action::*;
        use LifecycleState::*;

        let (next, actions) = match (self.state, input) {
            (Terminated, _) => return Err(self.reject(input)),

            (_, Input::Shutdown) => (Terminated, vec![StopGeneration, Exit(ExitReason::Graceful)]),

            (Idle, Input::Start { cache: CacheStatus::Missing }) => (Obtaining, vec![BeginChallenge]),
            (Idle, Input::Start { cache: CacheStatus::Valid }) => (
                Serving,
                vec![InstallMaterial, StartGeneration, ScheduleRenewal],
            ),

            (Obtaining, Input::ChallengeSucceeded) => (Obtaining, vec![PersistMaterial]),
            (Obtaining, Input::Persisted) => (
                Serving,
                vec![InstallMaterial, StartGeneration, ScheduleRenewal],
            ),
            (Obtaining, Input::ChallengeFailed | Input::PersistFailed) => {
                (Terminated, vec![Exit(ExitReason::Fatal)])
            }

            (Serving, Input::RenewalDue) => (
                Renewing,
                vec![Emit(RenewalEvent::WillRenew), StopGeneration, BeginChallenge],
            ),
            (Serving, Input::GenerationFailed) => (Terminated, vec![Exit(ExitReason::Fatal)]),

            (Renewing, Input::ChallengeSucceeded) => (Reloading, vec![PersistMaterial]),
            (Renewing, Input::ChallengeFailed) => (Serving, vec![StartGeneration, ScheduleRetry]),

            (Reloading, Input::Persisted) => {
                self.renewals += 1;
                (
                    Serving,
                    vec![
                        InstallMaterial,
                        Emit(RenewalEvent::DidRenew),
                        StartGeneration,
                        ScheduleRenewal,
                    ],
                )
            }
            (Reloading, Input::PersistFailed) => (Serving, vec![StartGeneration, ScheduleRetry]),

            _ => return Err(self.reject(input)),
        };

        self.state = next;
        Ok(actions)
    }

    fn reject(&self, input: Input) -> TransitionError {
        TransitionError {
            state: self.state,
            input,
        }
    }
}
