//! Lifecycle state shared by sandboxes and containers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vcbox_shared::errors::VcError;

/// Lifecycle state of a sandbox or container.
///
/// Transitions:
/// ```text
/// ready -> running <-> paused
///            |           |
///            +-> stopped <-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    #[default]
    Ready,
    Running,
    Paused,
    Stopped,
}

impl StateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StateKind::Ready => "ready",
            StateKind::Running => "running",
            StateKind::Paused => "paused",
            StateKind::Stopped => "stopped",
        }
    }

    /// Whether a direct transition from `self` to `next` is legal.
    pub fn can_transition_to(self, next: StateKind) -> bool {
        use StateKind::*;
        matches!(
            (self, next),
            (Ready, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Stopped)
                | (Paused, Stopped)
        )
    }

    pub fn can_start(self) -> bool {
        self.can_transition_to(StateKind::Running) && self != StateKind::Paused
    }

    pub fn can_stop(self) -> bool {
        matches!(self, StateKind::Running | StateKind::Paused)
    }

    /// Whether resources in this state may be deleted.
    pub fn can_delete(self) -> bool {
        matches!(self, StateKind::Ready | StateKind::Stopped)
    }

    pub fn is_active(self) -> bool {
        matches!(self, StateKind::Running | StateKind::Paused)
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StateKind {
    type Err = VcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(StateKind::Ready),
            "running" => Ok(StateKind::Running),
            "paused" => Ok(StateKind::Paused),
            "stopped" => Ok(StateKind::Stopped),
            other => Err(VcError::Config(format!("unknown state {:?}", other))),
        }
    }
}

/// Persisted state record (`state.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct State {
    pub state: StateKind,

    /// vCPUs hot-added on top of the configured count.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub hotplugged_vcpus: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

impl State {
    pub fn new(state: StateKind) -> Self {
        Self {
            state,
            hotplugged_vcpus: 0,
            last_updated: Some(Utc::now()),
        }
    }

    /// Copy of `self` moved to `next`, stamped with the current time.
    ///
    /// Does not check legality; callers validate with [`StateKind::can_transition_to`].
    pub fn with_state(&self, next: StateKind) -> Self {
        Self {
            state: next,
            hotplugged_vcpus: self.hotplugged_vcpus,
            last_updated: Some(Utc::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        use StateKind::*;
        assert!(Ready.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopped));
        assert!(Paused.can_transition_to(Stopped));
    }

    #[test]
    fn test_illegal_transitions() {
        use StateKind::*;
        assert!(!Ready.can_transition_to(Paused));
        assert!(!Ready.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Paused.can_transition_to(Paused));
        assert!(!Running.can_transition_to(Ready));
    }

    #[test]
    fn test_start_stop_delete_predicates() {
        assert!(StateKind::Ready.can_start());
        assert!(!StateKind::Paused.can_start());
        assert!(!StateKind::Stopped.can_start());

        assert!(StateKind::Running.can_stop());
        assert!(StateKind::Paused.can_stop());
        assert!(!StateKind::Ready.can_stop());

        assert!(StateKind::Stopped.can_delete());
        assert!(StateKind::Ready.can_delete());
        assert!(!StateKind::Running.can_delete());
    }

    #[test]
    fn test_state_json_shape() {
        let state = State {
            state: StateKind::Running,
            hotplugged_vcpus: 0,
            last_updated: None,
        };
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"state":"running"}"#);

        let back: State = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_with_state_keeps_hotplug_count() {
        let mut state = State::new(StateKind::Ready);
        state.hotplugged_vcpus = 2;
        let next = state.with_state(StateKind::Running);
        assert_eq!(next.state, StateKind::Running);
        assert_eq!(next.hotplugged_vcpus, 2);
    }

    #[test]
    fn test_parse_state() {
        assert_eq!("paused".parse::<StateKind>().unwrap(), StateKind::Paused);
        assert!("bogus".parse::<StateKind>().is_err());
    }
}
