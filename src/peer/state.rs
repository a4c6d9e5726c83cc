use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};

/// Lifecycle of one local peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum CallState {
    Idle,
    MediaAcquired,
    /// Initiator: offer published, waiting for an answer
    Offering,
    /// Joiner: answer published, exchanging candidates
    Answering,
    Connected,
    Closed,
    Failed(ErrorKind),
}

impl CallState {
    /// Offering, answering or connected.
    pub fn is_in_call(&self) -> bool {
        matches!(self, Self::Offering | Self::Answering | Self::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed(_))
    }

    pub fn affordances(&self) -> Affordances {
        match self {
            Self::Idle | Self::Closed | Self::Failed(_) => Affordances {
                start_camera: true,
                ..Affordances::default()
            },
            Self::MediaAcquired => Affordances {
                call: true,
                answer: true,
                ..Affordances::default()
            },
            Self::Offering | Self::Answering | Self::Connected => Affordances {
                hang_up: true,
                ..Affordances::default()
            },
        }
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::MediaAcquired => f.write_str("media-acquired"),
            Self::Offering => f.write_str("offering"),
            Self::Answering => f.write_str("answering"),
            Self::Connected => f.write_str("connected"),
            Self::Closed => f.write_str("closed"),
            Self::Failed(kind) => write!(f, "failed ({kind})"),
        }
    }
}

/// Which user actions are enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Affordances {
    pub start_camera: bool,
    pub call: bool,
    pub answer: bool,
    pub hang_up: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_and_answer_need_media() {
        let idle = CallState::Idle.affordances();
        assert!(idle.start_camera);
        assert!(!idle.call && !idle.answer && !idle.hang_up);

        let ready = CallState::MediaAcquired.affordances();
        assert!(!ready.start_camera);
        assert!(ready.call && ready.answer);
        assert!(!ready.hang_up);
    }

    #[test]
    fn test_hang_up_only_during_call() {
        for state in [CallState::Offering, CallState::Answering, CallState::Connected] {
            let a = state.affordances();
            assert!(a.hang_up);
            assert!(!a.call && !a.answer && !a.start_camera);
        }
    }

    #[test]
    fn test_permission_failure_keeps_call_disabled() {
        let a = CallState::Failed(ErrorKind::Permission).affordances();
        assert!(!a.call && !a.answer && !a.hang_up);
        assert!(a.start_camera);
    }

    #[test]
    fn test_state_serializes_with_error_kind() {
        let json = serde_json::to_string(&CallState::Failed(ErrorKind::SessionNotFound)).unwrap();
        assert_eq!(json, r#"{"state":"failed","error":"session_not_found"}"#);
    }
}
