use agentcanvas_llm::StreamTarget;

use super::message::MessageId;

/// Where an active token stream lands.
///
/// A sum type rather than a convention: one `ActiveStream` holds exactly one
/// sink, so streaming into the chat transcript and the canvas at the same
/// time cannot be expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSink {
    ChatMessage(MessageId),
    CanvasDocument,
}

/// Coordinator-level metadata for the one stream a thread may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveStream {
    pub target: StreamTarget,
    pub sink: StreamSink,
}

/// Stream lifecycle boundary for one thread.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Streaming(StreamTarget),
    Done(StreamTarget),
    Error {
        target: StreamTarget,
        message: String,
    },
}

/// State transition input for the stream lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransition {
    Start(StreamTarget),
    Complete(StreamTarget),
    Fail {
        target: StreamTarget,
        message: String,
    },
    ResetToIdle,
}

/// Rejection reason for illegal stream transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransitionRejection {
    AlreadyStreaming {
        active: StreamTarget,
        attempted: StreamTarget,
    },
    NoActiveStream,
    SessionMismatch {
        active: StreamTarget,
        attempted: StreamTarget,
    },
}

pub type StreamTransitionResult = Result<StreamState, StreamTransitionRejection>;

impl StreamState {
    /// Returns true when incoming stream data matches the active session.
    pub fn accepts_stream_event(&self, target: StreamTarget) -> bool {
        matches!(self, Self::Streaming(active) if *active == target)
    }

    /// Applies one transition deterministically.
    ///
    /// Non-streaming states may start a new session directly. Any terminal
    /// transition must name the currently active session exactly.
    pub fn apply(&self, transition: StreamTransition) -> StreamTransitionResult {
        match transition {
            StreamTransition::Start(target) => self.apply_start(target),
            StreamTransition::Complete(target) => self.apply_complete(target),
            StreamTransition::Fail { target, message } => self.apply_fail(target, message),
            StreamTransition::ResetToIdle => Ok(Self::Idle),
        }
    }

    fn apply_start(&self, target: StreamTarget) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) if *active != target => {
                Err(StreamTransitionRejection::AlreadyStreaming {
                    active: *active,
                    attempted: target,
                })
            }
            Self::Streaming(_) => Ok(self.clone()),
            Self::Idle | Self::Done(_) | Self::Error { .. } => Ok(Self::Streaming(target)),
        }
    }

    fn apply_complete(&self, target: StreamTarget) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) if *active == target => Ok(Self::Done(target)),
            Self::Streaming(active) => Err(StreamTransitionRejection::SessionMismatch {
                active: *active,
                attempted: target,
            }),
            Self::Idle | Self::Done(_) | Self::Error { .. } => {
                Err(StreamTransitionRejection::NoActiveStream)
            }
        }
    }

    fn apply_fail(&self, target: StreamTarget, message: String) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) if *active == target => Ok(Self::Error { target, message }),
            Self::Streaming(active) => Err(StreamTransitionRejection::SessionMismatch {
                active: *active,
                attempted: target,
            }),
            Self::Idle | Self::Done(_) | Self::Error { .. } => {
                Err(StreamTransitionRejection::NoActiveStream)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use agentcanvas_llm::{StreamSessionId, ThreadEpoch};

    use super::*;

    fn target(session: u64) -> StreamTarget {
        StreamTarget::new(ThreadEpoch::new(1), StreamSessionId::new(session))
    }

    #[test]
    fn start_then_complete_walks_the_happy_path() {
        let state = StreamState::Idle.apply(StreamTransition::Start(target(1))).unwrap();
        assert!(state.accepts_stream_event(target(1)));
        assert!(!state.accepts_stream_event(target(2)));

        let state = state.apply(StreamTransition::Complete(target(1))).unwrap();
        assert_eq!(state, StreamState::Done(target(1)));
        assert!(!state.accepts_stream_event(target(1)));
    }

    #[test]
    fn second_start_with_different_session_is_rejected() {
        let state = StreamState::Idle.apply(StreamTransition::Start(target(1))).unwrap();
        let rejection = state.apply(StreamTransition::Start(target(2))).unwrap_err();
        assert!(matches!(
            rejection,
            StreamTransitionRejection::AlreadyStreaming { .. }
        ));
    }

    #[test]
    fn terminal_transitions_require_matching_sessions() {
        let state = StreamState::Idle.apply(StreamTransition::Start(target(1))).unwrap();

        let mismatch = state.apply(StreamTransition::Complete(target(9))).unwrap_err();
        assert!(matches!(
            mismatch,
            StreamTransitionRejection::SessionMismatch { .. }
        ));

        let idle_completion = StreamState::Idle.apply(StreamTransition::Complete(target(1)));
        assert_eq!(
            idle_completion.unwrap_err(),
            StreamTransitionRejection::NoActiveStream
        );
    }

    #[test]
    fn failure_keeps_the_offending_target_and_message() {
        let state = StreamState::Idle.apply(StreamTransition::Start(target(3))).unwrap();
        let state = state
            .apply(StreamTransition::Fail {
                target: target(3),
                message: "remote hiccup".to_string(),
            })
            .unwrap();

        assert_eq!(
            state,
            StreamState::Error {
                target: target(3),
                message: "remote hiccup".to_string(),
            }
        );
    }
}
