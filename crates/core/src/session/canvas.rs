use super::message::MessageId;

/// Canvas lifecycle: closed, open for a message, or minimized to an
/// affordance anchored at the originating message.
///
/// Minimized keeps the last known content so restoring reproduces exactly
/// what the user closed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CanvasState {
    #[default]
    Closed,
    Open {
        message_id: MessageId,
        content: String,
    },
    Minimized {
        message_id: MessageId,
        content: String,
    },
}

/// State transition input for the canvas lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanvasTransition {
    /// Open for a message, replacing whatever was showing. Switching between
    /// messages is a direct replace; there is no close-reopen gap.
    OpenFor {
        message_id: MessageId,
        content: String,
    },
    /// Toggle from the message header: same anchor closes, a different
    /// anchor opens for it.
    ToggleFor {
        message_id: MessageId,
        content: String,
    },
    /// The canvas close affordance: demotes to minimized, keeping content.
    Close,
    /// Restores a minimized canvas with its last known content.
    Restore,
    /// Replaces content in place (user save or streaming append).
    Replace(String),
    /// New thread: discard everything.
    Reset,
}

/// Rejection reason for illegal canvas transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanvasTransitionRejection {
    NotOpen,
    NothingMinimized,
}

pub type CanvasTransitionResult = Result<CanvasState, CanvasTransitionRejection>;

impl CanvasState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// The message the canvas is anchored to, in any non-closed state.
    pub fn anchor(&self) -> Option<MessageId> {
        match self {
            Self::Closed => None,
            Self::Open { message_id, .. } | Self::Minimized { message_id, .. } => Some(*message_id),
        }
    }

    /// Current document text, whether showing or minimized.
    pub fn content(&self) -> Option<&str> {
        match self {
            Self::Closed => None,
            Self::Open { content, .. } | Self::Minimized { content, .. } => Some(content.as_str()),
        }
    }

    /// Applies one transition deterministically.
    pub fn apply(&self, transition: CanvasTransition) -> CanvasTransitionResult {
        match transition {
            CanvasTransition::OpenFor {
                message_id,
                content,
            } => Ok(Self::Open {
                message_id,
                content,
            }),
            CanvasTransition::ToggleFor {
                message_id,
                content,
            } => Ok(self.apply_toggle(message_id, content)),
            CanvasTransition::Close => self.apply_close(),
            CanvasTransition::Restore => self.apply_restore(),
            CanvasTransition::Replace(content) => self.apply_replace(content),
            CanvasTransition::Reset => Ok(Self::Closed),
        }
    }

    fn apply_toggle(&self, message_id: MessageId, content: String) -> CanvasState {
        match self {
            Self::Open {
                message_id: current,
                ..
            } if *current == message_id => Self::Closed,
            _ => Self::Open {
                message_id,
                content,
            },
        }
    }

    fn apply_close(&self) -> CanvasTransitionResult {
        match self {
            Self::Open {
                message_id,
                content,
            } => Ok(Self::Minimized {
                message_id: *message_id,
                content: content.clone(),
            }),
            Self::Closed | Self::Minimized { .. } => Err(CanvasTransitionRejection::NotOpen),
        }
    }

    fn apply_restore(&self) -> CanvasTransitionResult {
        match self {
            Self::Minimized {
                message_id,
                content,
            } => Ok(Self::Open {
                message_id: *message_id,
                content: content.clone(),
            }),
            Self::Closed | Self::Open { .. } => Err(CanvasTransitionRejection::NothingMinimized),
        }
    }

    fn apply_replace(&self, content: String) -> CanvasTransitionResult {
        match self {
            Self::Open { message_id, .. } => Ok(Self::Open {
                message_id: *message_id,
                content,
            }),
            Self::Closed | Self::Minimized { .. } => Err(CanvasTransitionRejection::NotOpen),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> MessageId {
        MessageId::new(raw)
    }

    #[test]
    fn open_close_restore_preserves_content() {
        let open = CanvasState::Closed
            .apply(CanvasTransition::OpenFor {
                message_id: id(1),
                content: "x".to_string(),
            })
            .unwrap();
        assert_eq!(open.content(), Some("x"));

        let minimized = open.apply(CanvasTransition::Close).unwrap();
        assert_eq!(
            minimized,
            CanvasState::Minimized {
                message_id: id(1),
                content: "x".to_string(),
            }
        );

        let restored = minimized.apply(CanvasTransition::Restore).unwrap();
        assert_eq!(
            restored,
            CanvasState::Open {
                message_id: id(1),
                content: "x".to_string(),
            }
        );
    }

    #[test]
    fn toggling_the_same_anchor_closes() {
        let open = CanvasState::Closed
            .apply(CanvasTransition::OpenFor {
                message_id: id(1),
                content: "a".to_string(),
            })
            .unwrap();

        let closed = open
            .apply(CanvasTransition::ToggleFor {
                message_id: id(1),
                content: "a".to_string(),
            })
            .unwrap();
        assert_eq!(closed, CanvasState::Closed);
    }

    #[test]
    fn toggling_a_different_anchor_replaces_in_place() {
        let open = CanvasState::Closed
            .apply(CanvasTransition::OpenFor {
                message_id: id(1),
                content: "first".to_string(),
            })
            .unwrap();

        let switched = open
            .apply(CanvasTransition::ToggleFor {
                message_id: id(2),
                content: "second".to_string(),
            })
            .unwrap();
        assert_eq!(switched.anchor(), Some(id(2)));
        assert_eq!(switched.content(), Some("second"));
    }

    #[test]
    fn replace_requires_an_open_canvas() {
        let rejection = CanvasState::Closed
            .apply(CanvasTransition::Replace("y".to_string()))
            .unwrap_err();
        assert_eq!(rejection, CanvasTransitionRejection::NotOpen);

        let minimized = CanvasState::Minimized {
            message_id: id(3),
            content: "kept".to_string(),
        };
        assert_eq!(
            minimized
                .apply(CanvasTransition::Replace("y".to_string()))
                .unwrap_err(),
            CanvasTransitionRejection::NotOpen
        );
    }

    #[test]
    fn reset_discards_any_state() {
        let minimized = CanvasState::Minimized {
            message_id: id(4),
            content: "gone".to_string(),
        };
        assert_eq!(
            minimized.apply(CanvasTransition::Reset).unwrap(),
            CanvasState::Closed
        );
    }
}
