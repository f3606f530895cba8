use std::sync::Mutex;

use tokio::sync::mpsc;

use super::canvas::CanvasState;
use super::message::{Message, MessageId, ThreadId};

/// Coarse canvas descriptor for observers; document text travels separately
/// through `CanvasContentReplaced`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanvasPhase {
    Closed,
    Open,
    Minimized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanvasSnapshot {
    pub phase: CanvasPhase,
    pub anchor: Option<MessageId>,
}

impl CanvasSnapshot {
    pub fn of(state: &CanvasState) -> Self {
        let phase = match state {
            CanvasState::Closed => CanvasPhase::Closed,
            CanvasState::Open { .. } => CanvasPhase::Open,
            CanvasState::Minimized { .. } => CanvasPhase::Minimized,
        };
        Self {
            phase,
            anchor: state.anchor(),
        }
    }
}

/// Everything observers can learn about a session.
///
/// Content updates are full-state replaces, never deltas: consumers swap
/// their copy wholesale, which stays correct even if an update is delivered
/// after a re-render already painted the same prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ThreadStarted { thread_id: ThreadId },
    MessageAppended { message: Message },
    MessageContentReplaced { id: MessageId, content: String },
    MessageImageAttached { id: MessageId, url: String },
    MessageRemoved { id: MessageId },
    CanvasContentReplaced { content: String },
    CanvasStateChanged { snapshot: CanvasSnapshot },
    CanvasTitleChanged { title: String },
    LoadingChanged { loading: bool },
    ErrorBanner { message: String },
    QuotedTextSelected { text: String },
}

/// Explicit observer fan-out with typed payloads.
///
/// Subscribers that dropped their receiver are pruned on the next publish.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .push(tx);
        rx
    }

    pub fn publish(&self, event: SessionEvent) {
        let mut subscribers = self.subscribers.lock().expect("event bus lock poisoned");
        subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_reach_every_live_subscriber() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(SessionEvent::LoadingChanged { loading: true });

        assert_eq!(
            first.try_recv().unwrap(),
            SessionEvent::LoadingChanged { loading: true }
        );
        assert_eq!(
            second.try_recv().unwrap(),
            SessionEvent::LoadingChanged { loading: true }
        );
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let first = bus.subscribe();
        drop(first);
        let mut second = bus.subscribe();

        bus.publish(SessionEvent::QuotedTextSelected {
            text: "fn main".to_string(),
        });

        assert!(second.try_recv().is_ok());
        assert_eq!(bus.subscribers.lock().unwrap().len(), 1);
    }
}
