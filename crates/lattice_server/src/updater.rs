//! Per-session delivery endpoint.
//!
//! Each session owns two bounded channels, visibility and chat. A full
//! channel means the client stopped draining; the sender is dropped on
//! the spot, cutting that session rather than back-pressuring the tick.
//! Vision and chat deregister the endpoint once they see it closed.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::warn;

use lattice_component::Entity;
use lattice_systems::{ChatListener, ChatMessage, LookItem, VisionUpdater};

/// One visibility delta frame.
#[derive(Debug, Clone, PartialEq)]
pub enum VisionFrame {
    /// An entity is (still) visible with this render state.
    Add { tick: i64, item: LookItem },
    /// An entity left the window.
    Remove { tick: i64, id: Entity },
}

/// One delivered chat line.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatFrame {
    pub from: String,
    pub text: String,
}

/// The two bounded outbound channels of a session.
pub struct SessionUpdater {
    vision_tx: Mutex<Option<mpsc::Sender<VisionFrame>>>,
    vision_rx: Mutex<Option<mpsc::Receiver<VisionFrame>>>,
    chat_tx: Mutex<Option<mpsc::Sender<ChatFrame>>>,
    chat_rx: Mutex<Option<mpsc::Receiver<ChatFrame>>>,
}

fn lock<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn push<T>(slot: &Mutex<Option<mpsc::Sender<T>>>, frame: T, stream: &str) {
    let mut guard = lock(slot);
    let Some(sender) = guard.as_ref() else {
        return;
    };
    match sender.try_send(frame) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(stream, "channel full; dropping slow session");
            *guard = None;
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            *guard = None;
        }
    }
}

impl SessionUpdater {
    /// Create an endpoint whose channels each hold `buffer` frames.
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        let (vision_tx, vision_rx) = mpsc::channel(buffer);
        let (chat_tx, chat_rx) = mpsc::channel(buffer);
        Self {
            vision_tx: Mutex::new(Some(vision_tx)),
            vision_rx: Mutex::new(Some(vision_rx)),
            chat_tx: Mutex::new(Some(chat_tx)),
            chat_rx: Mutex::new(Some(chat_rx)),
        }
    }

    /// Take the visibility stream. `None` after the first take.
    pub fn take_vision_stream(&self) -> Option<mpsc::Receiver<VisionFrame>> {
        lock(&self.vision_rx).take()
    }

    /// Take the chat stream. `None` after the first take.
    pub fn take_chat_stream(&self) -> Option<mpsc::Receiver<ChatFrame>> {
        lock(&self.chat_rx).take()
    }
}

impl VisionUpdater for SessionUpdater {
    fn visibility_update(&self, item: LookItem, tick: i64) {
        push(&self.vision_tx, VisionFrame::Add { tick, item }, "vision");
    }

    fn visibility_lost(&self, entity: Entity, tick: i64) {
        push(
            &self.vision_tx,
            VisionFrame::Remove { tick, id: entity },
            "vision",
        );
    }

    fn is_closed(&self) -> bool {
        lock(&self.vision_tx).is_none()
    }
}

impl ChatListener for SessionUpdater {
    fn chat_message(&self, message: &ChatMessage) {
        push(
            &self.chat_tx,
            ChatFrame {
                from: message.from_name.clone(),
                text: message.text.clone(),
            },
            "chat",
        );
    }

    fn is_closed(&self) -> bool {
        lock(&self.chat_tx).is_none()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn item(id: u64) -> LookItem {
        LookItem {
            id: Entity::from_raw(id),
            x: 0,
            y: 0,
            vel_x: 0,
            vel_y: 0,
            ch: "@".to_string(),
            color: 0,
        }
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let updater = SessionUpdater::new(8);
        let mut stream = updater.take_vision_stream().unwrap();

        updater.visibility_update(item(1), 5);
        updater.visibility_lost(Entity::from_raw(2), 6);

        assert_eq!(
            stream.recv().await.unwrap(),
            VisionFrame::Add { tick: 5, item: item(1) }
        );
        assert_eq!(
            stream.recv().await.unwrap(),
            VisionFrame::Remove {
                tick: 6,
                id: Entity::from_raw(2)
            }
        );
    }

    #[tokio::test]
    async fn test_stream_can_only_be_taken_once() {
        let updater = SessionUpdater::new(8);
        assert!(updater.take_vision_stream().is_some());
        assert!(updater.take_vision_stream().is_none());
    }

    #[tokio::test]
    async fn test_full_channel_drops_the_session() {
        let updater = Arc::new(SessionUpdater::new(2));
        let _stream = updater.take_vision_stream().unwrap();

        for n in 0..3 {
            updater.visibility_update(item(n), 1);
        }

        assert!(VisionUpdater::is_closed(updater.as_ref()));
        // Chat is unaffected.
        assert!(!ChatListener::is_closed(updater.as_ref()));
    }

    #[tokio::test]
    async fn test_chat_frames_carry_sender_name() {
        let updater = SessionUpdater::new(4);
        let mut stream = updater.take_chat_stream().unwrap();

        updater.chat_message(&ChatMessage {
            from: Entity::from_raw(9),
            from_name: "alice".to_string(),
            text: "hi".to_string(),
        });

        let frame = stream.recv().await.unwrap();
        assert_eq!(frame.from, "alice");
        assert_eq!(frame.text, "hi");
    }
}
