//! Single-owner output fan-out with scrollback replay.
//!
//! Every session has one [`SessionOutput`]: a scrollback buffer plus an
//! optional owner slot. Output is always buffered and, when an owner is bound,
//! forwarded live. Binding a new owner replays the buffer to it first, under
//! the same lock, so the owner sees a contiguous stream with no gap and no
//! duplicate. The previous owner is dropped silently.

use std::sync::{Mutex, MutexGuard};

use termhive_protocol::SessionEvent;
use tokio::sync::mpsc;

use super::buffer::ScrollbackBuffer;
use crate::error::SessionId;

/// Unique identifier for an observing client.
pub type ClientId = String;

/// A handle representing an observing client.
///
/// The channel is unbounded: terminal output must not be dropped, and the
/// scrollback budget already bounds what a reattaching client receives.
#[derive(Debug)]
pub struct ClientHandle {
    id: ClientId,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ClientHandle {
    /// Creates a new client handle and the receiver for its events.
    pub fn new(id: impl Into<ClientId>) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientHandle { id: id.into(), tx }, rx)
    }

    /// Returns the client ID.
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Sends an event; returns false when the client has gone away.
    fn send(&mut self, event: SessionEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!(client_id = %self.id, "Client channel closed");
                false
            }
        }
    }
}

struct OutputState {
    buffer: ScrollbackBuffer,
    owner: Option<ClientHandle>,
}

/// Scrollback buffer plus the single owner slot of one session.
pub struct SessionOutput {
    session_id: SessionId,
    state: Mutex<OutputState>,
}

impl SessionOutput {
    /// Creates the output state for a session with the given scrollback budget.
    pub fn new(session_id: impl Into<SessionId>, scrollback_bytes: usize) -> Self {
        Self {
            session_id: session_id.into(),
            state: Mutex::new(OutputState {
                buffer: ScrollbackBuffer::new(scrollback_bytes),
                owner: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, OutputState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Buffers a chunk and forwards it to the owner, if any.
    pub fn push(&self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        let mut state = self.state();
        state.buffer.push(chunk.clone());

        let delivered = match state.owner.as_mut() {
            Some(owner) => owner.send(SessionEvent::Data {
                session_id: self.session_id.clone(),
                data: chunk,
            }),
            None => true,
        };
        if !delivered {
            if let Some(gone) = state.owner.take() {
                tracing::debug!(
                    session_id = %self.session_id,
                    client_id = %gone.id(),
                    "Owner disconnected, unbinding"
                );
            }
        }
    }

    /// Makes `owner` the session's only observer.
    ///
    /// Buffered history is replayed to the new owner as one `History` event
    /// before any further live data. Returns the id of the displaced owner.
    pub fn bind(&self, mut owner: ClientHandle) -> Option<ClientId> {
        let mut state = self.state();

        if !state.buffer.is_empty() {
            owner.send(SessionEvent::History {
                session_id: self.session_id.clone(),
                data: state.buffer.concat(),
            });
        }

        let previous = state.owner.replace(owner).map(|h| h.id().clone());
        tracing::debug!(
            session_id = %self.session_id,
            previous = ?previous,
            buffered = state.buffer.total_bytes(),
            "Owner bound"
        );
        previous
    }

    /// Delivers the exit event to the owner, if any.
    pub fn notify_exit(&self, code: Option<u32>, signal: Option<String>, runtime_ms: u64) {
        let mut state = self.state();
        if let Some(owner) = state.owner.as_mut() {
            owner.send(SessionEvent::Exit {
                session_id: self.session_id.clone(),
                code,
                signal,
                runtime_ms,
            });
        }
    }

    /// Drops the history and the owner binding.
    pub fn clear(&self) {
        let mut state = self.state();
        state.buffer.clear();
        state.owner = None;
    }

    /// Current owner's id.
    pub fn owner_id(&self) -> Option<ClientId> {
        self.state().owner.as_ref().map(|h| h.id().clone())
    }

    /// Concatenated scrollback.
    pub fn history(&self) -> Vec<u8> {
        self.state().buffer.concat()
    }

    /// Bytes currently buffered.
    pub fn buffered_bytes(&self) -> usize {
        self.state().buffer.total_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn data(event: &SessionEvent) -> &[u8] {
        match event {
            SessionEvent::Data { data, .. } | SessionEvent::History { data, .. } => data.as_slice(),
            SessionEvent::Exit { .. } => &[],
        }
    }

    #[test]
    fn test_client_handle_creation() {
        let (handle, _rx) = ClientHandle::new("window-1");
        assert_eq!(handle.id(), "window-1");
    }

    #[test]
    fn test_output_without_owner_is_buffered() {
        let output = SessionOutput::new("ws-1", 1024);
        output.push(b"hello".to_vec());
        assert_eq!(output.history(), b"hello");
        assert!(output.owner_id().is_none());
    }

    #[test]
    fn test_bind_on_empty_buffer_sends_no_history() {
        let output = SessionOutput::new("ws-1", 1024);
        let (owner, mut rx) = ClientHandle::new("a");
        output.bind(owner);

        assert!(drain(&mut rx).is_empty());

        output.push(b"live".to_vec());
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SessionEvent::Data { .. }));
        assert_eq!(data(&events[0]), b"live");
    }

    #[test]
    fn test_replay_then_live_without_gap_or_duplicate() {
        let output = SessionOutput::new("ws-1", 1024);
        output.push(b"one ".to_vec());
        output.push(b"two ".to_vec());
        output.push(b"three ".to_vec());

        let (owner, mut rx) = ClientHandle::new("b");
        output.bind(owner);
        output.push(b"four".to_vec());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], SessionEvent::History { .. }));
        assert_eq!(data(&events[0]), b"one two three ");
        assert!(matches!(events[1], SessionEvent::Data { .. }));
        assert_eq!(data(&events[1]), b"four");

        let stream: Vec<u8> = events.iter().flat_map(|e| data(e).to_vec()).collect();
        assert_eq!(stream, b"one two three four");
    }

    #[test]
    fn test_last_binder_wins() {
        let output = SessionOutput::new("ws-1", 1024);
        let (first, mut first_rx) = ClientHandle::new("first");
        let (second, mut second_rx) = ClientHandle::new("second");

        assert_eq!(output.bind(first), None);
        output.push(b"early".to_vec());
        assert_eq!(output.bind(second), Some("first".to_string()));
        output.push(b"late".to_vec());

        let first_events = drain(&mut first_rx);
        assert_eq!(first_events.len(), 1);
        assert_eq!(data(&first_events[0]), b"early");

        let second_events = drain(&mut second_rx);
        assert_eq!(second_events.len(), 2);
        assert_eq!(data(&second_events[0]), b"early");
        assert_eq!(data(&second_events[1]), b"late");
        assert_eq!(output.owner_id().as_deref(), Some("second"));
    }

    #[test]
    fn test_history_replayed_once_per_attachment() {
        let output = SessionOutput::new("ws-1", 1024);
        output.push(b"prompt$ ".to_vec());

        let (owner, mut rx) = ClientHandle::new("c");
        output.bind(owner);
        output.push(b"ls\n".to_vec());
        output.push(b"file\n".to_vec());

        let histories = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::History { .. }))
            .count();
        assert_eq!(histories, 1);
    }

    #[test]
    fn test_replay_is_front_truncated_by_budget() {
        let output = SessionOutput::new("ws-1", 10);
        output.push(b"aaaaaa".to_vec());
        output.push(b"bbbbbb".to_vec());

        let (owner, mut rx) = ClientHandle::new("d");
        output.bind(owner);
        let events = drain(&mut rx);
        assert_eq!(data(&events[0]), b"bbbbbb");
    }

    #[test]
    fn test_disconnected_owner_is_unbound() {
        let output = SessionOutput::new("ws-1", 1024);
        let (owner, rx) = ClientHandle::new("gone");
        output.bind(owner);
        drop(rx);

        output.push(b"data".to_vec());
        assert!(output.owner_id().is_none());
        assert_eq!(output.history(), b"data");
    }

    #[test]
    fn test_notify_exit() {
        let output = SessionOutput::new("ws-1", 1024);
        let (owner, mut rx) = ClientHandle::new("e");
        output.bind(owner);
        output.notify_exit(Some(3), None, 42);

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![SessionEvent::Exit {
                session_id: "ws-1".to_string(),
                code: Some(3),
                signal: None,
                runtime_ms: 42,
            }]
        );
    }

    #[test]
    fn test_replay_then_live_is_contiguous() {
        let output = SessionOutput::new("ws-1", 1024);
        output.push(b"12345".to_vec());
        let (owner, mut rx) = ClientHandle::new("f");
        output.bind(owner);
        output.push(b"678".to_vec());

        let mut received = Vec::new();
        while let Ok(event) = rx.try_recv() {
            received.extend_from_slice(data(&event));
        }
        assert_eq!(received, b"12345678");
    }

    #[test]
    fn test_clear_drops_owner_and_history() {
        let output = SessionOutput::new("ws-1", 1024);
        let (owner, _rx) = ClientHandle::new("g");
        output.bind(owner);
        output.push(b"x".to_vec());
        output.clear();

        assert!(output.owner_id().is_none());
        assert_eq!(output.buffered_bytes(), 0);
        assert!(output.history().is_empty());
    }
}
