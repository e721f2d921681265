//! Fan-out from session output to every live viewer.
//!
//! The session manager's output drain publishes here synchronously; the
//! broadcaster forwards each event to every registered viewer's unbounded
//! scheduler channel and never blocks. A slow viewer's backpressure is
//! absorbed by its own bounded frame queue (drop-oldest), not by the drain.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

/// Output bytes for one session, stamped with its current dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
    pub data: Bytes,
}

/// What a viewer's scheduler receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerEvent {
    /// Live output in arrival order.
    Output(OutputEvent),
    /// The session's backing link was re-established: clear the viewer's
    /// terminal for this session and repaint from the snapshot.
    Replay {
        session_id: String,
        cols: u16,
        rows: u16,
        snapshot: Bytes,
    },
    /// Session appeared (`created`) or went away.
    SessionState { session_id: String, created: bool },
}

/// Registry of live viewers and the fan-out over them.
#[derive(Default)]
pub struct MuxBroadcaster {
    viewers: RwLock<HashMap<String, mpsc::UnboundedSender<ViewerEvent>>>,
}

impl MuxBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a viewer's scheduler channel under its viewer id.
    pub fn register(&self, viewer_id: impl Into<String>, tx: mpsc::UnboundedSender<ViewerEvent>) {
        self.viewers.write().insert(viewer_id.into(), tx);
    }

    /// Remove a viewer. Safe to call while a fan-out is in flight.
    pub fn unregister(&self, viewer_id: &str) {
        self.viewers.write().remove(viewer_id);
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.read().len()
    }

    /// Forward session output to every viewer.
    pub fn publish_output(&self, event: OutputEvent) {
        self.fanout(ViewerEvent::Output(event));
    }

    /// Forward a post-reconnect snapshot to every viewer.
    pub fn publish_replay(&self, session_id: &str, cols: u16, rows: u16, snapshot: Bytes) {
        self.fanout(ViewerEvent::Replay {
            session_id: session_id.to_string(),
            cols,
            rows,
            snapshot,
        });
    }

    /// Tell every viewer a session was created or destroyed.
    pub fn publish_session_state(&self, session_id: &str, created: bool) {
        self.fanout(ViewerEvent::SessionState {
            session_id: session_id.to_string(),
            created,
        });
    }

    fn fanout(&self, event: ViewerEvent) {
        // Snapshot the sender list so viewer registration/removal never
        // contends with the sends themselves.
        let targets: Vec<(String, mpsc::UnboundedSender<ViewerEvent>)> = self
            .viewers
            .read()
            .iter()
            .map(|(id, tx)| (id.clone(), tx.clone()))
            .collect();

        let mut dead: Vec<String> = Vec::new();
        for (viewer_id, tx) in targets {
            if tx.send(event.clone()).is_err() {
                dead.push(viewer_id);
            }
        }
        if !dead.is_empty() {
            let mut viewers = self.viewers.write();
            for id in dead {
                debug!(viewer = %id, "dropping viewer with closed channel");
                viewers.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(session_id: &str, data: &'static [u8]) -> OutputEvent {
        OutputEvent {
            session_id: session_id.to_string(),
            cols: 80,
            rows: 24,
            data: Bytes::from_static(data),
        }
    }

    #[tokio::test]
    async fn fanout_reaches_all_viewers() {
        let b = MuxBroadcaster::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        b.register("v1", tx1);
        b.register("v2", tx2);

        b.publish_output(output("abcd1234", b"hello"));

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                ViewerEvent::Output(ev) => {
                    assert_eq!(ev.session_id, "abcd1234");
                    assert_eq!(ev.data, Bytes::from_static(b"hello"));
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn per_session_order_is_preserved() {
        let b = MuxBroadcaster::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.register("v1", tx);

        for chunk in [&b"one"[..], b"two", b"three"] {
            b.publish_output(OutputEvent {
                session_id: "abcd1234".into(),
                cols: 80,
                rows: 24,
                data: Bytes::copy_from_slice(chunk),
            });
        }

        let mut got = Vec::new();
        for _ in 0..3 {
            if let ViewerEvent::Output(ev) = rx.recv().await.unwrap() {
                got.push(ev.data);
            }
        }
        assert_eq!(got, vec![
            Bytes::from_static(b"one"),
            Bytes::from_static(b"two"),
            Bytes::from_static(b"three"),
        ]);
    }

    #[tokio::test]
    async fn closed_viewer_is_pruned() {
        let b = MuxBroadcaster::new();
        let (tx, rx) = mpsc::unbounded_channel();
        b.register("gone", tx);
        drop(rx);

        b.publish_output(output("abcd1234", b"x"));
        assert_eq!(b.viewer_count(), 0);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let b = MuxBroadcaster::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        b.register("v1", tx);
        assert_eq!(b.viewer_count(), 1);
        b.unregister("v1");
        b.unregister("v1");
        assert_eq!(b.viewer_count(), 0);
    }

    #[tokio::test]
    async fn session_state_events() {
        let b = MuxBroadcaster::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.register("v1", tx);

        b.publish_session_state("abcd1234", true);
        b.publish_session_state("abcd1234", false);

        assert_eq!(
            rx.recv().await.unwrap(),
            ViewerEvent::SessionState {
                session_id: "abcd1234".into(),
                created: true
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            ViewerEvent::SessionState {
                session_id: "abcd1234".into(),
                created: false
            }
        );
    }

    #[tokio::test]
    async fn replay_event_carries_snapshot() {
        let b = MuxBroadcaster::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.register("v1", tx);

        b.publish_replay("abcd1234", 100, 30, Bytes::from_static(b"screen"));
        match rx.recv().await.unwrap() {
            ViewerEvent::Replay {
                session_id,
                cols,
                rows,
                snapshot,
            } => {
                assert_eq!(session_id, "abcd1234");
                assert_eq!((cols, rows), (100, 30));
                assert_eq!(snapshot, Bytes::from_static(b"screen"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
