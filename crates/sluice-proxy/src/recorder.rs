//! Session persistence off the I/O path.
//!
//! Snapshots are queued to a dedicated thread that calls the blocking
//! [`SessionStore`]. Store failures are logged and otherwise ignored.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use sluice_core::{Session, SessionStore};

enum Command {
    Save(Box<Session>),
    Flush(oneshot::Sender<()>),
}

/// Handle for queueing session snapshots.
#[derive(Clone)]
pub struct SessionRecorder {
    tx: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for SessionRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecorder")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl SessionRecorder {
    /// Starts the writer thread. It exits once every handle is dropped.
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();

        let spawned = std::thread::Builder::new()
            .name("sluice-recorder".into())
            .spawn(move || {
                while let Some(command) = rx.blocking_recv() {
                    match command {
                        Command::Save(session) => {
                            if let Err(e) = store.save(&session) {
                                tracing::warn!(session = %session.id, "failed to save session: {}", e);
                            }
                        }
                        Command::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            });
        if let Err(e) = spawned {
            tracing::error!("failed to start session recorder: {}", e);
        }

        Self { tx }
    }

    /// Queues a snapshot. Ignored sessions are never persisted.
    pub fn record(&self, session: &Session) {
        if session.ignore {
            return;
        }
        let _ = self.tx.send(Command::Save(Box::new(session.clone())));
    }

    /// Waits until everything queued so far has reached the store.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::MemoryStore;

    #[tokio::test]
    async fn snapshots_are_upserted() {
        let store = Arc::new(MemoryStore::new());
        let recorder = SessionRecorder::new(store.clone());

        let mut session = Session::new();
        recorder.record(&session);
        session.state = 200;
        recorder.record(&session);
        recorder.flush().await;

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&session.id).unwrap().state, 200);
    }

    #[tokio::test]
    async fn ignored_sessions_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let recorder = SessionRecorder::new(store.clone());

        let mut session = Session::new();
        session.ignore = true;
        recorder.record(&session);
        recorder.flush().await;

        assert!(store.is_empty());
    }
}
