//! Per-flow bookkeeping.

use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use sluice_core::{NetRequest, Session, StatusEvent};

use crate::task::Task;

/// Aggregate state of one logical flow.
///
/// The context is owned by the task driving the connection. The sockets
/// travel with the connection state and are owned by whichever stage is
/// running, so a stage that returns early drops, and thereby closes, both.
/// Orderly shutdown of a connected pair goes through
/// [`close_linked`](Self::close_linked). Whichever way the flow ends, the
/// session is marked ended and persisted exactly once: explicitly through
/// [`finish`](Self::finish), or on drop with a note when the flow was
/// aborted.
#[derive(Debug)]
pub struct ConnectionContext {
    task: Arc<Task>,
    request: Option<NetRequest>,
    session: Session,
    finished: bool,
}

impl ConnectionContext {
    pub fn new(task: Arc<Task>) -> Self {
        Self {
            task,
            request: None,
            session: Session::new(),
            finished: false,
        }
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn request(&self) -> Option<&NetRequest> {
        self.request.as_ref()
    }

    /// Sets the origin of this flow. Only the first call has an effect.
    pub fn set_request(&mut self, request: NetRequest) -> bool {
        if self.request.is_some() {
            return false;
        }
        self.session.host = request.host().to_string();
        self.session.is_tls = request.is_tls();
        self.request = Some(request);
        true
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Queues the current session snapshot for persistence.
    pub fn persist(&self) {
        self.task.recorder().record(&self.session);
    }

    /// Counts body bytes sent to the origin.
    pub fn add_upload(&mut self, n: u64) {
        self.session.upload_bytes += n;
        self.task.counters().add_upload(n);
    }

    /// Counts body bytes received from the origin.
    pub fn add_download(&mut self, n: u64) {
        self.session.download_bytes += n;
        self.task.counters().add_download(n);
    }

    /// Records why the flow stopped early.
    pub fn fail(&mut self, note: impl AsRef<str>) {
        let note = note.as_ref();
        tracing::debug!(session = %self.session.id, host = %self.session.host, "{}", note);
        self.session.add_note(note);
    }

    /// Closes the upstream side, then the downstream side, and stamps the
    /// session end. Shutdown errors mean the peer is already gone.
    pub async fn close_linked<D, U>(&mut self, downstream: &mut D, upstream: &mut U)
    where
        D: AsyncWrite + Unpin + ?Sized,
        U: AsyncWrite + Unpin + ?Sized,
    {
        if let Err(e) = upstream.shutdown().await {
            tracing::trace!(session = %self.session.id, "upstream shutdown: {}", e);
        }
        if let Err(e) = downstream.shutdown().await {
            tracing::trace!(session = %self.session.id, "downstream shutdown: {}", e);
        }
        self.session.mark_end();
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Ends the flow: stamps `end_time`, persists and announces the totals.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.session.mark_end();
        self.persist();

        if !self.session.ignore {
            self.task.notifier().notify(StatusEvent::Traffic {
                session_id: self.session.id.clone(),
                host: self.session.host.clone(),
                upload_bytes: self.session.upload_bytes,
                download_bytes: self.session.download_bytes,
            });
        }
    }
}

impl Drop for ConnectionContext {
    fn drop(&mut self) {
        if !self.finished {
            self.session.add_note("connection aborted");
            self.finish();
        }
    }
}
