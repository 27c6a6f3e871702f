//! Body capture files.
//!
//! Request and response bodies of recorded exchanges are appended to
//! `<session-id>.req` and `<session-id>.rsp` in the capture directory. Files
//! are only created once the first body byte arrives. Write failures are
//! logged and disable further capture for that body; they never affect the
//! relay.

use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

use sluice_core::Session;

/// Chunks above this size are logged.
pub const LARGE_CHUNK: usize = 1024 * 1024;

/// Lazily-created append-only file for one body.
#[derive(Debug)]
pub struct BodyCapture {
    path: PathBuf,
    file: Option<File>,
    written: u64,
    failed: bool,
}

impl BodyCapture {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            written: 0,
            failed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Appends one chunk, creating the file on first use.
    pub async fn write(&mut self, chunk: &[u8]) {
        if self.failed || chunk.is_empty() {
            return;
        }
        if chunk.len() > LARGE_CHUNK {
            tracing::info!(path = ?self.path, len = chunk.len(), "large body chunk");
        }
        if let Err(e) = self.append(chunk).await {
            tracing::warn!(path = ?self.path, "body capture failed: {}", e);
            self.failed = true;
            self.file = None;
        }
    }

    async fn append(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            self.file = Some(file);
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(chunk).await?;
        }
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Flushes and closes the file, if one was opened.
    pub async fn finish(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush().await {
                tracing::warn!(path = ?self.path, "body capture flush failed: {}", e);
            }
        }
    }
}

/// The request and response capture files of one session.
#[derive(Debug)]
pub struct ExchangeCapture {
    pub request: BodyCapture,
    pub response: BodyCapture,
}

impl ExchangeCapture {
    pub fn new(dir: &Path, session: &Session) -> Self {
        Self {
            request: BodyCapture::new(dir.join(session.request_body_file())),
            response: BodyCapture::new(dir.join(session.response_body_file())),
        }
    }

    /// Capture for `session`, or `None` when capture is off or the session
    /// is ignored.
    pub fn for_session(dir: Option<&Path>, session: &Session) -> Option<Self> {
        match dir {
            Some(dir) if !session.ignore => Some(Self::new(dir, session)),
            _ => None,
        }
    }

    pub async fn finish(&mut self) {
        self.request.finish().await;
        self.response.finish().await;
    }
}
