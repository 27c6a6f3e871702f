//! Frames held back until the upstream connection is ready.

use std::collections::VecDeque;

/// Ordered queue of frames that arrived before the outbound side could take
/// them.
///
/// [`drain`](Self::drain) consumes the queue, so buffered frames are flushed
/// exactly once and always ahead of anything read afterwards.
#[derive(Debug)]
pub struct PendingFrames<T> {
    frames: VecDeque<T>,
}

impl<T> Default for PendingFrames<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingFrames<T> {
    pub fn new() -> Self {
        Self {
            frames: VecDeque::new(),
        }
    }

    pub fn push(&mut self, frame: T) {
        self.frames.push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Yields the buffered frames in arrival order.
    pub fn drain(self) -> std::collections::vec_deque::IntoIter<T> {
        self.frames.into_iter()
    }
}
