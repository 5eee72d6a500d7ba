//! FIFO buffer between `send` calls and the socket.
//!
//! Serialized lines wait here whenever the transport is not drain-ready;
//! [`SendQueue::drain`] writes them front-to-back and an entry is only
//! popped once its bytes are fully accepted, so order survives partial
//! drains and write errors.

use std::collections::VecDeque;
use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

pub(crate) struct PendingLine {
    pub id: String,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
pub(crate) struct SendQueue {
    pending: VecDeque<PendingLine>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: String, bytes: Vec<u8>) {
        self.pending.push_back(PendingLine { id, bytes });
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Discard everything; returns how many sends were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// Write queued lines in FIFO order until the queue is empty, awaiting
    /// the transport whenever its buffer is full. Returns the ids written.
    pub async fn drain<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> io::Result<Vec<String>> {
        let mut written = Vec::with_capacity(self.pending.len());
        while !self.pending.is_empty() {
            writer.write_all(&self.pending[0].bytes).await?;
            if let Some(line) = self.pending.pop_front() {
                written.push(line.id);
            }
        }
        writer.flush().await?;
        Ok(written)
    }
}
