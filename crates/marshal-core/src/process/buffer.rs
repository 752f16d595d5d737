//! Bounded output buffers for background sessions.
//!
//! Two trim directions are used on purpose:
//! - [`HeadBuffer`] keeps the first bytes a process wrote and stops growing
//!   once full (the historical record).
//! - [`TailBuffer`] keeps the most recent bytes and drops the oldest ones
//!   (previews and "what's new since the last poll").

/// Append-only buffer that keeps the head of the stream.
#[derive(Debug, Clone)]
pub struct HeadBuffer {
    data: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl HeadBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            truncated: false,
        }
    }

    /// Append as much of `chunk` as fits. Anything past the cap is discarded
    /// and the buffer is flagged truncated.
    pub fn append(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        let take = chunk.len().min(room);
        self.data.extend_from_slice(&chunk[..take]);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.data.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[cfg(test)]
    fn cap(&self) -> usize {
        self.cap
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

/// Sliding window over the most recent bytes of a stream.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    data: Vec<u8>,
    cap: usize,
    dropped: u64,
}

impl TailBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            dropped: 0,
        }
    }

    /// Append `chunk`, evicting the oldest bytes when the cap is exceeded.
    pub fn append(&mut self, chunk: &[u8]) {
        if self.cap == 0 {
            self.dropped += chunk.len() as u64;
            return;
        }
        if chunk.len() >= self.cap {
            self.dropped += (self.data.len() + chunk.len() - self.cap) as u64;
            self.data.clear();
            self.data.extend_from_slice(&chunk[chunk.len() - self.cap..]);
            return;
        }
        self.data.extend_from_slice(chunk);
        if self.data.len() > self.cap {
            let excess = self.data.len() - self.cap;
            self.data.drain(..excess);
            self.dropped += excess as u64;
        }
    }

    /// Return the buffered bytes and leave the buffer empty. The eviction
    /// counter starts over.
    pub fn take(&mut self) -> Vec<u8> {
        self.dropped = 0;
        std::mem::take(&mut self.data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.data.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[cfg(test)]
    fn cap(&self) -> usize {
        self.cap
    }

    /// Bytes evicted since creation or the last [`take`](Self::take).
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
