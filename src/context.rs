use tracing::debug;

/// Identifier of one logical burst of messages
pub type SessionId = u32;

/// Mutable state shared by every component of one verification run
///
/// Holds the session counter and the pending-flush flag. Both are owned
/// here instead of living in globals so that independent runs never
/// observe each other.
#[derive(Debug, Default)]
pub struct RunContext {
    /// Next session identifier to hand out
    next_session: SessionId,
    /// Whether a stream was sent since the last flush
    pending_flush: bool,
}

impl RunContext {
    /// Creates a fresh run context with the session counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the identifier the next stream will be tagged with
    pub fn peek_session(&self) -> SessionId {
        self.next_session
    }

    /// Hands out the identifier for a new stream and advances the counter
    ///
    /// An identifier is consumed even if the stream later fails part way.
    ///
    /// # Returns
    /// * `SessionId` - The identifier allocated to the stream
    pub fn allocate_session(&mut self) -> SessionId {
        let session = self.next_session;
        self.next_session += 1;
        debug!("allocated session {}", session);
        session
    }

    /// Records that messages were sent and a flush is required before checking
    pub fn mark_sent(&mut self) {
        self.pending_flush = true;
    }

    pub fn needs_flush(&self) -> bool {
        self.pending_flush
    }

    pub fn clear_flush(&mut self) {
        self.pending_flush = false;
    }
}
