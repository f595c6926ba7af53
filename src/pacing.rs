//! Reveal pacing
//!
//! Received text is not handed to the consumer as it arrives. It is queued in
//! a [`RevealBuffer`] and the [`PacingEmitter`] releases a slice from the head
//! on every tick, sized relative to what is still queued, so long answers
//! decelerate smoothly instead of appearing in one piece.

/// Characters released per tick: `max(1, round(pending / divisor))`.
pub fn reveal_count(pending_chars: usize, divisor: usize) -> usize {
    let divisor = divisor.max(1);
    // Integer form of round-half-up for non-negative values.
    ((2 * pending_chars + divisor) / (2 * divisor)).max(1)
}

/// Shown text plus the queue of text not yet shown.
///
/// `shown() + pending()` always equals everything pushed so far; the queue
/// only grows at the tail and shrinks at the head.
#[derive(Debug, Default, Clone)]
pub struct RevealBuffer {
    shown: String,
    pending: String,
    pending_chars: usize,
}

impl RevealBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, text: &str) {
        self.pending.push_str(text);
        self.pending_chars += text.chars().count();
    }

    /// Move up to `chars` characters from the head of the queue into the
    /// shown text and return them.
    pub fn release(&mut self, chars: usize) -> String {
        if chars >= self.pending_chars {
            return self.flush();
        }
        let split = self
            .pending
            .char_indices()
            .nth(chars)
            .map(|(idx, _)| idx)
            .unwrap_or(self.pending.len());
        let rest = self.pending.split_off(split);
        let chunk = std::mem::replace(&mut self.pending, rest);
        self.pending_chars -= chars;
        self.shown.push_str(&chunk);
        chunk
    }

    /// Move everything queued into the shown text.
    pub fn flush(&mut self) -> String {
        let chunk = std::mem::take(&mut self.pending);
        self.pending_chars = 0;
        self.shown.push_str(&chunk);
        chunk
    }

    pub fn shown(&self) -> &str {
        &self.shown
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }

    pub fn pending_chars(&self) -> usize {
        self.pending_chars
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Shown plus unrevealed text.
    pub fn transcript(&self) -> String {
        let mut full = String::with_capacity(self.shown.len() + self.pending.len());
        full.push_str(&self.shown);
        full.push_str(&self.pending);
        full
    }

    pub fn is_empty(&self) -> bool {
        self.shown.is_empty() && self.pending.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum EmitterState {
    #[default]
    Idle,
    Running,
    Stopped,
}

/// Outcome of one emitter tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// Nothing to reveal, or the emitter is not running.
    Idle,
    /// A chunk moved from the queue into the shown text.
    Revealed(String),
    /// The session ended: the queue was flushed and the emitter stopped.
    Drained {
        flushed: String,
        /// No text was ever shown; the consumer gets an error, not an answer.
        empty: bool,
    },
}

/// Self-rescheduling reveal loop state. The caller supplies the cadence.
#[derive(Debug, Clone)]
pub struct PacingEmitter {
    divisor: usize,
    state: EmitterState,
}

impl PacingEmitter {
    pub fn new(divisor: usize) -> Self {
        Self {
            divisor: divisor.max(1),
            state: EmitterState::Idle,
        }
    }

    /// Start on first buffer activity. Returns `false` if it was already
    /// started (or stopped) for this session.
    pub fn start(&mut self) -> bool {
        if self.state == EmitterState::Idle {
            self.state = EmitterState::Running;
            true
        } else {
            false
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == EmitterState::Running
    }

    pub fn is_stopped(&self) -> bool {
        self.state == EmitterState::Stopped
    }

    pub fn tick(&mut self, buffer: &mut RevealBuffer, session_done: bool) -> Tick {
        if session_done {
            return self.stop(buffer);
        }
        if self.state != EmitterState::Running || !buffer.has_pending() {
            return Tick::Idle;
        }
        let count = reveal_count(buffer.pending_chars(), self.divisor);
        Tick::Revealed(buffer.release(count))
    }

    /// Flush whatever is queued and stop rescheduling. Idempotent: a second
    /// call flushes nothing and reports the same emptiness.
    pub fn stop(&mut self, buffer: &mut RevealBuffer) -> Tick {
        self.state = EmitterState::Stopped;
        let flushed = buffer.flush();
        Tick::Drained {
            flushed,
            empty: buffer.shown().is_empty(),
        }
    }
}
