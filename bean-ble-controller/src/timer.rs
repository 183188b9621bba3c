//! The one timer each upload state machine owns

/// Identifies one arming of a [`TimerSlot`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

/// Holds at most one armed timer. Arming again or cancelling invalidates the
/// previous token, so an expiry that was already in flight is ignored.
#[derive(Debug, Default)]
pub struct TimerSlot {
    generation: u64,
    armed: Option<TimerToken>,
}

impl TimerSlot {
    pub fn arm(&mut self) -> TimerToken {
        self.generation += 1;
        let token = TimerToken(self.generation);
        self.armed = Some(token);
        token
    }

    pub fn cancel(&mut self) {
        self.armed = None;
    }

    /// Consume an expiry. Returns false for a stale token.
    pub fn fire(&mut self, token: TimerToken) -> bool {
        if self.armed == Some(token) {
            self.armed = None;
            true
        } else {
            false
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }
}
