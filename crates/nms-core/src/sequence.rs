//! Per-direction sequence numbering for NetTask.
//!
//! Each side owns one [`SendSequence`] for what it sends and one
//! [`ReceiveWindow`] for what it receives. Numbers start at 1, increase by
//! one per datagram and never wrap inside a session. The acknowledgement
//! carried in every outbound header is the receive window's highest-seen
//! number.
//!
//! The window remembers the last 64 numbers below the highest, so a
//! reordered datagram inside that range is still delivered once while a
//! replay of any of them is reported as a duplicate. Anything further back
//! is [`Delivery::Stale`]: it is never delivered, whether or not it was
//! seen before.
//!
//! Classification and recording are separate steps. A receiver classifies
//! the header first and only commits the number once the datagram it came
//! with has been authenticated, so an unauthenticated header cannot move
//! the window.

use crate::error::SequenceError;

/// Width of the receive window bitmap
pub const WINDOW_SIZE: u32 = 64;

/// Outbound counter plus the highest acknowledgement heard from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendSequence {
    next: u32,
    acked: u32,
}

impl SendSequence {
    /// Fresh counter; the first number handed out is 1
    #[must_use]
    pub fn new() -> Self {
        Self { next: 1, acked: 0 }
    }

    /// Take the next sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`SequenceError::Exhausted`] once `u32::MAX` would be reached.
    pub fn next(&mut self) -> Result<u32, SequenceError> {
        if self.next == u32::MAX {
            return Err(SequenceError::Exhausted);
        }
        let sequence = self.next;
        self.next += 1;
        Ok(sequence)
    }

    /// Fold in an acknowledgement from the peer. Acks never move backwards.
    pub fn acknowledge(&mut self, ack: u32) {
        let sent = self.last_sent();
        self.acked = self.acked.max(ack.min(sent));
    }

    /// Last number handed out, 0 before the first
    #[must_use]
    pub fn last_sent(&self) -> u32 {
        self.next - 1
    }

    /// Highest acknowledgement received
    #[must_use]
    pub fn acked(&self) -> u32 {
        self.acked
    }

    /// Datagrams sent but not yet acknowledged
    #[must_use]
    pub fn unacked(&self) -> u32 {
        self.last_sent() - self.acked
    }
}

impl Default for SendSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// Classification of an inbound sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Not seen before; `gap` numbers were skipped to reach it
    Fresh {
        /// Skipped numbers between the previous highest and this one
        gap: u32,
    },
    /// Already delivered
    Duplicate,
    /// 0, or more than [`WINDOW_SIZE`] below the highest. The number may
    /// have been delivered before; the window no longer knows.
    Stale,
}

impl Delivery {
    /// True if the datagram should be processed
    #[must_use]
    pub fn is_fresh(self) -> bool {
        matches!(self, Self::Fresh { .. })
    }
}

/// Highest-seen number plus a bitmap of the 64 below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceiveWindow {
    highest: u32,
    /// Bit `i` set means `highest - 1 - i` was seen
    seen: u64,
}

impl ReceiveWindow {
    /// Empty window; highest is 0
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest number accepted so far, 0 before the first.
    ///
    /// Never decreases.
    #[must_use]
    pub fn highest(&self) -> u32 {
        self.highest
    }

    /// Classify `sequence` without recording it.
    #[must_use]
    pub fn classify(&self, sequence: u32) -> Delivery {
        if sequence == 0 {
            return Delivery::Stale;
        }
        if sequence > self.highest {
            return Delivery::Fresh { gap: sequence - self.highest - 1 };
        }
        if sequence == self.highest {
            return Delivery::Duplicate;
        }

        let distance = self.highest - sequence;
        if distance > WINDOW_SIZE {
            Delivery::Stale
        } else if self.seen & (1u64 << (distance - 1)) != 0 {
            Delivery::Duplicate
        } else {
            Delivery::Fresh { gap: 0 }
        }
    }

    /// Record `sequence` as delivered. Numbers that do not classify as
    /// fresh leave the window untouched.
    pub fn commit(&mut self, sequence: u32) {
        if !self.classify(sequence).is_fresh() {
            return;
        }

        if sequence > self.highest {
            let advance = sequence - self.highest;
            self.seen = if self.highest == 0 {
                0
            } else {
                let shifted = self.seen.checked_shl(advance).unwrap_or(0);
                let previous = if advance <= WINDOW_SIZE { 1u64 << (advance - 1) } else { 0 };
                shifted | previous
            };
            self.highest = sequence;
        } else {
            self.seen |= 1u64 << (self.highest - sequence - 1);
        }
    }

    /// Classify `sequence` and record it if fresh.
    pub fn observe(&mut self, sequence: u32) -> Delivery {
        let delivery = self.classify(sequence);
        self.commit(sequence);
        delivery
    }
}
