//! Deterministic simulated clock and timer queue.
//!
//! The timeline owns simulated time (seconds) and the underlying chain's
//! block height. Timers fire strictly in ascending due time; timers due at
//! the same second fire in registration order.
//!
//! ## Example
//!
//! ```ignore
//! use vaultline_sim::timeline::Timeline;
//!
//! let mut timeline = Timeline::new(1_000, 4, 100);
//! timeline.schedule_after(30, "payment window");
//! let advance = timeline.skip_time(60, true);
//! assert_eq!(advance.underlying_blocks, 15);
//! assert_eq!(advance.fired[0].payload, "payment window");
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use vaultline_config::TimelineConfig;
use vaultline_types::SimTime;

// ============================================================================
// Timer Types
// ============================================================================

/// Handle of a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimerId(u64);

impl TimerId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// A timer taken off the queue because it came due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredTimer<T> {
    pub id: TimerId,
    pub due: SimTime,
    pub payload: T,
}

/// Entry of the firing log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiringRecord {
    pub timer: TimerId,
    pub due: SimTime,
    pub fired_at: SimTime,
}

/// What a call to [`Timeline::skip_time`] did.
#[derive(Debug)]
pub struct Advance<T> {
    /// Timers fired, in firing order.
    pub fired: Vec<FiredTimer<T>>,
    /// Underlying blocks that became due during the skip.
    pub underlying_blocks: u64,
}

// ============================================================================
// Timeline
// ============================================================================

/// Simulated clock with an ordered timer queue.
#[derive(Debug)]
pub struct Timeline<T> {
    now: SimTime,
    /// Keyed by `(due, registration sequence)`.
    timers: BTreeMap<(SimTime, u64), T>,
    /// Sequence number to due time, for cancellation.
    due_of: BTreeMap<u64, SimTime>,
    next_seq: u64,
    underlying_height: u64,
    block_interval: u64,
    /// Seconds not yet converted into an underlying block.
    carry: u64,
    log: Vec<FiringRecord>,
    log_capacity: usize,
    fired_total: u64,
}

impl<T> Timeline<T> {
    /// Creates a timeline starting at `start`.
    ///
    /// A zero `block_interval` is treated as one second per block.
    pub fn new(start: SimTime, block_interval: u64, log_capacity: usize) -> Self {
        Self {
            now: start,
            timers: BTreeMap::new(),
            due_of: BTreeMap::new(),
            next_seq: 0,
            underlying_height: 0,
            block_interval: block_interval.max(1),
            carry: 0,
            log: Vec::new(),
            log_capacity,
            fired_total: 0,
        }
    }

    pub fn from_config(config: &TimelineConfig) -> Self {
        Self::new(
            config.start_timestamp,
            config.underlying_block_interval_secs,
            config.firing_log_capacity,
        )
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    pub fn underlying_height(&self) -> u64 {
        self.underlying_height
    }

    /// Number of timers waiting to fire.
    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    /// Due time of the earliest pending timer.
    pub fn next_due(&self) -> Option<SimTime> {
        self.timers.keys().next().map(|(due, _)| *due)
    }

    /// Schedules a timer at an absolute time.
    ///
    /// A due time in the past fires at the next [`execute_triggers`](Self::execute_triggers).
    pub fn schedule_at(&mut self, due: SimTime, payload: T) -> TimerId {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.timers.insert((due, seq), payload);
        self.due_of.insert(seq, due);
        tracing::trace!(timer = seq, due, "scheduled timer");
        TimerId(seq)
    }

    /// Schedules a timer `delay` seconds from now.
    pub fn schedule_after(&mut self, delay: u64, payload: T) -> TimerId {
        self.schedule_at(self.now.saturating_add(delay), payload)
    }

    /// Removes a pending timer, returning its payload.
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        let due = self.due_of.remove(&id.0)?;
        self.timers.remove(&(due, id.0))
    }

    /// Advances the clock and fires every timer that became due.
    ///
    /// With `advance_underlying`, `floor((carry + seconds) / block_interval)`
    /// underlying blocks are mined and the remainder is carried into the
    /// next skip.
    pub fn skip_time(&mut self, seconds: u64, advance_underlying: bool) -> Advance<T> {
        self.now = self.now.saturating_add(seconds);

        let mut underlying_blocks = 0;
        if advance_underlying {
            let elapsed = self.carry + seconds;
            underlying_blocks = elapsed / self.block_interval;
            self.carry = elapsed % self.block_interval;
            self.underlying_height += underlying_blocks;
        }

        tracing::debug!(
            now = self.now,
            seconds,
            underlying_blocks,
            underlying_height = self.underlying_height,
            "skipped time"
        );

        Advance {
            fired: self.execute_triggers(),
            underlying_blocks,
        }
    }

    /// Fires every timer due at or before the current time, without moving
    /// the clock.
    pub fn execute_triggers(&mut self) -> Vec<FiredTimer<T>> {
        let mut fired = Vec::new();
        while let Some(entry) = self.timers.first_entry() {
            let (due, seq) = *entry.key();
            if due > self.now {
                break;
            }
            let payload = entry.remove();
            self.due_of.remove(&seq);
            self.record(TimerId(seq), due);
            fired.push(FiredTimer {
                id: TimerId(seq),
                due,
                payload,
            });
        }
        fired
    }

    /// Fired timers in firing order, up to the log capacity.
    pub fn firing_log(&self) -> &[FiringRecord] {
        &self.log
    }

    /// Total timers fired, including those past the log capacity.
    pub fn fired_total(&self) -> u64 {
        self.fired_total
    }

    fn record(&mut self, timer: TimerId, due: SimTime) {
        self.fired_total += 1;
        if self.log.len() < self.log_capacity {
            self.log.push(FiringRecord {
                timer,
                due,
                fired_at: self.now,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payloads<T: Copy>(fired: &[FiredTimer<T>]) -> Vec<T> {
        fired.iter().map(|t| t.payload).collect()
    }

    #[test]
    fn fires_in_due_order_with_fifo_ties() {
        let mut timeline = Timeline::new(100, 4, 16);
        timeline.schedule_at(130, 'c');
        timeline.schedule_at(110, 'a');
        timeline.schedule_at(130, 'd');
        timeline.schedule_at(120, 'b');

        let advance = timeline.skip_time(50, false);
        assert_eq!(payloads(&advance.fired), vec!['a', 'b', 'c', 'd']);
        assert_eq!(timeline.now(), 150);
        assert_eq!(timeline.pending(), 0);
    }

    #[test]
    fn timers_after_the_window_stay_pending() {
        let mut timeline = Timeline::new(0, 4, 16);
        timeline.schedule_after(10, 1);
        timeline.schedule_after(11, 2);

        let advance = timeline.skip_time(10, false);
        assert_eq!(payloads(&advance.fired), vec![1]);
        assert_eq!(timeline.next_due(), Some(11));
    }

    #[test]
    fn underlying_blocks_carry_remainder() {
        let mut timeline: Timeline<()> = Timeline::new(0, 4, 16);

        assert_eq!(timeline.skip_time(6, true).underlying_blocks, 1);
        assert_eq!(timeline.skip_time(6, true).underlying_blocks, 2);
        assert_eq!(timeline.skip_time(3, false).underlying_blocks, 0);
        assert_eq!(timeline.underlying_height(), 3);
        assert_eq!(timeline.now(), 15);
    }

    #[test]
    fn execute_triggers_fires_past_due_without_moving_clock() {
        let mut timeline = Timeline::new(500, 4, 16);
        timeline.schedule_at(400, "late");

        let fired = timeline.execute_triggers();
        assert_eq!(payloads(&fired), vec!["late"]);
        assert_eq!(timeline.now(), 500);
        assert_eq!(timeline.firing_log()[0].fired_at, 500);
    }

    #[test]
    fn cancelled_timers_never_fire() {
        let mut timeline = Timeline::new(0, 4, 16);
        let keep = timeline.schedule_after(5, "keep");
        let dropped = timeline.schedule_after(5, "drop");

        assert_eq!(timeline.cancel(dropped), Some("drop"));
        assert_eq!(timeline.cancel(dropped), None);

        let advance = timeline.skip_time(5, false);
        assert_eq!(advance.fired.len(), 1);
        assert_eq!(advance.fired[0].id, keep);
    }

    #[test]
    fn firing_log_is_bounded() {
        let mut timeline = Timeline::new(0, 4, 2);
        for i in 0..5 {
            timeline.schedule_after(i, i);
        }
        timeline.skip_time(10, false);

        assert_eq!(timeline.firing_log().len(), 2);
        assert_eq!(timeline.fired_total(), 5);
    }
}
