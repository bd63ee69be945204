//! Sliding load window
//!
//! Every tracked entity (task, CPU, CPU x group) owns one `LoadWindow`.
//! All windows are aligned to multiples of the window length, so windows
//! of different entities roll over at the same instants.

use crate::SCHED_CAPACITY_SCALE;

/// Depth of the consolidated history ring.
pub const FLT_HISTORY_DEPTH: usize = 5;

/// Default window length: 4ms.
pub const DEFAULT_WINDOW_NS: u64 = 4_000_000;

/// One consolidated window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HistorySlot {
    /// Scaled busy time in ns, never above the window length.
    pub sum: u64,
    /// `sum` in capacity units (1024 = busy for the whole window at full speed).
    pub util: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowState {
    Uninitialized,
    Active,
}

/// Capacity and frequency scale of the CPU the time was spent on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Scale {
    /// capacity_orig of the CPU, 0..=1024
    pub capacity: u64,
    /// cur_freq * 1024 / max_freq of its cluster, 0..=1024
    pub freq: u64,
}

impl Scale {
    pub const FULL: Scale = Scale {
        capacity: SCHED_CAPACITY_SCALE,
        freq: SCHED_CAPACITY_SCALE,
    };

    pub fn new(capacity: u64, freq: u64) -> Self {
        Self {
            capacity: capacity.min(SCHED_CAPACITY_SCALE),
            freq: freq.min(SCHED_CAPACITY_SCALE),
        }
    }

    #[inline]
    pub fn apply(self, delta: u64) -> u64 {
        let scaled = (delta as u128 * self.capacity as u128) >> 10;
        ((scaled * self.freq as u128) >> 10) as u64
    }
}

/// What a single update did to the window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowUpdate {
    /// First observation: the window was armed, nothing accounted.
    Started,
    /// `wallclock` did not advance past the last update.
    Skipped,
    /// Still inside the current window.
    Accumulated,
    /// One or more window boundaries were crossed.
    Rolled { windows: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadWindow {
    state: WindowState,
    window_start: u64,
    mark_start: u64,
    curr_sum: u64,
    prev_sum: u64,
    history: [HistorySlot; FLT_HISTORY_DEPTH],
}

impl Default for LoadWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadWindow {
    pub const fn new() -> Self {
        Self {
            state: WindowState::Uninitialized,
            window_start: 0,
            mark_start: 0,
            curr_sum: 0,
            prev_sum: 0,
            history: [HistorySlot { sum: 0, util: 0 }; FLT_HISTORY_DEPTH],
        }
    }

    /// Arm the window at `wallclock`. The window start is aligned down to a
    /// multiple of `window_ns`.
    pub fn start(&mut self, wallclock: u64, window_ns: u64) {
        let window_ns = window_ns.max(1);
        *self = Self::new();
        self.state = WindowState::Active;
        self.window_start = wallclock - wallclock % window_ns;
        self.mark_start = wallclock;
    }

    /// Drop all accounting (task exit, CPU offline).
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    #[inline]
    pub fn state(&self) -> WindowState {
        self.state
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state == WindowState::Active
    }

    #[inline]
    pub fn window_start(&self) -> u64 {
        self.window_start
    }

    #[inline]
    pub fn mark_start(&self) -> u64 {
        self.mark_start
    }

    #[inline]
    pub fn curr_sum(&self) -> u64 {
        self.curr_sum
    }

    #[inline]
    pub fn prev_sum(&self) -> u64 {
        self.prev_sum
    }

    #[inline]
    pub fn history(&self) -> &[HistorySlot; FLT_HISTORY_DEPTH] {
        &self.history
    }

    /// Most recent consolidated window in capacity units.
    #[inline]
    pub fn demand(&self) -> u64 {
        self.history[0].util
    }

    /// Account the interval `[mark_start, wallclock]`, of which the trailing
    /// `busy_ns` were busy.
    ///
    /// Busy time that straddles a window boundary is split at the boundary.
    /// Full windows skipped over in one call are replayed into the history
    /// as synthetic full-window samples, whatever the entity did during the
    /// gap. Suspended time must therefore never reach `wallclock`.
    pub fn update(
        &mut self,
        wallclock: u64,
        window_ns: u64,
        busy_ns: u64,
        scale: Scale,
    ) -> WindowUpdate {
        let window_ns = window_ns.max(1);

        if self.state == WindowState::Uninitialized {
            self.start(wallclock, window_ns);
            return WindowUpdate::Started;
        }

        if wallclock <= self.mark_start {
            return WindowUpdate::Skipped;
        }

        let delta = wallclock - self.mark_start;
        let busy_start = wallclock - busy_ns.min(delta);

        let boundary = self.window_start.saturating_add(window_ns);
        if wallclock < boundary {
            self.add_curr(scale.apply(wallclock - busy_start), window_ns);
            self.mark_start = wallclock;
            return WindowUpdate::Accumulated;
        }

        let nr_windows = (wallclock - self.window_start) / window_ns;
        let new_start = self.window_start + nr_windows * window_ns;

        // Busy part inside the window being closed.
        let before = overlap(busy_start, wallclock, self.window_start, boundary);
        self.add_curr(scale.apply(before), window_ns);
        let closing = self.curr_sum;
        self.push_sample(closing, window_ns);

        // Replay skipped full windows. Only the last FLT_HISTORY_DEPTH of
        // them can still be visible in the ring.
        let nr_full = nr_windows - 1;
        let replay = nr_full.min(FLT_HISTORY_DEPTH as u64);
        let first_replayed = nr_full - replay;
        let full = scale.apply(window_ns).min(window_ns);
        for _ in first_replayed..nr_full {
            self.push_sample(full, window_ns);
        }

        self.curr_sum = 0;
        self.add_curr(
            scale.apply(overlap(busy_start, wallclock, new_start, wallclock)),
            window_ns,
        );
        self.window_start = new_start;
        self.mark_start = wallclock;

        WindowUpdate::Rolled {
            windows: nr_windows,
        }
    }

    /// Move `curr`/`prev` contributions out of this window (migration source).
    /// The most recent history slot follows `prev_sum`.
    pub fn subtract(&mut self, curr: u64, prev: u64, window_ns: u64) {
        self.curr_sum = self.curr_sum.saturating_sub(curr);
        let prev = self.prev_sum.saturating_sub(prev);
        self.set_prev(prev, window_ns);
    }

    /// Move `curr`/`prev` contributions into this window (migration target).
    pub fn add(&mut self, curr: u64, prev: u64, window_ns: u64) {
        self.add_curr(curr, window_ns);
        let prev = self.prev_sum.saturating_add(prev);
        self.set_prev(prev, window_ns);
    }

    fn set_prev(&mut self, sum: u64, window_ns: u64) {
        let window_ns = window_ns.max(1);
        let sum = sum.min(window_ns);
        self.prev_sum = sum;
        self.history[0] = HistorySlot {
            sum,
            util: sum * SCHED_CAPACITY_SCALE / window_ns,
        };
    }

    fn add_curr(&mut self, scaled: u64, window_ns: u64) {
        self.curr_sum = self.curr_sum.saturating_add(scaled).min(window_ns);
    }

    fn push_sample(&mut self, sum: u64, window_ns: u64) {
        self.history.copy_within(0..FLT_HISTORY_DEPTH - 1, 1);
        self.set_prev(sum, window_ns);
    }
}

/// Length of the intersection of `[a0, a1)` and `[b0, b1)`.
#[inline]
fn overlap(a0: u64, a1: u64, b0: u64, b1: u64) -> u64 {
    let start = a0.max(b0);
    let end = a1.min(b1);
    end.saturating_sub(start)
}
