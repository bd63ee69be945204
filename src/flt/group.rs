//! Per-CPU group accounting
//!
//! Every CPU keeps one load window and one running-task counter per group.
//! The windows are written by the load tracker only; the group aggregator
//! reads them through [`GroupLoad::window`].

use core::fmt;

use super::window::LoadWindow;

/// Number of scheduling groups.
pub const GROUP_COUNT: usize = 4;

/// Validated group id in `0..GROUP_COUNT`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(u8);

impl GroupId {
    pub const fn new(raw: u8) -> Option<Self> {
        if (raw as usize) < GROUP_COUNT {
            Some(Self(raw))
        } else {
            None
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn raw(self) -> u8 {
        self.0
    }

    pub fn all() -> impl Iterator<Item = GroupId> {
        (0..GROUP_COUNT as u8).map(GroupId)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "grp{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupLoad {
    windows: [LoadWindow; GROUP_COUNT],
    nr_running: [u32; GROUP_COUNT],
}

impl GroupLoad {
    pub const fn new() -> Self {
        Self {
            windows: [LoadWindow::new(); GROUP_COUNT],
            nr_running: [0; GROUP_COUNT],
        }
    }

    #[inline]
    pub fn window(&self, group: GroupId) -> &LoadWindow {
        &self.windows[group.index()]
    }

    #[inline]
    pub fn window_mut(&mut self, group: GroupId) -> &mut LoadWindow {
        &mut self.windows[group.index()]
    }

    pub fn windows_mut(&mut self) -> impl Iterator<Item = (GroupId, &mut LoadWindow)> {
        self.windows
            .iter_mut()
            .enumerate()
            .map(|(idx, window)| (GroupId(idx as u8), window))
    }

    #[inline]
    pub fn nr_running(&self, group: GroupId) -> u32 {
        self.nr_running[group.index()]
    }

    pub fn task_arrived(&mut self, group: GroupId) {
        let slot = &mut self.nr_running[group.index()];
        *slot = slot.saturating_add(1);
    }

    /// Returns false when the counter was already zero (unbalanced dequeue).
    pub fn task_left(&mut self, group: GroupId) -> bool {
        let slot = &mut self.nr_running[group.index()];
        if *slot == 0 {
            return false;
        }
        *slot -= 1;
        true
    }

    /// Move one running task from `from` to `to` (group change while queued).
    pub fn regroup(&mut self, from: Option<GroupId>, to: Option<GroupId>) {
        if from == to {
            return;
        }
        if let Some(from) = from {
            self.task_left(from);
        }
        if let Some(to) = to {
            self.task_arrived(to);
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
