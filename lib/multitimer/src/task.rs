// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::fmt;

use timer_heap::NodeId;

/// Names a task within the [`Scheduler`](crate::Scheduler) that created it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) usize);

impl TaskId {
    pub fn index(self) -> usize {
        self.0
    }

    pub(crate) fn node(self) -> NodeId {
        NodeId::new(self.0)
    }

    pub(crate) fn from_node(node: NodeId) -> Self {
        Self(node.index())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {}", self.0)
    }
}

/// How a task's next expiry is computed after it fires.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Rearm {
    /// `now + interval`, where `now` is the time of the sweep that fired the
    /// task. A late task is not made to catch up, so its phase drifts by
    /// however late it was.
    #[default]
    AfterFiring,
    /// `previous expiry + interval`. Phase is kept; a task that falls behind
    /// fires once per sweep until it is caught up.
    AfterDeadline,
}

impl Rearm {
    pub(crate) fn next(self, expiry: u64, now: u64, interval: u64) -> u64 {
        match self {
            Rearm::AfterFiring => now.saturating_add(interval),
            Rearm::AfterDeadline => expiry.saturating_add(interval),
        }
    }
}

/// Where a task is in its cycle.
///
/// Tasks go `Armed -> Firing -> Armed` for as long as the scheduler runs.
/// A task popped because it is due goes straight to `Firing`: nothing runs
/// between the pop and its action, so there is no moment at which it is due
/// but not yet firing.
///
/// `Firing` is only observable from inside the task's own action. `Due`
/// covers a task that has fired but is already due again (a zero interval, or
/// `AfterDeadline` catching up), and is waiting for the end of the sweep to go
/// back into the heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Armed,
    Due,
    Firing,
    Cancelled,
}

/// One periodic unit of work.
#[derive(Clone, Debug)]
pub struct TimerTask {
    pub(crate) id: TaskId,
    pub(crate) label: String,
    pub(crate) expiry: u64,
    pub(crate) interval: u64,
    pub(crate) rearm: Rearm,
    pub(crate) state: State,
    pub(crate) fire_count: u64,
    pub(crate) last_fired: Option<u64>,
}

impl TimerTask {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Absolute time at which the task is next due. While the task's action
    /// runs, this is still the expiry that made it due.
    pub fn expiry(&self) -> u64 {
        self.expiry
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn rearm(&self) -> Rearm {
        self.rearm
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Number of times the action has run to completion.
    pub fn fire_count(&self) -> u64 {
        self.fire_count
    }

    /// Time of the sweep that most recently fired this task (including the
    /// one firing it right now).
    pub fn last_fired(&self) -> Option<u64> {
        self.last_fired
    }
}

/// The work a task does when it fires.
///
/// Actions run synchronously on the scheduler's thread, so one that blocks
/// stalls every other task. Failures are the action's own business: there is
/// no way to return one to the scheduler, and the task stays on its schedule
/// regardless.
pub trait Action {
    fn fire(&mut self, task: &TimerTask);
}

impl<F> Action for F
where
    F: FnMut(&TimerTask),
{
    fn fire(&mut self, task: &TimerTask) {
        self(task)
    }
}
