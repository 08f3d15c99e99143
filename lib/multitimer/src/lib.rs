// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A cooperative periodic-task scheduler.
//!
//! `Scheduler` multiplexes any number of periodic tasks onto one polling loop.
//! Each task has an absolute expiry, a fixed re-arm interval, a label for
//! diagnostics, and an [`Action`] that runs when it comes due. Tasks are kept
//! in a [`timer_heap::Heap`] ordered by expiry, so finding the next one due is
//! O(1) and re-arming one is O(log n).
//!
//! The expected usage model is:
//!
//! - Create a `Scheduler` and `add` your tasks, giving each a first expiry in
//!   the clock's time domain (usually "now" or "now plus some offset").
//!
//! - Either call [`Scheduler::sweep`] yourself with the current time, as often
//!   as you like, or hand the scheduler a [`Clock`] and a stopping condition
//!   and let [`Scheduler::run`] do it.
//!
//! A sweep at time `now` pops every task whose expiry is `<= now`, runs its
//! action, and puts it back at `now + interval`. Note that this is measured
//! from the sweep, _not_ from the old expiry: a task that was held up by a
//! slow neighbour simply runs late once instead of firing a burst to catch up.
//! Tasks that want to keep their phase can ask for [`Rearm::AfterDeadline`].
//!
//! Every task fires at most once per sweep. A task with a zero interval (or
//! one using `AfterDeadline` that has fallen behind) is still due after it
//! fires; it goes back into the heap at the end of the sweep and fires again
//! on the next one.
//!
//! Everything runs on the caller's thread. Actions get exclusive access to
//! whatever they capture for as long as they run, and an action that blocks
//! stalls all the others.

use core::fmt;

use timer_heap::{Heap, HeapError, NodeId};

pub mod clock;
mod task;

pub use clock::{Clock, MonotonicClock, SimClock};
pub use task::{Action, Rearm, State, TaskId, TimerTask};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The task heap is inconsistent or could not grow. This is not
    /// recoverable.
    Heap(HeapError),
    /// The id did not come from this scheduler.
    NoSuchTask(TaskId),
    /// The task has been cancelled and can't be scheduled again.
    Cancelled(TaskId),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Heap(e) => write!(f, "task heap: {e}"),
            Self::NoSuchTask(id) => write!(f, "no such task: {id}"),
            Self::Cancelled(id) => write!(f, "{id} has been cancelled"),
        }
    }
}

impl std::error::Error for Error {}

impl From<HeapError> for Error {
    fn from(e: HeapError) -> Self {
        Self::Heap(e)
    }
}

/// What happened during one [`Scheduler::sweep`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Sweep {
    /// The time the sweep was run for.
    pub now: u64,
    /// Number of tasks that fired.
    pub fired: usize,
    /// Earliest expiry left in the heap afterwards.
    pub next_expiry: Option<u64>,
}

/// Totals over one call to [`Scheduler::run`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    pub sweeps: u64,
    pub fired: u64,
    pub idle_waits: u64,
}

/// What [`Scheduler::run`] does after a sweep in which nothing fired.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Idle {
    /// Go straight back to the clock.
    #[default]
    Spin,
    /// Offer the rest of the time slice to the OS first.
    Yield,
    /// Sleep until the next expiry, but never longer than `max_ms`.
    Sleep { max_ms: u64 },
}

impl Idle {
    fn wait<C: Clock + ?Sized>(self, clock: &C, sweep: &Sweep) {
        match self {
            Idle::Spin => (),
            Idle::Yield => std::thread::yield_now(),
            Idle::Sleep { max_ms } => {
                let ms = match sweep.next_expiry {
                    Some(next) => next.saturating_sub(sweep.now).min(max_ms),
                    None => max_ms,
                };
                if ms > 0 {
                    clock.sleep_ms(ms);
                }
            }
        }
    }
}

pub struct Scheduler<'a> {
    heap: Heap,
    tasks: Vec<TimerTask>,
    /// Parallel to `tasks`; kept apart so an action can borrow its own task.
    actions: Vec<Box<dyn Action + 'a>>,
    /// Tasks that fired this sweep but are already due again.
    held: Vec<TaskId>,
}

/// Heap ordering: earliest expiry first, ties broken by id so that runs are
/// repeatable.
fn by_expiry(tasks: &[TimerTask]) -> impl Fn(NodeId, NodeId) -> bool + '_ {
    move |a, b| {
        let (a, b) = (&tasks[a.index()], &tasks[b.index()]);
        (a.expiry, a.id) < (b.expiry, b.id)
    }
}

/// Re-arms every held task, carrying on past failures. Returns the first
/// failure.
fn restore_held(
    heap: &mut Heap,
    tasks: &mut [TimerTask],
    held: &mut Vec<TaskId>,
) -> Result<(), HeapError> {
    let mut result = Ok(());
    for id in held.drain(..) {
        tasks[id.0].state = State::Armed;
        let r = heap.insert(id.node(), by_expiry(tasks));
        if result.is_ok() {
            result = r;
        }
    }
    result
}

impl<'a> Scheduler<'a> {
    pub fn new() -> Self {
        Self {
            heap: Heap::new(),
            tasks: Vec::new(),
            actions: Vec::new(),
            held: Vec::new(),
        }
    }

    /// Adds a task that first fires at `first_expiry` and then every
    /// `interval` after each firing.
    pub fn add<A>(
        &mut self,
        label: impl Into<String>,
        first_expiry: u64,
        interval: u64,
        action: A,
    ) -> Result<TaskId, Error>
    where
        A: Action + 'a,
    {
        self.add_with_rearm(
            label,
            first_expiry,
            interval,
            Rearm::default(),
            action,
        )
    }

    pub fn add_with_rearm<A>(
        &mut self,
        label: impl Into<String>,
        first_expiry: u64,
        interval: u64,
        rearm: Rearm,
        action: A,
    ) -> Result<TaskId, Error>
    where
        A: Action + 'a,
    {
        let id = TaskId(self.tasks.len());
        self.tasks.push(TimerTask {
            id,
            label: label.into(),
            expiry: first_expiry,
            interval,
            rearm,
            state: State::Armed,
            fire_count: 0,
            last_fired: None,
        });
        self.actions.push(Box::new(action));

        if let Err(e) = self.heap.insert(id.node(), by_expiry(&self.tasks)) {
            self.tasks.pop();
            self.actions.pop();
            return Err(e.into());
        }

        log::debug!(
            "{id} ({}) armed for {first_expiry}, every {interval} ms",
            self.tasks[id.0].label,
        );
        Ok(id)
    }

    pub fn task(&self, id: TaskId) -> Option<&TimerTask> {
        self.tasks.get(id.0)
    }

    /// All tasks ever added, cancelled ones included, in the order added.
    pub fn tasks(&self) -> impl Iterator<Item = &TimerTask> + '_ {
        self.tasks.iter()
    }

    /// Number of armed tasks.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn next_expiry(&self) -> Option<u64> {
        self.heap.min().map(|n| self.tasks[n.index()].expiry)
    }

    /// Moves an armed task to a new expiry.
    pub fn set_expiry(&mut self, id: TaskId, expiry: u64) -> Result<(), Error> {
        let task = self.tasks.get(id.0).ok_or(Error::NoSuchTask(id))?;
        if task.state == State::Cancelled {
            return Err(Error::Cancelled(id));
        }

        // The heap can't see key changes, so take the task out while we
        // change it.
        self.heap.remove(id.node(), by_expiry(&self.tasks))?;
        self.tasks[id.0].expiry = expiry;
        self.heap.insert(id.node(), by_expiry(&self.tasks))?;

        log::debug!("{id} ({}) moved to {expiry}", self.tasks[id.0].label);
        Ok(())
    }

    /// Disarms a task for good. Returns `false` if it was already cancelled.
    pub fn cancel(&mut self, id: TaskId) -> Result<bool, Error> {
        let task = self.tasks.get(id.0).ok_or(Error::NoSuchTask(id))?;
        if task.state == State::Cancelled {
            return Ok(false);
        }

        self.heap.remove(id.node(), by_expiry(&self.tasks))?;
        self.tasks[id.0].state = State::Cancelled;

        log::debug!("{id} ({}) cancelled", self.tasks[id.0].label);
        Ok(true)
    }

    /// Fires every task due at `now`, each at most once, and re-arms them.
    ///
    /// An error means the heap could not take a task back. That task is left
    /// out of the heap; every other task is still armed.
    pub fn sweep(&mut self, now: u64) -> Result<Sweep, Error> {
        let Self {
            heap,
            tasks,
            actions,
            held,
        } = self;
        let mut fired = 0;
        let mut result = Ok(());

        while let Some(top) = heap.min() {
            if tasks[top.index()].expiry > now {
                break;
            }
            let popped = heap.pop(by_expiry(tasks));
            debug_assert_eq!(popped, Some(top));

            let id = TaskId::from_node(top);
            let task = &mut tasks[id.0];
            log::trace!(
                "{id} ({}) due at {} fired at {now}",
                task.label,
                task.expiry,
            );

            task.state = State::Firing;
            task.last_fired = Some(now);
            actions[id.0].fire(task);
            task.fire_count += 1;
            fired += 1;

            task.expiry = task.rearm.next(task.expiry, now, task.interval);
            if task.expiry > now {
                task.state = State::Armed;
                if let Err(e) = heap.insert(top, by_expiry(tasks)) {
                    result = Err(e);
                    break;
                }
            } else {
                // Putting it back now would have us fire it again in this
                // same sweep.
                task.state = State::Due;
                held.push(id);
            }
        }

        // Held tasks go back even if the drain failed, so that one task
        // failing to re-arm doesn't strand the others.
        let restored = restore_held(heap, tasks, held);
        result.and(restored)?;

        Ok(Sweep {
            now,
            fired,
            next_expiry: self.next_expiry(),
        })
    }

    /// Sweeps repeatedly against `clock` until `keep_going` returns `false`.
    ///
    /// `keep_going` sees the result of every sweep, after the sweep. When a
    /// sweep fires nothing, the loop idles according to `idle` before reading
    /// the clock again.
    ///
    /// The only errors are heap inconsistencies, which are fatal.
    pub fn run<C, F>(
        &mut self,
        clock: &C,
        idle: Idle,
        mut keep_going: F,
    ) -> Result<RunStats, Error>
    where
        C: Clock + ?Sized,
        F: FnMut(&Sweep) -> bool,
    {
        let mut stats = RunStats::default();
        loop {
            let sweep = self.sweep(clock.now_ms())?;
            stats.sweeps += 1;
            stats.fired += sweep.fired as u64;

            if !keep_going(&sweep) {
                return Ok(stats);
            }

            if sweep.fired == 0 {
                idle.wait(clock, &sweep);
                stats.idle_waits += 1;
            }
        }
    }
}

impl Default for Scheduler<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.tasks)
            .field("armed", &self.heap.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    type Log = RefCell<Vec<(String, u64)>>;

    fn recorder(log: &Log) -> impl FnMut(&TimerTask) + '_ {
        move |t| {
            let when = t.last_fired().unwrap_or(u64::MAX);
            log.borrow_mut().push((t.label().to_owned(), when));
        }
    }

    fn entries(v: &[(&str, u64)]) -> Vec<(String, u64)> {
        v.iter().map(|&(s, t)| (s.to_owned(), t)).collect()
    }

    fn nop(_: &TimerTask) {}

    #[test]
    fn empty_sweep() {
        let mut uut = Scheduler::new();
        assert_eq!(
            uut.sweep(1234).unwrap(),
            Sweep {
                now: 1234,
                fired: 0,
                next_expiry: None,
            },
        );
    }

    #[test]
    fn rearm_is_measured_from_the_sweep() {
        const T0: u64 = 10_000;
        let mut uut = Scheduler::new();
        let id = uut.add("late", T0, 1000, nop).unwrap();

        let sweep = uut.sweep(T0 + 50).unwrap();
        assert_eq!(sweep.fired, 1);
        assert_eq!(uut.task(id).unwrap().expiry(), T0 + 1050);
        assert_eq!(sweep.next_expiry, Some(T0 + 1050));
    }

    #[test]
    fn late_task_does_not_burst() {
        let log = Log::default();
        let mut uut = Scheduler::new();
        uut.add("slow", 0, 100, recorder(&log)).unwrap();

        // Ten periods late: fires once, then waits a whole interval.
        assert_eq!(uut.sweep(1000).unwrap().fired, 1);
        assert_eq!(uut.sweep(1000).unwrap().fired, 0);
        assert_eq!(uut.next_expiry(), Some(1100));
        assert_eq!(*log.borrow(), entries(&[("slow", 1000)]));
    }

    #[test]
    fn after_deadline_keeps_phase() {
        let mut uut = Scheduler::new();
        let id = uut
            .add_with_rearm("phase", 1000, 1000, Rearm::AfterDeadline, nop)
            .unwrap();

        uut.sweep(1050).unwrap();
        assert_eq!(uut.task(id).unwrap().expiry(), 2000);

        // Three periods behind: catches up one firing per sweep.
        assert_eq!(uut.sweep(4500).unwrap().fired, 1);
        assert_eq!(uut.task(id).unwrap().expiry(), 3000);
        assert_eq!(uut.sweep(4500).unwrap().fired, 1);
        assert_eq!(uut.sweep(4500).unwrap().fired, 1);
        assert_eq!(uut.task(id).unwrap().expiry(), 5000);
        assert_eq!(uut.sweep(4500).unwrap().fired, 0);
    }

    #[test]
    fn sweep_fires_each_due_task_once() {
        let log = Log::default();
        let mut uut = Scheduler::new();
        uut.add("c", 300, 1000, recorder(&log)).unwrap();
        uut.add("a", 100, 1000, recorder(&log)).unwrap();
        uut.add("b", 200, 1000, recorder(&log)).unwrap();
        uut.add("later", 900, 1000, recorder(&log)).unwrap();

        let sweep = uut.sweep(500).unwrap();
        assert_eq!(sweep.fired, 3);
        assert!(sweep.next_expiry.unwrap() > 500);
        assert_eq!(sweep.next_expiry, Some(900));
        assert_eq!(
            *log.borrow(),
            entries(&[("a", 500), ("b", 500), ("c", 500)]),
        );
        for t in uut.tasks() {
            assert_eq!(t.state(), State::Armed);
        }
    }

    #[test]
    fn zero_interval_fires_once_per_sweep() {
        let log = Log::default();
        let mut uut = Scheduler::new();
        let id = uut.add("busy", 0, 0, recorder(&log)).unwrap();
        uut.add("other", 0, 50, recorder(&log)).unwrap();

        let sweep = uut.sweep(10).unwrap();
        assert_eq!(sweep.fired, 2);
        // Still due, and back in the heap for the next sweep.
        assert_eq!(sweep.next_expiry, Some(10));
        assert_eq!(uut.task(id).unwrap().state(), State::Armed);

        assert_eq!(uut.sweep(10).unwrap().fired, 1);
        assert_eq!(uut.sweep(20).unwrap().fired, 1);
        assert_eq!(uut.task(id).unwrap().fire_count(), 3);
        assert_eq!(
            *log.borrow(),
            entries(&[("busy", 10), ("other", 10), ("busy", 10), ("busy", 20)]),
        );
    }

    #[test]
    fn state_follows_the_firing_cycle() {
        let seen = RefCell::new(vec![]);
        let record = |t: &TimerTask| seen.borrow_mut().push(t.state());
        let mut uut = Scheduler::new();
        let busy = uut.add("busy", 0, 0, record).unwrap();
        let slow = uut.add("slow", 0, 10, record).unwrap();
        assert_eq!(uut.task(busy).unwrap().state(), State::Armed);

        uut.sweep(0).unwrap();
        assert_eq!(*seen.borrow(), [State::Firing, State::Firing]);
        // Both are back in the heap, the zero-interval one included.
        assert_eq!(uut.task(busy).unwrap().state(), State::Armed);
        assert_eq!(uut.task(slow).unwrap().state(), State::Armed);
        assert_eq!(uut.len(), 2);
    }

    #[test]
    fn held_tasks_are_restored_past_a_failure() {
        let mut uut = Scheduler::new();
        let a = uut.add("a", 0, 0, nop).unwrap();
        let b = uut.add("b", 0, 0, nop).unwrap();
        uut.heap.remove(b.node(), by_expiry(&uut.tasks)).unwrap();

        // `a` never left the heap, so putting it back fails; `b` must still
        // make it in.
        uut.held.extend([a, b]);
        let Scheduler {
            heap, tasks, held, ..
        } = &mut uut;
        assert_eq!(
            restore_held(heap, tasks, held),
            Err(HeapError::AlreadyQueued(a.node())),
        );
        assert!(held.is_empty());
        assert!(uut.heap.contains(b.node()));
        assert_eq!(uut.task(b).unwrap().state(), State::Armed);
        assert_eq!(uut.len(), 2);
    }

    #[test]
    fn action_sees_itself_firing() {
        let seen = RefCell::new(None);
        let mut uut = Scheduler::new();
        uut.add("self", 5, 10, |t: &TimerTask| {
            *seen.borrow_mut() =
                Some((t.state(), t.expiry(), t.last_fired(), t.fire_count()));
        })
        .unwrap();

        uut.sweep(7).unwrap();
        assert_eq!(*seen.borrow(), Some((State::Firing, 5, Some(7), 0)));
    }

    #[test]
    fn two_tasks_interleave() {
        let log = Log::default();
        let clock = SimClock::new(0);
        let mut uut = Scheduler::new();
        uut.add("A", clock.now_ms(), 2000, recorder(&log)).unwrap();
        uut.add("B", clock.now_ms() + 1000, 2000, recorder(&log)).unwrap();

        let stats = uut
            .run(&clock, Idle::Spin, |_| {
                clock.advance(100);
                clock.now_ms() < 5000
            })
            .unwrap();

        assert_eq!(
            *log.borrow(),
            entries(&[
                ("A", 0),
                ("B", 1000),
                ("A", 2000),
                ("B", 3000),
                ("A", 4000),
            ]),
        );
        assert_eq!(stats.sweeps, 50);
        assert_eq!(stats.fired, 5);
        // The last sweep (at 4900) ends the run before it can idle.
        assert_eq!(stats.idle_waits, 44);
    }

    #[test]
    fn sleeping_never_overshoots() {
        let log = Log::default();
        let clock = SimClock::new(0);
        let mut uut = Scheduler::new();
        uut.add("tick", 0, 1000, recorder(&log)).unwrap();
        uut.add("tock", 333, 1000, recorder(&log)).unwrap();

        uut.run(&clock, Idle::Sleep { max_ms: 250 }, |_| {
            log.borrow().len() < 6
        })
        .unwrap();

        assert_eq!(
            *log.borrow(),
            entries(&[
                ("tick", 0),
                ("tock", 333),
                ("tick", 1000),
                ("tock", 1333),
                ("tick", 2000),
                ("tock", 2333),
            ]),
        );
    }

    #[test]
    fn sleeping_with_nothing_armed_uses_max() {
        let clock = SimClock::new(0);
        let mut uut = Scheduler::new();
        let mut sweeps = 0;
        let stats = uut
            .run(&clock, Idle::Sleep { max_ms: 40 }, |_| {
                sweeps += 1;
                sweeps < 3
            })
            .unwrap();
        assert_eq!(stats.idle_waits, 2);
        assert_eq!(clock.now_ms(), 80);
    }

    #[test]
    fn cancelled_task_never_fires_again() {
        let log = Log::default();
        let mut uut = Scheduler::new();
        let a = uut.add("a", 0, 10, recorder(&log)).unwrap();
        uut.add("b", 0, 10, recorder(&log)).unwrap();

        uut.sweep(0).unwrap();
        assert_eq!(uut.cancel(a), Ok(true));
        assert_eq!(uut.cancel(a), Ok(false));
        assert_eq!(uut.task(a).unwrap().state(), State::Cancelled);
        assert_eq!(uut.len(), 1);

        uut.sweep(100).unwrap();
        assert_eq!(
            *log.borrow(),
            entries(&[("a", 0), ("b", 0), ("b", 100)]),
        );
        assert_eq!(uut.set_expiry(a, 5), Err(Error::Cancelled(a)));
    }

    #[test]
    fn unknown_task_is_an_error() {
        let mut other = Scheduler::new();
        other.add("x", 0, 0, nop).unwrap();
        let foreign = other.add("y", 0, 0, nop).unwrap();

        let mut uut = Scheduler::new();
        assert_eq!(uut.cancel(foreign), Err(Error::NoSuchTask(foreign)));
        assert_eq!(uut.set_expiry(foreign, 1), Err(Error::NoSuchTask(foreign)));
        assert!(uut.task(foreign).is_none());
    }

    #[test]
    fn set_expiry_reorders() {
        let log = Log::default();
        let mut uut = Scheduler::new();
        let a = uut.add("a", 100, 1000, recorder(&log)).unwrap();
        uut.add("b", 200, 1000, recorder(&log)).unwrap();

        uut.set_expiry(a, 300).unwrap();
        assert_eq!(uut.next_expiry(), Some(200));

        uut.sweep(250).unwrap();
        assert_eq!(*log.borrow(), entries(&[("b", 250)]));
        uut.sweep(300).unwrap();
        assert_eq!(*log.borrow(), entries(&[("b", 250), ("a", 300)]));
    }

    #[test]
    fn equal_expiries_both_fire() {
        let log = Log::default();
        let mut uut = Scheduler::new();
        uut.add("first", 50, 100, recorder(&log)).unwrap();
        uut.add("second", 50, 100, recorder(&log)).unwrap();

        assert_eq!(uut.sweep(50).unwrap().fired, 2);
        assert_eq!(log.borrow().len(), 2);
        assert_eq!(uut.next_expiry(), Some(150));
    }
}
