// SPDX-FileCopyrightText: Copyright © 2020-2025 The Anvil Authors
//
// SPDX-License-Identifier: MPL-2.0

//! Parallel threads with cooperative helper promotion. A bounded number of
//! threads are "active" at once (`max_active`); a thread that blocks in
//! [`Scheduler::wait`] releases its active slot so a parked helper (or a
//! thread waiting to re-enter the active set) can take its place, up to
//! `max_threads` total OS threads.
//!
//! This intentionally is not a general-purpose work-stealing pool -- no
//! `rayon`, no `tokio` -- because the semantics we need (an active-thread
//! cap independent of queue depth, collision-tolerant wait slots, recursive
//! waiting from within a task) don't map onto either of those crates'
//! public surface. Plain `std::thread` + `Mutex`/`Condvar` is the idiom the
//! rest of this corpus reaches for when it needs this kind of low-level
//! concurrency primitive.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

/// A schedulable unit of work.
type Task = Box<dyn FnOnce() + Send + 'static>;

/// Per-(target, action) progress counters are plain `Arc<AtomicI64>`s;
/// [`Scheduler::wait`] blocks until one drops to (or below) a caller-given
/// threshold.
pub type Counter = Arc<AtomicI64>;

const QUEUE_DEPTH: usize = 256;
const WAIT_SLOTS: usize = 64;
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("scheduler shut down")]
pub struct Cancelled;

struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
}

impl TaskQueue {
    fn new() -> Self {
        TaskQueue {
            tasks: Mutex::new(VecDeque::new()),
        }
    }

    fn push(&self, task: Task) -> Result<(), Task> {
        let mut q = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if q.len() >= QUEUE_DEPTH {
            return Err(task);
        }
        q.push_back(task);
        Ok(())
    }

    fn pop(&self) -> Option<Task> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    fn pop_back(&self) -> Option<Task> {
        // Helper threads steal from the *back* of someone else's queue so
        // the owner, popping from the front, rarely collides with a
        // stealer.
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).pop_back()
    }
}

/// One of the `WAIT_SLOTS` buckets threads parked in [`Scheduler::wait`]
/// hash onto. Collisions between distinct counters are harmless: every
/// wake re-checks the real counter under the slot mutex before deciding
/// whether to actually resume.
struct WaitSlot {
    mutex: Mutex<()>,
    cv: Condvar,
    waiters: AtomicUsize,
}

impl WaitSlot {
    fn new() -> Self {
        WaitSlot {
            mutex: Mutex::new(()),
            cv: Condvar::new(),
            waiters: AtomicUsize::new(0),
        }
    }
}

thread_local! {
    static MY_QUEUE: std::cell::RefCell<Option<Arc<TaskQueue>>> = const { std::cell::RefCell::new(None) };
    /// Whether the current OS thread currently occupies one of the
    /// scheduler's `max_active` slots. Helper threads set this once
    /// [`Scheduler::try_take_active_slot`] succeeds in `helper_loop` and
    /// clear it when they give the slot back. Any other thread driving the
    /// engine directly (the process's initiating thread, or a test calling
    /// `wait` from its own stack) never goes through `helper_loop`, so it
    /// starts out not holding a slot -- [`Scheduler::wait`] acquires one on
    /// its behalf before releasing it to park, keeping the accounting
    /// balanced instead of decrementing a count it never incremented.
    static HOLDS_SLOT: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// The thread pool.
pub struct Scheduler {
    max_threads: usize,
    max_active: AtomicUsize,
    active_count: AtomicUsize,
    spawned: AtomicUsize,
    queues: Mutex<Vec<Arc<TaskQueue>>>,
    wait_slots: Vec<WaitSlot>,
    /// Parked helper threads wait here for "there might be work now".
    work_available: Condvar,
    work_mutex: Mutex<()>,
    /// Threads that incremented past `max_active` and must wait their turn
    /// to actually run wait here.
    ready: Condvar,
    ready_mutex: Mutex<()>,
    shutdown: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(max_threads: usize, max_active: usize) -> Arc<Self> {
        let max_active = max_active.max(1);
        let max_threads = max_threads.max(max_active);

        let wait_slots = (0..WAIT_SLOTS).map(|_| WaitSlot::new()).collect();

        Arc::new(Scheduler {
            max_threads,
            max_active: AtomicUsize::new(max_active),
            active_count: AtomicUsize::new(0),
            spawned: AtomicUsize::new(0),
            queues: Mutex::new(Vec::new()),
            wait_slots,
            work_available: Condvar::new(),
            work_mutex: Mutex::new(()),
            ready: Condvar::new(),
            ready_mutex: Mutex::new(()),
            shutdown: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::Acquire)
    }

    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::Acquire)
    }

    /// Lower (or raise) the active cap. Busy-waits (bounded by polling, not
    /// a true spin) until the system quiesces at or below the new cap
    /// before applying it when lowering.
    pub fn tune(self: &Arc<Self>, new_max_active: usize) {
        let new_max_active = new_max_active.max(1).min(self.max_threads);
        if new_max_active < self.max_active() {
            while self.active_count() > new_max_active && !self.shutdown.load(Ordering::Acquire) {
                thread::sleep(POLL_INTERVAL);
            }
        }
        self.max_active.store(new_max_active, Ordering::Release);
        self.ready.notify_all();
        self.work_available.notify_all();
    }

    fn queue_for_current_thread(self: &Arc<Self>) -> Arc<TaskQueue> {
        MY_QUEUE.with(|cell| {
            if let Some(q) = cell.borrow().as_ref() {
                return q.clone();
            }
            let q = Arc::new(TaskQueue::new());
            self.queues.lock().unwrap_or_else(|e| e.into_inner()).push(q.clone());
            *cell.borrow_mut() = Some(q.clone());
            q
        })
    }

    fn slot_index(&self, counter: &Counter) -> usize {
        let addr = Arc::as_ptr(counter) as usize;
        (addr >> 4) % self.wait_slots.len()
    }

    fn notify_slot(&self, counter: &Counter) {
        let slot = &self.wait_slots[self.slot_index(counter)];
        let _guard = slot.mutex.lock().unwrap_or_else(|e| e.into_inner());
        slot.cv.notify_all();
    }

    /// Enqueue `f` on the calling thread's queue, incrementing `counter`
    /// first so a concurrent `wait` never observes a false "done" (spec
    /// §4.6: "`async(task-count, fn, args...)` ... increments the
    /// task-count"). On queue overflow, runs inline immediately.
    pub fn spawn(self: &Arc<Self>, counter: &Counter, f: impl FnOnce() + Send + 'static) {
        counter.fetch_add(1, Ordering::AcqRel);

        let scheduler = self.clone();
        let counter = counter.clone();
        let wrapped: Task = Box::new(move || {
            f();
            counter.fetch_sub(1, Ordering::AcqRel);
            scheduler.notify_slot(&counter);
        });

        let queue = self.queue_for_current_thread();
        match queue.push(wrapped) {
            Ok(()) => {
                self.ensure_helper();
                let _guard = self.work_mutex.lock().unwrap_or_else(|e| e.into_inner());
                self.work_available.notify_one();
            }
            Err(task) => task(),
        }
    }

    /// Spawn a new helper thread if we're below `max_threads` and there is
    /// no idle capacity already servicing queues.
    fn ensure_helper(self: &Arc<Self>) {
        loop {
            let spawned = self.spawned.load(Ordering::Acquire);
            if spawned >= self.max_threads {
                return;
            }
            if self
                .spawned
                .compare_exchange(spawned, spawned + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        let scheduler = self.clone();
        let handle = thread::spawn(move || scheduler.helper_loop());
        self.handles.lock().unwrap_or_else(|e| e.into_inner()).push(handle);
    }

    fn try_take_active_slot(&self) -> bool {
        loop {
            let current = self.active_count.load(Ordering::Acquire);
            if current >= self.max_active() {
                return false;
            }
            if self
                .active_count
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Block (polling the `ready` condvar) until the calling thread holds an
    /// active slot, if it doesn't already. No-op for helper threads, which
    /// already hold one by the time they run a task; load-bearing for any
    /// thread calling [`Scheduler::wait`] without ever having gone through
    /// `helper_loop`.
    fn ensure_active_slot(self: &Arc<Self>) {
        if HOLDS_SLOT.with(|h| h.get()) {
            return;
        }
        while !self.try_take_active_slot() {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            let guard = self.ready_mutex.lock().unwrap_or_else(|e| e.into_inner());
            let _ = self.ready.wait_timeout(guard, POLL_INTERVAL);
        }
        HOLDS_SLOT.with(|h| h.set(true));
    }

    /// Steal one task from any registered queue.
    fn steal_one(&self) -> Option<Task> {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for q in queues.iter() {
            if let Some(t) = q.pop_back() {
                return Some(t);
            }
        }
        None
    }

    fn helper_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            if !self.try_take_active_slot() {
                let guard = self.ready_mutex.lock().unwrap_or_else(|e| e.into_inner());
                let _ = self.ready.wait_timeout(guard, POLL_INTERVAL);
                continue;
            }
            HOLDS_SLOT.with(|h| h.set(true));
            // We hold an active slot: drain whatever work exists, then give
            // it back and park until there's more.
            loop {
                if self.shutdown.load(Ordering::Acquire) {
                    self.active_count.fetch_sub(1, Ordering::AcqRel);
                    HOLDS_SLOT.with(|h| h.set(false));
                    return;
                }
                match self.steal_one() {
                    Some(task) => task(),
                    None => break,
                }
            }
            self.active_count.fetch_sub(1, Ordering::AcqRel);
            HOLDS_SLOT.with(|h| h.set(false));
            self.ready.notify_one();

            let guard = self.work_mutex.lock().unwrap_or_else(|e| e.into_inner());
            let _ = self.work_available.wait_timeout(guard, POLL_INTERVAL);
        }
    }

    /// Drain and run the calling thread's own queue inline, without
    /// touching the active-count bookkeeping. The caller does this first to
    /// help make progress before parking.
    fn drain_own_queue(self: &Arc<Self>) {
        let queue = self.queue_for_current_thread();
        while let Some(task) = queue.pop() {
            task();
        }
    }

    /// Block until `counter <= start_count` or the scheduler is shut down.
    /// Releases this thread's active slot for the duration so a helper can
    /// make progress, then re-acquires one (or waits its turn if
    /// oversubscribed) before returning.
    pub fn wait(self: &Arc<Self>, start_count: i64, counter: &Counter) -> Result<(), Cancelled> {
        if counter.load(Ordering::Acquire) <= start_count {
            return Ok(());
        }

        self.drain_own_queue();
        if counter.load(Ordering::Acquire) <= start_count {
            return Ok(());
        }

        // About to release our active slot and park: make sure we actually
        // hold one first. Helper threads always do by this point; a thread
        // driving the engine directly (e.g. the process's main thread) does
        // not, and releasing a slot it never took would underflow
        // `active_count` and wedge every future helper promotion.
        self.ensure_active_slot();
        if !HOLDS_SLOT.with(|h| h.get()) {
            // ensure_active_slot gave up because of a concurrent shutdown
            // before it could take a slot; nothing to release.
            return Err(Cancelled);
        }

        self.active_count.fetch_sub(1, Ordering::AcqRel);
        HOLDS_SLOT.with(|h| h.set(false));
        self.ready.notify_one();
        {
            let _guard = self.work_mutex.lock().unwrap_or_else(|e| e.into_inner());
            self.work_available.notify_one();
        }

        let slot = &self.wait_slots[self.slot_index(counter)];
        slot.waiters.fetch_add(1, Ordering::AcqRel);
        let result = (|| {
            let mut guard = slot.mutex.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if self.shutdown.load(Ordering::Acquire) {
                    return Err(Cancelled);
                }
                if counter.load(Ordering::Acquire) <= start_count {
                    return Ok(());
                }
                // Help while parked: drain our own queue between wakeups
                // too, in case new work landed on it via a recursive call.
                drop(guard);
                self.drain_own_queue();
                if counter.load(Ordering::Acquire) <= start_count {
                    return Ok(());
                }
                guard = slot.mutex.lock().unwrap_or_else(|e| e.into_inner());
                let (g, _timeout) = slot.cv.wait_timeout(guard, POLL_INTERVAL).unwrap_or_else(|e| e.into_inner());
                guard = g;
            }
        })();
        slot.waiters.fetch_sub(1, Ordering::AcqRel);

        // Re-enter the active set, waiting our turn if oversubscribed.
        while !self.try_take_active_slot() {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(Cancelled);
            }
            let guard = self.ready_mutex.lock().unwrap_or_else(|e| e.into_inner());
            let _ = self.ready.wait_timeout(guard, POLL_INTERVAL);
        }
        HOLDS_SLOT.with(|h| h.set(true));

        result
    }

    /// Flip the shutdown flag, wake every waiter, and join in-flight helper
    /// threads.
    pub fn shutdown(self: &Arc<Self>) {
        self.shutdown.store(true, Ordering::Release);
        for slot in &self.wait_slots {
            let _guard = slot.mutex.lock().unwrap_or_else(|e| e.into_inner());
            slot.cv.notify_all();
        }
        self.ready.notify_all();
        self.work_available.notify_all();

        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        for h in handles {
            let _ = h.join();
        }
    }
}

/// Convenience: a fresh, zeroed counter for a new (target, action) wait
/// group.
pub fn new_counter() -> Counter {
    Arc::new(AtomicI64::new(0))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::time::Duration as StdDuration;

    #[test]
    fn serial_scheduler_with_max_active_one_runs_tasks() {
        let scheduler = Scheduler::new(1, 1);
        let counter = new_counter();
        let ran = Arc::new(StdAtomicUsize::new(0));
        let r = ran.clone();
        scheduler.spawn(&counter, move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.wait(0, &counter).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        scheduler.shutdown();
    }

    #[test]
    fn wait_already_satisfied_returns_immediately() {
        let scheduler = Scheduler::new(2, 2);
        let counter = new_counter();
        scheduler.wait(0, &counter).unwrap();
        scheduler.shutdown();
    }

    #[test]
    fn helper_promotion_completes_fanned_out_tasks() {
        // Spec §8 S5: with max_active = 2, two tasks each waiting on two
        // child tasks must not deadlock.
        let scheduler = Scheduler::new(8, 2);
        let done = Arc::new(StdAtomicUsize::new(0));

        let parent_counter = new_counter();
        for _ in 0..2 {
            let scheduler2 = scheduler.clone();
            let done2 = done.clone();
            scheduler.spawn(&parent_counter, move || {
                let child_counter = new_counter();
                for _ in 0..2 {
                    let done3 = done2.clone();
                    scheduler2.spawn(&child_counter, move || {
                        done3.fetch_add(1, Ordering::SeqCst);
                    });
                }
                scheduler2.wait(0, &child_counter).unwrap();
            });
        }

        scheduler.wait(0, &parent_counter).unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 4);
        scheduler.shutdown();
    }

    #[test]
    fn shutdown_wakes_waiters() {
        let scheduler = Scheduler::new(2, 1);
        let counter = new_counter();
        counter.fetch_add(1, Ordering::SeqCst); // never satisfied

        let scheduler2 = scheduler.clone();
        let handle = thread::spawn(move || scheduler2.wait(0, &counter));

        thread::sleep(StdDuration::from_millis(50));
        scheduler.shutdown();

        let result = handle.join().unwrap();
        assert_eq!(result, Err(Cancelled));
    }
}
