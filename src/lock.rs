//! Cooperative, priority-stacking re-entrant lock.
//!
//! Every thread that wants the guarded value registers on a stack. High
//! priority registrations are stacked above all low priority ones, so a
//! foreground request is served before any queued background crawler, while
//! both contend for the same single lock. A thread that already holds the
//! lock re-enters without touching the stack.
//!
//! Nothing is ever interrupted: background holders poll
//! [`StackingLock::has_waiting_high`] between units of work and release
//! voluntarily (see [`StackingGuard::yield_to_high`]).

use parking_lot::{Condvar, Mutex, ReentrantMutex, ReentrantMutexGuard};
use std::ops::Deref;
use std::thread::{self, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Low,
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    thread: ThreadId,
    priority: Priority,
}

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: usize,
    /// Index 0 is the top of the stack.
    stack: Vec<Registration>,
}

impl LockState {
    fn register(&mut self, reg: Registration) {
        match reg.priority {
            Priority::High => {
                let pos = self
                    .stack
                    .iter()
                    .position(|r| r.priority == Priority::Low)
                    .unwrap_or(self.stack.len());
                self.stack.insert(pos, reg);
            }
            Priority::Low => self.stack.push(reg),
        }
    }

    fn is_turn_of(&self, me: ThreadId) -> bool {
        self.owner.is_none() && self.stack.first().map(|r| r.thread) == Some(me)
    }
}

pub struct StackingLock<T> {
    state: Mutex<LockState>,
    cond: Condvar,
    data: ReentrantMutex<T>,
}

impl<T> StackingLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            cond: Condvar::new(),
            data: ReentrantMutex::new(value),
        }
    }

    /// Block until this thread owns the lock. Re-entrant per thread.
    pub fn lock(&self, priority: Priority) -> StackingGuard<'_, T> {
        let me = thread::current().id();
        {
            let mut state = self.state.lock();
            if state.owner == Some(me) {
                state.depth += 1;
            } else {
                state.register(Registration {
                    thread: me,
                    priority,
                });
                while !state.is_turn_of(me) {
                    self.cond.wait(&mut state);
                }
                state.stack.remove(0);
                state.owner = Some(me);
                state.depth = 1;
            }
        }
        StackingGuard {
            lock: self,
            inner: Some(self.data.lock()),
            priority,
        }
    }

    pub fn lock_high(&self) -> StackingGuard<'_, T> {
        self.lock(Priority::High)
    }

    pub fn lock_low(&self) -> StackingGuard<'_, T> {
        self.lock(Priority::Low)
    }

    /// True when a high priority registrant is waiting for the lock.
    pub fn has_waiting_high(&self) -> bool {
        self.state
            .lock()
            .stack
            .iter()
            .any(|r| r.priority == Priority::High)
    }

    pub fn waiting_count(&self) -> usize {
        self.state.lock().stack.len()
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.owner = None;
            self.cond.notify_all();
        }
    }
}

pub struct StackingGuard<'a, T> {
    lock: &'a StackingLock<T>,
    inner: Option<ReentrantMutexGuard<'a, T>>,
    priority: Priority,
}

impl<'a, T> StackingGuard<'a, T> {
    /// Release and re-register if a high priority registrant is waiting.
    /// Only the outermost guard of a thread can actually step aside.
    pub fn yield_to_high(self) -> StackingGuard<'a, T> {
        let lock = self.lock;
        let priority = self.priority;
        if !lock.has_waiting_high() {
            return self;
        }
        let outermost = lock.state.lock().depth == 1;
        if !outermost {
            return self;
        }
        drop(self);
        lock.lock(priority)
    }
}

impl<T> Deref for StackingGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.inner {
            Some(guard) => guard,
            None => unreachable!("guard used after release"),
        }
    }
}

impl<T> Drop for StackingGuard<'_, T> {
    fn drop(&mut self) {
        drop(self.inner.take());
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;

    fn wait_for_waiters(lock: &StackingLock<()>, n: usize) {
        for _ in 0..500 {
            if lock.waiting_count() == n {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("expected {} waiters, found {}", n, lock.waiting_count());
    }

    #[test]
    fn test_reentrant_on_same_thread() {
        let lock = StackingLock::new(5);
        let outer = lock.lock_low();
        let inner = lock.lock_high();
        assert_eq!(*inner, 5);
        drop(inner);
        assert!(lock.is_held());
        drop(outer);
        assert!(!lock.is_held());
    }

    #[test]
    fn test_high_priority_served_before_queued_low() {
        let lock = Arc::new(StackingLock::new(()));
        let order = Arc::new(StdMutex::new(Vec::new()));

        let holder = lock.lock_low();

        let low = {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            thread::spawn(move || {
                let _g = lock.lock_low();
                order.lock().unwrap().push("low");
            })
        };
        wait_for_waiters(&lock, 1);

        let high = {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            thread::spawn(move || {
                let _g = lock.lock_high();
                order.lock().unwrap().push("high");
            })
        };
        wait_for_waiters(&lock, 2);
        assert!(lock.has_waiting_high());

        drop(holder);
        low.join().unwrap();
        high.join().unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    }

    #[test]
    fn test_yield_to_high_steps_aside() {
        let lock = Arc::new(StackingLock::new(()));
        let order = Arc::new(StdMutex::new(Vec::new()));

        let guard = lock.lock_low();
        let high = {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            thread::spawn(move || {
                let _g = lock.lock_high();
                order.lock().unwrap().push("high");
            })
        };
        wait_for_waiters(&lock, 1);

        let guard = guard.yield_to_high();
        order.lock().unwrap().push("background");
        drop(guard);
        high.join().unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["high", "background"]);
    }
}
