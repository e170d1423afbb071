//! Scheduling policies and the cooperative worker machinery.
//!
//! Two policies drive stepping:
//!
//! - **task-neutral** (the default): the caller of `run` owns a single
//!   logical worker and loops over `step`, waiting on the process condvar
//!   when nothing is runnable;
//! - **cooperative**: multiple worker threads call `run` and share a
//!   counting semaphore of available work. Enqueues and halts signal the
//!   semaphore; `stop` wakes every waiting worker and waits for the last
//!   one to depart.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

/// Maximum count of the scheduler semaphores.
const SEMAPHORE_MAX: u32 = 32_767;

/// How workers are driven.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingPolicy {
    /// A single caller drives stepping synchronously.
    TaskNeutral,
    /// Worker threads block on a semaphore until enqueues make work
    /// available.
    Cooperative,
}

/// The result of one `step` call on a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepResult {
    /// The process is terminating; the worker should return.
    Terminating,
    /// No machine had admissible work.
    Idle,
    /// A machine was stepped; more work may be pending.
    More,
}

/// A counting semaphore with a bounded count.
pub(crate) struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
    max: u32,
}

impl Semaphore {
    pub fn new(initial: u32, max: u32) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
            max,
        }
    }

    /// Blocks until the count is positive, then decrements it.
    pub fn acquire(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    /// Increments the count, saturating at the maximum, and wakes one
    /// waiter.
    pub fn release(&self) {
        let mut count = self.count.lock();
        if *count < self.max {
            *count += 1;
        }
        drop(count);
        self.cond.notify_one();
    }
}

/// The cooperative policy's shared state. The `threads_waiting` counter
/// lives under the process lock, as the scheduler protocol requires it to
/// change together with the terminating flag.
pub(crate) struct CooperativeScheduler {
    /// Signalled once per enqueue or halt; workers block here when idle.
    pub work_available: Semaphore,
    /// Signalled by the last waiting worker to depart during termination.
    pub all_threads_stopped: Semaphore,
}

impl CooperativeScheduler {
    pub fn new() -> Self {
        Self {
            work_available: Semaphore::new(0, SEMAPHORE_MAX),
            all_threads_stopped: Semaphore::new(0, SEMAPHORE_MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_release_before_acquire_persists() {
        let sem = Semaphore::new(0, 4);
        sem.release();
        sem.release();
        // Both permits are banked; acquires do not block.
        sem.acquire();
        sem.acquire();
    }

    #[test]
    fn test_release_saturates_at_max() {
        let sem = Semaphore::new(0, 1);
        sem.release();
        sem.release();
        sem.acquire();
        // A second acquire would block: the count saturated at 1.
        assert_eq!(*sem.count.lock(), 0);
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let sem = Arc::new(Semaphore::new(0, SEMAPHORE_MAX));
        let waiter = {
            let sem = sem.clone();
            thread::spawn(move || {
                sem.acquire();
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        sem.release();
        waiter.join().unwrap();
    }

    #[test]
    fn test_wakes_multiple_waiters() {
        let sem = Arc::new(Semaphore::new(0, SEMAPHORE_MAX));
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let sem = sem.clone();
                thread::spawn(move || sem.acquire())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        sem.release();
        sem.release();
        for waiter in waiters {
            waiter.join().unwrap();
        }
    }
}
