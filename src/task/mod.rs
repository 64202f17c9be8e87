//! # Task Module
//!
//! Per-transport lanes scheduled onto an external executor. A lane never
//! runs concurrently with itself; distinct lanes of one transport may run
//! in parallel.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use tracing::trace;

/// Runs submitted jobs, typically on a thread pool
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, job: Box<dyn FnOnce() + Send + 'static>);
}

impl Executor for tokio::runtime::Handle {
    fn execute(&self, job: Box<dyn FnOnce() + Send + 'static>) {
        self.spawn(async move { job() });
    }
}

const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const RUNNING: u8 = 2;
const RESCHEDULED: u8 = 3;

/// Schedule-if-not-already-scheduled cell for one lane of `T`.
///
/// The cell refers to its target weakly; a submitted job holds the target
/// strongly until it finishes.
pub struct TaskCell<T: Send + Sync + 'static> {
    state: AtomicU8,
    target: Weak<T>,
    run: fn(&T),
    executor: Arc<dyn Executor>,
}

impl<T: Send + Sync + 'static> TaskCell<T> {
    /// Create a cell running `run` on `target`
    pub fn new(target: Weak<T>, run: fn(&T), executor: Arc<dyn Executor>) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(IDLE),
            target,
            run,
            executor,
        })
    }

    /// Ensure the lane runs at least once after this call.
    ///
    /// Returns true if a job was submitted to the executor.
    pub fn cue(self: &Arc<Self>) -> bool {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            let next = match state {
                IDLE => SCHEDULED,
                RUNNING => RESCHEDULED,
                _ => return false,
            };
            match self
                .state
                .compare_exchange_weak(state, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) if next == SCHEDULED => return self.submit(),
                Ok(_) => return false,
                Err(actual) => state = actual,
            }
        }
    }

    /// Check if the lane is queued or running
    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) != IDLE
    }

    fn submit(self: &Arc<Self>) -> bool {
        match self.target.upgrade() {
            Some(target) => {
                let cell = Arc::clone(self);
                self.executor.execute(Box::new(move || cell.run(target)));
                true
            }
            None => {
                self.state.store(IDLE, Ordering::Release);
                false
            }
        }
    }

    fn run(self: Arc<Self>, target: Arc<T>) {
        self.state.store(RUNNING, Ordering::Release);
        // A panic here is fatal for the lane: the state stays RUNNING and
        // later cues only mark it rescheduled.
        (self.run)(&target);
        drop(target);
        if self
            .state
            .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!("lane cued while running, resubmitting");
            self.state.store(SCHEDULED, Ordering::Release);
            self.submit();
        }
    }
}
