use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative cancellation shared between a caller and running traversals.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Time budget for a traversal. Checked cooperatively; never blocks.
#[derive(Debug, Clone)]
pub struct Deadline {
    started: Instant,
    expires_at: Option<Instant>,
    cancel: Option<CancellationFlag>,
}

impl Deadline {
    /// No time limit and no cancellation.
    pub fn none() -> Self {
        Self {
            started: Instant::now(),
            expires_at: None,
            cancel: None,
        }
    }

    pub fn after(budget: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            expires_at: started.checked_add(budget),
            cancel: None,
        }
    }

    /// `0` means unlimited, matching the config convention.
    pub fn from_millis(ms: u64) -> Self {
        if ms == 0 {
            Self::none()
        } else {
            Self::after(Duration::from_millis(ms))
        }
    }

    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn is_expired(&self) -> bool {
        if let Some(flag) = &self.cancel {
            if flag.is_cancelled() {
                return true;
            }
        }
        match self.expires_at {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}

/// Amortizes clock reads inside tight traversal loops.
#[derive(Debug)]
pub struct DeadlineProbe<'a> {
    deadline: &'a Deadline,
    counter: u32,
    every: u32,
}

impl<'a> DeadlineProbe<'a> {
    pub fn new(deadline: &'a Deadline) -> Self {
        Self {
            deadline,
            counter: 0,
            every: 64,
        }
    }

    /// True once the deadline has passed. The first call always checks.
    pub fn expired(&mut self) -> bool {
        let check = self.counter % self.every == 0;
        self.counter = self.counter.wrapping_add(1);
        check && self.deadline.is_expired()
    }
}
