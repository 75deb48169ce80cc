use crate::error::GuardTripped;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Run-wide abort conditions, polled between items and before every dispatch.
#[derive(Debug, Clone)]
pub struct RunGuards {
    started: Instant,
    deadline: Option<Duration>,
    parent_pid: Option<u32>,
    cancel: Arc<AtomicBool>,
}

impl Default for RunGuards {
    fn default() -> Self {
        Self::new()
    }
}

impl RunGuards {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            deadline: None,
            parent_pid: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Records the pid expected as our parent; once reparented the run aborts.
    pub fn with_parent_pid(mut self, parent_pid: Option<u32>) -> Self {
        self.parent_pid = parent_pid;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn check(&self) -> Result<(), GuardTripped> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(GuardTripped::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if self.started.elapsed() >= deadline {
                return Err(GuardTripped::Deadline(deadline));
            }
        }
        if let Some(expected) = self.parent_pid {
            if current_parent_pid() != expected {
                return Err(GuardTripped::ParentExited(expected));
            }
        }
        Ok(())
    }
}

pub fn current_parent_pid() -> u32 {
    // SAFETY: getppid has no preconditions and cannot fail.
    let ppid = unsafe { libc::getppid() };
    ppid as u32
}
