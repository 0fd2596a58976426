//! Application lifecycle flag
//!
//! Script coroutines read this when they are about to resume: once the host
//! has left the running state they unwind instead of continuing.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AppStatus {
    Starting = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl AppStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => AppStatus::Starting,
            1 => AppStatus::Running,
            2 => AppStatus::Stopping,
            _ => AppStatus::Stopped,
        }
    }
}

static GLOBAL: Lazy<Lifecycle> = Lazy::new(|| Lifecycle::new(AppStatus::Starting));

/// Shared handle to a status value.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    status: Arc<AtomicU8>,
}

impl Lifecycle {
    pub fn new(status: AppStatus) -> Self {
        Self {
            status: Arc::new(AtomicU8::new(status as u8)),
        }
    }

    /// The process-wide lifecycle. Starts in [`AppStatus::Starting`].
    pub fn global() -> Lifecycle {
        GLOBAL.clone()
    }

    pub fn status(&self) -> AppStatus {
        AppStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: AppStatus) {
        let previous = AppStatus::from_u8(self.status.swap(status as u8, Ordering::AcqRel));
        if previous != status {
            tracing::debug!(?previous, ?status, "application status changed");
        }
    }

    pub fn is_running(&self) -> bool {
        self.status() == AppStatus::Running
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new(AppStatus::Running)
    }
}
