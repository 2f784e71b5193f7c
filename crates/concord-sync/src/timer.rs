//! Concord Timer
//!
//! One cancellable deadline per timer role. Re-arming replaces the deadline,
//! so a role never has more than one pending expiry.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Default)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Resolves at `deadline`; never resolves for a disarmed timer.
///
/// Takes the deadline by value so a `select!` branch does not hold a borrow
/// of the timer while the handlers re-arm it.
pub async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
