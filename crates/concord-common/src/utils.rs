//! Concord Utils - Utility Functions
//!
//! Wall-clock and quorum helpers used across the synchronization kernel.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use std::time::{SystemTime, UNIX_EPOCH};

// =============================================================================
// Time
// =============================================================================

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Quorum
// =============================================================================

/// Votes needed for a strict majority of a cluster with `cluster_size` voters.
#[inline]
pub const fn quorum_size(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}

// =============================================================================
// Tests
// =============================================================================
