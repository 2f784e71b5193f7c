//! Concord Common - Shared Types and Utilities
//!
//! Foundational types, error handling, and configuration shared by the
//! Concord synchronization crates. Keeps identifiers, error classification
//! and configuration loading consistent between the consensus, gossip and
//! CRDT layers.
//!
//! Key Features:
//! - Unified error type with retryable and fatal classification
//! - Node identifiers shared by every protocol
//! - TOML-loadable configuration for Raft, gossip, CRDTs and logging
//! - Time and quorum helpers
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

pub mod config;
pub mod error;
pub mod types;
pub mod utils;

pub use error::{Result, SyncError, TransportError};
pub use types::*;
