//! ArrayShift core library
//!
//! Shared building blocks for the ArrayShift disk rebalancer:
//! - Data model (disks, allocation units, moves, plans)
//! - Byte-size parsing and formatting
//! - Common error types

pub mod bytes;
pub mod error;
pub mod types;

// Re-export main types
pub use bytes::{format_bytes, parse_size};
pub use error::{CoreError, Result};
pub use types::{
    AllocationUnit, Disk, Move, MoveStatus, Plan, PlanOptions, RsyncMode, Strategy,
};
