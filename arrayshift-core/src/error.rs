//! Error types shared across ArrayShift crates.

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors produced by the core data model
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid size: {0}")]
    InvalidSize(String),

    #[error("Unknown unit in size: {0}")]
    UnknownSizeUnit(String),

    #[error("Invalid unit path {path:?}: {reason}")]
    InvalidUnitPath { path: String, reason: String },

    #[error("Unknown strategy: {0} (expected 'size' or 'low_space_first')")]
    UnknownStrategy(String),

    #[error("Unknown rsync mode: {0} (expected 'fast', 'balanced' or 'integrity')")]
    UnknownRsyncMode(String),

    #[error("Disk accounting underflow on {disk}: cannot shed {delta} from {used} used bytes")]
    AccountingUnderflow { disk: String, used: u64, delta: u64 },
}
