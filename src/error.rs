//! Error types for process control

use std::io;
use thiserror::Error;

/// Errors surfaced by a controller or its terminator
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The caller-supplied transform rejected an output line
    #[error("Transform failed: {0}")]
    Transform(#[source] anyhow::Error),

    /// A signal could not be delivered
    #[error("Failed to signal process (PID: {pid}): {reason}")]
    Signal { pid: u32, reason: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ProcessError>;
