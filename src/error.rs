//! Error type for surface jobs.

use std::fmt;

/// Error produced by a surface job run.
///
/// Cancellation is a normal, expected outcome rather than an exceptional
/// one; callers distinguish it from success by this value alone and must
/// not expect any partial mesh to survive it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceError {
    /// Cancellation was requested through the run context.
    Interrupted,
}

impl fmt::Display for SurfaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SurfaceError::Interrupted => write!(f, "surface job interrupted"),
        }
    }
}

impl std::error::Error for SurfaceError {}
