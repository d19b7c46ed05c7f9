//! Convenience result type alias for RideLink.

use crate::error::AppError;

/// A specialized `Result` type for RideLink operations.
pub type AppResult<T> = Result<T, AppError>;
