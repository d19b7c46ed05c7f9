//! # ridelink-core
//!
//! Core crate for the RideLink real-time channel. Contains configuration
//! schemas, the persistence trait, and the unified error system.
//!
//! This crate has **no** internal dependencies on other RideLink crates.

pub mod config;
pub mod error;
pub mod result;
pub mod traits;

pub use error::{AppError, ErrorKind};
pub use result::AppResult;
