//! Configuration inspection command.

use ridelink_core::config::AppConfig;
use ridelink_core::error::AppError;

/// Print the merged configuration as JSON.
pub fn execute(config: &AppConfig) -> Result<(), AppError> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
