//! Frame validation rules applied at the transport boundary.

use ridelink_core::error::AppError;

/// Maximum allowed serialized payload size in bytes.
pub const MAX_FRAME_SIZE: usize = 65_536;

/// Maximum event name length.
const MAX_EVENT_NAME_LEN: usize = 64;

/// Validates a frame in either direction.
pub fn validate_frame(event: &str, payload: &serde_json::Value) -> Result<(), AppError> {
    validate_event_name(event)?;

    let size = serde_json::to_vec(payload).map(|bytes| bytes.len())?;
    if size > MAX_FRAME_SIZE {
        return Err(AppError::validation(format!(
            "Payload of {event} is {size} bytes, exceeding the {MAX_FRAME_SIZE} byte limit"
        )));
    }

    Ok(())
}

/// Validates event name format.
pub fn validate_event_name(event: &str) -> Result<(), AppError> {
    if event.is_empty() || event.len() > MAX_EVENT_NAME_LEN {
        return Err(AppError::validation("Invalid event name length"));
    }

    if !event
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':' || c == '-')
    {
        return Err(AppError::validation(
            "Event name contains invalid characters",
        ));
    }

    Ok(())
}
