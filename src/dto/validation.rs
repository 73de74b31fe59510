//! Validation helpers for DTOs.

use validator::ValidationError;

use crate::state::room::RoomCode;

/// Validates that a room code normalises to a valid [`RoomCode`].
///
/// # Examples
///
/// ```ignore
/// validate_room_code("r1-beta")   // Ok
/// validate_room_code("  ")        // Err - empty
/// validate_room_code("room/1")    // Err - invalid character
/// ```
pub fn validate_room_code(raw: &str) -> Result<(), ValidationError> {
    RoomCode::parse(raw).map(|_| ()).map_err(|invalid| {
        let mut err = ValidationError::new("room_code");
        err.message = Some(invalid.to_string().into());
        err
    })
}
