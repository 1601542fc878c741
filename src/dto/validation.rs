//! Validation helpers for DTOs.

use validator::ValidationError;

/// Characters used in session codes: uppercase letters and digits without
/// the easily confused `0`, `1`, `I` and `O`.
pub const SESSION_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Longest accepted display name, in characters.
pub const MAX_DISPLAY_NAME_CHARS: usize = 32;

/// Validates that a session code uses only the session code alphabet and has a plausible length.
///
/// Codes are compared case-insensitively; callers normalise with [`normalize_session_code`].
///
/// # Examples
///
/// ```ignore
/// validate_session_code("K7WQ2M") // Ok
/// validate_session_code("K7WQ0M") // Err - `0` is not in the alphabet
/// validate_session_code("K7")     // Err - too short
/// ```
pub fn validate_session_code(code: &str) -> Result<(), ValidationError> {
    if !(4..=12).contains(&code.len()) {
        let mut err = ValidationError::new("session_code_length");
        err.message = Some(
            format!(
                "Session code must be between 4 and 12 characters (got {})",
                code.len()
            )
            .into(),
        );
        return Err(err);
    }

    if !code
        .bytes()
        .all(|b| SESSION_CODE_ALPHABET.contains(&b.to_ascii_uppercase()))
    {
        let mut err = ValidationError::new("session_code_format");
        err.message = Some("Session code contains characters outside the code alphabet".into());
        return Err(err);
    }

    Ok(())
}

/// Uppercase a user-typed session code.
pub fn normalize_session_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Validates a participant display name: non-blank and at most [`MAX_DISPLAY_NAME_CHARS`].
pub fn validate_display_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        let mut err = ValidationError::new("display_name_blank");
        err.message = Some("Display name must not be blank".into());
        return Err(err);
    }
    if name.chars().count() > MAX_DISPLAY_NAME_CHARS {
        let mut err = ValidationError::new("display_name_length");
        err.message =
            Some(format!("Display name must be at most {MAX_DISPLAY_NAME_CHARS} characters").into());
        return Err(err);
    }
    Ok(())
}
