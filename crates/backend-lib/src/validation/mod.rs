// ============================
// crates/backend-lib/src/validation/mod.rs
// ============================
//! Message validation module.
//!
//! Everything a client sends is checked here before it reaches a room actor.

use meetroom_common::{ClientMessage, IceCandidate};
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

// Common validation constants
const MAX_ROOM_ID_LENGTH: usize = 64;
const MAX_PARTICIPANT_ID_LENGTH: usize = 64;
const MAX_DISPLAY_NAME_LENGTH: usize = 100;
const MAX_PASSWORD_LENGTH: usize = 128;
const MAX_SDP_LENGTH: usize = 64 * 1024;
const MAX_CANDIDATE_LENGTH: usize = 1024;

// Regex patterns for validation
static ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("static regex"));
static DISPLAY_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^<>/\\{}\[\];]*$").expect("static regex"));

/// Possible validation errors
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Invalid room ID: {0}")]
    InvalidRoomId(String),

    #[error("Invalid participant ID: {0}")]
    InvalidParticipantId(String),

    #[error("Invalid display name: {0}")]
    InvalidDisplayName(String),

    #[error("Invalid password: {0}")]
    InvalidPassword(String),

    #[error("Invalid session description: {0}")]
    InvalidSdp(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),
}

/// Result type for validation operations
pub type ValidationResult<T> = Result<T, ValidationError>;

fn validate_id(id: &str, max: usize) -> Result<&str, String> {
    if id.is_empty() {
        return Err("must not be empty".to_string());
    }
    if id.len() > max {
        return Err(format!("must be at most {max} characters"));
    }
    if !ID_REGEX.is_match(id) {
        return Err("must contain only alphanumeric characters, '-' and '_'".to_string());
    }
    Ok(id)
}

/// Validate a room ID
pub fn validate_room_id(room_id: &str) -> ValidationResult<&str> {
    validate_id(room_id, MAX_ROOM_ID_LENGTH).map_err(ValidationError::InvalidRoomId)
}

/// Validate a participant ID
pub fn validate_participant_id(participant_id: &str) -> ValidationResult<&str> {
    validate_id(participant_id, MAX_PARTICIPANT_ID_LENGTH)
        .map_err(ValidationError::InvalidParticipantId)
}

/// Validate a display name
pub fn validate_display_name(name: &str) -> ValidationResult<&str> {
    if name.trim().is_empty() {
        return Err(ValidationError::InvalidDisplayName(
            "Display name must not be empty".to_string(),
        ));
    }

    if name.chars().count() > MAX_DISPLAY_NAME_LENGTH {
        return Err(ValidationError::InvalidDisplayName(format!(
            "Display name must be between 1 and {MAX_DISPLAY_NAME_LENGTH} characters"
        )));
    }

    // Check for potentially dangerous characters
    if !DISPLAY_NAME_REGEX.is_match(name) {
        return Err(ValidationError::InvalidDisplayName(
            "Display name contains invalid characters".to_string(),
        ));
    }

    Ok(name)
}

/// Validate a room password. Empty means "no password".
pub fn validate_password(password: &str) -> ValidationResult<&str> {
    if password.len() > MAX_PASSWORD_LENGTH {
        return Err(ValidationError::InvalidPassword(format!(
            "Password cannot exceed {MAX_PASSWORD_LENGTH} characters"
        )));
    }
    Ok(password)
}

/// Validate an SDP blob. Contents are opaque to the relay; only size is checked.
pub fn validate_sdp(sdp: &str) -> ValidationResult<&str> {
    if sdp.is_empty() {
        return Err(ValidationError::InvalidSdp("SDP must not be empty".to_string()));
    }
    if sdp.len() > MAX_SDP_LENGTH {
        return Err(ValidationError::InvalidSdp(format!(
            "SDP cannot exceed {MAX_SDP_LENGTH} bytes"
        )));
    }
    Ok(sdp)
}

/// Validate an ICE candidate
pub fn validate_candidate(candidate: &IceCandidate) -> ValidationResult<&IceCandidate> {
    // an empty candidate string is the end-of-candidates marker and is allowed
    if candidate.candidate.len() > MAX_CANDIDATE_LENGTH {
        return Err(ValidationError::InvalidCandidate(format!(
            "Candidate cannot exceed {MAX_CANDIDATE_LENGTH} bytes"
        )));
    }
    Ok(candidate)
}

/// Validate every field of a client message
pub fn validate_client_message(msg: &ClientMessage) -> ValidationResult<()> {
    if let Some(room_id) = msg.room_id() {
        validate_room_id(room_id)?;
    }

    match msg {
        ClientMessage::Join {
            participant_id,
            display_name,
            password,
            ..
        } => {
            validate_participant_id(participant_id)?;
            validate_display_name(display_name)?;
            if let Some(password) = password {
                validate_password(password)?;
            }
        },
        ClientMessage::Offer { target_id, sdp, .. }
        | ClientMessage::Answer { target_id, sdp, .. } => {
            validate_participant_id(target_id)?;
            validate_sdp(sdp)?;
        },
        ClientMessage::IceCandidate {
            target_id,
            candidate,
            ..
        } => {
            validate_participant_id(target_id)?;
            validate_candidate(candidate)?;
        },
        ClientMessage::Leave { participant_id, .. }
        | ClientMessage::StartMeeting { participant_id, .. }
        | ClientMessage::EndMeeting { participant_id, .. }
        | ClientMessage::ToggleVideo { participant_id, .. }
        | ClientMessage::ToggleAudio { participant_id, .. } => {
            validate_participant_id(participant_id)?;
        },
        ClientMessage::Promote {
            requester_id,
            target_id,
            ..
        }
        | ClientMessage::Demote {
            requester_id,
            target_id,
            ..
        }
        | ClientMessage::Kick {
            requester_id,
            target_id,
            ..
        }
        | ClientMessage::ApproveWaiting {
            requester_id,
            target_id,
            ..
        }
        | ClientMessage::RejectWaiting {
            requester_id,
            target_id,
            ..
        }
        | ClientMessage::MuteParticipant {
            requester_id,
            target_id,
            ..
        }
        | ClientMessage::UnmuteParticipant {
            requester_id,
            target_id,
            ..
        } => {
            validate_participant_id(requester_id)?;
            validate_participant_id(target_id)?;
        },
        ClientMessage::MuteAll { requester_id, .. }
        | ClientMessage::SetWaitingRoom { requester_id, .. } => {
            validate_participant_id(requester_id)?;
        },
        ClientMessage::Ping => {},
    }

    Ok(())
}
