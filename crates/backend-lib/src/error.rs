// crates/backend-lib/src/error.rs

//! Central error type for the relay.
use meetroom_common::{ActionErrorReason, RoomErrorReason};
use thiserror::Error;

use crate::validation::ValidationError;

/// Application error types with error codes and context
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Admission rejected: {0:?}")]
    Admission(RoomErrorReason),

    #[error("Action rejected: {0:?}")]
    Action(ActionErrorReason),

    #[error("Invalid input: {0}")]
    Validation(#[from] ValidationError),

    #[error("Room {0} is shutting down")]
    RoomClosed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Admission(RoomErrorReason::WrongPassword) => "ROOM_001",
            AppError::Admission(RoomErrorReason::RoomNotFound) => "ROOM_002",
            AppError::Admission(RoomErrorReason::MeetingEnded) => "ROOM_003",
            AppError::Admission(RoomErrorReason::TooManyAttempts) => "ROOM_004",
            AppError::Action(_) => "ACTION_001",
            AppError::Validation(_) => "VAL_001",
            AppError::RoomClosed(_) => "ROOM_005",
            AppError::Internal(_) => "INT_001",
        }
    }

    /// Get a sanitized message suitable for production use
    pub fn sanitized_message(&self) -> String {
        match self {
            AppError::Admission(RoomErrorReason::WrongPassword) => {
                "Authentication failed".to_string()
            },
            AppError::Admission(RoomErrorReason::TooManyAttempts) => {
                "Too many join attempts, please try again later".to_string()
            },
            AppError::Admission(_) => "Room unavailable".to_string(),
            AppError::Action(_) => "Action not permitted".to_string(),
            AppError::Validation(_) => "Invalid input provided".to_string(),
            AppError::RoomClosed(_) | AppError::Internal(_) => {
                "An internal server error occurred".to_string()
            },
        }
    }

    /// Message text for an `error` frame; detailed in debug builds only.
    pub fn client_message(&self) -> String {
        if cfg!(debug_assertions) {
            self.to_string()
        } else {
            self.sanitized_message()
        }
    }
}

impl From<ActionErrorReason> for AppError {
    fn from(reason: ActionErrorReason) -> Self {
        AppError::Action(reason)
    }
}

impl From<RoomErrorReason> for AppError {
    fn from(reason: RoomErrorReason) -> Self {
        AppError::Admission(reason)
    }
}
