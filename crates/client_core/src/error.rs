use shared::{
    domain::RoomPhase,
    error::{ErrorCode, UserNotice},
};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidRoomCodeReason {
    Empty,
    Unoccupied,
    PresenceQueryFailed,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid room code '{code}' ({reason:?})")]
    InvalidRoomCode {
        code: String,
        reason: InvalidRoomCodeReason,
    },
    #[error("transport failure: {0:#}")]
    Transport(anyhow::Error),
    #[error("session store unavailable: {0:#}")]
    Store(anyhow::Error),
    #[error("{operation} is not allowed while {phase}")]
    InvalidTransition {
        operation: &'static str,
        phase: RoomPhase,
    },
    #[error("no active room")]
    NoActiveRoom,
    #[error("{0}")]
    Validation(String),
}

impl ClientError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidRoomCode { .. } => ErrorCode::InvalidRoomCode,
            Self::Transport(_) => ErrorCode::Transport,
            Self::Store(_) => ErrorCode::Store,
            Self::InvalidTransition { .. } | Self::NoActiveRoom => ErrorCode::InvalidTransition,
            Self::Validation(_) => ErrorCode::Validation,
        }
    }

    pub fn to_notice(&self) -> UserNotice {
        UserNotice::new(self.code(), self.to_string())
    }
}
