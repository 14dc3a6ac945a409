//! Error types for the rules engine and the session layer.
//!
//! The engine reports [`EngineError`]; session operations report
//! [`ActionError`], which carries the three kinds the dispatcher
//! distinguishes (protocol, illegal action, not found). Join requests have
//! their own [`JoinError`] because each variant maps to an explicit reply.

use thiserror::Error;

/// Errors raised by the rules engine. The engine never panics on bad input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The requested move violates the movement rules or leaves the king in check.
    #[error("Illegal move: {0}")]
    IllegalMove(String),

    /// A position string could not be decoded.
    #[error("Invalid FEN: {0}")]
    InvalidFen(String),

    /// An algebraic notation string could not be matched to a legal move.
    #[error("Invalid notation '{notation}': {reason}")]
    InvalidNotation { notation: String, reason: String },
}

/// Errors raised while routing or applying a command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// Unknown command or malformed payload. Dropped without a reply.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The command violates game rules or turn/identity constraints.
    /// Dropped without a reply and without mutating state.
    #[error("Illegal action: {0}")]
    IllegalAction(String),

    /// The game identifier does not name a live session.
    #[error("Game {0} not found")]
    NotFound(String),
}

impl ActionError {
    pub fn illegal(reason: impl Into<String>) -> Self {
        ActionError::IllegalAction(reason.into())
    }
}

impl From<EngineError> for ActionError {
    fn from(err: EngineError) -> Self {
        ActionError::IllegalAction(err.to_string())
    }
}

/// Reasons a join request is turned away.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    /// Both player slots are occupied by live connections.
    #[error("game is full")]
    GameFull,

    /// A free slot exists but is reserved by a secret the caller did not present,
    /// or the presented secret belongs to a slot that is still connected.
    #[error("player already connected")]
    AlreadyConnected,

    /// The session has been retired by the idle sweep.
    #[error("game not found")]
    NotFound,
}

/// Result type alias for rules engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
