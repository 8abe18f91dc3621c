//! Error taxonomy of the voice call.
//!
//! Nothing here is fatal to the process: every variant degrades to
//! "call not active" (or, for audio payloads, "message skipped").

use crate::state_machine::CallState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    /// Microphone denied, missing or failed to open.
    #[error("microphone unavailable: {0}")]
    Microphone(String),

    /// Input/output audio context could not be opened or driven.
    #[error("audio device error: {0}")]
    Device(String),

    /// Connecting to, or talking with, the live session failed.
    #[error("live session error: {0}")]
    Session(String),

    #[error("a call is already {0}")]
    AlreadyActive(CallState),

    /// Inbound audio that cannot be decoded; the message is skipped.
    #[error("malformed audio payload: {0}")]
    MalformedAudio(String),
}

pub type CallResult<T> = Result<T, CallError>;
