//! Error taxonomy for processing a single delivery.

use crate::dead_letter::FailureStage;
use crate::event_bus::EventBusError;
use crate::handler::{HandlerError, ValidationError};
use crate::registry::DecodeError;
use thiserror::Error;

/// Everything that can go wrong between receiving a delivery and acknowledging it.
///
/// Only transport errors and recoverable handler failures are retried. Malformed
/// input is dead-lettered straight away.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    /// The broker failed (publish, subscribe or acknowledge).
    #[error(transparent)]
    Transport(#[from] EventBusError),

    /// The bytes could not be turned into a known, typed event.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The envelope failed structural validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The business handler failed.
    #[error(transparent)]
    Business(#[from] HandlerError),
}

impl ProcessingError {
    /// Whether retrying the same message can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Business(err) => err.is_recoverable(),
            Self::Decode(_) | Self::Validation(_) => false,
        }
    }

    /// The stage recorded on the dead letter when this error is terminal.
    #[must_use]
    pub const fn failure_stage(&self) -> FailureStage {
        match self {
            Self::Decode(DecodeError::UnknownEventType(_)) => FailureStage::UnknownEventType,
            Self::Decode(_) => FailureStage::Decode,
            Self::Validation(_) => FailureStage::Validation,
            Self::Transport(_) | Self::Business(_) => FailureStage::Handler,
        }
    }
}
