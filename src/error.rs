// DisplayPort link training tools
//
// Copyright (C) 2023, Intel Corporation

//! Errors returned by the AUX engine, the electrical parameter controller and link training.

use std::io;

use thiserror::Error;

use crate::phy::Level;

/// Failure of a single AUX transaction.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum AuxError {
    /// Transaction length was 0 or more than 16 bytes. Nothing was sent.
    #[error("invalid AUX transaction length {0}")]
    InvalidLength(usize),
    /// Address does not fit into the 20-bit AUX address field. Nothing was sent.
    #[error("invalid AUX address {0:#x}")]
    InvalidAddress(u32),
    /// No ACK was received within the retry budget.
    #[error("no response from the sink")]
    NoResponse,
}

/// Failure to apply a drive level.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    /// Voltage swing and pre-emphasis levels add up to more than 3.
    #[error("invalid drive level combination: swing {swing} + pre-emphasis {preemphasis} > 3")]
    InvalidCombination { swing: u8, preemphasis: u8 },
    /// The tuning table of the generation has no entry for the level.
    #[error("no PHY tuning values for {0}")]
    MissingTuning(Level),
    /// PHY sideband bus stayed busy.
    #[error("PHY sideband bus busy while accessing register {0:#x}")]
    SidebandTimeout(u32),
    /// Telling the sink about the new level failed.
    #[error(transparent)]
    Aux(#[from] AuxError),
}

/// Why a training phase gave up.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum FailureCause {
    /// Sink requested the same drive level too many times in a row.
    #[error("sink requested {0} repeatedly")]
    SameLevelRepeated(Level),
    /// Maximum voltage swing is already applied and the sink still has no lock.
    #[error("maximum voltage swing reached at {0}")]
    MaxSwingReached(Level),
    /// Iteration cap of the phase was reached.
    #[error("iteration limit of {0} reached")]
    IterationLimit(u32),
    /// Clock recovery was lost while equalizing.
    #[error("clock recovery lost")]
    ClockRecoveryLost,
    #[error(transparent)]
    Aux(#[from] AuxError),
    #[error(transparent)]
    Param(#[from] ParamError),
}

/// Result of an unsuccessful link training attempt.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum TrainingError {
    #[error("clock recovery failed: {0}")]
    ClockRecoveryFailed(#[source] FailureCause),
    #[error("channel equalization failed: {0}")]
    EqualizationFailed(#[source] FailureCause),
}

impl TrainingError {
    /// Returns the cause of the failure.
    pub fn cause(&self) -> &FailureCause {
        match self {
            Self::ClockRecoveryFailed(cause) | Self::EqualizationFailed(cause) => cause,
        }
    }

    /// Returns the AUX error that ended training, if that is what happened.
    pub fn aux_error(&self) -> Option<AuxError> {
        match self.cause() {
            FailureCause::Aux(err) | FailureCause::Param(ParamError::Aux(err)) => Some(*err),
            _ => None,
        }
    }
}

impl From<AuxError> for io::Error {
    fn from(err: AuxError) -> Self {
        let kind = match err {
            AuxError::InvalidLength(_) | AuxError::InvalidAddress(_) => io::ErrorKind::InvalidInput,
            AuxError::NoResponse => io::ErrorKind::TimedOut,
        };
        io::Error::new(kind, err)
    }
}

impl From<TrainingError> for io::Error {
    fn from(err: TrainingError) -> Self {
        io::Error::new(io::ErrorKind::Other, err)
    }
}
