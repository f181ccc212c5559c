// DisplayPort link training tools
//
// Copyright (C) 2023, Intel Corporation

//! This crate implements the source side of [DisplayPort] link bring-up: transactions over the
//! AUX channel, access to the sink's DPCD registers, programming of the transmitter drive levels
//! and the link training state machine on top of them.
//!
//! All hardware access goes through [`access::RegisterAccess`]. On a real system that is
//! [`mmio::Mmio`], a mapping of the display controller registers. For testing and for trying out
//! sink behavior without hardware there is [`sim::SimulatedPort`] that models a sink on the other
//! end of the AUX channel.
//!
//! [DisplayPort]: https://en.wikipedia.org/wiki/DisplayPort

pub mod access;
pub mod aux;
pub mod dpcd;
pub mod error;
pub mod generation;
pub mod link;
pub mod mmio;
pub mod phy;
pub mod regs;
pub mod sim;
pub mod training;
pub mod util;

pub use error::{AuxError, FailureCause, ParamError, TrainingError};
