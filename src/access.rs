// DisplayPort link training tools
//
// Copyright (C) 2023, Intel Corporation

//! Access to the transmitter registers.
//!
//! Everything the protocol engine does to the hardware goes through [`RegisterAccess`]. It is
//! implemented by [`Mmio`](crate::mmio::Mmio) for real hardware and by
//! [`SimulatedPort`](crate::sim::SimulatedPort) for tests. Waiting is part of the trait as well so
//! that simulated runs can account for the time instead of sleeping.

use std::task::Poll;
use std::thread;
use std::time::Duration;

/// Memory-mapped register access of one display controller.
///
/// The engine assumes exclusive access for the duration of a training attempt. Serializing
/// mode-sets on the same connector is up to the caller.
pub trait RegisterAccess {
    /// Reads 32-bit register at `offset`.
    fn read(&mut self, offset: u32) -> u32;

    /// Writes 32-bit `value` to register at `offset`.
    fn write(&mut self, offset: u32, value: u32);

    /// Blocks the caller for `duration`.
    fn delay(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

impl<R: RegisterAccess + ?Sized> RegisterAccess for &mut R {
    fn read(&mut self, offset: u32) -> u32 {
        (**self).read(offset)
    }

    fn write(&mut self, offset: u32, value: u32) {
        (**self).write(offset, value)
    }

    fn delay(&mut self, duration: Duration) {
        (**self).delay(duration)
    }
}

/// Read-modify-write of a single register.
pub fn modify<R, F>(regs: &mut R, offset: u32, f: F) -> u32
where
    R: RegisterAccess + ?Sized,
    F: FnOnce(&mut u32),
{
    let mut value = regs.read(offset);
    f(&mut value);
    regs.write(offset, value);
    value
}

/// Runs `f` at most `max_attempts` times waiting `interval` before each attempt.
///
/// `f` is passed the register access and the attempt number starting from 1. Polling stops as
/// soon as `f` returns [`Poll::Ready`] or an error. Returns `Ok(None)` if all attempts were used
/// up. A zero `interval` polls back to back.
///
/// # Examples
/// ```
/// use std::task::Poll;
/// use std::time::Duration;
/// use dplink::access::{self, RegisterAccess};
/// use dplink::sim::SimulatedPort;
///
/// let mut port = SimulatedPort::default();
/// let result: Result<_, ()> =
///     access::poll_with_timeout(&mut port, Duration::from_micros(100), 5, |_, attempt| {
///         Ok(if attempt == 3 { Poll::Ready(attempt) } else { Poll::Pending })
///     });
/// assert_eq!(result, Ok(Some(3)));
/// assert_eq!(port.elapsed(), Duration::from_micros(300));
/// ```
pub fn poll_with_timeout<R, T, E, F>(
    regs: &mut R,
    interval: Duration,
    max_attempts: u32,
    mut f: F,
) -> Result<Option<T>, E>
where
    R: RegisterAccess + ?Sized,
    F: FnMut(&mut R, u32) -> Result<Poll<T>, E>,
{
    for attempt in 1..=max_attempts {
        if !interval.is_zero() {
            regs.delay(interval);
        }
        if let Poll::Ready(value) = f(regs, attempt)? {
            return Ok(Some(value));
        }
    }

    Ok(None)
}
