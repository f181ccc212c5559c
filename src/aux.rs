// DisplayPort link training tools
//
// Copyright (C) 2023, Intel Corporation

//! AUX channel transactions.
//!
//! A request is framed into the AUX data registers of the port (a four byte header followed by
//! the payload), kicked off through the AUX control register and the reply is read back from
//! the same data registers. Data registers hold the bytes most significant first.
//!
//! Any attempt that does not end in ACK is retried as a whole, up to [`AUX_RETRY_LIMIT`] times.

use std::fmt::{self, Display};
use std::task::Poll;
use std::time::Duration;

use log::{debug, trace};

use crate::access::{self, RegisterAccess};
use crate::error::AuxError;
use crate::regs::{aux_ctl, aux_msg};

/// Number of times a request is issued before giving up.
pub const AUX_RETRY_LIMIT: u32 = 6;

/// Maximum payload of a single transaction.
pub const AUX_MAX_PAYLOAD: usize = 16;

/// Largest address that fits into the request header.
pub const AUX_MAX_ADDRESS: u32 = 0xf_ffff;

/// Reads of the control register before the hardware is considered stuck.
const AUX_BUSY_POLL_LIMIT: u32 = 10_000;

/// AUX request command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    I2cWrite,
    I2cRead,
    I2cWriteStatusUpdate,
    /// I2C write, middle-of-transaction.
    I2cWriteMot,
    /// I2C read, middle-of-transaction.
    I2cReadMot,
    I2cWriteStatusUpdateMot,
    NativeWrite,
    NativeRead,
}

impl Command {
    /// Returns the command nibble of the request header.
    pub fn code(&self) -> u32 {
        match self {
            Self::I2cWrite => 0x0,
            Self::I2cRead => 0x1,
            Self::I2cWriteStatusUpdate => 0x2,
            Self::I2cWriteMot => 0x4,
            Self::I2cReadMot => 0x5,
            Self::I2cWriteStatusUpdateMot => 0x6,
            Self::NativeWrite => 0x8,
            Self::NativeRead => 0x9,
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, Self::NativeWrite | Self::NativeRead)
    }

    pub fn is_read(&self) -> bool {
        matches!(self, Self::NativeRead | Self::I2cRead | Self::I2cReadMot)
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::I2cWrite => "I2C write",
            Self::I2cRead => "I2C read",
            Self::I2cWriteStatusUpdate => "I2C write status update",
            Self::I2cWriteMot => "I2C write (MOT)",
            Self::I2cReadMot => "I2C read (MOT)",
            Self::I2cWriteStatusUpdateMot => "I2C write status update (MOT)",
            Self::NativeWrite => "native write",
            Self::NativeRead => "native read",
        };
        write!(f, "{s}")
    }
}

/// Sink reply to a request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Nack,
    Defer,
}

impl Reply {
    fn from_field(value: u32) -> Option<Self> {
        match value {
            aux_msg::REPLY_ACK => Some(Self::Ack),
            aux_msg::REPLY_NACK => Some(Self::Nack),
            aux_msg::REPLY_DEFER => Some(Self::Defer),
            _ => None,
        }
    }

    /// Resolves the reply from the first reply data register.
    ///
    /// I2C requests can be acknowledged on the AUX level and still be refused by the I2C
    /// target, so for those both nibbles must be ACK.
    fn decode(command: Command, data: u32) -> Option<Self> {
        let native = Self::from_field(aux_msg::NativeReply::get_field(data))?;
        if command.is_native() || native != Self::Ack {
            return Some(native);
        }
        Self::from_field(aux_msg::I2cReply::get_field(data))
    }
}

/// A single AUX request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    command: Command,
    address: u32,
    length: usize,
    payload: [u8; AUX_MAX_PAYLOAD],
}

impl Transaction {
    /// Read of `length` bytes starting from `address`.
    pub fn read(command: Command, address: u32, length: usize) -> Self {
        Self {
            command,
            address,
            length,
            payload: [0; AUX_MAX_PAYLOAD],
        }
    }

    /// Write of `data` starting from `address`.
    pub fn write(command: Command, address: u32, data: &[u8]) -> Result<Self, AuxError> {
        if data.is_empty() || data.len() > AUX_MAX_PAYLOAD {
            return Err(AuxError::InvalidLength(data.len()));
        }

        let mut payload = [0; AUX_MAX_PAYLOAD];
        payload[..data.len()].copy_from_slice(data);

        Ok(Self {
            command,
            address,
            length: data.len(),
            payload,
        })
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Payload of a write.
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.length]
    }

    fn validate(&self) -> Result<(), AuxError> {
        if self.length == 0 || self.length > AUX_MAX_PAYLOAD {
            return Err(AuxError::InvalidLength(self.length));
        }
        if self.address > AUX_MAX_ADDRESS {
            return Err(AuxError::InvalidAddress(self.address));
        }
        Ok(())
    }

    fn header(&self) -> u32 {
        let mut header = 0;
        aux_msg::Command::set_field(&mut header, self.command.code());
        aux_msg::Address::set_field(&mut header, self.address);
        aux_msg::LengthMinusOne::set_field(&mut header, self.length as u32 - 1);
        header
    }

    /// Bytes sent to the sink: header and for writes the payload.
    fn message(&self) -> Vec<u8> {
        let mut message = self.header().to_be_bytes().to_vec();
        if !self.command.is_read() {
            message.extend_from_slice(self.payload());
        }
        message
    }
}

/// Data returned by the sink.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplyData {
    bytes: [u8; AUX_MAX_PAYLOAD],
    length: usize,
}

impl ReplyData {
    fn new(data: &[u8]) -> Self {
        let length = data.len().min(AUX_MAX_PAYLOAD);
        let mut bytes = [0; AUX_MAX_PAYLOAD];
        bytes[..length].copy_from_slice(&data[..length]);
        Self { bytes, length }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.length]
    }

    /// Returns the first four bytes (or less) as little-endian value, the first byte received
    /// ending up in the lowest bits.
    pub fn to_u32(&self) -> u32 {
        self.as_bytes()
            .iter()
            .take(4)
            .enumerate()
            .fold(0, |acc, (i, b)| acc | u32::from(*b) << (8 * i))
    }
}

/// Outcome of a single attempt.
enum Attempt {
    Ack(ReplyData),
    Reply(Reply),
    Busy,
    Timeout,
    ReceiveError,
    Malformed(u32),
}

impl Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ack(_) => write!(f, "ACK"),
            Self::Reply(Reply::Ack) => write!(f, "ACK"),
            Self::Reply(Reply::Nack) => write!(f, "NACK"),
            Self::Reply(Reply::Defer) => write!(f, "DEFER"),
            Self::Busy => write!(f, "channel busy"),
            Self::Timeout => write!(f, "timeout"),
            Self::ReceiveError => write!(f, "receive error"),
            Self::Malformed(data) => write!(f, "malformed reply {:#010x}", data),
        }
    }
}

/// AUX channel of one port.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AuxChannel {
    ctl: u32,
}

impl AuxChannel {
    /// Creates AUX channel whose control register is at `ctl`.
    pub fn new(ctl: u32) -> Self {
        Self { ctl }
    }

    pub fn ctl_reg(&self) -> u32 {
        self.ctl
    }

    /// Returns offset of data register `index`.
    pub fn data_reg(&self, index: u32) -> u32 {
        self.ctl + 4 * (index + 1)
    }

    /// Executes `transaction` and returns the reply data.
    ///
    /// Invalid length or address is reported before any register is touched. Writes return
    /// empty reply data.
    pub fn execute<R>(&self, regs: &mut R, transaction: &Transaction) -> Result<ReplyData, AuxError>
    where
        R: RegisterAccess + ?Sized,
    {
        transaction.validate()?;

        let reply = access::poll_with_timeout(
            regs,
            Duration::ZERO,
            AUX_RETRY_LIMIT,
            |regs, attempt| -> Result<_, AuxError> {
                match self.attempt(regs, transaction) {
                    Attempt::Ack(data) => Ok(Poll::Ready(data)),
                    failure => {
                        debug!(
                            "AUX {} {:#07x} attempt {}/{} failed: {}",
                            transaction.command(),
                            transaction.address(),
                            attempt,
                            AUX_RETRY_LIMIT,
                            failure
                        );
                        Ok(Poll::Pending)
                    }
                }
            },
        )?;

        reply.ok_or(AuxError::NoResponse)
    }

    /// Clears the sticky status bits left by a previous transaction.
    fn clear_status<R>(&self, regs: &mut R)
    where
        R: RegisterAccess + ?Sized,
    {
        let mut ctl = regs.read(self.ctl);
        if ctl & aux_ctl::STICKY_MASK != 0 {
            aux_ctl::SendBusy::set_bit(&mut ctl, false);
            regs.write(self.ctl, ctl);
        }
    }

    /// Waits for the busy bit to clear and returns the final control register value.
    fn wait_idle<R>(&self, regs: &mut R) -> Option<u32>
    where
        R: RegisterAccess + ?Sized,
    {
        let ctl = self.ctl;
        let result: Result<_, AuxError> =
            access::poll_with_timeout(regs, Duration::ZERO, AUX_BUSY_POLL_LIMIT, |regs, _| {
                let value = regs.read(ctl);
                Ok(if aux_ctl::SendBusy::get_bit(value) {
                    Poll::Pending
                } else {
                    Poll::Ready(value)
                })
            });
        result.ok().flatten()
    }

    fn attempt<R>(&self, regs: &mut R, transaction: &Transaction) -> Attempt
    where
        R: RegisterAccess + ?Sized,
    {
        self.clear_status(regs);

        let mut ctl = match self.wait_idle(regs) {
            Some(ctl) => ctl,
            None => return Attempt::Busy,
        };

        let message = transaction.message();
        for (i, chunk) in message.chunks(4).enumerate() {
            let mut word = [0; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            let value = u32::from_be_bytes(word);
            trace!("AUX data{} <- {:#010x}", i, value);
            regs.write(self.data_reg(i as u32), value);
        }

        aux_ctl::MessageSize::set_field(&mut ctl, message.len() as u32);
        aux_ctl::SendBusy::set_bit(&mut ctl, true);
        // Writing the sticky bits back as one clears them.
        ctl |= aux_ctl::STICKY_MASK;
        regs.write(self.ctl, ctl);

        let ctl = match self.wait_idle(regs) {
            Some(ctl) => ctl,
            None => return Attempt::Busy,
        };
        trace!("AUX ctl -> {:#010x}", ctl);

        if aux_ctl::TimeOutError::get_bit(ctl) {
            return Attempt::Timeout;
        }
        if aux_ctl::ReceiveError::get_bit(ctl) {
            return Attempt::ReceiveError;
        }
        if !aux_ctl::Done::get_bit(ctl) {
            return Attempt::Timeout;
        }

        let received = aux_ctl::MessageSize::get_field(ctl) as usize;
        if received == 0 {
            return Attempt::Malformed(0);
        }

        let mut bytes = Vec::with_capacity(aux_ctl::DATA_REGISTERS as usize * 4);
        for i in 0..aux_ctl::DATA_REGISTERS {
            bytes.extend_from_slice(&regs.read(self.data_reg(i)).to_be_bytes());
        }
        let status = u32::from(bytes[0]) << 24;

        match Reply::decode(transaction.command(), status) {
            Some(Reply::Ack) => {
                let data = if transaction.command().is_read() {
                    let end = received.min(1 + transaction.len()).min(bytes.len());
                    ReplyData::new(&bytes[1..end])
                } else {
                    ReplyData::default()
                };
                Attempt::Ack(data)
            }
            Some(reply) => Attempt::Reply(reply),
            None => Attempt::Malformed(status),
        }
    }
}
