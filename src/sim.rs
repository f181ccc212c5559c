// DisplayPort link training tools
//
// Copyright (C) 2023, Intel Corporation

//! Simulated transmitter port with a sink attached.
//!
//! [`SimulatedPort`] implements [`RegisterAccess`] on top of plain memory. Writes to the AUX
//! control register are turned into DPCD accesses of a [`SinkModel`] and writes to the sideband
//! packet register into PHY register accesses. Delays are not slept but accumulated so that
//! timing can be checked afterwards. Everything the transmitter does towards the sink is
//! recorded as a list of [`Event`]s.
//!
//! How the sink reacts during link training is described by [`ScriptedSink`] which can also be
//! read from JSON:
//!
//! ```json
//! {
//!   "max_link_rate": "hbr",
//!   "max_lane_count": 4,
//!   "clock_recovery": { "at_level": [1, 0] },
//!   "equalization": { "done_after": 1 }
//! }
//! ```

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::io::{Error, ErrorKind, Result};
use std::path::Path;
use std::time::Duration;

use log::trace;
use serde::Deserialize;

use crate::access::RegisterAccess;
use crate::aux::AuxChannel;
use crate::dpcd::Dpcd;
use crate::generation::{Generation, PortId, PortLayout, DEFAULT_GENERATION};
use crate::link::{LaneCount, LinkRate};
use crate::phy::{Level, Sideband};
use crate::regs::{aux_ctl, aux_msg, dpcd, sideband};

/// How a sink that does not answer replies to AUX requests.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuxFailure {
    #[default]
    Nack,
    Defer,
    /// No reply at all, the transmitter times out.
    Timeout,
}

/// Clock recovery behavior of the sink.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockRecovery {
    /// Locks as soon as the transmitter drives `[swing, preemphasis]` and requests that level
    /// until then.
    AtLevel([u8; 2]),
    /// Never locks. Requests the levels in order, starting over after the last one.
    Never(Vec<[u8; 2]>),
}

impl Default for ClockRecovery {
    fn default() -> Self {
        Self::AtLevel([0, 0])
    }
}

/// Channel equalization behavior of the sink.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Equalization {
    /// Equalization poll (starting from 1) from which on all lanes report equalized, symbol
    /// locked and aligned. `None` means never.
    pub done_after: Option<u32>,
    /// Levels requested while not equalized, in order and repeating. Empty means the current
    /// level is requested.
    pub requests: Vec<[u8; 2]>,
    /// Equalization poll on which clock recovery is reported lost.
    pub clock_recovery_lost_at: Option<u32>,
    /// Stop answering AUX once the transmitter has switched the sink to pattern 2.
    pub stop_responding: bool,
}

/// Sink behavior during link training.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScriptedSink {
    pub max_link_rate: LinkRate,
    pub max_lane_count: u8,
    /// Value of `TRAINING_AUX_RD_INTERVAL`.
    pub aux_rd_interval: u8,
    pub clock_recovery: ClockRecovery,
    /// Lanes (bit mask) that never report clock recovery done.
    pub stuck_lanes: u8,
    pub equalization: Equalization,
    /// Stop answering AUX from the first write to `TRAINING_PATTERN_SET` on.
    pub stop_responding_at_training: bool,
    pub aux_failure: AuxFailure,
}

impl Default for ScriptedSink {
    fn default() -> Self {
        Self {
            max_link_rate: LinkRate::Hbr,
            max_lane_count: 4,
            aux_rd_interval: 0,
            clock_recovery: ClockRecovery::default(),
            stuck_lanes: 0,
            equalization: Equalization {
                done_after: Some(1),
                ..Default::default()
            },
            stop_responding_at_training: false,
            aux_failure: AuxFailure::default(),
        }
    }
}

impl ScriptedSink {
    /// Reads sink behavior from JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::new(ErrorKind::InvalidData, e))
    }
}

/// Training phase as seen by the sink.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    ClockRecovery,
    Equalization,
}

/// DisplayPort sink: DPCD storage and the link training behavior.
#[derive(Clone, Debug)]
pub struct SinkModel {
    dpcd: HashMap<u32, u8>,
    script: ScriptedSink,
    phase: Phase,
    responding: bool,
    fail_next: u32,
    aux_attempts: u32,
    cr_polls: u32,
    eq_polls: u32,
    cr_locked: bool,
    equalization_entered: Vec<bool>,
}

impl Default for SinkModel {
    fn default() -> Self {
        Self::with_script(ScriptedSink::default())
    }
}

impl SinkModel {
    /// Sink that locks at the lowest level and equalizes on the first poll.
    pub fn new(max_link_rate: LinkRate, max_lane_count: LaneCount) -> Self {
        Self::with_script(ScriptedSink {
            max_link_rate,
            max_lane_count: max_lane_count.count() as u8,
            ..Default::default()
        })
    }

    pub fn with_script(script: ScriptedSink) -> Self {
        let mut sink = Self {
            dpcd: HashMap::new(),
            script,
            phase: Phase::Idle,
            responding: true,
            fail_next: 0,
            aux_attempts: 0,
            cr_polls: 0,
            eq_polls: 0,
            cr_locked: false,
            equalization_entered: Vec::new(),
        };

        sink.set_dpcd(dpcd::REV, 0x11);
        sink.set_dpcd(dpcd::MAX_LINK_RATE, sink.script.max_link_rate.dpcd_code());
        sink.set_dpcd(
            dpcd::MAX_LANE_COUNT,
            sink.script.max_lane_count | dpcd::ENHANCED_FRAME_CAP as u8,
        );
        sink.set_dpcd(dpcd::MAX_DOWNSPREAD, dpcd::MAX_DOWNSPREAD_0_5 as u8);
        sink.set_dpcd(dpcd::RECEIVE_PORT_0_CAP_0, dpcd::LOCAL_EDID_PRESENT as u8);
        sink.set_dpcd(dpcd::TRAINING_AUX_RD_INTERVAL, sink.script.aux_rd_interval);
        sink
    }

    pub fn script(&self) -> &ScriptedSink {
        &self.script
    }

    pub fn script_mut(&mut self) -> &mut ScriptedSink {
        &mut self.script
    }

    /// Returns DPCD byte at `address`.
    pub fn dpcd(&self, address: u32) -> u8 {
        self.dpcd.get(&address).copied().unwrap_or(0)
    }

    pub fn set_dpcd(&mut self, address: u32, value: u8) {
        self.dpcd.insert(address, value);
    }

    /// Sink stops or starts answering AUX requests.
    pub fn set_responding(&mut self, responding: bool) {
        self.responding = responding;
    }

    /// Fails the next `count` AUX requests.
    pub fn fail_next_attempts(&mut self, count: u32) {
        self.fail_next = count;
    }

    /// Number of AUX requests the sink has seen.
    pub fn aux_attempts(&self) -> u32 {
        self.aux_attempts
    }

    /// Number of lane status reads during clock recovery.
    pub fn cr_polls(&self) -> u32 {
        self.cr_polls
    }

    /// Number of lane status reads during equalization.
    pub fn eq_polls(&self) -> u32 {
        self.eq_polls
    }

    /// For each switch to training pattern 2, whether the preceding status poll reported
    /// clock recovery done on all active lanes.
    pub fn equalization_entered(&self) -> &[bool] {
        &self.equalization_entered
    }

    /// Level the transmitter has told the sink through `TRAINING_LANE0_SET`.
    pub fn lane_level(&self, lane: u32) -> (u8, u8) {
        let value = self.dpcd(dpcd::TRAINING_LANE0_SET + lane);
        (value & 0x3, (value >> dpcd::lane_set::PREEMPHASIS_SHIFT) & 0x3)
    }

    fn lane_count(&self) -> usize {
        match LaneCount::from_dpcd(self.dpcd(dpcd::LANE_COUNT_SET)) {
            Some(lanes) => lanes.count(),
            None => usize::from(self.script.max_lane_count).min(4),
        }
    }

    fn set_request(&mut self, level: [u8; 2]) {
        let lane = (level[0] & 0x3) | (level[1] & 0x3) << 2;
        let value = lane | lane << 4;
        self.set_dpcd(dpcd::ADJUST_REQUEST_LANE0_1, value);
        self.set_dpcd(dpcd::ADJUST_REQUEST_LANE2_3, value);
    }

    fn set_lane_status(&mut self, lane_bits: impl Fn(usize) -> u8, aligned: bool) {
        let mut status = [0u8; 2];
        for lane in 0..self.lane_count() {
            status[lane / 2] |= lane_bits(lane) << (4 * (lane % 2));
        }
        self.set_dpcd(dpcd::LANE0_1_STATUS, status[0]);
        self.set_dpcd(dpcd::LANE2_3_STATUS, status[1]);
        self.set_dpcd(
            dpcd::LANE_ALIGN_STATUS_UPDATED,
            if aligned { dpcd::INTERLANE_ALIGN_DONE } else { 0 },
        );
    }

    /// Refreshes the status registers for a new poll by the transmitter.
    fn poll(&mut self) {
        match self.phase {
            Phase::Idle => {}
            Phase::ClockRecovery => {
                self.cr_polls += 1;
                let current = self.lane_level(0);
                let stuck = self.script.stuck_lanes;
                let locked = match self.script.clock_recovery.clone() {
                    ClockRecovery::AtLevel(level) => {
                        let locked = current == (level[0], level[1]);
                        if !locked {
                            self.set_request(level);
                        }
                        locked
                    }
                    ClockRecovery::Never(requests) => {
                        let request = if requests.is_empty() {
                            [0, 0]
                        } else {
                            requests[(self.cr_polls as usize - 1) % requests.len()]
                        };
                        self.set_request(request);
                        false
                    }
                };
                self.set_lane_status(
                    |lane| {
                        if locked && stuck & (1 << lane) == 0 {
                            dpcd::LANE_CR_DONE
                        } else {
                            0
                        }
                    },
                    false,
                );
                self.cr_locked = locked && (0..self.lane_count()).all(|l| stuck & (1 << l) == 0);
            }
            Phase::Equalization => {
                self.eq_polls += 1;
                let poll = self.eq_polls;
                let eq = &self.script.equalization;
                let lost = eq.clock_recovery_lost_at == Some(poll);
                let done = eq.done_after.map_or(false, |n| poll >= n) && !lost;
                let request = if eq.requests.is_empty() {
                    let (swing, preemphasis) = self.lane_level(0);
                    [swing, preemphasis]
                } else {
                    eq.requests[(poll as usize - 1) % eq.requests.len()]
                };
                self.set_request(request);
                self.set_lane_status(
                    |_| {
                        let mut bits = 0;
                        if !lost {
                            bits |= dpcd::LANE_CR_DONE;
                        }
                        if done {
                            bits |= dpcd::LANE_CHANNEL_EQ_DONE | dpcd::LANE_SYMBOL_LOCKED;
                        }
                        bits
                    },
                    done,
                );
            }
        }
    }

    fn written(&mut self, address: u32, value: u8) {
        self.set_dpcd(address, value);

        if address == dpcd::TRAINING_PATTERN_SET {
            match u32::from(value) & 0x3 {
                dpcd::TRAINING_PATTERN_1 => {
                    self.phase = Phase::ClockRecovery;
                    self.cr_locked = false;
                }
                dpcd::TRAINING_PATTERN_2 => {
                    self.equalization_entered.push(self.cr_locked);
                    self.phase = Phase::Equalization;
                    if self.script.equalization.stop_responding {
                        self.responding = false;
                    }
                }
                _ => self.phase = Phase::Idle,
            }
        }
    }

    /// Handles one native AUX request. Returns reply status byte and data or `None` if the
    /// sink does not reply at all.
    fn transfer(&mut self, command: u32, address: u32, data: &[u8], len: usize) -> Option<Vec<u8>> {
        self.aux_attempts += 1;

        if self.script.stop_responding_at_training
            && command == 0x8
            && address <= dpcd::TRAINING_PATTERN_SET
            && address as usize + data.len() > dpcd::TRAINING_PATTERN_SET as usize
        {
            self.responding = false;
        }

        let failing = if self.fail_next > 0 {
            self.fail_next -= 1;
            true
        } else {
            !self.responding
        };

        if failing {
            return match self.script.aux_failure {
                AuxFailure::Nack => Some(vec![(aux_msg::REPLY_NACK << 4) as u8]),
                AuxFailure::Defer => Some(vec![(aux_msg::REPLY_DEFER << 4) as u8]),
                AuxFailure::Timeout => None,
            };
        }

        match command {
            // Native write
            0x8 => {
                for (i, b) in data.iter().enumerate() {
                    self.written(address + i as u32, *b);
                }
                Some(vec![0])
            }
            // Native read
            0x9 => {
                let range = address..address + len as u32;
                if range.contains(&dpcd::LANE0_1_STATUS) {
                    self.poll();
                }
                let mut reply = vec![0];
                reply.extend(range.map(|a| self.dpcd(a)));
                Some(reply)
            }
            // Nothing on the I2C bus
            _ => Some(vec![0x40]),
        }
    }
}

/// What the transmitter did, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Port control register was written.
    PortControl(u32),
    /// PHY register was written through the sideband.
    PhyWrite { reg: u32, value: u32 },
    /// Sink acknowledged a DPCD write.
    DpcdWrite { address: u32, data: Vec<u8> },
    /// Transmitter waited.
    Delay(Duration),
}

impl Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PortControl(value) => write!(f, "port control {:#010x}", value),
            Self::PhyWrite { reg, value } => write!(f, "PHY {:#06x} <- {:#010x}", reg, value),
            Self::DpcdWrite { address, data } => {
                write!(f, "DPCD {:#07x} <-", address)?;
                for b in data {
                    write!(f, " {:02x}", b)?;
                }
                Ok(())
            }
            Self::Delay(duration) => write!(f, "delay {} us", duration.as_micros()),
        }
    }
}

/// Transmitter port registers backed by memory with a simulated sink attached.
#[derive(Clone, Debug)]
pub struct SimulatedPort {
    layout: PortLayout,
    sideband: Sideband,
    regs: HashMap<u32, u32>,
    phy: HashMap<u32, u32>,
    sink: SinkModel,
    elapsed: Duration,
    accesses: usize,
    events: Vec<(Duration, Event)>,
}

impl Default for SimulatedPort {
    fn default() -> Self {
        Self::new(SinkModel::default())
    }
}

impl SimulatedPort {
    /// Port B of the default generation with `sink` attached.
    ///
    /// # Panics
    /// Panics if the built-in generation table is broken.
    pub fn new(sink: SinkModel) -> Self {
        let generation = Generation::builtin(DEFAULT_GENERATION).unwrap();
        Self::with_generation(&generation, PortId::B, sink).unwrap()
    }

    /// Port `id` of `generation` with `sink` attached. Returns `None` if there is no such port.
    pub fn with_generation(generation: &Generation, id: PortId, sink: SinkModel) -> Option<Self> {
        let layout = generation.port(id)?.clone();

        Some(Self {
            layout,
            sideband: generation.sideband().clone(),
            regs: HashMap::new(),
            phy: HashMap::new(),
            sink,
            elapsed: Duration::ZERO,
            accesses: 0,
            events: Vec::new(),
        })
    }

    pub fn layout(&self) -> &PortLayout {
        &self.layout
    }

    pub fn aux_channel(&self) -> AuxChannel {
        self.layout.aux_channel()
    }

    pub fn dpcd(&self) -> Dpcd {
        self.layout.dpcd()
    }

    pub fn sink(&self) -> &SinkModel {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut SinkModel {
        &mut self.sink
    }

    /// Total time spent in delays.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Number of register reads and writes done so far.
    pub fn register_accesses(&self) -> usize {
        self.accesses
    }

    /// Everything recorded so far with the time it happened.
    pub fn events(&self) -> &[(Duration, Event)] {
        &self.events
    }

    /// Current value of the port control register.
    pub fn port_control(&self) -> u32 {
        self.regs.get(&self.layout.control()).copied().unwrap_or(0)
    }

    /// Current value of PHY register `reg` (absolute sideband address).
    pub fn phy_register(&self, reg: u32) -> u32 {
        self.phy.get(&reg).copied().unwrap_or(0)
    }

    /// Returns the drive level the PHY registers are programmed to, if they match a table
    /// entry of `generation`.
    pub fn phy_level(&self, generation: &Generation) -> Option<Level> {
        let base = self.layout.phy_base();
        generation
            .phy_table()
            .entries()
            .iter()
            .find(|e| {
                e.writes()
                    .iter()
                    .all(|(offset, _)| {
                        let last = e.writes().iter().rev().find(|w| w.0 == *offset);
                        last.map_or(false, |w| self.phy_register(base + w.0) == w.1)
                    })
            })
            .map(|e| e.level())
    }

    fn record(&mut self, event: Event) {
        self.events.push((self.elapsed, event));
    }

    fn reg(&self, offset: u32) -> u32 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }

    fn aux_transfer(&mut self, mut ctl: u32) {
        let aux = self.layout.aux_channel();

        let size = (aux_ctl::MessageSize::get_field(ctl) as usize).min(20);
        let mut message = Vec::with_capacity(20);
        for i in 0..aux_ctl::DATA_REGISTERS {
            message.extend_from_slice(&self.reg(aux.data_reg(i)).to_be_bytes());
        }
        message.truncate(size);

        let header = if message.len() >= 4 {
            u32::from_be_bytes([message[0], message[1], message[2], message[3]])
        } else {
            0
        };
        let command = aux_msg::Command::get_field(header);
        let address = aux_msg::Address::get_field(header);
        let len = aux_msg::LengthMinusOne::get_field(header) as usize + 1;
        let data = message.get(4..).unwrap_or_default().to_vec();

        trace!("sim: AUX command {:#x} address {:#07x} len {}", command, address, len);

        let reply = self.sink.transfer(command, address, &data, len);

        aux_ctl::SendBusy::set_bit(&mut ctl, false);
        match reply {
            Some(reply) => {
                if command == 0x8 && reply.first() == Some(&0) {
                    self.record(Event::DpcdWrite { address, data });
                }
                let mut words = [0u8; 20];
                let n = reply.len().min(words.len());
                words[..n].copy_from_slice(&reply[..n]);
                for (i, chunk) in words.chunks(4).enumerate() {
                    let value = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    self.regs.insert(aux.data_reg(i as u32), value);
                }
                aux_ctl::MessageSize::set_field(&mut ctl, n as u32);
                aux_ctl::Done::set_bit(&mut ctl, true);
            }
            None => {
                aux_ctl::MessageSize::set_field(&mut ctl, 0);
                aux_ctl::Done::set_bit(&mut ctl, true);
                aux_ctl::TimeOutError::set_bit(&mut ctl, true);
            }
        }
        self.regs.insert(self.layout.aux_ctl(), ctl);
    }

    fn sideband_transfer(&mut self, packet: u32) {
        let reg = self.reg(self.sideband.address_reg());
        match sideband::Opcode::get_field(packet) {
            sideband::OPCODE_WRITE => {
                let value = self.reg(self.sideband.data_reg());
                self.phy.insert(reg, value);
                self.record(Event::PhyWrite { reg, value });
            }
            sideband::OPCODE_READ => {
                let value = self.phy_register(reg);
                self.regs.insert(self.sideband.data_reg(), value);
            }
            _ => {}
        }
        // Transfers complete immediately.
        let mut packet = packet;
        sideband::Busy::set_bit(&mut packet, false);
        self.regs.insert(self.sideband.packet_reg(), packet);
    }
}

impl RegisterAccess for SimulatedPort {
    fn read(&mut self, offset: u32) -> u32 {
        self.accesses += 1;
        self.reg(offset)
    }

    fn write(&mut self, offset: u32, value: u32) {
        self.accesses += 1;

        if offset == self.layout.aux_ctl() {
            // Status bits are cleared by writing them as one.
            let old = self.reg(offset);
            let sticky = old & aux_ctl::STICKY_MASK & !(value & aux_ctl::STICKY_MASK);
            let ctl = (value & !aux_ctl::STICKY_MASK) | sticky;
            if aux_ctl::SendBusy::get_bit(value) {
                self.aux_transfer(ctl);
            } else {
                self.regs.insert(offset, ctl);
            }
        } else if offset == self.sideband.packet_reg() {
            self.sideband_transfer(value);
        } else {
            if offset == self.layout.control() {
                self.record(Event::PortControl(value));
            }
            self.regs.insert(offset, value);
        }
    }

    fn delay(&mut self, duration: Duration) {
        self.elapsed += duration;
        self.record(Event::Delay(duration));
    }
}
