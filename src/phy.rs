// DisplayPort link training tools
//
// Copyright (C) 2023, Intel Corporation

//! Transmitter drive levels.
//!
//! A drive level is a pair of voltage swing and pre-emphasis levels. Applying one programs the
//! PHY tuning registers of the port through the PHY sideband bus and then tells the sink about
//! the new level through `TRAINING_LANEx_SET`. The tuning values themselves come from the
//! [`Generation`](crate::generation::Generation) tables.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::task::Poll;
use std::time::Duration;

use log::{debug, trace};

use crate::access::{self, RegisterAccess};
use crate::dpcd::Dpcd;
use crate::error::ParamError;
use crate::link::LaneCount;
use crate::regs::{dpcd, sideband};

/// Highest sum of swing and pre-emphasis levels the hardware accepts.
pub const MAX_LEVEL_SUM: u8 = 3;

/// Number of reads of the sideband packet register before giving up on the busy bit.
const SIDEBAND_BUSY_POLL_LIMIT: u32 = 1000;

/// Voltage swing level.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VoltageSwing {
    /// 0.4 V
    #[default]
    Level0,
    /// 0.6 V
    Level1,
    /// 0.8 V
    Level2,
    /// 1.2 V
    Level3,
}

impl VoltageSwing {
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::Level0),
            1 => Some(Self::Level1),
            2 => Some(Self::Level2),
            3 => Some(Self::Level3),
            _ => None,
        }
    }

    pub fn index(&self) -> u8 {
        *self as u8
    }

    pub fn millivolts(&self) -> u32 {
        match self {
            Self::Level0 => 400,
            Self::Level1 => 600,
            Self::Level2 => 800,
            Self::Level3 => 1200,
        }
    }
}

impl Display for VoltageSwing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1} V", self.millivolts() as f64 / 1000.0)
    }
}

/// Pre-emphasis level.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PreEmphasis {
    /// 0 dB
    #[default]
    Level0,
    /// 3.5 dB
    Level1,
    /// 6 dB
    Level2,
    /// 9.5 dB
    Level3,
}

impl PreEmphasis {
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::Level0),
            1 => Some(Self::Level1),
            2 => Some(Self::Level2),
            3 => Some(Self::Level3),
            _ => None,
        }
    }

    pub fn index(&self) -> u8 {
        *self as u8
    }

    pub fn decibels(&self) -> f32 {
        match self {
            Self::Level0 => 0.0,
            Self::Level1 => 3.5,
            Self::Level2 => 6.0,
            Self::Level3 => 9.5,
        }
    }
}

impl Display for PreEmphasis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} dB", self.decibels())
    }
}

/// Legal combination of voltage swing and pre-emphasis.
///
/// The sum of the two level indices never exceeds [`MAX_LEVEL_SUM`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Level {
    swing: VoltageSwing,
    preemphasis: PreEmphasis,
}

impl Level {
    /// Creates a level from level indices.
    ///
    /// Returns [`ParamError::InvalidCombination`] if the indices are out of range or add up to
    /// more than 3.
    pub fn new(swing: u8, preemphasis: u8) -> Result<Self, ParamError> {
        let invalid = ParamError::InvalidCombination { swing, preemphasis };

        if swing.saturating_add(preemphasis) > MAX_LEVEL_SUM {
            return Err(invalid);
        }

        Ok(Self {
            swing: VoltageSwing::from_index(swing).ok_or(invalid)?,
            preemphasis: PreEmphasis::from_index(preemphasis).ok_or(invalid)?,
        })
    }

    /// Creates the closest legal level.
    ///
    /// Pre-emphasis is kept as requested and swing is lowered until the combination is legal.
    pub fn clamped(swing: u8, preemphasis: u8) -> Self {
        let preemphasis = preemphasis.min(MAX_LEVEL_SUM);
        let swing = swing.min(MAX_LEVEL_SUM - preemphasis);

        Self {
            swing: VoltageSwing::from_index(swing).unwrap_or_default(),
            preemphasis: PreEmphasis::from_index(preemphasis).unwrap_or_default(),
        }
    }

    /// Returns all legal levels ordered by pre-emphasis and then swing.
    pub fn all() -> impl Iterator<Item = Level> {
        (0..=MAX_LEVEL_SUM).flat_map(|preemphasis| {
            (0..=MAX_LEVEL_SUM - preemphasis).map(move |swing| Level::clamped(swing, preemphasis))
        })
    }

    pub fn swing(&self) -> VoltageSwing {
        self.swing
    }

    pub fn preemphasis(&self) -> PreEmphasis {
        self.preemphasis
    }

    pub fn max_swing_reached(&self) -> bool {
        self.swing == VoltageSwing::Level3
    }

    pub fn max_preemphasis_reached(&self) -> bool {
        self.preemphasis == PreEmphasis::Level3
    }

    /// Returns the `TRAINING_LANEx_SET` byte for this level.
    pub fn lane_set(&self) -> u8 {
        let mut value = self.swing.index() << dpcd::lane_set::SWING_SHIFT
            | self.preemphasis.index() << dpcd::lane_set::PREEMPHASIS_SHIFT;
        if self.max_swing_reached() {
            value |= dpcd::lane_set::MAX_SWING_REACHED;
        }
        if self.max_preemphasis_reached() {
            value |= dpcd::lane_set::MAX_PREEMPHASIS_REACHED;
        }
        value
    }
}

impl Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "swing {}, pre-emphasis {}", self.swing, self.preemphasis)
    }
}

/// PHY sideband bus registers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sideband {
    packet: u32,
    data: u32,
    address: u32,
    port: u8,
}

impl Sideband {
    /// Creates sideband access through the given registers targeting sideband `port`.
    pub fn new(packet: u32, data: u32, address: u32, port: u8) -> Self {
        Self {
            packet,
            data,
            address,
            port,
        }
    }

    pub fn packet_reg(&self) -> u32 {
        self.packet
    }

    pub fn data_reg(&self) -> u32 {
        self.data
    }

    pub fn address_reg(&self) -> u32 {
        self.address
    }

    pub fn port(&self) -> u8 {
        self.port
    }

    fn packet_value(&self, opcode: u32) -> u32 {
        let mut value = 0;
        sideband::ByteEnable::set_field(&mut value, sideband::BYTE_ENABLE_ALL);
        sideband::Port::set_field(&mut value, self.port.into());
        sideband::Opcode::set_field(&mut value, opcode);
        value
    }

    fn wait_idle<R>(&self, regs: &mut R, reg: u32) -> Result<(), ParamError>
    where
        R: RegisterAccess + ?Sized,
    {
        let packet = self.packet;
        let idle = access::poll_with_timeout(
            regs,
            Duration::ZERO,
            SIDEBAND_BUSY_POLL_LIMIT,
            |regs, _| -> Result<_, ParamError> {
                Ok(if sideband::Busy::get_bit(regs.read(packet)) {
                    Poll::Pending
                } else {
                    Poll::Ready(())
                })
            },
        )?;
        idle.ok_or(ParamError::SidebandTimeout(reg))
    }

    /// Writes PHY register `reg`.
    pub fn write<R>(&self, regs: &mut R, reg: u32, value: u32) -> Result<(), ParamError>
    where
        R: RegisterAccess + ?Sized,
    {
        self.wait_idle(regs, reg)?;
        trace!("sideband write {:#06x} <- {:#010x}", reg, value);
        regs.write(self.address, reg);
        regs.write(self.data, value);
        regs.write(self.packet, self.packet_value(sideband::OPCODE_WRITE));
        self.wait_idle(regs, reg)
    }

    /// Reads PHY register `reg`.
    pub fn read<R>(&self, regs: &mut R, reg: u32) -> Result<u32, ParamError>
    where
        R: RegisterAccess + ?Sized,
    {
        self.wait_idle(regs, reg)?;
        regs.write(self.address, reg);
        regs.write(self.packet, self.packet_value(sideband::OPCODE_READ));
        self.wait_idle(regs, reg)?;
        let value = regs.read(self.data);
        trace!("sideband read {:#06x} -> {:#010x}", reg, value);
        Ok(value)
    }
}

/// PHY register writes that program one drive level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TuningEntry {
    level: Level,
    writes: Vec<(u32, u32)>,
}

impl TuningEntry {
    /// `writes` are `(offset, value)` pairs in the order they are issued. Offsets are relative
    /// to the PHY base of the port.
    pub fn new(level: Level, writes: Vec<(u32, u32)>) -> Self {
        Self { level, writes }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn writes(&self) -> &[(u32, u32)] {
        &self.writes
    }

    /// Value each register holds once all the writes have been done.
    fn final_values(&self) -> HashMap<u32, u32> {
        self.writes.iter().copied().collect()
    }
}

/// Tuning values of every drive level.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PhyTable {
    entries: Vec<TuningEntry>,
}

impl PhyTable {
    pub fn new(entries: Vec<TuningEntry>) -> Self {
        Self { entries }
    }

    pub fn lookup(&self, level: Level) -> Option<&TuningEntry> {
        self.entries.iter().find(|e| e.level == level)
    }

    pub fn entries(&self) -> &[TuningEntry] {
        &self.entries
    }

    /// Returns the levels that have no tuning values.
    pub fn missing_levels(&self) -> Vec<Level> {
        Level::all().filter(|l| self.lookup(*l).is_none()).collect()
    }

    /// Every distinct PHY register offset the table touches.
    fn offsets(&self) -> Vec<u32> {
        let mut offsets: Vec<u32> = self
            .entries
            .iter()
            .flat_map(|e| e.writes.iter().map(|w| w.0))
            .collect();
        offsets.sort_unstable();
        offsets.dedup();
        offsets
    }
}

/// Drive level control of one port.
pub struct Phy<'a> {
    sideband: &'a Sideband,
    table: &'a PhyTable,
    base: u32,
}

impl<'a> Phy<'a> {
    /// `base` is the PHY register base of the port.
    pub fn new(sideband: &'a Sideband, table: &'a PhyTable, base: u32) -> Self {
        Self {
            sideband,
            table,
            base,
        }
    }

    /// Applies the drive level given as level indices.
    ///
    /// The combination is validated before anything is written.
    pub fn apply<R>(
        &self,
        regs: &mut R,
        dpcd: &Dpcd,
        lane_count: LaneCount,
        swing: u8,
        preemphasis: u8,
    ) -> Result<Level, ParamError>
    where
        R: RegisterAccess + ?Sized,
    {
        let level = Level::new(swing, preemphasis)?;
        self.apply_level(regs, dpcd, lane_count, level)?;
        Ok(level)
    }

    /// Applies `level` on all active lanes.
    ///
    /// The transmitter is programmed first and only then the sink is told the new level through
    /// `TRAINING_LANEx_SET`.
    pub fn apply_level<R>(
        &self,
        regs: &mut R,
        dpcd: &Dpcd,
        lane_count: LaneCount,
        level: Level,
    ) -> Result<(), ParamError>
    where
        R: RegisterAccess + ?Sized,
    {
        let entry = self
            .table
            .lookup(level)
            .ok_or(ParamError::MissingTuning(level))?;

        debug!("applying {}", level);

        for (offset, value) in entry.writes() {
            self.sideband.write(regs, self.base + offset, *value)?;
        }

        let lanes = lane_count.count() as u8;
        let value = u32::from_le_bytes([level.lane_set(); 4]);
        dpcd.write(regs, dpcd::TRAINING_LANE0_SET, lanes, value)?;

        Ok(())
    }

    /// Reads the tuning registers back and returns the level they match, if any.
    pub fn read_level<R>(&self, regs: &mut R) -> Result<Option<Level>, ParamError>
    where
        R: RegisterAccess + ?Sized,
    {
        let mut current = HashMap::new();
        for offset in self.table.offsets() {
            let value = self.sideband.read(regs, self.base + offset)?;
            current.insert(offset, value);
        }

        Ok(self
            .table
            .entries()
            .iter()
            .find(|e| e.final_values() == current)
            .map(|e| e.level()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::generation::{Generation, DEFAULT_GENERATION};
    use crate::sim::SimulatedPort;

    #[test]
    fn legal_levels() {
        assert_eq!(Level::all().count(), 10);
        assert!(Level::all().all(|l| l.swing().index() + l.preemphasis().index() <= 3));
        assert!(Level::new(3, 0).is_ok());
        assert!(Level::new(1, 2).is_ok());
        assert_eq!(
            Level::new(2, 2),
            Err(ParamError::InvalidCombination {
                swing: 2,
                preemphasis: 2
            })
        );
        assert!(Level::new(4, 0).is_err());
        assert!(Level::new(255, 255).is_err());
    }

    #[test]
    fn clamping_keeps_preemphasis() {
        assert_eq!(Level::clamped(3, 2), Level::new(1, 2).unwrap());
        assert_eq!(Level::clamped(2, 1), Level::new(2, 1).unwrap());
        assert_eq!(Level::clamped(3, 3), Level::new(0, 3).unwrap());
        assert_eq!(Level::clamped(7, 9), Level::new(0, 3).unwrap());
    }

    #[test]
    fn lane_set_byte() {
        assert_eq!(Level::default().lane_set(), 0x00);
        assert_eq!(Level::new(1, 0).unwrap().lane_set(), 0x01);
        assert_eq!(Level::new(3, 0).unwrap().lane_set(), 0x07);
        assert_eq!(Level::new(1, 2).unwrap().lane_set(), 0x11);
        assert_eq!(Level::new(0, 3).unwrap().lane_set(), 0x38);
    }

    #[test]
    fn display() {
        let level = Level::new(1, 1).unwrap();
        assert_eq!(level.to_string(), "swing 0.6 V, pre-emphasis 3.5 dB");
        assert_eq!(VoltageSwing::Level3.to_string(), "1.2 V");
        assert_eq!(PreEmphasis::Level2.to_string(), "6 dB");
    }

    #[test]
    fn missing_levels() {
        let table = PhyTable::new(vec![TuningEntry::new(Level::default(), vec![(0x94, 0)])]);
        assert_eq!(table.missing_levels().len(), 9);
        assert!(table.lookup(Level::default()).is_some());
    }

    #[test]
    fn sideband_packet() {
        let sideband = Sideband::new(0x2100, 0x2104, 0x2108, 0x12);
        assert_eq!(sideband.packet_value(sideband::OPCODE_WRITE), 0x0001_12f0);
        assert_eq!(sideband.packet_value(sideband::OPCODE_READ), 0x0000_12f0);
    }

    struct StuckSideband {
        port: SimulatedPort,
        packet: u32,
    }

    impl RegisterAccess for StuckSideband {
        fn read(&mut self, offset: u32) -> u32 {
            let mut value = self.port.read(offset);
            if offset == self.packet {
                sideband::Busy::set_bit(&mut value, true);
            }
            value
        }

        fn write(&mut self, offset: u32, value: u32) {
            self.port.write(offset, value)
        }
    }

    #[test]
    fn sideband_busy_timeout() {
        let generation = Generation::builtin(DEFAULT_GENERATION).unwrap();
        let sideband = generation.sideband();
        let mut stuck = StuckSideband {
            port: SimulatedPort::default(),
            packet: sideband.packet_reg(),
        };

        assert_eq!(
            sideband.write(&mut stuck, 0x8290, 0x2b40_5555),
            Err(ParamError::SidebandTimeout(0x8290))
        );
        assert_eq!(
            sideband.read(&mut stuck, 0x8290),
            Err(ParamError::SidebandTimeout(0x8290))
        );
        assert!(stuck.port.events().is_empty());
    }

    #[test]
    fn apply_and_read_back() {
        let generation = Generation::builtin(DEFAULT_GENERATION).unwrap();
        let mut port = SimulatedPort::default();
        let layout = port.layout().clone();
        let phy = generation.phy(&layout);
        let dpcd = layout.dpcd();

        assert_eq!(
            phy.apply(&mut port, &dpcd, LaneCount::Four, 2, 2),
            Err(ParamError::InvalidCombination {
                swing: 2,
                preemphasis: 2
            })
        );
        assert_eq!(port.register_accesses(), 0);

        let level = phy.apply(&mut port, &dpcd, LaneCount::Two, 2, 1).unwrap();
        assert_eq!(phy.read_level(&mut port), Ok(Some(level)));
        assert_eq!(port.sink().lane_level(0), (2, 1));
        assert_eq!(port.sink().lane_level(1), (2, 1));
        assert_eq!(port.sink().lane_level(2), (0, 0));
    }
}
