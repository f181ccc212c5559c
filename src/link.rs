// DisplayPort link training tools
//
// Copyright (C) 2023, Intel Corporation

//! Link parameters negotiated with the sink and the link status it reports.

use std::fmt::{self, Display};

use clap::ValueEnum;
use serde::Deserialize;

use crate::phy::Level;
use crate::regs::dpcd;

/// Main link rate per lane.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LinkRate {
    /// 1.62 Gb/s (RBR).
    Rbr,
    /// 2.7 Gb/s (HBR).
    Hbr,
    /// 5.4 Gb/s (HBR2).
    Hbr2,
}

impl LinkRate {
    /// Decodes `MAX_LINK_RATE`/`LINK_BW_SET` value.
    pub fn from_dpcd(code: u8) -> Option<Self> {
        match code {
            0x06 => Some(Self::Rbr),
            0x0a => Some(Self::Hbr),
            0x14 => Some(Self::Hbr2),
            _ => None,
        }
    }

    /// Returns the `LINK_BW_SET` value.
    pub fn dpcd_code(&self) -> u8 {
        match self {
            Self::Rbr => 0x06,
            Self::Hbr => 0x0a,
            Self::Hbr2 => 0x14,
        }
    }

    /// Returns the rate in Mb/s.
    pub fn mbps(&self) -> u32 {
        u32::from(self.dpcd_code()) * 270
    }
}

impl Display for LinkRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Rbr => "1.62 Gb/s",
            Self::Hbr => "2.7 Gb/s",
            Self::Hbr2 => "5.4 Gb/s",
        };
        write!(f, "{s}")
    }
}

/// Number of main link lanes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LaneCount {
    One,
    Two,
    Four,
}

impl LaneCount {
    /// Decodes the lane count field of `MAX_LANE_COUNT`/`LANE_COUNT_SET`.
    pub fn from_dpcd(value: u8) -> Option<Self> {
        match u32::from(value) & dpcd::LANE_COUNT_MASK {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            4 => Some(Self::Four),
            _ => None,
        }
    }

    /// Number of active lanes.
    pub fn count(&self) -> usize {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Four => 4,
        }
    }
}

impl TryFrom<u8> for LaneCount {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_dpcd(value).ok_or_else(|| format!("Invalid lane count {value}"))
    }
}

impl Display for LaneCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.count())
    }
}

/// Link configuration of one training attempt.
///
/// Lane count and rate are fixed for the attempt, the drive level follows what the sink asks
/// for. Returned to the caller when training succeeds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LinkConfig {
    lane_count: LaneCount,
    link_rate: LinkRate,
    enhanced_framing: bool,
    level: Level,
}

impl LinkConfig {
    pub fn new(lane_count: LaneCount, link_rate: LinkRate, enhanced_framing: bool) -> Self {
        Self {
            lane_count,
            link_rate,
            enhanced_framing,
            level: Level::default(),
        }
    }

    pub fn lane_count(&self) -> LaneCount {
        self.lane_count
    }

    pub fn link_rate(&self) -> LinkRate {
        self.link_rate
    }

    pub fn enhanced_framing(&self) -> bool {
        self.enhanced_framing
    }

    /// Drive level currently applied to all lanes.
    pub fn level(&self) -> Level {
        self.level
    }

    pub(crate) fn set_level(&mut self, level: Level) {
        self.level = level;
    }

    pub fn max_vswing_reached(&self) -> bool {
        self.level.max_swing_reached()
    }

    pub fn max_preemphasis_reached(&self) -> bool {
        self.level.max_preemphasis_reached()
    }

    /// Returns the `LANE_COUNT_SET` value.
    pub fn lane_count_set(&self) -> u32 {
        let mut value = self.lane_count.count() as u32;
        if self.enhanced_framing {
            value |= dpcd::ENHANCED_FRAME_EN;
        }
        value
    }
}

impl Display for LinkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}, {}", self.lane_count, self.link_rate, self.level)
    }
}

/// Lane status reported by the sink in `LANEx_y_STATUS` and `LANE_ALIGN_STATUS_UPDATED`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TrainingStatus {
    lanes: [u8; 4],
    align: u8,
    lane_count: LaneCount,
}

impl TrainingStatus {
    /// Builds the status from the raw registers. Lanes beyond `lane_count` are ignored.
    pub fn from_registers(lane0_1: u8, lane2_3: u8, align: u8, lane_count: LaneCount) -> Self {
        Self {
            lanes: [lane0_1 & 0xf, lane0_1 >> 4, lane2_3 & 0xf, lane2_3 >> 4],
            align,
            lane_count,
        }
    }

    fn active(&self) -> &[u8] {
        &self.lanes[..self.lane_count.count()]
    }

    /// Returns `true` if `lane` has clock recovery done.
    pub fn lane_clock_recovery_done(&self, lane: usize) -> bool {
        self.lanes[lane] & dpcd::LANE_CR_DONE != 0
    }

    /// Returns `true` if `lane` is equalized and symbol locked.
    pub fn lane_equalized(&self, lane: usize) -> bool {
        let mask = dpcd::LANE_CHANNEL_EQ_DONE | dpcd::LANE_SYMBOL_LOCKED;
        self.lanes[lane] & mask == mask
    }

    /// All active lanes have clock recovery done.
    pub fn clock_recovery_done(&self) -> bool {
        self.active().iter().all(|s| s & dpcd::LANE_CR_DONE != 0)
    }

    /// All active lanes have channel equalization done and symbol lock.
    pub fn channel_eq_done(&self) -> bool {
        (0..self.lane_count.count()).all(|lane| self.lane_equalized(lane))
    }

    /// Inter-lane alignment is done.
    pub fn interlane_align_done(&self) -> bool {
        self.align & dpcd::INTERLANE_ALIGN_DONE != 0
    }
}

/// Drive levels the sink asks for in `ADJUST_REQUEST_LANEx_y`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AdjustRequest {
    lanes: [(u8, u8); 4],
}

impl AdjustRequest {
    pub fn from_registers(lane0_1: u8, lane2_3: u8) -> Self {
        let split = |v: u8| ((v & 0x3, (v >> 2) & 0x3), ((v >> 4) & 0x3, (v >> 6) & 0x3));
        let (l0, l1) = split(lane0_1);
        let (l2, l3) = split(lane2_3);
        Self {
            lanes: [l0, l1, l2, l3],
        }
    }

    /// Requested `(swing, preemphasis)` of `lane`.
    pub fn lane(&self, lane: usize) -> (u8, u8) {
        self.lanes[lane]
    }

    /// Coalesces the requests of the active lanes into one level.
    ///
    /// Independent per-lane drive settings are optional for the transmitter so the highest
    /// swing and highest pre-emphasis requested by any active lane is used. The result is
    /// clamped to a legal combination.
    pub fn coalesce(&self, lane_count: LaneCount) -> Level {
        let active = &self.lanes[..lane_count.count()];
        let swing = active.iter().map(|l| l.0).max().unwrap_or(0);
        let preemphasis = active.iter().map(|l| l.1).max().unwrap_or(0);
        Level::clamped(swing, preemphasis)
    }
}
