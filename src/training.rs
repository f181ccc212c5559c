// DisplayPort link training tools
//
// Copyright (C) 2023, Intel Corporation

//! Link training.
//!
//! Training runs in two phases. During clock recovery the transmitter sends training pattern 1
//! and adjusts the drive level as the sink asks until every active lane has locked. Channel
//! equalization then switches to training pattern 2 and continues adjusting until every lane
//! is equalized, symbol locked and the lanes are aligned. Whatever the result, the training
//! patterns are turned off at the end.
//!
//! # Examples
//! ```no_run
//! # use std::io;
//! use dplink::dpcd::Capabilities;
//! use dplink::generation::{Generation, PortId};
//! use dplink::mmio;
//! use dplink::training::PortTrainingContext;
//!
//! # fn main() -> io::Result<()> {
//! let generation = Generation::builtin("valleyview")?;
//! let mut regs = mmio::find_display_controllers()?.remove(0).mmio()?;
//!
//! let port = generation.port(PortId::B).unwrap();
//! let caps = Capabilities::probe(&mut regs, &port.dpcd())?;
//!
//! let mut ctx = PortTrainingContext::new(&generation, PortId::B, caps)?;
//! let link = ctx.train(&mut regs)?;
//! println!("trained {}", link);
//! # Ok(())
//! # }
//! ```

use std::fmt::{self, Display};
use std::io::{Error, ErrorKind, Result};
use std::task::Poll;
use std::time::Duration;

use log::{debug, warn};

use crate::access::{self, RegisterAccess};
use crate::dpcd::{Capabilities, Dpcd};
use crate::error::{AuxError, FailureCause, TrainingError};
use crate::generation::{Generation, PortId, PortLayout};
use crate::link::{AdjustRequest, LaneCount, LinkConfig, LinkRate, TrainingStatus};
use crate::phy::{Level, Phy};
use crate::regs::{dpcd, port};

/// Consecutive clock recovery iterations the sink may request the same level.
pub const CR_SAME_LEVEL_LIMIT: u32 = 5;

/// Equalization status polls before giving up.
pub const EQ_ITERATION_LIMIT: u32 = 5;

/// Shortest wait before reading status during clock recovery.
pub const CR_INTERVAL_FLOOR: Duration = Duration::from_micros(100);

/// Shortest wait before reading status during channel equalization.
pub const EQ_INTERVAL_FLOOR: Duration = Duration::from_micros(400);

/// Wait between idle pattern and disabling training on the transmitter.
pub const SETTLE_DELAY: Duration = Duration::from_millis(17);

/// Wait after switching to pattern 2 before the drive level is applied again.
pub const EQ_PATTERN_DELAY: Duration = Duration::from_millis(1);

/// Waits selected by `TRAINING_AUX_RD_INTERVAL`, in microseconds.
const AUX_RD_INTERVALS: [u64; 5] = [400, 4000, 8000, 12000, 16000];

/// Returns the wait before reading lane status.
///
/// Zero `code` means the sink did not specify one and `floor` is used. Values past the table
/// use its last entry.
pub fn read_interval(code: u8, floor: Duration) -> Duration {
    if code == 0 {
        return floor;
    }
    let index = usize::from(code).min(AUX_RD_INTERVALS.len() - 1);
    Duration::from_micros(AUX_RD_INTERVALS[index]).max(floor)
}

/// Training parameters.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TrainingConfig {
    cr_iteration_limit: u32,
    settle_delay: Duration,
    lane_count: Option<LaneCount>,
    link_rate: Option<LinkRate>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            // Every legal level requested the maximum number of times.
            cr_iteration_limit: Level::all().count() as u32 * CR_SAME_LEVEL_LIMIT,
            settle_delay: SETTLE_DELAY,
            lane_count: None,
            link_rate: None,
        }
    }
}

impl TrainingConfig {
    /// Upper bound of clock recovery iterations no matter what the sink requests.
    pub fn cr_iteration_limit(&self) -> u32 {
        self.cr_iteration_limit
    }

    pub fn set_cr_iteration_limit(&mut self, limit: u32) {
        self.cr_iteration_limit = limit.max(1);
    }

    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    pub fn set_settle_delay(&mut self, delay: Duration) {
        self.settle_delay = delay;
    }

    /// Train with at most `lane_count` lanes.
    pub fn set_lane_count(&mut self, lane_count: Option<LaneCount>) {
        self.lane_count = lane_count;
    }

    /// Train at most at `link_rate`.
    pub fn set_link_rate(&mut self, link_rate: Option<LinkRate>) {
        self.link_rate = link_rate;
    }
}

/// Training state of a port.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    ClockRecovery,
    Equalization,
    Done,
    Failed,
}

impl Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::ClockRecovery => "clock recovery",
            Self::Equalization => "channel equalization",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Everything needed to train one port. Owned by the caller.
pub struct PortTrainingContext<'a> {
    port: &'a PortLayout,
    phy: Phy<'a>,
    dpcd: Dpcd,
    caps: Capabilities,
    config: TrainingConfig,
    pipe_b: bool,
    state: State,
}

impl<'a> PortTrainingContext<'a> {
    /// Creates context for port `id` of `generation` connected to a sink with `caps`.
    ///
    /// Returns [`ErrorKind::NotFound`] if the generation has no such port.
    pub fn new(generation: &'a Generation, id: PortId, caps: Capabilities) -> Result<Self> {
        let port = generation.port(id).ok_or_else(|| {
            Error::new(
                ErrorKind::NotFound,
                format!("{} has no port {}", generation, id),
            )
        })?;

        Ok(Self {
            port,
            phy: generation.phy(port),
            dpcd: port.dpcd(),
            caps,
            config: TrainingConfig::default(),
            pipe_b: false,
            state: State::Idle,
        })
    }

    pub fn with_config(mut self, config: TrainingConfig) -> Self {
        self.config = config;
        self
    }

    /// Feed the port from pipe B instead of pipe A.
    pub fn with_pipe_b(mut self, pipe_b: bool) -> Self {
        self.pipe_b = pipe_b;
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn dpcd(&self) -> &Dpcd {
        &self.dpcd
    }

    pub fn phy(&self) -> &Phy<'a> {
        &self.phy
    }

    fn set_state(&mut self, state: State) {
        debug!("port {}: {} -> {}", self.port.id(), self.state, state);
        self.state = state;
    }

    /// Link the training starts with: sink maximums limited by the configuration.
    fn initial_link(&self) -> LinkConfig {
        let lane_count = match self.config.lane_count {
            Some(lanes) => lanes.min(self.caps.max_lane_count()),
            None => self.caps.max_lane_count(),
        };
        let link_rate = match self.config.link_rate {
            Some(rate) => rate.min(self.caps.max_link_rate()),
            None => self.caps.max_link_rate(),
        };
        LinkConfig::new(lane_count, link_rate, self.caps.enhanced_framing())
    }

    /// Trains the link.
    ///
    /// Returns the link configuration reached when both phases succeed. The training patterns
    /// are turned off on the transmitter and the sink whether training succeeds or not.
    pub fn train<R>(&mut self, regs: &mut R) -> std::result::Result<LinkConfig, TrainingError>
    where
        R: RegisterAccess + ?Sized,
    {
        self.state = State::Idle;

        let mut link = self.initial_link();
        debug!("port {}: training {}", self.port.id(), link);

        let result = self.clock_recovery(regs, &mut link);
        let result = match result {
            Ok(()) => self
                .equalization(regs, &mut link)
                .map_err(TrainingError::EqualizationFailed),
            Err(cause) => Err(TrainingError::ClockRecoveryFailed(cause)),
        };

        self.stop_training(regs);

        match result {
            Ok(()) => {
                self.set_state(State::Done);
                debug!("port {}: trained {}", self.port.id(), link);
                Ok(link)
            }
            Err(err) => {
                self.set_state(State::Failed);
                debug!("port {}: {}", self.port.id(), err);
                Err(err)
            }
        }
    }

    fn port_control<R, F>(&self, regs: &mut R, f: F)
    where
        R: RegisterAccess + ?Sized,
        F: FnOnce(&mut u32),
    {
        access::modify(regs, self.port.control(), f);
    }

    fn set_pattern<R>(&self, regs: &mut R, pattern: u32)
    where
        R: RegisterAccess + ?Sized,
    {
        self.port_control(regs, |v| port::LinkTrain::set_field(v, pattern));
    }

    /// Enables the port with training pattern 1 and tells the sink about the link.
    fn start<R>(&self, regs: &mut R, link: &mut LinkConfig) -> std::result::Result<(), FailureCause>
    where
        R: RegisterAccess + ?Sized,
    {
        let lanes = link.lane_count();

        if lanes == LaneCount::Four {
            self.set_pattern(regs, port::LINK_TRAIN_IDLE);
            regs.delay(self.config.settle_delay);
        }

        self.port_control(regs, |v| port::Enable::set_bit(v, false));

        let width = match lanes {
            LaneCount::One => port::PORT_WIDTH_X1,
            LaneCount::Two => port::PORT_WIDTH_X2,
            LaneCount::Four => port::PORT_WIDTH_X4,
        };
        let enhanced_framing = link.enhanced_framing();
        let pipe_b = self.pipe_b;
        self.port_control(regs, |v| {
            port::PortWidth::set_field(v, width);
            port::EnhancedFraming::set_bit(v, enhanced_framing);
            port::PipeBSelect::set_bit(v, pipe_b);
            port::LinkTrain::set_field(v, port::LINK_TRAIN_PATTERN_1);
            port::ScramblingDisable::set_bit(v, true);
            port::Enable::set_bit(v, true);
        });

        self.dpcd
            .write(regs, dpcd::LANE_COUNT_SET, 1, link.lane_count_set())?;
        self.dpcd.write(
            regs,
            dpcd::LINK_BW_SET,
            1,
            link.link_rate().dpcd_code().into(),
        )?;
        self.dpcd.write(
            regs,
            dpcd::TRAINING_PATTERN_SET,
            1,
            dpcd::TRAINING_PATTERN_1 | dpcd::SCRAMBLING_DISABLE,
        )?;

        let level = Level::default();
        self.phy.apply_level(regs, &self.dpcd, lanes, level)?;
        link.set_level(level);

        Ok(())
    }

    fn read_status<R>(
        &self,
        regs: &mut R,
        lanes: LaneCount,
    ) -> std::result::Result<TrainingStatus, AuxError>
    where
        R: RegisterAccess + ?Sized,
    {
        let [lane0_1, lane2_3, align, _] =
            self.dpcd.read(regs, dpcd::LANE0_1_STATUS, 3)?.to_le_bytes();
        Ok(TrainingStatus::from_registers(lane0_1, lane2_3, align, lanes))
    }

    fn read_adjust_request<R>(&self, regs: &mut R) -> std::result::Result<AdjustRequest, AuxError>
    where
        R: RegisterAccess + ?Sized,
    {
        let [lane0_1, lane2_3, _, _] = self
            .dpcd
            .read(regs, dpcd::ADJUST_REQUEST_LANE0_1, 2)?
            .to_le_bytes();
        Ok(AdjustRequest::from_registers(lane0_1, lane2_3))
    }

    fn clock_recovery<R>(
        &mut self,
        regs: &mut R,
        link: &mut LinkConfig,
    ) -> std::result::Result<(), FailureCause>
    where
        R: RegisterAccess + ?Sized,
    {
        self.start(regs, link)?;
        self.set_state(State::ClockRecovery);

        let lanes = link.lane_count();
        let interval = read_interval(self.caps.aux_rd_interval(), CR_INTERVAL_FLOOR);
        let limit = self.config.cr_iteration_limit;
        let mut repeats = 0;

        let step = |regs: &mut R, iteration: u32| -> std::result::Result<_, FailureCause> {
            let status = self.read_status(regs, lanes)?;
            if status.clock_recovery_done() {
                debug!("clock recovery done after {} iterations", iteration);
                return Ok(Poll::Ready(()));
            }

            let applied = link.level();
            if applied.max_swing_reached() {
                return Err(FailureCause::MaxSwingReached(applied));
            }

            let requested = self.read_adjust_request(regs)?.coalesce(lanes);
            if requested == applied {
                repeats += 1;
                if repeats >= CR_SAME_LEVEL_LIMIT {
                    return Err(FailureCause::SameLevelRepeated(requested));
                }
            } else {
                repeats = 0;
            }

            self.phy.apply_level(regs, &self.dpcd, lanes, requested)?;
            link.set_level(requested);

            Ok(Poll::Pending)
        };
        let locked = access::poll_with_timeout(regs, interval, limit, step)?;

        locked.ok_or(FailureCause::IterationLimit(limit))
    }

    fn equalization<R>(
        &mut self,
        regs: &mut R,
        link: &mut LinkConfig,
    ) -> std::result::Result<(), FailureCause>
    where
        R: RegisterAccess + ?Sized,
    {
        self.set_state(State::Equalization);

        let lanes = link.lane_count();

        self.set_pattern(regs, port::LINK_TRAIN_PATTERN_2);
        self.dpcd.write(
            regs,
            dpcd::TRAINING_PATTERN_SET,
            1,
            dpcd::TRAINING_PATTERN_2 | dpcd::SCRAMBLING_DISABLE,
        )?;
        regs.delay(EQ_PATTERN_DELAY);
        self.phy.apply_level(regs, &self.dpcd, lanes, link.level())?;

        let interval = read_interval(self.caps.aux_rd_interval(), EQ_INTERVAL_FLOOR);

        let step = |regs: &mut R, iteration: u32| -> std::result::Result<_, FailureCause> {
            let status = self.read_status(regs, lanes)?;
            if !status.clock_recovery_done() {
                return Err(FailureCause::ClockRecoveryLost);
            }
            if status.channel_eq_done() && status.interlane_align_done() {
                debug!("channel equalization done after {} iterations", iteration);
                return Ok(Poll::Ready(()));
            }
            // No adjustment after the last poll
            if iteration == EQ_ITERATION_LIMIT {
                return Ok(Poll::Pending);
            }

            let requested = self.read_adjust_request(regs)?.coalesce(lanes);
            self.phy.apply_level(regs, &self.dpcd, lanes, requested)?;
            link.set_level(requested);

            Ok(Poll::Pending)
        };
        let done = access::poll_with_timeout(regs, interval, EQ_ITERATION_LIMIT, step)?;

        done.ok_or(FailureCause::IterationLimit(EQ_ITERATION_LIMIT))
    }

    /// Turns the training patterns off.
    ///
    /// The transmitter goes through the idle pattern first and must stay there for the settle
    /// delay before training is turned off.
    fn stop_training<R>(&self, regs: &mut R)
    where
        R: RegisterAccess + ?Sized,
    {
        if let Err(err) = self.dpcd.write(
            regs,
            dpcd::TRAINING_PATTERN_SET,
            1,
            dpcd::TRAINING_PATTERN_DISABLE,
        ) {
            warn!("port {}: failed to stop training on the sink: {}", self.port.id(), err);
        }

        self.port_control(regs, |v| {
            port::LinkTrain::set_field(v, port::LINK_TRAIN_IDLE);
            port::ScramblingDisable::set_bit(v, false);
        });
        regs.delay(self.config.settle_delay);
        self.set_pattern(regs, port::LINK_TRAIN_OFF);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::generation::DEFAULT_GENERATION;
    use crate::sim::{ClockRecovery, ScriptedSink, SimulatedPort, SinkModel};

    fn train(script: ScriptedSink) -> (SimulatedPort, std::result::Result<LinkConfig, TrainingError>) {
        let generation = Generation::builtin(DEFAULT_GENERATION).unwrap();
        let mut port = SimulatedPort::new(SinkModel::with_script(script));
        let dpcd = port.dpcd();
        let caps = Capabilities::probe(&mut port, &dpcd).unwrap();
        let mut ctx = PortTrainingContext::new(&generation, PortId::B, caps).unwrap();
        let result = ctx.train(&mut port);
        assert_eq!(
            ctx.state(),
            if result.is_ok() { State::Done } else { State::Failed }
        );
        (port, result)
    }

    #[test]
    fn read_intervals() {
        assert_eq!(read_interval(0, CR_INTERVAL_FLOOR), Duration::from_micros(100));
        assert_eq!(read_interval(0, EQ_INTERVAL_FLOOR), Duration::from_micros(400));
        assert_eq!(read_interval(1, CR_INTERVAL_FLOOR), Duration::from_millis(4));
        assert_eq!(read_interval(4, EQ_INTERVAL_FLOOR), Duration::from_millis(16));
        assert_eq!(read_interval(0x7f, EQ_INTERVAL_FLOOR), Duration::from_millis(16));
    }

    #[test]
    fn default_config() {
        let config = TrainingConfig::default();
        assert_eq!(config.cr_iteration_limit(), 50);
        assert_eq!(config.settle_delay(), Duration::from_millis(17));
    }

    #[test]
    fn unknown_port() {
        let generation = Generation::builtin(DEFAULT_GENERATION).unwrap();
        let caps = Capabilities::new(LinkRate::Hbr, LaneCount::Four);
        let err = PortTrainingContext::new(&generation, PortId::D, caps).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn trains_at_lowest_level() {
        let (port, result) = train(ScriptedSink::default());
        let link = result.unwrap();
        assert_eq!(link.level(), Level::default());
        assert_eq!(port.sink().cr_polls(), 1);
        assert_eq!(port.sink().eq_polls(), 1);
    }

    #[test]
    fn port_control_programming() {
        let (port, result) = train(ScriptedSink {
            max_lane_count: 2,
            ..Default::default()
        });
        assert!(result.is_ok());

        let ctl = port.port_control();
        assert!(port::Enable::get_bit(ctl));
        assert!(!port::PipeBSelect::get_bit(ctl));
        assert!(port::EnhancedFraming::get_bit(ctl));
        assert!(!port::ScramblingDisable::get_bit(ctl));
        assert_eq!(port::PortWidth::get_field(ctl), port::PORT_WIDTH_X2);
        assert_eq!(port::LinkTrain::get_field(ctl), port::LINK_TRAIN_OFF);
        assert_eq!(port.sink().dpcd(dpcd::LANE_COUNT_SET), 0x82);
        assert_eq!(port.sink().dpcd(dpcd::LINK_BW_SET), 0x0a);
        assert_eq!(port.sink().dpcd(dpcd::TRAINING_PATTERN_SET), 0);
    }

    #[test]
    fn max_swing_ends_clock_recovery() {
        let (port, result) = train(ScriptedSink {
            clock_recovery: ClockRecovery::Never(vec![[3, 0]]),
            ..Default::default()
        });
        let err = result.unwrap_err();
        assert_eq!(
            err,
            TrainingError::ClockRecoveryFailed(FailureCause::MaxSwingReached(
                Level::new(3, 0).unwrap()
            ))
        );
        assert_eq!(port.sink().cr_polls(), 2);
    }

    #[test]
    fn configuration_limits_link() {
        let generation = Generation::builtin(DEFAULT_GENERATION).unwrap();
        let mut port = SimulatedPort::new(SinkModel::new(LinkRate::Hbr2, LaneCount::Four));
        let dpcd = port.dpcd();
        let caps = Capabilities::probe(&mut port, &dpcd).unwrap();

        let mut config = TrainingConfig::default();
        config.set_lane_count(Some(LaneCount::Two));
        config.set_link_rate(Some(LinkRate::Rbr));

        let mut ctx = PortTrainingContext::new(&generation, PortId::B, caps)
            .unwrap()
            .with_config(config)
            .with_pipe_b(true);
        let link = ctx.train(&mut port).unwrap();
        assert_eq!(link.lane_count(), LaneCount::Two);
        assert_eq!(link.link_rate(), LinkRate::Rbr);
        assert!(port::PipeBSelect::get_bit(port.port_control()));
        assert_eq!(port.sink().dpcd(dpcd::LINK_BW_SET), 0x06);
    }
}
