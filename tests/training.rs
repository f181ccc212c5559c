// DisplayPort link training tools
//
// Copyright (C) 2023, Intel Corporation

use std::time::Duration;

use rand::prelude::*;

use dplink::{
    aux::{Command, Transaction, AUX_RETRY_LIMIT},
    dpcd::Capabilities,
    error::{AuxError, FailureCause, TrainingError},
    generation::{Generation, PortId, DEFAULT_GENERATION},
    link::{LaneCount, LinkConfig, LinkRate},
    phy::Level,
    regs::{dpcd, port},
    sim::{AuxFailure, ClockRecovery, Equalization, Event, ScriptedSink, SimulatedPort, SinkModel},
    training::{
        PortTrainingContext, TrainingConfig, EQ_ITERATION_LIMIT, EQ_PATTERN_DELAY, SETTLE_DELAY,
    },
};

fn generation() -> Generation {
    Generation::builtin(DEFAULT_GENERATION).unwrap()
}

fn train_with(
    script: ScriptedSink,
    config: TrainingConfig,
) -> (SimulatedPort, Result<LinkConfig, TrainingError>) {
    let generation = generation();
    let mut port = SimulatedPort::new(SinkModel::with_script(script));
    let dpcd = port.dpcd();
    let caps = Capabilities::probe(&mut port, &dpcd).unwrap();
    let mut ctx = PortTrainingContext::new(&generation, PortId::B, caps)
        .unwrap()
        .with_config(config);
    let result = ctx.train(&mut port);
    (port, result)
}

fn train(script: ScriptedSink) -> (SimulatedPort, Result<LinkConfig, TrainingError>) {
    train_with(script, TrainingConfig::default())
}

/// Returns the `TRAINING_LANEx_SET` writes in order.
fn lane_set_writes(port: &SimulatedPort) -> Vec<Vec<u8>> {
    port.events()
        .iter()
        .filter_map(|(_, e)| match e {
            Event::DpcdWrite { address, data } if *address == dpcd::TRAINING_LANE0_SET => {
                Some(data.clone())
            }
            _ => None,
        })
        .collect()
}

fn decode_lane_set(value: u8) -> (u8, u8) {
    (value & 0x3, (value >> 3) & 0x3)
}

/// Checks that each drive level told to the sink is legal, the same on all lanes and was
/// programmed to the PHY with its tuning values right before.
fn assert_electrically_legal(port: &SimulatedPort, generation: &Generation) {
    let base = port.layout().phy_base();
    let mut phy_writes = Vec::new();

    for (_, event) in port.events() {
        match event {
            Event::PhyWrite { reg, value } => phy_writes.push((reg - base, *value)),
            Event::DpcdWrite { address, data } if *address == dpcd::TRAINING_LANE0_SET => {
                let (swing, preemphasis) = decode_lane_set(data[0]);
                assert!(swing + preemphasis <= 3, "illegal level in {:#x}", data[0]);
                assert!(data.iter().all(|b| *b == data[0]));

                let level = Level::new(swing, preemphasis).unwrap();
                assert_eq!(data[0], level.lane_set());
                let entry = generation.phy_table().lookup(level).unwrap();
                assert_eq!(phy_writes.as_slice(), entry.writes());
                phy_writes.clear();
            }
            _ => (),
        }
    }
}

#[test]
fn aux_roundtrip() {
    let mut rng = StdRng::seed_from_u64(0x1234);
    let mut port = SimulatedPort::default();
    let dpcd = port.dpcd();

    for address in [0x300, 0x1000, 0x6_8000, 0xf_fffc] {
        for n in 1..=4u8 {
            let value: u32 = rng.gen();
            let mask = if n == 4 { !0 } else { (1u32 << (8 * n)) - 1 };

            dpcd.write(&mut port, address, n, value).unwrap();
            assert_eq!(dpcd.read(&mut port, address, n), Ok(value & mask));
        }
    }
}

#[test]
fn dpcd_access_size() {
    let mut port = SimulatedPort::default();
    let dpcd = port.dpcd();

    assert_eq!(dpcd.read(&mut port, 0, 0), Err(AuxError::InvalidLength(0)));
    assert_eq!(dpcd.write(&mut port, 0, 5, 0), Err(AuxError::InvalidLength(5)));
    assert_eq!(port.register_accesses(), 0);
}

#[test]
fn retry_bound() {
    for failure in [AuxFailure::Nack, AuxFailure::Defer, AuxFailure::Timeout] {
        let mut port = SimulatedPort::new(SinkModel::with_script(ScriptedSink {
            aux_failure: failure,
            ..Default::default()
        }));
        let aux = port.aux_channel();
        let tx = Transaction::read(Command::NativeRead, dpcd::REV, 1);

        port.sink_mut().set_responding(false);
        assert_eq!(aux.execute(&mut port, &tx), Err(AuxError::NoResponse));
        assert_eq!(port.sink().aux_attempts(), AUX_RETRY_LIMIT);

        port.sink_mut().set_responding(true);
        for k in 1..=AUX_RETRY_LIMIT {
            let before = port.sink().aux_attempts();
            port.sink_mut().fail_next_attempts(k - 1);
            let reply = aux.execute(&mut port, &tx).unwrap();
            assert_eq!(reply.as_bytes(), &[0x11]);
            assert_eq!(port.sink().aux_attempts() - before, k);
        }
    }
}

#[test]
fn scenario_happy_path() {
    let generation = generation();
    let (port, result) = train(ScriptedSink {
        max_link_rate: LinkRate::Hbr,
        max_lane_count: 4,
        clock_recovery: ClockRecovery::AtLevel([1, 0]),
        ..Default::default()
    });

    let link = result.unwrap();
    assert_eq!(link.lane_count(), LaneCount::Four);
    assert_eq!(link.link_rate(), LinkRate::Hbr);
    assert_eq!(link.level(), Level::new(1, 0).unwrap());

    let sink = port.sink();
    assert_eq!(sink.cr_polls(), 2);
    assert_eq!(sink.eq_polls(), 1);
    for lane in 0..4 {
        assert_eq!(sink.lane_level(lane), (1, 0));
    }
    assert_eq!(port.phy_level(&generation), Some(Level::new(1, 0).unwrap()));

    assert_eq!(sink.dpcd(dpcd::TRAINING_PATTERN_SET), 0);
    let ctl = port.port_control();
    assert_eq!(port::LinkTrain::get_field(ctl), port::LINK_TRAIN_OFF);
    assert_eq!(port::PortWidth::get_field(ctl), port::PORT_WIDTH_X4);
    assert!(!port::ScramblingDisable::get_bit(ctl));

    assert_electrically_legal(&port, &generation);
}

#[test]
fn scenario_clock_recovery_stall() {
    let (port, result) = train(ScriptedSink {
        clock_recovery: ClockRecovery::Never(vec![[0, 0]]),
        ..Default::default()
    });

    assert_eq!(
        result,
        Err(TrainingError::ClockRecoveryFailed(
            FailureCause::SameLevelRepeated(Level::default())
        ))
    );
    assert_eq!(port.sink().cr_polls(), 5);
    assert_eq!(port.sink().eq_polls(), 0);
    assert!(port.sink().equalization_entered().is_empty());

    assert_eq!(port.sink().dpcd(dpcd::TRAINING_PATTERN_SET), 0);
    assert_eq!(
        port::LinkTrain::get_field(port.port_control()),
        port::LINK_TRAIN_OFF
    );
}

#[test]
fn scenario_aux_loss() {
    let (port, result) = train(ScriptedSink {
        stop_responding_at_training: true,
        ..Default::default()
    });

    let err = result.unwrap_err();
    assert!(matches!(err, TrainingError::ClockRecoveryFailed(_)));
    assert_eq!(err.aux_error(), Some(AuxError::NoResponse));
    assert_eq!(port.sink().eq_polls(), 0);
    assert!(port.sink().equalization_entered().is_empty());
    assert_eq!(
        port::LinkTrain::get_field(port.port_control()),
        port::LINK_TRAIN_OFF
    );
}

#[test]
fn same_level_cap() {
    let (port, result) = train(ScriptedSink {
        clock_recovery: ClockRecovery::Never(vec![[1, 0]]),
        ..Default::default()
    });

    let level = Level::new(1, 0).unwrap();
    assert_eq!(
        result,
        Err(TrainingError::ClockRecoveryFailed(
            FailureCause::SameLevelRepeated(level)
        ))
    );

    let at_level = lane_set_writes(&port)
        .iter()
        .filter(|w| w[0] == level.lane_set())
        .count();
    assert_eq!(at_level, 5);
    assert_eq!(port.sink().cr_polls(), 6);
}

#[test]
fn alternating_requests_hit_iteration_limit() {
    let mut config = TrainingConfig::default();
    config.set_cr_iteration_limit(20);

    let (port, result) = train_with(
        ScriptedSink {
            clock_recovery: ClockRecovery::Never(vec![[1, 0], [0, 1]]),
            ..Default::default()
        },
        config,
    );

    assert_eq!(
        result,
        Err(TrainingError::ClockRecoveryFailed(
            FailureCause::IterationLimit(20)
        ))
    );
    assert_eq!(port.sink().cr_polls(), 20);
}

#[test]
fn clock_recovery_gating() {
    // Lane 2 never locks.
    let script = ScriptedSink {
        stuck_lanes: 1 << 2,
        ..Default::default()
    };

    let (port, result) = train(script.clone());
    assert!(matches!(result, Err(TrainingError::ClockRecoveryFailed(_))));
    assert!(port.sink().equalization_entered().is_empty());

    // Not a problem if the lane is not used.
    let mut config = TrainingConfig::default();
    config.set_lane_count(Some(LaneCount::Two));
    let (port, result) = train_with(script, config);
    assert_eq!(result.unwrap().lane_count(), LaneCount::Two);
    assert_eq!(port.sink().equalization_entered(), &[true]);
}

#[test]
fn equalization_cap() {
    let (port, result) = train(ScriptedSink {
        equalization: Equalization {
            done_after: None,
            requests: vec![[1, 1], [2, 0]],
            ..Default::default()
        },
        ..Default::default()
    });

    assert_eq!(
        result,
        Err(TrainingError::EqualizationFailed(
            FailureCause::IterationLimit(EQ_ITERATION_LIMIT)
        ))
    );
    assert_eq!(port.sink().eq_polls(), EQ_ITERATION_LIMIT);
    assert_eq!(port.sink().equalization_entered(), &[true]);

    // Initial level during clock recovery and equalization, then one per poll but the last.
    assert_eq!(lane_set_writes(&port).len(), 2 + EQ_ITERATION_LIMIT as usize - 1);
    assert_eq!(port.sink().dpcd(dpcd::TRAINING_PATTERN_SET), 0);
}

#[test]
fn equalization_after_retries() {
    let (port, result) = train(ScriptedSink {
        equalization: Equalization {
            done_after: Some(3),
            requests: vec![[2, 1]],
            ..Default::default()
        },
        ..Default::default()
    });

    assert_eq!(result.unwrap().level(), Level::new(2, 1).unwrap());
    assert_eq!(port.sink().eq_polls(), 3);
}

#[test]
fn clock_recovery_lost_during_equalization() {
    let (port, result) = train(ScriptedSink {
        equalization: Equalization {
            done_after: None,
            clock_recovery_lost_at: Some(2),
            ..Default::default()
        },
        ..Default::default()
    });

    assert_eq!(
        result,
        Err(TrainingError::EqualizationFailed(
            FailureCause::ClockRecoveryLost
        ))
    );
    assert_eq!(port.sink().eq_polls(), 2);
}

#[test]
fn aux_loss_during_equalization() {
    let (port, result) = train(ScriptedSink {
        equalization: Equalization {
            done_after: None,
            stop_responding: true,
            ..Default::default()
        },
        ..Default::default()
    });

    let err = result.unwrap_err();
    assert!(matches!(err, TrainingError::EqualizationFailed(_)));
    assert_eq!(err.aux_error(), Some(AuxError::NoResponse));
    assert_eq!(port.sink().equalization_entered(), &[true]);
    assert_eq!(port.sink().eq_polls(), 0);

    let ctl = port.port_control();
    assert_eq!(port::LinkTrain::get_field(ctl), port::LINK_TRAIN_OFF);
    assert!(!port::ScramblingDisable::get_bit(ctl));
}

#[test]
fn electrical_legality() {
    let generation = generation();
    let mut rng = StdRng::seed_from_u64(0xd1_5b1a);

    for _ in 0..20 {
        // Raw requests include combinations that are not legal.
        let mut requests = || -> Vec<[u8; 2]> {
            (0..rng.gen_range(1..8))
                .map(|_| [rng.gen_range(0..4), rng.gen_range(0..4)])
                .collect()
        };
        let cr = requests();
        let eq = requests();

        let mut config = TrainingConfig::default();
        config.set_cr_iteration_limit(12);

        let (port, result) = train_with(
            ScriptedSink {
                clock_recovery: ClockRecovery::Never(cr),
                ..Default::default()
            },
            config,
        );
        assert!(result.is_err());
        assert_electrically_legal(&port, &generation);

        let (port, result) = train(ScriptedSink {
            equalization: Equalization {
                done_after: None,
                requests: eq,
                ..Default::default()
            },
            ..Default::default()
        });
        assert!(result.is_err());
        assert_electrically_legal(&port, &generation);
    }
}

#[test]
fn training_is_turned_off_after_settle_delay() {
    let (port, result) = train(ScriptedSink::default());
    assert!(result.is_ok());

    let controls: Vec<_> = port
        .events()
        .iter()
        .filter_map(|(time, e)| match e {
            Event::PortControl(value) => Some((*time, *value)),
            _ => None,
        })
        .collect();

    let (idle_at, idle) = controls[controls.len() - 2];
    let (off_at, off) = controls[controls.len() - 1];
    assert_eq!(port::LinkTrain::get_field(idle), port::LINK_TRAIN_IDLE);
    assert_eq!(port::LinkTrain::get_field(off), port::LINK_TRAIN_OFF);
    assert_eq!(off_at - idle_at, SETTLE_DELAY);

    // Four lanes are put idle before the port is disabled.
    let (_, first) = controls[0];
    assert_eq!(port::LinkTrain::get_field(first), port::LINK_TRAIN_IDLE);
    assert_eq!(controls[1].0 - controls[0].0, SETTLE_DELAY);
    assert!(!port::Enable::get_bit(controls[1].1));
}

#[test]
fn equalization_waits_for_pattern() {
    let (port, result) = train(ScriptedSink::default());
    assert!(result.is_ok());

    let events: Vec<_> = port.events().iter().map(|(_, e)| e).collect();
    let pattern_2 = events
        .iter()
        .position(|e| {
            matches!(e, Event::DpcdWrite { address, data }
                if *address == dpcd::TRAINING_PATTERN_SET && data[0] & 0x3 == 2)
        })
        .unwrap();
    assert_eq!(*events[pattern_2 + 1], Event::Delay(EQ_PATTERN_DELAY));
    assert!(matches!(events[pattern_2 + 2], Event::PhyWrite { .. }));
}

#[test]
fn read_interval_from_sink() {
    let (port, result) = train(ScriptedSink {
        aux_rd_interval: 1,
        ..Default::default()
    });
    assert!(result.is_ok());

    let waits = port
        .events()
        .iter()
        .filter(|(_, e)| *e == Event::Delay(Duration::from_millis(4)))
        .count();
    // One clock recovery poll and one equalization poll.
    assert_eq!(waits, 2);
}

#[test]
fn survives_transient_aux_failures() {
    let generation = generation();
    let mut port = SimulatedPort::default();
    let dpcd = port.dpcd();
    let caps = Capabilities::probe(&mut port, &dpcd).unwrap();

    port.sink_mut().fail_next_attempts(AUX_RETRY_LIMIT - 1);

    let mut ctx = PortTrainingContext::new(&generation, PortId::B, caps).unwrap();
    assert!(ctx.train(&mut port).is_ok());
}

#[test]
fn no_sink() {
    let mut port = SimulatedPort::default();
    port.sink_mut().set_responding(false);
    let dpcd = port.dpcd();
    let err = Capabilities::probe(&mut port, &dpcd).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
}

#[test]
fn other_port() {
    let generation = generation();
    let mut port =
        SimulatedPort::with_generation(&generation, PortId::C, SinkModel::default()).unwrap();
    let dpcd = port.dpcd();
    let caps = Capabilities::probe(&mut port, &dpcd).unwrap();

    let mut ctx = PortTrainingContext::new(&generation, PortId::C, caps).unwrap();
    assert!(ctx.train(&mut port).is_ok());
    assert_eq!(port.phy_level(&generation), Some(Level::default()));
    assert!(port::Enable::get_bit(port.port_control()));
}

#[test]
fn bundled_scenarios() {
    let dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("scenarios");
    let expected = [
        ("happy-path.json", true),
        ("clock-recovery-stall.json", false),
        ("aux-loss.json", false),
        ("equalization-retries.json", true),
    ];

    for (name, ok) in expected {
        let script = ScriptedSink::from_file(dir.join(name)).unwrap();
        let (_, result) = train(script);
        assert_eq!(result.is_ok(), ok, "{name}: {result:?}");
    }
}
