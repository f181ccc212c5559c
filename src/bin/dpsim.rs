// Run DisplayPort link training against a simulated sink
//
// Copyright (C) 2023, Intel Corporation

use ansi_term::Colour::{Cyan, Green, Red, White};
use clap::Parser;
use std::io::{self, ErrorKind, IsTerminal};
use std::path::PathBuf;
use std::process;

use dplink::{
    dpcd::Capabilities,
    generation::{self, Generation, PortId},
    link::LinkRate,
    sim::{ScriptedSink, SimulatedPort, SinkModel},
    training::{PortTrainingContext, TrainingConfig},
};

#[derive(Parser, Debug)]
#[command(version)]
#[command(about = "Run DisplayPort link training against a simulated sink", long_about = None)]
struct Args {
    /// Built-in generation name or path to a generation description file
    #[arg(short, long, default_value = generation::DEFAULT_GENERATION)]
    generation: String,
    /// Transmitter port
    #[arg(short, long, value_enum, default_value_t = PortId::B)]
    port: PortId,
    /// Maximum link rate of the sink (overrides the scenario)
    #[arg(short, long, value_enum)]
    rate: Option<LinkRate>,
    /// Maximum lane count of the sink (overrides the scenario)
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(1..=4))]
    lanes: Option<u8>,
    /// Upper bound of clock recovery iterations
    #[arg(short = 'I', long)]
    cr_iterations: Option<u32>,
    /// Print everything the transmitter did
    #[arg(short, long)]
    events: bool,
    /// Verbose output (use multiple times to get more detailed output)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Sink behavior description in JSON (default sink trains at the lowest level)
    scenario: Option<PathBuf>,
}

fn color_time(value: &str) -> String {
    if io::stdout().is_terminal() {
        White.bold().paint(value.to_string()).to_string()
    } else {
        value.to_string()
    }
}

fn color_value(value: &str) -> String {
    if io::stdout().is_terminal() {
        Cyan.paint(value.to_string()).to_string()
    } else {
        value.to_string()
    }
}

fn color_result(ok: bool, msg: &str) -> String {
    if io::stdout().is_terminal() {
        if ok {
            Green.bold().paint(msg).to_string()
        } else {
            Red.bold().paint(msg).to_string()
        }
    } else {
        msg.to_string()
    }
}

fn run(args: &Args) -> io::Result<bool> {
    let generation = if Generation::builtins().iter().any(|g| g == &args.generation) {
        Generation::builtin(&args.generation)?
    } else {
        Generation::from_file(&args.generation)?
    };

    let mut script = match &args.scenario {
        Some(path) => ScriptedSink::from_file(path)?,
        None => ScriptedSink::default(),
    };
    if let Some(rate) = args.rate {
        script.max_link_rate = rate;
    }
    if let Some(lanes) = args.lanes {
        script.max_lane_count = lanes;
    }

    let mut port =
        SimulatedPort::with_generation(&generation, args.port, SinkModel::with_script(script))
            .ok_or_else(|| {
                io::Error::new(
                    ErrorKind::NotFound,
                    format!("{} has no port {}", generation, args.port),
                )
            })?;

    let dpcd = port.dpcd();
    let caps = Capabilities::probe(&mut port, &dpcd)?;
    println!("Sink: {}", color_value(&caps.to_string()));

    let mut config = TrainingConfig::default();
    if let Some(limit) = args.cr_iterations {
        config.set_cr_iteration_limit(limit);
    }

    let mut ctx = PortTrainingContext::new(&generation, args.port, caps)?.with_config(config);
    let result = ctx.train(&mut port);

    if args.events {
        for (time, event) in port.events() {
            println!(
                "{} {}",
                color_time(&format!("[{:>10.6}]", time.as_secs_f64())),
                event
            );
        }
    }

    println!(
        "Clock recovery polls: {}, equalization polls: {}, AUX requests: {}",
        color_value(&port.sink().cr_polls().to_string()),
        color_value(&port.sink().eq_polls().to_string()),
        color_value(&port.sink().aux_attempts().to_string()),
    );
    println!(
        "Time spent waiting: {}",
        color_value(&format!("{} us", port.elapsed().as_micros()))
    );

    match result {
        Ok(link) => {
            println!("{}: {}", color_result(true, "Trained"), link);
            Ok(true)
        }
        Err(err) => {
            println!("{}: {}", color_result(false, "Failed"), err);
            Ok(false)
        }
    }
}

fn main() {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(&args) {
        Ok(true) => (),
        Ok(false) => process::exit(2),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}
