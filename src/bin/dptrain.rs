// Train DisplayPort link
//
// Copyright (C) 2023, Intel Corporation

use ansi_term::Colour::{Cyan, Green, Red};
use clap::Parser;
use nix::unistd::Uid;
use std::io::{self, ErrorKind, IsTerminal};
use std::process;

use dplink::{
    dpcd::Capabilities,
    generation::{self, Generation, PortId},
    link::{LaneCount, LinkRate},
    mmio::{self, DisplayController},
    training::{PortTrainingContext, TrainingConfig},
};

#[derive(Parser, Debug)]
#[command(version)]
#[command(about = "Train DisplayPort link", long_about = None)]
struct Args {
    /// PCI name of the display controller (default is the first one found)
    #[arg(short, long)]
    device: Option<String>,
    /// Built-in generation name or path to a generation description file
    #[arg(short, long, default_value = generation::DEFAULT_GENERATION)]
    generation: String,
    /// Transmitter port
    #[arg(short, long, value_enum, default_value_t = PortId::B)]
    port: PortId,
    /// Limit number of lanes
    #[arg(short, long, value_parser = parse_lanes)]
    lanes: Option<LaneCount>,
    /// Limit link rate
    #[arg(short, long, value_enum)]
    rate: Option<LinkRate>,
    /// Feed the port from pipe B
    #[arg(short = 'B', long)]
    pipe_b: bool,
    /// Only probe and print sink capabilities
    #[arg(short = 'n', long)]
    probe: bool,
    /// Verbose output (use multiple times to get more detailed output)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_lanes(s: &str) -> Result<LaneCount, String> {
    let lanes: u8 = s.parse().map_err(|_| String::from("Invalid lane count"))?;
    LaneCount::try_from(lanes)
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

fn load_generation(name: &str) -> io::Result<Generation> {
    if Generation::builtins().iter().any(|g| g == name) {
        Generation::builtin(name)
    } else {
        Generation::from_file(name)
    }
}

fn controller(args: &Args) -> io::Result<DisplayController> {
    let mut controllers = mmio::find_display_controllers()?;

    match &args.device {
        Some(name) => controllers
            .into_iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("no controller {name}"))),
        None => Ok(controllers.remove(0)),
    }
}

fn train(args: &Args) -> io::Result<()> {
    let generation = load_generation(&args.generation)?;
    let controller = controller(args)?;
    let mut regs = controller.mmio()?;

    let port = generation.port(args.port).ok_or_else(|| {
        io::Error::new(
            ErrorKind::NotFound,
            format!("{} has no port {}", generation, args.port),
        )
    })?;

    let caps = Capabilities::probe(&mut regs, &port.dpcd())?;

    println!("Controller: {}", color_value(&controller.to_string()));
    println!("Port: {} ({})", color_value(&port.id().to_string()), generation);
    println!("Sink: {}", color_value(&caps.to_string()));

    if args.probe {
        return Ok(());
    }

    let mut config = TrainingConfig::default();
    config.set_lane_count(args.lanes);
    config.set_link_rate(args.rate);

    let mut ctx = PortTrainingContext::new(&generation, args.port, caps)?
        .with_config(config)
        .with_pipe_b(args.pipe_b);

    match ctx.train(&mut regs) {
        Ok(link) => {
            println!("{}: {}", color_result(true, "Trained"), link);
            Ok(())
        }
        Err(err) => {
            println!("{}: {}", color_result(false, "Failed"), err);
            Err(err.into())
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

    if !Uid::current().is_root() {
        eprintln!("Error: register access requires root permissions");
        process::exit(1);
    }

    train(&args).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        if e.kind() == ErrorKind::NotFound {
            eprintln!("Check that the controller and the port exist and a sink is connected");
        }
        process::exit(1);
    });
}
