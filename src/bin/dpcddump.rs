// Dump DisplayPort sink DPCD registers
//
// Copyright (C) 2023, Intel Corporation

use ansi_term::Colour::{Cyan, Yellow};
use clap::Parser;
use csv::Writer;
use nix::unistd::Uid;
use std::io::{self, ErrorKind, IsTerminal};
use std::ops::RangeInclusive;
use std::process;

use dplink::{
    aux::AUX_MAX_ADDRESS,
    dpcd::{self, Register},
    generation::{self, Generation, PortId},
    mmio, util,
};

#[derive(Parser, Debug)]
#[command(version)]
#[command(about = "Dump DisplayPort sink DPCD registers", long_about = None)]
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
    /// Verbose output (use multiple times to get more detailed output)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Output suitable for scripting
    #[arg(short = 'S', long)]
    script: bool,
    /// Number of bytes to read
    #[arg(short = 'N', long, default_value_t = 16)]
    nbytes: u32,
    /// DPCD address or name of a register
    address: Option<String>,
}

fn address(args: &Args) -> u32 {
    match &args.address {
        Some(address) => util::parse_dpcd_address(address)
            .ok()
            .or_else(|| dpcd::address_by_name(address))
            .unwrap_or_else(|| {
                eprintln!("Error: Valid DPCD address or register name expected!");
                process::exit(1);
            }),
        None => 0,
    }
}

/// Registers to dump, clipped to the DPCD address space.
fn dump_range(start: u32, nbytes: u32) -> RangeInclusive<u32> {
    let end = start.saturating_add(nbytes.max(1) - 1).min(AUX_MAX_ADDRESS);
    start..=end
}

fn color_field_value(value: &str) -> String {
    if io::stdout().is_terminal() {
        Cyan.paint(format!("{:>6}", value)).to_string()
    } else {
        format!("{:>6}", value)
    }
}

fn color_field_value_name(name: &str) -> String {
    if io::stdout().is_terminal() {
        Cyan.bold().paint(name).to_string()
    } else {
        name.to_string()
    }
}

fn color_field_short_name(short_name: &str) -> String {
    if io::stdout().is_terminal() {
        Yellow.bold().paint(short_name).to_string()
    } else {
        String::from(short_name)
    }
}

fn dump_regs(regs: &[Register], args: &Args) {
    for reg in regs {
        if args.verbose > 0 {
            print!("0x{:05x} ", reg.address());
        }

        print!("0x{:02x}", reg.value());

        if args.verbose > 0 {
            if let Some(name) = reg.name() {
                print!(" {}", name);
            }
        }

        println!();

        if args.verbose > 1 {
            for field in reg.fields() {
                let v = reg.field_value(field);
                let value = color_field_value(&format!("{:#x}", v));
                let value_name = if let Some(value_name) = field.value_name(v) {
                    format!(" → {}", color_field_value_name(value_name))
                } else {
                    String::from("")
                };
                let short_name = if let Some(short_name) = field.short_name() {
                    format!(" ({})", color_field_short_name(short_name))
                } else {
                    String::from("")
                };
                println!(
                    "  [{}:{}] {} {}{}{}",
                    field.range().end(),
                    field.range().start(),
                    value,
                    field.name(),
                    short_name,
                    value_name,
                );
            }
        }
    }
}

fn dump_script(regs: &[Register]) -> io::Result<()> {
    let mut writer = Writer::from_writer(io::stdout());
    writer.write_record(["address", "value", "name"])?;

    for reg in regs {
        writer.write_record([
            format!("{:#07x}", reg.address()),
            format!("{:#04x}", reg.value()),
            reg.short_name().unwrap_or_default().to_string(),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

fn dump(args: &Args) -> io::Result<()> {
    let generation = if Generation::builtins().iter().any(|g| g == &args.generation) {
        Generation::builtin(&args.generation)?
    } else {
        Generation::from_file(&args.generation)?
    };
    let port = generation.port(args.port).ok_or_else(|| {
        io::Error::new(
            ErrorKind::NotFound,
            format!("{} has no port {}", generation, args.port),
        )
    })?;

    let mut controllers = mmio::find_display_controllers()?;
    let controller = match &args.device {
        Some(name) => controllers
            .into_iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("no controller {name}")))?,
        None => controllers.remove(0),
    };
    let mut mmio = controller.mmio()?;

    let regs = port
        .dpcd()
        .registers(&mut mmio, dump_range(address(args), args.nbytes))?;

    if args.script {
        dump_script(&regs)
    } else {
        dump_regs(&regs, args);
        Ok(())
    }
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose > 2 { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if !Uid::current().is_root() {
        eprintln!("Error: register access requires root permissions");
        process::exit(1);
    }

    dump(&args).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        if e.kind() == ErrorKind::TimedOut {
            eprintln!("Sink did not respond, is it connected?");
        }
        process::exit(1);
    });
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn range_is_clipped() {
        assert_eq!(dump_range(0x100, 16), 0x100..=0x10f);
        assert_eq!(dump_range(0x100, 0), 0x100..=0x100);
        assert_eq!(dump_range(0xf_fff0, 32), 0xf_fff0..=0xf_ffff);
        assert_eq!(dump_range(0x200, u32::MAX), 0x200..=0xf_ffff);
    }
}
