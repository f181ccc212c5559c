// DisplayPort link training tools
//
// Copyright (C) 2023, Intel Corporation

//! Silicon generation specific data.
//!
//! Register offsets of the transmitter ports, the PHY sideband bus registers and the PHY tuning
//! values of each drive level are different between display controller generations. They are
//! described in JSON, one file per generation. The built-in ones live in
//! `src/data/generations` and are embedded into the binary:
//!
//! ```json
//! {
//!   "name": "valleyview",
//!   "sideband": { "packet": "0x2100", "data": "0x2104", "address": "0x2108", "port": "0x12" },
//!   "ports": [
//!     { "port": "B", "control": "0x64100", "aux_ctl": "0x64110", "phy_base": "0x8200" }
//!   ],
//!   "tuning": [
//!     { "swing": 0, "preemphasis": 0, "writes": [["0x94", "0x00000000"], ...] },
//!     ...
//!   ]
//! }
//! ```
//!
//! Every legal drive level must have an entry in `tuning`.

use std::fmt::{self, Display};
use std::io::{Error, ErrorKind, Result};
use std::path::Path;

use clap::ValueEnum;
use serde::Deserialize;

use crate::aux::AuxChannel;
use crate::dpcd::{Dpcd, DATA_DIR};
use crate::phy::{Level, Phy, PhyTable, Sideband, TuningEntry};
use crate::util;

/// Generation used when none is given.
pub const DEFAULT_GENERATION: &str = "valleyview";

/// Transmitter port.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, ValueEnum)]
pub enum PortId {
    A,
    B,
    C,
    D,
}

impl Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
        };
        write!(f, "{s}")
    }
}

/// Register layout of one transmitter port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortLayout {
    id: PortId,
    control: u32,
    aux_ctl: u32,
    phy_base: u32,
}

impl PortLayout {
    pub fn new(id: PortId, control: u32, aux_ctl: u32, phy_base: u32) -> Self {
        Self {
            id,
            control,
            aux_ctl,
            phy_base,
        }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    /// Offset of the port control register.
    pub fn control(&self) -> u32 {
        self.control
    }

    /// Offset of the AUX control register.
    pub fn aux_ctl(&self) -> u32 {
        self.aux_ctl
    }

    /// Base of the PHY tuning registers on the sideband bus.
    pub fn phy_base(&self) -> u32 {
        self.phy_base
    }

    pub fn aux_channel(&self) -> AuxChannel {
        AuxChannel::new(self.aux_ctl)
    }

    pub fn dpcd(&self) -> Dpcd {
        Dpcd::new(self.aux_channel())
    }
}

#[derive(Deserialize)]
struct RawSideband {
    packet: String,
    data: String,
    address: String,
    port: String,
}

#[derive(Deserialize)]
struct RawPort {
    port: PortId,
    control: String,
    aux_ctl: String,
    phy_base: String,
}

#[derive(Deserialize)]
struct RawTuning {
    swing: u8,
    preemphasis: u8,
    writes: Vec<(String, String)>,
}

#[derive(Deserialize)]
struct RawGeneration {
    name: String,
    sideband: RawSideband,
    ports: Vec<RawPort>,
    tuning: Vec<RawTuning>,
}

fn invalid_data(msg: String) -> Error {
    Error::new(ErrorKind::InvalidData, msg)
}

fn hex<T: num_traits::Num + std::str::FromStr>(s: &str, what: &str) -> Result<T> {
    util::parse_hex(s).ok_or_else(|| invalid_data(format!("invalid {what} '{s}'")))
}

/// Silicon generation description.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Generation {
    name: String,
    sideband: Sideband,
    ports: Vec<PortLayout>,
    table: PhyTable,
}

impl Generation {
    /// Returns the built-in generation called `name`.
    ///
    /// # Examples
    /// ```
    /// use dplink::generation::{Generation, PortId};
    ///
    /// let generation = Generation::builtin("valleyview").unwrap();
    /// let port = generation.port(PortId::B).unwrap();
    /// assert_eq!(port.aux_ctl(), 0x64110);
    /// ```
    pub fn builtin(name: &str) -> Result<Self> {
        let file = DATA_DIR
            .get_file(format!("generations/{name}.json"))
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("unknown generation {name}")))?;
        let json = file
            .contents_utf8()
            .ok_or_else(|| invalid_data(format!("generation {name} is not UTF-8")))?;

        Self::from_json(json)
    }

    /// Returns names of the built-in generations.
    pub fn builtins() -> Vec<String> {
        let mut names: Vec<String> = DATA_DIR
            .find("generations/*.json")
            .map(|entries| {
                entries
                    .filter_map(|e| e.as_file())
                    .filter_map(|f| f.path().file_stem()?.to_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Reads generation description from file at `path`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Parses generation description from JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawGeneration =
            serde_json::from_str(json).map_err(|e| invalid_data(e.to_string()))?;

        let sideband = Sideband::new(
            hex(&raw.sideband.packet, "sideband packet register")?,
            hex(&raw.sideband.data, "sideband data register")?,
            hex(&raw.sideband.address, "sideband address register")?,
            hex(&raw.sideband.port, "sideband port")?,
        );

        if raw.ports.is_empty() {
            return Err(invalid_data(format!("generation {} has no ports", raw.name)));
        }

        let mut ports: Vec<PortLayout> = Vec::with_capacity(raw.ports.len());
        for p in &raw.ports {
            if ports.iter().any(|l| l.id == p.port) {
                return Err(invalid_data(format!("port {} listed twice", p.port)));
            }
            ports.push(PortLayout::new(
                p.port,
                hex(&p.control, "port control register")?,
                hex(&p.aux_ctl, "AUX control register")?,
                hex(&p.phy_base, "PHY base")?,
            ));
        }

        let mut entries: Vec<TuningEntry> = Vec::with_capacity(raw.tuning.len());
        for t in &raw.tuning {
            let level = Level::new(t.swing, t.preemphasis)
                .map_err(|e| invalid_data(format!("tuning table: {e}")))?;
            if entries.iter().any(|e| e.level() == level) {
                return Err(invalid_data(format!("tuning table: {level} listed twice")));
            }
            let writes = t
                .writes
                .iter()
                .map(|(offset, value)| {
                    Ok((hex(offset, "PHY register")?, hex(value, "PHY value")?))
                })
                .collect::<Result<Vec<_>>>()?;
            entries.push(TuningEntry::new(level, writes));
        }

        let table = PhyTable::new(entries);
        if let Some(level) = table.missing_levels().first() {
            return Err(invalid_data(format!("tuning table: no entry for {level}")));
        }

        Ok(Self {
            name: raw.name,
            sideband,
            ports,
            table,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sideband(&self) -> &Sideband {
        &self.sideband
    }

    pub fn ports(&self) -> &[PortLayout] {
        &self.ports
    }

    /// Returns layout of port `id` if this generation has it.
    pub fn port(&self, id: PortId) -> Option<&PortLayout> {
        self.ports.iter().find(|p| p.id == id)
    }

    pub fn phy_table(&self) -> &PhyTable {
        &self.table
    }

    /// Returns drive level control of `port`.
    pub fn phy<'a>(&'a self, port: &PortLayout) -> Phy<'a> {
        Phy::new(&self.sideband, &self.table, port.phy_base)
    }
}

impl Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SMALL: &str = r#"{
        "name": "test",
        "sideband": { "packet": "0x100", "data": "0x104", "address": "0x108", "port": "0x1" },
        "ports": [ { "port": "A", "control": "0x10", "aux_ctl": "0x20", "phy_base": "0x1000" } ],
        "tuning": [
            { "swing": 0, "preemphasis": 0, "writes": [["0x0", "0x0"]] },
            { "swing": 1, "preemphasis": 0, "writes": [["0x0", "0x1"]] },
            { "swing": 2, "preemphasis": 0, "writes": [["0x0", "0x2"]] },
            { "swing": 3, "preemphasis": 0, "writes": [["0x0", "0x3"]] },
            { "swing": 0, "preemphasis": 1, "writes": [["0x0", "0x4"]] },
            { "swing": 1, "preemphasis": 1, "writes": [["0x0", "0x5"]] },
            { "swing": 2, "preemphasis": 1, "writes": [["0x0", "0x6"]] },
            { "swing": 0, "preemphasis": 2, "writes": [["0x0", "0x7"]] },
            { "swing": 1, "preemphasis": 2, "writes": [["0x0", "0x8"]] },
            { "swing": 0, "preemphasis": 3, "writes": [["0x0", "0x9"]] }
        ]
    }"#;

    #[test]
    fn builtin_tables_are_complete() {
        let names = Generation::builtins();
        assert!(names.contains(&String::from(DEFAULT_GENERATION)));

        for name in names {
            let generation = Generation::builtin(&name).unwrap();
            assert!(generation.phy_table().missing_levels().is_empty());
            assert!(!generation.ports().is_empty());
        }
    }

    #[test]
    fn valleyview() {
        let generation = Generation::builtin("valleyview").unwrap();
        let port = generation.port(PortId::C).unwrap();
        assert_eq!(port.control(), 0x64200);
        assert_eq!(port.phy_base(), 0x8400);
        assert!(generation.port(PortId::A).is_none());

        let entry = generation
            .phy_table()
            .lookup(Level::new(0, 3).unwrap())
            .unwrap();
        assert_eq!(entry.writes()[1], (0x90, 0x1b40_5555));
        assert_eq!(entry.writes().last(), Some(&(0x94, 0x8000_0000)));
    }

    #[test]
    fn unknown_builtin() {
        let err = Generation::builtin("nope").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn custom_table() {
        let generation = Generation::from_json(SMALL).unwrap();
        assert_eq!(generation.name(), "test");
        assert_eq!(generation.sideband().port(), 1);
        let entry = generation
            .phy_table()
            .lookup(Level::new(1, 2).unwrap())
            .unwrap();
        assert_eq!(entry.writes(), &[(0, 8)]);
    }

    #[test]
    fn rejects_incomplete_table() {
        let json = SMALL.replace(
            r#"{ "swing": 0, "preemphasis": 3, "writes": [["0x0", "0x9"]] }"#,
            r#"{ "swing": 2, "preemphasis": 2, "writes": [["0x0", "0x9"]] }"#,
        );
        let err = Generation::from_json(&json).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);

        let json = SMALL.replace(
            r#",
            { "swing": 0, "preemphasis": 3, "writes": [["0x0", "0x9"]] }"#,
            "",
        );
        let err = Generation::from_json(&json).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_bad_hex() {
        let json = SMALL.replace("\"0x10\"", "\"zz\"");
        assert!(Generation::from_json(&json).is_err());
    }
}
