// DisplayPort link training tools
//
// Copyright (C) 2023, Intel Corporation

//! DisplayPort Configuration Data (DPCD) access.
//!
//! DPCD is the register space of the sink. It is read and written with native AUX transactions
//! through [`Dpcd`]. Register names and fields are described in `dpcd.json` and attached to the
//! values returned by [`Dpcd::registers()`].

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::io::{Error, ErrorKind, Result};
use std::ops::RangeInclusive;

use include_dir::{include_dir, Dir};
use lazy_static::lazy_static;
use log::debug;
use serde_json::Value;

use crate::access::RegisterAccess;
use crate::aux::{AuxChannel, Command, Transaction, AUX_MAX_PAYLOAD};
use crate::error::AuxError;
use crate::link::{LaneCount, LinkRate};
use crate::regs::dpcd;
use crate::util;

pub(crate) static DATA_DIR: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/src/data");

lazy_static! {
    // Pull in the register descriptions.
    static ref METADATA: Vec<Metadata> = {
        let names: Value = serde_json::from_str(
            DATA_DIR
                .get_file("dpcd.json")
                .unwrap()
                .contents_utf8()
                .unwrap(),
        )
        .unwrap();

        names["registers"]
            .as_array()
            .map(|regs| regs.iter().filter_map(Metadata::parse).collect())
            .unwrap_or_default()
    };
}

/// Largest number of bytes [`Dpcd::read()`] and [`Dpcd::write()`] transfer.
pub const DPCD_MAX_ACCESS: u8 = 4;

/// DPCD accessor of one sink.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Dpcd {
    aux: AuxChannel,
}

impl Dpcd {
    pub fn new(aux: AuxChannel) -> Self {
        Self { aux }
    }

    pub fn aux(&self) -> &AuxChannel {
        &self.aux
    }

    fn check_count(n: u8) -> std::result::Result<usize, AuxError> {
        if n == 0 || n > DPCD_MAX_ACCESS {
            return Err(AuxError::InvalidLength(n.into()));
        }
        Ok(n.into())
    }

    /// Reads `n` bytes (1 to 4) starting from `address`.
    ///
    /// The byte at `address` is returned in the lowest 8 bits.
    pub fn read<R>(&self, regs: &mut R, address: u32, n: u8) -> std::result::Result<u32, AuxError>
    where
        R: RegisterAccess + ?Sized,
    {
        let n = Self::check_count(n)?;
        let tx = Transaction::read(Command::NativeRead, address, n);
        let reply = self.aux.execute(regs, &tx)?;
        Ok(reply.to_u32())
    }

    /// Writes the `n` lowest bytes (1 to 4) of `value` starting from `address`.
    pub fn write<R>(
        &self,
        regs: &mut R,
        address: u32,
        n: u8,
        value: u32,
    ) -> std::result::Result<(), AuxError>
    where
        R: RegisterAccess + ?Sized,
    {
        let n = Self::check_count(n)?;
        let bytes = value.to_le_bytes();
        let tx = Transaction::write(Command::NativeWrite, address, &bytes[..n])?;
        self.aux.execute(regs, &tx)?;
        Ok(())
    }

    /// Same as [`read()`](Self::read()) but returns 0 if the sink could not be read.
    ///
    /// Only for probing where a missing value means the feature is absent.
    pub fn read_or_zero<R>(&self, regs: &mut R, address: u32, n: u8) -> u32
    where
        R: RegisterAccess + ?Sized,
    {
        self.read(regs, address, n).unwrap_or_else(|err| {
            debug!("DPCD {:#07x} not readable: {}", address, err);
            0
        })
    }

    /// Reads `len` bytes starting from `address` in transactions of up to 16 bytes.
    pub fn read_bytes<R>(
        &self,
        regs: &mut R,
        address: u32,
        len: usize,
    ) -> std::result::Result<Vec<u8>, AuxError>
    where
        R: RegisterAccess + ?Sized,
    {
        let mut bytes = Vec::with_capacity(len);

        while bytes.len() < len {
            let chunk = (len - bytes.len()).min(AUX_MAX_PAYLOAD);
            let tx = Transaction::read(Command::NativeRead, address + bytes.len() as u32, chunk);
            let reply = self.aux.execute(regs, &tx)?;
            if reply.as_bytes().is_empty() {
                return Err(AuxError::NoResponse);
            }
            bytes.extend_from_slice(reply.as_bytes());
        }

        bytes.truncate(len);
        Ok(bytes)
    }

    /// Reads `range` of DPCD and returns the values as registers with metadata attached.
    pub fn registers<R>(
        &self,
        regs: &mut R,
        range: RangeInclusive<u32>,
    ) -> std::result::Result<Vec<Register>, AuxError>
    where
        R: RegisterAccess + ?Sized,
    {
        if range.is_empty() {
            return Ok(Vec::new());
        }

        let start = *range.start();
        let len = (range.end() - start) as usize + 1;
        let bytes = self.read_bytes(regs, start, len)?;

        Ok(bytes
            .iter()
            .enumerate()
            .map(|(i, value)| Register::new(start + i as u32, *value))
            .collect())
    }
}

/// Field metadata description.
#[derive(Clone, Debug)]
pub struct BitField {
    range: RangeInclusive<u8>,
    name: String,
    short_name: Option<String>,
    value_names: Option<HashMap<u32, String>>,
}

impl BitField {
    /// Returns start and end bit range of the field (inclusive).
    pub fn range(&self) -> &RangeInclusive<u8> {
        &self.range
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn short_name(&self) -> Option<&str> {
        self.short_name.as_deref()
    }

    /// Returns name for the value if it is known.
    pub fn value_name(&self, value: u32) -> Option<&str> {
        self.value_names.as_ref()?.get(&value).map(|s| s.as_str())
    }

    fn parse_enum(value: &Value) -> Option<HashMap<u32, String>> {
        let values = value.get("values")?.as_array()?;

        let mut map = HashMap::new();

        for v in values {
            let value = v.get("value")?.as_u64()? as u32;
            let name = v.get("name")?.as_str()?;

            map.insert(value, name.to_string());
        }

        Some(map)
    }

    fn parse_one(value: &Value) -> Option<BitField> {
        let start_bit = value.get("start_bit")?.as_u64()? as u8;
        let end_bit = value.get("end_bit")?.as_u64()? as u8;
        let name = value.get("name")?.as_str()?;

        if start_bit > end_bit || end_bit > 7 {
            debug!("invalid range {start_bit}..={end_bit} in {name}");
            return None;
        }

        Some(BitField {
            range: start_bit..=end_bit,
            name: String::from(name),
            short_name: value
                .get("short_name")
                .and_then(|s| s.as_str())
                .map(String::from),
            value_names: Self::parse_enum(value),
        })
    }

    fn parse(value: &Value) -> Vec<BitField> {
        value
            .get("bitfields")
            .and_then(|f| f.as_array())
            .map(|fields| fields.iter().filter_map(Self::parse_one).collect())
            .unwrap_or_default()
    }
}

/// Register metadata parsed from `dpcd.json`.
#[derive(Clone, Debug)]
struct Metadata {
    address: u32,
    name: String,
    short_name: String,
    fields: Vec<BitField>,
}

impl Metadata {
    fn parse(value: &Value) -> Option<Self> {
        let address = util::parse_hex(value.get("address")?.as_str()?)?;
        let name = value.get("name")?.as_str()?;
        let short_name = value.get("short_name")?.as_str()?;

        Some(Self {
            address,
            name: String::from(name),
            short_name: String::from(short_name),
            fields: BitField::parse(value),
        })
    }

    fn lookup(address: u32) -> Option<&'static Self> {
        METADATA.iter().find(|m| m.address == address)
    }

    fn lookup_by_name(name: &str) -> Option<&'static Self> {
        METADATA
            .iter()
            .find(|m| m.short_name.eq_ignore_ascii_case(name) || m.name.eq_ignore_ascii_case(name))
    }
}

/// Returns DPCD address of register called `name` (long or short name, case insensitive).
pub fn address_by_name(name: &str) -> Option<u32> {
    Metadata::lookup_by_name(name).map(|m| m.address)
}

/// One DPCD byte with optional name attached.
#[derive(Clone, Debug)]
pub struct Register {
    address: u32,
    value: u8,
    metadata: Option<&'static Metadata>,
}

impl Register {
    pub fn new(address: u32, value: u8) -> Self {
        Self {
            address,
            value,
            metadata: Metadata::lookup(address),
        }
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn value(&self) -> u8 {
        self.value
    }

    /// Returns register name from metadata if known.
    pub fn name(&self) -> Option<&str> {
        self.metadata.map(|m| m.name.as_str())
    }

    pub fn short_name(&self) -> Option<&str> {
        self.metadata.map(|m| m.short_name.as_str())
    }

    /// Returns the field metadata if known.
    pub fn fields(&self) -> &[BitField] {
        self.metadata.map(|m| m.fields.as_slice()).unwrap_or_default()
    }

    /// Returns field value.
    pub fn field_value(&self, field: &BitField) -> u32 {
        let start = *field.range.start();
        let width = *field.range.end() - start + 1;
        let mask = (1u32 << width) - 1;
        (u32::from(self.value) >> start) & mask
    }

    /// Returns field metadata by field name or short name. The match is case insensitive.
    pub fn field_by_name(&self, name: &str) -> Option<&BitField> {
        self.fields().iter().find(|f| {
            f.name.eq_ignore_ascii_case(name)
                || f.short_name
                    .as_deref()
                    .map_or(false, |s| s.eq_ignore_ascii_case(name))
        })
    }

    /// Returns field value by name or `None` if there is no such field.
    pub fn field(&self, name: &str) -> Option<u32> {
        self.field_by_name(name).map(|f| self.field_value(f))
    }
}

/// Receiver capabilities read from the start of DPCD.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    revision: u8,
    max_link_rate: LinkRate,
    max_lane_count: LaneCount,
    enhanced_framing: bool,
    max_downspread: bool,
    local_edid: bool,
    embedded: bool,
    aux_rd_interval: u8,
}

impl Capabilities {
    /// Capabilities of a DPCD 1.1 sink with enhanced framing and default read intervals.
    pub fn new(max_link_rate: LinkRate, max_lane_count: LaneCount) -> Self {
        Self {
            revision: 0x11,
            max_link_rate,
            max_lane_count,
            enhanced_framing: true,
            max_downspread: false,
            local_edid: false,
            embedded: false,
            aux_rd_interval: 0,
        }
    }

    /// Reads the receiver capabilities of the sink.
    ///
    /// Registers that cannot be read count as zero. Returns [`ErrorKind::NotFound`] if there is
    /// no sink responding and [`ErrorKind::InvalidData`] if the capabilities make no sense.
    pub fn probe<R>(regs: &mut R, dpcd: &Dpcd) -> Result<Self>
    where
        R: RegisterAccess + ?Sized,
    {
        let caps = dpcd.read_or_zero(regs, dpcd::REV, 4).to_le_bytes();
        let port_cap = dpcd.read_or_zero(regs, dpcd::RECEIVE_PORT_0_CAP_0, 1);
        let edp_cap = dpcd.read_or_zero(regs, dpcd::EDP_CONFIGURATION_CAP, 1);
        let interval = dpcd.read_or_zero(regs, dpcd::TRAINING_AUX_RD_INTERVAL, 1);

        let [revision, rate, lanes, downspread] = caps;

        if revision == 0 || rate == 0 || lanes == 0 {
            return Err(Error::new(ErrorKind::NotFound, "no DisplayPort sink found"));
        }

        // Rates above what we can drive are trained at the fastest one we support.
        let max_link_rate = LinkRate::from_dpcd(rate)
            .or_else(|| (rate > LinkRate::Hbr2.dpcd_code()).then_some(LinkRate::Hbr2))
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidData,
                    format!("invalid maximum link rate {:#x}", rate),
                )
            })?;
        let max_lane_count = LaneCount::from_dpcd(lanes).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidData,
                format!("invalid maximum lane count {:#x}", lanes),
            )
        })?;

        let caps = Self {
            revision,
            max_link_rate,
            max_lane_count,
            enhanced_framing: u32::from(lanes) & dpcd::ENHANCED_FRAME_CAP != 0,
            max_downspread: u32::from(downspread) & dpcd::MAX_DOWNSPREAD_0_5 != 0,
            local_edid: port_cap & dpcd::LOCAL_EDID_PRESENT != 0,
            embedded: edp_cap & dpcd::EDP_CAPABLE_MASK != 0,
            aux_rd_interval: (interval & 0x7f) as u8,
        };

        debug!("sink capabilities: {}", caps);

        Ok(caps)
    }

    /// Returns DPCD revision as `(major, minor)`.
    pub fn revision(&self) -> (u8, u8) {
        (self.revision >> 4, self.revision & 0xf)
    }

    pub fn max_link_rate(&self) -> LinkRate {
        self.max_link_rate
    }

    pub fn max_lane_count(&self) -> LaneCount {
        self.max_lane_count
    }

    pub fn enhanced_framing(&self) -> bool {
        self.enhanced_framing
    }

    pub fn set_enhanced_framing(&mut self, enhanced_framing: bool) {
        self.enhanced_framing = enhanced_framing;
    }

    pub fn max_downspread(&self) -> bool {
        self.max_downspread
    }

    pub fn local_edid(&self) -> bool {
        self.local_edid
    }

    /// Returns `true` if this is an embedded DisplayPort panel.
    pub fn is_embedded(&self) -> bool {
        self.embedded
    }

    /// Raw `TRAINING_AUX_RD_INTERVAL` value.
    pub fn aux_rd_interval(&self) -> u8 {
        self.aux_rd_interval
    }

    pub fn set_aux_rd_interval(&mut self, interval: u8) {
        self.aux_rd_interval = interval;
    }
}

impl Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (major, minor) = self.revision();
        write!(
            f,
            "DPCD {}.{}, {} lanes @ {}",
            major,
            minor,
            self.max_lane_count.count(),
            self.max_link_rate
        )?;
        if self.enhanced_framing {
            write!(f, ", enhanced framing")?;
        }
        if self.embedded {
            write!(f, ", eDP")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{SimulatedPort, SinkModel};

    #[test]
    fn metadata() {
        let reg = Register::new(dpcd::LANE0_1_STATUS, 0x17);
        assert_eq!(reg.short_name(), Some("LANE0_1_STATUS"));
        assert_eq!(reg.field("LANE0_CR_DONE"), Some(1));
        assert_eq!(reg.field("lane1_cr_done"), Some(1));
        assert_eq!(reg.field("LANE1_SYMBOL_LOCKED"), Some(0));
        assert_eq!(reg.field("NOPE"), None);

        let reg = Register::new(dpcd::ADJUST_REQUEST_LANE0_1, 0x06);
        let field = reg.field_by_name("PRE_EMPHASIS_LANE0").unwrap();
        assert_eq!(reg.field_value(field), 1);
        assert_eq!(field.value_name(1), Some("3.5 dB"));

        assert_eq!(address_by_name("training_pattern_set"), Some(0x102));
        assert!(Register::new(0x5000, 0).name().is_none());
    }

    #[test]
    fn rejects_wide_access() {
        let mut port = SimulatedPort::default();
        let dpcd = port.dpcd();
        assert_eq!(
            dpcd.read(&mut port, dpcd::REV, 5),
            Err(AuxError::InvalidLength(5))
        );
        assert_eq!(
            dpcd.write(&mut port, dpcd::LINK_BW_SET, 0, 0),
            Err(AuxError::InvalidLength(0))
        );
        assert_eq!(port.sink().aux_attempts(), 0);
    }

    #[test]
    fn write_then_read() {
        let mut port = SimulatedPort::default();
        let dpcd = port.dpcd();

        dpcd.write(&mut port, 0x103, 4, 0x0403_0201).unwrap();
        assert_eq!(dpcd.read(&mut port, 0x103, 4), Ok(0x0403_0201));
        assert_eq!(dpcd.read(&mut port, 0x104, 2), Ok(0x0302));
        assert_eq!(port.sink().dpcd(0x106), 0x04);

        // Only the requested bytes are written.
        dpcd.write(&mut port, 0x103, 1, 0xffff_ff10).unwrap();
        assert_eq!(dpcd.read(&mut port, 0x103, 2), Ok(0x0210));
    }

    #[test]
    fn read_or_zero_hides_missing_sink() {
        let mut port = SimulatedPort::default();
        port.sink_mut().set_responding(false);
        let dpcd = port.dpcd();
        assert_eq!(dpcd.read_or_zero(&mut port, dpcd::MAX_LINK_RATE, 1), 0);
    }

    #[test]
    fn probe() {
        let sink = SinkModel::new(LinkRate::Hbr, LaneCount::Four);
        let mut port = SimulatedPort::new(sink);
        port.sink_mut().set_dpcd(dpcd::TRAINING_AUX_RD_INTERVAL, 0x82);
        let dpcd = port.dpcd();

        let caps = Capabilities::probe(&mut port, &dpcd).unwrap();
        assert_eq!(caps.max_link_rate(), LinkRate::Hbr);
        assert_eq!(caps.max_lane_count(), LaneCount::Four);
        assert!(caps.enhanced_framing());
        assert_eq!(caps.aux_rd_interval(), 2);
        assert_eq!(caps.revision(), (1, 1));
    }

    #[test]
    fn probe_without_sink() {
        let mut port = SimulatedPort::default();
        port.sink_mut().set_responding(false);
        let dpcd = port.dpcd();

        let err = Capabilities::probe(&mut port, &dpcd).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn probe_fast_sink() {
        let mut port = SimulatedPort::default();
        port.sink_mut().set_dpcd(dpcd::MAX_LINK_RATE, 0x1e);
        let dpcd = port.dpcd();

        let caps = Capabilities::probe(&mut port, &dpcd).unwrap();
        assert_eq!(caps.max_link_rate(), LinkRate::Hbr2);
    }

    #[test]
    fn register_dump() {
        let mut port = SimulatedPort::default();
        let dpcd = port.dpcd();
        let regs = dpcd.registers(&mut port, 0x000..=0x01f).unwrap();
        assert_eq!(regs.len(), 32);
        assert_eq!(regs[1].short_name(), Some("MAX_LINK_RATE"));
        assert_eq!(regs[31].address(), 0x01f);

        let accesses = port.register_accesses();
        let regs = dpcd
            .registers(&mut port, RangeInclusive::new(0x010, 0x00f))
            .unwrap();
        assert!(regs.is_empty());
        assert_eq!(port.register_accesses(), accesses);
    }
}
