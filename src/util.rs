// DisplayPort link training tools
//
// Copyright (C) 2023, Intel Corporation

//! Miscellaneous utility functions.

use std::str::FromStr;

use lazy_static::lazy_static;
use num_traits::Num;
use regex::Regex;

/// Similar to kernel's `GENMASK()` macro.
///
/// # Examples
/// ```
/// use dplink::genmask_t;
///
/// const AUX_CTL_MESSAGE_SIZE_MASK: u32 = genmask_t!(u32, 24, 20);
/// assert_eq!(AUX_CTL_MESSAGE_SIZE_MASK, 0x01f0_0000);
/// ```
#[macro_export]
macro_rules! genmask_t {
    ($t:ty, $high:expr, $low:expr) => {{
        <$t>::MAX - (1 << $low) + 1 & (<$t>::MAX >> (<$t>::BITS - 1 - $high))
    }};
}

/// Parse hexadecimal from string.
///
/// Assumes the string is hexadecimal and converts it to a number if possible, or `None` if no such
/// conversion is possible.
///
/// # Examples
/// ```
/// use dplink::util;
///
/// if let Some(number) = util::parse_hex::<u32>("0x2b405555") {
///     assert_eq!(number, 0x2b40_5555);
/// }
/// ```
pub fn parse_hex<T: Num + FromStr>(s: &str) -> Option<T> {
    let val = match s.strip_prefix("0x") {
        Some(s) => s,
        None => s,
    };

    <T>::from_str_radix(val, 16).ok()
}

/// Parse any number hexadecimal or not.
///
/// Parses numeric string into binary regardless whether it is in hexadecimal format or not. If
/// conversion is not possible returns `None`.
/// # Examples
/// ```
/// use dplink::util;
///
/// assert_eq!(util::parse_number::<u32>("258"), Some(258));
/// assert_eq!(util::parse_number::<u32>("0x102"), Some(0x102));
/// ```
pub fn parse_number<T: Num + FromStr>(s: &str) -> Option<T> {
    // Try to match decimal digits first and if that matches use standard
    // functions to parse it.
    lazy_static! {
        static ref RE: Regex = Regex::new(r"^\d+$").unwrap();
    }
    if RE.is_match(s) {
        return s.parse::<T>().ok();
    }
    parse_hex(s)
}

/// Parse a DPCD address (20 bits) from string.
pub fn parse_dpcd_address(s: &str) -> Result<u32, String> {
    match parse_number::<u32>(s) {
        Some(address) if address <= 0xf_ffff => Ok(address),
        _ => Err(String::from("Invalid DPCD address")),
    }
}

/// Define a single bit within a 32-bit register.
///
/// This type provides a compile time representation of how a given bit within a register is to
/// be parsed.
///
/// # Examples
/// ```
/// use dplink::util;
/// type SendBusy = util::RegBit<31>;
///
/// let mut raw = 0u32;
/// SendBusy::set_bit(&mut raw, true);
/// assert_eq!(raw, 1 << 31);
/// assert!(SendBusy::get_bit(raw));
/// ```
pub struct RegBit<const BIT: u32>;

impl<const BIT: u32> RegBit<BIT> {
    pub const MASK: u32 = 1u32 << BIT;

    pub fn get_bit(raw: u32) -> bool {
        raw & Self::MASK != 0
    }

    pub fn set_bit(raw: &mut u32, value: bool) {
        *raw = (!Self::MASK & *raw) | if value { Self::MASK } else { 0 };
    }
}

/// Define a field within a 32-bit register.
///
/// See `RegBit` documentation for background.
///
/// # Const Parameters
///
/// * `HIGH` - The bit offset of the highest bit of the field
/// * `LOW` - The bit offset of the lowest bit of the field
///
/// # Examples
/// ```
/// use dplink::util;
/// type TrainingPattern = util::RegField<29, 28>;
///
/// let mut raw = 0u32;
/// TrainingPattern::set_field(&mut raw, 0b10);
/// assert_eq!(raw, 0b10 << 28);
/// assert_eq!(TrainingPattern::get_field(raw), 0b10);
/// ```
pub struct RegField<const HIGH: u32, const LOW: u32>;

impl<const HIGH: u32, const LOW: u32> RegField<HIGH, LOW> {
    pub const MASK: u32 = genmask_t!(u32, HIGH, LOW);
    const SHIFT: u32 = LOW;

    pub fn get_field(raw: u32) -> u32 {
        (raw & Self::MASK) >> Self::SHIFT
    }

    pub fn set_field(raw: &mut u32, value: u32) {
        *raw = (!Self::MASK & *raw) | (Self::MASK & (value << Self::SHIFT));
    }
}
