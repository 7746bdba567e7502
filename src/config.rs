//! Stage configuration primitives.

use std::error::Error;
use std::fmt;
use std::num;
use std::str::FromStr;

/// One byte.
pub const B: u64 = 1;
/// Bytes per kibibyte.
pub const KB: u64 = 1024;
/// Bytes per mebibyte.
pub const MB: u64 = KB * 1024;
/// Bytes per gibibyte.
pub const GB: u64 = MB * 1024;
/// Bytes per tebibyte.
pub const TB: u64 = GB * 1024;

/// Memory size parsing error.
#[derive(Debug)]
pub enum ParseMemorySizeError {
    /// Numeric part is missing or not a valid unsigned integer.
    InvalidNumber(num::ParseIntError),
    /// No unit suffix was given.
    MissingUnit,
    /// Unit suffix is not one of b, kb, mb, gb, tb.
    UnknownUnit(String),
    /// Byte count does not fit into 64 bits.
    Overflow,
}

impl Error for ParseMemorySizeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            ParseMemorySizeError::InvalidNumber(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for ParseMemorySizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            ParseMemorySizeError::InvalidNumber(err) => write!(f, "memory size number is invalid: {}", err),
            ParseMemorySizeError::MissingUnit => write!(f, "memory size unit is missing (expected b, kb, mb, gb or tb)"),
            ParseMemorySizeError::UnknownUnit(unit) => write!(f, "unknown memory size unit '{}'", unit),
            ParseMemorySizeError::Overflow => write!(f, "memory size does not fit into 64 bits"),
        }
    }
}

/// Byte count parsed from a human unit string such as `100mb` or `2gb`.
///
/// Unit suffixes are case-insensitive powers of 1024: b, kb, mb, gb, tb.
/// A bare number is rejected so a budget can never be read with the wrong
/// unit in mind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemorySize(u64);

impl MemorySize {
    pub const fn from_bytes(bytes: u64) -> Self {
        MemorySize(bytes)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl FromStr for MemorySize {
    type Err = ParseMemorySizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();

        let unit_start = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let (number, unit) = s.split_at(unit_start);

        let number = number
            .parse::<u64>()
            .map_err(|err| ParseMemorySizeError::InvalidNumber(err))?;

        let multiplier = match unit {
            "b" => B,
            "kb" => KB,
            "mb" => MB,
            "gb" => GB,
            "tb" => TB,
            "" => return Err(ParseMemorySizeError::MissingUnit),
            _ => return Err(ParseMemorySizeError::UnknownUnit(unit.to_owned())),
        };

        let bytes = number
            .checked_mul(multiplier)
            .ok_or(ParseMemorySizeError::Overflow)?;

        return Ok(MemorySize(bytes));
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (value, unit) = match self.0 {
            n if n >= TB && n % TB == 0 => (n / TB, "tb"),
            n if n >= GB && n % GB == 0 => (n / GB, "gb"),
            n if n >= MB && n % MB == 0 => (n / MB, "mb"),
            n if n >= KB && n % KB == 0 => (n / KB, "kb"),
            n => (n, "b"),
        };
        write!(f, "{}{}", value, unit)
    }
}

/// What to do when an input or run file cannot be opened for reading.
///
/// The policy governs the open only. A read error in the middle of an
/// already open file always ends that file with a warning, and failures on
/// the output side are always fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenPolicy {
    /// Log the failure and continue with the remaining files.
    Skip,
    /// Abort the whole stage.
    Fail,
}

impl Default for OpenPolicy {
    fn default() -> Self {
        OpenPolicy::Skip
    }
}

/// Stage configuration rejected at build time.
#[derive(Debug)]
pub enum ConfigError {
    /// Fan-in below two cannot make merge progress.
    FanInTooSmall(usize),
    /// Lookahead queues must hold at least one record.
    ZeroLookahead,
    /// The decoder pool cannot be empty.
    ZeroDecodeWorkers,
    /// Pipeline queues cannot be zero-capacity.
    ZeroQueueCapacity,
    /// The memory monitor needs a non-zero sampling interval.
    ZeroSampleInterval,
}

impl Error for ConfigError {}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            ConfigError::FanInTooSmall(n) => write!(f, "fan-in limit {} is too small, at least 2 required", n),
            ConfigError::ZeroLookahead => write!(f, "lookahead depth cannot be zero"),
            ConfigError::ZeroDecodeWorkers => write!(f, "decode worker count cannot be zero"),
            ConfigError::ZeroQueueCapacity => write!(f, "queue capacity cannot be zero"),
            ConfigError::ZeroSampleInterval => write!(f, "sampling interval cannot be zero"),
        }
    }
}
