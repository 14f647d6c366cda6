//! WAL locations and segment naming.

use pgvault_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default WAL segment size (16 MiB). Configurable at initdb from v11.
pub const WAL_SEGMENT_SIZE_DEFAULT: u32 = 16 * 1024 * 1024;

/// A log sequence number. Displayed and parsed in PostgreSQL's `X/X` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Lsn(pub u64);

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let (high, low) = text
            .split_once('/')
            .ok_or_else(|| Error::Format(format!("'{text}' is not a valid LSN")))?;

        match (u64::from_str_radix(high, 16), u64::from_str_radix(low, 16)) {
            (Ok(high), Ok(low)) if high <= u32::MAX as u64 && low <= u32::MAX as u64 => {
                Ok(Lsn((high << 32) | low))
            }
            _ => Err(Error::Format(format!("'{text}' is not a valid LSN"))),
        }
    }
}

impl TryFrom<String> for Lsn {
    type Error = Error;

    fn try_from(text: String) -> Result<Self> {
        text.parse()
    }
}

impl From<Lsn> for String {
    fn from(lsn: Lsn) -> String {
        lsn.to_string()
    }
}

/// Name of the WAL segment containing `lsn`, e.g. `000000010000000000000002`.
pub fn wal_segment_name(timeline: u32, lsn: Lsn, segment_size: u32) -> String {
    let segment_no = lsn.0 / segment_size as u64;
    let segments_per_id = 0x1_0000_0000 / segment_size as u64;

    format!(
        "{timeline:08X}{:08X}{:08X}",
        segment_no / segments_per_id,
        segment_no % segments_per_id
    )
}

/// All segment names from the segment containing `start` through the segment
/// containing `stop`, inclusive. These are the segments that must reach the
/// archive before a backup is consistent.
pub fn wal_segment_range(timeline: u32, start: Lsn, stop: Lsn, segment_size: u32) -> Vec<String> {
    debug_assert!(start <= stop);

    let first = start.0 / segment_size as u64;
    let last = stop.0 / segment_size as u64;

    (first..=last)
        .map(|segment_no| {
            wal_segment_name(timeline, Lsn(segment_no * segment_size as u64), segment_size)
        })
        .collect()
}
