//! UTC timestamps with a packed, order-preserving binary form

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

/// Size of the binary form in bytes
pub const SIZE_TIMESTAMP: usize = 12;

const NANOS_PER_SEC: u32 = 1_000_000_000;

/// Seconds per Merkle hour bucket
pub const HOUR_SECONDS: i64 = 3600;
/// Seconds per Merkle day bucket
pub const DAY_SECONDS: i64 = 86400;

/// A (seconds, nanoseconds) pair.
///
/// The derived ordering compares seconds then nanoseconds, which equals the
/// byte ordering of [`Timestamp::to_bytes`] for non-negative seconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    #[serde(rename = "T")]
    pub ts: i64,
    #[serde(rename = "NT")]
    pub nano_ts: u32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { ts: 0, nano_ts: 0 };
    pub const MAX: Timestamp = Timestamp {
        ts: 99_999_999_999_999_999,
        nano_ts: NANOS_PER_SEC - 1,
    };

    pub fn new(ts: i64, nano_ts: u32) -> Self {
        Self { ts, nano_ts }
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            ts: now.unix_timestamp(),
            nano_ts: now.nanosecond(),
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// 12 bytes: seconds as i64 BE, nanos as u32 BE
    pub fn to_bytes(&self) -> [u8; SIZE_TIMESTAMP] {
        let mut out = [0u8; SIZE_TIMESTAMP];
        out[..8].copy_from_slice(&self.ts.to_be_bytes());
        out[8..].copy_from_slice(&self.nano_ts.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SIZE_TIMESTAMP {
            return Err(Error::InvalidTimestamp(format!("length {}", bytes.len())));
        }
        let mut secs = [0u8; 8];
        secs.copy_from_slice(&bytes[..8]);
        let mut nanos = [0u8; 4];
        nanos.copy_from_slice(&bytes[8..]);
        let nano_ts = u32::from_be_bytes(nanos);
        if nano_ts >= NANOS_PER_SEC {
            return Err(Error::InvalidTimestamp(format!("nanos {}", nano_ts)));
        }
        Ok(Self {
            ts: i64::from_be_bytes(secs),
            nano_ts,
        })
    }

    pub fn to_millis(&self) -> i64 {
        self.ts * 1000 + i64::from(self.nano_ts / 1_000_000)
    }

    pub fn add_seconds(&self, secs: i64) -> Self {
        Self {
            ts: self.ts.saturating_add(secs),
            nano_ts: self.nano_ts,
        }
    }

    /// Whole-second start of this timestamp
    pub fn truncate_second(&self) -> Self {
        Self { ts: self.ts, nano_ts: 0 }
    }

    /// `[start, next)` of the UTC hour holding this timestamp
    pub fn hour_window(&self) -> (Timestamp, Timestamp) {
        fixed_window(self.ts, HOUR_SECONDS)
    }

    /// `[start, next)` of the UTC day holding this timestamp
    pub fn day_window(&self) -> (Timestamp, Timestamp) {
        fixed_window(self.ts, DAY_SECONDS)
    }

    /// `[start, next)` of the calendar month holding this timestamp
    pub fn month_window(&self) -> Result<(Timestamp, Timestamp)> {
        let date = self.to_date()?;
        let start = first_of(date.year(), date.month())?;
        let next = match date.month() {
            Month::December => first_of(date.year() + 1, Month::January)?,
            month => first_of(date.year(), month.next())?,
        };
        Ok((start, next))
    }

    /// `[start, next)` of the calendar year holding this timestamp
    pub fn year_window(&self) -> Result<(Timestamp, Timestamp)> {
        let date = self.to_date()?;
        Ok((
            first_of(date.year(), Month::January)?,
            first_of(date.year() + 1, Month::January)?,
        ))
    }

    fn to_date(&self) -> Result<Date> {
        OffsetDateTime::from_unix_timestamp(self.ts)
            .map(|dt| dt.date())
            .map_err(|e| Error::InvalidTimestamp(e.to_string()))
    }
}

fn fixed_window(ts: i64, quantum: i64) -> (Timestamp, Timestamp) {
    let start = ts - ts.rem_euclid(quantum);
    (Timestamp::new(start, 0), Timestamp::new(start + quantum, 0))
}

fn first_of(year: i32, month: Month) -> Result<Timestamp> {
    let date = Date::from_calendar_date(year, month, 1)
        .map_err(|e| Error::InvalidTimestamp(e.to_string()))?;
    let ts = PrimitiveDateTime::new(date, Time::MIDNIGHT)
        .assume_utc()
        .unix_timestamp();
    Ok(Timestamp::new(ts, 0))
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.ts, self.nano_ts)
    }
}
