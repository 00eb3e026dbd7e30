//! The device stores `hour * 256 + minute` in UTC with no zone tag. The offset
//! applied here is whatever offset is active at the moment of each call, not
//! the offset that was active when the value was written. Around a DST switch
//! a stored value can therefore display one hour off. This is a known quirk and
//! is kept as is.

use chrono::{Local, Offset, Utc};
use chrono_tz::Tz;
use thiserror::Error;

const MINUTES_PER_HOUR_SLOT: i64 = 256;
const MAX_MINUTE: i64 = 59;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeCodecError {
    #[error("expected HH:MM, got {0:?}")]
    Malformed(String),
    #[error("minutes out of range in {0:?}")]
    MinutesOutOfRange(String),
    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetSource {
    #[default]
    Local,
    Zone(Tz),
}

impl OffsetSource {
    pub fn from_timezone(timezone: Option<&str>) -> Result<Self, TimeCodecError> {
        match timezone {
            None => Ok(Self::Local),
            Some(name) => name
                .parse::<Tz>()
                .map(Self::Zone)
                .map_err(|_| TimeCodecError::UnknownTimezone(name.to_string())),
        }
    }

    // Sub-hour offsets are truncated.
    pub fn offset_hours(self) -> i64 {
        let seconds = match self {
            Self::Local => Local::now().offset().fix().local_minus_utc(),
            Self::Zone(tz) => Utc::now().with_timezone(&tz).offset().fix().local_minus_utc(),
        };
        i64::from(seconds / 3600)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TimeCodec {
    source: OffsetSource,
}

impl TimeCodec {
    pub fn new(source: OffsetSource) -> Self {
        Self { source }
    }

    pub fn source(&self) -> OffsetSource {
        self.source
    }

    pub fn decode(&self, raw: i64) -> String {
        decode_with_offset(raw, self.source.offset_hours())
    }

    pub fn encode(&self, time: &str) -> Result<i64, TimeCodecError> {
        encode_with_offset(time, self.source.offset_hours())
    }
}

/// Hours are not wrapped into 0..24. Minutes above 59 are clamped.
pub fn decode_with_offset(raw: i64, offset_hours: i64) -> String {
    let hours = raw.div_euclid(MINUTES_PER_HOUR_SLOT) + offset_hours;
    let minutes = raw.rem_euclid(MINUTES_PER_HOUR_SLOT).min(MAX_MINUTE);
    format!("{hours:02}:{minutes:02}")
}

pub fn encode_with_offset(time: &str, offset_hours: i64) -> Result<i64, TimeCodecError> {
    let (hours, minutes) = parse_hh_mm(time)?;
    Ok((hours - offset_hours) * MINUTES_PER_HOUR_SLOT + minutes)
}

fn parse_hh_mm(time: &str) -> Result<(i64, i64), TimeCodecError> {
    let malformed = || TimeCodecError::Malformed(time.to_string());

    let (hours, minutes) = time.trim().split_once(':').ok_or_else(malformed)?;
    if minutes.is_empty() || !minutes.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let hours = hours.parse::<i64>().map_err(|_| malformed())?;
    let minutes = minutes.parse::<i64>().map_err(|_| malformed())?;

    if minutes > MAX_MINUTE {
        return Err(TimeCodecError::MinutesOutOfRange(time.to_string()));
    }
    Ok((hours, minutes))
}
