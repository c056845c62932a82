//! Canonical observation slot computation.
//!
//! The upstream pages publish on an imprecise cycle, so every capture
//! instant is floored to the nearest lower multiple of the polling
//! interval in the monitored region's timezone. When the exact-slot row
//! is missing upstream, the adopted row's own timestamp becomes the
//! record's effective `data_time`; when the dam and river sources
//! disagree on "latest", the later timestamp wins.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, Timelike};

/// One fixed-width time bucket on the observation clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    datetime: DateTime<FixedOffset>,
    interval_minutes: u32,
}

impl Slot {
    /// Floors `now` to the interval. For all `now` in `[T, T+interval)`
    /// the result is `T`.
    pub fn floor(now: DateTime<FixedOffset>, interval_minutes: u32) -> Slot {
        let excess_minutes = (now.minute() % interval_minutes) as i64;
        let datetime = now
            - Duration::minutes(excess_minutes)
            - Duration::seconds(now.second() as i64)
            - Duration::nanoseconds(now.nanosecond() as i64);
        Slot {
            datetime,
            interval_minutes,
        }
    }

    pub fn datetime(&self) -> DateTime<FixedOffset> {
        self.datetime
    }

    pub fn naive(&self) -> NaiveDateTime {
        self.datetime.naive_local()
    }

    pub fn date(&self) -> NaiveDate {
        self.datetime.date_naive()
    }

    pub fn interval_minutes(&self) -> u32 {
        self.interval_minutes
    }

    /// Observation timestamp request parameter, `YYYYMMDDHHMM`.
    pub fn obsdt(&self) -> String {
        self.datetime.format("%Y%m%d%H%M").to_string()
    }

    /// Date as rendered in the source tables, `YYYY/MM/DD`.
    pub fn date_str(&self) -> String {
        self.datetime.format("%Y/%m/%d").to_string()
    }

    /// Time as rendered in the source tables, `HH:MM`.
    pub fn time_str(&self) -> String {
        self.datetime.format("%H:%M").to_string()
    }

    /// Archive file stem, `HHMM`.
    pub fn hhmm(&self) -> String {
        self.datetime.format("%H%M").to_string()
    }

    /// Attaches this slot's offset to a row's naive timestamp.
    pub fn attach_offset(&self, naive: NaiveDateTime) -> DateTime<FixedOffset> {
        naive
            .and_local_timezone(*self.datetime.offset())
            .single()
            .unwrap_or(self.datetime)
    }
}

/// Resolves the record's overall `data_time` from the adopted rows' own
/// timestamps. The later of the dam and river timestamps wins; when
/// neither strategy yielded a timestamp, the targeted slot stands.
pub fn resolve_data_time(
    slot: &Slot,
    dam_row_time: Option<NaiveDateTime>,
    river_row_time: Option<NaiveDateTime>,
) -> DateTime<FixedOffset> {
    match dam_row_time.into_iter().chain(river_row_time).max() {
        Some(naive) => slot.attach_offset(naive),
        None => slot.datetime(),
    }
}
