//! Timestamp and calendar-date newtypes with CBOR codecs

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};

/// Instant in time, encoded on the wire as i64 nanoseconds since the epoch.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

/// Calendar date (no time of day), encoded as i64 days from the common era.
/// Used for `date_needed` on requests and expiration dates on receipt items.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct DateStamp(NaiveDate);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl DateStamp {
    pub fn today() -> Self {
        Self(Utc::now().date_naive())
    }
    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Self)
    }
    pub fn to_naive_date(&self) -> NaiveDate {
        self.0
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl From<NaiveDate> for DateStamp {
    fn from(value: NaiveDate) -> Self {
        DateStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

impl<C> minicbor::Encode<C> for DateStamp {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.i64(i64::from(self.0.num_days_from_ce()))?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for DateStamp {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let days = d.i64()?;

        let days = i32::try_from(days).map_err(|_| {
            minicbor::decode::Error::message("date out of range for days-from-ce encoding")
        })?;

        NaiveDate::from_num_days_from_ce_opt(days)
            .map(DateStamp)
            .ok_or(minicbor::decode::Error::message(
                "failed to convert days-from-ce to a calendar date",
            ))
    }
}
