use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Absolute instant on the treatment timeline.
pub type Instant = DateTime<Utc>;

/// Signed duration with sub-second resolution.
pub type Duration = chrono::Duration;

pub fn instant(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> Instant {
    Utc.with_ymd_and_hms(year, month, day, hour, minute, 0)
        .single()
        .expect("valid calendar date")
}

pub fn duration_from_hours(hours: f64) -> Duration {
    Duration::milliseconds((hours * 3_600_000.0).round() as i64)
}

pub fn duration_to_hours(duration: Duration) -> f64 {
    duration.num_milliseconds() as f64 / 3_600_000.0
}

/// Hours elapsed from `origin` to `t`, negative when `t` is earlier.
pub fn hours_since(origin: Instant, t: Instant) -> f64 {
    duration_to_hours(t - origin)
}

/// A time within the day, in [0, 24h).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct TimeOfDay(i64);

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Self {
        assert!(hour < 24 && minute < 60);
        TimeOfDay((i64::from(hour) * 60 + i64::from(minute)) * 60_000)
    }

    pub fn from_duration(d: Duration) -> Result<Self, String> {
        let ms = d.num_milliseconds();
        if !(0..24 * 3_600_000).contains(&ms) {
            return Err(format!("time of day out of range: {ms} ms"));
        }
        Ok(TimeOfDay(ms))
    }

    pub fn as_duration(self) -> Duration {
        Duration::milliseconds(self.0)
    }

    pub fn as_hours(self) -> f64 {
        self.0 as f64 / 3_600_000.0
    }
}

impl TryFrom<f64> for TimeOfDay {
    type Error = String;

    fn try_from(hours: f64) -> Result<Self, Self::Error> {
        TimeOfDay::from_duration(duration_from_hours(hours))
    }
}

impl From<TimeOfDay> for f64 {
    fn from(t: TimeOfDay) -> f64 {
        t.as_hours()
    }
}

/// Serde adapter storing a `chrono::Duration` as fractional hours.
pub mod duration_hours {
    use super::{duration_from_hours, duration_to_hours, Duration};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(duration_to_hours(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(duration_from_hours(f64::deserialize(d)?))
    }
}

/// Same adapter for `Option<Duration>` fields.
pub mod opt_duration_hours {
    use super::{duration_from_hours, duration_to_hours, Duration};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&duration_to_hours(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<f64>::deserialize(d)?.map(duration_from_hours))
    }
}
