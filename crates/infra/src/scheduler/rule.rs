//! Recurrence rules for lesson delivery.
//!
//! A rule fires at a wall-clock time of day in a fixed UTC offset, every day,
//! every week on the start date's weekday, or every month on the start date's
//! day of month. Months too short for that day are skipped. The paired
//! reminder fires two hours before each lesson occurrence.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};

use super::SchedulerError;

/// Lead time of a reminder before its lesson.
pub const REMINDER_LEAD: chrono::Duration = chrono::Duration::hours(2);

/// Longest gap between two occurrences (monthly on the 31st) is well under this.
const SEARCH_HORIZON_DAYS: u32 = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryFrequency {
    Daily,
    Weekly,
    Monthly,
}

impl DeliveryFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryFrequency::Daily => "daily",
            DeliveryFrequency::Weekly => "weekly",
            DeliveryFrequency::Monthly => "monthly",
        }
    }
}

impl FromStr for DeliveryFrequency {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(DeliveryFrequency::Daily),
            "weekly" => Ok(DeliveryFrequency::Weekly),
            "monthly" => Ok(DeliveryFrequency::Monthly),
            _ => Err(SchedulerError::InvalidFrequency(s.to_string())),
        }
    }
}

/// 24-hour `HH:MM` (a single-digit hour is accepted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    hour: u32,
    minute: u32,
}

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Result<Self, SchedulerError> {
        if hour > 23 || minute > 59 {
            return Err(SchedulerError::InvalidTimeOfDay(format!("{hour}:{minute}")));
        }
        Ok(Self { hour, minute })
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    pub fn minute(&self) -> u32 {
        self.minute
    }
}

impl FromStr for TimeOfDay {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SchedulerError::InvalidTimeOfDay(s.to_string());
        let (h, m) = s.trim().split_once(':').ok_or_else(invalid)?;
        let digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
        if !digits(h) || h.len() > 2 || !digits(m) || m.len() != 2 {
            return Err(invalid());
        }
        let hour = h.parse().map_err(|_| invalid())?;
        let minute = m.parse().map_err(|_| invalid())?;
        TimeOfDay::new(hour, minute).map_err(|_| invalid())
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = SchedulerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        value.to_string()
    }
}

/// Fixed UTC offset: `UTC`, `Z`, `+05:30`, `-04:00`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timezone(FixedOffset);

impl Timezone {
    pub fn utc() -> Self {
        Self(Utc.fix())
    }

    pub fn offset(&self) -> FixedOffset {
        self.0
    }
}

impl Default for Timezone {
    fn default() -> Self {
        Self::utc()
    }
}

impl FromStr for Timezone {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let invalid = || SchedulerError::InvalidTimezone(s.to_string());
        if raw.eq_ignore_ascii_case("utc") || raw.eq_ignore_ascii_case("z") {
            return Ok(Self::utc());
        }

        let (sign, rest) = match raw.as_bytes().first() {
            Some(b'+') => (1, &raw[1..]),
            Some(b'-') => (-1, &raw[1..]),
            _ => return Err(invalid()),
        };
        let (h, m) = rest.split_once(':').ok_or_else(invalid)?;
        if h.len() != 2 || m.len() != 2 {
            return Err(invalid());
        }
        let hours: i32 = h.parse().map_err(|_| invalid())?;
        let minutes: i32 = m.parse().map_err(|_| invalid())?;
        if hours > 14 || minutes > 59 {
            return Err(invalid());
        }
        FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
            .map(Self)
            .ok_or_else(invalid)
    }
}

impl fmt::Display for Timezone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.local_minus_utc();
        let sign = if secs < 0 { '-' } else { '+' };
        let secs = secs.abs();
        write!(f, "{sign}{:02}:{:02}", secs / 3600, (secs % 3600) / 60)
    }
}

impl TryFrom<String> for Timezone {
    type Error = SchedulerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timezone> for String {
    fn from(value: Timezone) -> Self {
        value.to_string()
    }
}

/// A validated delivery rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRule {
    pub frequency: DeliveryFrequency,
    pub time_of_day: TimeOfDay,
    pub start_date: NaiveDate,
    pub timezone: Timezone,
}

impl ScheduleRule {
    fn matches(&self, date: NaiveDate) -> bool {
        match self.frequency {
            DeliveryFrequency::Daily => true,
            DeliveryFrequency::Weekly => date.weekday() == self.start_date.weekday(),
            DeliveryFrequency::Monthly => date.day() == self.start_date.day(),
        }
    }

    fn occurrence_on(&self, date: NaiveDate) -> Option<DateTime<Utc>> {
        date.and_hms_opt(self.time_of_day.hour, self.time_of_day.minute, 0)?
            .and_local_timezone(self.timezone.0)
            .single()
            .map(|t| t.with_timezone(&Utc))
    }

    /// First lesson occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local_date = after.with_timezone(&self.timezone.0).date_naive();
        let mut date = local_date.max(self.start_date);
        for _ in 0..SEARCH_HORIZON_DAYS {
            if self.matches(date) {
                if let Some(at) = self.occurrence_on(date).filter(|at| *at > after) {
                    return Some(at);
                }
            }
            date = date.succ_opt()?;
        }
        None
    }

    /// First reminder strictly after `after`: two hours before the lesson
    /// occurrence it announces.
    pub fn next_reminder_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next_after(after + REMINDER_LEAD)
            .map(|lesson| lesson - REMINDER_LEAD)
    }

    /// Midnight of the start date in the rule's offset.
    pub fn starts_at(&self) -> Option<DateTime<Utc>> {
        self.start_date
            .and_hms_opt(0, 0, 0)?
            .and_local_timezone(self.timezone.0)
            .single()
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        self.starts_at().is_some_and(|start| now >= start)
    }
}

/// Raw scheduling input as supplied by course authoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleParams {
    pub time_of_day: String,
    /// `YYYY-MM-DD` or an RFC 3339 timestamp (its date part is used).
    pub start_date: String,
    pub frequency: String,
    #[serde(default)]
    pub timezone: Option<String>,
}

impl ScheduleParams {
    pub fn parse(&self, default_timezone: Timezone) -> Result<ScheduleRule, SchedulerError> {
        let time_of_day = self.time_of_day.parse()?;
        let frequency = self.frequency.parse()?;
        let timezone = match self.timezone.as_deref().map(str::trim) {
            Some(tz) if !tz.is_empty() => tz.parse()?,
            _ => default_timezone,
        };
        let start_date = parse_start_date(&self.start_date, timezone)?;

        Ok(ScheduleRule {
            frequency,
            time_of_day,
            start_date,
            timezone,
        })
    }
}

fn parse_start_date(raw: &str, timezone: Timezone) -> Result<NaiveDate, SchedulerError> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&timezone.0).date_naive())
        .map_err(|_| SchedulerError::InvalidStartDate(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDateTime, Timelike, Weekday};
    use proptest::prelude::*;

    fn utc(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M")
            .unwrap()
            .and_utc()
    }

    fn rule(frequency: &str, time: &str, start: &str, tz: &str) -> ScheduleRule {
        ScheduleParams {
            time_of_day: time.to_string(),
            start_date: start.to_string(),
            frequency: frequency.to_string(),
            timezone: Some(tz.to_string()),
        }
        .parse(Timezone::utc())
        .unwrap()
    }

    #[test]
    fn time_of_day_is_strict() {
        assert_eq!("10:00".parse::<TimeOfDay>().unwrap(), TimeOfDay::new(10, 0).unwrap());
        assert_eq!("7:05".parse::<TimeOfDay>().unwrap().to_string(), "07:05");
        for bad in ["24:00", "10:60", "10", "10:5", "ab:cd", "-1:00", "100:00", ""] {
            assert!(bad.parse::<TimeOfDay>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn frequency_and_timezone_parsing() {
        assert_eq!("Weekly".parse::<DeliveryFrequency>().unwrap(), DeliveryFrequency::Weekly);
        assert!("hourly".parse::<DeliveryFrequency>().is_err());

        assert_eq!("+05:30".parse::<Timezone>().unwrap().offset().local_minus_utc(), 19_800);
        assert_eq!("-04:00".parse::<Timezone>().unwrap().to_string(), "-04:00");
        assert_eq!("UTC".parse::<Timezone>().unwrap(), Timezone::utc());
        assert!("Asia/Kolkata".parse::<Timezone>().is_err());
        assert!("+5:30".parse::<Timezone>().is_err());
    }

    #[test]
    fn start_date_accepts_date_or_timestamp() {
        let r = rule("daily", "10:00", "2024-03-01T22:00:00-05:00", "UTC");
        assert_eq!(r.start_date, NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());

        let err = ScheduleParams {
            time_of_day: "10:00".into(),
            start_date: "2024-02-30".into(),
            frequency: "daily".into(),
            timezone: None,
        }
        .parse(Timezone::utc())
        .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidStartDate(_)));
    }

    #[test]
    fn daily_rule_fires_today_when_still_ahead() {
        let r = rule("daily", "10:00", "2024-05-06", "UTC");
        assert_eq!(r.next_after(utc("2024-05-06 06:00")), Some(utc("2024-05-06 10:00")));
        assert_eq!(r.next_after(utc("2024-05-06 10:00")), Some(utc("2024-05-07 10:00")));
        // Before the start date nothing fires.
        assert_eq!(r.next_after(utc("2024-05-01 12:00")), Some(utc("2024-05-06 10:00")));
    }

    #[test]
    fn offsets_shift_the_utc_instant() {
        let r = rule("daily", "10:00", "2024-05-06", "+05:30");
        assert_eq!(r.next_after(utc("2024-05-06 00:00")), Some(utc("2024-05-06 04:30")));
    }

    #[test]
    fn weekly_pins_start_weekday() {
        // 2024-05-08 is a Wednesday.
        let r = rule("weekly", "09:15", "2024-05-08", "UTC");
        let next = r.next_after(utc("2024-05-09 00:00")).unwrap();
        assert_eq!(next, utc("2024-05-15 09:15"));
        assert_eq!(next.weekday(), Weekday::Wed);
    }

    #[test]
    fn monthly_skips_short_months() {
        let r = rule("monthly", "08:00", "2024-01-31", "UTC");
        assert_eq!(r.next_after(utc("2024-02-01 00:00")), Some(utc("2024-03-31 08:00")));
        assert_eq!(r.next_after(utc("2024-04-01 00:00")), Some(utc("2024-05-31 08:00")));
    }

    #[test]
    fn reminder_wraps_past_midnight() {
        let r = rule("daily", "01:00", "2024-05-06", "UTC");
        assert_eq!(
            r.next_reminder_after(utc("2024-05-06 12:00")),
            Some(utc("2024-05-06 23:00"))
        );
        // First lesson's reminder lands the evening before the start date.
        assert_eq!(
            r.next_reminder_after(utc("2024-05-05 00:00")),
            Some(utc("2024-05-05 23:00"))
        );
    }

    #[test]
    fn serde_uses_plain_strings() {
        let r = rule("monthly", "07:30", "2024-01-15", "+01:00");
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "frequency": "monthly",
                "time_of_day": "07:30",
                "start_date": "2024-01-15",
                "timezone": "+01:00"
            })
        );
        let back: ScheduleRule = serde_json::from_value(json).unwrap();
        assert_eq!(back, r);
    }

    fn arb_rule() -> impl Strategy<Value = ScheduleRule> {
        (
            prop_oneof![
                Just(DeliveryFrequency::Daily),
                Just(DeliveryFrequency::Weekly),
                Just(DeliveryFrequency::Monthly)
            ],
            0u32..24,
            0u32..60,
            0i64..3650,
            -12i32..=14,
        )
            .prop_map(|(frequency, hour, minute, day_offset, tz_hours)| ScheduleRule {
                frequency,
                time_of_day: TimeOfDay::new(hour, minute).unwrap(),
                start_date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()
                    + chrono::Duration::days(day_offset),
                timezone: Timezone(FixedOffset::east_opt(tz_hours * 3600).unwrap()),
            })
    }

    proptest! {
        #[test]
        fn occurrences_match_the_rule(rule in arb_rule(), secs in 1_500_000_000i64..1_950_000_000) {
            let after = DateTime::from_timestamp(secs, 0).unwrap();
            let next = rule.next_after(after).unwrap();
            prop_assert!(next > after);

            let local = next.with_timezone(&rule.timezone.offset());
            prop_assert_eq!(local.hour(), rule.time_of_day.hour());
            prop_assert_eq!(local.minute(), rule.time_of_day.minute());
            prop_assert!(local.date_naive() >= rule.start_date);
            match rule.frequency {
                DeliveryFrequency::Daily => {}
                DeliveryFrequency::Weekly => prop_assert_eq!(local.weekday(), rule.start_date.weekday()),
                DeliveryFrequency::Monthly => prop_assert_eq!(local.day(), rule.start_date.day()),
            }
        }

        #[test]
        fn reminder_precedes_its_lesson(rule in arb_rule(), secs in 1_500_000_000i64..1_950_000_000) {
            let after = DateTime::from_timestamp(secs, 0).unwrap();
            let reminder = rule.next_reminder_after(after).unwrap();
            let lesson = rule.next_after(reminder).unwrap();

            prop_assert!(reminder > after);
            prop_assert!(reminder <= lesson);
            prop_assert_eq!(lesson - reminder, REMINDER_LEAD);
        }
    }
}
