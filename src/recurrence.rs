//! Recurrence expansion: one schedule request plus a recurrence rule in,
//! an ordered list of concrete occurrences out.
//!
//! Weekdays are numbered 0 = Sunday … 6 = Saturday and weeks start on Sunday.
//! Occurrences keep the anchor's local time-of-day in the request timezone, so a
//! 09:00 weekly session stays at 09:00 across a DST change.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Days, LocalResult, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

use crate::engine::ScheduleError;
use crate::limits::*;
use crate::model::{RecurrenceType, Span};

/// One concrete time-bounded instance of a (possibly recurring) request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

impl Occurrence {
    pub fn span(&self) -> Span {
        Span::new(self.start_at.timestamp_millis(), self.end_at.timestamp_millis())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Count(u32),
    /// Inclusive last date, in the request timezone.
    Until(NaiveDate),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecurrenceRule {
    Once,
    Daily {
        interval: u32,
        until: Termination,
    },
    Weekly {
        interval: u32,
        days: BTreeSet<u8>,
        until: Termination,
    },
}

/// Recurrence fields as they arrive on the wire, before shape validation.
#[derive(Debug, Clone, Default)]
pub struct RecurrenceFields {
    pub recurrence_type: RecurrenceType,
    pub interval: Option<i64>,
    pub days_of_week: Vec<i64>,
    pub occurrence_count: Option<i64>,
    pub series_end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct SeriesRequest {
    pub anchor: DateTime<Utc>,
    pub duration_minutes: u32,
    pub timezone: Tz,
    pub rule: RecurrenceRule,
}

impl RecurrenceRule {
    /// Validate the recurrence shape. `anchor_date` is the anchor's local date;
    /// its weekday is always part of a weekly rule.
    pub fn parse(fields: &RecurrenceFields, anchor_date: NaiveDate) -> Result<Self, ScheduleError> {
        if let Some(count) = fields.occurrence_count
            && count <= 0
        {
            return Err(ScheduleError::validation("occurrence_count must be at least 1"));
        }

        if fields.recurrence_type == RecurrenceType::None {
            return Ok(RecurrenceRule::Once);
        }

        let interval = match fields.interval {
            None => 1,
            Some(i) if i < 1 => {
                return Err(ScheduleError::validation("recurrence_interval must be at least 1"));
            }
            Some(i) if i > i64::from(MAX_RECURRENCE_INTERVAL) => {
                return Err(ScheduleError::limit("recurrence_interval too large"));
            }
            Some(i) => i as u32,
        };

        let until = match (fields.occurrence_count, fields.series_end_date) {
            (Some(count), None) => Termination::Count(
                u32::try_from(count).map_err(|_| ScheduleError::limit("occurrence_count too large"))?,
            ),
            (None, Some(end)) => {
                if end < anchor_date {
                    return Err(ScheduleError::validation(
                        "series_end_date is before the first occurrence",
                    ));
                }
                Termination::Until(end)
            }
            (Some(_), Some(_)) => {
                return Err(ScheduleError::validation(
                    "set either occurrence_count or series_end_date, not both",
                ));
            }
            (None, None) => {
                return Err(ScheduleError::validation(
                    "recurring entries need occurrence_count or series_end_date",
                ));
            }
        };

        match fields.recurrence_type {
            RecurrenceType::Daily => Ok(RecurrenceRule::Daily { interval, until }),
            RecurrenceType::Weekly => {
                if fields.days_of_week.is_empty() {
                    return Err(ScheduleError::validation(
                        "recurrence_days_of_week is required for WEEKLY recurrence",
                    ));
                }
                let mut days = BTreeSet::new();
                for &d in &fields.days_of_week {
                    if !(0..=6).contains(&d) {
                        return Err(ScheduleError::validation(format!(
                            "recurrence_days_of_week value {d} is not a weekday (0-6)"
                        )));
                    }
                    days.insert(d as u8);
                }
                days.insert(anchor_date.weekday().num_days_from_sunday() as u8);
                Ok(RecurrenceRule::Weekly { interval, days, until })
            }
            RecurrenceType::None => Ok(RecurrenceRule::Once),
        }
    }

    pub fn recurrence_type(&self) -> RecurrenceType {
        match self {
            RecurrenceRule::Once => RecurrenceType::None,
            RecurrenceRule::Daily { .. } => RecurrenceType::Daily,
            RecurrenceRule::Weekly { .. } => RecurrenceType::Weekly,
        }
    }

    pub fn interval(&self) -> Option<u32> {
        match self {
            RecurrenceRule::Once => None,
            RecurrenceRule::Daily { interval, .. } | RecurrenceRule::Weekly { interval, .. } => {
                Some(*interval)
            }
        }
    }

    pub fn days_of_week(&self) -> BTreeSet<u8> {
        match self {
            RecurrenceRule::Weekly { days, .. } => days.clone(),
            _ => BTreeSet::new(),
        }
    }

    pub fn termination(&self) -> Option<Termination> {
        match self {
            RecurrenceRule::Once => None,
            RecurrenceRule::Daily { until, .. } | RecurrenceRule::Weekly { until, .. } => Some(*until),
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, RecurrenceRule::Once)
    }
}

/// Expand a request into occurrences, strictly ascending by start.
///
/// Fails with `LimitExceeded` once more than `cap` occurrences would be produced.
pub fn expand(req: &SeriesRequest, cap: usize) -> Result<Vec<Occurrence>, ScheduleError> {
    let duration = TimeDelta::minutes(i64::from(req.duration_minutes));
    let local = req.anchor.with_timezone(&req.timezone);
    let anchor_date = local.date_naive();
    let time_of_day = local.time();

    let occurrence_on = |date: NaiveDate| -> Result<Occurrence, ScheduleError> {
        let start_at = if date == anchor_date {
            req.anchor
        } else {
            localize(&req.timezone, date, time_of_day)
        };
        let occurrence = Occurrence {
            start_at,
            end_at: start_at + duration,
        };
        if occurrence.end_at.timestamp_millis() > MAX_VALID_TIMESTAMP_MS {
            return Err(ScheduleError::limit("occurrence outside the supported time range"));
        }
        Ok(occurrence)
    };

    let mut out = Vec::new();
    match &req.rule {
        RecurrenceRule::Once => out.push(occurrence_on(anchor_date)?),
        RecurrenceRule::Daily { interval, until } => {
            check_count(until, cap)?;
            let step = u64::from(*interval);
            for k in 0u64.. {
                let date = add_days(anchor_date, k * step)?;
                if !accept(&mut out, date, until, cap, &occurrence_on)? {
                    break;
                }
            }
        }
        RecurrenceRule::Weekly {
            interval,
            days,
            until,
        } => {
            check_count(until, cap)?;
            let week0 = anchor_date
                .checked_sub_days(Days::new(u64::from(anchor_date.weekday().num_days_from_sunday())))
                .ok_or_else(|| ScheduleError::limit("date out of range"))?;
            let step = 7 * u64::from(*interval);
            'weeks: for w in 0u64.. {
                let week_start = add_days(week0, w * step)?;
                for &day in days {
                    let date = add_days(week_start, u64::from(day))?;
                    if date < anchor_date {
                        continue;
                    }
                    if !accept(&mut out, date, until, cap, &occurrence_on)? {
                        break 'weeks;
                    }
                }
            }
        }
    }

    debug_assert!(out.windows(2).all(|w| w[0].start_at < w[1].start_at));
    Ok(out)
}

fn check_count(until: &Termination, cap: usize) -> Result<(), ScheduleError> {
    if let Termination::Count(n) = until
        && *n as usize > cap
    {
        return Err(ScheduleError::limit(format!(
            "occurrence_count {n} exceeds the limit of {cap} occurrences"
        )));
    }
    Ok(())
}

/// Push the occurrence for `date` unless the series has ended.
/// Returns `false` once no further occurrences should be generated.
fn accept(
    out: &mut Vec<Occurrence>,
    date: NaiveDate,
    until: &Termination,
    cap: usize,
    occurrence_on: &impl Fn(NaiveDate) -> Result<Occurrence, ScheduleError>,
) -> Result<bool, ScheduleError> {
    if let Termination::Until(end) = until
        && date > *end
    {
        return Ok(false);
    }
    if out.len() >= cap {
        return Err(ScheduleError::limit(format!(
            "recurrence expands beyond {cap} occurrences"
        )));
    }
    out.push(occurrence_on(date)?);
    if let Termination::Count(n) = until
        && out.len() >= *n as usize
    {
        return Ok(false);
    }
    Ok(true)
}

fn add_days(date: NaiveDate, days: u64) -> Result<NaiveDate, ScheduleError> {
    date.checked_add_days(Days::new(days))
        .ok_or_else(|| ScheduleError::limit("date out of range"))
}

/// Resolve a local wall-clock time to an instant. Times inside a DST gap move
/// forward an hour; ambiguous times take the earlier instant.
fn localize(tz: &Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let naive = date.and_time(time);
    let local = match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => tz
            .from_local_datetime(&(naive + TimeDelta::hours(1)))
            .earliest()
            .unwrap_or_else(|| tz.from_utc_datetime(&naive)),
    };
    local.with_timezone(&Utc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Timelike, Weekday};

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn fields(kind: RecurrenceType) -> RecurrenceFields {
        RecurrenceFields {
            recurrence_type: kind,
            ..Default::default()
        }
    }

    fn request(anchor: &str, fields: &RecurrenceFields, tz: Tz) -> Result<SeriesRequest, ScheduleError> {
        let anchor = utc(anchor);
        let rule = RecurrenceRule::parse(fields, anchor.with_timezone(&tz).date_naive())?;
        Ok(SeriesRequest {
            anchor,
            duration_minutes: 60,
            timezone: tz,
            rule,
        })
    }

    fn run(anchor: &str, fields: &RecurrenceFields) -> Result<Vec<Occurrence>, ScheduleError> {
        expand(&request(anchor, fields, Tz::UTC)?, MAX_OCCURRENCES_PER_SERIES)
    }

    #[test]
    fn none_yields_the_anchor() {
        let occ = run("2024-01-01T09:00:00Z", &fields(RecurrenceType::None)).unwrap();
        assert_eq!(occ.len(), 1);
        assert_eq!(occ[0].start_at, utc("2024-01-01T09:00:00Z"));
        assert_eq!(occ[0].end_at, utc("2024-01-01T10:00:00Z"));
    }

    #[test]
    fn weekly_mon_wed_four_occurrences() {
        let mut f = fields(RecurrenceType::Weekly);
        f.interval = Some(1);
        f.days_of_week = vec![1, 3];
        f.occurrence_count = Some(4);
        let occ = run("2024-01-01T09:00:00Z", &f).unwrap();
        let starts: Vec<_> = occ.iter().map(|o| o.start_at).collect();
        assert_eq!(
            starts,
            vec![
                utc("2024-01-01T09:00:00Z"),
                utc("2024-01-03T09:00:00Z"),
                utc("2024-01-08T09:00:00Z"),
                utc("2024-01-10T09:00:00Z"),
            ]
        );
    }

    #[test]
    fn daily_interval_and_count() {
        for (k, n) in [(1i64, 5i64), (2, 3), (7, 10)] {
            let mut f = fields(RecurrenceType::Daily);
            f.interval = Some(k);
            f.occurrence_count = Some(n);
            let occ = run("2024-02-27T15:30:00Z", &f).unwrap();
            assert_eq!(occ.len(), n as usize);
            for pair in occ.windows(2) {
                assert_eq!(pair[1].start_at - pair[0].start_at, TimeDelta::days(k));
            }
            assert!(occ.iter().all(|o| o.end_at - o.start_at == TimeDelta::minutes(60)));
        }
    }

    #[test]
    fn daily_until_is_inclusive() {
        let mut f = fields(RecurrenceType::Daily);
        f.series_end_date = NaiveDate::from_ymd_opt(2024, 1, 5);
        let occ = run("2024-01-01T09:00:00Z", &f).unwrap();
        assert_eq!(occ.len(), 5);
        assert_eq!(occ.last().unwrap().start_at, utc("2024-01-05T09:00:00Z"));
    }

    #[test]
    fn weekly_days_are_selected_and_ordered() {
        let mut f = fields(RecurrenceType::Weekly);
        f.days_of_week = vec![5, 2, 4];
        f.series_end_date = NaiveDate::from_ymd_opt(2024, 1, 31);
        // Tuesday anchor
        let occ = run("2024-01-02T17:00:00Z", &f).unwrap();
        assert!(!occ.is_empty());
        assert_eq!(occ[0].start_at, utc("2024-01-02T17:00:00Z"));
        for o in &occ {
            let wd = o.start_at.weekday();
            assert!(matches!(wd, Weekday::Tue | Weekday::Thu | Weekday::Fri));
            assert_eq!(o.start_at.hour(), 17);
        }
        for pair in occ.windows(2) {
            assert!(pair[0].start_at < pair[1].start_at);
        }
    }

    #[test]
    fn weekly_adds_anchor_weekday_when_missing() {
        let mut f = fields(RecurrenceType::Weekly);
        f.days_of_week = vec![3];
        f.occurrence_count = Some(3);
        // Monday anchor, only Wednesday selected
        let occ = run("2024-01-01T09:00:00Z", &f).unwrap();
        assert_eq!(occ[0].start_at, utc("2024-01-01T09:00:00Z"));
        assert_eq!(occ[1].start_at, utc("2024-01-03T09:00:00Z"));
        assert_eq!(occ[2].start_at, utc("2024-01-08T09:00:00Z"));
    }

    #[test]
    fn weekly_skips_days_before_anchor_in_first_week() {
        let mut f = fields(RecurrenceType::Weekly);
        f.days_of_week = vec![1, 5];
        f.occurrence_count = Some(2);
        // Friday anchor; Monday of the same week is in the past
        let occ = run("2024-01-05T09:00:00Z", &f).unwrap();
        assert_eq!(occ[0].start_at, utc("2024-01-05T09:00:00Z"));
        assert_eq!(occ[1].start_at, utc("2024-01-08T09:00:00Z"));
    }

    #[test]
    fn weekly_interval_two_skips_alternate_weeks() {
        let mut f = fields(RecurrenceType::Weekly);
        f.interval = Some(2);
        f.days_of_week = vec![1];
        f.occurrence_count = Some(3);
        let occ = run("2024-01-01T09:00:00Z", &f).unwrap();
        let starts: Vec<_> = occ.iter().map(|o| o.start_at).collect();
        assert_eq!(
            starts,
            vec![
                utc("2024-01-01T09:00:00Z"),
                utc("2024-01-15T09:00:00Z"),
                utc("2024-01-29T09:00:00Z"),
            ]
        );
    }

    #[test]
    fn weekly_keeps_local_time_across_dst() {
        let mut f = fields(RecurrenceType::Weekly);
        f.days_of_week = vec![1];
        f.occurrence_count = Some(2);
        // 09:00 in New York, the week before the March 10th 2024 switch
        let req = request("2024-03-04T14:00:00Z", &f, chrono_tz::America::New_York).unwrap();
        let occ = expand(&req, MAX_OCCURRENCES_PER_SERIES).unwrap();
        assert_eq!(occ[0].start_at, utc("2024-03-04T14:00:00Z"));
        assert_eq!(occ[1].start_at, utc("2024-03-11T13:00:00Z"));
    }

    #[test]
    fn empty_weekly_days_is_validation_error() {
        let mut f = fields(RecurrenceType::Weekly);
        f.occurrence_count = Some(2);
        let err = run("2024-01-01T09:00:00Z", &f).unwrap_err();
        assert!(matches!(err, ScheduleError::Validation(_)));
    }

    #[test]
    fn zero_or_negative_count_is_validation_error() {
        for count in [0, -3] {
            for kind in [RecurrenceType::None, RecurrenceType::Daily, RecurrenceType::Weekly] {
                let mut f = fields(kind);
                f.days_of_week = vec![1];
                f.occurrence_count = Some(count);
                let err = run("2024-01-01T09:00:00Z", &f).unwrap_err();
                assert!(matches!(err, ScheduleError::Validation(_)), "{kind:?} {count}");
            }
        }
    }

    #[test]
    fn both_or_no_termination_is_validation_error() {
        let mut f = fields(RecurrenceType::Daily);
        assert!(matches!(
            run("2024-01-01T09:00:00Z", &f),
            Err(ScheduleError::Validation(_))
        ));
        f.occurrence_count = Some(2);
        f.series_end_date = NaiveDate::from_ymd_opt(2024, 2, 1);
        assert!(matches!(
            run("2024-01-01T09:00:00Z", &f),
            Err(ScheduleError::Validation(_))
        ));
    }

    #[test]
    fn end_date_before_anchor_is_validation_error() {
        let mut f = fields(RecurrenceType::Daily);
        f.series_end_date = NaiveDate::from_ymd_opt(2023, 12, 31);
        assert!(matches!(
            run("2024-01-01T09:00:00Z", &f),
            Err(ScheduleError::Validation(_))
        ));
    }

    #[test]
    fn invalid_weekday_is_validation_error() {
        let mut f = fields(RecurrenceType::Weekly);
        f.days_of_week = vec![1, 7];
        f.occurrence_count = Some(2);
        assert!(matches!(
            run("2024-01-01T09:00:00Z", &f),
            Err(ScheduleError::Validation(_))
        ));
    }

    #[test]
    fn far_future_end_date_hits_the_cap() {
        let mut f = fields(RecurrenceType::Daily);
        f.series_end_date = NaiveDate::from_ymd_opt(2030, 1, 1);
        let err = run("2024-01-01T09:00:00Z", &f).unwrap_err();
        assert!(matches!(err, ScheduleError::LimitExceeded(_)));
    }

    #[test]
    fn count_above_cap_is_limit_exceeded() {
        let mut f = fields(RecurrenceType::Daily);
        f.occurrence_count = Some(MAX_OCCURRENCES_PER_SERIES as i64 + 1);
        let err = run("2024-01-01T09:00:00Z", &f).unwrap_err();
        assert!(matches!(err, ScheduleError::LimitExceeded(_)));
    }

    #[test]
    fn count_at_cap_is_allowed() {
        let mut f = fields(RecurrenceType::Daily);
        f.occurrence_count = Some(MAX_OCCURRENCES_PER_SERIES as i64);
        let occ = run("2024-01-01T09:00:00Z", &f).unwrap();
        assert_eq!(occ.len(), MAX_OCCURRENCES_PER_SERIES);
    }
}
