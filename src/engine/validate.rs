use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use ulid::Ulid;

use crate::index::ResourceKey;
use crate::limits::*;
use crate::model::*;
use crate::recurrence::{Occurrence, RecurrenceFields, RecurrenceRule, SeriesRequest, Termination};

use super::{DetectionContext, ScheduleError};

/// Body of a creation request. The schema is closed: unknown fields are rejected.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateScheduleEntry {
    pub location_id: Ulid,
    pub tutor_id: Ulid,
    pub service_offered_id: Ulid,
    pub subject_id: Option<Ulid>,
    pub topic_id: Option<Ulid>,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i64>,
    #[serde(default)]
    pub room_ids: Vec<Ulid>,
    #[serde(default)]
    pub attendee_student_ids: Vec<Ulid>,
    #[serde(default)]
    pub include_buffer: bool,
    #[serde(default)]
    pub recurrence_type: RecurrenceType,
    pub recurrence_interval: Option<i64>,
    #[serde(default)]
    pub recurrence_days_of_week: Vec<i64>,
    pub series_end_date: Option<NaiveDate>,
    pub occurrence_count: Option<i64>,
    /// IANA zone used to keep local time-of-day across occurrences. Defaults to UTC.
    pub timezone: Option<String>,
    pub location_detail: Option<String>,
    #[serde(default)]
    pub allow_conflicts: bool,
}

/// A request that passed VALIDATING: every reference resolved, shape checked.
#[derive(Debug, Clone)]
pub(crate) struct ValidatedRequest {
    pub tutor_id: Ulid,
    pub location_id: Ulid,
    pub service_offered_id: Ulid,
    pub subject_id: Option<Ulid>,
    pub topic_id: Option<Ulid>,
    pub room_ids: BTreeSet<Ulid>,
    pub attendee_student_ids: BTreeSet<Ulid>,
    pub capacity: u32,
    pub include_buffer: bool,
    /// Zero unless `include_buffer` is set.
    pub buffer_minutes: u32,
    pub series: SeriesRequest,
    pub timezone: String,
    pub location_detail: Option<String>,
    pub allow_conflicts: bool,
}

impl ValidatedRequest {
    pub fn resource_keys(&self) -> Vec<ResourceKey> {
        std::iter::once(ResourceKey::Tutor(self.tutor_id))
            .chain(self.room_ids.iter().copied().map(ResourceKey::Room))
            .collect()
    }

    pub fn buffer(&self) -> TimeDelta {
        TimeDelta::minutes(i64::from(self.buffer_minutes))
    }

    pub fn detection_context(&self) -> DetectionContext<'_> {
        DetectionContext {
            tutor_id: self.tutor_id,
            room_ids: &self.room_ids,
            buffer_ms: self.buffer().num_milliseconds(),
            capacity: self.capacity,
            attendee_count: self.attendee_student_ids.len(),
        }
    }

    /// Materialize one occurrence as an entry row.
    pub fn entry_for(
        &self,
        occurrence: &Occurrence,
        series_id: Option<Ulid>,
        now: DateTime<Utc>,
    ) -> ScheduleEntry {
        let rule = &self.series.rule;
        let termination = rule.termination();
        ScheduleEntry {
            id: Ulid::new(),
            location_id: self.location_id,
            tutor_id: self.tutor_id,
            service_offered_id: self.service_offered_id,
            subject_id: self.subject_id,
            topic_id: self.topic_id,
            start_at: occurrence.start_at,
            end_at: occurrence.end_at,
            blocked_end_at: occurrence.end_at + self.buffer(),
            duration_minutes: self.series.duration_minutes,
            capacity: self.capacity,
            include_buffer: self.include_buffer,
            room_ids: self.room_ids.clone(),
            attendee_student_ids: self.attendee_student_ids.clone(),
            recurrence_type: rule.recurrence_type(),
            recurrence_interval: rule.interval(),
            recurrence_days_of_week: rule.days_of_week(),
            series_id,
            series_end_date: match termination {
                Some(Termination::Until(date)) => Some(date),
                _ => None,
            },
            occurrence_count: match termination {
                Some(Termination::Count(n)) => Some(n),
                _ => None,
            },
            timezone: self.timezone.clone(),
            location_detail: self.location_detail.clone(),
            created_at: now,
            archived_at: None,
        }
    }
}

fn lookup<'a>(
    catalog: &'a HashMap<Ulid, CatalogEntry>,
    id: Ulid,
    kind: CatalogKind,
) -> Result<&'a CatalogEntry, ScheduleError> {
    match catalog.get(&id) {
        Some(record) if record.detail.kind() == kind && record.archived_at.is_none() => Ok(record),
        _ => Err(ScheduleError::not_found(kind.label(), id)),
    }
}

fn session_minutes(req: &CreateScheduleEntry) -> Result<u32, ScheduleError> {
    let from_end = match req.end_at {
        Some(end) => {
            if end <= req.start_at {
                return Err(ScheduleError::validation("end_at must be after start_at"));
            }
            let delta = end - req.start_at;
            if delta.num_milliseconds() % MINUTE_MS != 0 {
                return Err(ScheduleError::validation(
                    "end_at - start_at must be a whole number of minutes",
                ));
            }
            Some(delta.num_minutes())
        }
        None => None,
    };

    let minutes = match (req.duration_minutes, from_end) {
        (Some(d), Some(e)) if d != e => {
            return Err(ScheduleError::validation(format!(
                "duration_minutes ({d}) does not match end_at - start_at ({e})"
            )));
        }
        (Some(d), _) => d,
        (None, Some(e)) => e,
        (None, None) => {
            return Err(ScheduleError::validation("duration_minutes or end_at is required"));
        }
    };

    if minutes < 1 || minutes > i64::from(MAX_SESSION_MINUTES) {
        return Err(ScheduleError::validation(format!(
            "duration_minutes must be between 1 and {MAX_SESSION_MINUTES}"
        )));
    }
    Ok(minutes as u32)
}

/// VALIDATING: structural checks first, then catalog references.
pub(crate) fn validate(
    catalog: &HashMap<Ulid, CatalogEntry>,
    req: CreateScheduleEntry,
) -> Result<ValidatedRequest, ScheduleError> {
    let start_ms = req.start_at.timestamp_millis();
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&start_ms) {
        return Err(ScheduleError::validation("start_at outside the supported time range"));
    }
    let duration_minutes = session_minutes(&req)?;

    let timezone_name = req.timezone.clone().unwrap_or_else(|| "UTC".to_string());
    let timezone: Tz = timezone_name
        .parse()
        .map_err(|_| ScheduleError::validation(format!("unknown timezone: {timezone_name}")))?;

    let fields = RecurrenceFields {
        recurrence_type: req.recurrence_type,
        interval: req.recurrence_interval,
        days_of_week: req.recurrence_days_of_week.clone(),
        occurrence_count: req.occurrence_count,
        series_end_date: req.series_end_date,
    };
    let anchor_date = req.start_at.with_timezone(&timezone).date_naive();
    let rule = RecurrenceRule::parse(&fields, anchor_date)?;

    if req.room_ids.len() > MAX_ROOMS_PER_ENTRY {
        return Err(ScheduleError::limit("too many rooms on one entry"));
    }
    if req.attendee_student_ids.len() > MAX_ATTENDEES_PER_ENTRY {
        return Err(ScheduleError::limit("too many attendees on one entry"));
    }
    let room_ids: BTreeSet<Ulid> = req.room_ids.iter().copied().collect();
    let attendee_student_ids: BTreeSet<Ulid> = req.attendee_student_ids.iter().copied().collect();

    let location_detail = req
        .location_detail
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string);
    if location_detail.as_ref().is_some_and(|d| d.len() > MAX_LOCATION_DETAIL_LEN) {
        return Err(ScheduleError::limit("location_detail too long"));
    }

    // ── References ──────────────────────────────────────────

    lookup(catalog, req.tutor_id, CatalogKind::Tutor)?;

    let location = lookup(catalog, req.location_id, CatalogKind::Location)?;
    if let CatalogDetail::Location { kind } = location.detail
        && kind.requires_detail()
    {
        if location_detail.is_none() {
            return Err(ScheduleError::validation(
                "location_detail is required for virtual and offsite locations",
            ));
        }
        if !room_ids.is_empty() {
            return Err(ScheduleError::validation(
                "rooms cannot be booked at a virtual or offsite location",
            ));
        }
    }

    let service = lookup(catalog, req.service_offered_id, CatalogKind::Service)?;
    let (capacity, service_buffer) = match service.detail {
        CatalogDetail::Service {
            capacity,
            buffer_minutes,
        } => (capacity.max(1), buffer_minutes),
        _ => (1, 0),
    };

    if let Some(subject_id) = req.subject_id {
        lookup(catalog, subject_id, CatalogKind::Subject)?;
    }
    if let Some(topic_id) = req.topic_id {
        let topic = lookup(catalog, topic_id, CatalogKind::Topic)?;
        if let CatalogDetail::Topic {
            subject_id: Some(topic_subject),
        } = topic.detail
            && let Some(subject_id) = req.subject_id
            && topic_subject != subject_id
        {
            return Err(ScheduleError::validation(format!(
                "topic {topic_id} does not belong to subject {subject_id}"
            )));
        }
    }

    for &room_id in &room_ids {
        let room = lookup(catalog, room_id, CatalogKind::Room)?;
        if let CatalogDetail::Room { location_id } = room.detail
            && location_id != req.location_id
        {
            return Err(ScheduleError::validation(format!(
                "room {room_id} is not at location {}",
                req.location_id
            )));
        }
    }

    for &student_id in &attendee_student_ids {
        lookup(catalog, student_id, CatalogKind::Student)?;
    }

    Ok(ValidatedRequest {
        tutor_id: req.tutor_id,
        location_id: req.location_id,
        service_offered_id: req.service_offered_id,
        subject_id: req.subject_id,
        topic_id: req.topic_id,
        room_ids,
        attendee_student_ids,
        capacity,
        include_buffer: req.include_buffer,
        buffer_minutes: if req.include_buffer { service_buffer } else { 0 },
        series: SeriesRequest {
            anchor: req.start_at,
            duration_minutes,
            timezone,
            rule,
        },
        timezone: timezone_name,
        location_detail,
        allow_conflicts: req.allow_conflicts,
    })
}
