use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Every interval computation happens in this unit.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Tags a detected collision. Declaration order is the display rank:
/// double-bookings first, then buffer, then capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictTag {
    TutorDoubleBooked,
    RoomDoubleBooked,
    BufferViolation,
    CapacityExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Blocks persistence unless the caller overrides.
    Hard,
    /// Advisory; recorded after save, never blocks.
    Soft,
}

impl ConflictTag {
    pub fn severity(&self) -> Severity {
        match self {
            ConflictTag::TutorDoubleBooked | ConflictTag::RoomDoubleBooked => Severity::Hard,
            ConflictTag::BufferViolation | ConflictTag::CapacityExceeded => Severity::Soft,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictTag::TutorDoubleBooked => "TUTOR_DOUBLE_BOOKED",
            ConflictTag::RoomDoubleBooked => "ROOM_DOUBLE_BOOKED",
            ConflictTag::BufferViolation => "BUFFER_VIOLATION",
            ConflictTag::CapacityExceeded => "CAPACITY_EXCEEDED",
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            ConflictTag::TutorDoubleBooked => "tutor is double-booked",
            ConflictTag::RoomDoubleBooked => "room is double-booked",
            ConflictTag::BufferViolation => "not enough turnaround time",
            ConflictTag::CapacityExceeded => "attendees exceed capacity",
        }
    }
}

impl std::fmt::Display for ConflictTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecurrenceType {
    #[default]
    None,
    Weekly,
    Daily,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    InPerson,
    Virtual,
    Offsite,
}

impl LocationKind {
    /// Virtual and offsite locations carry their address/URL on the entry.
    pub fn requires_detail(&self) -> bool {
        matches!(self, LocationKind::Virtual | LocationKind::Offsite)
    }
}

/// One concrete bookable session instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: Ulid,
    pub location_id: Ulid,
    pub tutor_id: Ulid,
    pub service_offered_id: Ulid,
    pub subject_id: Option<Ulid>,
    pub topic_id: Option<Ulid>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    /// `end_at` plus the service buffer when `include_buffer` is set.
    pub blocked_end_at: DateTime<Utc>,
    pub duration_minutes: u32,
    pub capacity: u32,
    pub include_buffer: bool,
    pub room_ids: BTreeSet<Ulid>,
    pub attendee_student_ids: BTreeSet<Ulid>,
    pub recurrence_type: RecurrenceType,
    pub recurrence_interval: Option<u32>,
    pub recurrence_days_of_week: BTreeSet<u8>,
    pub series_id: Option<Ulid>,
    pub series_end_date: Option<NaiveDate>,
    pub occurrence_count: Option<u32>,
    pub timezone: String,
    pub location_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl ScheduleEntry {
    /// The session itself, `[start_at, end_at)`.
    pub fn span(&self) -> Span {
        Span::new(self.start_at.timestamp_millis(), self.end_at.timestamp_millis())
    }

    /// The time the tutor/rooms are unavailable, `[start_at, blocked_end_at)`.
    pub fn blocked_span(&self) -> Span {
        Span::new(
            self.start_at.timestamp_millis(),
            self.blocked_end_at.timestamp_millis(),
        )
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    pub fn shares_room_with(&self, rooms: &BTreeSet<Ulid>) -> bool {
        !self.room_ids.is_disjoint(rooms)
    }
}

/// A detected overlap between a new entry and an existing one.
///
/// Stored once, from the newer entry's side; lookups by either entry find it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConflict {
    pub id: Ulid,
    pub schedule_entry_id: Ulid,
    /// `None` only for `CAPACITY_EXCEEDED`, which concerns a single entry.
    pub conflicting_schedule_entry_id: Option<Ulid>,
    pub conflict_tags: BTreeSet<ConflictTag>,
    pub message: String,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ScheduleConflict {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }

    pub fn involves(&self, entry_id: Ulid) -> bool {
        self.schedule_entry_id == entry_id || self.conflicting_schedule_entry_id == Some(entry_id)
    }
}

// ── Catalog (read-only collaborator data) ────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogKind {
    Location,
    Room,
    Tutor,
    Service,
    Subject,
    Topic,
    Student,
}

impl CatalogKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "locations" | "location" => Some(CatalogKind::Location),
            "rooms" | "room" => Some(CatalogKind::Room),
            "tutors" | "tutor" => Some(CatalogKind::Tutor),
            "services" | "service" | "services-offered" => Some(CatalogKind::Service),
            "subjects" | "subject" => Some(CatalogKind::Subject),
            "topics" | "topic" => Some(CatalogKind::Topic),
            "students" | "student" => Some(CatalogKind::Student),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CatalogKind::Location => "location",
            CatalogKind::Room => "room",
            CatalogKind::Tutor => "tutor",
            CatalogKind::Service => "service",
            CatalogKind::Subject => "subject",
            CatalogKind::Topic => "topic",
            CatalogKind::Student => "student",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatalogDetail {
    Location { kind: LocationKind },
    Room { location_id: Ulid },
    Tutor,
    Service { capacity: u32, buffer_minutes: u32 },
    Subject,
    Topic { subject_id: Option<Ulid> },
    Student,
}

impl CatalogDetail {
    pub fn kind(&self) -> CatalogKind {
        match self {
            CatalogDetail::Location { .. } => CatalogKind::Location,
            CatalogDetail::Room { .. } => CatalogKind::Room,
            CatalogDetail::Tutor => CatalogKind::Tutor,
            CatalogDetail::Service { .. } => CatalogKind::Service,
            CatalogDetail::Subject => CatalogKind::Subject,
            CatalogDetail::Topic { .. } => CatalogKind::Topic,
            CatalogDetail::Student => CatalogKind::Student,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: Ulid,
    pub name: Option<String>,
    pub archived_at: Option<DateTime<Utc>>,
    pub detail: CatalogDetail,
}

/// The event types. Flat, no nesting beyond the records themselves.
/// This is the WAL record format; one creation request is exactly one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CatalogUpserted(CatalogEntry),
    EntriesCreated {
        entries: Vec<ScheduleEntry>,
        conflicts: Vec<ScheduleConflict>,
    },
    EntriesArchived {
        ids: Vec<Ulid>,
        at: DateTime<Utc>,
    },
    ConflictResolved {
        id: Ulid,
        at: DateTime<Utc>,
    },
    ConflictReopened {
        id: Ulid,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn tag_rank_orders_double_bookings_first() {
        let mut tags = vec![
            ConflictTag::CapacityExceeded,
            ConflictTag::BufferViolation,
            ConflictTag::RoomDoubleBooked,
            ConflictTag::TutorDoubleBooked,
        ];
        tags.sort();
        assert_eq!(
            tags,
            vec![
                ConflictTag::TutorDoubleBooked,
                ConflictTag::RoomDoubleBooked,
                ConflictTag::BufferViolation,
                ConflictTag::CapacityExceeded,
            ]
        );
        assert_eq!(ConflictTag::TutorDoubleBooked.severity(), Severity::Hard);
        assert_eq!(ConflictTag::BufferViolation.severity(), Severity::Soft);
    }

    #[test]
    fn tags_serialize_screaming_snake() {
        let json = serde_json::to_string(&ConflictTag::RoomDoubleBooked).unwrap();
        assert_eq!(json, "\"ROOM_DOUBLE_BOOKED\"");
        let t: RecurrenceType = serde_json::from_str("\"WEEKLY\"").unwrap();
        assert_eq!(t, RecurrenceType::Weekly);
    }

    #[test]
    fn catalog_kind_parses_plural_paths() {
        assert_eq!(CatalogKind::parse("tutors"), Some(CatalogKind::Tutor));
        assert_eq!(CatalogKind::parse("services-offered"), Some(CatalogKind::Service));
        assert_eq!(CatalogKind::parse("widgets"), None);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::CatalogUpserted(CatalogEntry {
            id: Ulid::new(),
            name: Some("Room 1".into()),
            archived_at: None,
            detail: CatalogDetail::Room { location_id: Ulid::new() },
        });
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
