use std::collections::{BTreeMap, BTreeSet};

use ulid::Ulid;

use crate::index::Scope;
use crate::model::*;
use crate::recurrence::Occurrence;

use super::{ScheduleError, ScheduleState};

/// Which tags block persistence when the caller did not override.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConflictPolicy {
    /// Promote `BUFFER_VIOLATION` from advisory to blocking.
    pub buffer_blocks: bool,
}

impl ConflictPolicy {
    pub fn blocks(&self, tag: ConflictTag) -> bool {
        match tag.severity() {
            Severity::Hard => true,
            Severity::Soft => self.buffer_blocks && tag == ConflictTag::BufferViolation,
        }
    }
}

/// The parts of a creation request the detector needs.
#[derive(Debug, Clone, Copy)]
pub struct DetectionContext<'a> {
    pub tutor_id: Ulid,
    pub room_ids: &'a BTreeSet<Ulid>,
    pub buffer_ms: Ms,
    pub capacity: u32,
    pub attendee_count: usize,
}

/// Every tag found between one candidate occurrence and one existing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictFinding {
    /// Index into the candidate occurrences.
    pub occurrence: usize,
    /// `None` for capacity findings.
    pub conflicting_entry_id: Option<Ulid>,
    pub tags: BTreeSet<ConflictTag>,
    pub message: String,
}

impl ConflictFinding {
    pub fn is_blocking(&self, policy: ConflictPolicy) -> bool {
        self.tags.iter().any(|t| policy.blocks(*t))
    }

    /// Most severe tag; drives display order.
    pub fn rank(&self) -> Option<ConflictTag> {
        self.tags.first().copied()
    }

    pub fn to_error(&self) -> ScheduleError {
        ScheduleError::Conflict {
            message: self.message.clone(),
            tags: self.tags.clone(),
            conflicting_entry_id: self.conflicting_entry_id.unwrap_or_default(),
        }
    }
}

/// Findings in detection order: occurrence order, then existing entries by start.
#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub findings: Vec<ConflictFinding>,
}

impl Detection {
    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn first_blocking(&self, policy: ConflictPolicy) -> Option<&ConflictFinding> {
        self.findings.iter().find(|f| f.is_blocking(policy))
    }

    pub fn all_tags(&self) -> BTreeSet<ConflictTag> {
        self.findings.iter().flat_map(|f| f.tags.iter().copied()).collect()
    }

    /// Findings sorted by severity; ties keep detection order.
    pub fn for_display(&self) -> Vec<&ConflictFinding> {
        let mut sorted: Vec<&ConflictFinding> = self.findings.iter().collect();
        sorted.sort_by_key(|f| f.rank());
        sorted
    }
}

/// Occurrences generated by one request must not overlap each other. Such a
/// pair means the request itself is broken, so this is a validation failure.
pub fn check_series_self_overlap(occurrences: &[Occurrence]) -> Result<(), ScheduleError> {
    let mut spans: Vec<(usize, Span)> = occurrences.iter().map(Occurrence::span).enumerate().collect();
    spans.sort_by_key(|(_, s)| s.start);

    for pair in spans.windows(2) {
        let ((a, first), (b, second)) = (pair[0], pair[1]);
        if first.overlaps(&second) {
            return Err(ScheduleError::validation(format!(
                "recurrence produces overlapping occurrences ({} and {})",
                a + 1,
                b + 1
            )));
        }
    }
    Ok(())
}

/// Tags between a candidate interval and an existing entry sharing its tutor or a room.
fn classify(
    existing: &ScheduleEntry,
    tutor_id: Ulid,
    room_ids: &BTreeSet<Ulid>,
    span: &Span,
    blocked: &Span,
) -> BTreeSet<ConflictTag> {
    let same_tutor = existing.tutor_id == tutor_id;
    let shared_room = existing.shares_room_with(room_ids);
    let mut tags = BTreeSet::new();
    if !same_tutor && !shared_room {
        return tags;
    }
    if existing.span().overlaps(span) {
        if same_tutor {
            tags.insert(ConflictTag::TutorDoubleBooked);
        }
        if shared_room {
            tags.insert(ConflictTag::RoomDoubleBooked);
        }
    } else if existing.blocked_span().overlaps(blocked) {
        tags.insert(ConflictTag::BufferViolation);
    }
    tags
}

fn describe(tags: &BTreeSet<ConflictTag>, existing: &ScheduleEntry) -> String {
    let what: Vec<&str> = tags.iter().map(ConflictTag::describe).collect();
    format!(
        "Schedule conflict: {} (entry {} from {} to {})",
        what.join(", "),
        existing.id,
        existing.start_at.to_rfc3339(),
        existing.end_at.to_rfc3339()
    )
}

fn conflict_error(existing: &ScheduleEntry, tags: BTreeSet<ConflictTag>) -> ScheduleError {
    ScheduleError::Conflict {
        message: describe(&tags, existing),
        tags,
        conflicting_entry_id: existing.id,
    }
}

/// Evaluate every candidate occurrence against the stored entries.
///
/// All findings are collected before returning; nothing short-circuits on the
/// first hard conflict.
pub fn detect(
    state: &ScheduleState,
    candidates: &[Occurrence],
    ctx: &DetectionContext<'_>,
) -> Result<Detection, ScheduleError> {
    check_series_self_overlap(candidates)?;

    let tutor_scope = Scope::tutor(ctx.tutor_id);
    let room_scope = Scope::rooms(ctx.room_ids);
    let mut findings = Vec::new();

    for (i, occurrence) in candidates.iter().enumerate() {
        let span = occurrence.span();
        let blocked = Span::new(span.start, span.end + ctx.buffer_ms);

        let mut hits = state.find_overlapping(&tutor_scope, &blocked);
        if !ctx.room_ids.is_empty() {
            hits.extend(state.find_overlapping(&room_scope, &blocked));
        }

        // One finding per (occurrence, existing entry), ordered by the entry's start.
        let mut by_entry: BTreeMap<(Ms, Ulid), (&ScheduleEntry, BTreeSet<ConflictTag>)> = BTreeMap::new();
        for existing in hits {
            let key = (existing.start_at.timestamp_millis(), existing.id);
            if by_entry.contains_key(&key) {
                continue;
            }
            let tags = classify(existing, ctx.tutor_id, ctx.room_ids, &span, &blocked);
            if !tags.is_empty() {
                by_entry.insert(key, (existing, tags));
            }
        }

        for (existing, tags) in by_entry.into_values() {
            findings.push(ConflictFinding {
                occurrence: i,
                conflicting_entry_id: Some(existing.id),
                message: describe(&tags, existing),
                tags,
            });
        }

        if ctx.attendee_count > ctx.capacity as usize {
            findings.push(ConflictFinding {
                occurrence: i,
                conflicting_entry_id: None,
                tags: BTreeSet::from([ConflictTag::CapacityExceeded]),
                message: format!(
                    "Schedule conflict: {} ({} students for {} seats)",
                    ConflictTag::CapacityExceeded.describe(),
                    ctx.attendee_count,
                    ctx.capacity
                ),
            });
        }
    }

    Ok(Detection { findings })
}

/// Store-level exclusion check, run under the write lock right before a
/// non-override write. Catches anything that slipped in after CHECKING.
pub fn check_exclusion(
    state: &ScheduleState,
    entries: &[ScheduleEntry],
    policy: ConflictPolicy,
) -> Result<(), ScheduleError> {
    for entry in entries {
        let scope = Scope {
            tutor_id: Some(entry.tutor_id),
            room_ids: entry.room_ids.iter().copied().collect(),
            location_id: None,
        };
        let span = entry.span();
        let blocked = entry.blocked_span();
        for existing in state.find_overlapping(&scope, &blocked) {
            if existing.id == entry.id {
                continue;
            }
            let tags = classify(existing, entry.tutor_id, &entry.room_ids, &span, &blocked);
            if tags.iter().any(|t| policy.blocks(*t)) {
                return Err(conflict_error(existing, tags));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn occ(start_min: i64, end_min: i64) -> Occurrence {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Occurrence {
            start_at: base + chrono::TimeDelta::minutes(start_min),
            end_at: base + chrono::TimeDelta::minutes(end_min),
        }
    }

    fn finding(occurrence: usize, tags: &[ConflictTag]) -> ConflictFinding {
        ConflictFinding {
            occurrence,
            conflicting_entry_id: Some(Ulid::new()),
            tags: tags.iter().copied().collect(),
            message: String::new(),
        }
    }

    #[test]
    fn self_overlap_detected_out_of_order() {
        let occurrences = [occ(0, 60), occ(200, 260), occ(30, 90)];
        assert!(matches!(
            check_series_self_overlap(&occurrences),
            Err(ScheduleError::Validation(_))
        ));
    }

    #[test]
    fn touching_occurrences_are_fine() {
        let occurrences = [occ(0, 60), occ(60, 120), occ(120, 180)];
        assert!(check_series_self_overlap(&occurrences).is_ok());
    }

    #[test]
    fn policy_blocks_hard_tags_only_by_default() {
        let policy = ConflictPolicy::default();
        assert!(policy.blocks(ConflictTag::TutorDoubleBooked));
        assert!(policy.blocks(ConflictTag::RoomDoubleBooked));
        assert!(!policy.blocks(ConflictTag::BufferViolation));
        assert!(!policy.blocks(ConflictTag::CapacityExceeded));

        let strict = ConflictPolicy { buffer_blocks: true };
        assert!(strict.blocks(ConflictTag::BufferViolation));
        assert!(!strict.blocks(ConflictTag::CapacityExceeded));
    }

    #[test]
    fn first_blocking_follows_detection_order() {
        let detection = Detection {
            findings: vec![
                finding(0, &[ConflictTag::CapacityExceeded]),
                finding(1, &[ConflictTag::RoomDoubleBooked]),
                finding(2, &[ConflictTag::TutorDoubleBooked]),
            ],
        };
        let first = detection.first_blocking(ConflictPolicy::default()).unwrap();
        assert_eq!(first.occurrence, 1);
    }

    #[test]
    fn display_order_ranks_by_severity() {
        let detection = Detection {
            findings: vec![
                finding(0, &[ConflictTag::CapacityExceeded]),
                finding(0, &[ConflictTag::BufferViolation]),
                finding(1, &[ConflictTag::RoomDoubleBooked]),
                finding(2, &[ConflictTag::TutorDoubleBooked, ConflictTag::RoomDoubleBooked]),
            ],
        };
        let ranks: Vec<_> = detection.for_display().iter().map(|f| f.rank()).collect();
        assert_eq!(
            ranks,
            vec![
                Some(ConflictTag::TutorDoubleBooked),
                Some(ConflictTag::RoomDoubleBooked),
                Some(ConflictTag::BufferViolation),
                Some(ConflictTag::CapacityExceeded),
            ]
        );
        assert_eq!(detection.all_tags().len(), 4);
    }
}
