use chrono::Utc;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{CONFLICTS_RECORDED_TOTAL, CREATIONS_REJECTED_TOTAL, OCCURRENCES_CREATED_TOTAL};
use crate::recurrence::expand;

use super::conflict::{check_exclusion, detect};
use super::validate::{CreateScheduleEntry, validate};
use super::{Engine, ScheduleError};

/// What one successful creation request persisted.
#[derive(Debug, Clone)]
pub struct CreatedEntries {
    /// Occurrence order; the anchor is first.
    pub entries: Vec<ScheduleEntry>,
    pub conflicts: Vec<ScheduleConflict>,
}

impl CreatedEntries {
    pub fn first(&self) -> Option<&ScheduleEntry> {
        self.entries.first()
    }

    /// Ids of every entry after the first.
    pub fn series_entry_ids(&self) -> Vec<Ulid> {
        self.entries.iter().skip(1).map(|e| e.id).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CreatePhase {
    Validating,
    Expanding,
    Checking,
    Rejected,
    Persisting,
    Done,
}

impl CreatePhase {
    fn advance(self, next: CreatePhase, request: Ulid) -> CreatePhase {
        debug!(%request, "create {:?} -> {:?}", self, next);
        next
    }
}

fn recurrence_label(t: RecurrenceType) -> &'static str {
    match t {
        RecurrenceType::None => "none",
        RecurrenceType::Daily => "daily",
        RecurrenceType::Weekly => "weekly",
    }
}

impl Engine {
    /// Validate, expand, check and persist one creation request.
    ///
    /// Either every occurrence is stored together with its conflict rows, or
    /// nothing is.
    pub async fn create_schedule_entries(
        &self,
        req: CreateScheduleEntry,
    ) -> Result<CreatedEntries, ScheduleError> {
        let request = Ulid::new();
        let result = self.run_create(request, req).await;
        if let Err(e) = &result {
            metrics::counter!(CREATIONS_REJECTED_TOTAL, "reason" => e.label()).increment(1);
            debug!(%request, "create failed: {e}");
        }
        result
    }

    async fn run_create(
        &self,
        request: Ulid,
        req: CreateScheduleEntry,
    ) -> Result<CreatedEntries, ScheduleError> {
        let phase = CreatePhase::Validating;
        let validated = {
            let state = self.state.read().await;
            validate(&state.catalog, req)?
        };

        let phase = phase.advance(CreatePhase::Expanding, request);
        let occurrences = expand(&validated.series, self.options.max_occurrences)?;

        let phase = phase.advance(CreatePhase::Checking, request);
        let _guards = self.lock_resources(validated.resource_keys()).await;
        let detection = {
            let state = self.state.read().await;
            detect(&state, &occurrences, &validated.detection_context())?
        };

        let policy = self.options.policy;
        if !validated.allow_conflicts
            && let Some(finding) = detection.first_blocking(policy)
        {
            phase.advance(CreatePhase::Rejected, request);
            warn!(
                %request,
                tutor = %validated.tutor_id,
                occurrences = occurrences.len(),
                "creation rejected: {}",
                finding.message
            );
            return Err(finding.to_error());
        }

        let phase = phase.advance(CreatePhase::Persisting, request);
        let now = Utc::now();
        let series_id = validated.series.rule.is_recurring().then(Ulid::new);
        let entries: Vec<ScheduleEntry> = occurrences
            .iter()
            .map(|o| validated.entry_for(o, series_id, now))
            .collect();
        let conflicts: Vec<ScheduleConflict> = detection
            .findings
            .iter()
            .map(|f| ScheduleConflict {
                id: Ulid::new(),
                schedule_entry_id: entries[f.occurrence].id,
                conflicting_schedule_entry_id: f.conflicting_entry_id,
                conflict_tags: f.tags.clone(),
                message: f.message.clone(),
                resolved_at: None,
                created_at: now,
            })
            .collect();

        let created = CreatedEntries { entries, conflicts };
        let event = Event::EntriesCreated {
            entries: created.entries.clone(),
            conflicts: created.conflicts.clone(),
        };
        {
            let mut state = self.state.write().await;
            if !validated.allow_conflicts {
                check_exclusion(&state, &created.entries, policy)?;
            }
            self.persist_and_apply(&mut state, &event).await?;
        }
        phase.advance(CreatePhase::Done, request);

        let recurrence = recurrence_label(validated.series.rule.recurrence_type());
        metrics::counter!(OCCURRENCES_CREATED_TOTAL, "recurrence" => recurrence)
            .increment(created.entries.len() as u64);
        for conflict in &created.conflicts {
            for tag in &conflict.conflict_tags {
                metrics::counter!(CONFLICTS_RECORDED_TOTAL, "tag" => tag.as_str()).increment(1);
            }
        }
        if !created.conflicts.is_empty() {
            debug!(%request, conflicts = created.conflicts.len(), "recorded open conflicts");
        }
        Ok(created)
    }

    /// Set or clear `resolved_at`. Already in the requested state is a no-op success.
    pub async fn set_conflict_resolved(
        &self,
        id: Ulid,
        resolved: bool,
    ) -> Result<ScheduleConflict, ScheduleError> {
        let mut state = self.state.write().await;
        let conflict = state
            .conflicts
            .get(&id)
            .ok_or(ScheduleError::not_found("conflict", id))?;
        let event = match (resolved, conflict.resolved_at) {
            (true, None) => Event::ConflictResolved { id, at: Utc::now() },
            (false, Some(_)) => Event::ConflictReopened { id },
            _ => return Ok(conflict.clone()),
        };
        self.persist_and_apply(&mut state, &event).await?;
        state
            .conflicts
            .get(&id)
            .cloned()
            .ok_or(ScheduleError::not_found("conflict", id))
    }

    pub async fn resolve_conflict(&self, id: Ulid) -> Result<ScheduleConflict, ScheduleError> {
        self.set_conflict_resolved(id, true).await
    }

    pub async fn reopen_conflict(&self, id: Ulid) -> Result<ScheduleConflict, ScheduleError> {
        self.set_conflict_resolved(id, false).await
    }

    /// Soft-delete one entry. Conflicts referencing it are left as they are.
    pub async fn archive_entry(&self, id: Ulid) -> Result<ScheduleEntry, ScheduleError> {
        let mut state = self.state.write().await;
        let entry = state
            .entries
            .get(&id)
            .ok_or(ScheduleError::not_found("schedule entry", id))?;
        if entry.is_archived() {
            return Ok(entry.clone());
        }
        let event = Event::EntriesArchived {
            ids: vec![id],
            at: Utc::now(),
        };
        self.persist_and_apply(&mut state, &event).await?;
        state
            .entries
            .get(&id)
            .cloned()
            .ok_or(ScheduleError::not_found("schedule entry", id))
    }

    /// Soft-delete every live entry of a series. Returns how many were archived.
    pub async fn archive_series(&self, series_id: Ulid) -> Result<usize, ScheduleError> {
        let mut state = self.state.write().await;
        let ids: Vec<Ulid> = state
            .series
            .get(&series_id)
            .ok_or(ScheduleError::not_found("series", series_id))?
            .iter()
            .copied()
            .filter(|id| state.entries.get(id).is_some_and(|e| !e.is_archived()))
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let count = ids.len();
        let event = Event::EntriesArchived { ids, at: Utc::now() };
        self.persist_and_apply(&mut state, &event).await?;
        Ok(count)
    }

    /// Insert or replace a catalog record. An id keeps its kind for life.
    pub async fn upsert_catalog(&self, record: CatalogEntry) -> Result<CatalogEntry, ScheduleError> {
        if let Some(name) = &record.name
            && name.len() > MAX_NAME_LEN
        {
            return Err(ScheduleError::limit("name too long"));
        }
        if let CatalogDetail::Service {
            capacity,
            buffer_minutes,
        } = record.detail
        {
            if capacity == 0 {
                return Err(ScheduleError::validation("service capacity must be at least 1"));
            }
            if buffer_minutes > MAX_BUFFER_MINUTES {
                return Err(ScheduleError::limit("service buffer too long"));
            }
        }

        let mut state = self.state.write().await;
        if let Some(existing) = state.catalog.get(&record.id)
            && existing.detail.kind() != record.detail.kind()
        {
            return Err(ScheduleError::validation(format!(
                "{} is already a {}",
                record.id,
                existing.detail.kind().label()
            )));
        }
        let parent = match record.detail {
            CatalogDetail::Room { location_id } => Some((location_id, CatalogKind::Location)),
            CatalogDetail::Topic {
                subject_id: Some(subject_id),
            } => Some((subject_id, CatalogKind::Subject)),
            _ => None,
        };
        if let Some((parent_id, kind)) = parent
            && !state
                .catalog
                .get(&parent_id)
                .is_some_and(|p| p.detail.kind() == kind)
        {
            return Err(ScheduleError::not_found(kind.label(), parent_id));
        }

        let event = Event::CatalogUpserted(record.clone());
        self.persist_and_apply(&mut state, &event).await?;
        Ok(record)
    }
}
