use serde::Serialize;
use ulid::Ulid;

use crate::index::Scope;
use crate::limits::*;
use crate::model::*;

use super::{Engine, ScheduleError, ScheduleState};

/// The `resolved` query filter on conflict listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResolvedFilter {
    /// `resolved=false`: only conflicts still open.
    #[default]
    Open,
    /// `resolved=true`
    Resolved,
    /// `resolved=all`
    All,
}

impl ResolvedFilter {
    pub fn parse(s: &str) -> Result<Self, ScheduleError> {
        match s {
            "false" => Ok(ResolvedFilter::Open),
            "true" => Ok(ResolvedFilter::Resolved),
            "all" => Ok(ResolvedFilter::All),
            other => Err(ScheduleError::validation(format!(
                "resolved must be true, false or all (got {other:?})"
            ))),
        }
    }

    pub fn matches(&self, conflict: &ScheduleConflict) -> bool {
        match self {
            ResolvedFilter::Open => conflict.is_open(),
            ResolvedFilter::Resolved => !conflict.is_open(),
            ResolvedFilter::All => true,
        }
    }
}

/// A conflict row, optionally with both entries it references.
#[derive(Debug, Clone, Serialize)]
pub struct ConflictView {
    #[serde(flatten)]
    pub conflict: ScheduleConflict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_entry: Option<ScheduleEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicting_schedule_entry: Option<ScheduleEntry>,
}

impl ConflictView {
    fn build(state: &ScheduleState, conflict: &ScheduleConflict, hydrate: bool) -> Self {
        let lookup = |id: Option<Ulid>| {
            if hydrate {
                id.and_then(|id| state.entries.get(&id).cloned())
            } else {
                None
            }
        };
        Self {
            schedule_entry: lookup(Some(conflict.schedule_entry_id)),
            conflicting_schedule_entry: lookup(conflict.conflicting_schedule_entry_id),
            conflict: conflict.clone(),
        }
    }
}

/// Entry listing: everything whose blocked span meets `window` on any scope dimension.
#[derive(Debug, Clone)]
pub struct EntryFilter {
    pub window: Span,
    /// Empty scope lists every entry in the window.
    pub scope: Scope,
    pub include_archived: bool,
}

impl Engine {
    pub async fn get_entry(&self, id: Ulid) -> Result<ScheduleEntry, ScheduleError> {
        let state = self.state.read().await;
        state
            .entries
            .get(&id)
            .cloned()
            .ok_or(ScheduleError::not_found("schedule entry", id))
    }

    pub async fn get_conflict(&self, id: Ulid) -> Result<ScheduleConflict, ScheduleError> {
        let state = self.state.read().await;
        state
            .conflicts
            .get(&id)
            .cloned()
            .ok_or(ScheduleError::not_found("conflict", id))
    }

    pub async fn list_entries(&self, filter: &EntryFilter) -> Result<Vec<ScheduleEntry>, ScheduleError> {
        let window = filter.window;
        if window.start >= window.end {
            return Err(ScheduleError::validation("from must be before to"));
        }
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(ScheduleError::limit("query window too wide"));
        }

        let state = self.state.read().await;
        let mut out: Vec<ScheduleEntry> = if filter.scope.is_empty() || filter.include_archived {
            state
                .entries
                .values()
                .filter(|e| filter.include_archived || !e.is_archived())
                .filter(|e| e.blocked_span().overlaps(&window))
                .filter(|e| filter.scope.is_empty() || in_scope(&filter.scope, e))
                .cloned()
                .collect()
        } else {
            state
                .find_overlapping(&filter.scope, &window)
                .into_iter()
                .cloned()
                .collect()
        };
        out.sort_by_key(|e| (e.start_at, e.id));
        Ok(out)
    }

    /// Every entry of a series, archived ones included, in start order.
    pub async fn series_entries(&self, series_id: Ulid) -> Result<Vec<ScheduleEntry>, ScheduleError> {
        let state = self.state.read().await;
        let ids = state
            .series
            .get(&series_id)
            .ok_or(ScheduleError::not_found("series", series_id))?;
        let mut out: Vec<ScheduleEntry> = ids
            .iter()
            .filter_map(|id| state.entries.get(id))
            .cloned()
            .collect();
        out.sort_by_key(|e| (e.start_at, e.id));
        Ok(out)
    }

    pub async fn list_conflicts(&self, filter: ResolvedFilter, hydrate: bool) -> Vec<ConflictView> {
        let state = self.state.read().await;
        let mut out: Vec<ConflictView> = state
            .conflicts
            .values()
            .filter(|c| filter.matches(c))
            .map(|c| ConflictView::build(&state, c, hydrate))
            .collect();
        out.sort_by_key(|v| v.conflict.id);
        out
    }

    /// Conflicts that reference `entry_id` from either side.
    pub async fn conflicts_for_entry(&self, entry_id: Ulid) -> Result<Vec<ScheduleConflict>, ScheduleError> {
        let state = self.state.read().await;
        if !state.entries.contains_key(&entry_id) {
            return Err(ScheduleError::not_found("schedule entry", entry_id));
        }
        let mut out: Vec<ScheduleConflict> = state
            .conflicts_by_entry
            .get(&entry_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.conflicts.get(id))
            .cloned()
            .collect();
        out.sort_by_key(|c| c.id);
        out.dedup_by_key(|c| c.id);
        Ok(out)
    }
}

fn in_scope(scope: &Scope, entry: &ScheduleEntry) -> bool {
    scope.tutor_id == Some(entry.tutor_id)
        || scope.location_id == Some(entry.location_id)
        || scope.room_ids.iter().any(|r| entry.room_ids.contains(r))
}
