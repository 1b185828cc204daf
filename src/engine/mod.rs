mod conflict;
mod error;
mod journal;
mod mutations;
mod queries;
mod validate;

pub use conflict::{ConflictFinding, ConflictPolicy, Detection, DetectionContext, check_series_self_overlap, detect};
pub use error::ScheduleError;
pub use journal::{Journal, WalJournal};
pub use mutations::CreatedEntries;
pub use queries::{ConflictView, EntryFilter, ResolvedFilter};
pub use validate::CreateScheduleEntry;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use ulid::Ulid;

use crate::index::{OverlapIndex, ResourceKey, Scope};
use crate::limits::MAX_OCCURRENCES_PER_SERIES;
use crate::model::*;

/// Behaviour knobs shared by every tenant engine.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub policy: ConflictPolicy,
    pub max_occurrences: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            policy: ConflictPolicy::default(),
            max_occurrences: MAX_OCCURRENCES_PER_SERIES,
        }
    }
}

/// Everything one organization has scheduled, plus the catalog it schedules against.
#[derive(Debug, Default)]
pub struct ScheduleState {
    pub(crate) entries: HashMap<Ulid, ScheduleEntry>,
    pub(crate) series: HashMap<Ulid, Vec<Ulid>>,
    pub(crate) conflicts: HashMap<Ulid, ScheduleConflict>,
    /// Entry id → conflicts referencing it from either side.
    pub(crate) conflicts_by_entry: HashMap<Ulid, Vec<Ulid>>,
    pub(crate) catalog: HashMap<Ulid, CatalogEntry>,
    pub(crate) index: OverlapIndex,
}

impl ScheduleState {
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::CatalogUpserted(record) => {
                self.catalog.insert(record.id, record.clone());
            }
            Event::EntriesCreated { entries, conflicts } => {
                for entry in entries {
                    if !entry.is_archived() {
                        self.index.insert(entry);
                    }
                    if let Some(series_id) = entry.series_id {
                        self.series.entry(series_id).or_default().push(entry.id);
                    }
                    self.entries.insert(entry.id, entry.clone());
                }
                for conflict in conflicts {
                    self.conflicts_by_entry
                        .entry(conflict.schedule_entry_id)
                        .or_default()
                        .push(conflict.id);
                    if let Some(other) = conflict.conflicting_schedule_entry_id {
                        self.conflicts_by_entry.entry(other).or_default().push(conflict.id);
                    }
                    self.conflicts.insert(conflict.id, conflict.clone());
                }
            }
            Event::EntriesArchived { ids, at } => {
                for id in ids {
                    if let Some(entry) = self.entries.get_mut(id)
                        && entry.archived_at.is_none()
                    {
                        entry.archived_at = Some(*at);
                        self.index.remove(entry);
                    }
                }
            }
            Event::ConflictResolved { id, at } => {
                if let Some(conflict) = self.conflicts.get_mut(id) {
                    conflict.resolved_at = Some(*at);
                }
            }
            Event::ConflictReopened { id } => {
                if let Some(conflict) = self.conflicts.get_mut(id) {
                    conflict.resolved_at = None;
                }
            }
        }
    }

    /// Live entries whose blocked span intersects `window` on any scope dimension.
    pub fn find_overlapping(&self, scope: &Scope, window: &Span) -> Vec<&ScheduleEntry> {
        self.index
            .find_overlapping(scope, window)
            .into_iter()
            .filter_map(|id| self.entries.get(&id))
            .filter(|e| !e.is_archived())
            .collect()
    }

    /// Events that rebuild this state from nothing.
    pub fn snapshot(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .catalog
            .values()
            .cloned()
            .map(Event::CatalogUpserted)
            .collect();

        let mut entries: Vec<&ScheduleEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.id);
        for chunk in entries.chunks(MAX_OCCURRENCES_PER_SERIES) {
            events.push(Event::EntriesCreated {
                entries: chunk.iter().map(|e| (*e).clone()).collect(),
                conflicts: Vec::new(),
            });
        }

        let mut conflicts: Vec<&ScheduleConflict> = self.conflicts.values().collect();
        conflicts.sort_by_key(|c| c.id);
        for chunk in conflicts.chunks(MAX_OCCURRENCES_PER_SERIES) {
            events.push(Event::EntriesCreated {
                entries: Vec::new(),
                conflicts: chunk.iter().map(|c| (*c).clone()).collect(),
            });
        }
        events
    }
}

/// One organization's scheduler: state, durable journal and per-resource locks.
pub struct Engine {
    pub(crate) state: RwLock<ScheduleState>,
    pub(crate) journal: Arc<dyn Journal>,
    /// Advisory locks held from CHECKING through PERSISTING, per tutor and room.
    locks: DashMap<ResourceKey, Arc<Mutex<()>>>,
    pub(crate) options: EngineOptions,
}

impl Engine {
    /// Open (or create) the engine backed by the WAL at `wal_path`.
    pub fn new(wal_path: PathBuf, options: EngineOptions) -> std::io::Result<Self> {
        let (journal, events) = WalJournal::open(&wal_path)?;
        Ok(Self::from_journal(Arc::new(journal), &events, options))
    }

    /// Build an engine from an already-open journal and the events it replayed.
    pub fn from_journal(journal: Arc<dyn Journal>, events: &[Event], options: EngineOptions) -> Self {
        let mut state = ScheduleState::default();
        for event in events {
            state.apply(event);
        }
        Self {
            state: RwLock::new(state),
            journal,
            locks: DashMap::new(),
            options,
        }
    }

    pub fn options(&self) -> EngineOptions {
        self.options
    }

    /// Journal first, then apply. Caller holds the state write lock.
    pub(crate) async fn persist_and_apply(
        &self,
        state: &mut ScheduleState,
        event: &Event,
    ) -> Result<(), ScheduleError> {
        self.journal.append(event).await?;
        state.apply(event);
        Ok(())
    }

    /// Acquire advisory locks in sorted key order so concurrent requests can't deadlock.
    pub(crate) async fn lock_resources(
        &self,
        keys: impl IntoIterator<Item = ResourceKey>,
    ) -> Vec<OwnedMutexGuard<()>> {
        let mut keys: Vec<ResourceKey> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let lock = self.locks.entry(key).or_default().value().clone();
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.journal.appends_since_compact().await
    }

    /// Rewrite the journal as a snapshot of the current state.
    pub async fn compact_wal(&self) -> Result<(), ScheduleError> {
        // Hold the write lock so no append lands between snapshot and swap.
        let state = self.state.write().await;
        let events = state.snapshot();
        self.journal.compact(events).await
    }
}
