use std::collections::{BTreeMap, HashMap};

use ulid::Ulid;

use crate::model::*;

/// A schedulable dimension an entry occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKey {
    Tutor(Ulid),
    Room(Ulid),
    Location(Ulid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub entry_id: Ulid,
    pub span: Span,
}

/// Slots for one resource, sorted by `(span.start, entry_id)`.
///
/// `max_len` bounds how far back a slot can start and still reach a query window,
/// so lookups binary-search both ends instead of scanning history.
#[derive(Debug, Default, Clone)]
pub struct IntervalList {
    slots: Vec<Slot>,
    max_len: Ms,
}

impl IntervalList {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn insert(&mut self, slot: Slot) {
        let key = (slot.span.start, slot.entry_id);
        let pos = self
            .slots
            .binary_search_by_key(&key, |s| (s.span.start, s.entry_id))
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
        self.max_len = self.max_len.max(slot.span.duration_ms());
    }

    pub fn remove(&mut self, entry_id: Ulid, start: Ms) -> Option<Slot> {
        let pos = self
            .slots
            .binary_search_by_key(&(start, entry_id), |s| (s.span.start, s.entry_id))
            .ok()?;
        Some(self.slots.remove(pos))
    }

    /// Slots whose span intersects `query`, in start order.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Slot> {
        let earliest_start = query.start.saturating_sub(self.max_len);
        let left = self.slots.partition_point(|s| s.span.start <= earliest_start);
        // Everything at index >= right starts at or after query.end → can't overlap.
        let right = self.slots.partition_point(|s| s.span.start < query.end);
        let window = if left < right { &self.slots[left..right] } else { &[][..] };
        window.iter().filter(move |s| s.span.end > query.start)
    }
}

/// Which dimensions a lookup covers. An entry matches when it shares at least one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    pub tutor_id: Option<Ulid>,
    pub room_ids: Vec<Ulid>,
    pub location_id: Option<Ulid>,
}

impl Scope {
    pub fn tutor(id: Ulid) -> Self {
        Self {
            tutor_id: Some(id),
            ..Default::default()
        }
    }

    pub fn rooms<'a>(ids: impl IntoIterator<Item = &'a Ulid>) -> Self {
        Self {
            room_ids: ids.into_iter().copied().collect(),
            ..Default::default()
        }
    }

    pub fn location(id: Ulid) -> Self {
        Self {
            location_id: Some(id),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tutor_id.is_none() && self.room_ids.is_empty() && self.location_id.is_none()
    }

    fn keys(&self) -> impl Iterator<Item = ResourceKey> + '_ {
        self.tutor_id
            .map(ResourceKey::Tutor)
            .into_iter()
            .chain(self.room_ids.iter().copied().map(ResourceKey::Room))
            .chain(self.location_id.map(ResourceKey::Location))
    }
}

/// Per-tutor, per-room and per-location interval lists over the blocked span
/// `[start_at, blocked_end_at)` of every live entry.
#[derive(Debug, Default)]
pub struct OverlapIndex {
    lists: HashMap<ResourceKey, IntervalList>,
}

impl OverlapIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn keys_for(entry: &ScheduleEntry) -> impl Iterator<Item = ResourceKey> + '_ {
        std::iter::once(ResourceKey::Tutor(entry.tutor_id))
            .chain(entry.room_ids.iter().copied().map(ResourceKey::Room))
            .chain(std::iter::once(ResourceKey::Location(entry.location_id)))
    }

    pub fn insert(&mut self, entry: &ScheduleEntry) {
        let slot = Slot {
            entry_id: entry.id,
            span: entry.blocked_span(),
        };
        for key in Self::keys_for(entry) {
            self.lists.entry(key).or_default().insert(slot);
        }
    }

    pub fn remove(&mut self, entry: &ScheduleEntry) {
        let start = entry.start_at.timestamp_millis();
        for key in Self::keys_for(entry) {
            if let Some(list) = self.lists.get_mut(&key) {
                list.remove(entry.id, start);
                if list.is_empty() {
                    self.lists.remove(&key);
                }
            }
        }
    }

    /// Entry ids whose blocked span intersects `window` and that match at least
    /// one scope dimension. Deduplicated, ordered by `(start, id)`.
    pub fn find_overlapping(&self, scope: &Scope, window: &Span) -> Vec<Ulid> {
        let mut hits: BTreeMap<(Ms, Ulid), ()> = BTreeMap::new();
        for key in scope.keys() {
            if let Some(list) = self.lists.get(&key) {
                for slot in list.overlapping(window) {
                    hits.insert((slot.span.start, slot.entry_id), ());
                }
            }
        }
        hits.into_keys().map(|(_, id)| id).collect()
    }

    pub fn slot_count(&self, key: &ResourceKey) -> usize {
        self.lists.get(key).map_or(0, IntervalList::len)
    }
}
