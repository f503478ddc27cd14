// src/cache.rs

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::cmp::Ordering;

use crate::object::ParseObject;

/// Cache key: class name plus server object id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub class_name: String,
    pub object_id: String,
}

impl EntityKey {
    pub fn new(class_name: impl Into<String>, object_id: impl Into<String>) -> Self {
        EntityKey {
            class_name: class_name.into(),
            object_id: object_id.into(),
        }
    }

    pub fn of(object: &ParseObject) -> Option<Self> {
        object
            .object_id()
            .map(|id| EntityKey::new(object.class_name(), id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The entity was not cached before.
    Inserted,
    /// The incoming state was at least as new and has been merged.
    Applied,
    /// The incoming state was older than the cached copy and was ignored.
    Stale,
}

/// Shared last-known server state per entity.
///
/// Merges for one key run under that key's shard lock, so a save completing
/// and a live event arriving for the same entity are applied one after the
/// other. Ordering is last-write-wins on `updatedAt`; when either side lacks a
/// timestamp, arrival order decides.
#[derive(Debug, Default)]
pub struct EntityCache {
    entries: DashMap<EntityKey, ParseObject>,
}

fn is_older(incoming: &ParseObject, cached: &ParseObject) -> bool {
    match (incoming.updated_at(), cached.updated_at()) {
        (Some(a), Some(b)) => a.chronological_cmp(b) == Ordering::Less,
        _ => false,
    }
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, class_name: &str, object_id: &str) -> bool {
        self.entries.contains_key(&EntityKey::new(class_name, object_id))
    }

    /// Snapshot of the cached state.
    pub fn get(&self, class_name: &str, object_id: &str) -> Option<ParseObject> {
        self.entries
            .get(&EntityKey::new(class_name, object_id))
            .map(|entry| entry.value().clone())
    }

    /// Starts tracking `object` (or merges it, if already tracked).
    /// Unsaved objects are not cacheable and are ignored.
    pub fn track(&self, object: &ParseObject) -> Option<MergeOutcome> {
        self.merge(object).map(|(outcome, _)| outcome)
    }

    /// Merges server state for an entity and returns the state that won.
    ///
    /// Attributes missing from `incoming` keep their cached values, which is
    /// right for partial records (projections, save acknowledgements).
    /// Returns `None` only when `incoming` has no object id.
    pub fn merge(&self, incoming: &ParseObject) -> Option<(MergeOutcome, ParseObject)> {
        self.upsert(incoming, false)
    }

    /// Like [`merge`](EntityCache::merge), but `incoming` is taken as the
    /// complete server state: cached attributes it lacks are dropped.
    pub fn replace(&self, incoming: &ParseObject) -> Option<(MergeOutcome, ParseObject)> {
        self.upsert(incoming, true)
    }

    fn upsert(&self, incoming: &ParseObject, complete: bool) -> Option<(MergeOutcome, ParseObject)> {
        let key = EntityKey::of(incoming)?;
        let result = match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if is_older(incoming, occupied.get()) {
                    log::debug!(
                        "ignoring stale state for {}/{}",
                        incoming.class_name(),
                        incoming.object_id().unwrap_or_default()
                    );
                    (MergeOutcome::Stale, occupied.get().clone())
                } else {
                    if complete {
                        occupied.get_mut().adopt_server_state(incoming);
                    } else {
                        occupied.get_mut().merge_server_state(incoming);
                    }
                    (MergeOutcome::Applied, occupied.get().clone())
                }
            }
            Entry::Vacant(vacant) => {
                let mut snapshot = incoming.clone();
                snapshot.revert();
                vacant.insert(snapshot.clone());
                (MergeOutcome::Inserted, snapshot)
            }
        };
        Some(result)
    }

    /// Merges a freshly saved object into its cached copy, if there is one.
    /// `removed` lists the attributes the save deleted.
    pub(crate) fn refresh_if_cached(&self, saved: &ParseObject, removed: &[String]) -> Option<MergeOutcome> {
        let key = EntityKey::of(saved)?;
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if is_older(saved, occupied.get()) {
                    Some(MergeOutcome::Stale)
                } else {
                    let cached = occupied.get_mut();
                    cached.merge_server_state(saved);
                    cached.drop_server_keys(removed);
                    Some(MergeOutcome::Applied)
                }
            }
            Entry::Vacant(_) => None,
        }
    }

    pub fn evict(&self, class_name: &str, object_id: &str) -> Option<ParseObject> {
        self.entries
            .remove(&EntityKey::new(class_name, object_id))
            .map(|(_, object)| object)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
