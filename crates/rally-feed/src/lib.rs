//! Merge protocol for UI lists fed by a paginated fetch plus a stream of
//! pushed events. All merge logic is pure so it can be tested without any
//! transport or timing concerns; the identity key comes from
//! `rally_types::identity_of`, applied uniformly at this boundary.

use serde_json::Value;

use rally_types::normalize::identity_of;

/// Where an inbound entity with no matching key is inserted. The direction
/// is topic-specific and must match the initial page's sort order so
/// pagination and streaming never interleave out of order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPolicy {
    /// New top-level item streams (posts, notifications): newest first.
    Head,
    /// Ordered reply streams: oldest first, new entries go last.
    Tail,
}

/// Merge one inbound entity into an ordered list. A matching dedupe key
/// replaces the existing element in place, preserving its position; no
/// match inserts per `policy`. Entities without an identity can never match
/// and are inserted per `policy`.
pub fn merge_entity(mut list: Vec<Value>, entity: Value, policy: InsertPolicy) -> Vec<Value> {
    if let Some(key) = identity_of(&entity) {
        if let Some(pos) = list
            .iter()
            .position(|existing| identity_of(existing) == Some(key.clone()))
        {
            list[pos] = entity;
            return list;
        }
    }
    match policy {
        InsertPolicy::Head => list.insert(0, entity),
        InsertPolicy::Tail => list.push(entity),
    }
    list
}

/// Snapshot of the state replaced by an optimistic merge, so a failed
/// server call can restore exactly what was there before.
#[derive(Debug, Clone)]
pub enum Revert {
    /// The optimistic entity replaced this element at this position.
    Replaced { index: usize, previous: Value },
    /// The optimistic entity was newly inserted at this position.
    Inserted { index: usize },
}

/// Ordered collection merging paginated fetch results with streamed events.
/// Invariant: no two items share a dedupe key.
#[derive(Debug, Clone)]
pub struct ViewList {
    policy: InsertPolicy,
    items: Vec<Value>,
}

impl ViewList {
    pub fn new(policy: InsertPolicy) -> Self {
        Self {
            policy,
            items: Vec::new(),
        }
    }

    /// Seed from the initial page, deduping within the page itself.
    pub fn from_page(page: Vec<Value>, policy: InsertPolicy) -> Self {
        let mut list = Self::new(policy);
        list.extend_page(page);
        list
    }

    /// Append a fetched page. Entries already present (pagination overlap,
    /// or items that streamed in before the page arrived) replace the
    /// existing element in place; new entries keep the page's order at the
    /// tail regardless of the stream policy.
    pub fn extend_page(&mut self, page: Vec<Value>) {
        for entity in page {
            let replaced = identity_of(&entity).is_some_and(|key| {
                match self
                    .items
                    .iter()
                    .position(|e| identity_of(e) == Some(key.clone()))
                {
                    Some(pos) => {
                        self.items[pos] = entity.clone();
                        true
                    }
                    None => false,
                }
            });
            if !replaced {
                self.items.push(entity);
            }
        }
    }

    /// Merge one streamed entity per the list's insert policy.
    pub fn apply(&mut self, entity: Value) {
        self.items = merge_entity(std::mem::take(&mut self.items), entity, self.policy);
    }

    /// Merge an optimistic local entity, returning what to restore if the
    /// server call behind it fails.
    pub fn apply_optimistic(&mut self, entity: Value) -> Revert {
        if let Some(key) = identity_of(&entity) {
            if let Some(pos) = self
                .items
                .iter()
                .position(|e| identity_of(e) == Some(key.clone()))
            {
                let previous = std::mem::replace(&mut self.items[pos], entity);
                return Revert::Replaced {
                    index: pos,
                    previous,
                };
            }
        }
        match self.policy {
            InsertPolicy::Head => {
                self.items.insert(0, entity);
                Revert::Inserted { index: 0 }
            }
            InsertPolicy::Tail => {
                self.items.push(entity);
                Revert::Inserted {
                    index: self.items.len() - 1,
                }
            }
        }
    }

    /// Undo an optimistic merge after the server rejected it.
    pub fn revert(&mut self, revert: Revert) {
        match revert {
            Revert::Replaced { index, previous } => {
                if index < self.items.len() {
                    self.items[index] = previous;
                }
            }
            Revert::Inserted { index } => {
                if index < self.items.len() {
                    self.items.remove(index);
                }
            }
        }
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
