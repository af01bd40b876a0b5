//! Mirror key layout.
//!
//! ```text
//! items:{sor_id}      cached ItemState of a synced item (record, TTL)
//! subjects:{sor_id}   cached ItemState of a synced subject record (record, TTL)
//! local:{key}         ItemState of a local-only row (record, long TTL)
//! count:{subject}     active items under a subject (counter)
//! capacity:{sor_id}   capacity of a subject record (counter)
//! ```
//!
//! Cached SoR records are namespaced by object type so the sweeper knows
//! where to re-read them. Local rows get their own prefix and are never
//! compared against the SoR. Derived read views (`detail:`, `list:`,
//! `aggregate:`) live in [`crate::invalidation`], which owns their patterns.

use crate::sor::object_types;
use crate::types::ItemRef;

pub const LOCAL_PREFIX: &str = "local:";
pub const ACTIVE_COUNT_PREFIX: &str = "count:";
pub const CAPACITY_PREFIX: &str = "capacity:";

/// Object types whose cached records the sweeper samples.
pub const SYNCED_RECORD_TYPES: [&str; 2] = [object_types::ITEMS, object_types::SUBJECTS];

#[must_use]
pub fn synced_record(object_type: &str, key: &str) -> String {
    format!("{}:{}", object_type, key)
}

#[must_use]
pub fn local_record(key: &str) -> String {
    format!("{}{}", LOCAL_PREFIX, key)
}

/// Where an item's state lives in the mirror.
#[must_use]
pub fn record_for(object_type: &str, item: &ItemRef) -> String {
    match item.sor_id {
        None => local_record(&item.key),
        Some(ref id) => synced_record(object_type, id),
    }
}

/// Glob matching every cached record of one object type.
#[must_use]
pub fn synced_record_pattern(object_type: &str) -> String {
    format!("{}:*", object_type)
}

/// Split a cached-record key into `(object_type, key)`.
#[must_use]
pub fn parse_synced_record(key: &str) -> Option<(&'static str, &str)> {
    SYNCED_RECORD_TYPES.iter().find_map(|t| {
        key.strip_prefix(t)
            .and_then(|rest| rest.strip_prefix(':'))
            .map(|rest| (*t, rest))
    })
}

#[must_use]
pub fn active_count(subject: &str) -> String {
    format!("{}{}", ACTIVE_COUNT_PREFIX, subject)
}

#[must_use]
pub fn capacity(key: &str) -> String {
    format!("{}{}", CAPACITY_PREFIX, key)
}

/// Which counter family a mirror key belongs to, with the subject it tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterKey<'a> {
    ActiveCount(&'a str),
    Capacity(&'a str),
}

impl<'a> CounterKey<'a> {
    #[must_use]
    pub fn parse(key: &'a str) -> Option<Self> {
        if let Some(subject) = key.strip_prefix(ACTIVE_COUNT_PREFIX) {
            return Some(Self::ActiveCount(subject));
        }
        key.strip_prefix(CAPACITY_PREFIX).map(Self::Capacity)
    }

    /// Subject id as the SoR knows it.
    #[must_use]
    pub fn subject(&self) -> &'a str {
        match self {
            Self::ActiveCount(s) | Self::Capacity(s) => s,
        }
    }

    #[must_use]
    pub fn to_key(&self) -> String {
        match self {
            Self::ActiveCount(s) => active_count(s),
            Self::Capacity(s) => capacity(s),
        }
    }
}
