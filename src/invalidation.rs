//! Invalidation propagator.
//!
//! Derived read views are cached under these key families:
//!
//! | Entity  | Patterns purged                                           |
//! |---------|-----------------------------------------------------------|
//! | Item    | `detail:{key}`, `list:{subject}:*`, `aggregate:*`         |
//! | Subject | `detail:{subject}`, `list:{subject}:*`, `aggregate:*`     |
//!
//! [`ITEM_VIEWS`] and [`SUBJECT_VIEWS`] are the whole mapping. Adding a new
//! derived view means adding its template here and nowhere else.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::storage::traits::MirrorStore;
use crate::tasks::BackgroundTasks;

/// Something a mutation touched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Entity {
    Item { key: String, subject: Option<String> },
    Subject { id: String },
}

/// Templates for an item. `{key}` is the item key, `{subject}` its parent.
pub const ITEM_VIEWS: &[&str] = &["detail:{key}", "list:{subject}:*", "aggregate:*"];

/// Templates for a subject. `{subject}` is the subject id.
pub const SUBJECT_VIEWS: &[&str] = &["detail:{subject}", "list:{subject}:*", "aggregate:*"];

/// Deduplicated, ordered set of glob patterns to purge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationSet {
    patterns: BTreeSet<String>,
}

impl InvalidationSet {
    /// Pure mapping from entities to patterns. Order of `entities` is irrelevant.
    #[must_use]
    pub fn for_entities(entities: &[Entity]) -> Self {
        let mut patterns = BTreeSet::new();
        for entity in entities {
            match entity {
                Entity::Item { key, subject } => {
                    for template in ITEM_VIEWS {
                        if template.contains("{subject}") && subject.is_none() {
                            continue;
                        }
                        patterns.insert(render(template, Some(key), subject.as_deref()));
                    }
                }
                Entity::Subject { id } => {
                    for template in SUBJECT_VIEWS {
                        patterns.insert(render(template, None, Some(id)));
                    }
                }
            }
        }
        Self { patterns }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, pattern: &str) -> bool {
        self.patterns.contains(pattern)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

fn render(template: &str, key: Option<&str>, subject: Option<&str>) -> String {
    let mut out = template.to_string();
    if let Some(key) = key {
        out = out.replace("{key}", &escape_glob(key));
    }
    if let Some(subject) = subject {
        out = out.replace("{subject}", &escape_glob(subject));
    }
    out
}

/// Ids are literal inside a pattern.
fn escape_glob(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '{' | '}' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub struct InvalidationPropagator {
    mirror: Arc<dyn MirrorStore>,
    tasks: Arc<BackgroundTasks>,
    sync_threshold: usize,
    timeout: Duration,
}

impl InvalidationPropagator {
    pub fn new(
        mirror: Arc<dyn MirrorStore>,
        tasks: Arc<BackgroundTasks>,
        sync_threshold: usize,
        timeout: Duration,
    ) -> Self {
        Self { mirror, tasks, sync_threshold, timeout }
    }

    /// Purge every pattern derived from `entities` and return the set.
    ///
    /// Small sets are purged before returning; larger ones are handed to the
    /// background runner. Purge failures are logged and never returned.
    pub async fn invalidate(&self, entities: &[Entity]) -> InvalidationSet {
        let set = InvalidationSet::for_entities(entities);
        if set.is_empty() {
            return set;
        }

        let patterns: Vec<String> = set.iter().map(String::from).collect();
        if set.len() <= self.sync_threshold {
            let _ = purge_within(self.mirror.as_ref(), &patterns, self.timeout).await;
            crate::metrics::record_invalidation("sync", set.len());
        } else {
            let mirror = self.mirror.clone();
            // Off the request path: each pattern gets the full budget.
            let budget = self.timeout.saturating_mul(u32::try_from(patterns.len()).unwrap_or(u32::MAX));
            debug!(patterns = set.len(), "Deferring invalidation to background");
            self.tasks.spawn("invalidation", async move {
                purge_within(mirror.as_ref(), &patterns, budget).await
            });
            crate::metrics::record_invalidation("deferred", set.len());
        }
        set
    }
}

/// Purge `patterns` in order, giving up on whatever is left once `budget` runs out.
async fn purge_within(mirror: &dyn MirrorStore, patterns: &[String], budget: Duration) -> Result<(), String> {
    match tokio::time::timeout(budget, purge(mirror, patterns)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                patterns = patterns.len(),
                budget_ms = budget.as_millis() as u64,
                "Invalidation purge timed out; stale views expire by TTL"
            );
            Err(format!("purge of {} patterns timed out", patterns.len()))
        }
    }
}

async fn purge(mirror: &dyn MirrorStore, patterns: &[String]) -> Result<(), String> {
    let mut failures = 0usize;
    let mut removed = 0u64;
    for pattern in patterns {
        match mirror.delete_pattern(pattern).await {
            Ok(n) => removed += n,
            Err(e) => {
                failures += 1;
                warn!(pattern = %pattern, error = %e, "Invalidation purge failed");
            }
        }
    }
    debug!(patterns = patterns.len(), removed, failures, "Invalidation purge finished");

    if failures == 0 {
        Ok(())
    } else {
        Err(format!("{} of {} patterns not purged", failures, patterns.len()))
    }
}
