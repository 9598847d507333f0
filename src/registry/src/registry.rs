//! Name -> task handler metadata. Read-mostly after startup.

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// The result of a handler invocation, reported back to the pool slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HandlerOutcome {
    Success(serde_json::Value),
    Failure(String),
    /// Handler-initiated retry, carrying an optional explicit delay before
    /// the next attempt (`None` uses the registry entry's backoff policy).
    Retry(Option<Duration>),
}

/// A registered task handler: positional args, keyword args in, an
/// outcome out. Boxed so heterogeneous handlers can share one table.
pub type Handler =
    Arc<dyn Fn(Vec<serde_json::Value>, HashMap<String, serde_json::Value>) -> BoxFuture<'static, HandlerOutcome> + Send + Sync>;

/// A periodic schedule attached to a registry entry: either a fixed
/// interval or a cron-like predicate. Only the interval form is
/// implemented here; the predicate form is left to `foreman-beat` via the
/// `CronLike` variant's opaque expression string, evaluated there so the
/// registry itself stays free of a cron parser dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeriodicSchedule {
    Interval(Duration),
    CronLike(String),
}

/// Metadata describing one task handler, plus the handler itself.
#[derive(Clone)]
pub struct RegistryEntry {
    pub name: String,
    pub handler: Handler,
    pub rate_limit: Option<f64>,
    pub hard_time_limit: Option<Duration>,
    pub soft_time_limit: Option<Duration>,
    pub ignore_result: bool,
    pub store_errors_even_if_ignored: bool,
    pub periodic: Option<PeriodicSchedule>,
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("name", &self.name)
            .field("rate_limit", &self.rate_limit)
            .field("hard_time_limit", &self.hard_time_limit)
            .field("soft_time_limit", &self.soft_time_limit)
            .field("ignore_result", &self.ignore_result)
            .field("store_errors_even_if_ignored", &self.store_errors_even_if_ignored)
            .field("periodic", &self.periodic)
            .finish_non_exhaustive()
    }
}

impl RegistryEntry {
    pub fn new(name: impl Into<String>, handler: Handler) -> Self {
        Self {
            name: name.into(),
            handler,
            rate_limit: None,
            hard_time_limit: None,
            soft_time_limit: None,
            ignore_result: false,
            store_errors_even_if_ignored: false,
            periodic: None,
        }
    }

    /// Spec boundary behavior: hard limit < soft limit is a
    /// misconfiguration, caught at registration time.
    pub fn validate(&self) -> Result<(), String> {
        if let (Some(hard), Some(soft)) = (self.hard_time_limit, self.soft_time_limit) {
            if hard < soft {
                return Err(format!(
                    "task {}: hard time limit ({:?}) is less than soft time limit ({:?})",
                    self.name, hard, soft
                ));
            }
        }
        Ok(())
    }
}

/// Name -> [`RegistryEntry`] table, shared by the Listener, Router, and
/// Beat's startup seeding pass.
#[derive(Clone, Default)]
pub struct Registry {
    entries: Arc<RwLock<HashMap<String, RegistryEntry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task handler's metadata. Returns the misconfiguration
    /// error from [`RegistryEntry::validate`] without mutating the table.
    pub fn register(&self, entry: RegistryEntry) -> Result<(), String> {
        entry.validate()?;
        self.entries.write().insert(entry.name.clone(), entry);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<RegistryEntry> {
        self.entries.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// All entries carrying a periodic schedule, for Beat's startup seed.
    pub fn periodic_entries(&self) -> Vec<RegistryEntry> {
        self.entries
            .read()
            .values()
            .filter(|e| e.periodic.is_some())
            .cloned()
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn noop_handler() -> Handler {
        Arc::new(|_args, _kwargs| async { HandlerOutcome::Success(serde_json::Value::Null) }.boxed())
    }

    #[test]
    fn hard_less_than_soft_is_rejected() {
        let mut entry = RegistryEntry::new("slow", noop_handler());
        entry.hard_time_limit = Some(Duration::from_secs(1));
        entry.soft_time_limit = Some(Duration::from_secs(5));
        let registry = Registry::new();
        assert!(registry.register(entry).is_err());
        assert!(!registry.contains("slow"));
    }

    #[test]
    fn unknown_task_lookup_returns_none() {
        let registry = Registry::new();
        assert!(registry.get("ghost").is_none());
    }

    #[test]
    fn periodic_entries_are_filtered() {
        let registry = Registry::new();
        registry.register(RegistryEntry::new("plain", noop_handler())).unwrap();
        let mut periodic = RegistryEntry::new("tick", noop_handler());
        periodic.periodic = Some(PeriodicSchedule::Interval(Duration::from_secs(1)));
        registry.register(periodic).unwrap();

        let seeded = registry.periodic_entries();
        assert_eq!(seeded.len(), 1);
        assert_eq!(seeded[0].name, "tick");
    }
}
