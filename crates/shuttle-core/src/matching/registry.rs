//! Poller registry: who has polled this partition recently.
//!
//! Entries are refreshed on every poll attempt, including ones that end without a
//! task. There is no background sweep; stale entries are purged whenever the
//! registry is read, so reads never report an expired poller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::domain::{PollMetadata, PollerIdentity, PollerInfo};
use crate::ports::Clock;

#[derive(Debug, Clone)]
struct PollerRecord {
    last_access: DateTime<Utc>,
    capacity: Option<u32>,
    build_id: Option<String>,
}

#[derive(Default)]
struct RegistryState {
    pollers: HashMap<PollerIdentity, PollerRecord>,
    /// Last activity of the partition itself (tasks count as activity too).
    last_alive: Option<DateTime<Utc>>,
}

pub struct PollerRegistry {
    state: Mutex<RegistryState>,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl PollerRegistry {
    pub fn new(ttl: std::time::Duration, clock: Arc<dyn Clock>) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            state: Mutex::new(RegistryState::default()),
            ttl,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn purge(&self, state: &mut RegistryState, now: DateTime<Utc>) {
        if let Some(horizon) = now.checked_sub_signed(self.ttl) {
            state.pollers.retain(|_, r| r.last_access > horizon);
        }
    }

    /// Record (or refresh) the poller behind `meta`.
    pub fn update(&self, meta: &PollMetadata) {
        let now = self.clock.now();
        let mut state = self.lock();
        let record = state
            .pollers
            .entry(meta.identity.clone())
            .or_insert_with(|| PollerRecord {
                last_access: now,
                capacity: None,
                build_id: None,
            });
        record.last_access = now;
        // Keep the last reported hints if this poll didn't carry any.
        if meta.capacity.is_some() {
            record.capacity = meta.capacity;
        }
        if meta.build_id.is_some() {
            record.build_id = meta.build_id.clone();
        }
        state.last_alive = Some(now);
    }

    /// Live pollers, most recently seen first.
    pub fn all(&self) -> Vec<PollerInfo> {
        let now = self.clock.now();
        let mut state = self.lock();
        self.purge(&mut state, now);
        let mut pollers: Vec<PollerInfo> = state
            .pollers
            .iter()
            .map(|(identity, r)| PollerInfo {
                identity: identity.clone(),
                last_access_time: r.last_access,
                capacity: r.capacity,
                build_id: r.build_id.clone(),
            })
            .collect();
        pollers.sort_by(|a, b| {
            b.last_access_time
                .cmp(&a.last_access_time)
                .then_with(|| a.identity.cmp(&b.identity))
        });
        pollers
    }

    /// Number of live pollers.
    pub fn occupancy(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.lock();
        self.purge(&mut state, now);
        state.pollers.len()
    }

    /// Has any live poller accessed the partition strictly after `t`?
    pub fn has_poller_after(&self, t: DateTime<Utc>) -> bool {
        let now = self.clock.now();
        let mut state = self.lock();
        self.purge(&mut state, now);
        state.pollers.values().any(|r| r.last_access > t)
    }

    /// Refresh the partition's own activity marker.
    pub fn mark_alive(&self) {
        let now = self.clock.now();
        self.lock().last_alive = Some(now);
    }

    pub fn last_alive(&self) -> Option<DateTime<Utc>> {
        self.lock().last_alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use chrono::{Duration, TimeZone};

    fn setup() -> (Arc<FixedClock>, PollerRegistry) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let registry = PollerRegistry::new(std::time::Duration::from_secs(60), clock.clone());
        (clock, registry)
    }

    fn meta(name: &str) -> PollMetadata {
        PollMetadata::new(PollerIdentity::new(name))
    }

    #[test]
    fn update_refreshes_and_keeps_hints() {
        let (clock, registry) = setup();
        registry.update(&meta("w1").with_capacity(4).with_build_id("b1"));
        clock.advance(Duration::seconds(10));
        registry.update(&meta("w1"));

        let all = registry.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].capacity, Some(4));
        assert_eq!(all[0].build_id.as_deref(), Some("b1"));
        assert_eq!(all[0].last_access_time, clock.now());
    }

    #[test]
    fn stale_entries_are_never_returned() {
        let (clock, registry) = setup();
        registry.update(&meta("old"));
        clock.advance(Duration::seconds(45));
        registry.update(&meta("new"));
        clock.advance(Duration::seconds(30));

        let names: Vec<_> = registry
            .all()
            .into_iter()
            .map(|p| p.identity.as_str().to_string())
            .collect();
        assert_eq!(names, vec!["new".to_string()]);
        assert_eq!(registry.occupancy(), 1);
    }

    #[test]
    fn has_poller_after_threshold() {
        let (clock, registry) = setup();
        let t0 = clock.now();
        assert!(!registry.has_poller_after(t0));
        clock.advance(Duration::seconds(1));
        registry.update(&meta("w"));
        assert!(registry.has_poller_after(t0));
        assert!(!registry.has_poller_after(clock.now()));
    }

    #[test]
    fn mark_alive_is_independent_of_pollers() {
        let (clock, registry) = setup();
        assert_eq!(registry.last_alive(), None);
        registry.mark_alive();
        assert_eq!(registry.last_alive(), Some(clock.now()));
        assert_eq!(registry.occupancy(), 0);
    }
}
