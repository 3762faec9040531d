//! Deduplicating cache over a fixed set of discovery sources
//!
//! Discovery is expensive (mDNS has to wait out its listening window), so a
//! caller that re-discovers on every refresh gets everything found earlier
//! replayed instantly, followed by whatever the sources report that was not
//! seen before.

use super::merger::merge;
use super::DiscoverySource;
use crate::data::DiscoveredInstance;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct CacheState {
    /// Every instance emitted so far, in discovery order
    instances: Vec<DiscoveredInstance>,
    /// Process ids of `instances`
    seen_pids: HashSet<u32>,
}

impl CacheState {
    /// Record `instance` unless its pid is already known.
    ///
    /// Instances without a pid are always admitted.
    fn admit(&mut self, instance: &DiscoveredInstance) -> bool {
        if let Some(pid) = instance.pid() {
            if !self.seen_pids.insert(pid) {
                return false;
            }
        }
        self.instances.push(instance.clone());
        true
    }
}

/// Wraps discovery sources and remembers every instance they ever reported
pub struct DiscoveryCache {
    sources: Vec<Arc<dyn DiscoverySource>>,
    state: Arc<Mutex<CacheState>>,
}

impl DiscoveryCache {
    pub fn new(sources: Vec<Arc<dyn DiscoverySource>>) -> Self {
        Self {
            sources,
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    /// Discover instances.
    ///
    /// Cached instances come first, in their original order. Then every
    /// source runs with `timeout` and new instances are emitted as they
    /// arrive; one whose pid was already emitted is dropped.
    pub fn discover(&self, timeout: Duration) -> BoxStream<'static, DiscoveredInstance> {
        let replay = self.cached();
        tracing::debug!(
            "Replaying {} cached instances, querying {} sources",
            replay.len(),
            self.sources.len()
        );

        let live_sources = self.sources.iter().map(|source| source.discover(timeout));
        let state = Arc::clone(&self.state);
        let live = merge(live_sources).filter_map(move |instance| {
            let admitted = lock(&state).admit(&instance);
            if !admitted {
                tracing::trace!("Dropping already known instance {:?}", instance.identity());
            }
            future::ready(admitted.then_some(instance))
        });

        stream::iter(replay).chain(live).boxed()
    }

    /// Forward cancellation to every wrapped source
    pub fn stop(&self) {
        for source in &self.sources {
            source.stop();
        }
    }

    /// Snapshot of every instance emitted so far
    pub fn cached(&self) -> Vec<DiscoveredInstance> {
        lock(&self.state).instances.clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).instances.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).instances.is_empty()
    }
}

impl DiscoverySource for DiscoveryCache {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn discover(&self, timeout: Duration) -> BoxStream<'static, DiscoveredInstance> {
        DiscoveryCache::discover(self, timeout)
    }

    fn stop(&self) {
        DiscoveryCache::stop(self)
    }
}

fn lock(state: &Mutex<CacheState>) -> MutexGuard<'_, CacheState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("Discovery cache lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}
