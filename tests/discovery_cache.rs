//! Tests for the deduplicating discovery cache
//!
//! The cache replays everything found earlier, then reports only instances
//! whose process id has not been seen before.

mod test_utils;

use futures::stream::StreamExt;
use hostscope::data::DiscoveredInstance;
use hostscope::discovery::{DiscoveryCache, DiscoverySource};
use std::sync::Arc;
use std::time::Duration;
use test_utils::{network, process, ScriptedSource};

const TIMEOUT: Duration = Duration::from_secs(5);

fn cache_over(sources: &[&Arc<ScriptedSource>]) -> DiscoveryCache {
    DiscoveryCache::new(
        sources
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn DiscoverySource>)
            .collect(),
    )
}

async fn discover(cache: &DiscoveryCache) -> Vec<DiscoveredInstance> {
    cache.discover(TIMEOUT).collect().await
}

mod replay {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn second_call_replays_first_call() {
        let s1 = Arc::new(ScriptedSource::new("network", vec![(50, network(4096))]));
        let s2 = Arc::new(ScriptedSource::new("process", vec![(0, process(10, 4096))]));
        let cache = cache_over(&[&s1, &s2]);

        let first = discover(&cache).await;
        assert_eq!(first, vec![process(10, 4096), network(4096)]);

        s1.set_script(vec![]);
        s2.set_script(vec![]);
        let second = discover(&cache).await;

        assert_eq!(second, first);
        assert_eq!(s1.discover_count(), 2);
        assert_eq!(s2.discover_count(), 2);
    }

    #[tokio::test]
    async fn replayed_instances_come_before_live_ones() {
        let source = Arc::new(ScriptedSource::new("process", vec![(0, process(1, 4096))]));
        let cache = cache_over(&[&source]);
        discover(&cache).await;

        source.set_script(vec![(0, process(2, 4097))]);
        let second = discover(&cache).await;

        assert_eq!(second, vec![process(1, 4096), process(2, 4097)]);
        assert_eq!(cache.cached(), second);
    }

    #[tokio::test]
    async fn replay_is_available_before_sources_report() {
        let source = Arc::new(ScriptedSource::new("process", vec![(0, process(1, 4096))]));
        let cache = cache_over(&[&source]);
        discover(&cache).await;

        source.set_script(vec![(10_000, process(2, 4097))]);
        let mut stream = cache.discover(TIMEOUT);
        let first = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;

        assert_eq!(first, Ok(Some(process(1, 4096))));
    }
}

mod dedup {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn same_pid_from_two_sources_emitted_once() {
        let a = Arc::new(ScriptedSource::new("a", vec![(0, process(10, 4096))]));
        let b = Arc::new(ScriptedSource::new(
            "b",
            vec![(10, DiscoveredInstance::from_process(10, None, Some("/w".to_string())))],
        ));
        let cache = cache_over(&[&a, &b]);

        let found = discover(&cache).await;

        assert_eq!(found, vec![process(10, 4096)]);
    }

    #[tokio::test]
    async fn repeated_discovery_is_idempotent() {
        let a = Arc::new(ScriptedSource::new(
            "a",
            vec![(0, process(10, 4096)), (5, process(11, 4097))],
        ));
        let b = Arc::new(ScriptedSource::new("b", vec![(3, process(12, 4098))]));
        let cache = cache_over(&[&a, &b]);

        let first = discover(&cache).await;
        assert_eq!(first.len(), 3);

        let second = discover(&cache).await;

        // Replay reproduces the first call; the live phase adds nothing
        assert_eq!(second, first);
        assert_eq!(cache.len(), 3);
    }

    #[tokio::test]
    async fn instances_without_pid_are_never_deduplicated() {
        let a = Arc::new(ScriptedSource::new("a", vec![(0, network(4096))]));
        let b = Arc::new(ScriptedSource::new("b", vec![(5, network(4096))]));
        let cache = cache_over(&[&a, &b]);

        let first = discover(&cache).await;
        assert_eq!(first, vec![network(4096), network(4096)]);

        b.set_script(vec![]);
        let second = discover(&cache).await;

        // Two replayed plus one fresh sighting from `a`
        assert_eq!(second.len(), 3);
        assert_eq!(cache.len(), 3);
    }
}

mod cancellation {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn stop_reaches_every_source() {
        let a = Arc::new(ScriptedSource::hanging("a", vec![(0, process(1, 1))]));
        let b = Arc::new(ScriptedSource::hanging("b", vec![]));
        let cache = Arc::new(cache_over(&[&a, &b]));

        let stopper = Arc::clone(&cache);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.stop();
        });

        let found = tokio::time::timeout(
            Duration::from_secs(5),
            cache.discover(Duration::from_secs(60)).collect::<Vec<_>>(),
        )
        .await
        .expect("stop should end discovery");

        assert_eq!(found, vec![process(1, 1)]);
        assert_eq!(a.stop_count(), 1);
        assert_eq!(b.stop_count(), 1);
    }

    #[tokio::test]
    async fn stop_when_idle_is_harmless() {
        let a = Arc::new(ScriptedSource::new("a", vec![(0, process(1, 1))]));
        let cache = cache_over(&[&a]);

        cache.stop();
        cache.stop();

        assert_eq!(discover(&cache).await, vec![process(1, 1)]);
    }

    #[tokio::test]
    async fn caches_compose_as_sources() {
        let a = Arc::new(ScriptedSource::new("a", vec![(0, process(1, 1))]));
        let inner: Arc<dyn DiscoverySource> = Arc::new(cache_over(&[&a]));
        let outer = DiscoveryCache::new(vec![inner]);

        assert_eq!(discover(&outer).await, vec![process(1, 1)]);
        // The inner cache replays pid 1 again; the outer one drops it
        assert_eq!(discover(&outer).await, vec![process(1, 1)]);
    }
}
