//! Instance discovery
//!
//! Each mechanism that can find running agent hosts implements
//! [`DiscoverySource`]. Sources are raced against each other by the fan-in
//! merger and wrapped by a cache that remembers what was already found.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      DiscoveryCache                          │
//! │  ┌───────────────┐  ┌───────────────┐  ┌─────────────────┐   │
//! │  │ NetworkSource │  │ ProcessSource │  │ PortProbeSource │   │
//! │  └───────┬───────┘  └───────┬───────┘  └────────┬────────┘   │
//! │          └──────────────────┼───────────────────┘            │
//! │                       merge() (race)                         │
//! │                             │                                │
//! │              replay cached ─┴─ drop known pids               │
//! │                             │                                │
//! │              BoxStream<DiscoveredInstance>                   │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod merger;
pub mod network;
pub mod probe;
pub mod process;

pub use cache::DiscoveryCache;
pub use merger::{merge, Merge};
pub use network::NetworkSource;
pub use probe::PortProbeSource;
pub use process::ProcessSource;

use crate::config::DiscoveryConfig;
use crate::data::DiscoveredInstance;
use futures::stream::{BoxStream, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// A mechanism that can enumerate running instances.
///
/// `discover` returns a lazy stream that ends on its own or once `timeout`
/// has elapsed, whichever comes first. Failures inside a source end the
/// stream early; they are never reported to the caller.
pub trait DiscoverySource: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    fn discover(&self, timeout: Duration) -> BoxStream<'static, DiscoveredInstance>;

    /// Cancel every discovery currently in flight.
    ///
    /// Idempotent, and a no-op when nothing is running. Later calls to
    /// `discover` are not affected.
    fn stop(&self);
}

/// Broadcast used by sources to end their in-flight streams on `stop()`
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<u64>>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Resolves at the next `trigger()` after this call
    pub fn stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.tx.subscribe();
        async move {
            // An Err means every sender is gone, which also ends discovery
            let _ = rx.changed().await;
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// End `stream` once `timeout` elapses or `stop` fires.
///
/// The deadline starts counting on first poll. Whatever the inner stream
/// was waiting on is dropped, not awaited.
pub fn bounded(
    stream: BoxStream<'static, DiscoveredInstance>,
    timeout: Duration,
    stop: &StopSignal,
) -> BoxStream<'static, DiscoveredInstance> {
    let stopped = stop.stopped();
    let cutoff = async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {}
            _ = stopped => {}
        }
    };
    stream.take_until(cutoff).boxed()
}

/// Build the sources enabled in `config`
pub fn default_sources(config: &DiscoveryConfig) -> Vec<Arc<dyn DiscoverySource>> {
    let mut sources: Vec<Arc<dyn DiscoverySource>> = Vec::new();

    if config.network {
        sources.push(Arc::new(NetworkSource::new(config)));
    }
    if config.process {
        sources.push(Arc::new(ProcessSource::new(config)));
    }
    if !config.probe_ports.is_empty() {
        sources.push(Arc::new(PortProbeSource::new(config)));
    }

    tracing::debug!(
        "Discovery sources: {:?}",
        sources.iter().map(|s| s.name()).collect::<Vec<_>>()
    );

    sources
}
