//! Port-probe discovery source
//!
//! Connects to a configured list of ports and reports every one that
//! accepts a TCP connection.

use super::{bounded, DiscoverySource, StopSignal};
use crate::config::DiscoveryConfig;
use crate::data::DiscoveredInstance;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;

/// Probes kept in flight at once
const PROBE_CONCURRENCY: usize = 16;

pub struct PortProbeSource {
    host: String,
    ports: Vec<u16>,
    connect_timeout: Duration,
    stop: StopSignal,
}

impl PortProbeSource {
    pub fn new(config: &DiscoveryConfig) -> Self {
        Self {
            host: config.probe_host.clone(),
            ports: config.probe_ports.clone(),
            connect_timeout: config.probe_connect_timeout(),
            stop: StopSignal::new(),
        }
    }
}

impl DiscoverySource for PortProbeSource {
    fn name(&self) -> &'static str {
        "port-probe"
    }

    fn discover(&self, timeout: Duration) -> BoxStream<'static, DiscoveredInstance> {
        let host = self.host.clone();
        let connect_timeout = self.connect_timeout;

        let probes = stream::iter(self.ports.clone())
            .map(move |port| {
                let host = host.clone();
                async move {
                    probe(&host, port, connect_timeout)
                        .await
                        .then(|| DiscoveredInstance::from_probe(host, port))
                }
            })
            .buffer_unordered(PROBE_CONCURRENCY)
            .filter_map(future::ready);

        bounded(probes.boxed(), timeout, &self.stop)
    }

    fn stop(&self) {
        self.stop.trigger();
    }
}

/// Whether `host:port` accepts a connection within `connect_timeout`
async fn probe(host: &str, port: u16, connect_timeout: Duration) -> bool {
    match tokio::time::timeout(connect_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            tracing::trace!("Probe {}:{} refused: {}", host, port, e);
            false
        }
        Err(_) => {
            tracing::trace!("Probe {}:{} timed out", host, port);
            false
        }
    }
}
