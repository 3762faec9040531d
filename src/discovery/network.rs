//! mDNS service advertisement source
//!
//! Agent hosts advertise themselves as `<app>-<port>` under a DNS-SD service
//! type (`_http._tcp.local.` by default). This source listens for resolved
//! services for the length of the discovery window and keeps only those
//! whose instance name starts with the configured application name.

use super::{bounded, DiscoverySource, StopSignal};
use crate::config::DiscoveryConfig;
use crate::data::DiscoveredInstance;
use anyhow::Result;
use futures::future;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use once_cell::sync::OnceCell;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

/// A resolved service announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Full DNS-SD name, e.g. `opencode-4096._http._tcp.local.`
    pub fullname: String,
    pub hostname: String,
    pub port: u16,
}

impl Advertisement {
    /// Instance label: the part of the full name before the service type
    pub fn instance_name(&self) -> &str {
        self.fullname.split('.').next().unwrap_or_default()
    }
}

/// Listener for service advertisements on the local network
pub trait ServiceBrowser: Send + Sync {
    /// Start browsing `service_type`.
    ///
    /// The stream runs until `stop_browse` is called or the listener goes
    /// away.
    fn browse(&self, service_type: &str) -> Result<BoxStream<'static, Advertisement>>;

    fn stop_browse(&self, service_type: &str);
}

/// [`ServiceBrowser`] backed by an `mdns-sd` daemon, started on first use
#[derive(Default)]
pub struct MdnsBrowser {
    daemon: OnceCell<ServiceDaemon>,
}

impl MdnsBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    fn daemon(&self) -> Result<&ServiceDaemon> {
        self.daemon.get_or_try_init(|| {
            ServiceDaemon::new().map_err(|e| anyhow::anyhow!("Failed to start mDNS daemon: {e}"))
        })
    }
}

impl ServiceBrowser for MdnsBrowser {
    fn browse(&self, service_type: &str) -> Result<BoxStream<'static, Advertisement>> {
        let receiver = self
            .daemon()?
            .browse(service_type)
            .map_err(|e| anyhow::anyhow!("Failed to browse {service_type}: {e}"))?;

        let events = stream::unfold(receiver, |rx| async move {
            let event = rx.recv_async().await.ok()?;
            Some((event, rx))
        });

        let resolved = events
            .take_while(|event| future::ready(!matches!(event, ServiceEvent::SearchStopped(_))))
            .filter_map(|event| {
                future::ready(match event {
                    ServiceEvent::ServiceResolved(info) => Some(Advertisement {
                        fullname: info.get_fullname().to_string(),
                        hostname: info.get_hostname().to_string(),
                        port: info.get_port(),
                    }),
                    _ => None,
                })
            });

        Ok(resolved.boxed())
    }

    fn stop_browse(&self, service_type: &str) {
        if let Some(daemon) = self.daemon.get() {
            if let Err(e) = daemon.stop_browse(service_type) {
                tracing::debug!("Failed to stop mDNS browse for {}: {}", service_type, e);
            }
        }
    }
}

impl Drop for MdnsBrowser {
    fn drop(&mut self) {
        if let Some(daemon) = self.daemon.get() {
            let _ = daemon.shutdown();
        }
    }
}

/// Discovery source backed by service advertisements
pub struct NetworkSource {
    browser: Arc<dyn ServiceBrowser>,
    service_type: String,
    app_name: String,
    /// Browses currently open through this source
    open_browses: Arc<AtomicUsize>,
    stop: StopSignal,
}

impl NetworkSource {
    pub fn new(config: &DiscoveryConfig) -> Self {
        Self::with_browser(config, Arc::new(MdnsBrowser::new()))
    }

    pub fn with_browser(config: &DiscoveryConfig, browser: Arc<dyn ServiceBrowser>) -> Self {
        Self {
            browser,
            service_type: config.service_type.clone(),
            app_name: config.app_name.to_lowercase(),
            open_browses: Arc::new(AtomicUsize::new(0)),
            stop: StopSignal::new(),
        }
    }
}

impl DiscoverySource for NetworkSource {
    fn name(&self) -> &'static str {
        "network"
    }

    fn discover(&self, timeout: Duration) -> BoxStream<'static, DiscoveredInstance> {
        let browser = Arc::clone(&self.browser);
        let service_type = self.service_type.clone();
        let open_browses = Arc::clone(&self.open_browses);

        // The browse starts on first poll, together with the deadline
        let advertisements =
            stream::once(future::lazy(move |_| open_browse(browser, service_type, open_browses)))
                .flatten();

        let app_name = self.app_name.clone();
        let instances = advertisements.filter_map(move |ad| {
            let matches = ad.instance_name().to_lowercase().starts_with(&app_name);
            if !matches {
                tracing::trace!("Ignoring advertisement {}", ad.fullname);
            }
            future::ready(matches.then(|| DiscoveredInstance::from_network(ad.hostname, ad.port)))
        });

        bounded(instances.boxed(), timeout, &self.stop)
    }

    fn stop(&self) {
        self.stop.trigger();
    }
}

fn open_browse(
    browser: Arc<dyn ServiceBrowser>,
    service_type: String,
    open_browses: Arc<AtomicUsize>,
) -> BoxStream<'static, Advertisement> {
    match browser.browse(&service_type) {
        Ok(inner) => {
            open_browses.fetch_add(1, Ordering::SeqCst);
            Browsing {
                inner,
                browser,
                service_type,
                open_browses,
            }
            .boxed()
        }
        Err(e) => {
            tracing::warn!("mDNS discovery unavailable: {}", e);
            stream::empty().boxed()
        }
    }
}

/// Stream that silences the browse when the last open one is dropped.
///
/// `mdns-sd` keeps one listener per service type, so overlapping browses of
/// the same type share it and only the last to finish stops it.
struct Browsing {
    inner: BoxStream<'static, Advertisement>,
    browser: Arc<dyn ServiceBrowser>,
    service_type: String,
    open_browses: Arc<AtomicUsize>,
}

impl Stream for Browsing {
    type Item = Advertisement;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for Browsing {
    fn drop(&mut self) {
        if self.open_browses.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.browser.stop_browse(&self.service_type);
        }
    }
}
