//! Session status aggregation across instances
//!
//! Every discovered instance exposes a status endpoint returning a JSON
//! object keyed by session id:
//!
//! ```json
//! {
//!   "ses_1": { "type": "busy" },
//!   "ses_2": { "type": "retry", "attempt": 2, "message": "rate limited", "next": 1706745600000 }
//! }
//! ```
//!
//! The poller queries each instance once and flattens the maps into a single
//! stream of [`SessionStatus`]. An instance that cannot be queried simply
//! contributes nothing.

use crate::config::StatusConfig;
use crate::data::{DiscoveredInstance, RetryInfo, SessionState, SessionStatus, StateKind};
use anyhow::{Context, Result};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::Value;
use std::collections::HashSet;

/// Queries instance status endpoints
#[derive(Debug, Clone)]
pub struct StatusPoller {
    client: reqwest::Client,
    host: String,
    path: String,
    concurrency: usize,
}

impl StatusPoller {
    pub fn new(config: &StatusConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.request_timeout())
            // Instances are local; never route them through an env proxy
            .no_proxy()
            .build()
            .context("Failed to build status HTTP client")?;

        Ok(Self::with_client(config, client))
    }

    pub fn with_client(config: &StatusConfig, client: reqwest::Client) -> Self {
        Self {
            client,
            host: config.host.clone(),
            path: config.path.clone(),
            concurrency: config.concurrency.max(1),
        }
    }

    fn url(&self, port: u16) -> String {
        format!("http://{}:{}{}", self.host, port, self.path)
    }

    /// Fetch the session map of the instance listening on `port`
    pub async fn fetch(&self, port: u16) -> Result<Vec<SessionStatus>> {
        let url = self.url(port);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach {url}"))?;

        if !response.status().is_success() {
            anyhow::bail!("{} returned status {}", url, response.status());
        }

        let body: Value = response
            .json()
            .await
            .with_context(|| format!("Invalid status payload from {url}"))?;

        Ok(parse_status_map(port, &body))
    }

    /// Sessions of one instance; any failure means no sessions
    pub async fn query(&self, instance: &DiscoveredInstance) -> Vec<SessionStatus> {
        let Some(port) = instance.port() else {
            tracing::debug!("Skipping instance without a port: {:?}", instance.identity());
            return Vec::new();
        };

        match self.fetch(port).await {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::debug!("Status query failed for port {}: {:#}", port, e);
                Vec::new()
            }
        }
    }

    /// Query every instance of `instances` and flatten the results.
    ///
    /// The input is consumed in a single pass. Up to `concurrency` queries
    /// overlap, but results come out in input order. Dropping the returned
    /// stream stops all further work.
    pub fn poll_statuses<S>(&self, instances: S) -> BoxStream<'static, SessionStatus>
    where
        S: Stream<Item = DiscoveredInstance> + Send + 'static,
    {
        let poller = self.clone();
        let concurrency = self.concurrency;

        instances
            .map(move |instance| {
                let poller = poller.clone();
                async move { poller.query(&instance).await }
            })
            .buffered(concurrency)
            .flat_map(stream::iter)
            .boxed()
    }
}

/// Drop instances whose port was already seen earlier in `instances`.
///
/// Several sources, and repeated sightings replayed by the cache, can report
/// the same endpoint. Polling it once per port keeps each session from being
/// reported more than once. Instances without a port pass through.
pub fn distinct_ports<S>(instances: S) -> BoxStream<'static, DiscoveredInstance>
where
    S: Stream<Item = DiscoveredInstance> + Send + 'static,
{
    let mut seen = HashSet::new();
    instances
        .filter(move |instance| {
            let fresh = instance.port().map_or(true, |port| seen.insert(port));
            if !fresh {
                tracing::trace!("Already polling port {:?}", instance.port());
            }
            futures::future::ready(fresh)
        })
        .boxed()
}

/// Convert a status payload into records for the instance on `port`.
///
/// A payload that is not an object yields nothing. Entries without a
/// recognised `type` are skipped.
pub fn parse_status_map(port: u16, body: &Value) -> Vec<SessionStatus> {
    let Some(sessions) = body.as_object() else {
        return Vec::new();
    };

    sessions
        .iter()
        .filter_map(|(session_id, entry)| {
            let state = parse_state(entry)?;
            Some(SessionStatus {
                session_id: session_id.clone(),
                port,
                state,
            })
        })
        .collect()
}

fn parse_state(entry: &Value) -> Option<SessionState> {
    let kind = StateKind::from_tag(entry.as_object()?.get("type")?.as_str()?)?;

    Some(match kind {
        StateKind::Idle => SessionState::Idle,
        StateKind::Busy => SessionState::Busy,
        StateKind::Retry => SessionState::Retrying(RetryInfo {
            attempt: entry["attempt"].as_u64(),
            message: entry["message"].as_str().map(String::from),
            next_at_ms: entry["next"].as_i64(),
        }),
    })
}

/// Criteria for narrowing a status stream. Unset criteria match everything.
#[derive(Debug, Clone, Default)]
pub struct StatusFilter {
    pub state: Option<StateKind>,
    /// Substring the session id must contain
    pub session: Option<String>,
    /// Only retrying sessions at or beyond this attempt
    pub min_attempt: Option<u64>,
}

impl StatusFilter {
    pub fn matches(&self, status: &SessionStatus) -> bool {
        if let Some(state) = self.state {
            if status.kind() != state {
                return false;
            }
        }

        if let Some(session) = &self.session {
            if !status.session_id.contains(session.as_str()) {
                return false;
            }
        }

        if let Some(min) = self.min_attempt {
            match status.retry_attempt() {
                Some(attempt) if attempt >= min => {}
                _ => return false,
            }
        }

        true
    }

    /// Keep only the records of `statuses` that match
    pub fn apply<S>(self, statuses: S) -> BoxStream<'static, SessionStatus>
    where
        S: Stream<Item = SessionStatus> + Send + 'static,
    {
        statuses
            .filter(move |status| futures::future::ready(self.matches(status)))
            .boxed()
    }
}
