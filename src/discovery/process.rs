//! Process-table discovery source
//!
//! Looks for processes running the target application and reads the port
//! from a `--port <n>` / `--port=<n>` argument when one is present.

use super::{bounded, DiscoverySource, StopSignal};
use crate::config::DiscoveryConfig;
use crate::data::DiscoveredInstance;
use anyhow::Result;
use futures::stream::{self, BoxStream, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{ProcessRefreshKind, System, UpdateKind};

static PORT_ARG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s)--port(?:=|\s+)(\S+)").expect("valid port regex"));

/// One row of the process table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub cmd: Vec<String>,
    pub cwd: Option<String>,
}

/// Read access to the operating system's process table
pub trait ProcessTable: Send + Sync {
    fn snapshot(&self) -> Result<Vec<ProcessEntry>>;
}

/// [`ProcessTable`] backed by `sysinfo`
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoTable;

impl ProcessTable for SysinfoTable {
    fn snapshot(&self) -> Result<Vec<ProcessEntry>> {
        let mut sys = System::new();
        sys.refresh_processes_specifics(
            ProcessRefreshKind::new()
                .with_cmd(UpdateKind::Always)
                .with_cwd(UpdateKind::Always),
        );

        let entries = sys
            .processes()
            .iter()
            .map(|(pid, process)| ProcessEntry {
                pid: pid.as_u32(),
                name: process.name().to_string(),
                cmd: process.cmd().to_vec(),
                cwd: process.cwd().map(|p| p.to_string_lossy().to_string()),
            })
            .collect();

        Ok(entries)
    }
}

/// Discovery source backed by the process table
pub struct ProcessSource {
    table: Arc<dyn ProcessTable>,
    app_name: String,
    stop: StopSignal,
}

impl ProcessSource {
    pub fn new(config: &DiscoveryConfig) -> Self {
        Self::with_table(config, Arc::new(SysinfoTable))
    }

    pub fn with_table(config: &DiscoveryConfig, table: Arc<dyn ProcessTable>) -> Self {
        Self {
            table,
            app_name: config.app_name.to_lowercase(),
            stop: StopSignal::new(),
        }
    }
}

impl DiscoverySource for ProcessSource {
    fn name(&self) -> &'static str {
        "process"
    }

    fn discover(&self, timeout: Duration) -> BoxStream<'static, DiscoveredInstance> {
        let table = Arc::clone(&self.table);
        let app_name = self.app_name.clone();

        let scan = async move {
            let own_pid = std::process::id();
            match tokio::task::spawn_blocking(move || table.snapshot()).await {
                Ok(Ok(entries)) => find_instances(&entries, &app_name, own_pid),
                Ok(Err(e)) => {
                    tracing::debug!("Process table unavailable: {}", e);
                    Vec::new()
                }
                Err(e) => {
                    tracing::warn!("Process scan task failed: {}", e);
                    Vec::new()
                }
            }
        };

        let instances = stream::once(scan).flat_map(stream::iter).boxed();
        bounded(instances, timeout, &self.stop)
    }

    fn stop(&self) {
        self.stop.trigger();
    }
}

/// Turn matching process entries into instances, skipping `own_pid`
pub fn find_instances(
    entries: &[ProcessEntry],
    app_name: &str,
    own_pid: u32,
) -> Vec<DiscoveredInstance> {
    entries
        .iter()
        .filter(|entry| entry.pid != own_pid && is_target(entry, app_name))
        .map(|entry| {
            DiscoveredInstance::from_process(entry.pid, parse_port(&entry.cmd), entry.cwd.clone())
        })
        .collect()
}

/// Whether the process runs `app_name`, directly or through an interpreter
fn is_target(entry: &ProcessEntry, app_name: &str) -> bool {
    if entry.name.to_lowercase().starts_with(app_name) {
        return true;
    }

    // Interpreted launches (node, bun) carry the app as a script argument
    entry.cmd.iter().take(2).any(|arg| {
        Path::new(arg)
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.to_lowercase().starts_with(app_name))
    })
}

/// Extract the value of `--port` from a command line
pub fn parse_port(cmd: &[String]) -> Option<u16> {
    let joined = cmd.join(" ");
    let value = PORT_ARG.captures(&joined)?.get(1)?.as_str();
    value.parse().ok()
}
