use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which discovery mechanism reported an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    Network,
    Process,
    PortProbe,
}

impl Origin {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Process => "process",
            Self::PortProbe => "port-probe",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.label())
    }
}

/// Stable key distinguishing one running instance from another.
///
/// A process id wins when known; otherwise the instance is keyed by the
/// endpoint it was reached on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InstanceIdentity {
    Process(u32),
    Endpoint { host: String, port: Option<u16> },
}

/// One running agent host, as reported by a single discovery source.
///
/// Fields are private so a record cannot change after a source emits it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredInstance {
    port: Option<u16>,
    hostname: Option<String>,
    pid: Option<u32>,
    working_directory: Option<String>,
    origin: Origin,
}

impl DiscoveredInstance {
    /// Instance found through a service advertisement
    pub fn from_network(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            port: Some(port),
            hostname: Some(hostname.into()),
            pid: None,
            working_directory: None,
            origin: Origin::Network,
        }
    }

    /// Instance found in the process table
    pub fn from_process(pid: u32, port: Option<u16>, working_directory: Option<String>) -> Self {
        Self {
            port,
            hostname: None,
            pid: Some(pid),
            working_directory,
            origin: Origin::Process,
        }
    }

    /// Instance found by connecting to a port
    pub fn from_probe(host: impl Into<String>, port: u16) -> Self {
        Self {
            port: Some(port),
            hostname: Some(host.into()),
            pid: None,
            working_directory: None,
            origin: Origin::PortProbe,
        }
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn working_directory(&self) -> Option<&str> {
        self.working_directory.as_deref()
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn identity(&self) -> InstanceIdentity {
        match self.pid {
            Some(pid) => InstanceIdentity::Process(pid),
            None => InstanceIdentity::Endpoint {
                host: self
                    .hostname
                    .clone()
                    .unwrap_or_else(|| "localhost".to_string()),
                port: self.port,
            },
        }
    }
}

impl fmt::Display for DiscoveredInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let port = self
            .port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let pid = self
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "{:<10} port={:<6} pid={:<8} host={} cwd={}",
            self.origin,
            port,
            pid,
            self.hostname.as_deref().unwrap_or("-"),
            self.working_directory.as_deref().unwrap_or("-"),
        )
    }
}

/// Coarse session state, used for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    Idle,
    Busy,
    Retry,
}

impl StateKind {
    /// Parse the `type` tag of a status entry
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "idle" => Some(Self::Idle),
            "busy" => Some(Self::Busy),
            "retry" => Some(Self::Retry),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Retry => "retry",
        }
    }
}

impl std::str::FromStr for StateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_tag(&s.to_lowercase())
            .ok_or_else(|| format!("unknown state '{s}' (expected idle, busy or retry)"))
    }
}

/// Details attached to a session that is waiting to retry a request.
///
/// Every field is optional, even inside a retry record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryInfo {
    pub attempt: Option<u64>,
    pub message: Option<String>,
    /// Next attempt, epoch milliseconds as reported by the instance
    pub next_at_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Busy,
    #[serde(rename = "retry")]
    Retrying(RetryInfo),
}

/// Activity of one session inside one instance, at poll time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub port: u16,
    #[serde(flatten)]
    pub state: SessionState,
}

impl SessionStatus {
    pub fn kind(&self) -> StateKind {
        match self.state {
            SessionState::Idle => StateKind::Idle,
            SessionState::Busy => StateKind::Busy,
            SessionState::Retrying(_) => StateKind::Retry,
        }
    }

    fn retry(&self) -> Option<&RetryInfo> {
        match &self.state {
            SessionState::Retrying(info) => Some(info),
            _ => None,
        }
    }

    pub fn retry_attempt(&self) -> Option<u64> {
        self.retry().and_then(|r| r.attempt)
    }

    pub fn retry_message(&self) -> Option<&str> {
        self.retry().and_then(|r| r.message.as_deref())
    }

    pub fn retry_next_at(&self) -> Option<DateTime<Utc>> {
        self.retry()
            .and_then(|r| r.next_at_ms)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<6} {:<6} {}", self.port, self.kind().label(), self.session_id)?;
        if let SessionState::Retrying(info) = &self.state {
            if let Some(attempt) = info.attempt {
                write!(f, " attempt={attempt}")?;
            }
            if let Some(next) = self.retry_next_at() {
                write!(f, " next={}", next.to_rfc3339())?;
            }
            if let Some(message) = &info.message {
                write!(f, " \"{message}\"")?;
            }
        }
        Ok(())
    }
}
