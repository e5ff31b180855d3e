//! Core data models for the profiling server

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Well-known path served by Go's `net/http/pprof` handlers
pub const DIAGNOSTIC_PATH: &str = "/debug/pprof";

/// A discovered profiling endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    /// `{instance}:{port}`, stable and human-identifying
    pub name: String,
    /// Directly dialable `ip:port`
    pub address: String,
    /// Time since the workload instance started
    pub age: Duration,
}

/// Lifecycle phase of a workload instance as reported by the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstancePhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl InstancePhase {
    pub fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => Self::Pending,
            Some("Running") => Self::Running,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// Transport protocol of a declared container port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortProtocol {
    Tcp,
    Udp,
    Sctp,
}

impl PortProtocol {
    /// Kubernetes defaults an unset protocol to TCP
    pub fn parse(protocol: Option<&str>) -> Option<Self> {
        match protocol {
            None | Some("TCP") => Some(Self::Tcp),
            Some("UDP") => Some(Self::Udp),
            Some("SCTP") => Some(Self::Sctp),
            Some(_) => None,
        }
    }
}

/// A port declared by one of the instance's containers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredPort {
    pub name: Option<String>,
    pub port: u16,
    pub protocol: PortProtocol,
}

/// Workload instance (pod) as seen by the cluster API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadInstance {
    pub name: String,
    pub phase: InstancePhase,
    pub pod_ip: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    /// Ports flattened across all containers
    pub ports: Vec<DeclaredPort>,
}

impl WorkloadInstance {
    /// Time elapsed since the instance started, zero if unknown
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        self.started_at
            .and_then(|started| (now - started).to_std().ok())
            .unwrap_or_default()
    }
}

/// Profile kinds exposed under the diagnostic path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    Allocs,
    Block,
    Cmdline,
    Goroutine,
    Heap,
    Mutex,
    Profile,
    ThreadCreate,
    Trace,
}

impl ProfileKind {
    /// Every kind captured by the scheduler, in capture order
    pub const ALL: [ProfileKind; 9] = [
        ProfileKind::Allocs,
        ProfileKind::Block,
        ProfileKind::Cmdline,
        ProfileKind::Goroutine,
        ProfileKind::Heap,
        ProfileKind::Mutex,
        ProfileKind::Profile,
        ProfileKind::ThreadCreate,
        ProfileKind::Trace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileKind::Allocs => "allocs",
            ProfileKind::Block => "block",
            ProfileKind::Cmdline => "cmdline",
            ProfileKind::Goroutine => "goroutine",
            ProfileKind::Heap => "heap",
            ProfileKind::Mutex => "mutex",
            ProfileKind::Profile => "profile",
            ProfileKind::ThreadCreate => "threadcreate",
            ProfileKind::Trace => "trace",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a visualization or capture subprocess reads from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileSource {
    /// A live endpoint, sampled for `seconds`
    Live {
        address: String,
        kind: ProfileKind,
        seconds: u32,
    },
    /// A previously persisted artifact
    Artifact(PathBuf),
}

impl ProfileSource {
    pub fn live(address: impl Into<String>, kind: ProfileKind, seconds: u32) -> Self {
        Self::Live {
            address: address.into(),
            kind,
            seconds,
        }
    }

    /// Argument handed to the pprof tool
    pub fn to_arg(&self) -> String {
        match self {
            ProfileSource::Live {
                address,
                kind,
                seconds,
            } => format!("{address}{DIAGNOSTIC_PATH}/{kind}?seconds={seconds}"),
            ProfileSource::Artifact(path) => path.display().to_string(),
        }
    }
}

impl fmt::Display for ProfileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_arg())
    }
}
