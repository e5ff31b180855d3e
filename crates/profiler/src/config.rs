//! Server configuration

use anyhow::{anyhow, bail, Context, Result};
use profiler_lib::capture::{CaptureConfig, CaptureGroup, CronSchedule};
use profiler_lib::discovery::{DiscoveryStrategy, DEFAULT_PROBE_TIMEOUT};
use profiler_lib::session::PprofCommand;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration, read from `PPROF_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen port; session ports are allocated above it
    #[serde(default = "default_port")]
    pub port: u16,

    /// Cron expression for scheduled captures
    #[serde(default)]
    pub cron: Option<String>,

    /// Capture groups, `{namespace}:{prefix}` separated by commas
    #[serde(default)]
    pub keywords: Option<String>,

    /// Root directory for persisted artifacts
    #[serde(default = "default_dest")]
    pub dest: PathBuf,

    /// Namespaces listed first, separated by commas
    #[serde(default)]
    pub vips: Option<String>,

    /// Explicit kubeconfig; in-cluster or local config is inferred otherwise
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,

    #[serde(default)]
    pub discovery_strategy: DiscoveryStrategy,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Visualizer command line
    #[serde(default = "default_pprof_program")]
    pub pprof_program: String,
}

fn default_port() -> u16 {
    6061
}

fn default_dest() -> PathBuf {
    PathBuf::from("/pprof")
}

fn default_probe_timeout_ms() -> u64 {
    DEFAULT_PROBE_TIMEOUT.as_millis() as u64
}

fn default_pprof_program() -> String {
    "go tool pprof".to_string()
}

impl ServerConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("PPROF"))
            .build()?;
        Self::from_config(config)
    }

    /// Deserialize and validate an already assembled configuration
    pub fn from_config(config: config::Config) -> Result<Self> {
        let server: Self = config
            .try_deserialize()
            .context("invalid server configuration")?;
        server.session_base_port()?;
        server.pprof_command()?;
        server.capture_config()?;
        Ok(server)
    }

    /// Seed for the session port counter; the first session gets `port + 2`
    pub fn session_base_port(&self) -> Result<u16> {
        self.port
            .checked_add(1)
            .ok_or_else(|| anyhow!("port {} leaves no room for sessions", self.port))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn pprof_command(&self) -> Result<PprofCommand> {
        PprofCommand::parse(&self.pprof_program)
            .ok_or_else(|| anyhow!("pprof program must not be empty"))
    }

    pub fn priority_namespaces(&self) -> Vec<String> {
        split_list(self.vips.as_deref())
    }

    /// Scheduled capture settings; `None` unless both cron and keywords are set
    pub fn capture_config(&self) -> Result<Option<CaptureConfig>> {
        let cron = self.cron.as_deref().map(str::trim).filter(|c| !c.is_empty());
        let keywords = self
            .keywords
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty());
        let (Some(cron), Some(keywords)) = (cron, keywords) else {
            return Ok(None);
        };

        let schedule = CronSchedule::parse(cron)?;
        let groups = CaptureGroup::parse_list(keywords)?;
        if groups.is_empty() {
            bail!("no capture groups in '{keywords}'");
        }
        Ok(Some(CaptureConfig::new(schedule, groups, self.dest.clone())))
    }
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}
