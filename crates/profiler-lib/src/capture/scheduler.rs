//! Periodic snapshot capture
//!
//! On every cron firing, picks the oldest matching host per configured
//! group, captures each profile kind from it, then sweeps expired
//! artifacts. Runs sequentially; a failing group or kind never stops the
//! others.

use super::CronSchedule;
use crate::artifacts::{artifact_prefix, sweep_expired, DEFAULT_RETENTION};
use crate::discovery::HostRegistry;
use crate::models::{Host, ProfileKind, ProfileSource};
use crate::observability::{ProfilerMetrics, StructuredLogger};
use crate::session::SessionManager;
use anyhow::{bail, Result};
use chrono::Local;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Sampling duration embedded in every capture source
pub const DEFAULT_SAMPLE_SECONDS: u32 = 5;

/// A namespace and the host name prefix to capture from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureGroup {
    pub namespace: String,
    pub prefix: String,
}

impl CaptureGroup {
    /// Parse `namespace:prefix` entries separated by commas
    pub fn parse_list(raw: &str) -> Result<Vec<Self>> {
        let mut groups = Vec::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let parts: Vec<&str> = entry.split(':').collect();
            match parts.as_slice() {
                [namespace, prefix] if !namespace.is_empty() => groups.push(Self {
                    namespace: namespace.to_string(),
                    prefix: prefix.to_string(),
                }),
                _ => bail!("invalid capture group '{entry}', expected namespace:prefix"),
            }
        }
        Ok(groups)
    }
}

/// Configuration for the capture scheduler
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub schedule: CronSchedule,
    pub groups: Vec<CaptureGroup>,
    /// Root of the `{kind}/{host}-{timestamp}.pb.gz` tree
    pub dest_root: PathBuf,
    pub sample_seconds: u32,
    pub retention: Duration,
}

impl CaptureConfig {
    pub fn new(schedule: CronSchedule, groups: Vec<CaptureGroup>, dest_root: impl Into<PathBuf>) -> Self {
        Self {
            schedule,
            groups,
            dest_root: dest_root.into(),
            sample_seconds: DEFAULT_SAMPLE_SECONDS,
            retention: DEFAULT_RETENTION,
        }
    }
}

/// Outcome of one capture cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureReport {
    pub groups_captured: usize,
    pub groups_skipped: usize,
    pub artifacts_written: usize,
    pub captures_failed: usize,
    pub artifacts_deleted: usize,
}

/// Select the host with the strictly greatest age among those matching
/// `prefix`; on a tie the first one seen wins
pub fn select_target<'a>(hosts: &'a [Host], prefix: &str) -> Option<&'a Host> {
    hosts
        .iter()
        .filter(|host| host.name.starts_with(prefix))
        .fold(None, |oldest: Option<&Host>, host| match oldest {
            Some(oldest) if host.age <= oldest.age => Some(oldest),
            _ => Some(host),
        })
}

/// Drives periodic captures through the registry and session manager
pub struct CaptureScheduler {
    registry: Arc<HostRegistry>,
    sessions: Arc<SessionManager>,
    config: CaptureConfig,
    metrics: ProfilerMetrics,
    logger: StructuredLogger,
}

impl CaptureScheduler {
    pub fn new(
        registry: Arc<HostRegistry>,
        sessions: Arc<SessionManager>,
        config: CaptureConfig,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            registry,
            sessions,
            config,
            metrics: ProfilerMetrics::new(),
            logger,
        }
    }

    /// Run until a shutdown signal arrives
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            schedule = %self.config.schedule.as_str(),
            groups = self.config.groups.len(),
            dest = %self.config.dest_root.display(),
            "Starting capture scheduler"
        );

        loop {
            let now = Local::now();
            let next = match self.config.schedule.next_after(now) {
                Ok(next) => next,
                Err(e) => {
                    error!(error = %e, "Capture schedule has no next run, stopping scheduler");
                    return;
                }
            };
            let wait = (next - now).to_std().unwrap_or_default();
            debug!(next = %next, "Next capture cycle scheduled");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    self.run_once().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down capture scheduler");
                    break;
                }
            }
        }
    }

    /// One full cycle: every group, then the retention sweep
    pub async fn run_once(&self) -> CaptureReport {
        let mut report = CaptureReport::default();

        for group in &self.config.groups {
            match self.capture_group(group).await {
                Some((written, failed)) => {
                    report.groups_captured += 1;
                    report.artifacts_written += written;
                    report.captures_failed += failed;
                }
                None => report.groups_skipped += 1,
            }
        }

        report.artifacts_deleted =
            sweep_expired(&self.config.dest_root, self.config.retention, SystemTime::now()).await;
        self.metrics
            .add_artifacts_deleted(report.artifacts_deleted as u64);

        self.logger.log_capture_cycle(
            report.groups_captured,
            report.groups_skipped,
            report.artifacts_written,
            report.captures_failed,
            report.artifacts_deleted,
        );
        report
    }

    /// Capture every kind from the group's target; `None` if skipped
    async fn capture_group(&self, group: &CaptureGroup) -> Option<(usize, usize)> {
        let hosts = match self.registry.list_hosts(&group.namespace).await {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!(
                    namespace = %group.namespace,
                    prefix = %group.prefix,
                    error = %e,
                    "Failed to list hosts, skipping group"
                );
                return None;
            }
        };

        let Some(target) = select_target(&hosts, &group.prefix) else {
            debug!(
                namespace = %group.namespace,
                prefix = %group.prefix,
                "No matching host, skipping group"
            );
            return None;
        };
        info!(
            namespace = %group.namespace,
            host = %target.name,
            age_secs = target.age.as_secs(),
            "Capturing profiles"
        );

        let (mut written, mut failed) = (0, 0);
        for kind in ProfileKind::ALL {
            if self.capture_kind(group, target, kind).await {
                written += 1;
            } else {
                failed += 1;
            }
        }
        Some((written, failed))
    }

    async fn capture_kind(&self, group: &CaptureGroup, target: &Host, kind: ProfileKind) -> bool {
        let dir = self.config.dest_root.join(kind.as_str());
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(dir = %dir.display(), error = %e, "Failed to create capture directory");
            self.metrics.record_capture(kind.as_str(), false);
            return false;
        }

        let source = ProfileSource::live(&target.address, kind, self.config.sample_seconds);
        let prefix = artifact_prefix(&self.config.dest_root, kind, &target.name);
        match self.sessions.persistent(&source, &prefix).await {
            Ok(path) => {
                debug!(kind = %kind, path = %path.display(), "Captured profile");
                self.metrics.record_capture(kind.as_str(), true);
                true
            }
            Err(e) => {
                warn!(
                    namespace = %group.namespace,
                    prefix = %group.prefix,
                    host = %target.name,
                    kind = %kind,
                    error = %e,
                    "Capture failed"
                );
                self.metrics.record_capture(kind.as_str(), false);
                false
            }
        }
    }
}
