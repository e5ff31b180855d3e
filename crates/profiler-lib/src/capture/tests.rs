use super::*;
use crate::discovery::{ClusterApi, ConventionClassifier, HostRegistry, RegistryError};
use crate::models::{
    DeclaredPort, Host, InstancePhase, PortProtocol, ProfileKind, WorkloadInstance,
};
use crate::observability::StructuredLogger;
use crate::session::{PprofCommand, SessionManager};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

/// Writes the `-output` file and logs the source to `$STATE_DIR/sources`.
/// Fails for trace captures so a single kind can be made to fail.
const CAPTURE_SCRIPT: &str = r#"out=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "-output" ]; then out="$arg"; fi
  prev="$arg"
  src="$arg"
done
echo "$src" >> "$STATE_DIR/sources"
case "$src" in
  *FAIL_KIND*) echo "fetch failed" >&2; exit 1 ;;
esac
printf 'profile' > "$out""#;

struct FakeCluster {
    instances: HashMap<String, Vec<WorkloadInstance>>,
    broken: Vec<String>,
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_namespaces(&self) -> Result<Vec<String>, RegistryError> {
        Ok(self.instances.keys().cloned().collect())
    }

    async fn list_instances(&self, namespace: &str) -> Result<Vec<WorkloadInstance>, RegistryError> {
        if self.broken.iter().any(|b| b == namespace) {
            return Err(RegistryError::UpstreamUnavailable("timeout".into()));
        }
        Ok(self.instances.get(namespace).cloned().unwrap_or_default())
    }
}

fn host(name: &str, age_mins: u64) -> Host {
    Host {
        name: name.to_string(),
        address: format!("10.0.0.1:{}", 8000 + age_mins),
        age: Duration::from_secs(age_mins * 60),
    }
}

fn pod(name: &str, ip: &str, age_mins: i64) -> WorkloadInstance {
    WorkloadInstance {
        name: name.to_string(),
        phase: InstancePhase::Running,
        pod_ip: Some(ip.to_string()),
        started_at: Some(Utc::now() - chrono::Duration::minutes(age_mins)),
        ports: vec![DeclaredPort {
            name: Some("http".to_string()),
            port: 8080,
            protocol: PortProtocol::Tcp,
        }],
    }
}

fn scheduler(
    dir: &TempDir,
    cluster: FakeCluster,
    groups: &str,
    failing_kind: Option<ProfileKind>,
) -> CaptureScheduler {
    let script = dir.path().join("fake-pprof.sh");
    let marker = failing_kind
        .map(|kind| format!("*/debug/pprof/{}\\?*", kind.as_str()))
        .unwrap_or_else(|| "never-matches".to_string());
    let body = CAPTURE_SCRIPT
        .replace("$STATE_DIR", &dir.path().display().to_string())
        .replace("*FAIL_KIND*", &marker);
    std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();

    let registry = HostRegistry::new(Arc::new(cluster), Arc::new(ConventionClassifier::default()));
    let sessions = SessionManager::new(
        40_000,
        PprofCommand::new("sh", vec![script.display().to_string()]),
    );
    let config = CaptureConfig::new(
        CronSchedule::parse("@hourly").unwrap(),
        CaptureGroup::parse_list(groups).unwrap(),
        dir.path().join("dest"),
    );
    CaptureScheduler::new(
        Arc::new(registry),
        Arc::new(sessions),
        config,
        StructuredLogger::new("test"),
    )
}

fn artifacts_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[test]
fn test_select_target_picks_oldest() {
    let hosts = vec![host("api-a:8080", 10), host("api-b:8080", 30), host("api-c:8080", 5)];
    assert_eq!(select_target(&hosts, "api").unwrap().name, "api-b:8080");
}

#[test]
fn test_select_target_tie_keeps_first() {
    let hosts = vec![host("api-a:8080", 30), host("api-b:8080", 30)];
    assert_eq!(select_target(&hosts, "api").unwrap().name, "api-a:8080");
}

#[test]
fn test_select_target_filters_by_prefix() {
    let hosts = vec![host("worker-0:8080", 60), host("api-0:8080", 1)];
    assert_eq!(select_target(&hosts, "api").unwrap().name, "api-0:8080");
    assert!(select_target(&hosts, "db").is_none());
    assert!(select_target(&[], "api").is_none());
}

#[test]
fn test_parse_groups() {
    let groups = CaptureGroup::parse_list("prod:api, staging:worker-,").unwrap();
    assert_eq!(
        groups,
        vec![
            CaptureGroup {
                namespace: "prod".into(),
                prefix: "api".into()
            },
            CaptureGroup {
                namespace: "staging".into(),
                prefix: "worker-".into()
            },
        ]
    );
    // An empty prefix matches every host
    assert_eq!(CaptureGroup::parse_list("prod:").unwrap()[0].prefix, "");
    assert!(CaptureGroup::parse_list("").unwrap().is_empty());
}

#[test]
fn test_parse_groups_rejects_malformed() {
    assert!(CaptureGroup::parse_list("prod").is_err());
    assert!(CaptureGroup::parse_list(":api").is_err());
    assert!(CaptureGroup::parse_list("prod:api:extra").is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn test_run_once_captures_every_kind_from_oldest_host() {
    let dir = TempDir::new().unwrap();
    let cluster = FakeCluster {
        instances: HashMap::from([(
            "prod".to_string(),
            vec![
                pod("api-young", "10.0.0.1", 5),
                pod("api-old", "10.0.0.2", 120),
                pod("worker-0", "10.0.0.3", 600),
            ],
        )]),
        broken: Vec::new(),
    };
    let scheduler = scheduler(&dir, cluster, "prod:api", None);

    let report = scheduler.run_once().await;

    assert_eq!(report.groups_captured, 1);
    assert_eq!(report.groups_skipped, 0);
    assert_eq!(report.artifacts_written, ProfileKind::ALL.len());
    assert_eq!(report.captures_failed, 0);

    let dest = dir.path().join("dest");
    for kind in ProfileKind::ALL {
        let names = artifacts_in(&dest.join(kind.as_str()));
        assert_eq!(names.len(), 1, "one artifact for {kind}");
        assert!(names[0].starts_with("api-old:8080-"));
        assert!(names[0].ends_with(".pb.gz"));
    }

    let sources = std::fs::read_to_string(dir.path().join("sources")).unwrap();
    assert!(sources.lines().all(|s| s.starts_with("10.0.0.2:8080/debug/pprof/")));
    assert!(sources.contains("10.0.0.2:8080/debug/pprof/heap?seconds=5"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_run_once_isolates_failures() {
    let dir = TempDir::new().unwrap();
    let cluster = FakeCluster {
        instances: HashMap::from([
            ("prod".to_string(), vec![pod("api-0", "10.0.0.1", 30)]),
            ("staging".to_string(), vec![pod("worker-0", "10.0.0.2", 30)]),
        ]),
        broken: vec!["prod".to_string()],
    };
    let scheduler = scheduler(
        &dir,
        cluster,
        "prod:api,staging:worker,staging:missing",
        Some(ProfileKind::Trace),
    );

    let report = scheduler.run_once().await;

    // prod fails upstream, staging:missing has no host
    assert_eq!(report.groups_captured, 1);
    assert_eq!(report.groups_skipped, 2);
    assert_eq!(report.artifacts_written, ProfileKind::ALL.len() - 1);
    assert_eq!(report.captures_failed, 1);

    let dest = dir.path().join("dest");
    assert!(artifacts_in(&dest.join("trace")).is_empty());
    assert_eq!(artifacts_in(&dest.join("heap")).len(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn test_run_once_sweeps_expired_artifacts() {
    let dir = TempDir::new().unwrap();
    let cluster = FakeCluster {
        instances: HashMap::new(),
        broken: Vec::new(),
    };
    let scheduler = scheduler(&dir, cluster, "", None);

    let heap = dir.path().join("dest").join("heap");
    std::fs::create_dir_all(&heap).unwrap();
    let stale = heap.join("api-0:8080-2024-01-01_00:00:00.pb.gz");
    std::fs::write(&stale, b"old").unwrap();
    std::fs::File::options()
        .write(true)
        .open(&stale)
        .unwrap()
        .set_modified(SystemTime::now() - Duration::from_secs(48 * 3600))
        .unwrap();
    let recent = heap.join("api-0:8080-2024-01-02_00:00:00.pb.gz");
    std::fs::write(&recent, b"new").unwrap();

    let report = scheduler.run_once().await;

    assert_eq!(report.artifacts_deleted, 1);
    assert!(!stale.exists());
    assert!(recent.exists());
}
