//! cgroup v2 container driver
//!
//! Discovers containers as leaf cgroups of the unified hierarchy and reads
//! their usage from the controller files:
//! - cpu.stat for consumed CPU time
//! - memory.current for memory in use
//! - io.stat for block device traffic
//! - /proc/<pid>/net/dev of a member process for network traffic
//!
//! Environment variables come from /proc/<pid>/environ of the first process
//! in the cgroup, reserved capacity from cpu.max and memory.max.

use super::watcher::CgroupWatcher;
use super::{ContainerDriver, DriverError, DriverResult, EventStream, UsageChannel};
use crate::models::{
    ContainerInfo, CpuUsage, DiskUsage, EventType, InterfaceUsage, MachineInfo, MemoryUsage,
    NetworkUsage, ReservedResources, Usage,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Runtime prefixes of container scope names
const SCOPE_PREFIXES: [&str; 4] = ["docker-", "crio-", "cri-containerd-", "libpod-"];

/// Snapshots buffered per container before the sampler starts skipping
const USAGE_BUFFER_SIZE: usize = 2;

const EVENT_BUFFER_SIZE: usize = 1024;

pub(super) const PATH_LABEL: &str = "cgroup.path";
pub(super) const PARENT_LABEL: &str = "cgroup.parent";

/// Driver reading the cgroup v2 unified hierarchy
pub struct CgroupDriver {
    cgroup_root: PathBuf,
    proc_path: PathBuf,
    sample_rate: Duration,
    /// Container id -> cgroup directory, filled while scanning
    paths: DashMap<String, PathBuf>,
    machine: Option<MachineInfo>,
}

impl CgroupDriver {
    /// Create a driver without probing the hierarchy
    pub fn new(
        cgroup_root: impl Into<PathBuf>,
        proc_path: impl Into<PathBuf>,
        sample_rate: Duration,
    ) -> Self {
        let proc_path = proc_path.into();
        let machine = machine_info(&proc_path);

        Self {
            cgroup_root: cgroup_root.into(),
            proc_path,
            sample_rate,
            paths: DashMap::new(),
            machine,
        }
    }

    /// Create a driver after checking that `cgroup_root` is a cgroup v2 mount
    pub fn open(
        cgroup_root: impl Into<PathBuf>,
        proc_path: impl Into<PathBuf>,
        sample_rate: Duration,
    ) -> DriverResult<Self> {
        let cgroup_root = cgroup_root.into();
        if !cgroup_root.join("cgroup.controllers").exists() {
            return Err(DriverError::Unavailable(format!(
                "no cgroup v2 unified hierarchy at {}",
                cgroup_root.display()
            )));
        }

        info!(root = %cgroup_root.display(), "Using cgroup v2 container driver");
        Ok(Self::new(cgroup_root, proc_path, sample_rate))
    }

    pub fn cgroup_root(&self) -> &Path {
        &self.cgroup_root
    }

    /// Extract a container id from a cgroup directory name
    ///
    /// Handles the layouts of the common runtimes:
    /// - Docker/containerd (cgroupfs driver): `<64 hex>`
    /// - systemd driver: `docker-<id>.scope`, `cri-containerd-<id>.scope`
    /// - CRI-O: `crio-<id>.scope`
    /// - Podman: `libpod-<id>.scope`
    pub fn extract_container_id(dir_name: &str) -> Option<String> {
        let name = dir_name.strip_suffix(".scope").unwrap_or(dir_name);
        let id = SCOPE_PREFIXES
            .iter()
            .find_map(|prefix| name.strip_prefix(prefix))
            .unwrap_or(name);

        if id.len() == 64 && id.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(id.to_string())
        } else {
            None
        }
    }

    /// Parse cpu.stat contents, returning `usage_usec`
    pub fn parse_cpu_stat(content: &str) -> u64 {
        Self::parse_flat_keyed(content)
            .get("usage_usec")
            .copied()
            .unwrap_or(0)
    }

    /// Parse a flat keyed file such as memory.stat or memory.events
    pub fn parse_flat_keyed(content: &str) -> HashMap<String, u64> {
        content
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let key = parts.next()?;
                let value = parts.next()?.parse().ok()?;
                Some((key.to_string(), value))
            })
            .collect()
    }

    /// Parse io.stat, returning bytes read plus written per device
    pub fn parse_io_stat(content: &str) -> Vec<u64> {
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                line.split_whitespace()
                    .skip(1)
                    .filter_map(|pair| pair.split_once('='))
                    .filter(|(key, _)| *key == "rbytes" || *key == "wbytes")
                    .filter_map(|(_, value)| value.parse::<u64>().ok())
                    .sum()
            })
            .collect()
    }

    /// Parse cpu.max (`$MAX $PERIOD`) into a core count; `max` means unlimited
    pub fn parse_cpu_max(content: &str) -> Option<f64> {
        let mut parts = content.split_whitespace();
        let quota = parts.next()?;
        let period: f64 = parts.next()?.parse().ok()?;
        if quota == "max" || period <= 0.0 {
            return None;
        }

        quota.parse::<f64>().ok().map(|q| q / period)
    }

    /// Parse memory.max; `max` means unlimited
    pub fn parse_memory_max(content: &str) -> Option<u64> {
        content.trim().parse().ok()
    }

    /// Parse a NUL-separated environ block, lower-casing keys
    pub fn parse_environ(block: &[u8]) -> HashMap<String, String> {
        block
            .split(|b| *b == 0)
            .filter(|entry| !entry.is_empty())
            .filter_map(|entry| {
                let entry = String::from_utf8_lossy(entry);
                let (key, value) = entry.split_once('=')?;
                Some((key.to_ascii_lowercase(), value.to_string()))
            })
            .collect()
    }

    /// Parse /proc/<pid>/net/dev, skipping the loopback interface
    pub fn parse_net_dev(content: &str) -> NetworkUsage {
        let interfaces: Vec<InterfaceUsage> = content
            .lines()
            .skip(2)
            .filter_map(|line| {
                let (name, data) = line.trim().split_once(':')?;
                if name == "lo" {
                    return None;
                }
                let fields: Vec<u64> = data
                    .split_whitespace()
                    .map(|f| f.parse().unwrap_or(0))
                    .collect();
                if fields.len() < 9 {
                    return None;
                }
                Some(InterfaceUsage {
                    name: name.to_string(),
                    rx_bytes: fields[0],
                    tx_bytes: fields[8],
                })
            })
            .collect();

        NetworkUsage {
            total_rx_bytes: interfaces.iter().map(|i| i.rx_bytes).sum(),
            total_tx_bytes: interfaces.iter().map(|i| i.tx_bytes).sum(),
            interfaces,
        }
    }

    /// Recursively scan a cgroup directory for container cgroups
    async fn scan_dir(path: &Path) -> DriverResult<Vec<(String, PathBuf)>> {
        let mut found = Vec::new();
        let mut entries = fs::read_dir(path).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }

            let entry_path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();

            match Self::extract_container_id(&name) {
                Some(id) if entry_path.join("cpu.stat").exists() => {
                    found.push((id, entry_path));
                }
                _ => {
                    if let Ok(nested) = Box::pin(Self::scan_dir(&entry_path)).await {
                        found.extend(nested);
                    }
                }
            }
        }

        Ok(found)
    }

    async fn scan(&self) -> DriverResult<Vec<(String, PathBuf)>> {
        let found = Self::scan_dir(&self.cgroup_root).await?;
        self.paths.clear();
        for (id, path) in &found {
            self.paths.insert(id.clone(), path.clone());
        }
        Ok(found)
    }

    /// Locate the cgroup directory of a container
    async fn find(&self, name: &str) -> DriverResult<PathBuf> {
        if let Some(path) = self.paths.get(name).map(|p| p.clone()) {
            if path.exists() {
                return Ok(path);
            }
            self.paths.remove(name);
        }

        self.scan()
            .await?
            .into_iter()
            .find(|(id, _)| id == name)
            .map(|(_, path)| path)
            .ok_or_else(|| DriverError::NotFound(name.to_string()))
    }

    async fn describe(&self, id: &str, path: &Path) -> ContainerInfo {
        let mut info = ContainerInfo::new(id);

        if let Ok(relative) = path.strip_prefix(&self.cgroup_root) {
            info.labels.insert(
                PATH_LABEL.to_string(),
                format!("/{}", relative.display()),
            );
        }
        if let Some(parent) = path.parent().and_then(|p| p.file_name()) {
            info.labels
                .insert(PARENT_LABEL.to_string(), parent.to_string_lossy().to_string());
        }

        if let Some(pid) = first_pid(path).await {
            let environ = self.proc_path.join(pid.to_string()).join("environ");
            match fs::read(&environ).await {
                Ok(block) => info.env = Self::parse_environ(&block),
                Err(e) => debug!(container.name = %id, error = %e, "environment not readable"),
            }
        }

        let cpu = read_optional(path, "cpu.max")
            .await
            .and_then(|c| Self::parse_cpu_max(&c));
        let memory = read_optional(path, "memory.max")
            .await
            .and_then(|c| Self::parse_memory_max(&c));
        if cpu.is_some() || memory.is_some() {
            info.reserved = Some(ReservedResources {
                cpu: cpu.unwrap_or(0.0),
                memory: memory.unwrap_or(0),
            });
        }

        info.machine = self.machine.clone();
        info
    }

    /// Read one usage snapshot of a container cgroup
    pub async fn read_usage(path: &Path, proc_path: &Path) -> DriverResult<Usage> {
        let cpu_stat = match fs::read_to_string(path.join("cpu.stat")).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(DriverError::NotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut usage = Usage {
            cpu: Some(CpuUsage {
                total: Self::parse_cpu_stat(&cpu_stat).saturating_mul(1_000),
                per_core: Vec::new(),
            }),
            ..Default::default()
        };

        if let Some(current) = read_optional(path, "memory.current").await {
            if let Ok(bytes) = current.trim().parse() {
                usage.memory = Some(MemoryUsage { bytes });
            }
        }

        if let Some(io_stat) = read_optional(path, "io.stat").await {
            usage.disk = Some(DiskUsage {
                per_disk_io: Self::parse_io_stat(&io_stat),
            });
        }

        if let Some(pid) = first_pid(path).await {
            let net_dev = proc_path.join(pid.to_string()).join("net").join("dev");
            if let Ok(content) = fs::read_to_string(&net_dev).await {
                usage.network = Some(Self::parse_net_dev(&content));
            }
        }

        Ok(usage)
    }

    fn spawn_sampler(&self, name: String, path: PathBuf, tx: mpsc::Sender<Usage>) {
        let proc_path = self.proc_path.clone();
        let rate = self.sample_rate;

        tokio::spawn(async move {
            let mut ticker = interval(rate);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        debug!(container.name = %name, "usage channel released");
                        break;
                    }
                    _ = ticker.tick() => {
                        match Self::read_usage(&path, &proc_path).await {
                            Ok(usage) => {
                                // A full buffer means the consumer is behind; skip this snapshot
                                let _ = tx.try_send(usage);
                            }
                            Err(DriverError::NotFound(_)) => {
                                info!(container.name = %name, "cgroup removed, closing usage channel");
                                break;
                            }
                            Err(e) => {
                                warn!(container.name = %name, error = %e, "failed to read container usage");
                            }
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl ContainerDriver for CgroupDriver {
    async fn list_containers(&self) -> DriverResult<Vec<ContainerInfo>> {
        let found = self.scan().await?;
        let mut containers = Vec::with_capacity(found.len());
        for (id, path) in &found {
            containers.push(self.describe(id, path).await);
        }

        info!(count = containers.len(), "Discovered existing containers");
        Ok(containers)
    }

    async fn watch_events(&self, types: &[EventType]) -> DriverResult<EventStream> {
        CgroupWatcher::new(&self.cgroup_root, types).start(EVENT_BUFFER_SIZE)
    }

    async fn get_container(&self, name: &str) -> DriverResult<ContainerInfo> {
        let path = self.find(name).await?;
        Ok(self.describe(name, &path).await)
    }

    async fn open_usage_channel(&self, name: &str) -> DriverResult<UsageChannel> {
        let path = self.find(name).await?;
        let info = Arc::new(self.describe(name, &path).await);
        let (tx, channel) = UsageChannel::open(info, USAGE_BUFFER_SIZE);
        self.spawn_sampler(name.to_string(), path, tx);

        Ok(channel)
    }

    fn label_keys(&self) -> Option<&'static [&'static str]> {
        Some(&[PATH_LABEL, PARENT_LABEL])
    }
}

/// Read a controller file that may be absent
async fn read_optional(path: &Path, file: &str) -> Option<String> {
    fs::read_to_string(path.join(file)).await.ok()
}

/// First process listed in cgroup.procs
pub(super) async fn first_pid(path: &Path) -> Option<u32> {
    read_optional(path, "cgroup.procs")
        .await?
        .lines()
        .find_map(|line| line.trim().parse().ok())
}

fn machine_info(proc_path: &Path) -> Option<MachineInfo> {
    let meminfo = std::fs::read_to_string(proc_path.join("meminfo")).ok()?;
    let memory_kb = meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .unwrap_or(0);

    let cpu_frequency_khz = std::fs::read_to_string(proc_path.join("cpuinfo"))
        .ok()
        .and_then(|cpuinfo| {
            cpuinfo
                .lines()
                .find(|line| line.starts_with("cpu MHz"))
                .and_then(|line| line.split(':').nth(1))
                .and_then(|mhz| mhz.trim().parse::<f64>().ok())
        })
        .map(|mhz| (mhz * 1000.0) as u64)
        .unwrap_or(0);

    Some(MachineInfo {
        system_uuid: std::fs::read_to_string("/etc/machine-id")
            .map(|id| id.trim().to_string())
            .unwrap_or_default(),
        cores: std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1),
        memory_bytes: memory_kb * 1024,
        cpu_frequency_khz,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ID: &str = "abc123def456789012345678901234567890123456789012345678901234abcd";

    /// Build a mock cgroup v2 tree with one container cgroup and its process
    async fn create_mock_tree(temp_dir: &TempDir) -> (PathBuf, PathBuf, PathBuf) {
        let root = temp_dir.path().join("cgroup");
        let proc_path = temp_dir.path().join("proc");

        fs::create_dir_all(&root).await.unwrap();
        fs::write(root.join("cgroup.controllers"), "cpu memory io\n")
            .await
            .unwrap();

        let container = root
            .join("system.slice")
            .join(format!("docker-{}.scope", ID));
        fs::create_dir_all(&container).await.unwrap();
        fs::write(
            container.join("cpu.stat"),
            "usage_usec 5000000\nuser_usec 3000000\nsystem_usec 2000000\n",
        )
        .await
        .unwrap();
        fs::write(container.join("memory.current"), "104857600\n")
            .await
            .unwrap();
        fs::write(
            container.join("io.stat"),
            "8:0 rbytes=1024 wbytes=2048 rios=12 wios=24\n254:0 rbytes=10 wbytes=0 rios=1 wios=0\n",
        )
        .await
        .unwrap();
        fs::write(container.join("cpu.max"), "50000 100000\n")
            .await
            .unwrap();
        fs::write(container.join("memory.max"), "max\n").await.unwrap();
        fs::write(container.join("cgroup.procs"), "4242\n4243\n")
            .await
            .unwrap();

        let pid_dir = proc_path.join("4242");
        fs::create_dir_all(pid_dir.join("net")).await.unwrap();
        fs::write(pid_dir.join("environ"), b"PATH=/usr/bin\0METER_TRACK=1\0")
            .await
            .unwrap();
        fs::write(
            pid_dir.join("net").join("dev"),
            "Inter-|   Receive                                                |  Transmit\n \
             face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n    \
             lo: 100 1 0 0 0 0 0 0 100 1 0 0 0 0 0 0\n  \
             eth0: 2000 20 0 0 0 0 0 0 3000 30 0 0 0 0 0 0\n",
        )
        .await
        .unwrap();

        (root, proc_path, container)
    }

    #[test]
    fn test_extract_container_id() {
        assert_eq!(CgroupDriver::extract_container_id(ID), Some(ID.to_string()));
        assert_eq!(
            CgroupDriver::extract_container_id(&format!("crio-{}.scope", ID)),
            Some(ID.to_string())
        );
        assert_eq!(
            CgroupDriver::extract_container_id(&format!("cri-containerd-{}.scope", ID)),
            Some(ID.to_string())
        );
        assert_eq!(CgroupDriver::extract_container_id("system.slice"), None);
        assert_eq!(CgroupDriver::extract_container_id("docker-short.scope"), None);
    }

    #[test]
    fn test_parse_cpu_stat() {
        let content = "usage_usec 123456789\nuser_usec 100000000\nnr_throttled 50\n";
        assert_eq!(CgroupDriver::parse_cpu_stat(content), 123456789);
        assert_eq!(CgroupDriver::parse_cpu_stat(""), 0);
    }

    #[test]
    fn test_parse_io_stat() {
        let content = "8:0 rbytes=1024 wbytes=2048 rios=12 wios=24\n254:0 rbytes=1 wbytes=1\n";
        assert_eq!(CgroupDriver::parse_io_stat(content), vec![3072, 2]);
    }

    #[test]
    fn test_parse_limits() {
        assert_eq!(CgroupDriver::parse_cpu_max("50000 100000"), Some(0.5));
        assert_eq!(CgroupDriver::parse_cpu_max("max 100000"), None);
        assert_eq!(CgroupDriver::parse_memory_max("1073741824\n"), Some(1073741824));
        assert_eq!(CgroupDriver::parse_memory_max("max\n"), None);
    }

    #[test]
    fn test_parse_environ_lower_cases_keys() {
        let env = CgroupDriver::parse_environ(b"HOME=/root\0Meter_Track=1\0broken\0");
        assert_eq!(env.get("home"), Some(&"/root".to_string()));
        assert_eq!(env.get("meter_track"), Some(&"1".to_string()));
        assert_eq!(env.len(), 2);
    }

    #[tokio::test]
    async fn test_open_requires_unified_hierarchy() {
        let temp_dir = TempDir::new().unwrap();
        let result = CgroupDriver::open(temp_dir.path(), temp_dir.path(), Duration::from_secs(1));
        assert!(matches!(result, Err(DriverError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_list_containers_describes_container() {
        let temp_dir = TempDir::new().unwrap();
        let (root, proc_path, _) = create_mock_tree(&temp_dir).await;

        let driver = CgroupDriver::open(&root, &proc_path, Duration::from_secs(1)).unwrap();
        let containers = driver.list_containers().await.unwrap();

        assert_eq!(containers.len(), 1);
        let info = &containers[0];
        assert_eq!(info.name, ID);
        assert_eq!(info.env.get("meter_track"), Some(&"1".to_string()));
        assert_eq!(info.label(PARENT_LABEL), Some("system.slice"));
        let reserved = info.reserved.as_ref().unwrap();
        assert_eq!(reserved.cpu, 0.5);
        assert_eq!(reserved.memory, 0);
    }

    #[tokio::test]
    async fn test_read_usage() {
        let temp_dir = TempDir::new().unwrap();
        let (_, proc_path, container) = create_mock_tree(&temp_dir).await;

        let usage = CgroupDriver::read_usage(&container, &proc_path).await.unwrap();

        assert_eq!(usage.cpu.unwrap().total, 5_000_000_000);
        assert_eq!(usage.memory.unwrap().bytes, 104857600);
        assert_eq!(usage.disk.unwrap().per_disk_io, vec![3072, 10]);
        let network = usage.network.unwrap();
        assert_eq!(network.total_rx_bytes, 2000);
        assert_eq!(network.total_tx_bytes, 3000);
        assert_eq!(network.interfaces.len(), 1);
    }

    #[tokio::test]
    async fn test_label_keys_match_descriptors() {
        let temp_dir = TempDir::new().unwrap();
        let (root, proc_path, _) = create_mock_tree(&temp_dir).await;

        let driver = CgroupDriver::new(&root, &proc_path, Duration::from_secs(1));
        let keys = driver.label_keys().unwrap();
        let info = driver.get_container(ID).await.unwrap();

        let mut labels: Vec<&str> = info.labels.keys().map(String::as_str).collect();
        labels.sort();
        let mut expected = keys.to_vec();
        expected.sort();
        assert_eq!(labels, expected);
    }

    #[tokio::test]
    async fn test_get_missing_container_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let (root, proc_path, _) = create_mock_tree(&temp_dir).await;

        let driver = CgroupDriver::new(&root, &proc_path, Duration::from_secs(1));
        let result = driver.get_container("nope").await;

        assert!(matches!(result, Err(DriverError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_usage_channel_delivers_and_closes_when_cgroup_vanishes() {
        let temp_dir = TempDir::new().unwrap();
        let (root, proc_path, container) = create_mock_tree(&temp_dir).await;

        let driver = CgroupDriver::new(&root, &proc_path, Duration::from_millis(20));
        let mut channel = driver.open_usage_channel(ID).await.unwrap();

        let usage = tokio::time::timeout(Duration::from_secs(2), channel.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(usage.cpu.is_some());

        fs::remove_dir_all(&container).await.unwrap();

        let drained = tokio::time::timeout(Duration::from_secs(2), async {
            while channel.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok());
    }
}
