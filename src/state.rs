use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Placeholder for string fields that could not be determined.
pub const UNKNOWN: &str = "-";

/// Latest known value of every sampled metric.
///
/// Each field group below is written by exactly one collector through a
/// [`GroupWriter`]; the publisher and the status API only read.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Snapshot {
    // identity, seeded once by platform detection
    pub platform: String,
    pub distro: String,
    pub hostname: String,

    // light cycle
    pub cpu_load_percent: f64,
    pub per_core_load_percent: Vec<f64>,
    pub mem_used_bytes: u64,
    pub mem_total_bytes: u64,
    pub mem_percent: f64,
    pub net_rx_bytes_per_sec: u64,
    pub net_tx_bytes_per_sec: u64,

    // heavy cycle
    pub cpu_temp_celsius: Option<f64>,
    pub core_temps_celsius: Vec<Option<f64>>,
    pub disk_used_bytes: u64,
    pub disk_total_bytes: u64,
    pub disk_percent: f64,
    pub uptime_seconds: u64,
    pub throttled: bool,
    pub net_iface: String,
    pub net_ip: String,
    pub processes: Vec<ProcessStat>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ProcessStat {
    pub name: String,
    pub cpu_percent: f64,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            platform: UNKNOWN.to_string(),
            distro: UNKNOWN.to_string(),
            hostname: UNKNOWN.to_string(),
            cpu_load_percent: 0.0,
            per_core_load_percent: Vec::new(),
            mem_used_bytes: 0,
            mem_total_bytes: 0,
            mem_percent: 0.0,
            net_rx_bytes_per_sec: 0,
            net_tx_bytes_per_sec: 0,
            cpu_temp_celsius: None,
            core_temps_celsius: Vec::new(),
            disk_used_bytes: 0,
            disk_total_bytes: 0,
            disk_percent: 0.0,
            uptime_seconds: 0,
            throttled: false,
            net_iface: UNKNOWN.to_string(),
            net_ip: UNKNOWN.to_string(),
            processes: Vec::new(),
        }
    }
}

/// A set of snapshot fields owned by a single writer.
pub trait FieldGroup: Send + 'static {
    fn apply(self, snapshot: &mut Snapshot);
}

#[derive(Debug, Clone)]
pub struct Identity {
    pub platform: String,
    pub distro: String,
    pub hostname: String,
}

impl FieldGroup for Identity {
    fn apply(self, snapshot: &mut Snapshot) {
        snapshot.platform = self.platform;
        snapshot.distro = self.distro;
        snapshot.hostname = self.hostname;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CpuLoad {
    pub total_percent: f64,
    pub per_core_percent: Vec<f64>,
}

impl FieldGroup for CpuLoad {
    fn apply(self, snapshot: &mut Snapshot) {
        snapshot.cpu_load_percent = clamp_percent(self.total_percent);
        snapshot.per_core_load_percent = self
            .per_core_percent
            .into_iter()
            .map(clamp_percent)
            .collect();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl FieldGroup for MemoryUsage {
    fn apply(self, snapshot: &mut Snapshot) {
        snapshot.mem_used_bytes = self.used_bytes;
        snapshot.mem_total_bytes = self.total_bytes;
        snapshot.mem_percent = percent(self.used_bytes, self.total_bytes);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throughput {
    pub rx_bytes_per_sec: u64,
    pub tx_bytes_per_sec: u64,
}

impl FieldGroup for Throughput {
    fn apply(self, snapshot: &mut Snapshot) {
        snapshot.net_rx_bytes_per_sec = self.rx_bytes_per_sec;
        snapshot.net_tx_bytes_per_sec = self.tx_bytes_per_sec;
    }
}

/// A valid package temperature plus optional per-core readings.
#[derive(Debug, Clone, PartialEq)]
pub struct Temperature {
    pub package_celsius: f64,
    pub cores_celsius: Vec<Option<f64>>,
}

impl FieldGroup for Temperature {
    fn apply(self, snapshot: &mut Snapshot) {
        snapshot.cpu_temp_celsius = Some(self.package_celsius);
        snapshot.core_temps_celsius = self.cores_celsius;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl FieldGroup for DiskUsage {
    fn apply(self, snapshot: &mut Snapshot) {
        snapshot.disk_used_bytes = self.used_bytes;
        snapshot.disk_total_bytes = self.total_bytes;
        snapshot.disk_percent = percent(self.used_bytes, self.total_bytes);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Uptime(pub u64);

impl FieldGroup for Uptime {
    fn apply(self, snapshot: &mut Snapshot) {
        snapshot.uptime_seconds = self.0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttle(pub bool);

impl FieldGroup for Throttle {
    fn apply(self, snapshot: &mut Snapshot) {
        snapshot.throttled = self.0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub iface: String,
    pub ip: String,
}

impl InterfaceAddress {
    pub fn unknown() -> Self {
        Self {
            iface: UNKNOWN.to_string(),
            ip: UNKNOWN.to_string(),
        }
    }

    pub fn is_known(&self) -> bool {
        self.iface != UNKNOWN
    }
}

impl FieldGroup for InterfaceAddress {
    fn apply(self, snapshot: &mut Snapshot) {
        snapshot.net_iface = self.iface;
        snapshot.net_ip = self.ip;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopProcesses(pub Vec<ProcessStat>);

impl FieldGroup for TopProcesses {
    fn apply(self, snapshot: &mut Snapshot) {
        snapshot.processes = self
            .0
            .into_iter()
            .map(|p| ProcessStat {
                cpu_percent: p.cpu_percent.max(0.0),
                ..p
            })
            .collect();
    }
}

/// Shared, process-wide snapshot.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    inner: RwLock<Snapshot>,
}

impl SnapshotStore {
    pub fn new(identity: Identity, iface: InterfaceAddress) -> Arc<Self> {
        let mut snapshot = Snapshot::default();
        identity.apply(&mut snapshot);
        iface.apply(&mut snapshot);
        Arc::new(Self {
            inner: RwLock::new(snapshot),
        })
    }

    pub async fn read(&self) -> Snapshot {
        self.inner.read().await.clone()
    }

    /// Hands out the write handle for one field group. Collectors are built
    /// with exactly one writer each, which keeps field ownership disjoint.
    pub fn writer<G: FieldGroup>(self: &Arc<Self>) -> GroupWriter<G> {
        GroupWriter {
            store: Arc::clone(self),
            _group: PhantomData,
        }
    }
}

pub struct GroupWriter<G> {
    store: Arc<SnapshotStore>,
    _group: PhantomData<fn(G)>,
}

impl<G: FieldGroup> GroupWriter<G> {
    /// Replaces the whole group under one write lock, so readers never see
    /// a half-applied group.
    pub async fn write(&self, group: G) {
        let mut guard = self.store.inner.write().await;
        group.apply(&mut guard);
    }
}

pub fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    clamp_percent(used as f64 / total as f64 * 100.0)
}

pub fn clamp_percent(v: f64) -> f64 {
    if !v.is_finite() {
        return 0.0;
    }
    v.clamp(0.0, 100.0)
}
