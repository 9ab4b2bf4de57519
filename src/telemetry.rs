//! Host CPU and memory sampling.
//!
//! CPU usage from `sysinfo` is a delta between two refreshes, so reading it on
//! demand would report an average over whatever time passed since the last
//! request. Instead a background task refreshes the counters on a fixed
//! interval and [`SysinfoProbe::sample`] returns the latest reading. Memory
//! figures prefer the cgroup v2 limits when the gateway runs inside a
//! constrained cgroup.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sysinfo::{CpuRefreshKind, MINIMUM_CPU_UPDATE_INTERVAL, MemoryRefreshKind, RefreshKind, System};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Default refresh period of the background sampler.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// One reading of host utilization. All zeros when the host counters could
/// not be read.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostSample {
    pub cpu_percent: f64,
    pub memory_used_gb: f64,
    pub memory_total_gb: f64,
}

pub trait TelemetryProbe: Send + Sync {
    /// Reads the current utilization. Must return quickly and never fail.
    fn sample(&self) -> HostSample;
}

/// Probe backed by a periodically refreshed `sysinfo::System`.
///
/// The refresh task stops when the probe is dropped.
pub struct SysinfoProbe {
    latest: Arc<Mutex<HostSample>>,
    shutdown: CancellationToken,
}

impl SysinfoProbe {
    /// Starts sampling every `interval` (never faster than sysinfo's minimum
    /// CPU update interval). Must be called inside a tokio runtime. Until the
    /// first refresh completes, samples are zeroed.
    pub fn start(interval: Duration) -> Self {
        let mut host = HostCounters::new();
        Self::with_reader(interval.max(MINIMUM_CPU_UPDATE_INTERVAL), move || host.read())
    }

    fn with_reader<F>(interval: Duration, mut read: F) -> Self
    where
        F: FnMut() -> HostSample + Send + 'static,
    {
        let latest = Arc::new(Mutex::new(HostSample::default()));
        let shutdown = CancellationToken::new();

        let task_latest = latest.clone();
        let task_shutdown = shutdown.clone();
        tokio::spawn(async move {
            // The first tick waits a full period so the CPU delta has a baseline.
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task_shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let sample = read();
                        *task_latest.lock().unwrap_or_else(PoisonError::into_inner) = sample;
                    }
                }
            }
            tracing::debug!("telemetry sampler stopped");
        });

        SysinfoProbe { latest, shutdown }
    }
}

impl Drop for SysinfoProbe {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl TelemetryProbe for SysinfoProbe {
    fn sample(&self) -> HostSample {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct HostCounters {
    sys: System,
}

impl HostCounters {
    fn new() -> Self {
        let mut sys = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_cpu();
        HostCounters { sys }
    }

    fn read(&mut self) -> HostSample {
        self.sys.refresh_cpu();
        self.sys.refresh_memory();

        let cpu = f64::from(self.sys.global_cpu_info().cpu_usage());
        let (used_bytes, total_bytes) = match cgroup_memory_bytes() {
            Some((current, max)) => (current, max),
            None => (self.sys.used_memory(), self.sys.total_memory()),
        };

        if total_bytes == 0 || !cpu.is_finite() {
            tracing::debug!("host counters unavailable, reporting zeroed sample");
            return HostSample::default();
        }

        HostSample {
            cpu_percent: cpu.clamp(0.0, 100.0),
            memory_used_gb: used_bytes as f64 / BYTES_PER_GB,
            memory_total_gb: total_bytes as f64 / BYTES_PER_GB,
        }
    }
}

/// Human-readable OS name for the status report.
pub fn os_description() -> String {
    System::long_os_version().unwrap_or_else(|| std::env::consts::OS.to_string())
}

/// Returns `(memory.current, memory.max)` in bytes when the process lives in
/// a cgroup v2 hierarchy with a memory limit set.
fn cgroup_memory_bytes() -> Option<(u64, u64)> {
    let max = read_memory_file("memory.max")?;
    let current = read_memory_file("memory.current")?;
    Some((current.min(max), max))
}

fn get_cgroup_path() -> Option<PathBuf> {
    let data = fs::read_to_string("/proc/self/cgroup").ok()?;
    parse_cgroup_path(&data).filter(|path| path.join("memory.max").exists())
}

// cgroup v2 lines look like `0::/path/to/cgroup`.
fn parse_cgroup_path(data: &str) -> Option<PathBuf> {
    data.lines().find_map(|line| {
        let parts: Vec<&str> = line.splitn(3, ':').collect();
        if parts.len() == 3 && parts[0] == "0" && parts[1].is_empty() {
            let mut path = PathBuf::from("/sys/fs/cgroup");
            path.push(parts[2].trim_start_matches('/'));
            Some(path)
        } else {
            None
        }
    })
}

fn read_memory_file(file_name: &str) -> Option<u64> {
    let path = get_cgroup_path()?.join(file_name);
    parse_memory_value(&fs::read_to_string(path).ok()?)
}

fn parse_memory_value(data: &str) -> Option<u64> {
    let trimmed = data.trim();
    if trimmed == "max" {
        None
    } else {
        trimmed.parse::<u64>().ok()
    }
}
