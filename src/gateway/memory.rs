use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::process::Command;

use super::Gateway;
use super::sessions::SessionId;
use crate::utils::task::AbortOnDrop;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub check_interval_secs: u64,
    pub max_memory_percent: f64,
    pub accelerator_check_enabled: bool,
    pub max_accelerator_percent: f64,
    /// Keyed sessions idle for longer than this are evicted under pressure.
    pub inactivity_secs: u64,
    pub local_keep_last: usize,
    pub degraded_max_concurrent: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            max_memory_percent: 80.0,
            accelerator_check_enabled: true,
            max_accelerator_percent: 80.0,
            inactivity_secs: 12 * 60 * 60,
            local_keep_last: 5,
            degraded_max_concurrent: 3,
        }
    }
}

/// Reports a memory usage percentage in `0.0..=100.0`.
#[async_trait]
pub trait MemoryProbe: Send + Sync {
    /// An unavailable measurement reads as `0.0`.
    async fn usage_percent(&self) -> f64;
}

/// Resident memory of this process relative to total physical memory.
pub struct ProcessMemoryProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(err) => {
                tracing::warn!(error = err, "cannot resolve own pid; process memory reads as 0");
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryProbe for ProcessMemoryProbe {
    async fn usage_percent(&self) -> f64 {
        let Some(pid) = self.pid else {
            return 0.0;
        };
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_memory();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

        let total = system.total_memory();
        let used = system.process(pid).map_or(0, |process| process.memory());
        percent(used, total)
    }
}

/// Aggregate accelerator memory as reported by `nvidia-smi`. A missing tool, a failed run
/// or unparsable output all read as 0%.
pub struct AcceleratorMemoryProbe {
    program: String,
}

impl AcceleratorMemoryProbe {
    pub fn new() -> Self {
        Self::with_program("nvidia-smi")
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for AcceleratorMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryProbe for AcceleratorMemoryProbe {
    async fn usage_percent(&self) -> f64 {
        let output = Command::new(&self.program)
            .args([
                "--query-gpu=memory.total,memory.used",
                "--format=csv,noheader,nounits",
            ])
            .kill_on_drop(true)
            .output()
            .await;
        match output {
            Ok(output) if output.status.success() => {
                parse_accelerator_usage(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                tracing::debug!(status = %output.status, "accelerator probe exited unsuccessfully");
                0.0
            }
            Err(err) => {
                tracing::debug!(error = %err, "accelerator probe unavailable");
                0.0
            }
        }
    }
}

/// Sums `total, used` lines (MiB) across devices. Malformed lines are skipped.
pub fn parse_accelerator_usage(stdout: &str) -> f64 {
    let (mut total, mut used) = (0u64, 0u64);
    for line in stdout.lines() {
        let mut parts = line.split(',').map(str::trim);
        let (Some(t), Some(u), None) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        let (Ok(t), Ok(u)) = (t.parse::<u64>(), u.parse::<u64>()) else {
            continue;
        };
        total = total.saturating_add(t);
        used = used.saturating_add(u);
    }
    percent(used, total)
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (used as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

/// What one relief pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReliefReport {
    pub evicted_sessions: usize,
    pub local_entries_dropped: usize,
    pub capacity_lowered_to: Option<usize>,
    pub rate_windows_pruned: usize,
}

/// Polls memory usage and sheds per-caller state when it crosses the configured limits.
pub struct MemoryGuardian {
    gateway: Arc<Gateway>,
    config: MemoryConfig,
    process: Box<dyn MemoryProbe>,
    accelerator: Option<Box<dyn MemoryProbe>>,
}

impl MemoryGuardian {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        let config = gateway.config().memory.clone();
        let accelerator: Option<Box<dyn MemoryProbe>> = if config.accelerator_check_enabled {
            Some(Box::new(AcceleratorMemoryProbe::new()))
        } else {
            None
        };
        Self {
            gateway,
            config,
            process: Box::new(ProcessMemoryProbe::new()),
            accelerator,
        }
    }

    pub fn with_process_probe(mut self, probe: impl MemoryProbe + 'static) -> Self {
        self.process = Box::new(probe);
        self
    }

    /// Replaces the accelerator probe. It is consulted only when accelerator checks are on.
    pub fn with_accelerator_probe(mut self, probe: impl MemoryProbe + 'static) -> Self {
        if self.config.accelerator_check_enabled {
            self.accelerator = Some(Box::new(probe));
        }
        self
    }

    /// Runs the check loop until the returned handle is dropped.
    pub fn spawn(self) -> MemoryGuardianHandle {
        let interval = Duration::from_secs(self.config.check_interval_secs.max(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        });
        MemoryGuardianHandle {
            task: AbortOnDrop::new(task.abort_handle()),
        }
    }

    /// One check. Returns the relief report when a limit was exceeded.
    pub async fn tick(&self) -> Option<ReliefReport> {
        let process_percent = self.process.usage_percent().await;
        let accelerator_percent = match self.accelerator.as_ref() {
            Some(probe) => probe.usage_percent().await,
            None => 0.0,
        };

        let process_over = process_percent > self.config.max_memory_percent;
        let accelerator_over = accelerator_percent > self.config.max_accelerator_percent;
        if !process_over && !accelerator_over {
            tracing::trace!(usage_percent = process_percent, accelerator_percent, "memory within limits");
            return None;
        }

        let report = self.relieve();
        tracing::warn!(
            usage_percent = process_percent,
            accelerator_percent,
            evicted_sessions = report.evicted_sessions,
            local_entries_dropped = report.local_entries_dropped,
            capacity_lowered_to = ?report.capacity_lowered_to,
            "memory pressure; released per-caller state"
        );
        Some(report)
    }

    /// Sheds state regardless of current usage.
    pub fn relieve(&self) -> ReliefReport {
        let gateway = &self.gateway;
        let now = gateway.clock().now();
        let inactivity =
            time::Duration::seconds(i64::try_from(self.config.inactivity_secs).unwrap_or(i64::MAX));

        let idle: Vec<String> = gateway
            .sessions()
            .keyed_ids()
            .into_iter()
            .filter(|key| match gateway.stats().last_call_at(key) {
                Some(last_call) => now - last_call > inactivity,
                None => true,
            })
            .collect();

        let mut report = ReliefReport::default();
        for key in idle {
            if gateway.sessions().evict(&SessionId::Key(key)) {
                report.evicted_sessions += 1;
            }
        }
        report.local_entries_dropped = gateway
            .sessions()
            .truncate(&SessionId::Local, self.config.local_keep_last);

        let floor = self.config.degraded_max_concurrent;
        if gateway.admission().lower_capacity(floor) {
            report.capacity_lowered_to = Some(gateway.admission().capacity());
        }
        report.rate_windows_pruned = gateway
            .limits()
            .prune_expired(gateway.clock().now_epoch_seconds());

        gateway.counters().record_evictions(report.evicted_sessions);
        report
    }
}

/// Stops the guardian loop when dropped.
#[derive(Debug)]
pub struct MemoryGuardianHandle {
    task: AbortOnDrop,
}

impl MemoryGuardianHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
