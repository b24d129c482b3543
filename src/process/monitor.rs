use crate::process::supervisor::SupervisorEvent;
use crate::process::types::ExitInfo;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, warn};

/// One resource usage reading for a process
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    /// Resident memory in bytes
    pub memory: u64,
    /// CPU usage in percent
    pub cpu: f32,
}

/// Source of resource samples
///
/// Called on the blocking pool. Returns `None` when the process no longer exists.
pub trait ResourceSampler: Send + Sync + 'static {
    fn sample(&self, pid: u32) -> Option<ResourceSample>;
}

/// Sampler backed by sysinfo
pub struct SysinfoSampler {
    system: Mutex<System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SysinfoSampler {
    fn sample(&self, pid: u32) -> Option<ResourceSample> {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let sys_pid = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::everything(),
        );

        system.process(sys_pid).map(|process| ResourceSample {
            memory: process.memory(),
            cpu: process.cpu_usage(),
        })
    }
}

/// Last sample taken for an instance, shared with status readers
pub type UsageCell = Arc<Mutex<Option<ResourceSample>>>;

pub(crate) fn read_usage(cell: &UsageCell) -> Option<ResourceSample> {
    match cell.lock() {
        Ok(guard) => *guard,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

pub(crate) fn store_usage(cell: &UsageCell, sample: Option<ResourceSample>) {
    match cell.lock() {
        Ok(mut guard) => *guard = sample,
        Err(poisoned) => *poisoned.into_inner() = sample,
    }
}

/// What a monitor task watches
#[derive(Debug, Clone, Copy)]
pub(crate) struct MonitorTarget {
    pub instance: usize,
    pub generation: u64,
    pub pid: u32,
    /// Memory ceiling in bytes
    pub ceiling: Option<u64>,
}

/// Periodic resource sampler for live children
///
/// One task per child run. Breaches are posted to the app's control loop;
/// the monitor itself never changes lifecycle state.
#[derive(Clone)]
pub struct ResourceMonitor {
    sampler: Arc<dyn ResourceSampler>,
    interval: Duration,
    read_timeout: Duration,
}

impl ResourceMonitor {
    pub fn new(sampler: Arc<dyn ResourceSampler>, interval: Duration, read_timeout: Duration) -> Self {
        Self {
            sampler,
            interval,
            read_timeout,
        }
    }

    /// Watch one child run until it exits, vanishes or breaches its ceiling
    pub(crate) fn watch(
        &self,
        target: MonitorTarget,
        usage: UsageCell,
        mut exit_rx: watch::Receiver<Option<ExitInfo>>,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> JoinHandle<()> {
        let monitor = self.clone();

        tokio::spawn(async move {
            let mut ticker = interval(monitor.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                let exited = exit_rx.borrow_and_update().is_some();
                if exited {
                    break;
                }

                tokio::select! {
                    changed = exit_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    _ = ticker.tick() => {}
                }

                let sampler = Arc::clone(&monitor.sampler);
                let pid = target.pid;
                let sample = match timeout(
                    monitor.read_timeout,
                    tokio::task::spawn_blocking(move || sampler.sample(pid)),
                )
                .await
                {
                    Ok(Ok(sample)) => sample,
                    Ok(Err(e)) => {
                        warn!(pid, "resource sampling task failed: {}", e);
                        continue;
                    }
                    Err(_) => {
                        debug!(pid, "resource sample timed out");
                        continue;
                    }
                };

                let Some(sample) = sample else {
                    // The exit watcher reports the exit
                    debug!(pid, "process vanished, monitor finished");
                    break;
                };

                store_usage(&usage, Some(sample));

                if let Some(ceiling) = target.ceiling {
                    if sample.memory > ceiling {
                        let _ = events.send(SupervisorEvent::MemoryBreach {
                            instance: target.instance,
                            generation: target.generation,
                            usage: sample.memory,
                        });
                        break;
                    }
                }
            }
        })
    }
}
