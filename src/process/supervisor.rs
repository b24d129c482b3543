use crate::config::AppSpec;
use crate::error::{Result, TetherError};
use crate::process::monitor::{
    read_usage, store_usage, MonitorTarget, ResourceMonitor, ResourceSampler, SysinfoSampler,
    UsageCell,
};
use crate::process::restart::{RestartDecision, RestartPolicy};
use crate::process::spawner::spawn_process;
use crate::process::types::{ExitInfo, InstanceStatus, ManagedProcess, ProcessState, StopReason};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Supervisor-wide timing knobs
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// How long a fresh child must stay up before it is reported as running
    pub start_grace: Duration,
    /// Resource sampling period
    pub sample_interval: Duration,
    /// Upper bound on a single resource sample
    pub sample_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            start_grace: Duration::from_secs(1),
            sample_interval: Duration::from_secs(2),
            sample_timeout: Duration::from_secs(1),
        }
    }
}

/// Messages delivered to an app's control loop
///
/// Every event names the instance and the generation of the run it belongs
/// to. Events from an older generation are dropped.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// The start grace period elapsed
    Alive { instance: usize, generation: u64 },
    /// The child terminated
    Exited {
        instance: usize,
        generation: u64,
        exit: ExitInfo,
    },
    /// A backoff delay elapsed
    RestartDue { instance: usize, generation: u64 },
    /// The child went over its memory ceiling
    MemoryBreach {
        instance: usize,
        generation: u64,
        usage: u64,
    },
    /// A breached child ignored the stop signal for the whole kill timeout
    ForceKill { instance: usize, generation: u64 },
}

impl SupervisorEvent {
    pub fn instance(&self) -> usize {
        match self {
            SupervisorEvent::Alive { instance, .. }
            | SupervisorEvent::Exited { instance, .. }
            | SupervisorEvent::RestartDue { instance, .. }
            | SupervisorEvent::MemoryBreach { instance, .. }
            | SupervisorEvent::ForceKill { instance, .. } => *instance,
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            SupervisorEvent::Alive { generation, .. }
            | SupervisorEvent::Exited { generation, .. }
            | SupervisorEvent::RestartDue { generation, .. }
            | SupervisorEvent::MemoryBreach { generation, .. }
            | SupervisorEvent::ForceKill { generation, .. } => *generation,
        }
    }
}

/// One instance of an app: the locked record plus lock-free views of it
struct InstanceSlot {
    process: Mutex<ManagedProcess>,
    status: watch::Receiver<InstanceStatus>,
    usage: UsageCell,
}

impl InstanceSlot {
    fn new(spec: Arc<AppSpec>, instance: usize) -> Self {
        let (process, status) = ManagedProcess::new(spec, instance);
        Self {
            process: Mutex::new(process),
            status,
            usage: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    fn snapshot(&self) -> InstanceStatus {
        let mut status = self.status.borrow().clone();
        if status.state.is_live() {
            if let Some(sample) = read_usage(&self.usage) {
                status.memory = Some(sample.memory);
                status.cpu = Some(sample.cpu);
            }
        }
        status
    }
}

/// What a launch needs besides the instance record
#[derive(Clone)]
struct LaunchContext {
    monitor: ResourceMonitor,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    start_grace: Duration,
}

/// All instances of one app and the control loop serving them
struct AppGroup {
    spec: Arc<AppSpec>,
    slots: Vec<Arc<InstanceSlot>>,
    ctx: LaunchContext,
    control: std::sync::Mutex<Option<JoinHandle<()>>>,
    /// Set once the group left the app map; its slots must not launch again
    retired: AtomicBool,
}

impl AppGroup {
    fn spawn(spec: AppSpec, settings: &SupervisorSettings, monitor: &ResourceMonitor) -> Arc<Self> {
        let spec = Arc::new(spec);
        let slots: Vec<Arc<InstanceSlot>> = (0..spec.instances)
            .map(|instance| Arc::new(InstanceSlot::new(Arc::clone(&spec), instance)))
            .collect();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ctx = LaunchContext {
            monitor: monitor.clone(),
            events: events_tx,
            start_grace: settings.start_grace,
        };

        let handle = tokio::spawn(control_loop(
            spec.name.clone(),
            slots.clone(),
            ctx.clone(),
            events_rx,
        ));

        Arc::new(Self {
            spec,
            slots,
            ctx,
            control: std::sync::Mutex::new(Some(handle)),
            retired: AtomicBool::new(false),
        })
    }

    /// Checked under a slot lock before every explicit launch
    fn ensure_active(&self) -> Result<()> {
        if self.retired.load(Ordering::SeqCst) {
            return Err(TetherError::AppNotFound(self.spec.name.clone()));
        }
        Ok(())
    }

    fn all_stopped(&self) -> bool {
        self.slots
            .iter()
            .all(|slot| slot.status.borrow().state == ProcessState::Stopped)
    }

    fn abort(&self) {
        let handle = match self.control.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for AppGroup {
    fn drop(&mut self) {
        self.abort();
    }
}

struct Inner {
    settings: SupervisorSettings,
    monitor: ResourceMonitor,
    apps: RwLock<HashMap<String, Arc<AppGroup>>>,
}

/// Owns every managed app and drives their lifecycles
///
/// Cloning is cheap; clones share the same set of apps. Lifecycle operations
/// on one instance are serialized by that instance's lock, so a `stop` issued
/// while a `restart` is in flight runs after it and wins.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Create a supervisor sampling resources through sysinfo
    pub fn new(settings: SupervisorSettings) -> Self {
        Self::with_sampler(settings, Arc::new(SysinfoSampler::new()))
    }

    /// Create a supervisor with a custom resource sampler
    pub fn with_sampler(settings: SupervisorSettings, sampler: Arc<dyn ResourceSampler>) -> Self {
        let monitor = ResourceMonitor::new(
            sampler,
            settings.sample_interval,
            settings.sample_timeout,
        );

        Self {
            inner: Arc::new(Inner {
                settings,
                monitor,
                apps: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Start every stopped instance of an app
    ///
    /// # Arguments
    /// * `spec` - App definition; replaces a previous definition only when
    ///   all of that app's instances are stopped
    ///
    /// # Returns
    /// Number of instances launched
    pub async fn start(&self, spec: AppSpec) -> Result<usize> {
        spec.validate()?;
        let name = spec.name.clone();

        let (group, replaced) = {
            let mut apps = self.inner.apps.write().await;
            let reuse = match apps.get(&name) {
                Some(existing) if *existing.spec == spec => Some(Arc::clone(existing)),
                Some(existing) if !existing.all_stopped() => {
                    return Err(TetherError::AlreadyRunning(format!(
                        "{} (running with a different configuration, reload it instead)",
                        name
                    )));
                }
                _ => None,
            };

            match reuse {
                Some(group) => (group, None),
                None => {
                    let group = AppGroup::spawn(spec, &self.inner.settings, &self.inner.monitor);
                    let replaced = apps.insert(name.clone(), Arc::clone(&group));
                    (group, replaced)
                }
            }
        };

        // A restart holding the old group may still launch into it
        if let Some(old) = replaced {
            retire(&old).await?;
        }

        let mut started = 0;
        let mut first_error = None;

        for slot in &group.slots {
            let mut process = slot.process.lock().await;
            group.ensure_active()?;
            if process.state != ProcessState::Stopped {
                continue;
            }

            process.tracker.reset();
            match launch(&mut process, &slot.usage, &group.ctx) {
                Ok(_) => started += 1,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if started == 0 {
            return Err(TetherError::AlreadyRunning(name));
        }

        info!(app = %name, "Started {} instance(s)", started);
        Ok(started)
    }

    /// Stop every instance of an app
    ///
    /// Stopping an already stopped instance is a no-op. A pending backoff
    /// restart is cancelled.
    ///
    /// # Returns
    /// Number of instances that were actually stopped
    pub async fn stop(&self, name: &str) -> Result<usize> {
        let group = self.group(name).await?;

        let mut stopped = 0;
        let mut first_error = None;

        for slot in &group.slots {
            match stop_slot(slot).await {
                Ok(true) => stopped += 1,
                Ok(false) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(app = %name, "Stopped {} instance(s)", stopped);
                Ok(stopped)
            }
        }
    }

    /// Stop and relaunch every instance of an app
    ///
    /// Each instance keeps its record throughout, gains one restart and has
    /// its failure streak cleared. Stopped instances are simply started.
    pub async fn restart(&self, name: &str) -> Result<usize> {
        let group = self.group(name).await?;

        let mut restarted = 0;
        let mut first_error = None;

        for slot in &group.slots {
            match restart_slot(&group, slot).await {
                Ok(_) => restarted += 1,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(app = %name, "Restarted {} instance(s)", restarted);
                Ok(restarted)
            }
        }
    }

    /// Snapshot of every instance of an app
    ///
    /// Reads published snapshots only; never waits on an instance lock.
    pub async fn status(&self, name: &str) -> Result<Vec<InstanceStatus>> {
        let group = self.group(name).await?;
        Ok(group.slots.iter().map(|slot| slot.snapshot()).collect())
    }

    /// Snapshot of every instance of every app, ordered by app and instance
    pub async fn status_all(&self) -> Vec<InstanceStatus> {
        let apps = self.inner.apps.read().await;

        let mut statuses: Vec<InstanceStatus> = apps
            .values()
            .flat_map(|group| group.slots.iter().map(|slot| slot.snapshot()))
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name).then(a.instance.cmp(&b.instance)));
        statuses
    }

    /// Names of all known apps
    pub async fn app_names(&self) -> Vec<String> {
        let apps = self.inner.apps.read().await;
        let mut names: Vec<String> = apps.keys().cloned().collect();
        names.sort();
        names
    }

    /// Replace an app's definition and start it fresh
    ///
    /// The old instances are retired and stopped first; counters start from
    /// zero. A `restart` or `start` racing the reload either lands before the
    /// old instances are stopped or fails with `AppNotFound`.
    pub async fn reload(&self, spec: AppSpec) -> Result<usize> {
        spec.validate()?;

        let old = self.inner.apps.write().await.remove(&spec.name);
        if let Some(old) = old {
            retire(&old).await?;
        }

        info!(app = %spec.name, "Reloading");
        self.start(spec).await
    }

    /// Stop and forget every app
    pub async fn shutdown(&self) {
        let groups: Vec<(String, Arc<AppGroup>)> =
            self.inner.apps.write().await.drain().collect();

        for (name, group) in groups {
            if let Err(e) = retire(&group).await {
                error!(app = %name, "Failed to stop during shutdown: {}", e);
            }
        }

        info!("Supervisor shut down");
    }

    async fn group(&self, name: &str) -> Result<Arc<AppGroup>> {
        self.inner
            .apps
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| TetherError::AppNotFound(name.to_string()))
    }
}

/// Spawn a new run for an instance; the caller holds the instance lock
fn launch(process: &mut ManagedProcess, usage: &UsageCell, ctx: &LaunchContext) -> Result<u32> {
    process.generation += 1;
    let generation = process.generation;
    let instance = process.instance;

    let spawned = match spawn_process(&process.spec, instance) {
        Ok(spawned) => spawned,
        Err(e) => {
            error!(app = %process.spec.name, instance, "{}", e);
            process.mark_stopped(StopReason::SpawnFailed(e.to_string()));
            return Err(e);
        }
    };

    let pid = spawned.pid;
    store_usage(usage, None);

    let exit_rx = watch_exit(spawned.child, instance, generation, ctx.events.clone());
    ctx.monitor.watch(
        MonitorTarget {
            instance,
            generation,
            pid,
            ceiling: process.spec.max_memory,
        },
        Arc::clone(usage),
        exit_rx.clone(),
        ctx.events.clone(),
    );

    process.mark_starting(pid, exit_rx);
    schedule(
        &ctx.events,
        ctx.start_grace,
        SupervisorEvent::Alive {
            instance,
            generation,
        },
    );

    info!(app = %process.spec.name, instance, pid, "Process started");
    Ok(pid)
}

/// Reap the child in the background and report its exit
///
/// The returned receiver flips to `Some` once the child is gone.
fn watch_exit(
    mut child: Child,
    instance: usize,
    generation: u64,
    events: mpsc::UnboundedSender<SupervisorEvent>,
) -> watch::Receiver<Option<ExitInfo>> {
    let (exit_tx, exit_rx) = watch::channel(None);

    tokio::spawn(async move {
        let exit = match child.wait().await {
            Ok(status) => ExitInfo::from_status(status),
            Err(e) => {
                warn!(instance, "Failed to wait for child: {}", e);
                ExitInfo::unknown()
            }
        };

        exit_tx.send_replace(Some(exit));
        let _ = events.send(SupervisorEvent::Exited {
            instance,
            generation,
            exit,
        });
    });

    exit_rx
}

async fn wait_exit(exit_rx: &mut watch::Receiver<Option<ExitInfo>>) -> Option<ExitInfo> {
    loop {
        let current = *exit_rx.borrow_and_update();
        if current.is_some() {
            return current;
        }
        if exit_rx.changed().await.is_err() {
            let last = *exit_rx.borrow();
            return last;
        }
    }
}

/// Gracefully terminate the current run, escalating to SIGKILL
///
/// Returns the exit of the run, or `None` when there was no child.
async fn terminate(process: &ManagedProcess) -> Result<Option<ExitInfo>> {
    let (Some(pid), Some(mut exit_rx)) = (process.pid, process.exit_rx.clone()) else {
        return Ok(None);
    };

    let already_gone = *exit_rx.borrow();
    if already_gone.is_some() {
        return Ok(already_gone);
    }

    let name = &process.spec.name;
    let kill_timeout = process.spec.kill_timeout;

    debug!(app = %name, pid, "Sending {:?}", process.spec.stop_signal);
    send_signal(pid, process.spec.stop_signal)
        .map_err(|e| TetherError::StopError(name.clone(), e.to_string()))?;

    if let Ok(exit) = timeout(kill_timeout, wait_exit(&mut exit_rx)).await {
        return Ok(exit);
    }

    warn!(
        app = %name,
        pid,
        "Process did not exit within {:?}, sending SIGKILL",
        kill_timeout
    );
    send_signal(pid, Signal::SIGKILL)
        .map_err(|e| TetherError::StopError(name.clone(), e.to_string()))?;

    timeout(kill_timeout, wait_exit(&mut exit_rx))
        .await
        .map_err(|_| {
            TetherError::StopError(name.clone(), format!("PID {} survived SIGKILL", pid))
        })
}

fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(TetherError::SignalError(format!(
            "Failed to send {:?} to PID {}: {}",
            signal, pid, e
        ))),
    }
}

/// Returns whether the instance had anything to stop
async fn stop_slot(slot: &InstanceSlot) -> Result<bool> {
    let mut process = slot.process.lock().await;

    match process.state {
        ProcessState::Stopped => return Ok(false),
        ProcessState::Restarting if process.pid.is_none() => {
            // Pending backoff; the bump makes the scheduled RestartDue stale
            process.generation += 1;
            process.mark_stopped(StopReason::Requested);
            return Ok(true);
        }
        _ => {}
    }

    process.mark_stopping();
    let exit = terminate(&process).await?;

    process.generation += 1;
    if let Some(exit) = exit {
        process.mark_exited(exit);
    }
    process.mark_stopped(StopReason::Requested);
    store_usage(&slot.usage, None);

    info!(app = %process.spec.name, instance = process.instance, "Process stopped");
    Ok(true)
}

async fn restart_slot(group: &AppGroup, slot: &InstanceSlot) -> Result<u32> {
    let mut process = slot.process.lock().await;
    group.ensure_active()?;

    if process.state.is_live() {
        process.mark_restarting();
        if let Some(exit) = terminate(&process).await? {
            process.mark_exited(exit);
        }
    }

    process.tracker.reset();
    let pid = launch(&mut process, &slot.usage, &group.ctx)?;
    process.record_restart();
    Ok(pid)
}

/// Take a group out of service: no further launches, every instance stopped
///
/// The caller has already removed the group from the app map.
async fn retire(group: &AppGroup) -> Result<usize> {
    group.retired.store(true, Ordering::SeqCst);

    let mut stopped = 0;
    let mut first_error = None;
    for slot in &group.slots {
        match stop_slot(slot).await {
            Ok(true) => stopped += 1,
            Ok(false) => {}
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    group.abort();

    match first_error {
        Some(e) => Err(e),
        None => Ok(stopped),
    }
}

fn schedule(
    events: &mpsc::UnboundedSender<SupervisorEvent>,
    delay: Duration,
    event: SupervisorEvent,
) {
    let events = events.clone();
    tokio::spawn(async move {
        sleep(delay).await;
        let _ = events.send(event);
    });
}

/// Serve one app's events until the group is dropped
async fn control_loop(
    app: String,
    slots: Vec<Arc<InstanceSlot>>,
    ctx: LaunchContext,
    mut events: mpsc::UnboundedReceiver<SupervisorEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(slot) = slots.get(event.instance()) else {
            continue;
        };

        let mut process = slot.process.lock().await;
        if process.generation != event.generation() {
            debug!(app = %app, ?event, "Dropping stale event");
            continue;
        }

        match event {
            SupervisorEvent::Alive { .. } => {
                if process.state == ProcessState::Starting {
                    process.mark_running();
                }
            }
            SupervisorEvent::Exited { exit, .. } => {
                handle_exit(&mut process, slot, &ctx, exit);
            }
            SupervisorEvent::RestartDue { .. } => {
                if process.state == ProcessState::Restarting
                    && launch(&mut process, &slot.usage, &ctx).is_ok()
                {
                    process.record_restart();
                }
            }
            SupervisorEvent::MemoryBreach {
                instance,
                generation,
                usage,
            } => {
                let active = matches!(
                    process.state,
                    ProcessState::Starting | ProcessState::Running
                );
                let Some(pid) = process.pid.filter(|_| active && !process.breach_pending) else {
                    continue;
                };

                warn!(
                    app = %app,
                    instance,
                    pid,
                    "Memory usage {} bytes exceeds limit, restarting",
                    usage
                );
                process.breach_pending = true;
                if let Err(e) = send_signal(pid, process.spec.stop_signal) {
                    error!(app = %app, instance, "{}", e);
                }
                schedule(
                    &ctx.events,
                    process.spec.kill_timeout,
                    SupervisorEvent::ForceKill {
                        instance,
                        generation,
                    },
                );
            }
            SupervisorEvent::ForceKill { instance, .. } => {
                if let (true, Some(pid)) = (process.breach_pending, process.pid) {
                    warn!(app = %app, instance, pid, "Process ignored stop signal, sending SIGKILL");
                    if let Err(e) = send_signal(pid, Signal::SIGKILL) {
                        error!(app = %app, instance, "{}", e);
                    }
                }
            }
        }
    }
}

/// Route an unrequested exit through the restart policy
fn handle_exit(process: &mut ManagedProcess, slot: &InstanceSlot, ctx: &LaunchContext, exit: ExitInfo) {
    match process.state {
        ProcessState::Starting | ProcessState::Running => {}
        ProcessState::Stopping => {
            // A stop that failed to signal still sees the exit
            process.mark_exited(exit);
            process.mark_stopped(StopReason::Requested);
            return;
        }
        _ => return,
    }

    let uptime = process.uptime();
    let app = process.spec.name.clone();
    let instance = process.instance;

    process.mark_exited(exit);
    store_usage(&slot.usage, None);

    let failures = process
        .tracker
        .record_exit(uptime, process.spec.restart.min_uptime);
    let policy = RestartPolicy::from_spec(&process.spec);

    warn!(
        app = %app,
        instance,
        "Process exited with {} after {:?} ({} consecutive failure(s))",
        exit,
        uptime,
        failures
    );

    match policy.decide(failures) {
        RestartDecision::GiveUp if !policy.enabled => {
            info!(app = %app, instance, "Autorestart disabled, leaving stopped");
            process.mark_stopped(StopReason::Exited);
        }
        RestartDecision::GiveUp => {
            error!(
                app = %app,
                instance,
                "Giving up after {} consecutive failures, failed permanently",
                failures
            );
            process.mark_stopped(StopReason::GaveUp);
        }
        RestartDecision::RestartNow => {
            process.mark_restarting();
            // A failed launch is already logged and leaves the instance stopped
            if launch(process, &slot.usage, ctx).is_ok() {
                process.record_restart();
            }
        }
        RestartDecision::RestartAfter(delay) => {
            info!(app = %app, instance, "Restarting in {:?}", delay);
            process.mark_restarting();
            schedule(
                &ctx.events,
                delay,
                SupervisorEvent::RestartDue {
                    instance,
                    generation: process.generation,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            start_grace: Duration::from_millis(50),
            sample_interval: Duration::from_millis(50),
            sample_timeout: Duration::from_millis(500),
        }
    }

    fn shell_app(dir: &TempDir, name: &str, body: &str) -> AppSpec {
        let script = dir.path().join(format!("{}.sh", name));
        fs::write(&script, body).unwrap();

        let mut spec = AppSpec::new(name, script);
        spec.interpreter = Some(PathBuf::from("/bin/sh"));
        spec.cwd = dir.path().to_path_buf();
        spec.kill_timeout = Duration::from_millis(500);
        spec
    }

    #[test]
    fn test_event_accessors() {
        let event = SupervisorEvent::MemoryBreach {
            instance: 3,
            generation: 9,
            usage: 1,
        };
        assert_eq!(event.instance(), 3);
        assert_eq!(event.generation(), 9);
    }

    #[tokio::test]
    async fn test_unknown_app() {
        let supervisor = Supervisor::new(settings());
        assert!(matches!(
            supervisor.stop("ghost").await,
            Err(TetherError::AppNotFound(_))
        ));
        assert!(matches!(
            supervisor.status("ghost").await,
            Err(TetherError::AppNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_start_reports_starting_then_running() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(settings());

        let started = supervisor
            .start(shell_app(&dir, "sleeper", "exec sleep 30\n"))
            .await
            .unwrap();
        assert_eq!(started, 1);

        let status = supervisor.status("sleeper").await.unwrap();
        assert!(matches!(
            status[0].state,
            ProcessState::Starting | ProcessState::Running
        ));
        assert!(status[0].pid.is_some());

        sleep(Duration::from_millis(300)).await;
        let status = supervisor.status("sleeper").await.unwrap();
        assert_eq!(status[0].state, ProcessState::Running);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_twice_is_already_running() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(settings());
        let spec = shell_app(&dir, "twice", "exec sleep 30\n");

        supervisor.start(spec.clone()).await.unwrap();
        assert!(matches!(
            supervisor.start(spec).await,
            Err(TetherError::AlreadyRunning(_))
        ));

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(settings());
        supervisor
            .start(shell_app(&dir, "idem", "exec sleep 30\n"))
            .await
            .unwrap();

        assert_eq!(supervisor.stop("idem").await.unwrap(), 1);
        assert_eq!(supervisor.stop("idem").await.unwrap(), 0);

        let status = supervisor.status("idem").await.unwrap();
        assert_eq!(status[0].state, ProcessState::Stopped);
        assert_eq!(status[0].stop_reason, Some(StopReason::Requested));
        assert_eq!(status[0].pid, None);
    }

    #[tokio::test]
    async fn test_restart_counts_and_replaces_pid() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(settings());
        supervisor
            .start(shell_app(&dir, "again", "exec sleep 30\n"))
            .await
            .unwrap();
        let before = supervisor.status("again").await.unwrap()[0].pid;

        supervisor.restart("again").await.unwrap();

        let after = supervisor.status("again").await.unwrap();
        assert_eq!(after[0].restarts, 1);
        assert!(after[0].pid.is_some());
        assert_ne!(after[0].pid, before);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_stopped() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(settings());
        let mut spec = shell_app(&dir, "broken", "true\n");
        spec.interpreter = Some(dir.path().join("no-such-interpreter"));

        assert!(matches!(
            supervisor.start(spec).await,
            Err(TetherError::SpawnError(_))
        ));

        let status = supervisor.status("broken").await.unwrap();
        assert_eq!(status[0].state, ProcessState::Stopped);
        assert!(matches!(
            status[0].stop_reason,
            Some(StopReason::SpawnFailed(_))
        ));
        assert_eq!(status[0].restarts, 0);
    }

    #[tokio::test]
    async fn test_multiple_instances_sorted_in_status_all() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(settings());
        let mut spec = shell_app(&dir, "workers", "exec sleep 30\n");
        spec.instances = 3;

        assert_eq!(supervisor.start(spec).await.unwrap(), 3);

        let all = supervisor.status_all().await;
        let instances: Vec<usize> = all.iter().map(|s| s.instance).collect();
        assert_eq!(instances, vec![0, 1, 2]);
        assert_eq!(supervisor.app_names().await, vec!["workers".to_string()]);

        supervisor.shutdown().await;
        assert!(supervisor.status_all().await.is_empty());
    }
}
