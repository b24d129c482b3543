use crate::config::AppSpec;
use crate::process::restart::RestartTracker;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Starting,
    Running,
    Restarting,
    Stopping,
    Stopped,
}

impl ProcessState {
    /// Whether a child process may currently exist for this state
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ProcessState::Starting | ProcessState::Running | ProcessState::Stopping
        )
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Restarting => write!(f, "restarting"),
            ProcessState::Stopping => write!(f, "stopping"),
            ProcessState::Stopped => write!(f, "stopped"),
        }
    }
}

/// How a child terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }

    /// Exit whose status could not be collected
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit"),
        }
    }
}

/// Why an instance ended up in `Stopped`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// `stop` was called
    Requested,
    /// The child exited and autorestart is off
    Exited,
    /// The restart policy gave up
    GaveUp,
    /// The child could not be launched
    SpawnFailed(String),
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Requested => write!(f, "stopped by request"),
            StopReason::Exited => write!(f, "exited"),
            StopReason::GaveUp => write!(f, "failed permanently"),
            StopReason::SpawnFailed(msg) => write!(f, "spawn failed: {}", msg),
        }
    }
}

/// Point-in-time view of one instance, safe to hand to observers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub name: String,
    pub instance: usize,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub restarts: u32,
    pub started_at: Option<SystemTime>,
    pub last_restart: Option<SystemTime>,
    pub last_exit: Option<ExitInfo>,
    pub stop_reason: Option<StopReason>,
    pub memory: Option<u64>,
    pub cpu: Option<f32>,
}

impl InstanceStatus {
    pub fn uptime(&self) -> Duration {
        match (self.state.is_live(), self.started_at) {
            (true, Some(started)) => SystemTime::now()
                .duration_since(started)
                .unwrap_or(Duration::from_secs(0)),
            _ => Duration::from_secs(0),
        }
    }

    /// True once the restart policy has given up on this instance
    pub fn failed_permanently(&self) -> bool {
        self.state == ProcessState::Stopped && self.stop_reason == Some(StopReason::GaveUp)
    }
}

/// Supervisor-owned record of one instance; always accessed under its lock
#[derive(Debug)]
pub struct ManagedProcess {
    pub instance: usize,
    pub spec: Arc<AppSpec>,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub started_at: Option<SystemTime>,
    pub restarts: u32,
    pub last_restart: Option<SystemTime>,
    pub last_exit: Option<ExitInfo>,
    pub stop_reason: Option<StopReason>,
    /// Bumped on every spawn and stop; events tagged with an older value are stale
    pub generation: u64,
    /// A memory breach was acted on and the exit is pending
    pub breach_pending: bool,
    pub tracker: RestartTracker,
    pub(crate) exit_rx: Option<watch::Receiver<Option<ExitInfo>>>,
    started_instant: Option<Instant>,
    status_tx: watch::Sender<InstanceStatus>,
}

impl ManagedProcess {
    /// Create a stopped record and the receiver its snapshots are published on
    pub fn new(spec: Arc<AppSpec>, instance: usize) -> (Self, watch::Receiver<InstanceStatus>) {
        let initial = InstanceStatus {
            name: spec.name.clone(),
            instance,
            state: ProcessState::Stopped,
            pid: None,
            restarts: 0,
            started_at: None,
            last_restart: None,
            last_exit: None,
            stop_reason: None,
            memory: None,
            cpu: None,
        };
        let (status_tx, status_rx) = watch::channel(initial);

        let process = Self {
            instance,
            spec,
            state: ProcessState::Stopped,
            pid: None,
            started_at: None,
            restarts: 0,
            last_restart: None,
            last_exit: None,
            stop_reason: None,
            generation: 0,
            breach_pending: false,
            tracker: RestartTracker::new(),
            exit_rx: None,
            started_instant: None,
            status_tx,
        };

        (process, status_rx)
    }

    /// Time since the current run was spawned
    pub fn uptime(&self) -> Duration {
        self.started_instant
            .map(|started| started.elapsed())
            .unwrap_or(Duration::from_secs(0))
    }

    pub(crate) fn mark_starting(&mut self, pid: u32, exit_rx: watch::Receiver<Option<ExitInfo>>) {
        self.state = ProcessState::Starting;
        self.pid = Some(pid);
        self.exit_rx = Some(exit_rx);
        self.started_at = Some(SystemTime::now());
        self.started_instant = Some(Instant::now());
        self.stop_reason = None;
        self.breach_pending = false;
        self.publish();
    }

    pub(crate) fn mark_running(&mut self) {
        self.state = ProcessState::Running;
        self.publish();
    }

    pub(crate) fn mark_restarting(&mut self) {
        self.state = ProcessState::Restarting;
        self.publish();
    }

    pub(crate) fn mark_stopping(&mut self) {
        self.state = ProcessState::Stopping;
        self.publish();
    }

    pub(crate) fn mark_exited(&mut self, exit: ExitInfo) {
        self.pid = None;
        self.exit_rx = None;
        self.last_exit = Some(exit);
        self.breach_pending = false;
    }

    pub(crate) fn mark_stopped(&mut self, reason: StopReason) {
        self.state = ProcessState::Stopped;
        self.pid = None;
        self.exit_rx = None;
        self.started_instant = None;
        self.breach_pending = false;
        self.stop_reason = Some(reason);
        self.publish();
    }

    pub(crate) fn record_restart(&mut self) {
        self.restarts += 1;
        self.last_restart = Some(SystemTime::now());
        self.publish();
    }

    /// Current snapshot without resource usage
    pub fn snapshot(&self) -> InstanceStatus {
        InstanceStatus {
            name: self.spec.name.clone(),
            instance: self.instance,
            state: self.state,
            pid: self.pid,
            restarts: self.restarts,
            started_at: self.started_at,
            last_restart: self.last_restart,
            last_exit: self.last_exit,
            stop_reason: self.stop_reason.clone(),
            memory: None,
            cpu: None,
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process() -> (ManagedProcess, watch::Receiver<InstanceStatus>) {
        ManagedProcess::new(Arc::new(AppSpec::new("demo", "/bin/sh")), 0)
    }

    #[test]
    fn test_new_process_is_stopped() {
        let (process, status) = process();
        assert_eq!(process.state, ProcessState::Stopped);
        assert_eq!(process.generation, 0);
        assert_eq!(status.borrow().state, ProcessState::Stopped);
        assert_eq!(status.borrow().name, "demo");
    }

    #[tokio::test]
    async fn test_transitions_are_published() {
        let (mut process, status) = process();
        let (_exit_tx, exit_rx) = watch::channel(None);

        process.mark_starting(4242, exit_rx);
        assert_eq!(status.borrow().state, ProcessState::Starting);
        assert_eq!(status.borrow().pid, Some(4242));

        process.mark_running();
        assert_eq!(status.borrow().state, ProcessState::Running);

        process.mark_stopped(StopReason::GaveUp);
        let snapshot = status.borrow().clone();
        assert_eq!(snapshot.state, ProcessState::Stopped);
        assert_eq!(snapshot.pid, None);
        assert!(snapshot.failed_permanently());
    }

    #[test]
    fn test_record_restart() {
        let (mut process, status) = process();
        process.record_restart();
        process.record_restart();
        assert_eq!(process.restarts, 2);
        assert!(process.last_restart.is_some());
        assert_eq!(status.borrow().restarts, 2);
    }

    #[test]
    fn test_exit_info_display() {
        let by_code = ExitInfo {
            code: Some(1),
            signal: None,
        };
        let by_signal = ExitInfo {
            code: None,
            signal: Some(9),
        };
        assert_eq!(by_code.to_string(), "exit code 1");
        assert_eq!(by_signal.to_string(), "signal 9");
        assert_eq!(ExitInfo::unknown().to_string(), "unknown exit");
    }

    #[test]
    fn test_state_liveness() {
        assert!(ProcessState::Starting.is_live());
        assert!(ProcessState::Running.is_live());
        assert!(ProcessState::Stopping.is_live());
        assert!(!ProcessState::Restarting.is_live());
        assert!(!ProcessState::Stopped.is_live());
    }
}
