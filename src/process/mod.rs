// Process module - Supervision of managed children

pub mod monitor;
pub mod restart;
pub mod spawner;
pub mod supervisor;
pub mod types;

pub use monitor::{ResourceMonitor, ResourceSample, ResourceSampler, SysinfoSampler};
pub use restart::{RestartDecision, RestartPolicy, RestartTracker};
pub use spawner::{spawn_process, SpawnedProcess};
pub use supervisor::{Supervisor, SupervisorEvent, SupervisorSettings};
pub use types::{ExitInfo, InstanceStatus, ManagedProcess, ProcessState, StopReason};
