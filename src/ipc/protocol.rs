// IPC Protocol definitions for client-daemon communication
//
// One JSON `Request` line per connection, answered by one JSON `Response` line.

use crate::process::InstanceStatus;
use serde::{Deserialize, Serialize};

/// All available commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Start an app defined in the daemon's descriptor
    Start { name: String },
    Stop { name: String },
    Restart { name: String },
    /// Status of one app, or of every app when `name` is `None`
    Status { name: Option<String> },
    /// Re-read the descriptor and reload every app in it
    Reload,
}

/// A descriptor entry the daemon refused to load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedEntry {
    pub name: String,
    pub error: String,
}

/// Response data variants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseData {
    Started { name: String, instances: usize },
    Stopped { name: String, instances: usize },
    Restarted { name: String, instances: usize },
    Status(Vec<InstanceStatus>),
    Reloaded {
        apps: Vec<String>,
        rejected: Vec<RejectedEntry>,
    },
}

/// Request message from client to daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: Command,
}

/// Response message from daemon to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: Result<ResponseData, String>,
}

impl Request {
    pub fn new(id: u64, command: Command) -> Self {
        Self { id, command }
    }
}

impl Response {
    pub fn success(id: u64, data: ResponseData) -> Self {
        Self {
            id,
            result: Ok(data),
        }
    }

    pub fn error(id: u64, error: String) -> Self {
        Self {
            id,
            result: Err(error),
        }
    }
}
