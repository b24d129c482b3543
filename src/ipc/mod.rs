// IPC module - Communication between the CLI and the daemon

pub mod client;
pub mod protocol;
pub mod server;

pub use client::IpcClient;
pub use protocol::{Command, RejectedEntry, Request, Response, ResponseData};
pub use server::IpcServer;

/// Socket path used when neither `--socket` nor `TETHER_SOCKET` is given
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/tether.sock";
