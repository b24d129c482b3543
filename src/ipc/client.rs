// Blocking client side of the control socket, used by the CLI

use crate::error::{Result, TetherError};
use crate::ipc::{Command, Request, Response, ResponseData, DEFAULT_SOCKET_PATH};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Connection attempts before a busy socket is reported
const CONNECT_ATTEMPTS: u32 = 3;

const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

pub struct IpcClient {
    socket_path: PathBuf,
    next_id: AtomicU64,
}

impl IpcClient {
    pub fn new() -> Self {
        Self::with_socket_path(DEFAULT_SOCKET_PATH)
    }

    pub fn with_socket_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            socket_path: path.as_ref().to_path_buf(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send one command and return the daemon's answer
    ///
    /// A command the daemon rejected comes back as `IpcError` carrying the
    /// daemon's message. Only the connect step is retried; once the request
    /// is written it is never sent twice.
    pub fn request(&self, command: Command) -> Result<ResponseData> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = serde_json::to_string(&Request::new(id, command)).map_err(|e| {
            TetherError::SerializationError(format!("Failed to serialize request: {}", e))
        })?;

        let stream = self.connect_with_retry()?;
        let reply = exchange(stream, &line)?;

        let response: Response = serde_json::from_str(&reply).map_err(|e| {
            TetherError::DeserializationError(format!("Failed to deserialize response: {}", e))
        })?;
        if response.id != id {
            return Err(TetherError::ProtocolError(format!(
                "Response ID mismatch: expected {}, got {}",
                id, response.id
            )));
        }

        response.result.map_err(TetherError::IpcError)
    }

    fn connect_with_retry(&self) -> Result<UnixStream> {
        let mut attempt = 1;
        loop {
            match self.connect() {
                Err(TetherError::ConnectionError(_)) if attempt < CONNECT_ATTEMPTS => {
                    attempt += 1;
                    std::thread::sleep(CONNECT_BACKOFF);
                }
                other => return other,
            }
        }
    }

    /// A missing socket or one nobody listens on means no daemon
    fn connect(&self) -> Result<UnixStream> {
        UnixStream::connect(&self.socket_path).map_err(|e| match e.kind() {
            ErrorKind::NotFound | ErrorKind::ConnectionRefused => TetherError::DaemonNotRunning,
            _ => TetherError::ConnectionError(format!(
                "Failed to connect to {}: {}",
                self.socket_path.display(),
                e
            )),
        })
    }
}

impl Default for IpcClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Write one request line and read back one reply line
fn exchange(mut stream: UnixStream, line: &str) -> Result<String> {
    stream
        .write_all(line.as_bytes())
        .and_then(|_| stream.write_all(b"\n"))
        .and_then(|_| stream.flush())
        .map_err(|e| TetherError::IpcError(format!("Failed to write request: {}", e)))?;

    let mut reply = String::new();
    BufReader::new(stream)
        .read_line(&mut reply)
        .map_err(|e| TetherError::IpcError(format!("Failed to read response: {}", e)))?;

    if reply.trim().is_empty() {
        return Err(TetherError::ProtocolError(
            "Daemon closed the connection without answering".to_string(),
        ));
    }
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::thread;
    use tempfile::TempDir;

    /// Accept one connection, read its request and answer with `reply(id)`
    fn answer_once<F>(listener: UnixListener, reply: F) -> thread::JoinHandle<()>
    where
        F: FnOnce(u64) -> String + Send + 'static,
    {
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let request: Request = serde_json::from_str(&line).unwrap();

            let mut stream = stream;
            stream.write_all(reply(request.id).as_bytes()).unwrap();
        })
    }

    #[test]
    fn test_client_default_path() {
        let client = IpcClient::new();
        assert_eq!(client.socket_path(), Path::new(DEFAULT_SOCKET_PATH));
    }

    #[test]
    fn test_daemon_not_running_error() {
        let dir = TempDir::new().unwrap();
        let client = IpcClient::with_socket_path(dir.path().join("missing.sock"));

        match client.request(Command::Status { name: None }) {
            Err(TetherError::DaemonNotRunning) => {}
            other => panic!("Expected DaemonNotRunning, got: {:?}", other),
        }
    }

    #[test]
    fn test_stale_socket_file_is_daemon_not_running() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stale.sock");
        // Bound then dropped: the file stays but nothing listens
        drop(UnixListener::bind(&path).unwrap());

        let client = IpcClient::with_socket_path(&path);
        assert!(matches!(
            client.request(Command::Reload),
            Err(TetherError::DaemonNotRunning)
        ));
    }

    #[test]
    fn test_request_returns_daemon_answer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ok.sock");
        let server = answer_once(UnixListener::bind(&path).unwrap(), |id| {
            let response = Response {
                id,
                result: Ok(ResponseData::Restarted {
                    name: "api".to_string(),
                    instances: 3,
                }),
            };
            format!("{}\n", serde_json::to_string(&response).unwrap())
        });

        let client = IpcClient::with_socket_path(&path);
        match client.request(Command::Restart {
            name: "api".to_string(),
        }) {
            Ok(ResponseData::Restarted { name, instances }) => {
                assert_eq!(name, "api");
                assert_eq!(instances, 3);
            }
            other => panic!("Expected Restarted, got {:?}", other),
        }
        server.join().unwrap();
    }

    #[test]
    fn test_mismatched_reply_id_is_protocol_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mismatch.sock");
        let server = answer_once(UnixListener::bind(&path).unwrap(), |id| {
            let response = Response {
                id: id + 100,
                result: Err("nope".to_string()),
            };
            format!("{}\n", serde_json::to_string(&response).unwrap())
        });

        let client = IpcClient::with_socket_path(&path);
        assert!(matches!(
            client.request(Command::Reload),
            Err(TetherError::ProtocolError(_))
        ));
        server.join().unwrap();
    }

    #[test]
    fn test_silent_daemon_is_protocol_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("silent.sock");
        let server = answer_once(UnixListener::bind(&path).unwrap(), |_| String::new());

        let client = IpcClient::with_socket_path(&path);
        assert!(matches!(
            client.request(Command::Stop {
                name: "api".to_string()
            }),
            Err(TetherError::ProtocolError(_))
        ));
        server.join().unwrap();
    }
}
