// IPC Server - Accepts CLI connections and dispatches their commands

use crate::error::{Result, TetherError};
use crate::ipc::{Command, Request, Response, ResponseData, DEFAULT_SOCKET_PATH};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

/// IPC server bound to a Unix socket
pub struct IpcServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
}

impl IpcServer {
    pub fn new() -> Self {
        Self::with_socket_path(DEFAULT_SOCKET_PATH)
    }

    pub fn with_socket_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            socket_path: path.as_ref().to_path_buf(),
            listener: None,
        }
    }

    /// Bind the socket, replacing a stale socket file
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| {
                TetherError::IpcError(format!("Failed to remove existing socket: {}", e))
            })?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| TetherError::IpcError(format!("Failed to bind to socket: {}", e)))?;

        // Owner only
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, permissions).map_err(|e| {
                TetherError::IpcError(format!("Failed to set socket permissions: {}", e))
            })?;
        }

        self.listener = Some(listener);
        Ok(())
    }

    /// Accept connections forever, one task per connection
    ///
    /// # Arguments
    /// * `handler` - Turns a command into response data; its errors are sent
    ///   back to the client as the response's error message
    pub async fn run<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(Command) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResponseData>> + Send,
    {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| TetherError::IpcError("Server not started".to_string()))?;
        let handler = Arc::new(handler);

        loop {
            let stream = match listener.accept().await {
                Ok((stream, _addr)) => stream,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, handler.as_ref()).await {
                    warn!("IPC connection failed: {}", e);
                }
            });
        }
    }

    /// Release the listener and remove the socket file
    pub fn stop(&mut self) -> Result<()> {
        self.listener = None;

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| {
                TetherError::IpcError(format!("Failed to remove socket file: {}", e))
            })?;
        }

        Ok(())
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Default for IpcServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

async fn serve_connection<F, Fut>(stream: UnixStream, handler: &F) -> Result<()>
where
    F: Fn(Command) -> Fut,
    Fut: Future<Output = Result<ResponseData>>,
{
    let (read_half, mut write_half) = stream.into_split();

    let mut request_line = String::new();
    BufReader::new(read_half)
        .read_line(&mut request_line)
        .await
        .map_err(|e| TetherError::IpcError(format!("Failed to read request: {}", e)))?;

    let request: Request = serde_json::from_str(&request_line).map_err(|e| {
        TetherError::DeserializationError(format!("Failed to deserialize request: {}", e))
    })?;
    debug!(id = request.id, command = ?request.command, "IPC request");

    let response = match handler(request.command).await {
        Ok(data) => Response::success(request.id, data),
        Err(e) => Response::error(request.id, e.to_string()),
    };

    let mut response_json = serde_json::to_string(&response).map_err(|e| {
        TetherError::SerializationError(format!("Failed to serialize response: {}", e))
    })?;
    response_json.push('\n');

    write_half
        .write_all(response_json.as_bytes())
        .await
        .map_err(|e| TetherError::IpcError(format!("Failed to write response: {}", e)))?;
    write_half
        .flush()
        .await
        .map_err(|e| TetherError::IpcError(format!("Failed to flush stream: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::IpcClient;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_server_start_stop() {
        let dir = TempDir::new().unwrap();
        let socket_path = dir.path().join("tether.sock");
        let mut server = IpcServer::with_socket_path(&socket_path);

        server.start().unwrap();
        assert!(socket_path.exists());

        server.stop().unwrap();
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_server_cleanup_on_drop() {
        let dir = TempDir::new().unwrap();
        let socket_path = dir.path().join("drop.sock");
        {
            let mut server = IpcServer::with_socket_path(&socket_path);
            server.start().unwrap();
            assert!(socket_path.exists());
        }
        assert!(!socket_path.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_round_trip_with_blocking_client() {
        let dir = TempDir::new().unwrap();
        let socket_path = dir.path().join("round.sock");
        let mut server = IpcServer::with_socket_path(&socket_path);
        server.start().unwrap();

        let serving = tokio::spawn(async move {
            server
                .run(|command| async move {
                    match command {
                        Command::Stop { name } => Ok(ResponseData::Stopped { name, instances: 2 }),
                        Command::Start { name } => Err(TetherError::AppNotFound(name)),
                        _ => Err(TetherError::IpcError("unexpected".to_string())),
                    }
                })
                .await
        });

        let path = socket_path.clone();
        let (stopped, missing) = tokio::task::spawn_blocking(move || {
            let client = IpcClient::with_socket_path(&path);
            (
                client.request(Command::Stop {
                    name: "api".to_string(),
                }),
                client.request(Command::Start {
                    name: "ghost".to_string(),
                }),
            )
        })
        .await
        .unwrap();

        match stopped {
            Ok(ResponseData::Stopped { name, instances }) => {
                assert_eq!(name, "api");
                assert_eq!(instances, 2);
            }
            other => panic!("Expected Stopped, got {:?}", other),
        }
        match missing {
            Err(TetherError::IpcError(msg)) => assert!(msg.contains("App not found: ghost")),
            other => panic!("Expected IpcError, got {:?}", other),
        }

        serving.abort();
    }
}
