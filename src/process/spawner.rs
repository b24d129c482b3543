use crate::config::AppSpec;
use crate::error::{Result, TetherError};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Environment variable carrying the app name into the child
pub const APP_NAME_ENV: &str = "TETHER_APP_NAME";

/// Environment variable carrying the instance index into the child
pub const INSTANCE_ENV: &str = "TETHER_INSTANCE";

/// Metadata returned when spawning a process
#[derive(Debug)]
pub struct SpawnedProcess {
    /// The child process handle
    pub child: Child,

    /// Process ID assigned by the OS
    pub pid: u32,
}

/// Build the launch command for one instance of an app
///
/// With an interpreter the command is `interpreter script args...`,
/// otherwise the script is executed directly.
pub fn build_command(spec: &AppSpec, instance: usize) -> Command {
    let mut command = match spec.interpreter {
        Some(ref interpreter) => {
            let mut command = Command::new(interpreter);
            command.arg(&spec.script);
            command
        }
        None => Command::new(&spec.script),
    };

    command
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .envs(&spec.env)
        .env(APP_NAME_ENV, &spec.name)
        .env(INSTANCE_ENV, instance.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    command
}

/// Spawn one instance of an app and start forwarding its output
pub fn spawn_process(spec: &AppSpec, instance: usize) -> Result<SpawnedProcess> {
    if !spec.script.exists() {
        return Err(TetherError::SpawnError(format!(
            "Script does not exist: {}",
            spec.script.display()
        )));
    }

    let mut child = build_command(spec, instance).spawn().map_err(|e| {
        let program = spec.interpreter.as_ref().unwrap_or(&spec.script);
        TetherError::SpawnError(format!(
            "Failed to launch '{}' for app '{}': {}",
            program.display(),
            spec.name,
            e
        ))
    })?;

    let pid = child.id().ok_or_else(|| {
        TetherError::SpawnError(format!("Failed to get PID for app '{}'", spec.name))
    })?;

    forward_output(&mut child, &spec.name, instance);

    Ok(SpawnedProcess { child, pid })
}

/// Relay child stdout/stderr lines into the log
fn forward_output(child: &mut Child, app: &str, instance: usize) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(relay_lines(stdout, app.to_string(), instance, false));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(relay_lines(stderr, app.to_string(), instance, true));
    }
}

async fn relay_lines<R>(reader: R, app: String, instance: usize, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if is_stderr => {
                warn!(target: "tether::child", app = %app, instance, "{}", line)
            }
            Ok(Some(line)) => info!(target: "tether::child", app = %app, instance, "{}", line),
            Ok(None) => break,
            Err(e) => {
                warn!(app = %app, instance, "stopped reading child output: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn shell_app(dir: &TempDir, name: &str, body: &str) -> AppSpec {
        let script = dir.path().join(format!("{}.sh", name));
        fs::write(&script, body).unwrap();

        let mut spec = AppSpec::new(name, script);
        spec.interpreter = Some(PathBuf::from("/bin/sh"));
        spec.cwd = dir.path().to_path_buf();
        spec
    }

    #[tokio::test]
    async fn test_spawn_with_interpreter() {
        let dir = TempDir::new().unwrap();
        let spec = shell_app(&dir, "echo", "echo hello\n");

        let mut spawned = spawn_process(&spec, 0).unwrap();
        assert!(spawned.pid > 0);

        let status = spawned.child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_spawn_passes_env_and_cwd() {
        let dir = TempDir::new().unwrap();
        let mut spec = shell_app(
            &dir,
            "env",
            "[ \"$PORT\" = 5000 ] && [ \"$TETHER_INSTANCE\" = 2 ] && [ \"$TETHER_APP_NAME\" = env ] && [ -f env.sh ]\n",
        );
        spec.env.insert("PORT".to_string(), "5000".to_string());

        let mut spawned = spawn_process(&spec, 2).unwrap();
        let status = spawned.child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_spawn_passes_args() {
        let dir = TempDir::new().unwrap();
        let mut spec = shell_app(&dir, "args", "[ \"$1\" = --port ] && [ \"$2\" = 80 ]\n");
        spec.args = vec!["--port".to_string(), "80".to_string()];

        let mut spawned = spawn_process(&spec, 0).unwrap();
        let status = spawned.child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_spawn_nonexistent_script() {
        let dir = TempDir::new().unwrap();
        let mut spec = shell_app(&dir, "gone", "true\n");
        spec.script = dir.path().join("missing.sh");

        match spawn_process(&spec, 0) {
            Err(TetherError::SpawnError(msg)) => assert!(msg.contains("does not exist")),
            other => panic!("Expected SpawnError, got {:?}", other.map(|s| s.pid)),
        }
    }

    #[tokio::test]
    async fn test_spawn_missing_interpreter() {
        let dir = TempDir::new().unwrap();
        let mut spec = shell_app(&dir, "interp", "true\n");
        spec.interpreter = Some(dir.path().join("venv/bin/python"));

        let result = spawn_process(&spec, 0);
        assert!(matches!(result, Err(TetherError::SpawnError(_))));
    }

    #[test]
    fn test_build_command_without_interpreter() {
        let spec = AppSpec::new("direct", "/usr/bin/true");
        let command = build_command(&spec, 0);
        assert_eq!(command.as_std().get_program(), "/usr/bin/true");
    }

    #[test]
    fn test_build_command_with_interpreter() {
        let mut spec = AppSpec::new("py", "/srv/app/wsgi.py");
        spec.interpreter = Some(PathBuf::from("python3"));
        spec.args = vec!["--debug".to_string()];

        let command = build_command(&spec, 0);
        let std_command = command.as_std();
        assert_eq!(std_command.get_program(), "python3");
        let args: Vec<_> = std_command.get_args().collect();
        assert_eq!(args, vec!["/srv/app/wsgi.py", "--debug"]);
    }
}
