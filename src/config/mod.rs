mod raw;

pub use raw::parse_memory_size;

use crate::error::{Result, TetherError};
use nix::sys::signal::Signal;
use raw::{app_entries, CountValue, RawApp, SizeValue};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Upper bound on instances per app
pub const MAX_INSTANCES: usize = 100;

/// Thresholds consumed by the restart policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartSettings {
    /// Consecutive failures tolerated before giving up
    pub max_restarts: u32,
    /// A run lasting at least this long resets the failure streak
    pub min_uptime: Duration,
    /// Consecutive failures restarted immediately before backoff kicks in
    pub backoff_threshold: u32,
    /// First backoff delay
    pub backoff_base: Duration,
    /// Backoff ceiling
    pub backoff_cap: Duration,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            max_restarts: 16,
            min_uptime: Duration::from_millis(1000),
            backoff_threshold: 3,
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_millis(15_000),
        }
    }
}

/// Validated specification of one app (instance set)
#[derive(Debug, Clone, PartialEq)]
pub struct AppSpec {
    /// Unique instance-set identifier
    pub name: String,

    /// Entry point, resolved against `cwd`
    pub script: PathBuf,

    /// Executable used to run `script`; `None` runs the script directly
    pub interpreter: Option<PathBuf>,

    /// Extra arguments passed after the script
    pub args: Vec<String>,

    /// Working directory of the children
    pub cwd: PathBuf,

    /// Desired concurrent process count
    pub instances: usize,

    /// Whether exits are routed to the restart policy
    pub autorestart: bool,

    /// Accepted for compatibility, no effect
    pub watch: bool,

    /// Memory ceiling in bytes
    pub max_memory: Option<u64>,

    /// Environment injected into the children
    pub env: BTreeMap<String, String>,

    /// Signal sent on graceful stop
    pub stop_signal: Signal,

    /// Grace period between the stop signal and SIGKILL
    pub kill_timeout: Duration,

    pub restart: RestartSettings,
}

impl AppSpec {
    /// Create a spec with every optional field at its default
    pub fn new(name: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            interpreter: None,
            args: Vec::new(),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            instances: 1,
            autorestart: true,
            watch: false,
            max_memory: None,
            env: BTreeMap::new(),
            stop_signal: Signal::SIGTERM,
            kill_timeout: Duration::from_millis(1600),
            restart: RestartSettings::default(),
        }
    }

    /// Validate the app definition, naming the offending field on failure
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(TetherError::config("name", "must not be empty"));
        }

        if self.script.as_os_str().is_empty() {
            return Err(TetherError::config("script", "must not be empty"));
        }

        if !self.script.is_file() {
            return Err(TetherError::config(
                "script",
                format!("cannot resolve {}", self.script.display()),
            ));
        }

        if self.instances == 0 {
            return Err(TetherError::config(
                "instances",
                "must be a positive integer",
            ));
        }

        if self.instances > MAX_INSTANCES {
            return Err(TetherError::config(
                "instances",
                format!("cannot exceed {}", MAX_INSTANCES),
            ));
        }

        if !self.cwd.is_dir() {
            return Err(TetherError::config(
                "cwd",
                format!("not a directory: {}", self.cwd.display()),
            ));
        }

        if self.max_memory == Some(0) {
            return Err(TetherError::config(
                "max_memory_restart",
                "must be greater than zero",
            ));
        }

        if self.restart.max_restarts == 0 {
            return Err(TetherError::config("max_restarts", "must be at least 1"));
        }

        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(TetherError::config(
                    "env",
                    format!("invalid variable name: '{}'", key),
                ));
            }
        }

        Ok(())
    }

    /// Build a spec from a descriptor entry; relative paths resolve against `base_dir`
    fn from_raw(raw: RawApp, base_dir: &Path) -> Result<Self> {
        let defaults = RestartSettings::default();

        let cwd = match raw.cwd {
            Some(ref cwd) => resolve(base_dir, &expand("cwd", cwd)?),
            None => base_dir.to_path_buf(),
        };

        let script = if raw.script.trim().is_empty() {
            PathBuf::new()
        } else {
            resolve(&cwd, &expand("script", &raw.script)?)
        };

        let interpreter = match raw.interpreter.as_deref().map(str::trim) {
            None | Some("") | Some("none") => None,
            Some(interp) => {
                let expanded = expand("interpreter", interp)?;
                if expanded.contains('/') || expanded.contains('\\') {
                    Some(resolve(&cwd, &expanded))
                } else {
                    // Bare names are looked up on PATH at spawn time
                    Some(PathBuf::from(expanded))
                }
            }
        };

        let instances = match raw.instances {
            None => 1,
            Some(value) => parse_instances(&value)?,
        };

        let max_memory = match raw.max_memory_restart {
            None => None,
            Some(SizeValue::Bytes(bytes)) => Some(bytes),
            Some(SizeValue::Text(text)) => Some(parse_memory_size(&text)?),
        };

        let mut env = BTreeMap::new();
        for (key, value) in &raw.env {
            let rendered = value.render();
            let expanded = shellexpand::env(&rendered)
                .map_err(|e| TetherError::config("env", format!("{}: {}", key, e)))?;
            env.insert(key.clone(), expanded.into_owned());
        }

        let stop_signal = match raw.stop_signal {
            Some(ref name) => parse_signal(name)?,
            None => Signal::SIGTERM,
        };

        let watch = raw.watch.map(|w| w.enabled()).unwrap_or(false);
        if watch {
            warn!(app = %raw.name, "watch mode is not supported, flag ignored");
        }

        let restart = RestartSettings {
            max_restarts: to_u32("max_restarts", raw.max_restarts, defaults.max_restarts)?,
            min_uptime: raw
                .min_uptime
                .map(Duration::from_millis)
                .unwrap_or(defaults.min_uptime),
            backoff_threshold: to_u32(
                "backoff_threshold",
                raw.backoff_threshold,
                defaults.backoff_threshold,
            )?,
            backoff_base: raw
                .exp_backoff_restart_delay
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_base),
            backoff_cap: raw
                .max_backoff_delay
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_cap),
        };

        let spec = AppSpec {
            name: raw.name.trim().to_string(),
            script,
            interpreter,
            args: raw.args.map(|a| a.into_vec()).unwrap_or_default(),
            cwd,
            instances,
            autorestart: raw.autorestart.unwrap_or(true),
            watch,
            max_memory,
            env,
            stop_signal,
            kill_timeout: raw
                .kill_timeout
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_millis(1600)),
            restart,
        };

        spec.validate()?;
        Ok(spec)
    }
}

/// An app entry that failed validation
#[derive(Debug)]
pub struct RejectedApp {
    /// App name, or `#<index>` when the entry has no usable name
    pub name: String,
    pub error: TetherError,
}

/// Descriptor file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorFormat {
    Json,
    Toml,
}

impl DescriptorFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|s| s.to_str()).unwrap_or("") {
            "json" => Ok(DescriptorFormat::Json),
            "toml" => Ok(DescriptorFormat::Toml),
            other => Err(TetherError::InvalidConfig(format!(
                "Unsupported file format: '{}'. Use .toml or .json",
                other
            ))),
        }
    }
}

/// A loaded descriptor: the valid apps plus the entries that were rejected
#[derive(Debug)]
pub struct Descriptor {
    pub apps: Vec<AppSpec>,
    pub rejected: Vec<RejectedApp>,
}

impl Descriptor {
    /// Load a descriptor file (TOML or JSON)
    ///
    /// Read and parse failures are fatal; an app that fails validation is
    /// rejected without affecting the others.
    pub fn load(path: &Path) -> Result<Self> {
        let format = DescriptorFormat::from_path(path)?;

        let contents = std::fs::read_to_string(path).map_err(|e| {
            TetherError::InvalidConfig(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let base_dir = base_dir.canonicalize().unwrap_or(base_dir);

        Self::parse(&contents, format, &base_dir)
    }

    /// Parse descriptor contents; relative paths resolve against `base_dir`
    pub fn parse(contents: &str, format: DescriptorFormat, base_dir: &Path) -> Result<Self> {
        let document = match format {
            DescriptorFormat::Json => parse_json(contents)?,
            DescriptorFormat::Toml => parse_toml(contents)?,
        };
        let entries = app_entries(document)?;

        if entries.is_empty() {
            return Err(TetherError::InvalidConfig(
                "No app configuration found in file".to_string(),
            ));
        }

        let mut apps = Vec::new();
        let mut rejected = Vec::new();
        let mut seen = HashSet::new();

        for (index, entry) in entries.into_iter().enumerate() {
            let label = entry
                .get("name")
                .and_then(serde_json::Value::as_str)
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("#{}", index));

            if !seen.insert(label.clone()) {
                rejected.push(RejectedApp {
                    name: label,
                    error: TetherError::config("name", "duplicate app name"),
                });
                continue;
            }

            match RawApp::from_entry(entry).and_then(|raw| AppSpec::from_raw(raw, base_dir)) {
                Ok(spec) => apps.push(spec),
                Err(error) => rejected.push(RejectedApp { name: label, error }),
            }
        }

        Ok(Self { apps, rejected })
    }

    /// Look up a valid app by name
    pub fn get(&self, name: &str) -> Option<&AppSpec> {
        self.apps.iter().find(|app| app.name == name)
    }
}

fn parse_json(contents: &str) -> Result<serde_json::Value> {
    serde_json::from_str(contents)
        .map_err(|e| TetherError::InvalidConfig(format!("Failed to parse JSON: {}", e)))
}

/// TOML documents are lifted into JSON values so both formats share one entry decoder
fn parse_toml(contents: &str) -> Result<serde_json::Value> {
    let table: toml::Table = toml::from_str(contents)
        .map_err(|e| TetherError::InvalidConfig(format!("Failed to parse TOML: {}", e)))?;

    serde_json::to_value(table)
        .map_err(|e| TetherError::InvalidConfig(format!("Failed to parse TOML: {}", e)))
}

fn parse_instances(value: &CountValue) -> Result<usize> {
    let count = match value {
        CountValue::Number(n) => *n,
        CountValue::Text(text) if text.trim().eq_ignore_ascii_case("max") => {
            return Ok(std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .min(MAX_INSTANCES));
        }
        CountValue::Text(text) => text.trim().parse::<i64>().map_err(|_| {
            TetherError::config("instances", format!("not an integer: '{}'", text))
        })?,
    };

    if count <= 0 {
        return Err(TetherError::config(
            "instances",
            format!("must be a positive integer, got {}", count),
        ));
    }

    usize::try_from(count)
        .map_err(|_| TetherError::config("instances", format!("out of range: {}", count)))
}

/// Parse a signal name, with or without the `SIG` prefix
pub fn parse_signal(name: &str) -> Result<Signal> {
    let upper = name.trim().to_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };

    match full.as_str() {
        "SIGTERM" => Ok(Signal::SIGTERM),
        "SIGINT" => Ok(Signal::SIGINT),
        "SIGQUIT" => Ok(Signal::SIGQUIT),
        "SIGKILL" => Ok(Signal::SIGKILL),
        "SIGHUP" => Ok(Signal::SIGHUP),
        "SIGUSR1" => Ok(Signal::SIGUSR1),
        "SIGUSR2" => Ok(Signal::SIGUSR2),
        _ => Err(TetherError::config(
            "stop_signal",
            format!(
                "invalid signal '{}'. Must be one of: SIGTERM, SIGINT, SIGQUIT, SIGKILL, SIGHUP, SIGUSR1, SIGUSR2",
                name
            ),
        )),
    }
}

fn to_u32(field: &str, value: Option<u64>, default: u32) -> Result<u32> {
    match value {
        None => Ok(default),
        Some(v) => u32::try_from(v)
            .map_err(|_| TetherError::config(field, format!("out of range: {}", v))),
    }
}

/// Expand `~` and `$VAR` / `${VAR}` in a descriptor value
fn expand(field: &str, value: &str) -> Result<String> {
    shellexpand::full(value)
        .map(|s| s.into_owned())
        .map_err(|e| TetherError::config(field, e.to_string()))
}

fn resolve(base: &Path, value: &str) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}
