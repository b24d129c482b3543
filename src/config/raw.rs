// Lenient on-disk shapes of an ecosystem descriptor

use crate::error::{Result, TetherError};
use serde::Deserialize;
use std::collections::HashMap;

/// One app entry exactly as written in the descriptor
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct RawApp {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub script: String,
    pub interpreter: Option<String>,
    pub args: Option<ArgsValue>,
    pub cwd: Option<String>,
    pub instances: Option<CountValue>,
    pub autorestart: Option<bool>,
    pub watch: Option<WatchValue>,
    pub max_memory_restart: Option<SizeValue>,
    #[serde(default)]
    pub env: HashMap<String, EnvValue>,
    pub stop_signal: Option<String>,
    pub kill_timeout: Option<u64>,
    pub max_restarts: Option<u64>,
    pub min_uptime: Option<u64>,
    pub backoff_threshold: Option<u64>,
    pub exp_backoff_restart_delay: Option<u64>,
    pub max_backoff_delay: Option<u64>,
}

impl RawApp {
    /// Decode one entry, naming the first field whose value has the wrong shape
    pub fn from_entry(entry: serde_json::Value) -> Result<Self> {
        let Some(fields) = entry.as_object() else {
            return Err(TetherError::config("apps", "app entry must be a table/object"));
        };

        match serde_json::from_value::<RawApp>(entry.clone()) {
            Ok(raw) => Ok(raw),
            Err(e) => {
                let field = fields
                    .iter()
                    .find(|(key, value)| {
                        let mut single = serde_json::Map::new();
                        single.insert((*key).clone(), (*value).clone());
                        serde_json::from_value::<RawApp>(serde_json::Value::Object(single))
                            .is_err()
                    })
                    .map(|(key, _)| key.as_str())
                    .unwrap_or("apps");
                Err(TetherError::config(field, e.to_string()))
            }
        }
    }
}

/// Split a parsed descriptor into its app entries
///
/// Accepts `{ "apps": [...] }`, `{ "processes": [...] }` or a single app object.
pub(crate) fn app_entries(document: serde_json::Value) -> Result<Vec<serde_json::Value>> {
    let serde_json::Value::Object(mut root) = document else {
        return Err(TetherError::InvalidConfig(
            "Descriptor must be a table/object".to_string(),
        ));
    };

    let list = match root.remove("apps") {
        Some(list) => Some(("apps", list)),
        None => root.remove("processes").map(|list| ("processes", list)),
    };

    match list {
        Some((_, serde_json::Value::Array(entries))) => Ok(entries),
        Some((key, _)) => Err(TetherError::InvalidConfig(format!(
            "'{}' must be an array of app entries",
            key
        ))),
        None => Ok(vec![serde_json::Value::Object(root)]),
    }
}

/// `instances` is written as `2`, `"2"` or `"max"`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum CountValue {
    Number(i64),
    Text(String),
}

/// `max_memory_restart` is written as a byte count or `"1G"`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum SizeValue {
    Bytes(u64),
    Text(String),
}

/// Environment values are commonly numbers (`PORT: 5000`)
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum EnvValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Flag(bool),
}

impl EnvValue {
    pub fn render(&self) -> String {
        match self {
            EnvValue::Text(s) => s.clone(),
            EnvValue::Integer(n) => n.to_string(),
            EnvValue::Float(f) => f.to_string(),
            EnvValue::Flag(b) => b.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum ArgsValue {
    List(Vec<String>),
    Line(String),
}

impl ArgsValue {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            ArgsValue::List(list) => list,
            ArgsValue::Line(line) => line.split_whitespace().map(str::to_string).collect(),
        }
    }
}

/// `watch` may be a flag or a list of paths; either way only "enabled" matters
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum WatchValue {
    Flag(bool),
    Paths(Vec<String>),
}

impl WatchValue {
    pub fn enabled(&self) -> bool {
        match self {
            WatchValue::Flag(flag) => *flag,
            WatchValue::Paths(paths) => !paths.is_empty(),
        }
    }
}

/// Parse a memory size such as `512`, `100K`, `200M`, `1G` or `1GB` into bytes
pub fn parse_memory_size(s: &str) -> Result<u64> {
    let upper = s.trim().to_uppercase();
    let digits_end = upper
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(upper.len());
    let (num_str, unit) = upper.split_at(digits_end);

    let multiplier: u64 = match unit.trim() {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        other => {
            return Err(TetherError::config(
                "max_memory_restart",
                format!("unknown size unit '{}' in '{}'", other, s),
            ))
        }
    };

    let num: u64 = num_str.parse().map_err(|_| {
        TetherError::config("max_memory_restart", format!("invalid memory size: '{}'", s))
    })?;

    num.checked_mul(multiplier).ok_or_else(|| {
        TetherError::config("max_memory_restart", format!("memory size overflow: '{}'", s))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_size_units() {
        assert_eq!(parse_memory_size("100").unwrap(), 100);
        assert_eq!(parse_memory_size("100B").unwrap(), 100);
        assert_eq!(parse_memory_size("10K").unwrap(), 10 * 1024);
        assert_eq!(parse_memory_size("200M").unwrap(), 200 * 1024 * 1024);
        assert_eq!(parse_memory_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_size("2gb").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_size(" 1G ").unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_memory_size_rejects_garbage() {
        assert!(parse_memory_size("").is_err());
        assert!(parse_memory_size("G").is_err());
        assert!(parse_memory_size("1T").is_err());
        assert!(parse_memory_size("1.5G").is_err());

        let err = parse_memory_size("lots").unwrap_err();
        assert_eq!(err.field(), Some("max_memory_restart"));
    }

    #[test]
    fn test_parse_memory_size_overflow() {
        assert!(parse_memory_size("99999999999999999G").is_err());
    }

    #[test]
    fn test_from_entry_names_mistyped_field() {
        let entry = serde_json::json!({
            "name": "api",
            "script": "app.js",
            "kill_timeout": "3000"
        });
        let err = RawApp::from_entry(entry).unwrap_err();
        assert_eq!(err.field(), Some("kill_timeout"));

        let err = RawApp::from_entry(serde_json::json!("api")).unwrap_err();
        assert_eq!(err.field(), Some("apps"));
    }

    #[test]
    fn test_app_entries_shapes() {
        let multi = serde_json::json!({"processes": [{"name": "a"}, {"name": "b"}]});
        assert_eq!(app_entries(multi).unwrap().len(), 2);

        let single = serde_json::json!({"name": "a", "script": "a.sh"});
        assert_eq!(app_entries(single).unwrap().len(), 1);

        let broken = serde_json::json!({"apps": {"name": "a"}});
        assert!(matches!(
            app_entries(broken),
            Err(TetherError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_env_value_render() {
        let parsed: HashMap<String, EnvValue> =
            serde_json::from_str(r#"{"PORT": 5000, "RATIO": 0.5, "DEBUG": false, "MODE": "prod"}"#)
                .unwrap();
        assert_eq!(parsed["PORT"].render(), "5000");
        assert_eq!(parsed["RATIO"].render(), "0.5");
        assert_eq!(parsed["DEBUG"].render(), "false");
        assert_eq!(parsed["MODE"].render(), "prod");
    }

    #[test]
    fn test_args_value_line_splits_on_whitespace() {
        let args = ArgsValue::Line("--port 5000  --verbose".to_string()).into_vec();
        assert_eq!(args, vec!["--port", "5000", "--verbose"]);
    }

    #[test]
    fn test_watch_value_enabled() {
        assert!(WatchValue::Flag(true).enabled());
        assert!(!WatchValue::Flag(false).enabled());
        assert!(WatchValue::Paths(vec!["src".to_string()]).enabled());
        assert!(!WatchValue::Paths(vec![]).enabled());
    }
}
