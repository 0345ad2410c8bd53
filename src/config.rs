use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "PHYSICS_BAR_CONFIG";
pub const BACKEND_HOST_ENV: &str = "PHYSICS_BAR_BACKEND_HOST";
pub const BACKEND_MODEL_ENV: &str = "PHYSICS_BAR_BACKEND_MODEL";
pub const HOST_BINARY: &str = "physics-tool-host";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Error reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Error parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub host: HostConfig,
    pub window: WindowConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Ollama,
    /// OpenAI-compatible chat completions, e.g. LM Studio.
    OpenAi,
}

fn default_temperature() -> f32 {
    0.7
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    pub provider: Provider,
    pub host: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            provider: Provider::Ollama,
            host: "http://localhost:11434".to_string(),
            model: "llama3.1".to_string(),
            temperature: default_temperature(),
            request_timeout_secs: None,
        }
    }
}

impl BackendConfig {
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(host) = std::env::var(BACKEND_HOST_ENV) {
            self.host = host;
        }
        if let Ok(model) = std::env::var(BACKEND_MODEL_ENV) {
            self.model = model;
        }
        self
    }
}

fn default_handshake_timeout() -> u64 {
    30
}

fn default_shutdown_grace() -> u64 {
    5
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HostConfig {
    /// Empty means the `physics-tool-host` binary next to the running executable.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            command: String::new(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            handshake_timeout_secs: default_handshake_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

/// How the Client Proxy launches the Tool Host.
#[derive(Debug, Clone, PartialEq)]
pub struct HostCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub handshake_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl HostConfig {
    pub fn to_command(&self) -> HostCommand {
        let program = if self.command.trim().is_empty() {
            sibling_host_binary()
        } else {
            PathBuf::from(&self.command)
        };
        HostCommand {
            program,
            args: self.args.clone(),
            working_dir: self.working_dir.clone(),
            env: self.env.clone(),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }
}

fn sibling_host_binary() -> PathBuf {
    let name = format!("{}{}", HOST_BINARY, std::env::consts::EXE_SUFFIX);
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
        .unwrap_or_else(|| PathBuf::from(name))
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig {
            width: 1000,
            height: 800,
        }
    }
}

impl Config {
    /// Loads the config file, falling back to defaults if it is missing or broken.
    pub fn load() -> Self {
        let config_path = Self::get_config_path();

        if !config_path.exists() {
            tracing::debug!(path = %config_path.display(), "No config file, using defaults");
            return Config::default();
        }

        match Self::load_from(&config_path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("{}. Using defaults.", e);
                Config::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn get_config_path() -> PathBuf {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        Self::get_config_dir().join("config.toml")
    }

    pub fn get_config_dir() -> PathBuf {
        if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home).join(".config/physics-bar")
        } else {
            PathBuf::from(".")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[backend]
provider = "openai"
host = "http://localhost:1234"
model = "qwen2.5-7b-instruct"

[host]
command = "/usr/local/bin/physics-tool-host"
handshake_timeout_secs = 3
"#
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.backend.provider, Provider::OpenAi);
        assert_eq!(config.backend.temperature, 0.7);
        assert_eq!(config.backend.request_timeout_secs, None);
        assert_eq!(config.host.shutdown_grace_secs, 5);
        assert_eq!(config.window.width, 1000);

        let command = config.host.to_command();
        assert_eq!(command.program, PathBuf::from("/usr/local/bin/physics-tool-host"));
        assert_eq!(command.handshake_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[backend\nprovider = 3").unwrap();
        assert!(matches!(Config::load_from(file.path()), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let parsed: Result<Config, _> = toml::from_str("[backend]\nprovider = \"gemini\"\nhost = \"x\"\nmodel = \"y\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_empty_command_uses_sibling_binary() {
        let command = HostConfig::default().to_command();
        let file_name = command.program.file_name().unwrap().to_string_lossy().to_string();
        assert!(file_name.starts_with(HOST_BINARY));
        assert_eq!(command.shutdown_grace, Duration::from_secs(5));
    }
}
