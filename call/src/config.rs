use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use tether::{DEFAULT_MAX_FRAME_LEN, DEFAULT_SOCKET_ENV};

use crate::cli::Cli;

/// TOML config file structure
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Host socket path
    pub socket: Option<PathBuf>,
    /// Environment variable holding the socket path
    pub socket_env: Option<String>,
    /// Reply timeout in seconds
    pub timeout: Option<u64>,
    /// Largest reply frame accepted, in bytes
    pub max_frame_len: Option<usize>,
}

/// Merged configuration from file + CLI + environment
#[derive(Debug)]
pub struct MergedConfig {
    pub socket: PathBuf,
    pub timeout: Option<Duration>,
    pub max_frame_len: usize,
}

pub fn load_config(path: Option<&Path>) -> Result<FileConfig> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
}

/// CLI flags win over the file; the socket falls back to the environment
pub fn merge_config(file: FileConfig, cli: &Cli) -> Result<MergedConfig> {
    let socket_env = file
        .socket_env
        .unwrap_or_else(|| DEFAULT_SOCKET_ENV.to_string());
    let socket = match cli.socket.clone().or(file.socket) {
        Some(socket) => socket,
        None => match std::env::var_os(&socket_env) {
            Some(socket) => PathBuf::from(socket),
            None => bail!("{socket_env} environment variable not set"),
        },
    };

    Ok(MergedConfig {
        socket,
        timeout: cli.timeout.or(file.timeout).map(Duration::from_secs),
        max_frame_len: file.max_frame_len.unwrap_or(DEFAULT_MAX_FRAME_LEN),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn cli_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
            socket = "/run/host.sock"
            timeout = 30
            max_frame_len = 4096
            "#,
        )
        .unwrap();
        let cli = Cli::parse_from(["tether-call", "--timeout", "2", "ping"]);

        let merged = merge_config(file, &cli).unwrap();
        assert_eq!(merged.socket, PathBuf::from("/run/host.sock"));
        assert_eq!(merged.timeout, Some(Duration::from_secs(2)));
        assert_eq!(merged.max_frame_len, 4096);
    }

    #[test]
    fn missing_socket_env_is_an_error() {
        let file = FileConfig {
            socket_env: Some("TETHER_CALL_TEST_UNSET_SOCKET".to_string()),
            ..FileConfig::default()
        };
        let cli = Cli::parse_from(["tether-call", "ping"]);
        let err = merge_config(file, &cli).unwrap_err();
        assert!(err.to_string().contains("TETHER_CALL_TEST_UNSET_SOCKET"));
    }
}
