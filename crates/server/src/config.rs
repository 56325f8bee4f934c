use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;

#[derive(Debug)]
pub enum ConfigError {
    Io,
    Parse,
    Missing,
    Invalid,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "configuration io failure"),
            Self::Parse => write!(f, "configuration parse failure"),
            Self::Missing => write!(f, "configuration key missing"),
            Self::Invalid => write!(f, "configuration value invalid"),
        }
    }
}

impl Error for ConfigError {}

#[derive(Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub metrics_bind: Option<String>,
    pub connection_keepalive: u64,
    pub ring_timeout_seconds: u64,
    pub outbound_queue_depth: usize,
}

/// Loads Catline server configuration from filesystem and environment overrides.
pub fn load_configuration(path: &Path) -> Result<ServerConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
    let mut section = String::new();
    let mut map = HashMap::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            section = trimmed
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            continue;
        }
        let parts: Vec<&str> = trimmed.splitn(2, '=').collect();
        if parts.len() != 2 {
            return Err(ConfigError::Parse);
        }
        let key = if section.is_empty() {
            parts[0].trim().to_string()
        } else {
            format!("{}.{}", section, parts[0].trim())
        };
        let mut value = parts[1].trim().to_string();
        if let Some(idx) = value.find('#') {
            value.truncate(idx);
            value = value.trim().to_string();
        }
        if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            value = value[1..value.len() - 1].to_string();
        }
        map.insert(key, value);
    }

    let bind = required(override_env("CATLINE_BIND", map.remove("server.bind"))?)?;
    let metrics_bind = override_env("CATLINE_METRICS_BIND", map.remove("server.metrics_bind"))?;
    let keepalive = override_env("CATLINE_KEEPALIVE", map.remove("server.keepalive"))?
        .unwrap_or_else(|| "60".to_string())
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid)?;
    let ring_timeout = override_env("CATLINE_RING_TIMEOUT", map.remove("calls.ring_timeout"))?
        .unwrap_or_else(|| "30".to_string())
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid)?;
    let queue_depth = override_env("CATLINE_QUEUE_DEPTH", map.remove("calls.outbound_queue"))?
        .unwrap_or_else(|| "64".to_string())
        .parse::<usize>()
        .map_err(|_| ConfigError::Invalid)?;
    if ring_timeout == 0 || queue_depth == 0 {
        return Err(ConfigError::Invalid);
    }

    Ok(ServerConfig {
        bind,
        metrics_bind,
        connection_keepalive: keepalive,
        ring_timeout_seconds: ring_timeout,
        outbound_queue_depth: queue_depth,
    })
}

fn override_env(key: &str, current: Option<String>) -> Result<Option<String>, ConfigError> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(current),
        Err(_) => Err(ConfigError::Invalid),
    }
}

fn required(value: Option<String>) -> Result<String, ConfigError> {
    value.ok_or(ConfigError::Missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    #[test]
    fn parse_configuration_minimal() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("catline_test_config.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(b"[server]\nbind=\"127.0.0.1:9443\"\nkeepalive=\"30\"\n")
            .unwrap();
        let config = load_configuration(&path).unwrap();
        assert_eq!(config.bind, "127.0.0.1:9443");
        assert_eq!(config.connection_keepalive, 30);
        assert_eq!(config.ring_timeout_seconds, 30);
        assert_eq!(config.outbound_queue_depth, 64);
        assert!(config.metrics_bind.is_none());
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn parse_configuration_call_limits() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("catline_test_config_calls.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            b"[server]\nbind=\"127.0.0.1:9443\"\nmetrics_bind=\"127.0.0.1:9600\"\n[calls]\nring_timeout=\"15\" # seconds\noutbound_queue=\"8\"\n",
        )
        .unwrap();
        let config = load_configuration(&path).unwrap();
        assert_eq!(config.ring_timeout_seconds, 15);
        assert_eq!(config.outbound_queue_depth, 8);
        assert_eq!(config.metrics_bind.as_deref(), Some("127.0.0.1:9600"));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn zero_ring_timeout_rejected() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("catline_test_config_zero.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(b"[server]\nbind=\"127.0.0.1:9443\"\n[calls]\nring_timeout=\"0\"\n")
            .unwrap();
        assert!(matches!(
            load_configuration(&path),
            Err(ConfigError::Invalid)
        ));
        fs::remove_file(path).unwrap();
    }
}
