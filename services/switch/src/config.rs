use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;

// Switch daemon configuration sourced from environment variables, with an
// optional YAML override file for ops-friendly deployments. Command-line
// flags win over both.
#[derive(Debug, Clone)]
pub struct SwitchConfig {
    // Protocol listener bind address.
    pub listen: SocketAddr,
    // Optional Prometheus metrics listener.
    pub metrics_bind: Option<SocketAddr>,
    // Root directory for static assets served to plain GETs.
    pub assets_dir: PathBuf,
    // Trace ring retention.
    pub trace_capacity: usize,
    // Max accepted request body.
    pub max_body_bytes: usize,
}

const DEFAULT_SWITCH_CONFIG_PATH: &str = "/usr/local/crossbar/config.yml";
const DEFAULT_TRACE_CAPACITY: usize = 1024;

#[derive(Debug, Deserialize)]
struct SwitchConfigOverride {
    listen: Option<String>,
    metrics_bind: Option<String>,
    assets_dir: Option<PathBuf>,
    trace_capacity: Option<usize>,
    max_body_bytes: Option<usize>,
}

impl SwitchConfig {
    pub fn from_env() -> Result<Self> {
        let listen = std::env::var("SWITCH_LISTEN")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .with_context(|| "parse SWITCH_LISTEN")?;
        let metrics_bind = match std::env::var("SWITCH_METRICS_BIND") {
            Ok(value) => Some(value.parse().with_context(|| "parse SWITCH_METRICS_BIND")?),
            Err(_) => None,
        };
        let assets_dir = std::env::var("SWITCH_ASSETS")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("www"));
        let trace_capacity = std::env::var("SWITCH_TRACE_CAPACITY")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_TRACE_CAPACITY);
        let max_body_bytes = std::env::var("SWITCH_MAX_BODY_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(crossbar_wire::DEFAULT_MAX_BODY_BYTES);
        Ok(Self {
            listen,
            metrics_bind,
            assets_dir,
            trace_capacity,
            max_body_bytes,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        let override_path = std::env::var("SWITCH_CONFIG").ok();
        let config_path = override_path
            .clone()
            .unwrap_or_else(|| DEFAULT_SWITCH_CONFIG_PATH.to_string());
        let contents = match fs::read_to_string(&config_path) {
            Ok(contents) => Some(contents),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                // The default path is best-effort; an explicit override
                // that is missing is an operator error.
                if override_path.is_some() {
                    return Err(err).with_context(|| format!("read SWITCH_CONFIG: {config_path}"));
                }
                None
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read switch config: {config_path}"));
            }
        };
        if let Some(contents) = contents {
            let override_cfg: SwitchConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse switch config yaml")?;
            if let Some(value) = override_cfg.listen {
                config.listen = value.parse().with_context(|| "parse listen")?;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = Some(value.parse().with_context(|| "parse metrics_bind")?);
            }
            if let Some(value) = override_cfg.assets_dir {
                config.assets_dir = value;
            }
            if let Some(value) = override_cfg.trace_capacity
                && value > 0
            {
                config.trace_capacity = value;
            }
            if let Some(value) = override_cfg.max_body_bytes
                && value > 0
            {
                config.max_body_bytes = value;
            }
        }
        Ok(config)
    }
}
