use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Context;

use crate::{port_alloc::PortMapping, terminator::StopTimings};

const DEFAULT_LISTEN: &str = "0.0.0.0:8000";
const DEFAULT_WORKER_BIN: &str = "/app/server/linux-cuda-cu12.2.0/undreamai_server";
const DEFAULT_INSTALL_ROOT: &str = "/app";
const DEFAULT_MODELS_DIR: &str = "/models/llm";
const DEFAULT_LOG_DIR: &str = "/app";
const DEFAULT_SD_ROOT: &str = "/app/stable-diffusion-webui";
const DEFAULT_SD_MODELS_DIR: &str = "/models/stable-diffusion";
const DEFAULT_SD_LOG_FILE: &str = "/app/sd_logs.txt";
const DEFAULT_SD_PORT: u16 = 7861;

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

fn env_path(name: &str, default: &str) -> PathBuf {
    PathBuf::from(env_string(name).unwrap_or_else(|| default.to_string()))
}

fn env_millis(name: &str, min: u64, max: u64, default: u64) -> Duration {
    Duration::from_millis(env_u64(name).map(|v| v.clamp(min, max)).unwrap_or(default))
}

/// Knobs for launching and stopping workers.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub worker_bin: PathBuf,
    pub install_root: PathBuf,
    pub models_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Appended to a model identifier when the exact path does not exist.
    pub model_extensions: Vec<String>,
    /// How long a SIGTERM'd group gets before SIGKILL.
    pub stop_grace: Duration,
    /// How long to wait for confirmation after SIGKILL.
    pub kill_wait: Duration,
    pub poll_interval: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            worker_bin: PathBuf::from(DEFAULT_WORKER_BIN),
            install_root: PathBuf::from(DEFAULT_INSTALL_ROOT),
            models_dir: PathBuf::from(DEFAULT_MODELS_DIR),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            model_extensions: vec![".gguf".to_string(), ".bin".to_string()],
            stop_grace: Duration::from_secs(5),
            kill_wait: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl SupervisorSettings {
    pub fn from_env() -> Self {
        Self {
            worker_bin: env_path("VELESIO_WORKER_BIN", DEFAULT_WORKER_BIN),
            install_root: env_path("VELESIO_INSTALL_ROOT", DEFAULT_INSTALL_ROOT),
            models_dir: env_path("VELESIO_MODELS_DIR", DEFAULT_MODELS_DIR),
            log_dir: env_path("VELESIO_LOG_DIR", DEFAULT_LOG_DIR),
            stop_grace: env_millis("VELESIO_STOP_GRACE_MS", 1000, 60_000, 5000),
            kill_wait: env_millis("VELESIO_KILL_WAIT_MS", 500, 60_000, 5000),
            poll_interval: env_millis("VELESIO_STOP_POLL_MS", 50, 5000, 1000),
            ..Self::default()
        }
    }

    pub fn stop_timings(&self) -> StopTimings {
        StopTimings {
            grace: self.stop_grace,
            kill_wait: self.kill_wait,
            poll_interval: self.poll_interval,
        }
    }

    /// Log file for the worker bound to `internal_port`.
    pub fn log_path(&self, internal_port: u16) -> PathBuf {
        self.log_dir
            .join(format!("server_logs_{internal_port}.txt"))
    }
}

/// The single image-generation web UI slot.
#[derive(Debug, Clone)]
pub struct SdSettings {
    /// Web UI checkout; the launcher runs from here.
    pub root: PathBuf,
    /// Generated on first start when missing.
    pub launcher: PathBuf,
    pub models_dir: PathBuf,
    pub log_file: PathBuf,
    pub port: u16,
    /// A launcher that exits within this window counts as a failed start.
    pub startup_check: Duration,
    pub stop: StopTimings,
}

impl Default for SdSettings {
    fn default() -> Self {
        let root = PathBuf::from(DEFAULT_SD_ROOT);
        Self {
            launcher: root.join("sd_launcher.sh"),
            root,
            models_dir: PathBuf::from(DEFAULT_SD_MODELS_DIR),
            log_file: PathBuf::from(DEFAULT_SD_LOG_FILE),
            port: DEFAULT_SD_PORT,
            startup_check: Duration::from_secs(2),
            stop: StopTimings {
                grace: Duration::from_secs(10),
                kill_wait: Duration::from_secs(5),
                poll_interval: Duration::from_secs(1),
            },
        }
    }
}

impl SdSettings {
    pub fn from_env() -> Self {
        let root = env_path("VELESIO_SD_ROOT", DEFAULT_SD_ROOT);
        let launcher = env_string("VELESIO_SD_LAUNCHER")
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join("sd_launcher.sh"));
        let port = env_u64("VELESIO_SD_PORT")
            .and_then(|v| u16::try_from(v).ok())
            .filter(|v| *v != 0)
            .unwrap_or(DEFAULT_SD_PORT);
        Self {
            root,
            launcher,
            models_dir: env_path("VELESIO_SD_MODELS_DIR", DEFAULT_SD_MODELS_DIR),
            log_file: env_path("VELESIO_SD_LOG_FILE", DEFAULT_SD_LOG_FILE),
            port,
            startup_check: env_millis("VELESIO_SD_STARTUP_CHECK_MS", 0, 30_000, 2000),
            stop: StopTimings {
                grace: env_millis("VELESIO_SD_STOP_GRACE_MS", 1000, 120_000, 10_000),
                ..Self::default().stop
            },
        }
    }
}

/// Everything `main` needs to boot the service.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub listen: SocketAddr,
    pub ports: PortMapping,
    pub supervisor: SupervisorSettings,
    pub sd: SdSettings,
}

impl AgentConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let listen = env_string("VELESIO_LISTEN").unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let listen: SocketAddr = listen
            .parse()
            .with_context(|| format!("parse VELESIO_LISTEN ({listen})"))?;

        let ports = match env_string("VELESIO_PORT_MAPPING") {
            Some(raw) => PortMapping::parse(&raw).context("parse VELESIO_PORT_MAPPING")?,
            None => PortMapping::default(),
        };

        Ok(Self {
            listen,
            ports,
            supervisor: SupervisorSettings::from_env(),
            sd: SdSettings::from_env(),
        })
    }
}
