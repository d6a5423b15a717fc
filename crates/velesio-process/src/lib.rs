use std::collections::BTreeMap;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_NGL: i32 = 30;
pub const DEFAULT_TEMPLATE: &str = "chatml";

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_ngl() -> i32 {
    DEFAULT_NGL
}

fn default_template() -> String {
    DEFAULT_TEMPLATE.to_string()
}

/// Caller-supplied parameters for one worker instance.
///
/// `external_port` selects the slot; the worker itself binds the mapped
/// internal port.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InstanceConfig {
    pub model: String,
    pub external_port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_ngl")]
    pub ngl: i32,
    #[serde(default = "default_template")]
    pub template: String,
    #[serde(default)]
    pub custom_params: String,
}

impl InstanceConfig {
    pub fn new(model: impl Into<String>, external_port: u16) -> Self {
        Self {
            model: model.into(),
            external_port,
            host: default_host(),
            ngl: default_ngl(),
            template: default_template(),
            custom_params: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Running,
    Stopped,
}

/// Point-in-time view of a supervised instance.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstanceInfo {
    pub external_port: u16,
    pub internal_port: u16,
    pub pid: u32,
    pub status: InstanceState,
    pub log_file: String,
    pub model_path: String,
    pub started_at_unix_ms: u64,
    pub config: InstanceConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StartedInstance {
    pub external_port: u16,
    pub internal_port: u16,
    pub log_file: String,
    pub pid: u32,
}

/// How a stop request reached the desired end state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// Nothing was registered for the port.
    NotRunning,
    /// The worker had already exited; only the stale record was dropped.
    AlreadyExited,
    /// The process group exited after SIGTERM.
    Graceful,
    /// The process group had to be killed with SIGKILL.
    Forced,
}

/// Per external port liveness, as reported by the stats snapshot.
pub type StatusMap = BTreeMap<u16, InstanceState>;
