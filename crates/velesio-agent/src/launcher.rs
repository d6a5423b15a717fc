use std::{
    path::Path,
    process::Stdio,
    time::{SystemTime, UNIX_EPOCH},
};

use tokio::process::Command;
use velesio_process::{InstanceConfig, StartedInstance};

use crate::{
    args,
    error::SupervisorError,
    models,
    registry::InstanceRecord,
    supervisor::Supervisor,
    worker::{self, WorkerProcess},
};

fn validate_config(config: &InstanceConfig) -> Result<Vec<String>, SupervisorError> {
    models::validate_model_id(&config.model)?;
    if config.host.trim().is_empty() {
        return Err(SupervisorError::invalid("host", "must be non-empty"));
    }
    if config.template.trim().is_empty() {
        return Err(SupervisorError::invalid("template", "must be non-empty"));
    }
    args::split_args(&config.custom_params)
        .map_err(|e| SupervisorError::invalid("custom_params", e.to_string()))
}

/// The worker's argv, without the program itself.
pub fn worker_args(
    config: &InstanceConfig,
    model_path: &Path,
    internal_port: u16,
    extra: &[String],
) -> Vec<String> {
    let mut out = vec![
        "-m".to_string(),
        model_path.display().to_string(),
        "--host".to_string(),
        config.host.clone(),
        "--port".to_string(),
        internal_port.to_string(),
        "-ngl".to_string(),
        config.ngl.to_string(),
        "--template".to_string(),
        config.template.clone(),
    ];
    out.extend(extra.iter().cloned());
    out
}

pub(crate) async fn truncate_log(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await?;
    Ok(())
}

/// An append handle on `path` suitable for a child's stdout/stderr.
pub(crate) async fn open_log_for_child(path: &Path) -> std::io::Result<Stdio> {
    let file = tokio::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .await?;
    Ok(Stdio::from(file.into_std().await))
}

fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl Supervisor {
    /// Starts a worker in the slot addressed by `config.external_port`.
    ///
    /// The slot is reserved before anything else about `config` is checked,
    /// so a busy port always reports `PortBusy`.
    pub async fn start(&self, config: InstanceConfig) -> Result<StartedInstance, SupervisorError> {
        let external_port = config.external_port;
        let internal_port = self.internal_port(external_port)?;

        if !self.registry.try_reserve(internal_port).await {
            return Err(SupervisorError::PortBusy {
                external_port,
                internal_port,
            });
        }

        match self.launch(config, internal_port).await {
            Ok(started) => Ok(started),
            Err(err) => {
                self.registry.release(internal_port).await;
                tracing::warn!(external_port, internal_port, %err, "start failed");
                Err(err)
            }
        }
    }

    /// Everything after the reservation. The caller releases the slot on error.
    async fn launch(
        &self,
        config: InstanceConfig,
        internal_port: u16,
    ) -> Result<StartedInstance, SupervisorError> {
        let settings = &self.settings;
        let external_port = config.external_port;
        let extra = validate_config(&config)?;

        let model_path = models::resolve_model(
            &settings.models_dir,
            &config.model,
            &settings.model_extensions,
        )
        .await?;

        let log_file = settings.log_path(internal_port);
        truncate_log(&log_file).await.map_err(|e| {
            SupervisorError::spawn_failed(format!("truncate log {}", log_file.display()), e)
        })?;

        let args = worker_args(&config, &model_path, internal_port, &extra);
        tracing::info!(
            external_port,
            internal_port,
            command = %format!("{} {}", settings.worker_bin.display(), args.join(" ")),
            "starting worker"
        );

        let open_failed =
            |e| SupervisorError::spawn_failed(format!("open log {}", log_file.display()), e);
        let stdout = open_log_for_child(&log_file).await.map_err(open_failed)?;
        let stderr = open_log_for_child(&log_file).await.map_err(open_failed)?;

        let mut cmd = Command::new(&settings.worker_bin);
        cmd.args(&args)
            .current_dir(&settings.install_root)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        worker::detach_into_own_group(&mut cmd);

        let process = WorkerProcess::spawn(&mut cmd).map_err(|e| {
            SupervisorError::spawn_failed(format!("spawn {}", settings.worker_bin.display()), e)
        })?;
        let pid = process.pid();

        self.registry
            .insert(
                internal_port,
                InstanceRecord {
                    process,
                    config,
                    log_file: log_file.clone(),
                    model_path,
                    started_at_unix_ms: unix_ms_now(),
                },
            )
            .await;

        tracing::info!(external_port, internal_port, pid, "worker started");
        Ok(StartedInstance {
            external_port,
            internal_port,
            log_file: log_file.display().to_string(),
            pid,
        })
    }
}
