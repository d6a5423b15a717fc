use std::{sync::Arc, time::Duration};

use tokio::{process::Command, sync::Mutex};
use velesio_process::StopOutcome;

use crate::{
    config::SdSettings,
    error::SupervisorError,
    launcher::{open_log_for_child, truncate_log},
    logs::{self, TailError},
    models,
    terminator::{clear_log, terminate_group},
    worker::{self, ProcessWatch, WorkerProcess},
};

const SERVICE: &str = "stable diffusion";
const WEB_UI_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdStarted {
    pub pid: u32,
    pub log_file: String,
}

#[derive(Debug, Default)]
enum Slot {
    #[default]
    Empty,
    /// Launcher is being prepared; the slot is taken but nothing runs yet.
    Starting,
    Running(WorkerProcess),
}

impl Slot {
    /// Empties a slot whose web UI has exited.
    fn reconcile(&mut self) -> Option<WorkerProcess> {
        if matches!(self, Self::Running(p) if !p.is_alive()) {
            if let Self::Running(p) = std::mem::take(self) {
                tracing::warn!(pid = p.pid(), exit = ?p.exit_state(), "stable diffusion exited");
                return Some(p);
            }
        }
        None
    }
}

/// The web UI's argv, without the launcher itself.
pub fn sd_args(port: u16) -> Vec<String> {
    let port = port.to_string();
    [
        "--listen",
        "--port",
        port.as_str(),
        "--allow-code",
        "--no-download-sd-model",
        "--api",
        "--xformers",
        "--cors-allow-origins",
        "*",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn launcher_script(settings: &SdSettings) -> String {
    let root = settings.root.display();
    let models = settings.models_dir.display();
    format!(
        r#"#!/bin/bash
cd "{root}"
export PYTHONPATH="{root}"
mkdir -p "{root}/models/Stable-diffusion"
if [ -d "{models}" ]; then
  find "{models}" -type f \( -name "*.safetensors" -o -name "*.ckpt" \) | while read -r file; do
    ln -sf "$file" "{root}/models/Stable-diffusion/"
    echo "Linked model: $file"
  done
fi
exec python3 launch.py --skip-torch-cuda-test "$@"
"#
    )
}

/// Writes the launcher script unless one is already in place.
pub(crate) async fn ensure_launcher(settings: &SdSettings) -> std::io::Result<()> {
    if tokio::fs::try_exists(&settings.launcher).await? {
        return Ok(());
    }
    if let Some(parent) = settings.launcher.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&settings.launcher, launcher_script(settings)).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&settings.launcher, std::fs::Permissions::from_mode(0o755))
            .await?;
    }
    tracing::info!(path = %settings.launcher.display(), "created stable diffusion launcher");
    Ok(())
}

/// Single-slot supervisor for the image-generation web UI. Cloning shares the
/// slot.
#[derive(Debug, Clone)]
pub struct SdSupervisor {
    settings: Arc<SdSettings>,
    slot: Arc<Mutex<Slot>>,
}

impl SdSupervisor {
    pub fn new(settings: SdSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            slot: Arc::new(Mutex::new(Slot::Empty)),
        }
    }

    pub fn settings(&self) -> &SdSettings {
        &self.settings
    }

    pub async fn is_running(&self) -> bool {
        let mut slot = self.slot.lock().await;
        slot.reconcile();
        matches!(*slot, Slot::Running(_))
    }

    pub async fn start(&self) -> Result<SdStarted, SupervisorError> {
        {
            let mut slot = self.slot.lock().await;
            slot.reconcile();
            if !matches!(*slot, Slot::Empty) {
                return Err(SupervisorError::AlreadyRunning { service: SERVICE });
            }
            *slot = Slot::Starting;
        }

        let process = match self.launch().await {
            Ok(p) => p,
            Err(err) => {
                *self.slot.lock().await = Slot::Empty;
                return Err(err);
            }
        };
        let pid = process.pid();
        let watch = process.watch();
        *self.slot.lock().await = Slot::Running(process);
        tracing::info!(pid, port = self.settings.port, "stable diffusion started");

        // The launcher fails fast on a broken checkout.
        if let Some(exit) = watch.wait_exit(self.settings.startup_check).await {
            self.release(pid).await;
            return Err(SupervisorError::spawn_failed(
                format!(
                    "stable diffusion exited during startup; see {}",
                    self.settings.log_file.display()
                ),
                std::io::Error::other(format!(
                    "exit code {:?}, signal {:?}",
                    exit.code, exit.signal
                )),
            ));
        }

        Ok(SdStarted {
            pid,
            log_file: self.settings.log_file.display().to_string(),
        })
    }

    async fn launch(&self) -> Result<WorkerProcess, SupervisorError> {
        let s = &self.settings;
        ensure_launcher(s).await.map_err(|e| {
            SupervisorError::spawn_failed(format!("write launcher {}", s.launcher.display()), e)
        })?;
        truncate_log(&s.log_file).await.map_err(|e| {
            SupervisorError::spawn_failed(format!("prepare log {}", s.log_file.display()), e)
        })?;
        let stdout = open_log_for_child(&s.log_file)
            .await
            .map_err(|e| SupervisorError::spawn_failed("open log for stdout", e))?;
        let stderr = open_log_for_child(&s.log_file)
            .await
            .map_err(|e| SupervisorError::spawn_failed("open log for stderr", e))?;

        let mut cmd = Command::new(&s.launcher);
        cmd.args(sd_args(s.port))
            .current_dir(&s.root)
            .stdin(std::process::Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        worker::detach_into_own_group(&mut cmd);

        WorkerProcess::spawn(&mut cmd).map_err(|e| {
            SupervisorError::spawn_failed(format!("spawn {}", s.launcher.display()), e)
        })
    }

    /// Frees the slot if it still holds `pid`. Returns whether it did.
    async fn release(&self, pid: u32) -> bool {
        let mut slot = self.slot.lock().await;
        if matches!(&*slot, Slot::Running(p) if p.pid() == pid) {
            *slot = Slot::Empty;
            return true;
        }
        false
    }

    /// Stops the web UI. Stopping an empty slot succeeds.
    pub async fn stop(&self) -> Result<StopOutcome, SupervisorError> {
        let process: ProcessWatch = {
            let mut slot = self.slot.lock().await;
            if slot.reconcile().is_some() {
                return Ok(StopOutcome::AlreadyExited);
            }
            match &*slot {
                Slot::Running(p) => p.watch(),
                Slot::Empty | Slot::Starting => return Ok(StopOutcome::NotRunning),
            }
        };

        let pid = process.pid();
        tracing::info!(pid, "stopping stable diffusion");
        let group = process.process_group();
        match terminate_group(&group, self.settings.stop).await {
            Ok(outcome) => {
                if self.release(pid).await {
                    clear_log(&self.settings.log_file).await;
                }
                tracing::info!(pid, ?outcome, "stable diffusion stopped");
                Ok(outcome)
            }
            Err(err) => {
                tracing::error!(pid, %err, "failed to stop stable diffusion");
                if !group.is_alive() && self.release(pid).await {
                    clear_log(&self.settings.log_file).await;
                }
                Err(SupervisorError::StopFailed {
                    external_port: self.settings.port,
                    message: err.to_string(),
                })
            }
        }
    }

    /// The web UI's log as text; empty when there is none yet.
    pub async fn logs(&self) -> Result<String, TailError> {
        match logs::tail_text(&self.settings.log_file, 0).await {
            Err(TailError::NotFound) => Ok(String::new()),
            other => other,
        }
    }

    pub async fn list_models(&self) -> std::io::Result<Vec<String>> {
        models::list_dir_names(&self.settings.models_dir).await
    }

    /// Whether the web UI answers `200` on its root page.
    pub async fn web_ui_available(&self) -> bool {
        web_ui_responds(self.settings.port).await
    }
}

async fn web_ui_responds(port: u16) -> bool {
    let client = match reqwest::Client::builder()
        .timeout(WEB_UI_CHECK_TIMEOUT)
        .build()
    {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!(%err, "failed to build http client");
            return false;
        }
    };
    match client.get(format!("http://127.0.0.1:{port}/")).send().await {
        Ok(resp) => resp.status() == reqwest::StatusCode::OK,
        Err(err) => {
            tracing::debug!(port, %err, "stable diffusion web ui unreachable");
            false
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{os::unix::fs::PermissionsExt, path::PathBuf};

    use super::*;
    use crate::{models::tests::temp_dir_for, terminator::StopTimings};

    fn settings(name: &str, script: &str) -> (PathBuf, SdSettings) {
        let root = temp_dir_for(name);
        let launcher = root.join("sd_launcher.sh");
        std::fs::write(&launcher, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&launcher, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::create_dir_all(root.join("sd-models")).unwrap();
        let s = SdSettings {
            launcher,
            models_dir: root.join("sd-models"),
            log_file: root.join("sd_logs.txt"),
            root: root.clone(),
            port: 7861,
            startup_check: Duration::from_millis(300),
            stop: StopTimings {
                grace: Duration::from_millis(1500),
                kill_wait: Duration::from_secs(3),
                poll_interval: Duration::from_millis(100),
            },
        };
        (root, s)
    }

    const SERVE: &str = "echo \"argv: $*\"\nexec sleep 30";

    #[tokio::test]
    async fn start_stop_cycle_owns_one_slot() {
        let (root, s) = settings("sd-cycle", SERVE);
        let log_file = s.log_file.clone();
        let sd = SdSupervisor::new(s);

        let started = sd.start().await.unwrap();
        assert_eq!(started.log_file, log_file.display().to_string());
        assert!(sd.is_running().await);

        let err = sd.start().await.unwrap_err();
        assert_eq!(err.code(), "already_running");

        let text = sd.logs().await.unwrap();
        assert!(text.contains("argv: --listen --port 7861 --allow-code"), "{text}");

        assert_eq!(sd.stop().await.unwrap(), StopOutcome::Graceful);
        assert!(!sd.is_running().await);
        assert_eq!(std::fs::read_to_string(&log_file).unwrap(), "");

        assert_eq!(sd.stop().await.unwrap(), StopOutcome::NotRunning);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn early_exit_is_a_failed_start() {
        let (root, s) = settings("sd-crash", "echo boom\nexit 1");
        let sd = SdSupervisor::new(s);

        let err = sd.start().await.unwrap_err();
        assert_eq!(err.code(), "spawn_failed");
        assert!(!sd.is_running().await);
        // The log is kept for diagnosis.
        assert!(sd.logs().await.unwrap().contains("boom"));

        // The slot is free again.
        let err = sd.start().await.unwrap_err();
        assert_eq!(err.code(), "spawn_failed");
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn crash_after_start_frees_the_slot() {
        let (root, s) = settings("sd-late-crash", "sleep 0.6\nexit 2");
        let sd = SdSupervisor::new(s);

        sd.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(sd.stop().await.unwrap(), StopOutcome::AlreadyExited);
        assert!(!sd.is_running().await);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn missing_launcher_is_generated() {
        let (root, mut s) = settings("sd-launcher", SERVE);
        s.launcher = root.join("webui").join("sd_launcher.sh");

        ensure_launcher(&s).await.unwrap();
        let body = std::fs::read_to_string(&s.launcher).unwrap();
        assert!(body.starts_with("#!/bin/bash\n"));
        assert!(body.contains(&s.models_dir.display().to_string()));
        assert!(body.contains("launch.py"));
        let mode = std::fs::metadata(&s.launcher).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        // An existing launcher is left alone.
        std::fs::write(&s.launcher, "#!/bin/sh\n").unwrap();
        ensure_launcher(&s).await.unwrap();
        assert_eq!(std::fs::read_to_string(&s.launcher).unwrap(), "#!/bin/sh\n");
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn models_and_missing_logs() {
        let (root, s) = settings("sd-models", SERVE);
        std::fs::write(s.models_dir.join("b.safetensors"), b"").unwrap();
        std::fs::write(s.models_dir.join("a.ckpt"), b"").unwrap();
        let sd = SdSupervisor::new(s);

        assert_eq!(sd.list_models().await.unwrap(), ["a.ckpt", "b.safetensors"]);
        assert_eq!(sd.logs().await.unwrap(), "");
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn web_ui_check_needs_a_200() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = axum::Router::new().route("/", axum::routing::get(|| async { "ok" }));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        assert!(web_ui_responds(port).await);

        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let closed_port = closed.local_addr().unwrap().port();
        drop(closed);
        assert!(!web_ui_responds(closed_port).await);
    }
}
