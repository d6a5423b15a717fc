use std::{collections::BTreeMap, sync::Arc};

use velesio_process::{InstanceInfo, InstanceState, StatusMap, StopOutcome};

use crate::{
    config::SupervisorSettings, error::SupervisorError, port_alloc::PortMapping,
    registry::InstanceRegistry,
};

/// Owns the port slots and the workers running in them.
///
/// Cheap to clone; clones share one registry.
#[derive(Clone, Debug)]
pub struct Supervisor {
    pub(crate) settings: Arc<SupervisorSettings>,
    pub(crate) ports: Arc<PortMapping>,
    pub(crate) registry: InstanceRegistry,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings, ports: PortMapping) -> Self {
        let ports = Arc::new(ports);
        Self {
            settings: Arc::new(settings),
            registry: InstanceRegistry::new(ports.clone()),
            ports,
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn ports(&self) -> &PortMapping {
        &self.ports
    }

    pub(crate) fn internal_port(&self, external_port: u16) -> Result<u16, SupervisorError> {
        self.ports
            .internal_of(external_port)
            .ok_or_else(|| SupervisorError::InvalidPort {
                port: external_port.into(),
                available: self.ports.external_ports(),
            })
    }

    /// Checks a caller-supplied port of any integer width against the
    /// mapping. Anything that is not a mapped external port, including values
    /// outside the `u16` range, is `InvalidPort`.
    pub fn mapped_external_port(&self, raw: i64) -> Result<u16, SupervisorError> {
        u16::try_from(raw)
            .ok()
            .filter(|port| self.ports.internal_of(*port).is_some())
            .ok_or_else(|| SupervisorError::InvalidPort {
                port: raw,
                available: self.ports.external_ports(),
            })
    }

    /// Running instances keyed by external port. Exited workers are dropped
    /// from the registry as a side effect.
    pub async fn list(&self) -> BTreeMap<u16, InstanceInfo> {
        self.registry.list_live().await.into_iter().collect()
    }

    /// Running/stopped per external port. Ports reported as stopped are
    /// evicted by this call and will be absent from the next one.
    pub async fn status_map(&self) -> StatusMap {
        let sweep = self.registry.sweep().await;
        let mut out = StatusMap::new();
        for port in sweep.evicted {
            out.insert(port, InstanceState::Stopped);
        }
        for info in sweep.live {
            out.insert(info.external_port, InstanceState::Running);
        }
        out
    }

    /// The running instance behind `external_port`, if any.
    pub async fn instance(&self, external_port: u16) -> Result<Option<InstanceInfo>, SupervisorError> {
        let internal_port = self.internal_port(external_port)?;
        Ok(self.registry.get(internal_port).await)
    }

    /// Stops every running instance concurrently. Each stop is independent;
    /// failures are logged and returned.
    pub async fn shutdown(&self) -> Vec<(u16, Result<StopOutcome, SupervisorError>)> {
        let ports: Vec<u16> = self.list().await.into_keys().collect();
        if ports.is_empty() {
            return Vec::new();
        }
        tracing::info!(count = ports.len(), "stopping all instances");

        let results = futures_util::future::join_all(ports.iter().map(|p| self.stop(*p))).await;
        let out: Vec<_> = ports.into_iter().zip(results).collect();
        for (port, res) in &out {
            if let Err(err) = res {
                tracing::error!(external_port = port, %err, "failed to stop instance during shutdown");
            }
        }
        out
    }
}

#[cfg(all(test, unix))]
pub(crate) mod test_support {
    use std::{path::PathBuf, time::Duration};

    use super::*;
    use crate::models::tests::temp_dir_for;

    pub(crate) const ECHO_ARGS: &str = "#!/bin/sh\necho \"argv: $*\"\nexec sleep 30\n";
    pub(crate) const CRASH: &str = "#!/bin/sh\necho boom\nexit 7\n";
    pub(crate) const CRASH_LATE: &str = "#!/bin/sh\nsleep 1\nexit 7\n";
    pub(crate) const IGNORE_TERM: &str =
        "#!/bin/sh\ntrap '' TERM\necho ready\nwhile :; do sleep 1; done\n";

    pub(crate) struct Fixture {
        pub(crate) root: PathBuf,
        pub(crate) supervisor: Supervisor,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    /// A supervisor rooted in a fresh temp dir, running `worker_script` as the
    /// worker binary, with model `m` available.
    pub(crate) fn fixture(test_name: &str, worker_script: &str) -> Fixture {
        use std::os::unix::fs::PermissionsExt;

        let root = temp_dir_for(test_name);
        let models_dir = root.join("models");
        let log_dir = root.join("logs");
        std::fs::create_dir_all(&models_dir).unwrap();
        std::fs::create_dir_all(&log_dir).unwrap();
        std::fs::write(models_dir.join("m"), b"weights").unwrap();

        let worker_bin = root.join("worker.sh");
        std::fs::write(&worker_bin, worker_script).unwrap();
        std::fs::set_permissions(&worker_bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        let settings = SupervisorSettings {
            worker_bin,
            install_root: root.clone(),
            models_dir,
            log_dir,
            stop_grace: Duration::from_millis(1500),
            kill_wait: Duration::from_secs(3),
            poll_interval: Duration::from_millis(100),
            ..SupervisorSettings::default()
        };
        Fixture {
            root,
            supervisor: Supervisor::new(settings, PortMapping::default()),
        }
    }

    /// Polls `f` until it returns true or five seconds pass.
    pub(crate) async fn eventually<F, Fut>(mut f: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if f().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }
}

#[cfg(all(test, unix))]
mod tests {
    use velesio_process::InstanceConfig;

    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn crashed_worker_disappears_and_slot_is_reclaimed() {
        let fx = fixture("sup-crash", CRASH);
        let sup = &fx.supervisor;

        sup.start(InstanceConfig::new("m", 1337)).await.unwrap();
        assert!(
            eventually(|| async {
                sup.registry
                    .get(1338)
                    .await
                    .is_none_or(|i| i.status == InstanceState::Stopped)
            })
            .await
        );

        // Stats report the crash once, then forget it.
        let statuses = sup.status_map().await;
        assert!(matches!(statuses.get(&1337), None | Some(InstanceState::Stopped)));
        assert!(sup.status_map().await.is_empty());
        assert!(sup.list().await.is_empty());

        // The slot is usable again.
        sup.start(InstanceConfig::new("m", 1337)).await.unwrap();
    }

    #[tokio::test]
    async fn status_map_reports_running_instances() {
        let fx = fixture("sup-status", ECHO_ARGS);
        let sup = &fx.supervisor;

        sup.start(InstanceConfig::new("m", 1337)).await.unwrap();
        sup.start(InstanceConfig::new("m", 1341)).await.unwrap();

        let statuses = sup.status_map().await;
        assert_eq!(statuses.get(&1337), Some(&InstanceState::Running));
        assert_eq!(statuses.get(&1341), Some(&InstanceState::Running));
        assert_eq!(statuses.len(), 2);

        let info = sup.instance(1341).await.unwrap().unwrap();
        assert_eq!(info.internal_port, 1342);
        assert!(sup.instance(1339).await.unwrap().is_none());
        assert_eq!(sup.instance(9999).await.unwrap_err().code(), "invalid_port");

        sup.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let fx = fixture("sup-shutdown", ECHO_ARGS);
        let sup = &fx.supervisor;

        for port in [1337, 1339, 1341] {
            sup.start(InstanceConfig::new("m", port)).await.unwrap();
        }
        let results = sup.shutdown().await;
        assert_eq!(results.len(), 3);
        for (port, res) in results {
            assert_eq!(res.unwrap(), StopOutcome::Graceful, "port {port}");
        }
        assert!(sup.list().await.is_empty());
        assert!(sup.shutdown().await.is_empty());
    }

    #[tokio::test]
    async fn out_of_range_ports_are_invalid() {
        let fx = fixture("sup-port-range", ECHO_ARGS);
        let sup = &fx.supervisor;

        assert_eq!(sup.mapped_external_port(1337).unwrap(), 1337);
        for raw in [70000, -1, 9999, 1338] {
            match sup.mapped_external_port(raw) {
                Err(SupervisorError::InvalidPort { port, available }) => {
                    assert_eq!(port, raw);
                    assert!(available.contains(&1337));
                }
                other => panic!("port {raw}: {other:?}"),
            }
        }
    }
}
