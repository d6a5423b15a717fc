use std::{collections::HashMap, path::PathBuf, sync::Arc};

use tokio::sync::Mutex;
use velesio_process::{InstanceConfig, InstanceInfo, InstanceState};

use crate::{
    port_alloc::PortMapping,
    worker::{ProcessWatch, WorkerProcess},
};

/// Live state for one occupied internal port. The external port is not
/// stored; it is derived from the port mapping.
#[derive(Debug)]
pub struct InstanceRecord {
    pub process: WorkerProcess,
    pub config: InstanceConfig,
    pub log_file: PathBuf,
    pub model_path: PathBuf,
    pub started_at_unix_ms: u64,
}

impl InstanceRecord {
    fn info(&self, internal_port: u16, external_port: u16) -> InstanceInfo {
        InstanceInfo {
            external_port,
            internal_port,
            pid: self.process.pid(),
            status: if self.process.is_alive() {
                InstanceState::Running
            } else {
                InstanceState::Stopped
            },
            log_file: self.log_file.display().to_string(),
            model_path: self.model_path.display().to_string(),
            started_at_unix_ms: self.started_at_unix_ms,
            config: self.config.clone(),
        }
    }
}

#[derive(Debug)]
enum Slot {
    /// A start is in flight; the port is taken but nothing runs yet.
    Reserved,
    Occupied(InstanceRecord),
}

/// What a stop request found in the slot.
#[derive(Debug)]
pub enum StopTarget {
    Absent,
    /// The worker had exited on its own; its record is already evicted.
    Exited(InstanceRecord),
    Live {
        process: ProcessWatch,
        log_file: PathBuf,
    },
}

#[derive(Debug, Default)]
pub struct Sweep {
    pub live: Vec<InstanceInfo>,
    /// External ports whose records were evicted by this sweep.
    pub evicted: Vec<u16>,
}

/// Internal port -> instance. Every method runs under the one mutex; dead
/// records are evicted before any decision is made about them.
#[derive(Clone, Debug)]
pub struct InstanceRegistry {
    ports: Arc<PortMapping>,
    inner: Arc<Mutex<HashMap<u16, Slot>>>,
}

fn evict_if_dead(
    map: &mut HashMap<u16, Slot>,
    internal_port: u16,
    external_port: u16,
) -> Option<InstanceRecord> {
    let dead = matches!(
        map.get(&internal_port),
        Some(Slot::Occupied(r)) if !r.process.is_alive()
    );
    if !dead {
        return None;
    }
    match map.remove(&internal_port) {
        Some(Slot::Occupied(record)) => {
            log_eviction(internal_port, external_port, &record);
            Some(record)
        }
        _ => None,
    }
}

fn log_eviction(internal_port: u16, external_port: u16, record: &InstanceRecord) {
    let exit = record.process.exit_state();
    tracing::warn!(
        internal_port,
        external_port,
        pid = record.process.pid(),
        code = ?exit.and_then(|e| e.code),
        signal = ?exit.and_then(|e| e.signal),
        "worker exited on its own; evicting stale record"
    );
}

impl InstanceRegistry {
    pub fn new(ports: Arc<PortMapping>) -> Self {
        Self {
            ports,
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// External port for a registry key. Keys are only ever produced by
    /// mapping an external port, so the lookup cannot miss for a stored slot.
    fn external_of(&self, internal_port: u16) -> u16 {
        self.ports.external_of(internal_port).unwrap_or(internal_port)
    }

    fn evict_if_dead(
        &self,
        map: &mut HashMap<u16, Slot>,
        internal_port: u16,
    ) -> Option<InstanceRecord> {
        evict_if_dead(map, internal_port, self.external_of(internal_port))
    }

    /// Claims `internal_port` for a start. Fails if a live instance or another
    /// in-flight start holds it.
    pub async fn try_reserve(&self, internal_port: u16) -> bool {
        let mut map = self.inner.lock().await;
        self.evict_if_dead(&mut map, internal_port);
        if map.contains_key(&internal_port) {
            return false;
        }
        map.insert(internal_port, Slot::Reserved);
        true
    }

    /// Drops a reservation after a failed start. Running records are untouched.
    pub async fn release(&self, internal_port: u16) {
        let mut map = self.inner.lock().await;
        if matches!(map.get(&internal_port), Some(Slot::Reserved)) {
            map.remove(&internal_port);
        }
    }

    pub async fn insert(&self, internal_port: u16, record: InstanceRecord) {
        let mut map = self.inner.lock().await;
        if let Some(Slot::Occupied(old)) = map.get(&internal_port) {
            tracing::error!(
                internal_port,
                old_pid = old.process.pid(),
                new_pid = record.process.pid(),
                "replacing an occupied slot without a reservation"
            );
        }
        map.insert(internal_port, Slot::Occupied(record));
    }

    pub async fn get(&self, internal_port: u16) -> Option<InstanceInfo> {
        let mut map = self.inner.lock().await;
        self.evict_if_dead(&mut map, internal_port);
        match map.get(&internal_port) {
            Some(Slot::Occupied(r)) => {
                Some(r.info(internal_port, self.external_of(internal_port)))
            }
            _ => None,
        }
    }

    pub async fn remove(&self, internal_port: u16) -> Option<InstanceRecord> {
        let mut map = self.inner.lock().await;
        match map.remove(&internal_port) {
            Some(Slot::Occupied(r)) => Some(r),
            Some(Slot::Reserved) => {
                // Keep in-flight starts intact.
                map.insert(internal_port, Slot::Reserved);
                None
            }
            None => None,
        }
    }

    /// Evicts every dead record and reports the survivors plus what was
    /// evicted.
    pub async fn sweep(&self) -> Sweep {
        let mut map = self.inner.lock().await;
        let dead: Vec<u16> = map
            .iter()
            .filter_map(|(port, slot)| match slot {
                Slot::Occupied(r) if !r.process.is_alive() => Some(*port),
                _ => None,
            })
            .collect();

        let mut out = Sweep::default();
        for port in dead {
            if self.evict_if_dead(&mut map, port).is_some() {
                out.evicted.push(self.external_of(port));
            }
        }
        for (port, slot) in map.iter() {
            if let Slot::Occupied(r) = slot {
                out.live.push(r.info(*port, self.external_of(*port)));
            }
        }
        out.live.sort_by_key(|i| i.external_port);
        out.evicted.sort_unstable();
        out
    }

    /// `(external_port, info)` for every instance still running.
    pub async fn list_live(&self) -> Vec<(u16, InstanceInfo)> {
        self.sweep()
            .await
            .live
            .into_iter()
            .map(|i| (i.external_port, i))
            .collect()
    }

    pub async fn stop_target(&self, internal_port: u16) -> StopTarget {
        let mut map = self.inner.lock().await;
        if let Some(record) = self.evict_if_dead(&mut map, internal_port) {
            return StopTarget::Exited(record);
        }
        match map.get(&internal_port) {
            Some(Slot::Occupied(r)) => StopTarget::Live {
                process: r.process.watch(),
                log_file: r.log_file.clone(),
            },
            _ => StopTarget::Absent,
        }
    }

    /// Whether anything occupies the slot, without reconciling it first.
    #[cfg(test)]
    pub(crate) async fn contains(&self, internal_port: u16) -> bool {
        self.inner.lock().await.contains_key(&internal_port)
    }

    /// Removes the record for `pid` after a stop. Returns whether the slot is
    /// now free; `false` means another instance already took it over.
    pub async fn finish_stop(&self, internal_port: u16, pid: u32) -> bool {
        let mut map = self.inner.lock().await;
        match map.get(&internal_port) {
            None => true,
            Some(Slot::Occupied(r)) if r.process.pid() == pid => {
                map.remove(&internal_port);
                true
            }
            Some(_) => false,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use tokio::process::Command;

    use super::*;

    fn registry() -> InstanceRegistry {
        InstanceRegistry::new(Arc::new(PortMapping::default()))
    }

    fn record(script: &str) -> InstanceRecord {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(script);
        crate::worker::detach_into_own_group(&mut cmd);
        InstanceRecord {
            process: WorkerProcess::spawn(&mut cmd).unwrap(),
            config: InstanceConfig::new("m", 0),
            log_file: PathBuf::from("/dev/null"),
            model_path: PathBuf::from("/models/llm/m"),
            started_at_unix_ms: 0,
        }
    }

    async fn wait_dead(reg: &InstanceRegistry, internal_port: u16) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            {
                let map = reg.inner.lock().await;
                match map.get(&internal_port) {
                    Some(Slot::Occupied(r)) if r.process.is_alive() => {}
                    _ => return,
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "worker never exited");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn kill(reg: &InstanceRegistry, internal_port: u16) {
        if let Some(r) = reg.remove(internal_port).await {
            let _ = r
                .process
                .watch()
                .process_group()
                .signal(crate::worker::Signal::Kill);
        }
    }

    #[tokio::test]
    async fn reservation_is_exclusive() {
        let reg = registry();
        assert!(reg.try_reserve(1338).await);
        assert!(!reg.try_reserve(1338).await);
        // Reservations are not visible as instances.
        assert!(reg.get(1338).await.is_none());
        assert!(reg.list_live().await.is_empty());

        reg.release(1338).await;
        assert!(reg.try_reserve(1338).await);
    }

    #[tokio::test]
    async fn live_record_blocks_reservation() {
        let reg = registry();
        assert!(reg.try_reserve(1338).await);
        reg.insert(1338, record("sleep 30")).await;

        assert!(!reg.try_reserve(1338).await);
        // Release never drops a running instance.
        reg.release(1338).await;
        let info = reg.get(1338).await.unwrap();
        assert_eq!(info.external_port, 1337);
        assert_eq!(info.status, InstanceState::Running);

        let live = reg.list_live().await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].0, 1337);

        kill(&reg, 1338).await;
    }

    #[tokio::test]
    async fn dead_records_are_reconciled_on_read() {
        let reg = registry();
        reg.insert(1338, record("exit 1")).await;
        reg.insert(1340, record("sleep 30")).await;
        wait_dead(&reg, 1338).await;

        let sweep = reg.sweep().await;
        assert_eq!(sweep.evicted, vec![1337]);
        assert_eq!(sweep.live.len(), 1);
        assert_eq!(sweep.live[0].external_port, 1339);

        // Second sweep reflects post-eviction state.
        let sweep = reg.sweep().await;
        assert!(sweep.evicted.is_empty());
        assert_eq!(sweep.live.len(), 1);

        kill(&reg, 1340).await;
    }

    #[tokio::test]
    async fn crashed_slot_can_be_reserved_again() {
        let reg = registry();
        reg.insert(1338, record("exit 0")).await;
        wait_dead(&reg, 1338).await;

        assert!(reg.try_reserve(1338).await);
        assert!(reg.get(1338).await.is_none());
    }

    #[tokio::test]
    async fn stop_target_classifies_slots() {
        let reg = registry();
        assert!(matches!(reg.stop_target(1338).await, StopTarget::Absent));

        reg.insert(1338, record("exit 0")).await;
        wait_dead(&reg, 1338).await;
        assert!(matches!(reg.stop_target(1338).await, StopTarget::Exited(_)));
        assert!(matches!(reg.stop_target(1338).await, StopTarget::Absent));

        reg.insert(1338, record("sleep 30")).await;
        let StopTarget::Live { process, .. } = reg.stop_target(1338).await else {
            panic!("expected live target");
        };
        // Still registered while the stop is in progress.
        assert!(reg.get(1338).await.is_some());
        assert!(!reg.finish_stop(1338, process.pid() + 1).await);
        kill(&reg, 1338).await;
        assert!(reg.finish_stop(1338, process.pid()).await);
    }

    #[tokio::test]
    async fn external_port_comes_from_the_mapping() {
        let ports = PortMapping::new([(8080, 9090), (8081, 9091)]).unwrap();
        let reg = InstanceRegistry::new(Arc::new(ports));
        reg.insert(9091, record("sleep 30")).await;

        let live = reg.list_live().await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].0, 8081);
        assert_eq!(live[0].1.internal_port, 9091);
        assert_eq!(reg.get(9091).await.unwrap().external_port, 8081);

        kill(&reg, 9091).await;
    }
}
