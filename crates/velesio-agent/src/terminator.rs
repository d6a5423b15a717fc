use std::{io, path::Path, time::Duration};

use velesio_process::StopOutcome;

use crate::{
    error::SupervisorError,
    registry::StopTarget,
    supervisor::Supervisor,
    worker::{ProcessGroup, Signal, is_no_such_process},
};

/// Bounds for one escalating stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopTimings {
    /// How long a SIGTERM'd group gets before SIGKILL.
    pub grace: Duration,
    /// How long to wait for confirmation after SIGKILL.
    pub kill_wait: Duration,
    pub poll_interval: Duration,
}

pub(crate) async fn clear_log(path: &Path) {
    let res = tokio::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .await;
    match res {
        Ok(_) => tracing::debug!(path = %path.display(), "cleared log file"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(path = %path.display(), %err, "failed to clear log file"),
    }
}

/// SIGTERM, bounded wait, SIGKILL, bounded wait. A group that vanishes under
/// a signal counts as stopped; a leader reaped before the first signal is
/// `AlreadyExited` and is never signalled.
pub(crate) async fn terminate_group(
    group: &ProcessGroup,
    timings: StopTimings,
) -> io::Result<StopOutcome> {
    let pgid = group.pgid();

    match group.signal(Signal::Terminate) {
        Ok(()) => tracing::info!(pgid, "sent SIGTERM to process group"),
        Err(err) if is_no_such_process(&err) => return Ok(StopOutcome::AlreadyExited),
        Err(err) => return Err(err),
    }
    if group.wait(timings.grace, timings.poll_interval).await {
        return Ok(StopOutcome::Graceful);
    }

    tracing::warn!(
        pgid,
        grace_ms = timings.grace.as_millis() as u64,
        "process group ignored SIGTERM; sending SIGKILL"
    );
    match group.signal(Signal::Kill) {
        Ok(()) => {}
        Err(err) if is_no_such_process(&err) => return Ok(StopOutcome::Graceful),
        Err(err) => return Err(err),
    }
    if group.wait(timings.kill_wait, timings.poll_interval).await {
        return Ok(StopOutcome::Forced);
    }

    Err(io::Error::new(
        io::ErrorKind::TimedOut,
        format!(
            "process group {pgid} still alive {}ms after SIGKILL",
            timings.kill_wait.as_millis()
        ),
    ))
}

impl Supervisor {
    /// Stops the worker behind `external_port`. Stopping an empty slot
    /// succeeds.
    pub async fn stop(&self, external_port: u16) -> Result<StopOutcome, SupervisorError> {
        let internal_port = self.internal_port(external_port)?;

        let (process, log_file) = match self.registry.stop_target(internal_port).await {
            StopTarget::Absent => {
                tracing::debug!(external_port, internal_port, "stop: nothing running");
                return Ok(StopOutcome::NotRunning);
            }
            StopTarget::Exited(record) => {
                tracing::info!(
                    external_port,
                    internal_port,
                    pid = record.process.pid(),
                    "stop: worker had already exited"
                );
                return Ok(StopOutcome::AlreadyExited);
            }
            StopTarget::Live { process, log_file } => (process, log_file),
        };

        let pid = process.pid();
        tracing::info!(external_port, internal_port, pid, "stopping worker");

        let group = process.process_group();
        match terminate_group(&group, self.settings.stop_timings()).await {
            Ok(outcome) => {
                self.finish(internal_port, pid, &log_file).await;
                tracing::info!(external_port, internal_port, pid, ?outcome, "worker stopped");
                Ok(outcome)
            }
            Err(err) => Err(self
                .fail_stop(external_port, internal_port, pid, &group, &log_file, err)
                .await),
        }
    }

    /// Drops the record for `pid` and clears its log, unless a new instance
    /// already owns the slot.
    async fn finish(&self, internal_port: u16, pid: u32, log_file: &Path) {
        if self.registry.finish_stop(internal_port, pid).await {
            clear_log(log_file).await;
        }
    }

    /// Settles the registry after a stop that could not confirm the group's
    /// exit. The record goes only if the group is gone by now; while it may
    /// still be alive the record stays so the instance remains visible.
    async fn fail_stop(
        &self,
        external_port: u16,
        internal_port: u16,
        pid: u32,
        group: &ProcessGroup,
        log_file: &Path,
        err: io::Error,
    ) -> SupervisorError {
        let dead = !group.is_alive();
        if dead {
            self.finish(internal_port, pid, log_file).await;
        }
        tracing::error!(external_port, internal_port, pid, %err, dead, "stop failed");
        SupervisorError::StopFailed {
            external_port,
            message: err.to_string(),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Instant;

    use velesio_process::InstanceConfig;

    use super::*;
    use crate::{port_alloc::PortMapping, supervisor::test_support::*};

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let fx = fixture("stop-noop", ECHO_ARGS);
        let outcome = fx.supervisor.stop(1337).await.unwrap();
        assert_eq!(outcome, StopOutcome::NotRunning);
    }

    #[tokio::test]
    async fn unmapped_port_is_rejected() {
        let fx = fixture("stop-invalid", ECHO_ARGS);
        let err = fx.supervisor.stop(9999).await.unwrap_err();
        assert_eq!(err.code(), "invalid_port");
    }

    #[tokio::test]
    async fn graceful_stop_clears_record_and_log() {
        let fx = fixture("stop-graceful", ECHO_ARGS);
        let sup = &fx.supervisor;

        let started = sup.start(InstanceConfig::new("m", 1337)).await.unwrap();
        let log = std::path::PathBuf::from(&started.log_file);
        assert!(
            eventually(|| async {
                std::fs::read_to_string(&log).is_ok_and(|s| !s.is_empty())
            })
            .await
        );

        assert_eq!(sup.stop(1337).await.unwrap(), StopOutcome::Graceful);
        assert!(!sup.list().await.contains_key(&1337));
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "");

        // Process group is gone.
        let rc = unsafe { libc::kill(-(started.pid as i32), 0) };
        assert_eq!(rc, -1);

        assert_eq!(sup.stop(1337).await.unwrap(), StopOutcome::NotRunning);
    }

    #[tokio::test]
    async fn stubborn_worker_is_killed_within_bound() {
        let fx = fixture("stop-forced", IGNORE_TERM);
        let sup = &fx.supervisor;

        let started = sup.start(InstanceConfig::new("m", 1339)).await.unwrap();
        let log = std::path::PathBuf::from(&started.log_file);
        // Wait until the trap is installed.
        assert!(
            eventually(|| async {
                std::fs::read_to_string(&log).is_ok_and(|s| s.contains("ready"))
            })
            .await
        );

        let t0 = Instant::now();
        assert_eq!(sup.stop(1339).await.unwrap(), StopOutcome::Forced);
        let elapsed = t0.elapsed();

        let grace = sup.settings().stop_grace;
        assert_eq!(sup.settings().stop_timings().grace, grace);
        let bound = grace + sup.settings().kill_wait + Duration::from_secs(1);
        assert!(elapsed >= grace, "killed before grace elapsed: {elapsed:?}");
        assert!(elapsed < bound, "stop took {elapsed:?}");

        assert!(sup.list().await.is_empty());
        let rc = unsafe { libc::kill(-(started.pid as i32), 0) };
        assert_eq!(rc, -1);
    }

    #[tokio::test]
    async fn stop_after_crash_reports_already_exited() {
        let fx = fixture("stop-crashed", CRASH_LATE);
        let sup = &fx.supervisor;

        sup.start(InstanceConfig::new("m", 1341)).await.unwrap();
        let StopTarget::Live { process, .. } = sup.registry.stop_target(1342).await else {
            panic!("worker should still be running");
        };
        assert!(eventually(|| async { !process.is_alive() }).await);

        assert_eq!(sup.stop(1341).await.unwrap(), StopOutcome::AlreadyExited);
        assert!(sup.list().await.is_empty());
        assert_eq!(sup.stop(1341).await.unwrap(), StopOutcome::NotRunning);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_stops_both_succeed() {
        let fx = fixture("stop-concurrent", ECHO_ARGS);
        let sup = fx.supervisor.clone();
        sup.start(InstanceConfig::new("m", 1345)).await.unwrap();

        let a = tokio::spawn({
            let sup = sup.clone();
            async move { sup.stop(1345).await }
        });
        let b = tokio::spawn({
            let sup = sup.clone();
            async move { sup.stop(1345).await }
        });
        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
        assert!(sup.list().await.is_empty());
    }

    #[tokio::test]
    async fn restart_after_stop_reuses_slot() {
        let fx = fixture("stop-restart", ECHO_ARGS);
        let sup = &fx.supervisor;

        let first = sup.start(InstanceConfig::new("m", 1337)).await.unwrap();
        sup.stop(1337).await.unwrap();
        let second = sup.start(InstanceConfig::new("m", 1337)).await.unwrap();
        assert_ne!(first.pid, second.pid);
        assert_eq!(sup.list().await.len(), 1);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn unconfirmed_kill_reports_stop_failed() {
        let mut fx = fixture("stop-unconfirmed", IGNORE_TERM);
        let mut settings = fx.supervisor.settings().clone();
        settings.stop_grace = Duration::from_millis(200);
        // No time at all for the SIGKILL to be observed.
        settings.kill_wait = Duration::ZERO;
        fx.supervisor = Supervisor::new(settings, PortMapping::default());
        let sup = &fx.supervisor;

        let started = sup.start(InstanceConfig::new("m", 1343)).await.unwrap();
        let log = std::path::PathBuf::from(&started.log_file);
        assert!(
            eventually(|| async {
                std::fs::read_to_string(&log).is_ok_and(|s| s.contains("ready"))
            })
            .await
        );

        let err = sup.stop(1343).await.unwrap_err();
        assert_eq!(err.code(), "stop_failed");
        assert!(matches!(err, SupervisorError::StopFailed { external_port: 1343, .. }));

        // The SIGKILL did land; the slot is reclaimed once the exit is seen.
        assert!(eventually(|| async { sup.list().await.is_empty() }).await);
        assert!(matches!(
            sup.stop(1343).await.unwrap(),
            StopOutcome::NotRunning | StopOutcome::AlreadyExited
        ));
    }

    #[tokio::test]
    async fn failed_stop_keeps_record_only_while_group_may_live() {
        let fx = fixture("stop-fail-settle", ECHO_ARGS);
        let sup = &fx.supervisor;

        let started = sup.start(InstanceConfig::new("m", 1337)).await.unwrap();
        let StopTarget::Live { process, log_file } = sup.registry.stop_target(1338).await else {
            panic!("worker should be running");
        };
        assert!(
            eventually(|| async {
                std::fs::read_to_string(&log_file).is_ok_and(|s| !s.is_empty())
            })
            .await
        );
        let group = process.process_group();

        let err = sup
            .fail_stop(1337, 1338, started.pid, &group, &log_file, io::Error::other("boom"))
            .await;
        assert_eq!(err.code(), "stop_failed");
        assert!(sup.registry.contains(1338).await);
        assert!(!std::fs::read_to_string(&log_file).unwrap().is_empty());

        group.signal(Signal::Kill).unwrap();
        assert!(eventually(|| async { !group.is_alive() }).await);

        sup.fail_stop(1337, 1338, started.pid, &group, &log_file, io::Error::other("boom"))
            .await;
        assert!(!sup.registry.contains(1338).await);
        assert_eq!(std::fs::read_to_string(&log_file).unwrap(), "");
    }
}
