use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{process::Command, sync::watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitState {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<std::process::ExitStatus> for ExitState {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

impl Signal {
    #[cfg(unix)]
    fn raw(self) -> libc::c_int {
        match self {
            Self::Terminate => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> io::Result<()> {
    // The worker must not outlive the supervisor.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> io::Result<()> {
    Ok(())
}

/// Puts the child in its own session so its pid is also its process group id.
/// Every [`WorkerProcess`] is spawned through this.
pub(crate) fn detach_into_own_group(cmd: &mut Command) {
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            set_parent_death_signal()?;
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

/// Owned handle to one spawned worker.
///
/// A background task reaps the child and publishes its exit; liveness is read
/// from that, never stored separately.
#[derive(Debug)]
pub struct WorkerProcess {
    pid: u32,
    exit: watch::Receiver<Option<ExitState>>,
}

impl WorkerProcess {
    pub fn spawn(cmd: &mut Command) -> io::Result<Self> {
        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("worker exited before its pid was observed"))?;

        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            let state = match child.wait().await {
                Ok(status) => ExitState::from(status),
                Err(err) => {
                    tracing::warn!(pid, %err, "failed to wait for worker");
                    ExitState {
                        code: None,
                        signal: None,
                    }
                }
            };
            tracing::debug!(pid, code = ?state.code, signal = ?state.signal, "worker reaped");
            let _ = tx.send(Some(state));
        });

        Ok(Self { pid, exit: rx })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    pub fn exit_state(&self) -> Option<ExitState> {
        *self.exit.borrow()
    }

    /// Waits up to `timeout` for the worker to exit. `None` means it is still
    /// running.
    pub async fn wait_exit(&self, timeout: Duration) -> Option<ExitState> {
        self.watch().wait_exit(timeout).await
    }

    /// A liveness view that can be used without holding the registry lock.
    pub fn watch(&self) -> ProcessWatch {
        ProcessWatch {
            pid: self.pid,
            exit: self.exit.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessWatch {
    pid: u32,
    exit: watch::Receiver<Option<ExitState>>,
}

impl ProcessWatch {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    pub async fn wait_exit(&self, timeout: Duration) -> Option<ExitState> {
        let mut rx = self.exit.clone();
        match tokio::time::timeout(timeout, rx.wait_for(|s| s.is_some())).await {
            Ok(Ok(state)) => *state,
            // The reaper never drops the sender before publishing.
            Ok(Err(_)) | Err(_) => *self.exit.borrow(),
        }
    }

    /// The group the worker leads. Its id is the worker's pid, fixed at spawn
    /// by `setsid`; it is never looked up again, so a recycled pid cannot
    /// redirect a signal.
    pub fn process_group(&self) -> ProcessGroup {
        ProcessGroup {
            pgid: self.pid as i32,
            leader: self.clone(),
            signalled: Arc::new(AtomicBool::new(false)),
        }
    }
}

pub(crate) fn is_no_such_process(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::ESRCH)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}

#[derive(Debug, Clone)]
pub struct ProcessGroup {
    pgid: i32,
    leader: ProcessWatch,
    /// Set once a signal was delivered. Until then an exited leader means
    /// the whole group is gone as far as we are concerned.
    signalled: Arc<AtomicBool>,
}

impl ProcessGroup {
    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    /// Sends `signal` to every member of the group.
    ///
    /// The first signal is refused with `ESRCH` once the leader has been
    /// reaped: its pid, and with it the group id, may already belong to an
    /// unrelated process.
    pub fn signal(&self, signal: Signal) -> io::Result<()> {
        #[cfg(unix)]
        {
            if !self.signalled.load(Ordering::Acquire) && !self.leader.is_alive() {
                return Err(io::Error::from_raw_os_error(libc::ESRCH));
            }
            self.signalled.store(true, Ordering::Release);
            let rc = unsafe { libc::kill(-self.pgid, signal.raw()) };
            if rc == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            let _ = signal;
            Err(io::Error::from(io::ErrorKind::Unsupported))
        }
    }

    /// True while the leader is unreaped or, after a signal was sent, any
    /// member of the group remains.
    pub fn is_alive(&self) -> bool {
        if self.leader.is_alive() {
            return true;
        }
        if !self.signalled.load(Ordering::Acquire) {
            return false;
        }
        #[cfg(unix)]
        {
            let rc = unsafe { libc::kill(-self.pgid, 0) };
            if rc == 0 {
                return true;
            }
            // EPERM still means the group exists.
            !is_no_such_process(&io::Error::last_os_error())
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    /// Samples liveness every `interval` until the group is gone or `timeout`
    /// elapses. Returns whether the group exited.
    pub async fn wait(&self, timeout: Duration, interval: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.is_alive() {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }
}
