use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct HostTelemetry {
    pub cpu: f64,
    pub ram: f64,
    pub gpu: u32,
}

/// Host CPU/RAM/GPU percentages. CPU is measured between successive calls, so
/// the first snapshot reports 0.
#[derive(Debug, Default)]
pub struct TelemetrySampler {
    last_cpu: Mutex<Option<CpuTimes>>,
}

impl TelemetrySampler {
    pub async fn snapshot(&self) -> HostTelemetry {
        let cpu = match read_cpu_times().await {
            Some(now) => {
                let mut last = self.last_cpu.lock().await;
                let pct = last.map(|prev| cpu_percent(prev, now)).unwrap_or(0.0);
                *last = Some(now);
                pct
            }
            None => 0.0,
        };
        HostTelemetry {
            cpu,
            ram: read_ram_percent().await.unwrap_or(0.0),
            gpu: read_gpu_percent().await,
        }
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Aggregate `cpu` line of `/proc/stat`. iowait counts as idle.
fn parse_proc_stat(s: &str) -> Option<CpuTimes> {
    let line = s.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|v| v.parse().ok())
        .collect::<Option<_>>()?;
    if fields.len() < 4 {
        return None;
    }
    // user nice system idle iowait irq softirq steal; guest time is already
    // included in user/nice.
    let total: u64 = fields.iter().take(8).sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

fn cpu_percent(prev: CpuTimes, now: CpuTimes) -> f64 {
    let total = now.total.saturating_sub(prev.total);
    if total == 0 {
        return 0.0;
    }
    let busy = now.busy.saturating_sub(prev.busy);
    round1((busy as f64 / total as f64 * 100.0).clamp(0.0, 100.0))
}

fn parse_meminfo_percent(s: &str) -> Option<f64> {
    let field = |name: &str| -> Option<u64> {
        s.lines()
            .find_map(|l| l.strip_prefix(name))
            .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
            .and_then(|v| v.parse().ok())
    };
    let total = field("MemTotal")?;
    let available = field("MemAvailable")?;
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(available);
    Some(round1(used as f64 / total as f64 * 100.0))
}

/// Highest utilization across GPUs from
/// `nvidia-smi --query-gpu=utilization.gpu --format=csv,noheader,nounits`.
fn parse_nvidia_smi(s: &str) -> u32 {
    s.lines()
        .filter_map(|l| l.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .fold(0.0_f64, f64::max)
        .clamp(0.0, 100.0) as u32
}

#[cfg(target_os = "linux")]
async fn read_cpu_times() -> Option<CpuTimes> {
    let s = tokio::fs::read_to_string("/proc/stat").await.ok()?;
    parse_proc_stat(&s)
}

#[cfg(not(target_os = "linux"))]
async fn read_cpu_times() -> Option<CpuTimes> {
    None
}

#[cfg(target_os = "linux")]
async fn read_ram_percent() -> Option<f64> {
    let s = tokio::fs::read_to_string("/proc/meminfo").await.ok()?;
    parse_meminfo_percent(&s)
}

#[cfg(not(target_os = "linux"))]
async fn read_ram_percent() -> Option<f64> {
    None
}

async fn read_gpu_percent() -> u32 {
    let out = tokio::process::Command::new("nvidia-smi")
        .args([
            "--query-gpu=utilization.gpu",
            "--format=csv,noheader,nounits",
        ])
        .kill_on_drop(true)
        .output()
        .await;
    match out {
        Ok(o) if o.status.success() => parse_nvidia_smi(&String::from_utf8_lossy(&o.stdout)),
        Ok(o) => {
            tracing::debug!(status = %o.status, "nvidia-smi failed");
            0
        }
        // Missing binary just means no GPU.
        Err(_) => 0,
    }
}
