use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, Pid, ProcessRefreshKind, RefreshKind, System};
use tokio::time::{interval, Duration};

#[derive(Debug, Clone)]
pub struct ResourceSample {
    pub timestamp: f64,
    pub cpu_usage: f32,
    pub memory_mb: f64,
    pub process_count: usize,
}

/// Aggregates over all samples taken while tool processes were running.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceStats {
    pub peak_cpu: f32,
    pub peak_memory_mb: f64,
    pub avg_cpu: f32,
    pub avg_memory_mb: f64,
    pub peak_processes: usize,
    pub sample_count: usize,
    pub load_avg_1min: f64,
}

impl ResourceStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idle samples (no tracked process alive) do not dilute the averages.
    pub fn add_sample(&mut self, sample: &ResourceSample) {
        if sample.process_count == 0 {
            return;
        }

        self.peak_cpu = self.peak_cpu.max(sample.cpu_usage);
        self.peak_memory_mb = self.peak_memory_mb.max(sample.memory_mb);
        self.peak_processes = self.peak_processes.max(sample.process_count);

        let n = self.sample_count as f64;
        self.avg_cpu = ((self.avg_cpu as f64 * n + sample.cpu_usage as f64) / (n + 1.0)) as f32;
        self.avg_memory_mb = (self.avg_memory_mb * n + sample.memory_mb) / (n + 1.0);
        self.sample_count += 1;
    }
}

/// Samples CPU and memory of the tool processes registered with `add_pid`.
#[derive(Clone)]
pub struct ResourceMonitor {
    stats: Arc<Mutex<ResourceStats>>,
    tracked_pids: Arc<Mutex<Vec<Pid>>>,
    start_time: Instant,
    period: Duration,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(Mutex::new(ResourceStats::new())),
            tracked_pids: Arc::new(Mutex::new(Vec::new())),
            start_time: Instant::now(),
            period: Duration::from_millis(500),
        }
    }

    pub fn add_pid(&self, pid: u32) {
        if let Ok(mut pids) = self.tracked_pids.lock() {
            pids.push(Pid::from_u32(pid));
        }
    }

    pub fn remove_pid(&self, pid: u32) {
        if let Ok(mut pids) = self.tracked_pids.lock() {
            pids.retain(|p| p.as_u32() != pid);
        }
    }

    pub fn tracked(&self) -> usize {
        self.tracked_pids.lock().map(|pids| pids.len()).unwrap_or(0)
    }

    /// Runs until the returned handle is aborted.
    pub fn start_monitoring(&self) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();

        tokio::spawn(async move {
            let mut sys = System::new_with_specifics(
                RefreshKind::new()
                    .with_cpu(CpuRefreshKind::everything())
                    .with_memory(MemoryRefreshKind::everything())
                    .with_processes(ProcessRefreshKind::new().with_cpu().with_memory()),
            );

            let mut ticker = interval(monitor.period);

            loop {
                ticker.tick().await;

                let pids = match monitor.tracked_pids.lock() {
                    Ok(pids) => pids.clone(),
                    Err(_) => break,
                };
                if pids.is_empty() {
                    continue;
                }

                sys.refresh_processes();

                let mut sample = ResourceSample {
                    timestamp: monitor.start_time.elapsed().as_secs_f64(),
                    cpu_usage: 0.0,
                    memory_mb: 0.0,
                    process_count: 0,
                };

                for pid in &pids {
                    if let Some(process) = sys.process(*pid) {
                        sample.cpu_usage += process.cpu_usage();
                        sample.memory_mb += process.memory() as f64 / 1024.0 / 1024.0;
                        sample.process_count += 1;
                    }
                }

                let load_avg = System::load_average().one;

                if let Ok(mut stats) = monitor.stats.lock() {
                    stats.load_avg_1min = load_avg;
                    stats.add_sample(&sample);
                }
            }
        })
    }

    pub fn get_stats(&self) -> ResourceStats {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu: f32, memory_mb: f64, processes: usize) -> ResourceSample {
        ResourceSample {
            timestamp: 0.0,
            cpu_usage: cpu,
            memory_mb,
            process_count: processes,
        }
    }

    #[test]
    fn test_peaks_and_averages() {
        let mut stats = ResourceStats::new();
        stats.add_sample(&sample(100.0, 512.0, 1));
        stats.add_sample(&sample(0.0, 0.0, 0));
        stats.add_sample(&sample(300.0, 1024.0, 2));

        assert_eq!(stats.sample_count, 2);
        assert_eq!(stats.peak_cpu, 300.0);
        assert_eq!(stats.peak_memory_mb, 1024.0);
        assert_eq!(stats.peak_processes, 2);
        assert_eq!(stats.avg_cpu, 200.0);
        assert_eq!(stats.avg_memory_mb, 768.0);
    }

    #[test]
    fn test_pid_tracking() {
        let monitor = ResourceMonitor::new();
        monitor.add_pid(41);
        monitor.add_pid(42);
        monitor.remove_pid(41);
        assert_eq!(monitor.tracked(), 1);
    }
}
