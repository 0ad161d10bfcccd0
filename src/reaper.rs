use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::Result;
use crate::jobs::{Credential, TaskQueue, PROBE_TIMEOUT};
use crate::runs::{RunEngine, RunStatus};

/// Credential lifetime for a dispatched cleanup task.
const CLEANUP_CREDENTIAL_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Runs looked at (live status + worker identifiers present).
    pub examined: u64,
    /// `RUNNING` runs demoted to `UNKNOWN` because their worker was gone.
    pub demoted: u64,
    /// Dead runs for which a cleanup task was dispatched.
    pub cleaned: u64,
}

/// One pass over the live runs. A run whose worker queue is absent is
/// demoted from `RUNNING` to `UNKNOWN` (to be dealt with once the worker is
/// back); a run whose task is gone, or whose container fails the bounded
/// liveness probe, gets a cleanup task dispatched to its node.
pub fn sweep(runs: &RunEngine, queue: &dyn TaskQueue) -> Result<SweepStats> {
    let mut stats = SweepStats::default();
    let candidates = runs.heartbeat_candidates()?;
    if candidates.is_empty() {
        return Ok(stats);
    }
    let active_queues = queue.active_queues()?;

    for run in candidates {
        stats.examined += 1;
        let Some(meta) = run.run_meta.as_ref() else {
            continue;
        };
        let status = run
            .run_status
            .and_then(RunStatus::from_code)
            .unwrap_or(RunStatus::Unknown);

        if !active_queues.contains(&meta.queue) {
            if status == RunStatus::Running {
                log::warn!("Worker queue {} for run {} is gone; demoting to UNKNOWN", meta.queue, run.id);
                runs.set_status(&run.id, RunStatus::Unknown)?;
                stats.demoted += 1;
            }
            continue;
        }

        let mut dead = !queue.active_tasks(&meta.queue)?.contains(&meta.task_id);
        if !dead {
            dead = !queue.check_on_run(&meta.node_id, &meta.container_name, PROBE_TIMEOUT)?;
        }

        if dead {
            log::warn!("Run {} has no live worker task; dispatching cleanup on {}", run.id, meta.node_id);
            let credential = Credential::short_lived(CLEANUP_CREDENTIAL_TTL);
            queue.cleanup_run(&meta.node_id, &run.id, &credential)?;
            stats.cleaned += 1;
        }
    }
    Ok(stats)
}

/// Periodic heartbeat sweeper. Runs [`sweep`] on its own thread until
/// stopped; tolerant of concurrent user requests.
pub struct HeartbeatReaper {
    running: Arc<AtomicBool>,
    sweeps: Arc<AtomicU64>,
    handle: Option<thread::JoinHandle<()>>,
}

impl HeartbeatReaper {
    pub fn start(runs: RunEngine, queue: Arc<dyn TaskQueue>, interval: Duration) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let sweeps = Arc::new(AtomicU64::new(0));

        let thread_running = Arc::clone(&running);
        let thread_sweeps = Arc::clone(&sweeps);
        let handle = thread::spawn(move || {
            log::info!("Heartbeat reaper started (interval {:?})", interval);
            while thread_running.load(Ordering::Relaxed) {
                match sweep(&runs, queue.as_ref()) {
                    Ok(stats) => {
                        thread_sweeps.fetch_add(1, Ordering::Relaxed);
                        if stats.demoted > 0 || stats.cleaned > 0 {
                            log::info!(
                                "Heartbeat sweep: {} examined, {} demoted, {} cleaned",
                                stats.examined,
                                stats.demoted,
                                stats.cleaned
                            );
                        }
                    }
                    Err(e) => log::error!("Heartbeat sweep failed: {}", e),
                }

                // Sleep in short slices so stop() is prompt.
                let mut remaining = interval;
                while thread_running.load(Ordering::Relaxed) && remaining > Duration::ZERO {
                    let slice = remaining.min(Duration::from_millis(100));
                    thread::sleep(slice);
                    remaining = remaining.saturating_sub(slice);
                }
            }
            log::info!("Heartbeat reaper stopped");
        });

        HeartbeatReaper { running, sweeps, handle: Some(handle) }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn sweep_count(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HeartbeatReaper {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::VersioningService;
    use crate::store::FolderId;
    use std::fs;

    fn setup() -> (tempfile::TempDir, VersioningService, FolderId) {
        let tmp = tempfile::tempdir().unwrap();
        let service = VersioningService::in_memory(crate::config::Config::under(tmp.path())).unwrap();
        let workspace = tmp.path().join("workspace");
        fs::create_dir_all(&workspace).unwrap();
        fs::write(workspace.join("run.sh"), "#!/bin/sh\n").unwrap();
        let tale = service.create_tale("Demo", "u1", &workspace).unwrap();
        let version = service.versions().create(&tale.id, Some("v1"), false, false).unwrap();
        let run = service.runs().create(&version.id, Some("r1"), false).unwrap();
        (tmp, service, run.id)
    }

    #[test]
    fn test_sweep_ignores_healthy_run() {
        let (_tmp, service, run_id) = setup();
        service.runs().start(&run_id, None).unwrap();
        service.runs().set_status(&run_id, RunStatus::Running).unwrap();

        let stats = sweep(service.runs(), service.runs().queue()).unwrap();
        assert_eq!(stats, SweepStats { examined: 1, demoted: 0, cleaned: 0 });
        assert_eq!(service.runs().get_status(&run_id).unwrap().1, "RUNNING");
    }

    #[test]
    fn test_sweep_demotes_when_worker_gone() {
        let (_tmp, service, run_id) = setup();
        let handle = service.runs().start(&run_id, None).unwrap();
        service.runs().set_status(&run_id, RunStatus::Running).unwrap();

        let local = service.local_queue().unwrap();
        local.set_queue_alive(&handle.queue, false);

        let stats = sweep(service.runs(), service.runs().queue()).unwrap();
        assert_eq!(stats.demoted, 1);
        assert_eq!(stats.cleaned, 0);
        assert_eq!(service.runs().get_status(&run_id).unwrap().1, "UNKNOWN");
    }

    #[test]
    fn test_sweep_cleans_lost_task() {
        let (_tmp, service, run_id) = setup();
        let handle = service.runs().start(&run_id, None).unwrap();
        service.runs().set_status(&run_id, RunStatus::Running).unwrap();

        let local = service.local_queue().unwrap();
        local.drop_task(&handle.task_id);

        let stats = sweep(service.runs(), service.runs().queue()).unwrap();
        assert_eq!(stats.cleaned, 1);
        let cleaned = local.cleaned();
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned[0].1, run_id);
    }

    #[test]
    fn test_sweep_cleans_failed_probe() {
        let (_tmp, service, run_id) = setup();
        let handle = service.runs().start(&run_id, None).unwrap();
        service.runs().set_status(&run_id, RunStatus::Running).unwrap();

        let local = service.local_queue().unwrap();
        local.set_probe(&handle.container_name, false);

        let stats = sweep(service.runs(), service.runs().queue()).unwrap();
        assert_eq!(stats.cleaned, 1);
    }

    #[test]
    fn test_reaper_lifecycle() {
        let (_tmp, service, _run_id) = setup();
        let mut reaper = HeartbeatReaper::start(
            service.runs().clone(),
            service.queue(),
            Duration::from_millis(10),
        );
        assert!(reaper.is_running());

        // Poll until a sweep has happened or retries are exhausted.
        let mut retries = 50;
        while reaper.sweep_count() == 0 && retries > 0 {
            thread::sleep(Duration::from_millis(10));
            retries -= 1;
        }
        assert!(reaper.sweep_count() > 0);

        reaper.stop();
        assert!(!reaper.is_running());
    }
}
