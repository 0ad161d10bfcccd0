//! The opaque job runner behind `run start`.
//!
//! The engine never executes anything itself; it hands a recorded-run job to
//! a task queue and correlates the status events coming back. [`TaskQueue`]
//! is that seam. [`LocalQueue`] is the in-process implementation used by the
//! CLI and the tests; a deployment wires in its own.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Result, VersionError};
use crate::store::FolderId;

pub const DEFAULT_ENTRYPOINT: &str = "run.sh";

/// TTL applied to a job's credential once the job reaches a terminal state.
pub const FINISHED_JOB_CREDENTIAL_TTL: Duration = Duration::from_secs(3600);

/// Upper bound on a liveness probe round-trip.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Error,
}

/// Identifiers returned by the queue for a submitted job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub job_id: String,
    pub queue: String,
    pub node_id: String,
    pub container_name: String,
    pub task_id: String,
}

/// Bearer credential handed to workers for callbacks.
#[derive(Debug, Clone)]
pub struct Credential {
    pub token: String,
    pub expires: DateTime<Utc>,
}

impl Credential {
    pub fn short_lived(ttl: Duration) -> Self {
        Credential {
            token: uuid::Uuid::new_v4().to_string(),
            expires: Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
        }
    }
}

pub trait TaskQueue: Send + Sync {
    /// Dispatch a recorded-run job for `run_id` and return its handle.
    fn submit_recorded_run(
        &self,
        run_id: &FolderId,
        tale_id: &FolderId,
        entrypoint: &str,
    ) -> Result<JobHandle>;

    /// Names of worker queues currently alive.
    fn active_queues(&self) -> Result<Vec<String>>;

    /// Task ids currently active on a worker queue.
    fn active_tasks(&self, queue: &str) -> Result<Vec<String>>;

    /// Ask the worker whether the run's container is still alive.
    fn check_on_run(&self, node_id: &str, container_name: &str, timeout: Duration) -> Result<bool>;

    /// Dispatch a cleanup task for a dead run to its node.
    fn cleanup_run(&self, node_id: &str, run_id: &FolderId, credential: &Credential) -> Result<()>;

    /// Shorten the TTL of a job's credential.
    fn expire_job_credential(&self, job_id: &str, ttl: Duration) -> Result<()>;
}

#[derive(Default)]
struct LocalQueueState {
    // queue name -> active task ids
    queues: HashMap<String, Vec<String>>,
    // container name -> probe answer
    probes: HashMap<String, bool>,
    submitted: Vec<JobHandle>,
    cleaned: Vec<(String, FolderId)>,
    expired: Vec<(String, Duration)>,
    next_job: u64,
}

/// In-process [`TaskQueue`]. Jobs never actually execute; tests and the CLI
/// steer queue/task/probe state explicitly.
pub struct LocalQueue {
    state: Mutex<LocalQueueState>,
    queue_name: String,
    node_id: String,
}

impl LocalQueue {
    pub fn new() -> Self {
        let mut state = LocalQueueState::default();
        state.queues.insert("worker0".to_string(), Vec::new());
        LocalQueue {
            state: Mutex::new(state),
            queue_name: "worker0".to_string(),
            node_id: "node0".to_string(),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LocalQueueState>> {
        self.state.lock().map_err(|e| VersionError::JobQueue(e.to_string()))
    }

    /// Simulate a worker finishing or losing a task.
    pub fn drop_task(&self, task_id: &str) {
        if let Ok(mut state) = self.lock() {
            for tasks in state.queues.values_mut() {
                tasks.retain(|t| t != task_id);
            }
        }
    }

    /// Simulate a whole worker going away (or coming back).
    pub fn set_queue_alive(&self, queue: &str, alive: bool) {
        if let Ok(mut state) = self.lock() {
            if alive {
                state.queues.entry(queue.to_string()).or_default();
            } else {
                state.queues.remove(queue);
            }
        }
    }

    /// Fix the answer a liveness probe for `container_name` will give.
    pub fn set_probe(&self, container_name: &str, running: bool) {
        if let Ok(mut state) = self.lock() {
            state.probes.insert(container_name.to_string(), running);
        }
    }

    pub fn submitted(&self) -> Vec<JobHandle> {
        self.lock().map(|s| s.submitted.clone()).unwrap_or_default()
    }

    pub fn cleaned(&self) -> Vec<(String, FolderId)> {
        self.lock().map(|s| s.cleaned.clone()).unwrap_or_default()
    }

    pub fn expired(&self) -> Vec<(String, Duration)> {
        self.lock().map(|s| s.expired.clone()).unwrap_or_default()
    }
}

impl Default for LocalQueue {
    fn default() -> Self {
        LocalQueue::new()
    }
}

impl TaskQueue for LocalQueue {
    fn submit_recorded_run(
        &self,
        run_id: &FolderId,
        tale_id: &FolderId,
        entrypoint: &str,
    ) -> Result<JobHandle> {
        let mut state = self.lock()?;
        state.next_job += 1;
        let handle = JobHandle {
            job_id: format!("job-{}", state.next_job),
            queue: self.queue_name.clone(),
            node_id: self.node_id.clone(),
            container_name: format!("rrun-{}", run_id),
            task_id: format!("task-{}", state.next_job),
        };
        let queue_name = handle.queue.clone();
        let task_id = handle.task_id.clone();
        state.queues.entry(queue_name).or_default().push(task_id);
        state.probes.insert(handle.container_name.clone(), true);
        state.submitted.push(handle.clone());
        log::info!(
            "Submitted recorded run {} for tale {} (entrypoint {})",
            handle.job_id,
            tale_id,
            entrypoint
        );
        Ok(handle)
    }

    fn active_queues(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.queues.keys().cloned().collect())
    }

    fn active_tasks(&self, queue: &str) -> Result<Vec<String>> {
        Ok(self.lock()?.queues.get(queue).cloned().unwrap_or_default())
    }

    fn check_on_run(&self, _node_id: &str, container_name: &str, _timeout: Duration) -> Result<bool> {
        Ok(self.lock()?.probes.get(container_name).copied().unwrap_or(false))
    }

    fn cleanup_run(&self, node_id: &str, run_id: &FolderId, _credential: &Credential) -> Result<()> {
        log::info!("Dispatching cleanup for run {} on {}", run_id, node_id);
        self.lock()?.cleaned.push((node_id.to_string(), run_id.clone()));
        Ok(())
    }

    fn expire_job_credential(&self, job_id: &str, ttl: Duration) -> Result<()> {
        self.lock()?.expired.push((job_id.to_string(), ttl));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_registers_task() {
        let queue = LocalQueue::new();
        let run = FolderId::generate();
        let tale = FolderId::generate();

        let handle = queue.submit_recorded_run(&run, &tale, DEFAULT_ENTRYPOINT).unwrap();
        assert!(queue.active_queues().unwrap().contains(&handle.queue));
        assert!(queue.active_tasks(&handle.queue).unwrap().contains(&handle.task_id));
        assert!(queue.check_on_run(&handle.node_id, &handle.container_name, PROBE_TIMEOUT).unwrap());
    }

    #[test]
    fn test_drop_task_and_queue() {
        let queue = LocalQueue::new();
        let run = FolderId::generate();
        let tale = FolderId::generate();
        let handle = queue.submit_recorded_run(&run, &tale, DEFAULT_ENTRYPOINT).unwrap();

        queue.drop_task(&handle.task_id);
        assert!(queue.active_tasks(&handle.queue).unwrap().is_empty());

        queue.set_queue_alive(&handle.queue, false);
        assert!(!queue.active_queues().unwrap().contains(&handle.queue));
    }

    #[test]
    fn test_credential_expiry_recorded() {
        let queue = LocalQueue::new();
        queue.expire_job_credential("job-9", FINISHED_JOB_CREDENTIAL_TTL).unwrap();
        let expired = queue.expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, "job-9");
    }

    #[test]
    fn test_short_lived_credential() {
        let cred = Credential::short_lived(Duration::from_secs(300));
        assert!(cred.expires > Utc::now());
        assert!(!cred.token.is_empty());
    }
}
