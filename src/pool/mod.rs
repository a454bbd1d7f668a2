//! Worker pool dispatch for job processing.
//!
//! A fixed set of workers drains a shared job feed and runs the full
//! stage pipeline for one job at a time, sending each result back to
//! the coordinator. Communication is message passing only: the feed is
//! a single-consumer queue, so a job is owned by exactly one worker and
//! is never dispatched twice. The coordinator blocks until every job
//! has returned a result, then releases all workers.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

use crate::error::PoolError;
use crate::job::{Job, JobOutcome};
use crate::stage::StageRunner;

/// The dispatch capability: run every submitted job exactly once and
/// return all results at a single barrier.
///
/// The stage pipeline never assumes a transport; an implementation may
/// back this with in-process tasks, OS processes, or remote workers.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, jobs: Vec<Job>) -> Result<(Vec<JobOutcome>, PoolStats), PoolError>;
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Requested parallelism, including the coordinator's slot.
    pub parallelism: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { parallelism: 4 }
    }
}

impl WorkerPoolConfig {
    pub fn new(parallelism: usize) -> Self {
        Self { parallelism }
    }

    /// Number of worker tasks: one slot is reserved for the
    /// coordinator, and there is always at least one worker.
    pub fn worker_count(&self) -> usize {
        self.parallelism.saturating_sub(1).max(1)
    }
}

/// Statistics about a completed dispatch.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    /// Jobs whose pipeline completed and passed comparison.
    pub completed: u64,
    /// Jobs that failed a stage or missed the similarity threshold.
    pub failed: u64,
}

impl PoolStats {
    pub fn total(&self) -> u64 {
        self.completed + self.failed
    }

    /// Success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        (self.completed as f64 / total as f64) * 100.0
    }

    fn record(&mut self, outcome: &JobOutcome) {
        if outcome.is_success() {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Worker pool that runs the stage pipeline for every job exactly once.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    runner: Arc<StageRunner>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, runner: Arc<StageRunner>) -> Self {
        Self { config, runner }
    }
}

#[async_trait]
impl Dispatch for WorkerPool {
    /// Dispatches every job to the pool and waits for all results.
    ///
    /// This is a synchronous barrier: the call returns only once every
    /// job has a result, in no particular order across jobs.
    async fn dispatch(&self, jobs: Vec<Job>) -> Result<(Vec<JobOutcome>, PoolStats), PoolError> {
        let expected = jobs.len();
        if expected == 0 {
            return Ok((Vec::new(), PoolStats::default()));
        }

        let (feed_tx, feed_rx) = mpsc::channel::<Job>(expected);
        for job in jobs {
            // Capacity equals the job count, so feeding never blocks.
            let _ = feed_tx.send(job).await;
        }
        drop(feed_tx);
        let feed = Arc::new(Mutex::new(feed_rx));

        let (result_tx, mut result_rx) = mpsc::channel::<JobOutcome>(expected);
        let worker_count = self.config.worker_count().min(expected);
        let mut handles = Vec::with_capacity(worker_count);
        info!(workers = worker_count, jobs = expected, "Dispatching jobs");

        for worker_id in 0..worker_count {
            let feed = Arc::clone(&feed);
            let result_tx = result_tx.clone();
            let runner = Arc::clone(&self.runner);
            handles.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut feed = feed.lock().await;
                        feed.recv().await
                    };
                    let Some(job) = job else {
                        debug!(worker_id, "Job feed drained, worker stopping");
                        break;
                    };
                    info!(
                        worker_id,
                        orbit = job.orbit,
                        config_index = job.config_index,
                        stage = %job.stage,
                        "Worker picked up job"
                    );
                    let outcome = runner.run(job).await;
                    if result_tx.send(outcome).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);

        let mut outcomes = Vec::with_capacity(expected);
        let mut stats = PoolStats::default();
        while let Some(outcome) = result_rx.recv().await {
            stats.record(&outcome);
            outcomes.push(outcome);
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }

        if outcomes.len() != expected {
            return Err(PoolError::Incomplete {
                expected,
                returned: outcomes.len(),
            });
        }

        info!(
            completed = stats.completed,
            failed = stats.failed,
            success_rate = format!("{:.1}%", stats.success_rate()),
            "All jobs returned"
        );
        Ok((outcomes, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParameterSet;
    use crate::job::{JobPaths, Stage};
    use std::collections::BTreeMap;
    use std::path::Path;
    use tempfile::TempDir;

    fn job(dir: &Path, orbit: u32) -> Job {
        let set = ParameterSet::from_map(BTreeMap::new()).expect("empty set");
        let stem = format!("job{orbit}");
        Job::new(
            orbit,
            0,
            set.tool,
            set.workflow,
            dir.join(format!("{stem}.h5")),
            JobPaths {
                output: dir.join(format!("data/{stem}.h5")),
                config: dir.join(format!("config/{stem}.cfg")),
                log: dir.join(format!("log/{stem}.log")),
                dump: dir.join(format!("dump/{stem}.hdr")),
                image_dir: dir.join(format!("image/{stem}")),
            },
        )
    }

    #[test]
    fn test_worker_count_reserves_coordinator_slot() {
        assert_eq!(WorkerPoolConfig::new(4).worker_count(), 3);
        assert_eq!(WorkerPoolConfig::new(1).worker_count(), 1);
        assert_eq!(WorkerPoolConfig::new(0).worker_count(), 1);
        assert_eq!(WorkerPoolConfig::default().worker_count(), 3);
    }

    #[test]
    fn test_pool_stats_rates() {
        let stats = PoolStats {
            completed: 8,
            failed: 2,
        };
        assert_eq!(stats.total(), 10);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
        assert!((PoolStats::default().success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dispatch_returns_every_job_exactly_once() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().expect("tempdir");
        let tool = dir.path().join("aftool");
        std::fs::write(
            &tool,
            "#!/bin/sh\nout=$(sed -n 's/^OUTPUT_FILE_PATH: //p' \"$1\")\ntouch \"$out\"\n",
        )
        .expect("write tool");
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        let dump = dir.path().join("h5dump");
        std::fs::write(&dump, "#!/bin/sh\necho header\n").expect("write dump");
        std::fs::set_permissions(&dump, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let runner = Arc::new(StageRunner::new(tool, dump));
        let pool = WorkerPool::new(WorkerPoolConfig::new(3), runner);

        let jobs: Vec<Job> = (1..=7).map(|orbit| job(dir.path(), orbit)).collect();
        let (outcomes, stats) = pool.dispatch(jobs).await.expect("dispatch");

        assert_eq!(outcomes.len(), 7);
        let mut orbits: Vec<u32> = outcomes.iter().map(|o| o.job.orbit).collect();
        orbits.sort_unstable();
        assert_eq!(orbits, vec![1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(stats.completed, 7);
        assert_eq!(stats.failed, 0);
        for outcome in &outcomes {
            assert_eq!(outcome.job.stage, Stage::Complete);
        }
    }

    #[tokio::test]
    async fn test_dispatch_empty_job_list() {
        let runner = Arc::new(StageRunner::new("unused", "unused"));
        let pool = WorkerPool::new(WorkerPoolConfig::default(), runner);
        let (outcomes, stats) = pool.dispatch(Vec::new()).await.expect("dispatch");
        assert!(outcomes.is_empty());
        assert_eq!(stats.total(), 0);
    }
}
