//! Job definitions for the orchestrator.
//!
//! This module defines the core unit-of-work types:
//!
//! - `Stage`: the per-job pipeline checkpoint, advancing forward only
//! - `Job`: one granule x configuration pair with its derived paths
//! - `Outcome`/`JobOutcome`: the explicit result of running a job

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::WorkflowParams;
use crate::imaging::ImageKey;

/// Pipeline checkpoint a job has reached. Each value means the stage of
/// that name has completed; `COMPLETE` is terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Stage {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "CONVERTED")]
    Converted,
    #[serde(rename = "VALIDATED")]
    Validated,
    #[serde(rename = "IMAGES_DONE")]
    ImagesDone,
    #[serde(rename = "COMPLETE")]
    Complete,
}

impl Stage {
    /// Canonical upper-case name used in logs and checkpoint records.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Pending => "PENDING",
            Stage::Converted => "CONVERTED",
            Stage::Validated => "VALIDATED",
            Stage::ImagesDone => "IMAGES_DONE",
            Stage::Complete => "COMPLETE",
        }
    }

    /// The checkpoint reached once this stage's successor action succeeds.
    pub fn next(&self) -> Stage {
        match self {
            Stage::Pending => Stage::Converted,
            Stage::Converted => Stage::Validated,
            Stage::Validated => Stage::ImagesDone,
            Stage::ImagesDone | Stage::Complete => Stage::Complete,
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == Stage::Complete
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Stage::Pending),
            "CONVERTED" => Ok(Stage::Converted),
            "VALIDATED" => Ok(Stage::Validated),
            "IMAGES_DONE" => Ok(Stage::ImagesDone),
            "COMPLETE" => Ok(Stage::Complete),
            other => Err(format!("unknown stage '{other}'")),
        }
    }
}

/// Filesystem targets derived for one job at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPaths {
    /// The conversion artifact the tool writes.
    pub output: PathBuf,
    /// The generated tool config file.
    pub config: PathBuf,
    /// The job's append-only log file.
    pub log: PathBuf,
    /// Where the validator's header dump is written.
    pub dump: PathBuf,
    /// Directory for rendered images.
    pub image_dir: PathBuf,
}

/// One unit of work: a single orbit granule converted under a single
/// configuration.
///
/// A job is owned by the dispatcher's queue until a worker picks it up,
/// and by exactly one worker while it runs. All paths are computed once
/// at construction and never recomputed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Orbit identifier; unique together with `config_index`.
    pub orbit: u32,
    /// Which requested parameter set produced this job.
    pub config_index: usize,
    /// Tool-facing parameters written to the config file.
    pub parameters: BTreeMap<String, String>,
    /// Workflow-facing parameters.
    pub workflow: WorkflowParams,
    /// The discovered input granule.
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub config_path: PathBuf,
    pub log_path: PathBuf,
    pub dump_path: PathBuf,
    pub image_dir: PathBuf,
    /// Last completed pipeline checkpoint.
    pub stage: Stage,
    /// Comparison scores, appended during the image stage.
    pub similarity_scores: Vec<f64>,
    /// Rendered image paths by composite key.
    pub image_index: BTreeMap<ImageKey, PathBuf>,
}

impl Job {
    pub fn new(
        orbit: u32,
        config_index: usize,
        parameters: BTreeMap<String, String>,
        workflow: WorkflowParams,
        input_path: PathBuf,
        paths: JobPaths,
    ) -> Self {
        Self {
            orbit,
            config_index,
            parameters,
            workflow,
            input_path,
            output_path: paths.output,
            config_path: paths.config,
            log_path: paths.log,
            dump_path: paths.dump,
            image_dir: paths.image_dir,
            stage: Stage::Pending,
            similarity_scores: Vec::new(),
            image_index: BTreeMap::new(),
        }
    }

    /// Whether every recorded similarity score meets the threshold.
    /// An empty score list passes: nothing to fail.
    pub fn passes_comparison(&self) -> bool {
        self.similarity_scores
            .iter()
            .all(|score| *score >= self.workflow.threshold)
    }

    /// A job needs the failed report when it stopped short of
    /// `COMPLETE` or finished below the similarity threshold.
    pub fn needs_retry(&self) -> bool {
        !self.stage.is_terminal() || !self.passes_comparison()
    }
}

/// How a job's pipeline run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// Every stage succeeded.
    Completed,
    /// The named stage's action failed; the job stopped there.
    Failed { stage: Stage, message: String },
}

/// A job folded together with its outcome, as returned by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job: Job,
    pub outcome: Outcome,
}

impl JobOutcome {
    pub fn completed(job: Job) -> Self {
        Self {
            job,
            outcome: Outcome::Completed,
        }
    }

    pub fn failed(job: Job, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            job,
            outcome: Outcome::Failed {
                stage,
                message: message.into(),
            },
        }
    }

    /// Success here means the pipeline ran to the end AND comparisons
    /// met the threshold; threshold misses are failures for reporting.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Completed) && self.job.passes_comparison()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_scores(scores: Vec<f64>, threshold: f64, stage: Stage) -> Job {
        let workflow = WorkflowParams {
            threshold,
            ..WorkflowParams::default()
        };
        let mut job = Job::new(
            37661,
            0,
            BTreeMap::new(),
            workflow,
            PathBuf::from("/in/TERRA_BF_L1B_O37661_20070116120124_F000_V001.h5"),
            JobPaths {
                output: PathBuf::from("/out/data/o.h5"),
                config: PathBuf::from("/out/config/o.cfg"),
                log: PathBuf::from("/out/run0/log/o.log"),
                dump: PathBuf::from("/out/run0/dump/o.hdr"),
                image_dir: PathBuf::from("/out/image/o"),
            },
        );
        job.similarity_scores = scores;
        job.stage = stage;
        job
    }

    #[test]
    fn test_stage_order_and_next() {
        assert!(Stage::Pending < Stage::Converted);
        assert!(Stage::ImagesDone < Stage::Complete);
        assert_eq!(Stage::Pending.next(), Stage::Converted);
        assert_eq!(Stage::Validated.next(), Stage::ImagesDone);
        assert_eq!(Stage::Complete.next(), Stage::Complete);
        assert!(Stage::Complete.is_terminal());
    }

    #[test]
    fn test_stage_round_trips_through_name() {
        for stage in [
            Stage::Pending,
            Stage::Converted,
            Stage::Validated,
            Stage::ImagesDone,
            Stage::Complete,
        ] {
            assert_eq!(stage.name().parse::<Stage>().unwrap(), stage);
        }
        assert!("DONE".parse::<Stage>().is_err());
    }

    #[test]
    fn test_empty_score_list_passes() {
        let job = job_with_scores(Vec::new(), 0.9, Stage::Complete);
        assert!(job.passes_comparison());
        assert!(!job.needs_retry());
    }

    #[test]
    fn test_score_below_threshold_needs_retry() {
        let job = job_with_scores(vec![0.95, 0.5], 0.9, Stage::Complete);
        assert!(!job.passes_comparison());
        assert!(job.needs_retry());
    }

    #[test]
    fn test_score_at_threshold_passes() {
        let job = job_with_scores(vec![0.9, 0.95], 0.9, Stage::Complete);
        assert!(job.passes_comparison());
    }

    #[test]
    fn test_incomplete_stage_needs_retry() {
        let job = job_with_scores(Vec::new(), 0.9, Stage::Converted);
        assert!(job.needs_retry());
    }

    #[test]
    fn test_outcome_success_accounts_for_threshold() {
        let good = JobOutcome::completed(job_with_scores(vec![0.95], 0.9, Stage::Complete));
        assert!(good.is_success());

        let below = JobOutcome::completed(job_with_scores(vec![0.5], 0.9, Stage::Complete));
        assert!(!below.is_success());

        let failed = JobOutcome::failed(
            job_with_scores(Vec::new(), 0.9, Stage::Pending),
            Stage::Pending,
            "conversion tool exited with status 1",
        );
        assert!(!failed.is_success());
    }

    #[test]
    fn test_job_serialization() {
        let job = job_with_scores(vec![0.91], 0.9, Stage::Validated);
        let json = serde_json::to_string(&job).expect("serialization should work");
        let parsed: Job = serde_json::from_str(&json).expect("deserialization should work");
        assert_eq!(parsed.orbit, job.orbit);
        assert_eq!(parsed.stage, Stage::Validated);
        assert_eq!(parsed.output_path, job.output_path);
    }
}
