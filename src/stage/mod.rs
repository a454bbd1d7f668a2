//! Per-job stage execution.
//!
//! `StageRunner` drives one job through its pipeline, one unresolved
//! stage at a time: write the tool config and convert, validate the
//! artifact's header, then render and compare images. The stage pointer
//! on the job is the resumption mechanism: a stage that completed in a
//! prior run is never repeated, and a failed stage stops the job
//! immediately with its progress preserved.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{INPUT_FILE_PATH, OUTPUT_FILE_PATH};
use crate::error::{RenderError, StageError};
use crate::imaging::{ImagePlan, ImageRenderer, SimilarityScorer};
use crate::job::{Job, JobOutcome, Stage};

/// Append-only log sink scoped to a single job.
///
/// Passed into the runner and released when the job finishes, so no two
/// jobs ever interleave log output.
pub struct JobLog {
    file: std::fs::File,
}

impl JobLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self { file })
    }

    pub fn line(&mut self, text: &str) -> std::io::Result<()> {
        writeln!(self.file, "{text}")
    }

    /// Appends a subprocess's combined stdout and stderr.
    pub fn capture(&mut self, output: &std::process::Output) -> std::io::Result<()> {
        self.file.write_all(&output.stdout)?;
        self.file.write_all(&output.stderr)?;
        Ok(())
    }
}

/// Executes the stage state machine for one job at a time.
pub struct StageRunner {
    tool: PathBuf,
    dump_tool: PathBuf,
    renderer: Option<Arc<dyn ImageRenderer>>,
    scorer: Option<Arc<dyn SimilarityScorer>>,
}

impl StageRunner {
    /// Creates a runner with the conversion and validator tools.
    pub fn new(tool: impl Into<PathBuf>, dump_tool: impl Into<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            dump_tool: dump_tool.into(),
            renderer: None,
            scorer: None,
        }
    }

    /// Sets the image renderer collaborator.
    pub fn with_renderer(mut self, renderer: Arc<dyn ImageRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Sets the similarity scorer collaborator.
    pub fn with_scorer(mut self, scorer: Arc<dyn SimilarityScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Runs every unresolved stage of `job` in order, stopping at the
    /// first failure. The returned outcome carries the job with its
    /// stage advanced exactly as far as it got.
    pub async fn run(&self, mut job: Job) -> JobOutcome {
        let mut log = match JobLog::open(&job.log_path) {
            Ok(log) => log,
            Err(e) => {
                let stage = job.stage;
                warn!(orbit = job.orbit, error = %e, "Failed to open job log");
                return JobOutcome::failed(job, stage, format!("failed to open job log: {e}"));
            }
        };

        while !job.stage.is_terminal() {
            let stage = job.stage;
            let step = match stage {
                Stage::Pending => self.convert(&job, &mut log).await,
                Stage::Converted => self.validate(&job, &mut log).await,
                Stage::Validated => self.generate_images(&mut job, &mut log).await,
                // Image work is already recorded; this transition only
                // closes out the job.
                Stage::ImagesDone | Stage::Complete => Ok(()),
            };
            match step {
                Ok(()) => {
                    job.stage = stage.next();
                    debug!(
                        orbit = job.orbit,
                        config_index = job.config_index,
                        stage = %job.stage,
                        "Stage complete"
                    );
                }
                Err(e) => {
                    let _ = log.line(&format!("stage {stage} failed: {e}"));
                    warn!(
                        orbit = job.orbit,
                        config_index = job.config_index,
                        stage = %stage,
                        error = %e,
                        "Stage failed"
                    );
                    return JobOutcome::failed(job, stage, e.to_string());
                }
            }
        }

        JobOutcome::completed(job)
    }

    /// PENDING -> CONVERTED: write the tool config and run the
    /// conversion executable, capturing its output to the job log.
    async fn convert(&self, job: &Job, log: &mut JobLog) -> Result<(), StageError> {
        for target in [&job.output_path, &job.config_path] {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        write_tool_config(job)?;

        log.line(&format!(
            "$ {} {}",
            self.tool.display(),
            job.config_path.display()
        ))?;
        let output = Command::new(&self.tool)
            .arg(&job.config_path)
            .output()
            .await?;
        log.capture(&output)?;
        exit_status(&output.status, |code| StageError::ToolFailed { code }, StageError::ToolKilled)
    }

    /// CONVERTED -> VALIDATED: dump the artifact's header, writing the
    /// dump text to the job's dump path.
    async fn validate(&self, job: &Job, log: &mut JobLog) -> Result<(), StageError> {
        log.line(&format!(
            "$ {} -H {}",
            self.dump_tool.display(),
            job.output_path.display()
        ))?;
        let output = Command::new(&self.dump_tool)
            .arg("-H")
            .arg(&job.output_path)
            .output()
            .await?;
        if let Some(parent) = job.dump_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&job.dump_path, &output.stdout)?;
        if !output.stderr.is_empty() {
            log.file.write_all(&output.stderr)?;
        }
        exit_status(
            &output.status,
            |code| StageError::ValidatorFailed { code },
            StageError::ValidatorKilled,
        )
    }

    /// VALIDATED -> IMAGES_DONE: render every requested slice, index it,
    /// and score every comparison pair.
    async fn generate_images(&self, job: &mut Job, log: &mut JobLog) -> Result<(), StageError> {
        if !job.workflow.requests_images() {
            return Ok(());
        }

        let plan = ImagePlan::from_parameters(&job.parameters)?;
        let renderer = self
            .renderer
            .as_ref()
            .ok_or(StageError::Render(RenderError::NoRenderer))?;
        std::fs::create_dir_all(&job.image_dir)?;

        for slice in &plan.slices {
            let out = job.image_dir.join(slice.key.file_name());
            renderer
                .render(&job.output_path, &slice.dataset_path, &slice.indices, &out)
                .await?;
            log.line(&format!("rendered {} -> {}", slice.key, out.display()))?;
            job.image_index.insert(slice.key.clone(), out);
        }

        if job.workflow.compare.is_empty() {
            return Ok(());
        }
        let scorer = self
            .scorer
            .as_ref()
            .ok_or(StageError::Render(RenderError::NoScorer))?;
        for pair in &job.workflow.compare {
            let left = job
                .image_index
                .get(&pair.left)
                .ok_or_else(|| RenderError::NotRendered(pair.left.to_string()))?;
            let right = job
                .image_index
                .get(&pair.right)
                .ok_or_else(|| RenderError::NotRendered(pair.right.to_string()))?;
            let score = scorer.score(left, right).await?;
            log.line(&format!("compare {pair} = {score:.4}"))?;
            job.similarity_scores.push(score);
        }
        Ok(())
    }
}

/// Writes the tool-facing config for a job: the orchestrator-owned
/// input/output paths first, then the job's parameters in key order.
/// Workflow-only keys were split off at construction and never appear.
fn write_tool_config(job: &Job) -> Result<(), StageError> {
    let mut text = String::new();
    text.push_str(&format!("{INPUT_FILE_PATH}: {}\n", job.input_path.display()));
    text.push_str(&format!(
        "{OUTPUT_FILE_PATH}: {}\n",
        job.output_path.display()
    ));
    for (key, value) in &job.parameters {
        text.push_str(&format!("{key}: {value}\n"));
    }
    std::fs::write(&job.config_path, text)?;
    Ok(())
}

fn exit_status(
    status: &std::process::ExitStatus,
    on_code: impl FnOnce(i32) -> StageError,
    on_signal: StageError,
) -> Result<(), StageError> {
    match status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(on_code(code)),
        None => Err(on_signal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParameterSet;
    use crate::job::JobPaths;
    use async_trait::async_trait;
    use tempfile::TempDir;

    fn test_job(dir: &Path, set: ParameterSet) -> Job {
        let paths = JobPaths {
            output: dir.join("data/2007.01/out.c0.h5"),
            config: dir.join("config/2007.01/out.c0.cfg"),
            log: dir.join("run0/log/out.c0.log"),
            dump: dir.join("run0/dump/out.c0.hdr"),
            image_dir: dir.join("image/2007.01/out.c0"),
        };
        Job::new(
            37661,
            0,
            set.tool,
            set.workflow,
            dir.join("TERRA_BF_L1B_O37661_20070116120124_F000_V001.h5"),
            paths,
        )
    }

    #[cfg(unix)]
    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");
        path
    }

    struct FakeRenderer;

    #[async_trait]
    impl ImageRenderer for FakeRenderer {
        async fn render(
            &self,
            _artifact: &Path,
            _dataset_path: &str,
            _indices: &[usize],
            out: &Path,
        ) -> Result<(), RenderError> {
            std::fs::write(out, b"png").map_err(RenderError::from)
        }
    }

    struct FakeScorer(f64);

    #[async_trait]
    impl SimilarityScorer for FakeScorer {
        async fn score(&self, _left: &Path, _right: &Path) -> Result<f64, RenderError> {
            Ok(self.0)
        }
    }

    fn image_set() -> ParameterSet {
        ParameterSet::from_text(
            "SOURCE_INSTRUMENT: MODIS\n\
             MODIS_RESOLUTION: 1KM\n\
             MODIS_BANDS: 8 9\n\
             COMPARE_DATASETS: MODIS/1KM/8=MODIS/1KM/9\n",
        )
        .expect("set should parse")
    }

    #[test]
    fn test_tool_config_excludes_workflow_keys() {
        let dir = TempDir::new().expect("tempdir");
        let set = ParameterSet::from_text(
            "RESAMPLE_METHOD: nnInterpolate\nGENERATE_IMAGES: TRUE\nOUTPUT_PREFIX: REFUSE\n",
        )
        .expect("set should parse");
        let job = test_job(dir.path(), set);

        std::fs::create_dir_all(job.config_path.parent().expect("parent")).expect("mkdir");
        write_tool_config(&job).expect("config should write");

        let text = std::fs::read_to_string(&job.config_path).expect("read config");
        assert!(text.starts_with("INPUT_FILE_PATH: "));
        assert!(text.contains("OUTPUT_FILE_PATH: "));
        assert!(text.contains("RESAMPLE_METHOD: nnInterpolate"));
        assert!(!text.contains("GENERATE_IMAGES"));
        assert!(!text.contains("OUTPUT_PREFIX"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_conversion_keeps_stage_pending() {
        let dir = TempDir::new().expect("tempdir");
        let tool = script(dir.path(), "aftool", "echo conversion blew up >&2\nexit 3");
        let dump = script(dir.path(), "h5dump", "exit 0");
        let runner = StageRunner::new(tool, dump);

        let set = ParameterSet::from_text("RESAMPLE_METHOD: nnInterpolate\n").expect("set");
        let outcome = runner.run(test_job(dir.path(), set)).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.job.stage, Stage::Pending);
        match &outcome.outcome {
            crate::job::Outcome::Failed { stage, message } => {
                assert_eq!(*stage, Stage::Pending);
                assert!(message.contains('3'), "message was: {message}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        let log = std::fs::read_to_string(&outcome.job.log_path).expect("log exists");
        assert!(log.contains("conversion blew up"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pipeline_without_images_reaches_complete() {
        let dir = TempDir::new().expect("tempdir");
        let tool = script(
            dir.path(),
            "aftool",
            "out=$(sed -n 's/^OUTPUT_FILE_PATH: //p' \"$1\")\necho converting\ntouch \"$out\"",
        );
        let dump = script(dir.path(), "h5dump", "echo \"HDF5 header for $2\"");
        let runner = StageRunner::new(tool, dump);

        let set = ParameterSet::from_text("RESAMPLE_METHOD: nnInterpolate\n").expect("set");
        let outcome = runner.run(test_job(dir.path(), set)).await;

        assert!(outcome.is_success(), "outcome: {:?}", outcome.outcome);
        assert_eq!(outcome.job.stage, Stage::Complete);
        assert!(outcome.job.output_path.exists());
        let log = std::fs::read_to_string(&outcome.job.log_path).expect("log exists");
        assert!(log.contains("converting"));
        let header = std::fs::read_to_string(&outcome.job.dump_path).expect("dump exists");
        assert!(header.contains("HDF5 header"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_validator_keeps_stage_converted() {
        let dir = TempDir::new().expect("tempdir");
        let tool = script(dir.path(), "aftool", "exit 0");
        let dump = script(dir.path(), "h5dump", "echo bad superblock >&2\nexit 1");
        let runner = StageRunner::new(tool, dump);

        let set = ParameterSet::from_text("RESAMPLE_METHOD: nnInterpolate\n").expect("set");
        let outcome = runner.run(test_job(dir.path(), set)).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.job.stage, Stage::Converted);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resume_never_repeats_a_completed_stage() {
        let dir = TempDir::new().expect("tempdir");
        // A conversion tool that would fail if it were (incorrectly) re-run.
        let tool = script(dir.path(), "aftool", "exit 9");
        let dump = script(dir.path(), "h5dump", "exit 0");
        let runner = StageRunner::new(tool, dump);

        let set = ParameterSet::from_text("RESAMPLE_METHOD: nnInterpolate\n").expect("set");
        let mut job = test_job(dir.path(), set);
        job.stage = Stage::Converted;

        let outcome = runner.run(job).await;
        assert!(outcome.is_success(), "outcome: {:?}", outcome.outcome);
        assert_eq!(outcome.job.stage, Stage::Complete);
    }

    #[tokio::test]
    async fn test_image_stage_renders_indexes_and_scores() {
        let dir = TempDir::new().expect("tempdir");
        let runner = StageRunner::new("unused", "unused")
            .with_renderer(Arc::new(FakeRenderer))
            .with_scorer(Arc::new(FakeScorer(0.95)));

        let mut job = test_job(dir.path(), image_set());
        job.stage = Stage::Validated;

        let outcome = runner.run(job).await;
        assert!(outcome.is_success(), "outcome: {:?}", outcome.outcome);
        assert_eq!(outcome.job.stage, Stage::Complete);
        assert_eq!(outcome.job.image_index.len(), 2);
        assert_eq!(outcome.job.similarity_scores, vec![0.95]);
        for path in outcome.job.image_index.values() {
            assert!(path.exists());
        }
    }

    #[tokio::test]
    async fn test_below_threshold_score_is_reported_not_a_stage_failure() {
        let dir = TempDir::new().expect("tempdir");
        let runner = StageRunner::new("unused", "unused")
            .with_renderer(Arc::new(FakeRenderer))
            .with_scorer(Arc::new(FakeScorer(0.5)));

        let mut job = test_job(dir.path(), image_set());
        job.stage = Stage::Validated;

        let outcome = runner.run(job).await;
        // The stage machine finishes; the threshold miss surfaces in reporting.
        assert_eq!(outcome.job.stage, Stage::Complete);
        assert!(matches!(outcome.outcome, crate::job::Outcome::Completed));
        assert!(!outcome.is_success());
        assert!(outcome.job.needs_retry());
    }

    #[tokio::test]
    async fn test_comparison_against_unrendered_dataset_fails_the_stage() {
        let dir = TempDir::new().expect("tempdir");
        let runner = StageRunner::new("unused", "unused")
            .with_renderer(Arc::new(FakeRenderer))
            .with_scorer(Arc::new(FakeScorer(0.95)));

        let set = ParameterSet::from_text(
            "SOURCE_INSTRUMENT: MODIS\n\
             MODIS_RESOLUTION: 1KM\n\
             MODIS_BANDS: 8\n\
             COMPARE_DATASETS: MODIS/1KM/8=MISR/L/AN_RED\n",
        )
        .expect("set should parse");
        let mut job = test_job(dir.path(), set);
        job.stage = Stage::Validated;

        let outcome = runner.run(job).await;
        assert!(!outcome.is_success());
        assert_eq!(outcome.job.stage, Stage::Validated);
    }

    #[tokio::test]
    async fn test_images_requested_without_renderer_fails_the_stage() {
        let dir = TempDir::new().expect("tempdir");
        let runner = StageRunner::new("unused", "unused");

        let mut job = test_job(dir.path(), image_set());
        job.stage = Stage::Validated;

        let outcome = runner.run(job).await;
        assert!(!outcome.is_success());
        assert_eq!(outcome.job.stage, Stage::Validated);
    }
}
