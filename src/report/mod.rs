//! Checkpoint reports: the auditing summary and the resumable
//! failed-jobs file.
//!
//! The failed-jobs file is the sole resume mechanism. It is a plain-text
//! sequence of records separated by blank lines, each line one
//! `attribute: value` pair. Lower-case attributes are job fields;
//! upper-case attributes are the job's parameters (tool and workflow
//! keys merged), so the resume parser re-splits them exactly as a fresh
//! parameter set would be.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::ParameterSet;
use crate::error::ReportError;
use crate::job::{Job, JobOutcome, JobPaths, Outcome, Stage};

/// File name of the resumable failed-jobs report inside a run directory.
pub const FAILED_REPORT_FILE: &str = "failed_jobs.txt";

/// File name of the full JSON summary inside a run directory.
pub const SUMMARY_FILE: &str = "summary.json";

/// Totals for the run's final accounting line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub total: usize,
    pub failed: usize,
}

impl RunReport {
    pub fn from_outcomes(outcomes: &[JobOutcome]) -> Self {
        Self {
            total: outcomes.len(),
            failed: outcomes.iter().filter(|o| !o.is_success()).count(),
        }
    }

    pub fn failure_pct(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.failed as f64 / self.total as f64) * 100.0
    }
}

/// Writes the full JSON summary: every job, orbit order, all attributes.
pub fn write_summary(path: &Path, outcomes: &[JobOutcome]) -> Result<(), ReportError> {
    let mut sorted: Vec<&JobOutcome> = outcomes.iter().collect();
    sorted.sort_by_key(|o| (o.job.orbit, o.job.config_index));
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(file, &sorted)?;
    Ok(())
}

/// Writes the failed-only report and returns how many records it holds.
///
/// A job is failed when its stage is not `COMPLETE` or its similarity
/// scores do not all meet the threshold. Threshold misses are written
/// with stage `VALIDATED` and without scores, so a resume re-renders
/// and re-scores instead of terminating immediately.
pub fn write_failed_report(path: &Path, outcomes: &[JobOutcome]) -> Result<usize, ReportError> {
    let mut failed: Vec<&JobOutcome> = outcomes.iter().filter(|o| !o.is_success()).collect();
    failed.sort_by_key(|o| (o.job.orbit, o.job.config_index));

    let mut text = String::new();
    for outcome in &failed {
        push_record(&mut text, outcome);
        text.push('\n');
    }
    std::fs::write(path, text)?;

    info!(
        failed = failed.len(),
        path = %path.display(),
        "Wrote failed-jobs report"
    );
    Ok(failed.len())
}

fn push_record(text: &mut String, outcome: &JobOutcome) {
    let job = &outcome.job;
    let stage = retry_stage(job);

    push_line(text, "orbit", &job.orbit.to_string());
    push_line(text, "config_index", &job.config_index.to_string());
    push_line(text, "stage", stage.name());
    push_line(text, "input_path", &job.input_path.display().to_string());
    push_line(text, "output_path", &job.output_path.display().to_string());
    push_line(text, "config_path", &job.config_path.display().to_string());
    push_line(text, "log_path", &job.log_path.display().to_string());
    push_line(text, "dump_path", &job.dump_path.display().to_string());
    push_line(text, "image_dir", &job.image_dir.display().to_string());
    if let Outcome::Failed { stage, message } = &outcome.outcome {
        push_line(text, "error", &format!("{stage}: {message}"));
    }

    let parameters = ParameterSet {
        tool: job.parameters.clone(),
        workflow: job.workflow.clone(),
    };
    for (key, value) in parameters.merged() {
        push_line(text, &key, &value);
    }
}

/// The stage a failed job should resume from. A complete job can only
/// be in the failed report for a threshold miss, so it re-enters at the
/// image stage.
fn retry_stage(job: &Job) -> Stage {
    if job.stage.is_terminal() && !job.passes_comparison() {
        Stage::Validated
    } else {
        job.stage
    }
}

fn push_line(text: &mut String, key: &str, value: &str) {
    text.push_str(key);
    text.push_str(": ");
    text.push_str(value);
    text.push('\n');
}

/// Parses a failed-jobs report back into runnable jobs.
///
/// Records without a `stage` attribute restart from `PENDING`.
pub fn parse_report(path: &Path) -> Result<Vec<Job>, ReportError> {
    let text = std::fs::read_to_string(path)?;
    let mut jobs = Vec::new();
    for block in text.split("\n\n") {
        let lines: Vec<&str> = block
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        if lines.is_empty() {
            continue;
        }
        jobs.push(parse_record(&lines)?);
    }
    Ok(jobs)
}

const JOB_ATTRIBUTES: [&str; 11] = [
    "orbit",
    "config_index",
    "stage",
    "input_path",
    "output_path",
    "config_path",
    "log_path",
    "dump_path",
    "image_dir",
    "scores",
    "error",
];

fn parse_record(lines: &[&str]) -> Result<Job, ReportError> {
    let mut parameters: BTreeMap<String, String> = BTreeMap::new();
    let mut attributes: BTreeMap<String, String> = BTreeMap::new();

    for line in lines {
        let Some((key, value)) = line.split_once(':') else {
            return Err(ReportError::MalformedLine(line.to_string()));
        };
        let key = key.trim();
        let value = value.trim().to_string();
        if is_parameter_key(key) {
            parameters.insert(key.to_string(), value);
        } else if JOB_ATTRIBUTES.contains(&key) {
            attributes.insert(key.to_string(), value);
        } else {
            return Err(ReportError::UnknownAttribute(key.to_string()));
        }
    }

    let orbit: u32 = parse_attr(&attributes, "orbit")?;
    let config_index: usize = parse_attr(&attributes, "config_index")?;
    let stage = match attributes.get("stage") {
        Some(value) => value
            .parse::<Stage>()
            .map_err(|reason| ReportError::InvalidValue {
                attribute: "stage",
                value: value.clone(),
                reason,
            })?,
        None => Stage::Pending,
    };
    let scores = match attributes.get("scores") {
        Some(value) => parse_scores(value)?,
        None => Vec::new(),
    };

    let paths = JobPaths {
        output: path_attr(&attributes, "output_path")?,
        config: path_attr(&attributes, "config_path")?,
        log: path_attr(&attributes, "log_path")?,
        dump: path_attr(&attributes, "dump_path")?,
        image_dir: path_attr(&attributes, "image_dir")?,
    };
    let input_path = path_attr(&attributes, "input_path")?;

    let set = ParameterSet::from_map(parameters)?;
    let mut job = Job::new(orbit, config_index, set.tool, set.workflow, input_path, paths);
    job.stage = stage;
    job.similarity_scores = scores;
    Ok(job)
}

fn is_parameter_key(key: &str) -> bool {
    key.starts_with(|c: char| c.is_ascii_uppercase())
        && key
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

fn parse_attr<T: std::str::FromStr>(
    attributes: &BTreeMap<String, String>,
    name: &'static str,
) -> Result<T, ReportError> {
    let value = attributes
        .get(name)
        .ok_or(ReportError::MissingAttribute(name))?;
    value.parse().map_err(|_| ReportError::InvalidValue {
        attribute: name,
        value: value.clone(),
        reason: "not a number".to_string(),
    })
}

fn path_attr(
    attributes: &BTreeMap<String, String>,
    name: &'static str,
) -> Result<PathBuf, ReportError> {
    attributes
        .get(name)
        .map(PathBuf::from)
        .ok_or(ReportError::MissingAttribute(name))
}

fn parse_scores(value: &str) -> Result<Vec<f64>, ReportError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| {
            token.parse::<f64>().map_err(|_| ReportError::InvalidValue {
                attribute: "scores",
                value: token.to_string(),
                reason: "not a number".to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SET_TEXT: &str = "\
RESAMPLE_METHOD: nnInterpolate
SOURCE_INSTRUMENT: MODIS
MODIS_RESOLUTION: 1KM
MODIS_BANDS: 8 9
COMPARE_DATASETS: MODIS/1KM/8=MODIS/1KM/9,MODIS/1KM/9=MODIS/1KM/8
COMPARE_THRESHOLD: 0.9
";

    fn test_job(dir: &Path, orbit: u32, stage: Stage, scores: Vec<f64>) -> Job {
        let set = ParameterSet::from_text(SET_TEXT).expect("set should parse");
        let stem = format!("ADVNCE_FUSE_TERRA_BF_L1B_O{orbit}_20070116120124_F000_V001.c0");
        let mut job = Job::new(
            orbit,
            0,
            set.tool,
            set.workflow,
            dir.join(format!("in/TERRA_BF_L1B_O{orbit}_20070116120124_F000_V001.h5")),
            JobPaths {
                output: dir.join(format!("data/2007.01/{stem}.h5")),
                config: dir.join(format!("config/2007.01/{stem}.cfg")),
                log: dir.join(format!("run0/log/{stem}.log")),
                dump: dir.join(format!("run0/dump/{stem}.hdr")),
                image_dir: dir.join(format!("image/2007.01/{stem}")),
            },
        );
        job.stage = stage;
        job.similarity_scores = scores;
        job
    }

    #[test]
    fn test_failed_record_round_trips() {
        let dir = TempDir::new().expect("tempdir");
        let job = test_job(dir.path(), 37661, Stage::Converted, Vec::new());
        let outcome = JobOutcome::failed(
            job.clone(),
            Stage::Converted,
            "validator exited with status 1",
        );

        let path = dir.path().join(FAILED_REPORT_FILE);
        let written = write_failed_report(&path, &[outcome]).expect("write");
        assert_eq!(written, 1);

        let jobs = parse_report(&path).expect("parse");
        assert_eq!(jobs.len(), 1);
        let parsed = &jobs[0];
        assert_eq!(parsed.orbit, job.orbit);
        assert_eq!(parsed.config_index, job.config_index);
        assert_eq!(parsed.stage, Stage::Converted);
        assert_eq!(parsed.input_path, job.input_path);
        assert_eq!(parsed.output_path, job.output_path);
        assert_eq!(parsed.config_path, job.config_path);
        assert_eq!(parsed.log_path, job.log_path);
        assert_eq!(parsed.dump_path, job.dump_path);
        assert_eq!(parsed.image_dir, job.image_dir);
        assert_eq!(parsed.parameters, job.parameters);
        assert_eq!(parsed.workflow, job.workflow);
    }

    #[test]
    fn test_threshold_miss_resumes_at_image_stage() {
        let dir = TempDir::new().expect("tempdir");
        let job = test_job(dir.path(), 37661, Stage::Complete, vec![0.95, 0.5]);
        let outcome = JobOutcome::completed(job);
        assert!(!outcome.is_success());

        let path = dir.path().join(FAILED_REPORT_FILE);
        write_failed_report(&path, &[outcome]).expect("write");

        let jobs = parse_report(&path).expect("parse");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].stage, Stage::Validated);
        assert!(jobs[0].similarity_scores.is_empty());
    }

    #[test]
    fn test_passing_jobs_stay_out_of_failed_report() {
        let dir = TempDir::new().expect("tempdir");
        let passing = JobOutcome::completed(test_job(
            dir.path(),
            37661,
            Stage::Complete,
            vec![0.95, 0.92],
        ));
        let below = JobOutcome::completed(test_job(
            dir.path(),
            37662,
            Stage::Complete,
            vec![0.95, 0.5],
        ));

        let path = dir.path().join(FAILED_REPORT_FILE);
        let written = write_failed_report(&path, &[passing, below]).expect("write");
        assert_eq!(written, 1);

        let jobs = parse_report(&path).expect("parse");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].orbit, 37662);
    }

    #[test]
    fn test_failed_report_is_in_orbit_order() {
        let dir = TempDir::new().expect("tempdir");
        let outcomes = vec![
            JobOutcome::failed(
                test_job(dir.path(), 37670, Stage::Pending, Vec::new()),
                Stage::Pending,
                "boom",
            ),
            JobOutcome::failed(
                test_job(dir.path(), 37661, Stage::Pending, Vec::new()),
                Stage::Pending,
                "boom",
            ),
        ];
        let path = dir.path().join(FAILED_REPORT_FILE);
        write_failed_report(&path, &outcomes).expect("write");

        let jobs = parse_report(&path).expect("parse");
        let orbits: Vec<u32> = jobs.iter().map(|j| j.orbit).collect();
        assert_eq!(orbits, vec![37661, 37670]);
    }

    #[test]
    fn test_record_without_stage_restarts_pending() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("report.txt");
        std::fs::write(
            &path,
            "orbit: 37661\n\
             config_index: 0\n\
             input_path: /in/a.h5\n\
             output_path: /out/a.h5\n\
             config_path: /out/a.cfg\n\
             log_path: /out/a.log\n\
             dump_path: /out/a.hdr\n\
             image_dir: /out/a\n\
             RESAMPLE_METHOD: nnInterpolate\n",
        )
        .expect("write");

        let jobs = parse_report(&path).expect("parse");
        assert_eq!(jobs[0].stage, Stage::Pending);
        assert_eq!(jobs[0].parameters["RESAMPLE_METHOD"], "nnInterpolate");
    }

    #[test]
    fn test_parse_rejects_unknown_attribute() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("report.txt");
        std::fs::write(&path, "orbit: 37661\nfavorite_color: green\n").expect("write");
        let err = parse_report(&path).unwrap_err();
        assert!(matches!(err, ReportError::UnknownAttribute(k) if k == "favorite_color"));
    }

    #[test]
    fn test_parse_rejects_missing_paths() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("report.txt");
        std::fs::write(&path, "orbit: 37661\nconfig_index: 0\n").expect("write");
        let err = parse_report(&path).unwrap_err();
        assert!(matches!(err, ReportError::MissingAttribute(_)));
    }

    #[test]
    fn test_parse_rejects_malformed_line() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("report.txt");
        std::fs::write(&path, "orbit 37661\n").expect("write");
        let err = parse_report(&path).unwrap_err();
        assert!(matches!(err, ReportError::MalformedLine(_)));
    }

    #[test]
    fn test_summary_lists_every_job_in_orbit_order() {
        let dir = TempDir::new().expect("tempdir");
        let outcomes = vec![
            JobOutcome::completed(test_job(dir.path(), 37670, Stage::Complete, vec![0.95, 0.95])),
            JobOutcome::failed(
                test_job(dir.path(), 37661, Stage::Pending, Vec::new()),
                Stage::Pending,
                "conversion tool exited with status 1",
            ),
        ];
        let path = dir.path().join(SUMMARY_FILE);
        write_summary(&path, &outcomes).expect("write summary");

        let text = std::fs::read_to_string(&path).expect("read");
        let value: serde_json::Value = serde_json::from_str(&text).expect("valid json");
        let entries = value.as_array().expect("array");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["job"]["orbit"], 37661);
        assert_eq!(entries[1]["job"]["orbit"], 37670);
        assert_eq!(entries[0]["outcome"]["kind"], "failed");
        assert_eq!(entries[1]["outcome"]["kind"], "completed");
    }

    #[test]
    fn test_run_report_percentage() {
        let dir = TempDir::new().expect("tempdir");
        let outcomes = vec![
            JobOutcome::completed(test_job(dir.path(), 1, Stage::Complete, vec![0.95, 0.95])),
            JobOutcome::completed(test_job(dir.path(), 2, Stage::Complete, vec![0.95, 0.95])),
            JobOutcome::failed(
                test_job(dir.path(), 3, Stage::Pending, Vec::new()),
                Stage::Pending,
                "boom",
            ),
            JobOutcome::completed(test_job(dir.path(), 4, Stage::Complete, vec![0.5, 0.95])),
        ];
        let report = RunReport::from_outcomes(&outcomes);
        assert_eq!(report.total, 4);
        assert_eq!(report.failed, 2);
        assert!((report.failure_pct() - 50.0).abs() < f64::EPSILON);
    }
}
