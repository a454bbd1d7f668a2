//! Granule discovery and workspace layout.
//!
//! Walks an input root for Basic Fusion granules named
//! `TERRA_BF_L1B_O<orbit>_<YYYYMMDDhhmmss>_Fnnn_Vnnn.h5`, keeps the ones
//! whose orbit falls in the requested ranges, and crosses them with the
//! requested parameter sets to produce the job list. Artifacts are laid
//! out in year-month partition trees under the output root, with per-run
//! logs, dumps and reports under a freshly allocated `run<N>` directory.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{Datelike, NaiveDateTime};
use regex::Regex;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::ParameterSet;
use crate::error::DiscoveryError;
use crate::job::{Job, JobPaths};

fn granule_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^TERRA_BF_L1B_O(\d+)_(\d{14})_F\d{3}_V\d{3}\.(?:h5|he5|hdf5)$")
            .expect("granule pattern is valid")
    })
}

/// One discovered input granule.
#[derive(Debug, Clone)]
pub struct GranuleFile {
    pub orbit: u32,
    /// Raw 14-digit start timestamp from the filename.
    pub stamp: String,
    pub start_time: NaiveDateTime,
    pub path: PathBuf,
}

/// Parses orbit and start time out of a granule filename.
///
/// Files that do not match the naming convention return `None` and are
/// silently skipped by discovery.
pub fn parse_granule_name(name: &str) -> Option<(u32, String, NaiveDateTime)> {
    let captures = granule_pattern().captures(name)?;
    let orbit: u32 = captures[1].parse().ok()?;
    let stamp = captures[2].to_string();
    let start_time = NaiveDateTime::parse_from_str(&stamp, "%Y%m%d%H%M%S").ok()?;
    Some((orbit, stamp, start_time))
}

/// Year-month partition string for a granule start time, e.g. `2007.01`.
pub fn partition(start_time: &NaiveDateTime) -> String {
    format!("{}.{:02}", start_time.year(), start_time.month())
}

/// A union of inclusive orbit ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrbitRanges {
    ranges: Vec<(u32, u32)>,
}

impl OrbitRanges {
    /// Parses `A-B` and `N` tokens from a comma-separated list.
    pub fn parse(input: &str) -> Result<Self, DiscoveryError> {
        let mut ranges = Vec::new();
        for token in input.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let invalid = |reason: &str| DiscoveryError::InvalidRange {
                token: token.to_string(),
                reason: reason.to_string(),
            };
            let (lo, hi) = match token.split_once('-') {
                Some((lo, hi)) => (
                    lo.trim().parse().map_err(|_| invalid("not a number"))?,
                    hi.trim().parse().map_err(|_| invalid("not a number"))?,
                ),
                None => {
                    let orbit = token.parse().map_err(|_| invalid("not a number"))?;
                    (orbit, orbit)
                }
            };
            if lo > hi {
                return Err(invalid("lower bound exceeds upper bound"));
            }
            ranges.push((lo, hi));
        }
        if ranges.is_empty() {
            return Err(DiscoveryError::InvalidRange {
                token: input.to_string(),
                reason: "no orbit ranges given".to_string(),
            });
        }
        Ok(Self { ranges })
    }

    pub fn contains(&self, orbit: u32) -> bool {
        self.ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&orbit))
    }

    /// Every requested orbit, ascending, without duplicates.
    pub fn orbits(&self) -> Vec<u32> {
        let mut orbits: Vec<u32> = self
            .ranges
            .iter()
            .flat_map(|(lo, hi)| *lo..=*hi)
            .collect();
        orbits.sort_unstable();
        orbits.dedup();
        orbits
    }

    /// Requested orbits absent from `found`, ascending.
    pub fn missing(&self, found: &HashSet<u32>) -> Vec<u32> {
        self.orbits()
            .into_iter()
            .filter(|orbit| !found.contains(orbit))
            .collect()
    }
}

/// Output-tree owner: year-month partition dirs plus the per-run
/// `run<N>` directory for logs, dumps and reports.
///
/// Directory creation is idempotent and memoized per run, so repeated
/// requests for the same partition cost one syscall total.
#[derive(Debug)]
pub struct Workspace {
    out_root: PathBuf,
    run_dir: PathBuf,
    created: HashSet<PathBuf>,
}

impl Workspace {
    /// Creates the output root if needed and allocates the next `run<N>`
    /// directory under it.
    pub fn create(out_root: &Path) -> Result<Self, DiscoveryError> {
        std::fs::create_dir_all(out_root)?;
        let run_dir = allocate_run_dir(out_root)?;
        std::fs::create_dir_all(run_dir.join("log"))?;
        std::fs::create_dir_all(run_dir.join("dump"))?;
        info!(run_dir = %run_dir.display(), "Allocated run directory");
        Ok(Self {
            out_root: out_root.to_path_buf(),
            run_dir,
            created: HashSet::new(),
        })
    }

    pub fn out_root(&self) -> &Path {
        &self.out_root
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Idempotent, memoized directory creation.
    pub fn ensure_dir(&mut self, dir: &Path) -> std::io::Result<()> {
        if self.created.contains(dir) {
            return Ok(());
        }
        std::fs::create_dir_all(dir)?;
        self.created.insert(dir.to_path_buf());
        Ok(())
    }

    /// Derives and prepares every filesystem target for one job.
    pub fn job_paths(
        &mut self,
        granule: &GranuleFile,
        output_prefix: &str,
        config_index: usize,
    ) -> Result<JobPaths, DiscoveryError> {
        let partition = partition(&granule.start_time);
        let data_dir = self.out_root.join("data").join(&partition);
        let config_dir = self.out_root.join("config").join(&partition);
        let image_root = self.out_root.join("image").join(&partition);
        let log_dir = self.run_dir.join("log").join(&partition);
        let dump_dir = self.run_dir.join("dump").join(&partition);
        for dir in [&data_dir, &config_dir, &image_root, &log_dir, &dump_dir] {
            self.ensure_dir(dir)?;
        }

        let stem = format!(
            "{output_prefix}_TERRA_BF_L1B_O{}_{}_F000_V001.c{config_index}",
            granule.orbit, granule.stamp
        );
        let image_dir = image_root.join(&stem);
        self.ensure_dir(&image_dir)?;

        Ok(JobPaths {
            output: data_dir.join(format!("{stem}.h5")),
            config: config_dir.join(format!("{stem}.cfg")),
            log: log_dir.join(format!("{stem}.log")),
            dump: dump_dir.join(format!("{stem}.hdr")),
            image_dir,
        })
    }
}

/// Picks `run<N>` with `N` one greater than any existing run directory.
fn allocate_run_dir(out_root: &Path) -> Result<PathBuf, std::io::Error> {
    let mut greatest: i64 = -1;
    for entry in std::fs::read_dir(out_root)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(rest) = name.to_str().and_then(|n| n.strip_prefix("run")) else {
            continue;
        };
        if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if let Ok(number) = rest.parse::<i64>() {
            greatest = greatest.max(number);
        }
    }
    let run_dir = out_root.join(format!("run{}", greatest + 1));
    std::fs::create_dir(&run_dir)?;
    Ok(run_dir)
}

/// Walks the input root and builds the full job list: one job per
/// discovered in-range orbit per parameter set.
///
/// Any requested orbit with no granule on disk is a hard error; the
/// caller must abort rather than run with partial coverage.
pub fn discover_jobs(
    input_root: &Path,
    ranges: &OrbitRanges,
    sets: &[ParameterSet],
    workspace: &mut Workspace,
) -> Result<Vec<Job>, DiscoveryError> {
    let mut found: BTreeMap<u32, GranuleFile> = BTreeMap::new();

    for entry in WalkDir::new(input_root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        let Some((orbit, stamp, start_time)) = parse_granule_name(name) else {
            continue;
        };
        if !ranges.contains(orbit) {
            continue;
        }
        if let Some(first) = found.get(&orbit) {
            debug!(
                orbit,
                kept = %first.path.display(),
                skipped = %entry.path().display(),
                "Duplicate granule for orbit, keeping first"
            );
            continue;
        }
        found.insert(
            orbit,
            GranuleFile {
                orbit,
                stamp,
                start_time,
                path: entry.into_path(),
            },
        );
    }

    let orbits_found: HashSet<u32> = found.keys().copied().collect();
    let missing = ranges.missing(&orbits_found);
    if !missing.is_empty() {
        return Err(DiscoveryError::MissingOrbits { orbits: missing });
    }

    let mut jobs = Vec::with_capacity(found.len() * sets.len());
    for granule in found.values() {
        for (config_index, set) in sets.iter().enumerate() {
            let paths = workspace.job_paths(granule, &set.workflow.output_prefix, config_index)?;
            jobs.push(Job::new(
                granule.orbit,
                config_index,
                set.tool.clone(),
                set.workflow.clone(),
                granule.path.clone(),
                paths,
            ));
        }
    }

    info!(
        jobs = jobs.len(),
        orbits = found.len(),
        configurations = sets.len(),
        "Discovery complete"
    );
    Ok(jobs)
}
