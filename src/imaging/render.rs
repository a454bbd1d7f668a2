//! Collaborator seams for image rendering and similarity scoring.
//!
//! The core never interprets raster data. It hands an artifact, a
//! dataset path, and selection indices to an [`ImageRenderer`], and two
//! image paths to a [`SimilarityScorer`], and only looks at the outcome.
//! The default implementations shell out to operator-supplied tools.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::RenderError;

/// Renders one dataset slice of a conversion artifact to a raster image.
///
/// Selection indices, not human-readable names, choose the slice.
#[async_trait]
pub trait ImageRenderer: Send + Sync {
    async fn render(
        &self,
        artifact: &Path,
        dataset_path: &str,
        indices: &[usize],
        out: &Path,
    ) -> Result<(), RenderError>;
}

/// Scores the perceptual similarity of two raster images.
///
/// Higher means more similar; the metric itself is opaque to the core.
#[async_trait]
pub trait SimilarityScorer: Send + Sync {
    async fn score(&self, left: &Path, right: &Path) -> Result<f64, RenderError>;
}

/// Renderer backed by an external executable.
///
/// Invoked as `<program> <artifact> <dataset> <out> <index>...`.
pub struct CommandRenderer {
    program: PathBuf,
}

impl CommandRenderer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl ImageRenderer for CommandRenderer {
    async fn render(
        &self,
        artifact: &Path,
        dataset_path: &str,
        indices: &[usize],
        out: &Path,
    ) -> Result<(), RenderError> {
        let mut command = Command::new(&self.program);
        command.arg(artifact).arg(dataset_path).arg(out);
        for index in indices {
            command.arg(index.to_string());
        }
        let output = command.output().await?;
        if !output.status.success() {
            return Err(RenderError::RendererFailed {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Scorer backed by an external executable.
///
/// Invoked as `<program> <left> <right>`; the score is read from stdout.
pub struct CommandScorer {
    program: PathBuf,
}

impl CommandScorer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl SimilarityScorer for CommandScorer {
    async fn score(&self, left: &Path, right: &Path) -> Result<f64, RenderError> {
        let output = Command::new(&self.program)
            .arg(left)
            .arg(right)
            .output()
            .await?;
        if !output.status.success() {
            return Err(RenderError::ScorerFailed {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let text = stdout.trim();
        text.parse::<f64>()
            .map_err(|_| RenderError::BadScore(text.to_string()))
    }
}
