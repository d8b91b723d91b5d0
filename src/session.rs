//! Session output: where captured frames go.
//!
//! Every acquired frame is handed to an [`OutputSink`] as a [`CaptureArtifact`] the moment
//! it is acquired; the workflow keeps no image past the step that produced it.
//!
//! Layout (relative to the session root):
//!
//! ```text
//! {sample_name}/LowMag_x1000/Overview_Center.jpg
//! {sample_name}/HighMag_x5000/Particle_001_x5000.jpg
//! {sample_name}/SuperHighMag_x50000/Particle_001_x50000.jpg
//! session_log.txt
//! manifest.json
//! ```

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::transform::StagePosition;

/// Magnification stage a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureStage {
    LowMag,
    HighMag,
    SuperHighMag,
}

impl fmt::Display for CaptureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureStage::LowMag => "LowMag",
            CaptureStage::HighMag => "HighMag",
            CaptureStage::SuperHighMag => "SuperHighMag",
        };
        f.write_str(name)
    }
}

impl CaptureStage {
    /// Directory name for this stage at `magnification`, e.g. `HighMag_x5000`.
    pub fn directory(&self, magnification: f64) -> String {
        format!("{self}_x{magnification}")
    }
}

/// A frame plus the context it was acquired under.
#[derive(Debug, Clone)]
pub struct CaptureArtifact {
    pub image: GrayImage,
    pub slot_id: u32,
    pub sample_name: String,
    pub stage: CaptureStage,
    pub magnification: f64,
    pub stage_position: StagePosition,
    /// File name, e.g. `Overview_Center.jpg`.
    pub name: String,
}

impl CaptureArtifact {
    /// Name of the low-magnification overview frame.
    pub fn overview_name() -> String {
        "Overview_Center.jpg".to_string()
    }

    /// Name of a targeted frame; `index` is 1-based.
    pub fn particle_name(index: usize, magnification: f64) -> String {
        format!("Particle_{index:03}_x{magnification}.jpg")
    }

    /// `{sample}/{Stage}_x{mag}/{name}` relative to the session root.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(sanitize_segment(&self.sample_name))
            .join(self.stage.directory(self.magnification))
            .join(&self.name)
    }

    fn record(&self, path: PathBuf) -> ArtifactRecord {
        ArtifactRecord {
            path,
            slot_id: self.slot_id,
            sample_name: self.sample_name.clone(),
            stage: self.stage,
            magnification: self.magnification,
            stage_position: self.stage_position,
            width: self.image.width(),
            height: self.image.height(),
        }
    }
}

/// Metadata kept for every stored frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Location relative to the session root.
    pub path: PathBuf,
    pub slot_id: u32,
    pub sample_name: String,
    pub stage: CaptureStage,
    pub magnification: f64,
    pub stage_position: StagePosition,
    pub width: u32,
    pub height: u32,
}

/// Summary written as `manifest.json` when a session finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionManifest {
    pub run_uid: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub artifacts: Vec<ArtifactRecord>,
}

/// Consumer of captured frames.
#[async_trait]
pub trait OutputSink: Send {
    /// Persist `artifact`, returning a location no other artifact of this session shares.
    async fn store(&mut self, artifact: CaptureArtifact) -> AppResult<PathBuf>;

    /// Append a line to the session log.
    async fn note(&mut self, message: &str) -> AppResult<()>;

    /// Flush whatever summary the sink keeps.
    async fn finish(&mut self) -> AppResult<()>;
}

/// Replace path separators so a sample name is always a single segment.
fn sanitize_segment(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect();
    match cleaned.trim() {
        "" | "." | ".." => "_".to_string(),
        trimmed => trimmed.to_string(),
    }
}

/// First of `path`, `stem_1.ext`, `stem_2.ext`, … for which `taken` is false.
fn first_free(path: PathBuf, taken: impl Fn(&Path) -> bool) -> PathBuf {
    if !taken(&path) {
        return path;
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    (1u32..)
        .map(|n| parent.join(format!("{stem}_{n}{ext}")))
        .find(|candidate| !taken(candidate))
        .unwrap_or(path)
}

// ============================================================================
// Session directory
// ============================================================================

/// Writes frames under `<output_dir>/Session_<timestamp>/`.
pub struct SessionDirectory {
    root: PathBuf,
    manifest: SessionManifest,
}

impl SessionDirectory {
    /// Create a fresh, timestamped session directory under `output_dir`.
    pub fn create(output_dir: impl AsRef<Path>) -> AppResult<Self> {
        let started_at = Utc::now();
        let name = format!("Session_{}", started_at.format("%Y%m%d_%H%M%S"));
        let root = first_free(output_dir.as_ref().join(name), Path::exists);
        fs::create_dir_all(&root)?;
        tracing::info!(root = %root.display(), "session directory created");

        Ok(Self {
            root,
            manifest: SessionManifest {
                run_uid: uuid::Uuid::new_v4().to_string(),
                started_at,
                finished_at: None,
                artifacts: Vec::new(),
            },
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &SessionManifest {
        &self.manifest
    }
}

#[async_trait]
impl OutputSink for SessionDirectory {
    async fn store(&mut self, artifact: CaptureArtifact) -> AppResult<PathBuf> {
        let target = first_free(self.root.join(artifact.relative_path()), Path::exists);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        artifact.image.save(&target)?;

        let relative = target
            .strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| target.clone());
        tracing::debug!(path = %target.display(), "artifact written");
        self.manifest.artifacts.push(artifact.record(relative));
        Ok(target)
    }

    async fn note(&mut self, message: &str) -> AppResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join("session_log.txt"))?;
        writeln!(
            file,
            "[{}] {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            message
        )?;
        Ok(())
    }

    async fn finish(&mut self) -> AppResult<()> {
        self.manifest.finished_at = Some(Utc::now());
        let json = serde_json::to_string_pretty(&self.manifest)?;
        fs::write(self.root.join("manifest.json"), json)?;
        tracing::info!(
            artifacts = self.manifest.artifacts.len(),
            "session manifest written"
        );
        Ok(())
    }
}

// ============================================================================
// In-memory sink
// ============================================================================

/// Keeps frames in memory; for headless hosts and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    stored: Vec<(ArtifactRecord, GrayImage)>,
    notes: Vec<String>,
    finished: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> impl Iterator<Item = &ArtifactRecord> {
        self.stored.iter().map(|(record, _)| record)
    }

    pub fn image(&self, index: usize) -> Option<&GrayImage> {
        self.stored.get(index).map(|(_, image)| image)
    }

    pub fn len(&self) -> usize {
        self.stored.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stored.is_empty()
    }

    /// Number of stored frames for `stage`.
    pub fn count(&self, stage: CaptureStage) -> usize {
        self.records().filter(|r| r.stage == stage).count()
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[async_trait]
impl OutputSink for MemorySink {
    async fn store(&mut self, artifact: CaptureArtifact) -> AppResult<PathBuf> {
        let path = first_free(PathBuf::from("session").join(artifact.relative_path()), |p| {
            self.stored.iter().any(|(r, _)| r.path == p)
        });
        let record = artifact.record(path.clone());
        self.stored.push((record, artifact.image));
        Ok(path)
    }

    async fn note(&mut self, message: &str) -> AppResult<()> {
        self.notes.push(message.to_string());
        Ok(())
    }

    async fn finish(&mut self) -> AppResult<()> {
        self.finished = true;
        Ok(())
    }
}
