//! # JSON Lines Store
//!
//! Append-only survey files, one JSON object per line:
//!
//! ```text
//! <data_dir>/projects.jsonl
//! <data_dir>/segments.jsonl          every snapshot; the last one per id wins
//! <data_dir>/survey/<segment>.jsonl  survey rows in arrival order
//! ```
//!
//! A batch is serialized up front and written with a single call. If the
//! write fails partway the file is cut back to its previous length, so a
//! retried batch is never stored twice and no torn line is left behind.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::ingest::sink::IngestionSink;
use crate::model::{Project, RoadSegment, SegmentId, SurveyData};

const PROJECTS_FILE: &str = "projects.jsonl";
const SEGMENTS_FILE: &str = "segments.jsonl";
const SURVEY_DIR: &str = "survey";

/// File-backed survey store
pub struct JsonlStore {
    root: PathBuf,
    // Serializes appends so lines from concurrent writers never interleave
    write_lock: Mutex<()>,
}

impl JsonlStore {
    /// Open (and create if needed) a store under `root`
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(SURVEY_DIR)).await?;
        info!("Survey data directory: {}", root.display());

        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a segment's survey file
    pub fn survey_path(&self, segment_id: SegmentId) -> PathBuf {
        self.root
            .join(SURVEY_DIR)
            .join(format!("{}.jsonl", segment_id))
    }

    /// Replay the segment log, keeping the latest snapshot of each segment
    ///
    /// Segments come back in the order they were first created. Unreadable
    /// lines are skipped with a warning.
    pub async fn load_segments(&self) -> Result<Vec<RoadSegment>> {
        let segments: Vec<RoadSegment> = self.read_lines(&self.root.join(SEGMENTS_FILE)).await?;

        let mut order = Vec::new();
        let mut latest: HashMap<SegmentId, RoadSegment> = HashMap::new();
        for segment in segments {
            if !latest.contains_key(&segment.id) {
                order.push(segment.id);
            }
            latest.insert(segment.id, segment);
        }

        Ok(order
            .into_iter()
            .filter_map(|id| latest.remove(&id))
            .collect())
    }

    pub async fn load_projects(&self) -> Result<Vec<Project>> {
        self.read_lines(&self.root.join(PROJECTS_FILE)).await
    }

    /// Survey rows of a segment in arrival order
    pub async fn load_survey_data(&self, segment_id: SegmentId) -> Result<Vec<SurveyData>> {
        self.read_lines(&self.survey_path(segment_id)).await
    }

    async fn read_lines<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>> {
        let contents = match fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut items = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(item) => items.push(item),
                Err(e) => warn!("Skipping line {} of {}: {}", index + 1, path.display(), e),
            }
        }
        Ok(items)
    }

    async fn append<T: Serialize>(&self, path: &Path, items: &[T]) -> Result<()> {
        let buf = encode_lines(items)?;

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let start_len = file.metadata().await?.len();
        write_or_rollback(&mut file, start_len, &buf).await
    }
}

fn encode_lines<T: Serialize>(items: &[T]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for item in items {
        serde_json::to_writer(&mut buf, item)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

/// Append target that can be cut back to an earlier length
#[async_trait]
trait Truncate: AsyncWrite + Unpin + Send {
    async fn truncate(&mut self, len: u64) -> io::Result<()>;
}

#[async_trait]
impl Truncate for File {
    async fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len).await
    }
}

/// Write all of `buf`, or restore the target to `start_len`
async fn write_or_rollback<W: Truncate>(target: &mut W, start_len: u64, buf: &[u8]) -> Result<()> {
    let written = match target.write_all(buf).await {
        Ok(()) => target.flush().await,
        Err(e) => Err(e),
    };

    if let Err(e) = written {
        match target.truncate(start_len).await {
            Ok(()) => warn!("Append failed, rolled back to {} bytes: {}", start_len, e),
            Err(undo) => error!("Append failed and could not be rolled back: {}", undo),
        }
        return Err(e.into());
    }
    Ok(())
}

#[async_trait]
impl IngestionSink for JsonlStore {
    async fn create_project(&self, project: &Project) -> Result<()> {
        self.append(&self.root.join(PROJECTS_FILE), std::slice::from_ref(project))
            .await
    }

    async fn create_segment(&self, segment: &RoadSegment) -> Result<()> {
        self.append(&self.root.join(SEGMENTS_FILE), std::slice::from_ref(segment))
            .await
    }

    async fn update_segment(&self, segment: &RoadSegment) -> Result<()> {
        self.append(&self.root.join(SEGMENTS_FILE), std::slice::from_ref(segment))
            .await
    }

    async fn save_batch(&self, segment_id: SegmentId, records: &[SurveyData]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.append(&self.survey_path(segment_id), records).await?;
        debug!("Appended {} rows for segment {}", records.len(), segment_id);
        Ok(())
    }
}
