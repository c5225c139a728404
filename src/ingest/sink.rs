//! Persistence boundary for the ingestion pipeline

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Project, RoadSegment, SegmentId, SurveyData};

/// Append-only store the pipeline writes into
///
/// Implementations must append a batch atomically and keep the order of
/// `records` within a segment.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IngestionSink: Send + Sync {
    /// Persist a new project
    async fn create_project(&self, project: &Project) -> Result<()>;

    /// Persist a new segment
    async fn create_segment(&self, segment: &RoadSegment) -> Result<()>;

    /// Replace the stored snapshot of an existing segment
    async fn update_segment(&self, segment: &RoadSegment) -> Result<()>;

    /// Append survey rows to a segment, in order
    async fn save_batch(&self, segment_id: SegmentId, records: &[SurveyData]) -> Result<()>;
}
