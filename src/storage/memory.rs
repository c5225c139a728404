//! In-memory survey store
//!
//! Keeps projects, segments and survey rows behind one lock.
//! Used by tests and by hosts that persist elsewhere.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Result, RoadsenseError};
use crate::ingest::sink::IngestionSink;
use crate::model::{Project, ProjectId, RoadSegment, SegmentId, SurveyData};

#[derive(Default)]
struct Tables {
    projects: Vec<Project>,
    segments: Vec<RoadSegment>,
    survey: HashMap<SegmentId, Vec<SurveyData>>,
    batch_writes: u64,
}

/// Survey store held entirely in memory
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Projects, newest first
    pub fn projects(&self) -> Vec<Project> {
        let mut projects = self.tables().projects.clone();
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        projects
    }

    pub fn project(&self, id: ProjectId) -> Option<Project> {
        self.tables().projects.iter().find(|p| p.id == id).cloned()
    }

    /// Segments of a project, newest first
    pub fn segments(&self, project_id: ProjectId) -> Vec<RoadSegment> {
        let mut segments: Vec<RoadSegment> = self
            .tables()
            .segments
            .iter()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect();
        segments.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        segments
    }

    pub fn segment(&self, id: SegmentId) -> Option<RoadSegment> {
        self.tables().segments.iter().find(|s| s.id == id).cloned()
    }

    pub fn segment_count(&self, project_id: ProjectId) -> usize {
        self.tables()
            .segments
            .iter()
            .filter(|s| s.project_id == project_id)
            .count()
    }

    /// Survey rows of a segment in arrival order
    pub fn survey_data(&self, segment_id: SegmentId) -> Vec<SurveyData> {
        self.tables()
            .survey
            .get(&segment_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Survey rows of a segment by ascending chainage
    ///
    /// Rows at the same chainage keep their arrival order.
    pub fn survey_data_by_chainage(&self, segment_id: SegmentId) -> Vec<SurveyData> {
        let mut rows = self.survey_data(segment_id);
        rows.sort_by(|a, b| a.chainage_m.total_cmp(&b.chainage_m));
        rows
    }

    /// Rows with `start_m <= chainage <= end_m`, in arrival order
    pub fn survey_data_in_range(
        &self,
        segment_id: SegmentId,
        start_m: f64,
        end_m: f64,
    ) -> Vec<SurveyData> {
        self.tables()
            .survey
            .get(&segment_id)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.chainage_m >= start_m && r.chainage_m <= end_m)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn survey_count(&self, segment_id: SegmentId) -> usize {
        self.tables().survey.get(&segment_id).map_or(0, Vec::len)
    }

    /// Remove a project with its segments and their rows
    ///
    /// Returns `false` if the project did not exist.
    pub fn delete_project(&self, id: ProjectId) -> bool {
        let mut tables = self.tables();
        let before = tables.projects.len();
        tables.projects.retain(|p| p.id != id);
        if tables.projects.len() == before {
            return false;
        }

        let removed: Vec<SegmentId> = tables
            .segments
            .iter()
            .filter(|s| s.project_id == id)
            .map(|s| s.id)
            .collect();
        tables.segments.retain(|s| s.project_id != id);
        for segment_id in removed {
            tables.survey.remove(&segment_id);
        }
        true
    }

    /// Remove a segment with its rows
    pub fn delete_segment(&self, id: SegmentId) -> bool {
        let mut tables = self.tables();
        let before = tables.segments.len();
        tables.segments.retain(|s| s.id != id);
        tables.survey.remove(&id);
        tables.segments.len() != before
    }

    /// Drop all survey rows of a segment, keeping the segment
    pub fn purge_survey_data(&self, segment_id: SegmentId) -> usize {
        self.tables()
            .survey
            .remove(&segment_id)
            .map_or(0, |rows| rows.len())
    }

    /// Number of `save_batch` calls that stored rows
    pub fn batch_writes(&self) -> u64 {
        self.tables().batch_writes
    }
}

#[async_trait]
impl IngestionSink for MemoryStore {
    async fn create_project(&self, project: &Project) -> Result<()> {
        let mut tables = self.tables();
        if tables.projects.iter().any(|p| p.id == project.id) {
            return Err(RoadsenseError::Storage(format!(
                "project {} already exists",
                project.id
            )));
        }
        tables.projects.push(project.clone());
        Ok(())
    }

    async fn create_segment(&self, segment: &RoadSegment) -> Result<()> {
        let mut tables = self.tables();
        if tables.segments.iter().any(|s| s.id == segment.id) {
            return Err(RoadsenseError::Storage(format!(
                "segment {} already exists",
                segment.id
            )));
        }
        tables.segments.push(segment.clone());
        Ok(())
    }

    async fn update_segment(&self, segment: &RoadSegment) -> Result<()> {
        let mut tables = self.tables();
        match tables.segments.iter_mut().find(|s| s.id == segment.id) {
            Some(stored) => {
                *stored = segment.clone();
                Ok(())
            }
            None => Err(RoadsenseError::Storage(format!(
                "segment {} not found",
                segment.id
            ))),
        }
    }

    async fn save_batch(&self, segment_id: SegmentId, records: &[SurveyData]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tables = self.tables();
        tables
            .survey
            .entry(segment_id)
            .or_default()
            .extend_from_slice(records);
        tables.batch_writes += 1;
        debug!("Stored {} rows for segment {}", records.len(), segment_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use tokio_test::{assert_err, assert_ok};
    use uuid::Uuid;

    fn row(segment_id: SegmentId, chainage_m: f64) -> SurveyData {
        SurveyData {
            id: Uuid::new_v4(),
            segment_id,
            timestamp: Utc::now(),
            sta: crate::station::format_station(chainage_m),
            chainage_m,
            speed_kmh: 25.0,
            vibration_z: 0.3,
            latitude: 0.0,
            longitude: 0.0,
            packet_count: 0,
        }
    }

    async fn seeded() -> (MemoryStore, Project, RoadSegment) {
        let store = MemoryStore::new();
        let project = Project::new("Ring Road").unwrap();
        let segment = RoadSegment::from_datum(project.id, "North lane", 500.0).unwrap();
        assert_ok!(store.create_project(&project).await);
        assert_ok!(store.create_segment(&segment).await);
        (store, project, segment)
    }

    #[tokio::test]
    async fn test_projects_newest_first() {
        let store = MemoryStore::new();
        let mut older = Project::new("Old").unwrap();
        older.created_at -= Duration::days(1);
        let newer = Project::new("New").unwrap();

        assert_ok!(store.create_project(&older).await);
        assert_ok!(store.create_project(&newer).await);

        let names: Vec<String> = store.projects().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["New", "Old"]);
        assert_eq!(store.project(older.id).unwrap().name, "Old");
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let (store, project, segment) = seeded().await;
        assert_err!(store.create_project(&project).await);
        assert_err!(store.create_segment(&segment).await);
    }

    #[tokio::test]
    async fn test_update_unknown_segment_fails() {
        let store = MemoryStore::new();
        let segment = RoadSegment::from_datum(Uuid::new_v4(), "Ghost", 10.0).unwrap();
        let result = store.update_segment(&segment).await;
        assert!(matches!(result, Err(RoadsenseError::Storage(_))));
    }

    #[tokio::test]
    async fn test_batches_append_in_order() {
        let (store, _, segment) = seeded().await;

        let first = [row(segment.id, 0.0), row(segment.id, 10.0)];
        let second = [row(segment.id, 5.0)];
        assert_ok!(store.save_batch(segment.id, &first).await);
        assert_ok!(store.save_batch(segment.id, &second).await);
        assert_ok!(store.save_batch(segment.id, &[]).await);

        let chainages: Vec<f64> = store
            .survey_data(segment.id)
            .iter()
            .map(|r| r.chainage_m)
            .collect();
        assert_eq!(chainages, vec![0.0, 10.0, 5.0]);
        assert_eq!(store.survey_count(segment.id), 3);
        assert_eq!(store.batch_writes(), 2);
    }

    #[tokio::test]
    async fn test_rows_ordered_by_chainage() {
        let (store, _, segment) = seeded().await;
        let rows: Vec<SurveyData> = [0.0, 50.0, 120.0, 90.0, 200.0, 90.0]
            .into_iter()
            .map(|c| row(segment.id, c))
            .collect();
        assert_ok!(store.save_batch(segment.id, &rows).await);

        let sorted = store.survey_data_by_chainage(segment.id);
        let chainages: Vec<f64> = sorted.iter().map(|r| r.chainage_m).collect();
        assert_eq!(chainages, vec![0.0, 50.0, 90.0, 90.0, 120.0, 200.0]);
        // Ties stay in arrival order
        assert_eq!(sorted[2].id, rows[3].id);
        assert_eq!(sorted[3].id, rows[5].id);

        assert!(store.survey_data_by_chainage(Uuid::new_v4()).is_empty());
    }

    #[tokio::test]
    async fn test_chainage_range_inclusive() {
        let (store, _, segment) = seeded().await;
        let rows: Vec<SurveyData> = [0.0, 25.0, 50.0, 75.0, 100.0]
            .into_iter()
            .map(|c| row(segment.id, c))
            .collect();
        assert_ok!(store.save_batch(segment.id, &rows).await);

        let hits: Vec<f64> = store
            .survey_data_in_range(segment.id, 25.0, 75.0)
            .iter()
            .map(|r| r.chainage_m)
            .collect();
        assert_eq!(hits, vec![25.0, 50.0, 75.0]);
    }

    #[tokio::test]
    async fn test_segments_of_project() {
        let (store, project, first) = seeded().await;
        let mut second = RoadSegment::from_datum(project.id, "South lane", 400.0).unwrap();
        second.start_time = first.start_time + Duration::minutes(5);
        assert_ok!(store.create_segment(&second).await);

        let other = RoadSegment::from_datum(Uuid::new_v4(), "Elsewhere", 10.0).unwrap();
        assert_ok!(store.create_segment(&other).await);

        let names: Vec<String> = store
            .segments(project.id)
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["South lane", "North lane"]);
        assert_eq!(store.segment_count(project.id), 2);
    }

    #[tokio::test]
    async fn test_delete_project_cascades() {
        let (store, project, segment) = seeded().await;
        assert_ok!(store.save_batch(segment.id, &[row(segment.id, 1.0)]).await);

        assert!(store.delete_project(project.id));
        assert!(store.project(project.id).is_none());
        assert!(store.segment(segment.id).is_none());
        assert_eq!(store.survey_count(segment.id), 0);
        assert!(!store.delete_project(project.id));
    }

    #[tokio::test]
    async fn test_delete_segment_and_purge() {
        let (store, project, segment) = seeded().await;
        assert_ok!(store.save_batch(segment.id, &[row(segment.id, 1.0), row(segment.id, 2.0)]).await);

        assert_eq!(store.purge_survey_data(segment.id), 2);
        assert!(store.segment(segment.id).is_some());

        assert!(store.delete_segment(segment.id));
        assert_eq!(store.segment_count(project.id), 0);
        assert!(!store.delete_segment(segment.id));
    }
}
