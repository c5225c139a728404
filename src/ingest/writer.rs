//! # Batched Ingestion Writer
//!
//! Survey rows are buffered and handed to a background persistence task as
//! one batch per `batch_size` rows or per flush tick. The link worker only
//! ever enqueues; nothing on this side waits for the store.
//!
//! - Row batches are bounded by `max_pending_batches`. A batch that does not
//!   fit is dropped and reported instead of growing memory.
//! - Progress snapshots are coalesced per segment, so a slow store only
//!   writes the latest one.
//! - Segment creation and completion are always queued.
//!
//! The task applies operations in the order they were queued. A failed
//! write is retried once. After that it is dropped with an error event and
//! ingestion carries on.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::sink::IngestionSink;
use crate::error::Result;
use crate::link::bus::EventBus;
use crate::link::event::{ErrorKind, LinkEvent};
use crate::model::{RoadSegment, SegmentId, SurveyData};

/// How long shutdown waits for queued writes
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Writer tuning
#[derive(Debug, Clone, Copy)]
pub struct WriterConfig {
    /// Rows per batch
    pub batch_size: usize,
    /// Batches that may wait for the store
    pub max_pending_batches: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            max_pending_batches: 8,
        }
    }
}

enum SinkOp {
    CreateSegment(RoadSegment),
    UpdateSegment(RoadSegment),
    /// Write the latest progress snapshot of a segment, if still unwritten
    Progress(SegmentId),
    Batch {
        segment_id: SegmentId,
        records: Vec<SurveyData>,
    },
}

/// State shared with the persistence task
#[derive(Default)]
struct Backlog {
    progress: Mutex<HashMap<SegmentId, RoadSegment>>,
    batches: AtomicUsize,
}

impl Backlog {
    fn progress(&self) -> MutexGuard<'_, HashMap<SegmentId, RoadSegment>> {
        self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Front half of the ingestion path, owned by the link worker
pub struct IngestWriter {
    ops: mpsc::UnboundedSender<SinkOp>,
    backlog: Arc<Backlog>,
    pending: Vec<SurveyData>,
    batch_size: usize,
    max_pending_batches: usize,
    dropped_batches: u64,
    events: EventBus,
    task: JoinHandle<()>,
}

impl IngestWriter {
    /// Start the persistence task for `sink`
    pub fn spawn(sink: Arc<dyn IngestionSink>, config: WriterConfig, events: EventBus) -> Self {
        let (ops, rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(Backlog::default());
        let task = tokio::spawn(persist(sink, rx, backlog.clone(), events.clone()));

        Self {
            ops,
            backlog,
            pending: Vec::with_capacity(config.batch_size),
            batch_size: config.batch_size.max(1),
            max_pending_batches: config.max_pending_batches.max(1),
            dropped_batches: 0,
            events,
            task,
        }
    }

    /// Queue creation of a segment ahead of its rows
    pub fn create_segment(&mut self, segment: RoadSegment) {
        self.flush();
        self.send_op(SinkOp::CreateSegment(segment));
    }

    /// Queue a segment snapshot after all rows buffered so far
    ///
    /// Never coalesced; used for completion.
    pub fn update_segment(&mut self, segment: RoadSegment) {
        self.flush();
        self.send_op(SinkOp::UpdateSegment(segment));
    }

    /// Queue a progress snapshot, replacing one that is still waiting
    pub fn record_progress(&mut self, segment: RoadSegment) {
        self.flush();

        let id = segment.id;
        let waiting = self.backlog.progress().insert(id, segment).is_some();
        if waiting {
            debug!("Coalesced progress update for segment {}", id);
        } else {
            self.send_op(SinkOp::Progress(id));
        }
    }

    /// Buffer one row, flushing when the batch is full
    pub fn push(&mut self, record: SurveyData) {
        if let Some(first) = self.pending.first() {
            if first.segment_id != record.segment_id {
                self.flush();
            }
        }

        self.pending.push(record);
        if self.pending.len() >= self.batch_size {
            self.flush();
        }
    }

    /// Hand buffered rows to the persistence task without waiting
    pub fn flush(&mut self) {
        let Some(segment_id) = self.pending.first().map(|r| r.segment_id) else {
            return;
        };
        let records = std::mem::replace(&mut self.pending, Vec::with_capacity(self.batch_size));
        let count = records.len();

        if self.backlog.batches.load(Ordering::SeqCst) >= self.max_pending_batches {
            self.dropped_batches += 1;
            error!(
                "Storage backlog full, dropped batch of {} records for segment {}",
                count, segment_id
            );
            self.events.publish(LinkEvent::error(
                ErrorKind::Persistence,
                format!(
                    "storage backlog: dropped {} records for segment {}",
                    count, segment_id
                ),
            ));
            return;
        }

        self.backlog.batches.fetch_add(1, Ordering::SeqCst);
        if self.ops.send(SinkOp::Batch { segment_id, records }).is_err() {
            self.dropped_batches += 1;
            error!("Persistence task stopped, dropped {} records", count);
            return;
        }
        debug!("Queued batch of {} records", count);
    }

    /// Rows waiting for the next flush
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Batches queued for the store and not yet picked up
    pub fn queued_batches(&self) -> usize {
        self.backlog.batches.load(Ordering::SeqCst)
    }

    /// Batches lost to a full backlog
    pub fn dropped_batches(&self) -> u64 {
        self.dropped_batches
    }

    /// Flush, then wait for queued writes to finish
    pub async fn shutdown(mut self) {
        self.flush();
        drop(self.ops);

        match tokio::time::timeout(SHUTDOWN_GRACE, &mut self.task).await {
            Ok(Ok(())) => debug!("Persistence task drained"),
            Ok(Err(e)) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Ok(Err(e)) => warn!("Persistence task ended abnormally: {}", e),
            Err(_) => {
                warn!("Persistence task did not drain in {:?}, aborting", SHUTDOWN_GRACE);
                self.task.abort();
            }
        }
    }

    fn send_op(&self, op: SinkOp) {
        if self.ops.send(op).is_err() {
            error!("Persistence task stopped, segment update lost");
        }
    }
}

async fn persist(
    sink: Arc<dyn IngestionSink>,
    mut ops: mpsc::UnboundedReceiver<SinkOp>,
    backlog: Arc<Backlog>,
    events: EventBus,
) {
    while let Some(op) = ops.recv().await {
        let (what, result) = match op {
            SinkOp::CreateSegment(segment) => (
                format!("create segment {}", segment.id),
                retry_once(|| sink.create_segment(&segment)).await,
            ),
            SinkOp::UpdateSegment(segment) => (
                format!("update segment {}", segment.id),
                retry_once(|| sink.update_segment(&segment)).await,
            ),
            SinkOp::Progress(id) => {
                let latest = backlog.progress().remove(&id);
                let Some(segment) = latest else {
                    continue;
                };
                (
                    format!("progress of segment {}", id),
                    retry_once(|| sink.update_segment(&segment)).await,
                )
            }
            SinkOp::Batch {
                segment_id,
                records,
            } => {
                backlog.batches.fetch_sub(1, Ordering::SeqCst);
                (
                    format!("{} records for segment {}", records.len(), segment_id),
                    retry_once(|| sink.save_batch(segment_id, &records)).await,
                )
            }
        };

        match result {
            Ok(()) => debug!("Persisted {}", what),
            Err(e) => {
                error!("Dropped {} after retry: {}", what, e);
                events.publish(LinkEvent::error(
                    ErrorKind::Persistence,
                    format!("dropped {}: {}", what, e),
                ));
            }
        }
    }
}

async fn retry_once<F, Fut>(mut attempt: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    match attempt().await {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!("Storage write failed, retrying once: {}", e);
            attempt().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RoadsenseError;
    use crate::ingest::sink::MockIngestionSink;
    use crate::model::{Project, SegmentUpdate};
    use crate::storage::memory::MemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::watch;
    use uuid::Uuid;

    fn record(segment_id: SegmentId, chainage_m: f64) -> SurveyData {
        SurveyData {
            id: Uuid::new_v4(),
            segment_id,
            timestamp: Utc::now(),
            sta: crate::station::format_station(chainage_m),
            chainage_m,
            speed_kmh: 20.0,
            vibration_z: 0.1,
            latitude: 0.0,
            longitude: 0.0,
            packet_count: chainage_m as u32,
        }
    }

    fn config(batch_size: usize) -> WriterConfig {
        WriterConfig {
            batch_size,
            max_pending_batches: 4,
        }
    }

    /// Store that holds every write until the gate opens
    struct GatedSink {
        store: MemoryStore,
        gate: watch::Receiver<bool>,
        updates: AtomicUsize,
    }

    impl GatedSink {
        fn new() -> (Arc<Self>, watch::Sender<bool>) {
            let (open, gate) = watch::channel(false);
            let sink = Arc::new(Self {
                store: MemoryStore::new(),
                gate,
                updates: AtomicUsize::new(0),
            });
            (sink, open)
        }

        async fn wait(&self) {
            let mut gate = self.gate.clone();
            let _ = gate.wait_for(|open| *open).await;
        }
    }

    #[async_trait]
    impl IngestionSink for GatedSink {
        async fn create_project(&self, project: &Project) -> Result<()> {
            self.store.create_project(project).await
        }

        async fn create_segment(&self, segment: &RoadSegment) -> Result<()> {
            self.wait().await;
            self.store.create_segment(segment).await
        }

        async fn update_segment(&self, segment: &RoadSegment) -> Result<()> {
            self.wait().await;
            self.updates.fetch_add(1, Ordering::SeqCst);
            self.store.update_segment(segment).await
        }

        async fn save_batch(&self, segment_id: SegmentId, records: &[SurveyData]) -> Result<()> {
            self.wait().await;
            self.store.save_batch(segment_id, records).await
        }
    }

    #[tokio::test]
    async fn test_batches_preserve_order() {
        let store = Arc::new(MemoryStore::new());
        let mut writer = IngestWriter::spawn(store.clone(), config(3), EventBus::new(16));

        let segment_id = Uuid::new_v4();
        for i in 0..8 {
            writer.push(record(segment_id, i as f64));
        }
        assert_eq!(writer.pending(), 2);
        writer.shutdown().await;

        let rows = store.survey_data(segment_id);
        let chainages: Vec<f64> = rows.iter().map(|r| r.chainage_m).collect();
        assert_eq!(chainages, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        assert_eq!(store.batch_writes(), 3);
    }

    #[tokio::test]
    async fn test_segment_change_splits_batch() {
        let store = Arc::new(MemoryStore::new());
        let mut writer = IngestWriter::spawn(store.clone(), config(10), EventBus::new(16));

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        writer.push(record(a, 1.0));
        writer.push(record(a, 2.0));
        writer.push(record(b, 1.0));
        writer.shutdown().await;

        assert_eq!(store.survey_count(a), 2);
        assert_eq!(store.survey_count(b), 1);
        assert_eq!(store.batch_writes(), 2);
    }

    #[tokio::test]
    async fn test_failed_batch_retried_once_then_reported() {
        let mut sink = MockIngestionSink::new();
        sink.expect_save_batch()
            .times(2)
            .returning(|_, _| Err(RoadsenseError::Storage("disk full".to_string())));

        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let mut writer = IngestWriter::spawn(Arc::new(sink), config(2), events);

        let segment_id = Uuid::new_v4();
        writer.push(record(segment_id, 1.0));
        writer.push(record(segment_id, 2.0));
        writer.shutdown().await;

        match rx.recv().await.unwrap() {
            LinkEvent::Error { kind, message } => {
                assert_eq!(kind, ErrorKind::Persistence);
                assert!(message.contains("2 records"));
                assert!(message.contains("disk full"));
            }
            other => panic!("Expected persistence error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_transient_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();

        let mut sink = MockIngestionSink::new();
        sink.expect_save_batch().times(2).returning(move |_, _| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(RoadsenseError::Storage("busy".to_string()))
            } else {
                Ok(())
            }
        });

        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let mut writer = IngestWriter::spawn(Arc::new(sink), config(1), events);
        writer.push(record(Uuid::new_v4(), 1.0));
        writer.shutdown().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(rx.try_recv().is_none(), "no error event after a successful retry");
    }

    #[tokio::test]
    async fn test_pipeline_continues_after_dropped_batch() {
        let mut sink = MockIngestionSink::new();
        let mut seq = mockall::Sequence::new();
        sink.expect_save_batch()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(RoadsenseError::Storage("offline".to_string())));
        sink.expect_save_batch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, records| {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].chainage_m, 9.0);
                Ok(())
            });

        let mut writer = IngestWriter::spawn(Arc::new(sink), config(1), EventBus::new(16));

        let segment_id = Uuid::new_v4();
        writer.push(record(segment_id, 8.0));
        writer.push(record(segment_id, 9.0));
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_segment_ops_ordered_around_rows() {
        let store = Arc::new(MemoryStore::new());
        let mut writer = IngestWriter::spawn(store.clone(), config(10), EventBus::new(16));

        let project = Project::new("P").unwrap();
        let segment = RoadSegment::from_datum(project.id, "S", 100.0).unwrap();
        writer.create_segment(segment.clone());
        writer.push(record(segment.id, 5.0));

        let progressed = segment.apply(&SegmentUpdate::Progress {
            actual_length_m: 5.0,
        });
        writer.update_segment(progressed);
        writer.shutdown().await;

        assert_eq!(store.segment(segment.id).unwrap().actual_length_m, 5.0);
        assert_eq!(store.survey_count(segment.id), 1);
    }

    #[tokio::test]
    async fn test_stalled_store_coalesces_progress_and_bounds_rows() {
        let (sink, open) = GatedSink::new();
        let events = EventBus::new(64);
        let mut rx = events.subscribe();
        let mut writer = IngestWriter::spawn(
            sink.clone(),
            WriterConfig {
                batch_size: 2,
                max_pending_batches: 1,
            },
            events,
        );

        let project = Project::new("P").unwrap();
        let segment = RoadSegment::from_datum(project.id, "S", 100.0).unwrap();
        writer.create_segment(segment.clone());

        // The store is stuck on the create: one batch fits, the rest are dropped
        for i in 0..6 {
            writer.push(record(segment.id, i as f64));
        }
        for length in [10.0, 20.0, 30.0] {
            writer.record_progress(segment.apply(&SegmentUpdate::Progress {
                actual_length_m: length,
            }));
        }
        assert_eq!(writer.queued_batches(), 1);
        assert_eq!(writer.dropped_batches(), 2);

        writer.update_segment(segment.apply(&SegmentUpdate::Progress {
            actual_length_m: 35.0,
        }));

        open.send_replace(true);
        writer.shutdown().await;

        let stored: Vec<f64> = sink
            .store
            .survey_data(segment.id)
            .iter()
            .map(|r| r.chainage_m)
            .collect();
        assert_eq!(stored, vec![0.0, 1.0]);
        assert_eq!(sink.store.segment(segment.id).unwrap().actual_length_m, 35.0);
        // One coalesced progress write plus the final update
        assert_eq!(sink.updates.load(Ordering::SeqCst), 2);

        let mut backlog_errors = 0;
        while let Some(event) = rx.try_recv() {
            if let LinkEvent::Error { kind, message } = event {
                assert_eq!(kind, ErrorKind::Persistence);
                assert!(message.starts_with("storage backlog"));
                backlog_errors += 1;
            }
        }
        assert_eq!(backlog_errors, 2);
    }

    #[tokio::test]
    async fn test_empty_flush_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let mut writer = IngestWriter::spawn(store.clone(), config(5), EventBus::new(16));

        writer.flush();
        writer.shutdown().await;
        assert_eq!(store.batch_writes(), 0);
    }
}
