//! # Telemetry Aggregator
//!
//! Turns raw device samples into survey rows for the active segment.
//!
//! ## Distances
//!
//! The first accepted sample of a segment fixes the odometer origin. From
//! then on the position along the road is `odometer - origin`, offset by the
//! segment's start station:
//!
//! ```text
//! station  = format(parse(start_sta) + odometer - origin)
//! chainage = chainage(start_sta, station)
//! ```
//!
//! Backward travel lowers the chainage. The trip accumulator only grows on
//! forward odometer deltas and is independent of segments.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{RoadSegment, SegmentId, SegmentUpdate, SurveyData};
use crate::protocol::packet::{DecoderStats, RawTelemetry};
use crate::station::{chainage, format_station, parse_station};

/// Read-only view published after every update
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetrySnapshot {
    /// Records are being accepted
    pub logging: bool,
    /// Segment receiving records
    pub segment_id: Option<SegmentId>,
    pub speed_kmh: f32,
    /// Device odometer
    pub odometer_m: f64,
    /// Host-side trip accumulator
    pub trip_distance_m: f64,
    pub chainage_m: f64,
    pub station: String,
    pub vibration_z: f32,
    pub latitude: f64,
    pub longitude: f64,
    /// Rows produced for the current segment
    pub records_accepted: u64,
    /// Decoder counters, filled in by the link worker
    pub decoder: DecoderStats,
}

struct ActiveSegment {
    snapshot: RoadSegment,
    start_m: f64,
    origin_odometer: Option<f64>,
    last_station: Option<String>,
    max_chainage: f64,
    dirty: bool,
}

/// Stateful enrichment of decoded samples
pub struct TelemetryAggregator {
    segment: Option<ActiveSegment>,
    logging: bool,
    trip_distance_m: f64,
    last_odometer: Option<f64>,
    snapshot: TelemetrySnapshot,
}

impl Default for TelemetryAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryAggregator {
    pub fn new() -> Self {
        Self {
            segment: None,
            logging: false,
            trip_distance_m: 0.0,
            last_odometer: None,
            snapshot: TelemetrySnapshot::default(),
        }
    }

    /// Make `segment` the target for subsequent records
    ///
    /// Replaces any segment that was active without completing it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStationFormat` if the segment's start station does not
    /// parse; the previous segment stays active in that case.
    pub fn open_segment(&mut self, segment: RoadSegment) -> Result<()> {
        let start_m = parse_station(&segment.start_sta)?;

        if let Some(previous) = &self.segment {
            warn!(
                "Segment {} replaced before it was completed",
                previous.snapshot.id
            );
        }

        info!(
            "Opened segment {} ({}) at {}",
            segment.id, segment.name, segment.start_sta
        );

        self.snapshot.segment_id = Some(segment.id);
        self.snapshot.station = segment.start_sta.clone();
        self.snapshot.chainage_m = 0.0;
        self.snapshot.records_accepted = 0;

        self.segment = Some(ActiveSegment {
            max_chainage: segment.actual_length_m,
            snapshot: segment,
            start_m,
            origin_odometer: None,
            last_station: None,
            dirty: false,
        });
        Ok(())
    }

    /// Open or close the acceptance gate
    pub fn set_logging(&mut self, enabled: bool) {
        if enabled && !self.logging {
            // Distance covered while paused is not survey travel
            self.last_odometer = None;
        }
        self.logging = enabled;
        self.snapshot.logging = enabled;
    }

    pub fn is_logging(&self) -> bool {
        self.logging
    }

    /// Latest snapshot of the active segment
    pub fn active_segment(&self) -> Option<&RoadSegment> {
        self.segment.as_ref().map(|s| &s.snapshot)
    }

    /// Host-side trip accumulator in meters
    pub fn trip_distance_m(&self) -> f64 {
        self.trip_distance_m
    }

    pub fn snapshot(&self) -> &TelemetrySnapshot {
        &self.snapshot
    }

    /// Refresh live readings without ingesting the sample
    pub fn observe(&mut self, raw: &RawTelemetry) {
        self.snapshot.speed_kmh = raw.speed_kmh;
        self.snapshot.odometer_m = raw.odometer_m;
        self.snapshot.vibration_z = raw.vibration_z;
        self.snapshot.latitude = raw.latitude;
        self.snapshot.longitude = raw.longitude;
    }

    /// Ingest one sample
    ///
    /// Returns the survey row to persist, or `None` when logging is off or
    /// no segment is open (the sample is discarded, not buffered).
    pub fn on_record(&mut self, raw: &RawTelemetry, now: DateTime<Utc>) -> Option<SurveyData> {
        if !self.logging {
            return None;
        }
        let segment = self.segment.as_mut()?;

        if let Some(previous) = self.last_odometer {
            let delta = raw.odometer_m - previous;
            if delta > 0.0 {
                self.trip_distance_m += delta;
            }
        }
        self.last_odometer = Some(raw.odometer_m);

        let origin = *segment.origin_odometer.get_or_insert(raw.odometer_m);
        let station = format_station(segment.start_m + (raw.odometer_m - origin));
        let chainage_m = match chainage(&segment.snapshot.start_sta, &station) {
            Ok(value) => value,
            Err(e) => {
                warn!("Skipping sample {}: {}", raw.sequence, e);
                return None;
            }
        };

        if chainage_m < segment.max_chainage {
            debug!(
                "Chainage regressed to {} (furthest {})",
                chainage_m, segment.max_chainage
            );
        } else if chainage_m > segment.max_chainage {
            segment.max_chainage = chainage_m;
            segment.snapshot = segment.snapshot.apply(&SegmentUpdate::Progress {
                actual_length_m: chainage_m,
            });
            segment.dirty = true;
        }
        segment.last_station = Some(station.clone());

        let record = SurveyData {
            id: Uuid::new_v4(),
            segment_id: segment.snapshot.id,
            timestamp: now,
            sta: station.clone(),
            chainage_m,
            speed_kmh: raw.speed_kmh,
            vibration_z: raw.vibration_z,
            latitude: raw.latitude,
            longitude: raw.longitude,
            packet_count: raw.sequence,
        };

        self.observe(raw);
        self.snapshot.trip_distance_m = self.trip_distance_m;
        self.snapshot.chainage_m = chainage_m;
        self.snapshot.station = station;
        self.snapshot.records_accepted += 1;

        Some(record)
    }

    /// Zero the trip accumulator; chainage and stored rows are untouched
    pub fn reset_trip(&mut self) {
        info!("Trip reset at {:.1} m", self.trip_distance_m);
        self.trip_distance_m = 0.0;
        self.snapshot.trip_distance_m = 0.0;
    }

    /// Segment snapshot if its length changed since the last call
    pub fn take_progress(&mut self) -> Option<RoadSegment> {
        let segment = self.segment.as_mut()?;
        if !segment.dirty {
            return None;
        }
        segment.dirty = false;
        Some(segment.snapshot.clone())
    }

    /// Complete the active segment and stop accepting records for it
    ///
    /// Returns the completed snapshot, or `None` if no segment was open.
    pub fn end_segment(&mut self, now: DateTime<Utc>) -> Option<RoadSegment> {
        let segment = self.segment.take()?;
        let end_sta = segment
            .last_station
            .unwrap_or_else(|| segment.snapshot.start_sta.clone());

        let completed = segment.snapshot.apply(&SegmentUpdate::Complete {
            end_sta,
            end_time: now,
        });

        info!(
            "Completed segment {} at {} ({:.0} m surveyed, design {:.0} m)",
            completed.id, completed.end_sta, completed.actual_length_m, completed.design_length_m
        );

        self.snapshot.segment_id = None;
        Some(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(odometer_m: f64, sequence: u32) -> RawTelemetry {
        RawTelemetry {
            speed_kmh: 40.0,
            odometer_m,
            trip_distance_m: odometer_m,
            vibration_z: 0.05,
            latitude: 0.0,
            longitude: 0.0,
            sequence,
        }
    }

    fn segment_at(start_sta: &str) -> RoadSegment {
        RoadSegment::new(Uuid::new_v4(), "Test run", 200.0, start_sta).unwrap()
    }

    fn logging_aggregator(start_sta: &str) -> TelemetryAggregator {
        let mut agg = TelemetryAggregator::new();
        agg.open_segment(segment_at(start_sta)).unwrap();
        agg.set_logging(true);
        agg
    }

    #[test]
    fn test_no_segment_discards_records() {
        let mut agg = TelemetryAggregator::new();
        agg.set_logging(true);
        assert!(agg.on_record(&raw(10.0, 1), Utc::now()).is_none());
        assert_eq!(agg.trip_distance_m(), 0.0);
    }

    #[test]
    fn test_logging_off_discards_records() {
        let mut agg = TelemetryAggregator::new();
        agg.open_segment(segment_at("0+000")).unwrap();
        assert!(agg.on_record(&raw(10.0, 1), Utc::now()).is_none());
        assert_eq!(agg.snapshot().records_accepted, 0);
    }

    #[test]
    fn test_backward_step_scenario() {
        let mut agg = logging_aggregator("0+000");
        let mut chainages = Vec::new();

        for (seq, distance) in [0.0, 50.0, 120.0, 90.0, 200.0].into_iter().enumerate() {
            let row = agg.on_record(&raw(distance, seq as u32), Utc::now()).unwrap();
            chainages.push(row.chainage_m);

            if distance == 90.0 {
                assert_eq!(agg.trip_distance_m(), 120.0, "backward step must not reduce trip");
            }
        }

        assert_eq!(chainages, vec![0.0, 50.0, 120.0, 90.0, 200.0]);
        assert_eq!(agg.trip_distance_m(), 230.0);
        assert_eq!(agg.active_segment().unwrap().actual_length_m, 200.0);
    }

    #[test]
    fn test_odometer_origin_and_start_station() {
        let mut agg = logging_aggregator("1+250");

        let first = agg.on_record(&raw(48_000.0, 1), Utc::now()).unwrap();
        assert_eq!(first.sta, "1+250");
        assert_eq!(first.chainage_m, 0.0);

        let second = agg.on_record(&raw(48_075.6, 2), Utc::now()).unwrap();
        assert_eq!(second.sta, "1+325");
        assert_eq!(second.chainage_m, 75.0);
        assert_eq!(second.packet_count, 2);
    }

    #[test]
    fn test_negative_chainage_preserved() {
        let mut agg = logging_aggregator("0+500");
        agg.on_record(&raw(1000.0, 1), Utc::now()).unwrap();

        let back = agg.on_record(&raw(960.0, 2), Utc::now()).unwrap();
        assert_eq!(back.chainage_m, -40.0);
        assert_eq!(back.sta, "0+460");
        assert_eq!(agg.active_segment().unwrap().actual_length_m, 0.0);
    }

    #[test]
    fn test_actual_length_tracks_maximum() {
        let mut agg = logging_aggregator("0+000");
        for (seq, d) in [0.0, 80.0, 60.0].into_iter().enumerate() {
            agg.on_record(&raw(d, seq as u32), Utc::now());
        }
        assert_eq!(agg.active_segment().unwrap().actual_length_m, 80.0);
    }

    #[test]
    fn test_reset_trip_keeps_chainage() {
        let mut agg = logging_aggregator("0+000");
        agg.on_record(&raw(0.0, 1), Utc::now());
        agg.on_record(&raw(100.0, 2), Utc::now());

        agg.reset_trip();
        assert_eq!(agg.trip_distance_m(), 0.0);
        assert_eq!(agg.snapshot().chainage_m, 100.0);

        let row = agg.on_record(&raw(130.0, 3), Utc::now()).unwrap();
        assert_eq!(row.chainage_m, 130.0);
        assert_eq!(agg.trip_distance_m(), 30.0);
    }

    #[test]
    fn test_pause_excludes_distance_from_trip() {
        let mut agg = logging_aggregator("0+000");
        agg.on_record(&raw(0.0, 1), Utc::now());
        agg.on_record(&raw(40.0, 2), Utc::now());

        agg.set_logging(false);
        assert!(agg.on_record(&raw(90.0, 3), Utc::now()).is_none());
        agg.set_logging(true);

        let row = agg.on_record(&raw(100.0, 4), Utc::now()).unwrap();
        assert_eq!(row.chainage_m, 100.0);
        assert_eq!(agg.trip_distance_m(), 40.0);
    }

    #[test]
    fn test_end_segment_completes_snapshot() {
        let mut agg = logging_aggregator("0+000");
        agg.on_record(&raw(0.0, 1), Utc::now());
        agg.on_record(&raw(180.0, 2), Utc::now());

        let done = agg.end_segment(Utc::now()).unwrap();
        assert!(done.is_completed);
        assert_eq!(done.end_sta, "0+180");
        assert_eq!(done.actual_length_m, 180.0);
        assert!(done.end_time.unwrap() > done.start_time);

        assert!(agg.active_segment().is_none());
        assert!(agg.on_record(&raw(200.0, 3), Utc::now()).is_none());
        assert!(agg.end_segment(Utc::now()).is_none());
    }

    #[test]
    fn test_end_segment_without_records_uses_start_station() {
        let mut agg = logging_aggregator("2+100");
        let done = agg.end_segment(Utc::now()).unwrap();
        assert_eq!(done.end_sta, "2+100");
        assert_eq!(done.actual_length_m, 0.0);
    }

    #[test]
    fn test_take_progress_only_when_changed() {
        let mut agg = logging_aggregator("0+000");
        assert!(agg.take_progress().is_none());

        agg.on_record(&raw(0.0, 1), Utc::now());
        assert!(agg.take_progress().is_none());

        agg.on_record(&raw(25.0, 2), Utc::now());
        let progress = agg.take_progress().unwrap();
        assert_eq!(progress.actual_length_m, 25.0);
        assert!(agg.take_progress().is_none());
    }

    #[test]
    fn test_open_segment_rejects_bad_station() {
        let mut agg = logging_aggregator("0+000");
        let mut bad = segment_at("0+000");
        bad.start_sta = "north".to_string();

        assert!(agg.open_segment(bad).is_err());
        assert!(agg.active_segment().is_some());
    }

    #[test]
    fn test_observe_updates_live_readings_only() {
        let mut agg = TelemetryAggregator::new();
        let mut sample = raw(512.0, 1);
        sample.speed_kmh = 63.0;
        agg.observe(&sample);

        assert_eq!(agg.snapshot().speed_kmh, 63.0);
        assert_eq!(agg.snapshot().odometer_m, 512.0);
        assert_eq!(agg.snapshot().records_accepted, 0);
    }
}
