//! # Survey Data Model
//!
//! Projects own road segments, segments own survey rows. All three are
//! plain values: updates produce a new snapshot instead of mutating a shared
//! instance, and the storage layer decides how snapshots are persisted.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, RoadsenseError};
use crate::station::{parse_station, ZERO_STATION};

/// Identifier of a [`Project`]
pub type ProjectId = Uuid;

/// Identifier of a [`RoadSegment`]
pub type SegmentId = Uuid;

/// A survey project grouping road segments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub description: String,
    pub location: String,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

/// Field changes for [`Project::edit`]; `None` keeps the current value
#[derive(Debug, Clone, Default)]
pub struct ProjectEdit {
    pub name: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
}

impl Project {
    /// Create a project stamped with the current time
    ///
    /// # Errors
    ///
    /// Returns `Validation` if `name` is empty or whitespace.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = validate_name(name.into())?;
        let now = Utc::now();

        Ok(Self {
            id: Uuid::new_v4(),
            name,
            description: String::new(),
            location: String::new(),
            created_at: now,
            last_modified: now,
        })
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    /// Return an edited copy with a refreshed modification time
    ///
    /// `last_modified` never moves backwards, even if the wall clock does.
    pub fn edit(&self, edit: ProjectEdit) -> Result<Self> {
        let mut next = self.clone();

        if let Some(name) = edit.name {
            next.name = validate_name(name)?;
        }
        if let Some(description) = edit.description {
            next.description = description;
        }
        if let Some(location) = edit.location {
            next.location = location;
        }

        next.last_modified = Utc::now().max(self.last_modified);
        Ok(next)
    }
}

fn validate_name(name: String) -> Result<String> {
    if name.trim().is_empty() {
        return Err(RoadsenseError::Validation(
            "project name cannot be empty".to_string(),
        ));
    }
    Ok(name)
}

/// A bounded survey run along part of a road
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoadSegment {
    pub id: SegmentId,
    pub project_id: ProjectId,
    pub name: String,
    /// Length from the design drawings, in meters
    pub design_length_m: f64,
    /// Furthest chainage reached so far, in meters (never negative)
    pub actual_length_m: f64,
    pub start_sta: String,
    pub end_sta: String,
    pub start_time: DateTime<Utc>,
    /// `None` until the run is completed
    pub end_time: Option<DateTime<Utc>>,
    pub surveyor: String,
    pub weather: String,
    pub notes: String,
    pub is_completed: bool,
}

/// A change the ingestion pipeline applies to a segment snapshot
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentUpdate {
    /// New furthest chainage
    Progress { actual_length_m: f64 },
    /// Run finished at `end_sta`
    Complete {
        end_sta: String,
        end_time: DateTime<Utc>,
    },
}

impl RoadSegment {
    /// Create a segment starting now at `start_sta`
    ///
    /// # Errors
    ///
    /// - `InvalidStationFormat` if `start_sta` does not parse
    /// - `Validation` if `design_length_m` is negative or not finite
    pub fn new(
        project_id: ProjectId,
        name: impl Into<String>,
        design_length_m: f64,
        start_sta: impl Into<String>,
    ) -> Result<Self> {
        let start_sta = start_sta.into();
        parse_station(&start_sta)?;

        if !design_length_m.is_finite() || design_length_m < 0.0 {
            return Err(RoadsenseError::Validation(format!(
                "design length must be a non-negative number, got {}",
                design_length_m
            )));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            project_id,
            name: name.into(),
            design_length_m,
            actual_length_m: 0.0,
            end_sta: start_sta.clone(),
            start_sta,
            start_time: Utc::now(),
            end_time: None,
            surveyor: String::new(),
            weather: String::new(),
            notes: String::new(),
            is_completed: false,
        })
    }

    /// Segment at the project datum (`0+000`)
    pub fn from_datum(
        project_id: ProjectId,
        name: impl Into<String>,
        design_length_m: f64,
    ) -> Result<Self> {
        Self::new(project_id, name, design_length_m, ZERO_STATION)
    }

    #[must_use]
    pub fn with_surveyor(mut self, surveyor: impl Into<String>) -> Self {
        self.surveyor = surveyor.into();
        self
    }

    #[must_use]
    pub fn with_weather(mut self, weather: impl Into<String>) -> Self {
        self.weather = weather.into();
        self
    }

    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    /// Actual minus design length, in meters
    pub fn length_difference(&self) -> f64 {
        self.actual_length_m - self.design_length_m
    }

    /// Length difference as a percentage of the design length
    ///
    /// Returns 0.0 for segments without a design length.
    pub fn difference_percentage(&self) -> f64 {
        if self.design_length_m > 0.0 {
            self.length_difference() / self.design_length_m * 100.0
        } else {
            0.0
        }
    }

    /// Produce the snapshot that results from `update`
    pub fn apply(&self, update: &SegmentUpdate) -> Self {
        let mut next = self.clone();

        match update {
            SegmentUpdate::Progress { actual_length_m } => {
                next.actual_length_m = actual_length_m.max(0.0);
            }
            SegmentUpdate::Complete { end_sta, end_time } => {
                // end_time must be strictly after start_time
                let earliest = self.start_time + Duration::milliseconds(1);
                next.end_time = Some((*end_time).max(earliest));
                next.end_sta = end_sta.clone();
                next.is_completed = true;
            }
        }

        next
    }
}

/// One enriched telemetry sample stored against a segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyData {
    pub id: Uuid,
    pub segment_id: SegmentId,
    pub timestamp: DateTime<Utc>,
    pub sta: String,
    /// Meters from the segment start station
    pub chainage_m: f64,
    pub speed_kmh: f32,
    pub vibration_z: f32,
    /// 0.0 when the device had no fix
    pub latitude: f64,
    /// 0.0 when the device had no fix
    pub longitude: f64,
    /// Device packet sequence counter
    pub packet_count: u32,
}

impl SurveyData {
    /// Whether the device reported a GPS position for this sample
    pub fn has_fix(&self) -> bool {
        self.latitude != 0.0 || self.longitude != 0.0
    }
}
