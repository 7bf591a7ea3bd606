use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// Only used by clients to pick a map icon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum VehicleType {
    #[default]
    Motorbike,
    Bicycle,
    Car,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Courier {
    pub id: Uuid,
    pub name: String,
    pub phone: String,
    pub vehicle: VehicleType,
    pub created_at: DateTime<Utc>,
}

/// A single device fix submitted by the courier holding `order_id`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PositionSample {
    pub order_id: Uuid,
    pub courier_id: Uuid,
    pub point: GeoPoint,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PositionFix {
    pub lat: f64,
    pub lng: f64,
    pub recorded_at: DateTime<Utc>,
}

impl PositionFix {
    pub fn point(&self) -> GeoPoint {
        GeoPoint {
            lat: self.lat,
            lng: self.lng,
        }
    }
}

impl From<&PositionSample> for PositionFix {
    fn from(sample: &PositionSample) -> Self {
        Self {
            lat: sample.point.lat,
            lng: sample.point.lng,
            recorded_at: sample.recorded_at,
        }
    }
}
