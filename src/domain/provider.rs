use h3o::{CellIndex, LatLng, Resolution};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LifelineError, Result};

/// Service capability a provider offers (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Ambulance,
    FireBrigade,
    Police,
    Rescue,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Ambulance => "ambulance",
            Capability::FireBrigade => "fire_brigade",
            Capability::Police => "police",
            Capability::Rescue => "rescue",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "ambulance" => Ok(Capability::Ambulance),
            "fire_brigade" => Ok(Capability::FireBrigade),
            "police" => Ok(Capability::Police),
            "rescue" => Ok(Capability::Rescue),
            other => Err(LifelineError::UnexpectedState(format!(
                "unknown capability: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Provider availability status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    Assigned,
    OffDuty,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::Available => "available",
            Availability::Assigned => "assigned",
            Availability::OffDuty => "off_duty",
        }
    }
}

impl std::fmt::Display for Availability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A geographic position in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// H3 cell containing this point at the given resolution
    pub fn cell(&self, resolution: Resolution) -> Result<CellIndex> {
        let latlng = LatLng::new(self.lat, self.lon)
            .map_err(|e| LifelineError::InvalidPosition(format!("({}, {}): {e}", self.lat, self.lon)))?;
        Ok(latlng.to_cell(resolution))
    }

    /// Haversine distance to another point, in kilometers
    pub fn haversine_km(&self, other: &GeoPoint) -> f64 {
        const EARTH_RADIUS_KM: f64 = 6371.0;

        let (lat1, lon1) = (self.lat.to_radians(), self.lon.to_radians());
        let (lat2, lon2) = (other.lat.to_radians(), other.lon.to_radians());
        let dlat = lat2 - lat1;
        let dlon = lon2 - lon1;
        let sin_dlat = (dlat * 0.5).sin();
        let sin_dlon = (dlon * 0.5).sin();
        let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
        let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
        EARTH_RADIUS_KM * c
    }
}

impl std::fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.4}, {:.4})", self.lat, self.lon)
    }
}

/// A provider as tracked by the geo index.
///
/// Invariant: `cell` is always the H3 cell of `position` at the index
/// resolution; both are updated together on every location change.
#[derive(Debug, Clone)]
pub struct ProviderRecord {
    pub provider_id: Uuid,
    pub capability: Capability,
    pub position: GeoPoint,
    pub cell: CellIndex,
    pub availability: Availability,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_round_trip() {
        for cap in [
            Capability::Ambulance,
            Capability::FireBrigade,
            Capability::Police,
            Capability::Rescue,
        ] {
            assert_eq!(Capability::parse(cap.as_str()).unwrap(), cap);
        }
        assert!(Capability::parse("helicopter").is_err());
    }

    #[test]
    fn test_haversine_known_distance() {
        // Kathmandu city center to a point ~1km north
        let a = GeoPoint::new(27.7172, 85.3240);
        let b = GeoPoint::new(27.7262, 85.3240);
        let d = a.haversine_km(&b);
        assert!(d > 0.9 && d < 1.1, "expected ~1km, got {d}");
    }

    #[test]
    fn test_haversine_zero() {
        let a = GeoPoint::new(27.7172, 85.3240);
        assert_eq!(a.haversine_km(&a), 0.0);
    }

    #[test]
    fn test_cell_is_deterministic() {
        let p = GeoPoint::new(27.7122, 85.3307);
        let c1 = p.cell(Resolution::Seven).unwrap();
        let c2 = p.cell(Resolution::Seven).unwrap();
        assert_eq!(c1, c2);
    }

    #[test]
    fn test_invalid_position_rejected() {
        let p = GeoPoint::new(f64::NAN, 85.0);
        assert!(p.cell(Resolution::Seven).is_err());
    }
}
