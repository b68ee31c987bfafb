//! H3-backed provider index.
//!
//! Maintains cell -> providers and provider -> record mappings so candidate
//! search is a grid-disk lookup instead of a scan over all providers. The
//! index is the owner of `ProviderRecord`s; every position change recomputes
//! the grid cell so the two can never disagree.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use h3o::{CellIndex, Resolution};
use uuid::Uuid;

use crate::domain::{Availability, Capability, GeoPoint, ProviderRecord};
use crate::error::{LifelineError, Result};

/// Average H3 hexagon edge length in kilometers, by resolution.
/// Source: the H3 resolution table.
fn approx_edge_km(resolution: Resolution) -> f64 {
    match u8::from(resolution) {
        0 => 1107.712591,
        1 => 418.676005,
        2 => 158.244655,
        3 => 59.810857,
        4 => 22.606379,
        5 => 8.544408,
        6 => 3.229482,
        7 => 1.220629,
        8 => 0.461354,
        9 => 0.174375,
        10 => 0.065907,
        11 => 0.024910,
        12 => 0.009415,
        13 => 0.003559,
        14 => 0.001348,
        15 => 0.000509,
        _ => unreachable!("H3 resolutions are 0-15"),
    }
}

#[derive(Debug, Default)]
struct IndexInner {
    providers: HashMap<Uuid, ProviderRecord>,
    by_cell: HashMap<CellIndex, HashSet<Uuid>>,
}

/// Shared provider location index.
///
/// Read concurrently by rankings, mutated by the location feed and by
/// assignment/release; a single `RwLock` keeps writes exclusive while
/// candidate reads proceed in parallel.
#[derive(Debug)]
pub struct GeoIndex {
    resolution: Resolution,
    inner: RwLock<IndexInner>,
}

impl GeoIndex {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            inner: RwLock::new(IndexInner::default()),
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn read_inner(&self) -> RwLockReadGuard<'_, IndexInner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, IndexInner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or update a provider, recomputing its grid cell in place
    pub fn upsert(
        &self,
        provider_id: Uuid,
        capability: Capability,
        position: GeoPoint,
        availability: Availability,
    ) -> Result<()> {
        let cell = position.cell(self.resolution)?;
        let mut inner = self.write_inner();

        if let Some(old) = inner.providers.get(&provider_id) {
            let old_cell = old.cell;
            if old_cell != cell {
                if let Some(ids) = inner.by_cell.get_mut(&old_cell) {
                    ids.remove(&provider_id);
                    if ids.is_empty() {
                        inner.by_cell.remove(&old_cell);
                    }
                }
            }
        }

        inner.by_cell.entry(cell).or_default().insert(provider_id);
        inner.providers.insert(
            provider_id,
            ProviderRecord {
                provider_id,
                capability,
                position,
                cell,
                availability,
            },
        );
        Ok(())
    }

    /// Remove a provider from the index entirely
    pub fn remove(&self, provider_id: Uuid) -> bool {
        let mut inner = self.write_inner();
        match inner.providers.remove(&provider_id) {
            Some(record) => {
                if let Some(ids) = inner.by_cell.get_mut(&record.cell) {
                    ids.remove(&provider_id);
                    if ids.is_empty() {
                        inner.by_cell.remove(&record.cell);
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Flip availability without touching position or cell
    pub fn set_availability(&self, provider_id: Uuid, availability: Availability) -> Result<()> {
        let mut inner = self.write_inner();
        match inner.providers.get_mut(&provider_id) {
            Some(record) => {
                record.availability = availability;
                Ok(())
            }
            None => Err(LifelineError::ProviderNotFound(provider_id)),
        }
    }

    /// Available providers with the required capability whose cell lies
    /// within `ring` grid steps of the center's cell
    pub fn candidates(
        &self,
        center: GeoPoint,
        capability: Capability,
        ring: u32,
    ) -> Result<Vec<Uuid>> {
        let center_cell = center.cell(self.resolution)?;
        let disk: Vec<CellIndex> = center_cell.grid_disk(ring);

        let inner = self.read_inner();
        let mut out = Vec::new();
        for cell in disk {
            if let Some(ids) = inner.by_cell.get(&cell) {
                for id in ids {
                    if let Some(record) = inner.providers.get(id) {
                        if record.availability == Availability::Available
                            && record.capability == capability
                        {
                            out.push(*id);
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    pub fn get(&self, provider_id: Uuid) -> Option<ProviderRecord> {
        self.read_inner().providers.get(&provider_id).cloned()
    }

    pub fn position_of(&self, provider_id: Uuid) -> Option<GeoPoint> {
        self.read_inner().providers.get(&provider_id).map(|r| r.position)
    }

    pub fn len(&self) -> usize {
        self.read_inner().providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Smallest grid-disk ring that covers the given radius
    pub fn ring_for_radius(&self, radius_km: f64) -> u32 {
        let edge = approx_edge_km(self.resolution);
        (radius_km / edge).ceil().max(1.0) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> GeoIndex {
        GeoIndex::new(Resolution::Seven)
    }

    const CENTER: GeoPoint = GeoPoint {
        lat: 27.7122,
        lon: 85.3307,
    };

    #[test]
    fn test_upsert_and_candidates() {
        let geo = index();
        let id = Uuid::new_v4();
        geo.upsert(id, Capability::Ambulance, CENTER, Availability::Available)
            .unwrap();

        let found = geo
            .candidates(CENTER, Capability::Ambulance, 1)
            .unwrap();
        assert_eq!(found, vec![id]);
    }

    #[test]
    fn test_candidates_filter_capability_and_availability() {
        let geo = index();
        let ambulance = Uuid::new_v4();
        let police = Uuid::new_v4();
        let busy = Uuid::new_v4();

        geo.upsert(ambulance, Capability::Ambulance, CENTER, Availability::Available)
            .unwrap();
        geo.upsert(police, Capability::Police, CENTER, Availability::Available)
            .unwrap();
        geo.upsert(busy, Capability::Ambulance, CENTER, Availability::Assigned)
            .unwrap();

        let found = geo.candidates(CENTER, Capability::Ambulance, 1).unwrap();
        assert_eq!(found, vec![ambulance]);
    }

    #[test]
    fn test_cell_follows_position() {
        let geo = index();
        let id = Uuid::new_v4();
        geo.upsert(id, Capability::Rescue, CENTER, Availability::Available)
            .unwrap();

        // Move far enough to land in a different cell (~20km east)
        let moved = GeoPoint::new(CENTER.lat, CENTER.lon + 0.2);
        geo.upsert(id, Capability::Rescue, moved, Availability::Available)
            .unwrap();

        let record = geo.get(id).unwrap();
        assert_eq!(record.cell, moved.cell(Resolution::Seven).unwrap());
        assert_eq!(geo.len(), 1);

        // The old cell no longer finds the provider
        let near_old = geo.candidates(CENTER, Capability::Rescue, 0).unwrap();
        assert!(near_old.is_empty());
    }

    #[test]
    fn test_far_provider_outside_small_ring() {
        let geo = index();
        let far = Uuid::new_v4();
        // ~50km away
        geo.upsert(
            far,
            Capability::Ambulance,
            GeoPoint::new(27.7122, 85.84),
            Availability::Available,
        )
        .unwrap();

        let found = geo.candidates(CENTER, Capability::Ambulance, 2).unwrap();
        assert!(found.is_empty());

        let found = geo.candidates(CENTER, Capability::Ambulance, 50).unwrap();
        assert_eq!(found, vec![far]);
    }

    #[test]
    fn test_set_availability() {
        let geo = index();
        let id = Uuid::new_v4();
        geo.upsert(id, Capability::Ambulance, CENTER, Availability::Available)
            .unwrap();

        geo.set_availability(id, Availability::Assigned).unwrap();
        assert!(geo.candidates(CENTER, Capability::Ambulance, 1).unwrap().is_empty());

        geo.set_availability(id, Availability::Available).unwrap();
        assert_eq!(
            geo.candidates(CENTER, Capability::Ambulance, 1).unwrap(),
            vec![id]
        );

        assert!(geo.set_availability(Uuid::new_v4(), Availability::OffDuty).is_err());
    }

    #[test]
    fn test_remove() {
        let geo = index();
        let id = Uuid::new_v4();
        geo.upsert(id, Capability::Ambulance, CENTER, Availability::Available)
            .unwrap();

        assert!(geo.remove(id));
        assert!(!geo.remove(id));
        assert!(geo.is_empty());
    }

    #[test]
    fn test_ring_for_radius() {
        let geo = index();
        // Resolution 7 edge is ~1.22km
        assert_eq!(geo.ring_for_radius(1.0), 1);
        assert_eq!(geo.ring_for_radius(2.0), 2);
        assert_eq!(geo.ring_for_radius(8.0), 7);
    }
}
