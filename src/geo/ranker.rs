use std::cmp::Ordering;
use std::sync::Arc;

use uuid::Uuid;

use super::GeoIndex;
use crate::domain::GeoPoint;

/// One ranked candidate: provider and its true distance from the center
#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    pub provider_id: Uuid,
    pub distance_km: f64,
}

/// Orders coarse candidates by precise distance.
///
/// Distances are haversine against each candidate's authoritative stored
/// position, never the grid-cell approximation. Ties break on provider id
/// so the result is reproducible for a fixed candidate set.
#[derive(Debug, Clone)]
pub struct Ranker {
    geo: Arc<GeoIndex>,
}

impl Ranker {
    pub fn new(geo: Arc<GeoIndex>) -> Self {
        Self { geo }
    }

    /// Nearest-first ranking of `candidate_ids`, at most `limit` entries.
    ///
    /// Candidates that have vanished from the index since the coarse query
    /// are skipped. An empty result is not an error; it signals the
    /// coordinator to escalate.
    pub fn rank(&self, center: GeoPoint, candidate_ids: &[Uuid], limit: usize) -> Vec<RankedCandidate> {
        let mut ranked: Vec<RankedCandidate> = candidate_ids
            .iter()
            .filter_map(|id| {
                self.geo.position_of(*id).map(|pos| RankedCandidate {
                    provider_id: *id,
                    distance_km: center.haversine_km(&pos),
                })
            })
            .collect();

        ranked.sort_by(|a, b| {
            a.distance_km
                .partial_cmp(&b.distance_km)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.provider_id.cmp(&b.provider_id))
        });
        ranked.truncate(limit);
        ranked
    }
}
