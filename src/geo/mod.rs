//! Spatial operations: H3-based provider indexing and distance ranking.

pub mod index;
pub mod ranker;

pub use index::GeoIndex;
pub use ranker::{RankedCandidate, Ranker};
