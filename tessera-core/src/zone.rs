//! Zone maps
//!
//! Zones (tags) are labels attached to key ranges that constrain which
//! shards may own chunks in those ranges. A chunk belongs to a zone iff its
//! range is fully contained in one of the zone's tag ranges; chunks outside
//! every tag range are untagged.

use crate::chunk::ChunkRange;
use serde::{Deserialize, Serialize};

/// Mapping from key ranges to zone tags, derived from the catalog tag table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZoneMap {
    // Tag ranges sorted by range min; assumed non-overlapping as enforced by
    // the catalog.
    ranges: Vec<(ChunkRange, String)>,
}

impl ZoneMap {
    pub fn new(mut ranges: Vec<(ChunkRange, String)>) -> Self {
        ranges.sort_by(|a, b| ChunkRange::min(&a.0).cmp(ChunkRange::min(&b.0)));
        Self { ranges }
    }

    /// The zone owning `range`, or `None` when the range is untagged.
    pub fn zone_for(&self, range: &ChunkRange) -> Option<&str> {
        self.ranges
            .iter()
            .find(|(tag_range, _)| tag_range.contains_range(range))
            .map(|(_, tag)| tag.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
