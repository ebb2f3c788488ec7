//! Blocking index: partitions records into small comparison groups so the
//! engines never run all-pairs comparison over the full corpus.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::similarity::{coarse_cell, name_tokens};
use crate::{FacilityRecord, Location};

/// Comparison-group key. Geo cells are 0.1-degree squares; name-token keys
/// use the first normalized token.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKey {
    GeoCell {
        country: String,
        lat_cell: i32,
        lon_cell: i32,
    },
    NameToken {
        country: String,
        token: String,
    },
}

impl BlockKey {
    pub fn geo(country: &str, location: &Location) -> Self {
        BlockKey::GeoCell {
            country: country.to_ascii_uppercase(),
            lat_cell: coarse_cell(location.latitude),
            lon_cell: coarse_cell(location.longitude),
        }
    }

    /// First normalized name token, or `None` for names with no tokens.
    pub fn name_token(country: &str, name: &str) -> Option<Self> {
        let token = name_tokens(name).into_iter().next()?;
        Some(BlockKey::NameToken {
            country: country.to_ascii_uppercase(),
            token,
        })
    }

    /// Dedup key for a facility: geo cell when a location exists, else the
    /// first name token.
    pub fn for_facility(record: &FacilityRecord) -> Option<Self> {
        match &record.location {
            Some(location) => Some(Self::geo(&record.country_code, location)),
            None => Self::name_token(&record.country_code, &record.name),
        }
    }
}

/// Ordered multimap from block key to members. Lookup order is insertion
/// order within a block; block iteration order is key order, which keeps
/// batch planning deterministic across runs.
#[derive(Debug, Clone, Default)]
pub struct BlockingIndex<T> {
    blocks: BTreeMap<BlockKey, Vec<T>>,
}

impl<T> BlockingIndex<T> {
    pub fn new() -> Self {
        Self {
            blocks: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, key: BlockKey, item: T) {
        self.blocks.entry(key).or_default().push(item);
    }

    pub fn lookup(&self, key: &BlockKey) -> &[T] {
        self.blocks.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Members of a geo cell and its eight neighbors. A true match further
    /// than one coarse cell away is out of blocking reach; that bound is the
    /// documented false-negative limit of geo blocking.
    pub fn lookup_geo_neighborhood(
        &self,
        country: &str,
        lat_cell: i32,
        lon_cell: i32,
    ) -> Vec<&T> {
        let mut out = Vec::new();
        for dlat in -1..=1 {
            for dlon in -1..=1 {
                let key = BlockKey::GeoCell {
                    country: country.to_ascii_uppercase(),
                    lat_cell: lat_cell + dlat,
                    lon_cell: lon_cell + dlon,
                };
                out.extend(self.lookup(&key).iter());
            }
        }
        out
    }

    pub fn blocks(&self) -> impl Iterator<Item = (&BlockKey, &[T])> {
        self.blocks.iter().map(|(k, v)| (k, v.as_slice()))
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
