//! Facility deduplication: priority-cascade matching, completeness
//! survivorship, and provenance-preserving merges.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::warn;

use lode_core::blocking::{BlockKey, BlockingIndex};
use lode_core::similarity::{
    coords_within, name_contains, name_similarity, normalize_name, token_overlap_ratio,
    COORD_TIER1_DEGREES, COORD_TIER2_DEGREES,
};
use lode_core::{Commodity, FacilityRecord};

const TIER1_TOKEN_OVERLAP: f64 = 0.6;
const TIER2_NAME_SIMILARITY: f64 = 0.85;
const FUZZY_NAME_SIMILARITY: f64 = 0.85;
const FUZZY_TOKEN_OVERLAP: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategyKind {
    CoordinateTier1,
    CoordinateTier2,
    ExactName,
    FuzzyName,
    AliasContainment,
}

/// One rule in the priority cascade. Rules are evaluated in strict order
/// with early exit; each is independently unit-testable.
pub trait MatchStrategy: Send + Sync {
    fn kind(&self) -> MatchStrategyKind;
    fn attempt(&self, a: &FacilityRecord, b: &FacilityRecord) -> bool;
}

/// Records whose coordinates disagree by more than the wide tier are
/// distinct sites no matter how similar their names read; name-based rules
/// stand down for such pairs. Missing coordinates never block.
fn coordinates_compatible(a: &FacilityRecord, b: &FacilityRecord) -> bool {
    match (&a.location, &b.location) {
        (Some(la), Some(lb)) => coords_within(la, lb, COORD_TIER2_DEGREES),
        _ => true,
    }
}

struct CoordinateTier1;

impl MatchStrategy for CoordinateTier1 {
    fn kind(&self) -> MatchStrategyKind {
        MatchStrategyKind::CoordinateTier1
    }

    fn attempt(&self, a: &FacilityRecord, b: &FacilityRecord) -> bool {
        let (Some(la), Some(lb)) = (&a.location, &b.location) else {
            return false;
        };
        coords_within(la, lb, COORD_TIER1_DEGREES)
            && (token_overlap_ratio(&a.name, &b.name) > TIER1_TOKEN_OVERLAP
                || name_contains(&a.name, &b.name))
    }
}

struct CoordinateTier2;

impl MatchStrategy for CoordinateTier2 {
    fn kind(&self) -> MatchStrategyKind {
        MatchStrategyKind::CoordinateTier2
    }

    fn attempt(&self, a: &FacilityRecord, b: &FacilityRecord) -> bool {
        let (Some(la), Some(lb)) = (&a.location, &b.location) else {
            return false;
        };
        // Wider radius, tighter name agreement.
        coords_within(la, lb, COORD_TIER2_DEGREES)
            && (name_similarity(&a.name, &b.name) > TIER2_NAME_SIMILARITY
                || name_contains(&a.name, &b.name))
    }
}

struct ExactName;

impl MatchStrategy for ExactName {
    fn kind(&self) -> MatchStrategyKind {
        MatchStrategyKind::ExactName
    }

    fn attempt(&self, a: &FacilityRecord, b: &FacilityRecord) -> bool {
        let na = normalize_name(&a.name);
        if na.is_empty() || na != normalize_name(&b.name) {
            return false;
        }
        coordinates_compatible(a, b)
    }
}

struct FuzzyName;

impl MatchStrategy for FuzzyName {
    fn kind(&self) -> MatchStrategyKind {
        MatchStrategyKind::FuzzyName
    }

    fn attempt(&self, a: &FacilityRecord, b: &FacilityRecord) -> bool {
        (name_similarity(&a.name, &b.name) > FUZZY_NAME_SIMILARITY
            || token_overlap_ratio(&a.name, &b.name) > FUZZY_TOKEN_OVERLAP)
            && coordinates_compatible(a, b)
    }
}

struct AliasContainment;

impl MatchStrategy for AliasContainment {
    fn kind(&self) -> MatchStrategyKind {
        MatchStrategyKind::AliasContainment
    }

    fn attempt(&self, a: &FacilityRecord, b: &FacilityRecord) -> bool {
        if !coordinates_compatible(a, b) {
            return false;
        }
        let known_names = |r: &FacilityRecord| -> Vec<String> {
            std::iter::once(r.name.as_str())
                .chain(r.aliases.iter().map(String::as_str))
                .map(normalize_name)
                .filter(|n| !n.is_empty())
                .collect()
        };
        let alias_set = |r: &FacilityRecord| -> Vec<String> {
            r.aliases
                .iter()
                .map(|s| normalize_name(s))
                .filter(|n| !n.is_empty())
                .collect()
        };

        let a_names = known_names(a);
        let b_names = known_names(b);
        let a_aliases = alias_set(a);
        let b_aliases = alias_set(b);
        a_names.iter().any(|n| b_aliases.contains(n))
            || b_names.iter().any(|n| a_aliases.contains(n))
    }
}

/// The cascade in priority order. Reordering or inserting a rule is a
/// one-line change here.
pub fn default_cascade() -> Vec<Box<dyn MatchStrategy>> {
    vec![
        Box::new(CoordinateTier1),
        Box::new(CoordinateTier2),
        Box::new(ExactName),
        Box::new(FuzzyName),
        Box::new(AliasContainment),
    ]
}

/// First strategy that fires wins; lower-priority rules are not consulted.
pub fn cascade_match(
    cascade: &[Box<dyn MatchStrategy>],
    a: &FacilityRecord,
    b: &FacilityRecord,
) -> Option<MatchStrategyKind> {
    cascade
        .iter()
        .find(|strategy| strategy.attempt(a, b))
        .map(|strategy| strategy.kind())
}

/// Additive heuristic for how much verified information a record carries.
/// Pure and total over the record snapshot.
pub fn completeness_score(record: &FacilityRecord) -> f64 {
    let mut score = 0.0;
    if record.location.is_some() {
        score += 10.0;
    }
    score += 2.0 * record.commodities.len() as f64;
    score += 3.0 * record.mentions.len() as f64;
    score += 2.0 * record.products.len() as f64;
    score += record.aliases.len() as f64;
    if record.status.is_known() {
        score += 5.0;
    }
    score += record.verification.confidence * 10.0;
    score += record.verification.status.tier_bonus();
    score
}

/// Highest completeness score wins; identical scores fall back to lexical
/// `facility_id` order. The bool reports whether the tie-break fired.
pub fn choose_survivor<'a>(members: &[&'a FacilityRecord]) -> (&'a FacilityRecord, bool) {
    assert!(!members.is_empty(), "duplicate group cannot be empty");
    let mut best = members[0];
    let mut best_score = completeness_score(best);
    let mut tied = false;
    for &candidate in &members[1..] {
        let score = completeness_score(candidate);
        if score > best_score {
            best = candidate;
            best_score = score;
            tied = false;
        } else if score == best_score {
            tied = true;
            if candidate.facility_id < best.facility_id {
                best = candidate;
            }
        }
    }
    (best, tied)
}

fn merge_commodity(existing: &mut Commodity, incoming: &Commodity) {
    let existing_bare = existing.chemical_formula.is_none() && existing.category.is_none();
    let incoming_carries =
        incoming.chemical_formula.is_some() || incoming.category.is_some();
    if existing_bare && incoming_carries {
        existing.metal = incoming.metal.clone();
        existing.chemical_formula = incoming.chemical_formula.clone();
        existing.category = incoming.category.clone();
    } else {
        if existing.chemical_formula.is_none() {
            existing.chemical_formula = incoming.chemical_formula.clone();
        }
        if existing.category.is_none() {
            existing.category = incoming.category.clone();
        }
    }
    existing.primary = existing.primary || incoming.primary;
}

/// Fold a loser into a survivor without losing information. Pure over the
/// two snapshots; the merge note is appended at group level.
pub fn merge_records(survivor: &FacilityRecord, loser: &FacilityRecord) -> FacilityRecord {
    let mut merged = survivor.clone();

    merged.aliases.extend(loser.aliases.iter().cloned());
    merged.aliases.insert(loser.name.clone());
    merged.aliases.remove(&merged.name);

    for source in &loser.sources {
        if !merged.sources.contains(source) {
            merged.sources.push(source.clone());
        }
    }

    for commodity in &loser.commodities {
        let key = commodity.metal_key();
        match merged.commodities.iter_mut().find(|c| c.metal_key() == key) {
            Some(existing) => merge_commodity(existing, commodity),
            None => merged.commodities.push(commodity.clone()),
        }
    }

    for mention in &loser.mentions {
        let key = normalize_name(&mention.raw_name);
        match merged
            .mentions
            .iter_mut()
            .find(|m| normalize_name(&m.raw_name) == key)
        {
            Some(existing) => {
                if mention.confidence > existing.confidence {
                    *existing = mention.clone();
                }
            }
            None => merged.mentions.push(mention.clone()),
        }
    }

    for product in &loser.products {
        let key = normalize_name(&product.name);
        if !merged
            .products
            .iter()
            .any(|p| normalize_name(&p.name) == key)
        {
            merged.products.push(product.clone());
        }
    }

    merged
        .facility_types
        .extend(loser.facility_types.iter().cloned());

    if merged.location.is_none() {
        merged.location = loser.location;
    }
    if !merged.status.is_known() && loser.status.is_known() {
        merged.status = loser.status;
    }

    merged
}

#[derive(Debug, Clone, Serialize)]
pub struct MergedGroup {
    pub survivor: FacilityRecord,
    pub loser_ids: Vec<String>,
    pub tie_break: bool,
}

/// Merge a whole duplicate group: pick the survivor, fold in the losers in
/// lexical id order, then append one merge note naming everything merged.
pub fn merge_group(members: &[&FacilityRecord]) -> MergedGroup {
    let (survivor, tie_break) = choose_survivor(members);
    let mut losers: Vec<&FacilityRecord> = members
        .iter()
        .filter(|m| m.facility_id != survivor.facility_id)
        .copied()
        .collect();
    losers.sort_by(|a, b| a.facility_id.cmp(&b.facility_id));

    let mut merged = survivor.clone();
    for loser in &losers {
        merged = merge_records(&merged, loser);
    }

    let loser_ids: Vec<String> = losers.iter().map(|l| l.facility_id.clone()).collect();
    if !loser_ids.is_empty() {
        let note = format!("merged duplicates: {}", loser_ids.join(", "));
        if merged.verification.notes.is_empty() {
            merged.verification.notes = note;
        } else {
            merged.verification.notes.push('\n');
            merged.verification.notes.push_str(&note);
        }
    }

    MergedGroup {
        survivor: merged,
        loser_ids,
        tie_break,
    }
}

/// Planned duplicate cluster, computed against a stable snapshot before
/// any merge applies.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    pub member_ids: Vec<String>,
    pub survivor_id: String,
    pub strategy: MatchStrategyKind,
    pub scores: BTreeMap<String, f64>,
    pub tie_break: bool,
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, i: usize) -> usize {
        if self.parent[i] != i {
            let root = self.find(self.parent[i]);
            self.parent[i] = root;
        }
        self.parent[i]
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }
}

/// First-token block keys for a record's name and every alias.
fn name_token_keys(record: &FacilityRecord) -> Vec<BlockKey> {
    let mut keys = Vec::new();
    let names = std::iter::once(record.name.as_str()).chain(record.aliases.iter().map(String::as_str));
    for name in names {
        if let Some(key) = BlockKey::name_token(&record.country_code, name) {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    keys
}

/// Build all duplicate groups for a snapshot. Records are blocked by geo
/// cell (when located) and by first name/alias token, and only in-block or
/// neighboring-cell pairs are compared; transitive matches accumulate into
/// one group.
pub fn plan_groups(
    records: &[FacilityRecord],
    cascade: &[Box<dyn MatchStrategy>],
) -> Vec<DuplicateGroup> {
    let mut index: BlockingIndex<usize> = BlockingIndex::new();
    for (i, record) in records.iter().enumerate() {
        if let Some(location) = &record.location {
            index.insert(BlockKey::geo(&record.country_code, location), i);
        }
        // Token keys regardless of coordinates, so located and unlocated
        // variants of the same site still meet in one block. Aliases
        // contribute keys too; an alias-only duplicate can carry a name
        // whose first token never appears in the other record's name.
        for key in name_token_keys(record) {
            index.insert(key, i);
        }
    }

    let mut dsu = UnionFind::new(records.len());
    let mut pair_strategies: Vec<(usize, usize, MatchStrategyKind)> = Vec::new();

    for (i, record) in records.iter().enumerate() {
        let mut candidates: Vec<usize> = Vec::new();
        for key in name_token_keys(record) {
            candidates.extend(index.lookup(&key).iter().copied());
        }
        if let Some(location) = &record.location {
            if let BlockKey::GeoCell {
                country,
                lat_cell,
                lon_cell,
            } = BlockKey::geo(&record.country_code, location)
            {
                candidates.extend(
                    index
                        .lookup_geo_neighborhood(&country, lat_cell, lon_cell)
                        .into_iter()
                        .copied(),
                );
            }
        }
        candidates.sort_unstable();
        candidates.dedup();

        for j in candidates {
            if j <= i {
                continue;
            }
            if let Some(kind) = cascade_match(cascade, record, &records[j]) {
                dsu.union(i, j);
                pair_strategies.push((i, j, kind));
            }
        }
    }

    let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..records.len() {
        clusters.entry(dsu.find(i)).or_default().push(i);
    }

    let mut groups = Vec::new();
    for (_, member_indexes) in clusters {
        if member_indexes.len() < 2 {
            continue;
        }
        let members: Vec<&FacilityRecord> =
            member_indexes.iter().map(|&i| &records[i]).collect();
        let (survivor, tie_break) = choose_survivor(&members);
        if tie_break {
            warn!(
                survivor = %survivor.facility_id,
                "completeness tie in duplicate group; falling back to lexical id order"
            );
        }

        let strategy = pair_strategies
            .iter()
            .find(|(a, b, _)| {
                member_indexes.binary_search(a).is_ok() && member_indexes.binary_search(b).is_ok()
            })
            .map(|(_, _, kind)| *kind)
            .unwrap_or(MatchStrategyKind::ExactName);

        let mut member_ids: Vec<String> = members
            .iter()
            .map(|m| m.facility_id.clone())
            .collect();
        member_ids.sort();
        let scores: BTreeMap<String, f64> = members
            .iter()
            .map(|m| (m.facility_id.clone(), completeness_score(m)))
            .collect();

        groups.push(DuplicateGroup {
            member_ids,
            survivor_id: survivor.facility_id.clone(),
            strategy,
            scores,
            tie_break,
        });
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use lode_core::{
        CompanyMention, FacilityStatus, Location, LocationPrecision, MentionRole, Product,
        SourceRef, Verification, VerificationStatus,
    };
    use std::collections::BTreeSet;

    fn base_record(facility_id: &str, name: &str) -> FacilityRecord {
        FacilityRecord {
            facility_id: facility_id.to_string(),
            name: name.to_string(),
            aliases: BTreeSet::new(),
            country_code: "ZA".to_string(),
            location: None,
            facility_types: BTreeSet::from(["mine".to_string()]),
            commodities: Vec::new(),
            products: Vec::new(),
            status: FacilityStatus::Unknown,
            mentions: Vec::new(),
            sources: Vec::new(),
            verification: Verification::default(),
        }
    }

    fn located(facility_id: &str, name: &str, lat: f64, lon: f64) -> FacilityRecord {
        let mut record = base_record(facility_id, name);
        record.location = Some(Location {
            latitude: lat,
            longitude: lon,
            precision: LocationPrecision::Exact,
        });
        record
    }

    fn mention(raw_name: &str, confidence: f64, source: &str) -> CompanyMention {
        CompanyMention {
            raw_name: raw_name.to_string(),
            role_guess: MentionRole::Operator,
            source_reference: source.to_string(),
            confidence,
            evidence_text: String::new(),
            first_seen: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap(),
            registry_id: None,
        }
    }

    #[test]
    fn tier1_fires_on_close_coords_with_containment() {
        let a = located("za-two-rivers-001", "Two Rivers Platinum Mine", -24.893, 30.124);
        let b = located("za-two-rivers-002", "Two Rivers", -24.8935, 30.1242);
        let cascade = default_cascade();
        assert_eq!(
            cascade_match(&cascade, &a, &b),
            Some(MatchStrategyKind::CoordinateTier1)
        );
    }

    #[test]
    fn tier2_requires_tighter_names_at_wider_radius() {
        let a = located("za-moga-001", "Mogalakwena Platinum Mine", -23.98, 28.92);
        let b = located("za-moga-002", "Mogalakwena Platinum Mine North", -24.03, 28.95);
        let cascade = default_cascade();
        assert_eq!(
            cascade_match(&cascade, &a, &b),
            Some(MatchStrategyKind::CoordinateTier2)
        );

        // Same distance, unrelated names: nothing fires.
        let c = located("za-karee-001", "Karee Shaft", -24.03, 28.95);
        assert_eq!(cascade_match(&cascade, &a, &c), None);
    }

    #[test]
    fn far_apart_pairs_never_merge_by_coordinates_or_name() {
        let a = located("za-a-001", "Drieflot Mine", -24.0, 29.0);
        let b = located("za-a-002", "Drieflot Mine", -25.5, 29.0);
        let cascade = default_cascade();
        // Identical names, coordinates 1.5 degrees apart: distinct sites.
        assert_eq!(cascade_match(&cascade, &a, &b), None);
    }

    #[test]
    fn exact_name_matches_without_coordinates() {
        let a = base_record("za-a-001", "Karee Shaft");
        let b = base_record("za-a-002", "KAREE SHAFT");
        let cascade = default_cascade();
        assert_eq!(
            cascade_match(&cascade, &a, &b),
            Some(MatchStrategyKind::ExactName)
        );
    }

    #[test]
    fn exact_name_matches_when_only_one_side_has_coordinates() {
        let a = located("za-a-001", "Karee Shaft", -25.0, 27.0);
        let b = base_record("za-a-002", "Karee Shaft");
        let cascade = default_cascade();
        assert_eq!(
            cascade_match(&cascade, &a, &b),
            Some(MatchStrategyKind::ExactName)
        );
    }

    #[test]
    fn fuzzy_name_fires_below_exact() {
        let a = base_record("za-a-001", "Mogalakwena Platinum Mine");
        let b = base_record("za-a-002", "Mogalakwena Platinum Mines");
        let cascade = default_cascade();
        assert_eq!(
            cascade_match(&cascade, &a, &b),
            Some(MatchStrategyKind::FuzzyName)
        );
    }

    #[test]
    fn alias_containment_is_the_last_resort() {
        let mut a = base_record("za-a-001", "Marikana Operations");
        a.aliases.insert("Western Platinum".to_string());
        let b = base_record("za-a-002", "Western Platinum");
        let cascade = default_cascade();
        assert_eq!(
            cascade_match(&cascade, &b, &a),
            Some(MatchStrategyKind::AliasContainment)
        );
    }

    #[test]
    fn cascade_stops_at_the_first_matching_rule() {
        // Close coordinates and identical names: tier 1 wins over exact.
        let a = located("za-a-001", "Karee Shaft", -25.0, 27.0);
        let b = located("za-a-002", "Karee Shaft", -25.001, 27.001);
        let cascade = default_cascade();
        assert_eq!(
            cascade_match(&cascade, &a, &b),
            Some(MatchStrategyKind::CoordinateTier1)
        );
    }

    #[test]
    fn completeness_score_adds_up() {
        let mut record = located("za-a-001", "Two Rivers", -24.893, 30.124);
        record.status = FacilityStatus::Operating;
        record.aliases.insert("TRP".to_string());
        record.commodities.push(Commodity {
            metal: "Platinum".to_string(),
            primary: true,
            chemical_formula: None,
            category: None,
        });
        record.mentions.push(mention("Implats", 0.8, "ref-1"));
        record.products.push(Product {
            name: "PGM concentrate".to_string(),
            capacity: None,
            unit: None,
        });
        record.verification = Verification {
            status: VerificationStatus::LlmVerified,
            confidence: 0.5,
            last_checked: None,
            notes: String::new(),
        };
        // 10 coords + 2 commodity + 3 mention + 2 product + 1 alias
        // + 5 status + 5 confidence + 10 tier
        assert!((completeness_score(&record) - 38.0).abs() < 1e-9);
    }

    #[test]
    fn tie_break_prefers_lexical_id_and_reports_it() {
        let a = base_record("za-b-002", "Karee Shaft");
        let b = base_record("za-a-001", "Karee Shaft");
        let (survivor, tied) = choose_survivor(&[&a, &b]);
        assert!(tied);
        assert_eq!(survivor.facility_id, "za-a-001");
    }

    #[test]
    fn two_rivers_scenario_merges_into_the_richer_record() {
        let mut full = located("za-two-rivers-001", "Two Rivers Platinum Mine", -24.893, 30.124);
        full.status = FacilityStatus::Operating;
        full.verification = Verification {
            status: VerificationStatus::LlmVerified,
            confidence: 0.8,
            last_checked: None,
            notes: String::new(),
        };
        full.commodities.push(Commodity {
            metal: "Platinum".to_string(),
            primary: true,
            chemical_formula: Some("Pt".to_string()),
            category: Some("pgm".to_string()),
        });
        full.mentions.push(mention("African Rainbow Minerals", 0.7, "ref-1"));

        let mut sparse = located("za-two-rivers-002", "Two Rivers", -24.893, 30.124);
        sparse.status = FacilityStatus::Operating;
        sparse.verification = Verification {
            status: VerificationStatus::CsvImported,
            confidence: 0.9,
            last_checked: None,
            notes: String::new(),
        };
        sparse.commodities.push(Commodity {
            metal: "platinum".to_string(),
            primary: false,
            chemical_formula: None,
            category: None,
        });

        assert!(completeness_score(&full) > completeness_score(&sparse));

        let merged = merge_group(&[&full, &sparse]);
        assert_eq!(merged.survivor.facility_id, "za-two-rivers-001");
        assert!(merged.survivor.aliases.contains("Two Rivers"));
        assert_eq!(merged.loser_ids, vec!["za-two-rivers-002".to_string()]);
        assert!(merged
            .survivor
            .verification
            .notes
            .contains("merged duplicates: za-two-rivers-002"));
        // One commodity entry, still carrying the formula.
        assert_eq!(merged.survivor.commodities.len(), 1);
        assert_eq!(
            merged.survivor.commodities[0].chemical_formula.as_deref(),
            Some("Pt")
        );
    }

    #[test]
    fn commodity_merge_prefers_the_variant_with_formula() {
        let mut bare = base_record("za-a-001", "Nickel Works");
        bare.commodities.push(Commodity {
            metal: "Nickel".to_string(),
            primary: true,
            chemical_formula: None,
            category: None,
        });
        let mut carrying = base_record("za-a-002", "Nickel Works");
        carrying.commodities.push(Commodity {
            metal: "nickel".to_string(),
            primary: false,
            chemical_formula: Some("Ni".to_string()),
            category: Some("base-metal".to_string()),
        });

        let merged = merge_records(&bare, &carrying);
        assert_eq!(merged.commodities.len(), 1);
        assert_eq!(merged.commodities[0].chemical_formula.as_deref(), Some("Ni"));
        assert_eq!(merged.commodities[0].category.as_deref(), Some("base-metal"));
        assert!(merged.commodities[0].primary);
    }

    #[test]
    fn mention_merge_keeps_highest_confidence_per_company() {
        let mut a = base_record("za-a-001", "Karee Shaft");
        a.mentions.push(mention("Implats", 0.6, "ref-1"));
        let mut b = base_record("za-a-002", "Karee Shaft");
        b.mentions.push(mention("IMPLATS", 0.9, "ref-2"));
        b.mentions.push(mention("Sibanye", 0.5, "ref-3"));

        let merged = merge_records(&a, &b);
        assert_eq!(merged.mentions.len(), 2);
        let implats = merged
            .mentions
            .iter()
            .find(|m| normalize_name(&m.raw_name) == "implats")
            .unwrap();
        assert!((implats.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn merge_is_associative_up_to_notes() {
        let mut a = located("za-a-001", "Drie Kop Mine", -25.0, 27.0);
        a.sources.push(SourceRef {
            source_id: "csv-1".to_string(),
            reference: "row 4".to_string(),
            snippet: String::new(),
            ingested_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap(),
        });
        a.verification.confidence = 0.9;
        let mut b = base_record("za-a-002", "Drie Kop");
        b.aliases.insert("Driekop".to_string());
        let mut c = base_record("za-a-003", "Drie Kop Mine");
        c.mentions.push(mention("Sibanye", 0.5, "ref-3"));

        let all_at_once = merge_group(&[&a, &b, &c]).survivor;
        let ab = merge_group(&[&a, &b]).survivor;
        let stepwise = merge_group(&[&ab, &c]).survivor;

        assert_eq!(all_at_once.facility_id, stepwise.facility_id);
        assert_eq!(all_at_once.aliases, stepwise.aliases);
        assert_eq!(all_at_once.commodities, stepwise.commodities);
        assert_eq!(all_at_once.mentions, stepwise.mentions);
        assert_eq!(all_at_once.sources, stepwise.sources);
        assert_eq!(all_at_once.products, stepwise.products);
    }

    #[test]
    fn merge_is_idempotent() {
        let mut a = located("za-a-001", "Drie Kop Mine", -25.0, 27.0);
        a.aliases.insert("Driekop".to_string());
        let b = base_record("za-a-002", "Drie Kop");

        let once = merge_records(&a, &b);
        let twice = merge_records(&once, &b);
        assert_eq!(once, twice);
    }

    #[test]
    fn planner_clusters_transitively_and_reports_scores() {
        let a = located("za-a-001", "Two Rivers Platinum Mine", -24.893, 30.124);
        let b = located("za-a-002", "Two Rivers", -24.8932, 30.1241);
        let c = base_record("za-a-003", "Two Rivers");
        let unrelated = located("za-z-009", "Karee Shaft", -25.7, 27.3);

        let records = vec![a, b, c, unrelated];
        let groups = plan_groups(&records, &default_cascade());
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(
            group.member_ids,
            vec![
                "za-a-001".to_string(),
                "za-a-002".to_string(),
                "za-a-003".to_string()
            ]
        );
        assert_eq!(group.survivor_id, "za-a-001");
        assert_eq!(group.scores.len(), 3);
    }

    #[test]
    fn planner_reaches_alias_only_matches_across_name_tokens() {
        let mut a = base_record("za-marikana-001", "Marikana Operations");
        a.aliases.insert("Western Platinum".to_string());
        let b = base_record("za-western-001", "Western Platinum");

        // First name tokens differ, so only the alias token blocks these
        // two records together.
        let records = vec![a, b];
        let groups = plan_groups(&records, &default_cascade());
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].strategy, MatchStrategyKind::AliasContainment);
        assert_eq!(
            groups[0].member_ids,
            vec!["za-marikana-001".to_string(), "za-western-001".to_string()]
        );
    }

    #[test]
    fn planner_is_a_fixed_point_after_merging() {
        let a = located("za-a-001", "Two Rivers Platinum Mine", -24.893, 30.124);
        let b = located("za-a-002", "Two Rivers", -24.8932, 30.1241);
        let records = vec![a, b];
        let cascade = default_cascade();
        let groups = plan_groups(&records, &cascade);
        assert_eq!(groups.len(), 1);

        let merged = merge_group(&[&records[0], &records[1]]).survivor;
        let after = plan_groups(&[merged], &cascade);
        assert!(after.is_empty());
    }
}
