//! Core domain model and provenance types for LODE.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod blocking;
pub mod similarity;

pub const CRATE_NAME: &str = "lode-core";

/// How trustworthy a stored coordinate pair is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationPrecision {
    Exact,
    Approximate,
    CountryLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub precision: LocationPrecision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacilityStatus {
    Operating,
    Construction,
    CareAndMaintenance,
    Closed,
    Unknown,
}

impl FacilityStatus {
    pub fn is_known(&self) -> bool {
        !matches!(self, FacilityStatus::Unknown)
    }
}

/// One metal/mineral stream a facility handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commodity {
    pub metal: String,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub chemical_formula: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

impl Commodity {
    /// Normalized key used when merging commodity lists.
    pub fn metal_key(&self) -> String {
        similarity::normalize_name(&self.metal)
    }
}

/// Output product or processing stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub name: String,
    #[serde(default)]
    pub capacity: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    HumanVerified,
    LlmVerified,
    CsvImported,
    Unverified,
}

impl VerificationStatus {
    /// Survivorship bonus for how the record was verified.
    pub fn tier_bonus(&self) -> f64 {
        match self {
            VerificationStatus::HumanVerified => 20.0,
            VerificationStatus::LlmVerified => 10.0,
            VerificationStatus::CsvImported => 5.0,
            VerificationStatus::Unverified => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub status: VerificationStatus,
    pub confidence: f64,
    #[serde(default)]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: String,
}

impl Default for Verification {
    fn default() -> Self {
        Self {
            status: VerificationStatus::Unverified,
            confidence: 0.0,
            last_checked: None,
            notes: String::new(),
        }
    }
}

/// Provenance pointer for one ingested source of a facility record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub source_id: String,
    pub reference: String,
    #[serde(default)]
    pub snippet: String,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MentionRole {
    Operator,
    Owner,
    Unknown,
}

/// Raw extracted organization reference. Immutable evidence once created:
/// resolution never rewrites a mention in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyMention {
    pub raw_name: String,
    pub role_guess: MentionRole,
    pub source_reference: String,
    pub confidence: f64,
    #[serde(default)]
    pub evidence_text: String,
    pub first_seen: DateTime<Utc>,
    /// External registry identifier carried from source material, if any.
    #[serde(default)]
    pub registry_id: Option<String>,
}

/// One physical industrial site, as persisted (one JSON file per record).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilityRecord {
    /// Stable id, pattern `{country}-{slug}-{suffix}`. Immutable once assigned.
    pub facility_id: String,
    pub name: String,
    #[serde(default)]
    pub aliases: BTreeSet<String>,
    pub country_code: String,
    #[serde(default)]
    pub location: Option<Location>,
    pub facility_types: BTreeSet<String>,
    #[serde(default)]
    pub commodities: Vec<Commodity>,
    #[serde(default)]
    pub products: Vec<Product>,
    pub status: FacilityStatus,
    #[serde(default)]
    pub mentions: Vec<CompanyMention>,
    #[serde(default)]
    pub sources: Vec<SourceRef>,
    #[serde(default)]
    pub verification: Verification,
}

impl FacilityRecord {
    pub fn has_coordinates(&self) -> bool {
        self.location.is_some()
    }
}

/// Registry-backed company identity. Read-only to this system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalCompany {
    pub company_id: String,
    pub registered_name: String,
    pub country_code: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub registry_ids: Vec<String>,
    #[serde(default)]
    pub parent_name: Option<String>,
}

/// Quality tier assigned to a resolved mention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    AutoAccept,
    Review,
    Pending,
}

/// How the winning candidate was matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    ExactName,
    AliasMatch,
    FuzzyName,
}

/// One boost or penalty applied on top of the base confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateAdjustment {
    pub reason: String,
    pub delta: f64,
}

/// Natural key of a relationship row. Upserts never duplicate this key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationshipKey {
    pub facility_id: String,
    pub company_id: String,
    pub role: MentionRole,
}

/// Resolved, gated link between a facility and a canonical company.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub relationship_id: Uuid,
    pub facility_id: String,
    pub company_id: String,
    pub role: MentionRole,
    pub confidence: f64,
    pub base_confidence: f64,
    pub gate: Gate,
    pub match_method: MatchMethod,
    pub evidence: String,
    #[serde(default)]
    pub gates_applied: Vec<GateAdjustment>,
    pub created_at: DateTime<Utc>,
}

impl Relationship {
    pub fn natural_key(&self) -> RelationshipKey {
        RelationshipKey {
            facility_id: self.facility_id.clone(),
            company_id: self.company_id.clone(),
            role: self.role,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_known_excludes_unknown() {
        assert!(FacilityStatus::Operating.is_known());
        assert!(FacilityStatus::CareAndMaintenance.is_known());
        assert!(!FacilityStatus::Unknown.is_known());
    }

    #[test]
    fn verification_tier_bonuses_are_ordered() {
        assert!(
            VerificationStatus::HumanVerified.tier_bonus()
                > VerificationStatus::LlmVerified.tier_bonus()
        );
        assert!(
            VerificationStatus::LlmVerified.tier_bonus()
                > VerificationStatus::CsvImported.tier_bonus()
        );
        assert_eq!(VerificationStatus::Unverified.tier_bonus(), 0.0);
    }

    #[test]
    fn commodity_metal_key_normalizes() {
        let c = Commodity {
            metal: "  Platinum-Group Metals ".to_string(),
            primary: true,
            chemical_formula: None,
            category: None,
        };
        assert_eq!(c.metal_key(), "platinum group metals");
    }

    #[test]
    fn gate_serializes_snake_case() {
        let json = serde_json::to_string(&Gate::AutoAccept).unwrap();
        assert_eq!(json, "\"auto_accept\"");
    }
}
