//! Company mention resolution: candidate scoring, boost/penalty gates, and
//! named threshold profiles.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use lode_core::similarity::{generic_single_token, name_similarity, normalize_name};
use lode_core::{
    CanonicalCompany, CompanyMention, FacilityRecord, Gate, GateAdjustment, MatchMethod,
    MentionRole, Relationship,
};

/// Thresholds and boost/penalty magnitudes for one resolution posture.
/// Penalty fields hold positive magnitudes; they are subtracted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionProfile {
    pub name: String,
    pub auto_accept_threshold: f64,
    pub review_min_threshold: f64,
    pub prefer_registry_boost: f64,
    pub dual_source_boost: f64,
    pub parent_match_boost: f64,
    pub country_mismatch_penalty: f64,
    pub missing_registry_id_penalty: f64,
    pub name_length_penalty: f64,
    pub generic_name_penalty: f64,
    pub max_name_length_gap: usize,
}

impl ResolutionProfile {
    pub fn moderate() -> Self {
        Self {
            name: "moderate".to_string(),
            auto_accept_threshold: 0.90,
            review_min_threshold: 0.75,
            prefer_registry_boost: 0.05,
            dual_source_boost: 0.03,
            parent_match_boost: 0.02,
            country_mismatch_penalty: 0.15,
            missing_registry_id_penalty: 0.10,
            name_length_penalty: 0.10,
            generic_name_penalty: 0.15,
            max_name_length_gap: 16,
        }
    }

    pub fn strict() -> Self {
        Self {
            name: "strict".to_string(),
            auto_accept_threshold: 0.95,
            review_min_threshold: 0.85,
            country_mismatch_penalty: 0.20,
            missing_registry_id_penalty: 0.15,
            name_length_penalty: 0.15,
            generic_name_penalty: 0.20,
            max_name_length_gap: 12,
            ..Self::moderate()
        }
    }

    pub fn permissive() -> Self {
        Self {
            name: "permissive".to_string(),
            auto_accept_threshold: 0.85,
            review_min_threshold: 0.65,
            country_mismatch_penalty: 0.10,
            missing_registry_id_penalty: 0.05,
            name_length_penalty: 0.05,
            generic_name_penalty: 0.10,
            max_name_length_gap: 24,
            ..Self::moderate()
        }
    }

    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            "strict" => Some(Self::strict()),
            "moderate" => Some(Self::moderate()),
            "permissive" => Some(Self::permissive()),
            _ => None,
        }
    }

    /// Resolve a profile by name: a `profiles.yaml` entry wins over the
    /// built-in set, so operators can retune without code changes.
    pub fn load_named(name: &str, profiles_path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = profiles_path {
            let file = ProfilesFile::load(path)?;
            if let Some(profile) = file.profiles.into_iter().find(|p| p.name == name) {
                return Ok(profile);
            }
        }
        Self::builtin(name)
            .ok_or_else(|| anyhow::anyhow!("unknown resolution profile `{name}`"))
    }

    /// Per-invocation floor override: raises the review threshold, never
    /// lowers it.
    pub fn with_min_confidence(mut self, min_confidence: Option<f64>) -> Self {
        if let Some(floor) = min_confidence {
            self.review_min_threshold = self.review_min_threshold.max(floor);
        }
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: Vec<ResolutionProfile>,
}

impl ProfilesFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Pure, deterministic gate assignment.
pub fn gate_for(profile: &ResolutionProfile, confidence: f64) -> Gate {
    if confidence >= profile.auto_accept_threshold {
        Gate::AutoAccept
    } else if confidence >= profile.review_min_threshold {
        Gate::Review
    } else {
        Gate::Pending
    }
}

/// Registry shortlist for one mention, or the marker that the registry
/// could not be reached within its retry budget.
#[derive(Debug, Clone)]
pub enum Shortlist {
    Available(Vec<CanonicalCompany>),
    Unavailable,
}

/// Outcome of resolving a single mention. Pending outcomes are reported,
/// never persisted and never silently dropped.
#[derive(Debug, Clone, Serialize)]
pub struct MentionResolution {
    pub raw_name: String,
    pub role: MentionRole,
    pub company_id: Option<String>,
    pub base_confidence: f64,
    pub confidence: f64,
    pub gate: Gate,
    pub match_method: Option<MatchMethod>,
    pub adjustments: Vec<GateAdjustment>,
    pub pending_reason: Option<String>,
    #[serde(skip)]
    pub evidence: String,
}

impl MentionResolution {
    fn pending(mention: &CompanyMention, reason: &str) -> Self {
        Self {
            raw_name: mention.raw_name.clone(),
            role: mention.role_guess,
            company_id: None,
            base_confidence: 0.0,
            confidence: 0.0,
            gate: Gate::Pending,
            match_method: None,
            adjustments: Vec::new(),
            pending_reason: Some(reason.to_string()),
            evidence: mention_evidence(mention),
        }
    }

    /// Persisted relationship row, for AutoAccept/Review outcomes only.
    pub fn to_relationship(&self, facility_id: &str) -> Option<Relationship> {
        if self.gate == Gate::Pending {
            return None;
        }
        let company_id = self.company_id.clone()?;
        Some(Relationship {
            relationship_id: Uuid::new_v4(),
            facility_id: facility_id.to_string(),
            company_id,
            role: self.role,
            confidence: self.confidence,
            base_confidence: self.base_confidence,
            gate: self.gate,
            match_method: self.match_method.unwrap_or(MatchMethod::FuzzyName),
            evidence: self.evidence.clone(),
            gates_applied: self.adjustments.clone(),
            created_at: Utc::now(),
        })
    }
}

fn adjustment(reason: &str, delta: f64) -> GateAdjustment {
    GateAdjustment {
        reason: reason.to_string(),
        delta,
    }
}

fn mention_evidence(mention: &CompanyMention) -> String {
    if mention.evidence_text.trim().is_empty() {
        mention.source_reference.clone()
    } else {
        mention.evidence_text.clone()
    }
}

struct BestCandidate<'a> {
    company: &'a CanonicalCompany,
    base_confidence: f64,
    match_method: MatchMethod,
}

/// Best similarity between the raw name and a candidate's registered name
/// or aliases. Ties keep the earlier candidate, which makes the choice
/// deterministic for a given shortlist order.
fn best_candidate<'a>(
    raw_name: &str,
    candidates: &'a [CanonicalCompany],
) -> Option<BestCandidate<'a>> {
    let mut best: Option<BestCandidate<'a>> = None;
    for company in candidates {
        let registered = name_similarity(raw_name, &company.registered_name);
        let mut score = registered;
        let mut via_alias = false;
        for alias in &company.aliases {
            let sim = name_similarity(raw_name, alias);
            if sim > score {
                score = sim;
                via_alias = true;
            }
        }
        let method = if !via_alias && score > 0.999 {
            MatchMethod::ExactName
        } else if via_alias {
            MatchMethod::AliasMatch
        } else {
            MatchMethod::FuzzyName
        };
        let better = match &best {
            Some(current) => score > current.base_confidence,
            None => score > 0.0,
        };
        if better {
            best = Some(BestCandidate {
                company,
                base_confidence: score,
                match_method: method,
            });
        }
    }
    best
}

/// Score one mention against its shortlist. Pure and total: the
/// corroborated set carries the only cross-mention signal (dual-source
/// agreement), computed by the caller over the facility's mention list.
pub fn score_mention(
    mention: &CompanyMention,
    facility: &FacilityRecord,
    candidates: &[CanonicalCompany],
    corroborated: &HashSet<String>,
    profile: &ResolutionProfile,
) -> MentionResolution {
    if candidates.is_empty() {
        return MentionResolution::pending(mention, "no_candidates");
    }
    let Some(best) = best_candidate(&mention.raw_name, candidates) else {
        return MentionResolution::pending(mention, "no_candidates");
    };

    let mut adjustments: Vec<GateAdjustment> = Vec::new();

    if let Some(registry_id) = &mention.registry_id {
        if best.company.registry_ids.iter().any(|id| id == registry_id) {
            adjustments.push(adjustment("registry_id_match", profile.prefer_registry_boost));
        }
    }
    if corroborated.contains(&best.company.company_id) {
        adjustments.push(adjustment("dual_source_agreement", profile.dual_source_boost));
    }
    if let Some(parent) = &best.company.parent_name {
        if name_similarity(&mention.raw_name, parent) > 0.85 {
            adjustments.push(adjustment("parent_name_match", profile.parent_match_boost));
        }
    }

    if !facility
        .country_code
        .eq_ignore_ascii_case(&best.company.country_code)
    {
        adjustments.push(adjustment(
            "country_mismatch",
            -profile.country_mismatch_penalty,
        ));
    }
    if best.company.registry_ids.is_empty() {
        adjustments.push(adjustment(
            "no_registry_identifier",
            -profile.missing_registry_id_penalty,
        ));
    }
    let raw_len = normalize_name(&mention.raw_name).len();
    let registered_len = normalize_name(&best.company.registered_name).len();
    if raw_len.abs_diff(registered_len) > profile.max_name_length_gap {
        adjustments.push(adjustment("name_length_gap", -profile.name_length_penalty));
    }
    if generic_single_token(&mention.raw_name) {
        adjustments.push(adjustment("generic_name", -profile.generic_name_penalty));
    }

    let raw_confidence: f64 =
        best.base_confidence + adjustments.iter().map(|a| a.delta).sum::<f64>();
    let confidence = raw_confidence.clamp(0.0, 1.0);
    let gate = gate_for(profile, confidence);

    MentionResolution {
        raw_name: mention.raw_name.clone(),
        role: mention.role_guess,
        company_id: Some(best.company.company_id.clone()),
        base_confidence: best.base_confidence,
        confidence,
        gate,
        match_method: Some(best.match_method),
        adjustments,
        pending_reason: if gate == Gate::Pending {
            Some("below_review_threshold".to_string())
        } else {
            None
        },
        evidence: mention_evidence(mention),
    }
}

/// Resolve every mention on a facility. Two passes: the first picks each
/// mention's best candidate so dual-source agreement can be counted, the
/// second scores with the corroborated set in hand. `shortlists` runs
/// parallel to `facility.mentions`.
pub fn resolve_mentions(
    facility: &FacilityRecord,
    shortlists: &[Shortlist],
    profile: &ResolutionProfile,
) -> Vec<MentionResolution> {
    debug_assert_eq!(facility.mentions.len(), shortlists.len());

    // Distinct sources agreeing on a candidate, by company id.
    let mut sources_by_company: HashMap<String, HashSet<String>> = HashMap::new();
    for (mention, shortlist) in facility.mentions.iter().zip(shortlists) {
        let Shortlist::Available(candidates) = shortlist else {
            continue;
        };
        if let Some(best) = best_candidate(&mention.raw_name, candidates) {
            sources_by_company
                .entry(best.company.company_id.clone())
                .or_default()
                .insert(mention.source_reference.clone());
        }
    }
    let corroborated: HashSet<String> = sources_by_company
        .into_iter()
        .filter(|(_, sources)| sources.len() >= 2)
        .map(|(company_id, _)| company_id)
        .collect();

    facility
        .mentions
        .iter()
        .zip(shortlists)
        .map(|(mention, shortlist)| match shortlist {
            Shortlist::Available(candidates) => {
                score_mention(mention, facility, candidates, &corroborated, profile)
            }
            Shortlist::Unavailable => MentionResolution::pending(mention, "registry_unavailable"),
        })
        .collect()
}
