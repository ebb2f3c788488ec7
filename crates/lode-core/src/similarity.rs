//! Pure string and coordinate comparison primitives.

use strsim::{jaro_winkler, normalized_levenshtein};

use crate::Location;

/// Degree window for the tight coordinate tier (~1 km).
pub const COORD_TIER1_DEGREES: f64 = 0.01;
/// Degree window for the wide coordinate tier (~11 km).
pub const COORD_TIER2_DEGREES: f64 = 0.1;

/// Single-token names that carry no identity on their own. Sorted.
const GENERIC_TOKENS: &[&str] = &[
    "co", "company", "corp", "corporation", "group", "holdings", "inc", "limited", "llc", "ltd",
    "metals", "mine", "minerals", "mining", "plc", "resources", "smelter",
];

/// Case-fold and strip punctuation to single-spaced alphanumeric words.
pub fn normalize_name(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn name_tokens(input: &str) -> Vec<String> {
    normalize_name(input)
        .split_whitespace()
        .map(|t| t.to_string())
        .collect()
}

/// |shared tokens| / |smaller token set|. 0.0 when either side is empty.
pub fn token_overlap_ratio(a: &str, b: &str) -> f64 {
    let ta: std::collections::BTreeSet<String> = name_tokens(a).into_iter().collect();
    let tb: std::collections::BTreeSet<String> = name_tokens(b).into_iter().collect();
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let shared = ta.intersection(&tb).count();
    shared as f64 / ta.len().min(tb.len()) as f64
}

/// Best of Jaro-Winkler and normalized Levenshtein over normalized names.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let na = normalize_name(a);
    let nb = normalize_name(b);
    if na.is_empty() || nb.is_empty() {
        return 0.0;
    }
    jaro_winkler(&na, &nb).max(normalized_levenshtein(&na, &nb))
}

/// Shorter normalized name appears inside the longer one.
pub fn name_contains(a: &str, b: &str) -> bool {
    let na = normalize_name(a);
    let nb = normalize_name(b);
    if na.is_empty() || nb.is_empty() {
        return false;
    }
    if na.len() <= nb.len() {
        nb.contains(&na)
    } else {
        na.contains(&nb)
    }
}

/// Axis-wise degree comparison; both latitude and longitude must agree.
pub fn coords_within(a: &Location, b: &Location, eps_degrees: f64) -> bool {
    (a.latitude - b.latitude).abs() <= eps_degrees
        && (a.longitude - b.longitude).abs() <= eps_degrees
}

/// Coarse 0.1-degree cell index for blocking.
pub fn coarse_cell(degrees: f64) -> i32 {
    (degrees / COORD_TIER2_DEGREES).floor() as i32
}

/// A raw name that is one generic corporate word carries no identity.
pub fn generic_single_token(raw_name: &str) -> bool {
    let tokens = name_tokens(raw_name);
    match tokens.as_slice() {
        [only] => GENERIC_TOKENS.binary_search(&only.as_str()).is_ok(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocationPrecision;

    fn loc(lat: f64, lon: f64) -> Location {
        Location {
            latitude: lat,
            longitude: lon,
            precision: LocationPrecision::Exact,
        }
    }

    #[test]
    fn normalization_collapses_punctuation_and_case() {
        assert_eq!(normalize_name("  Two-Rivers   (Platinum)  "), "two rivers platinum");
        assert_eq!(normalize_name("BHP Group Ltd."), "bhp group ltd");
    }

    #[test]
    fn token_overlap_uses_smaller_set() {
        let ratio = token_overlap_ratio("Two Rivers", "Two Rivers Platinum Mine");
        assert!((ratio - 1.0).abs() < 1e-9);
        assert_eq!(token_overlap_ratio("", "anything"), 0.0);
    }

    #[test]
    fn containment_is_direction_agnostic() {
        assert!(name_contains("Two Rivers", "Two Rivers Platinum Mine"));
        assert!(name_contains("Two Rivers Platinum Mine", "Two Rivers"));
        assert!(!name_contains("Karee Shaft", "Two Rivers"));
    }

    #[test]
    fn similarity_catches_near_identical_names() {
        assert!(name_similarity("Mogalakwena Mine", "Mogalakwena Mine") > 0.999);
        assert!(name_similarity("Mogalakwena Mine", "Mogalakwena Platinum Mine") > 0.8);
        assert!(name_similarity("Mogalakwena Mine", "Karee Shaft") < 0.6);
    }

    #[test]
    fn coordinate_windows_are_axis_wise() {
        let a = loc(-24.893, 30.124);
        assert!(coords_within(&a, &loc(-24.894, 30.1245), COORD_TIER1_DEGREES));
        // One axis inside, one outside: not within.
        assert!(!coords_within(&a, &loc(-24.893, 30.30), COORD_TIER2_DEGREES));
    }

    #[test]
    fn coarse_cells_round_down() {
        assert_eq!(coarse_cell(30.124), 301);
        assert_eq!(coarse_cell(-24.893), -249);
        assert_eq!(coarse_cell(0.0), 0);
    }

    #[test]
    fn generic_token_detection() {
        assert!(generic_single_token("Mining"));
        assert!(generic_single_token("ltd."));
        assert!(!generic_single_token("BHP"));
        assert!(!generic_single_token("Local Mining Co"));
    }
}
