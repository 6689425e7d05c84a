//! Compatibility heuristics for organization pairs and material pairs.
//!
//! Every function here is total: missing or malformed fields just forfeit
//! the corresponding bonus.

use std::collections::HashSet;

use crate::models::{CompanyProfile, MatchDetails, Material, OrganizationType};

const BASE_SCORE: u32 = 50;
const LOCATION_BONUS: u32 = 20;
const INTEREST_BONUS: u32 = 25;
const ORG_TYPE_BONUS: u32 = 15;
const MAX_SCORE: u32 = 100;

const MATERIAL_BASE_SCORE: f64 = 60.0;
const MATERIAL_NAME_BONUS: f64 = 30.0;
const MATERIAL_QUANTITY_BONUS: f64 = 10.0;

/// Anything that can be scored for organization-level compatibility.
pub trait Party {
    fn location(&self) -> Option<&str>;
    fn materials_of_interest(&self) -> Option<&str>;
    fn organization_type(&self) -> Option<OrganizationType>;
}

impl Party for CompanyProfile {
    fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    fn materials_of_interest(&self) -> Option<&str> {
        self.materials_of_interest.as_deref()
    }

    fn organization_type(&self) -> Option<OrganizationType> {
        self.organization_type
    }
}

/// Partners each organization type is considered compatible with.
/// Hand-authored and intentionally asymmetric: look up `from` first.
pub fn compatible_types(from: OrganizationType) -> &'static [OrganizationType] {
    use OrganizationType::*;
    match from {
        Manufacturing => &[Recycling, WasteManagement],
        Research => &[Manufacturing, Consulting],
        Recycling => &[Manufacturing, WasteManagement],
        WasteManagement => &[Recycling, Manufacturing],
        Consulting => &[Manufacturing, Research],
        Investment => &[Manufacturing, Research, Recycling],
    }
}

pub fn types_compatible(from: OrganizationType, to: OrganizationType) -> bool {
    compatible_types(from).contains(&to)
}

/// Lowercased, trimmed, non-empty keywords of a comma-separated list.
pub fn keywords(list: &str) -> Vec<String> {
    list.split(',')
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}

/// True when some keyword of one list contains, or is contained in, a keyword of the other.
pub fn interests_overlap(a: &str, b: &str) -> bool {
    let left = keywords(a);
    let right = keywords(b);
    left.iter()
        .any(|k1| right.iter().any(|k2| k1.contains(k2.as_str()) || k2.contains(k1.as_str())))
}

fn non_empty(value: Option<&str>) -> bool {
    value.is_some_and(|v| !v.trim().is_empty())
}

/// Organization-pair score in `0..=100`.
pub fn compatibility_score(a: &impl Party, b: &impl Party) -> u32 {
    let mut score = BASE_SCORE;

    if non_empty(a.location()) && non_empty(b.location()) {
        score += LOCATION_BONUS;
    }

    if let (Some(i1), Some(i2)) = (a.materials_of_interest(), b.materials_of_interest()) {
        if interests_overlap(i1, i2) {
            score += INTEREST_BONUS;
        }
    }

    if let (Some(t1), Some(t2)) = (a.organization_type(), b.organization_type()) {
        if types_compatible(t1, t2) {
            score += ORG_TYPE_BONUS;
        }
    }

    score.min(MAX_SCORE)
}

/// Case-insensitive containment in either direction.
pub fn names_related(a: &str, b: &str) -> bool {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a.contains(&b) || b.contains(&a)
}

/// Smaller over larger quantity; 0 when either side has nothing to offer.
pub fn quantity_ratio(a: f64, b: f64) -> f64 {
    if !(a > 0.0 && b > 0.0) {
        return 0.0;
    }
    a.min(b) / a.max(b)
}

/// Material-pair score in `60.0..=100.0`.
pub fn material_score(a: &Material, b: &Material) -> f64 {
    let mut score = MATERIAL_BASE_SCORE;

    if names_related(&a.material_name, &b.material_name) {
        score += MATERIAL_NAME_BONUS;
    }

    score += quantity_ratio(a.quantity, b.quantity) * MATERIAL_QUANTITY_BONUS;

    score.min(MAX_SCORE as f64)
}

/// Human-readable reasons two materials were paired. The name check is
/// directional: `a`'s name must contain `b`'s.
pub fn compatibility_factors(a: &Material, b: &Material) -> Vec<&'static str> {
    let mut factors = Vec::new();

    let name_a = a.material_name.trim().to_lowercase();
    let name_b = b.material_name.trim().to_lowercase();
    if !name_b.is_empty() && name_a.contains(&name_b) {
        factors.push("material_type_match");
    }

    if a.unit.trim().eq_ignore_ascii_case(b.unit.trim()) {
        factors.push("unit_compatibility");
    }

    factors.push("location_proximity");
    factors.push("company_compatibility");

    factors
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Cosine similarity of the two texts' token sets, in `0.0..=1.0`.
pub fn token_similarity(a: &str, b: &str) -> f64 {
    let left = tokens(a);
    let right = tokens(b);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let common = left.intersection(&right).count() as f64;
    common / ((left.len() * right.len()) as f64).sqrt()
}

fn material_text(material: &Material) -> String {
    match &material.description {
        Some(desc) => format!("{} {}", material.material_name, desc),
        None => material.material_name.clone(),
    }
}

/// Sub-scores recorded alongside a waste/requirement match.
pub fn match_details(waste: &Material, requirement: &Material) -> MatchDetails {
    MatchDetails {
        category_match: if names_related(&waste.material_name, &requirement.material_name) {
            1.0
        } else {
            0.0
        },
        keyword_overlap: token_similarity(&material_text(waste), &material_text(requirement)),
        // Locations are free text; nothing to measure a distance from.
        distance_km: None,
        quantity_score: quantity_ratio(waste.quantity, requirement.quantity),
    }
}

/// Label for a normalized `0.0..=1.0` match score.
pub fn quality_label(score: f64) -> &'static str {
    if score >= 0.8 {
        "Perfect Symbiosis"
    } else if score >= 0.6 {
        "High Value"
    } else if score >= 0.4 {
        "Viable Match"
    } else {
        "Low Potential"
    }
}
