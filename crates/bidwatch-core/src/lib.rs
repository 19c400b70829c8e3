//! Core domain model and record normalization for bidwatch.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "bidwatch-core";

/// Raw deadline format used by the portal's section payloads.
pub const DEADLINE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Which public listing section an opportunity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpportunityType {
    Open,
    Past,
}

impl OpportunityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Past => "past",
        }
    }

    /// Query value of the portal tab that lists this section.
    pub fn portal_tab(self) -> &'static str {
        match self {
            Self::Open => "openOpportunities",
            Self::Past => "pastOpportunities",
        }
    }

    /// Fixed descriptive text for the application instructions of this section.
    pub fn submission_method(self) -> &'static str {
        match self {
            Self::Open => "Submit proposal through the agency's online portal",
            Self::Past => "Opportunity closed - historical record only",
        }
    }
}

impl std::fmt::Display for OpportunityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agency discovered through the directory search. Used as a join key while
/// fetching and normalizing; never persisted as its own entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agency {
    pub id: String,
    pub display_name: String,
    pub base_url: String,
    pub source_letter: char,
}

impl Agency {
    /// URL of the agency's public portal tab for the given section.
    pub fn portal_tab_url(&self, kind: OpportunityType) -> String {
        format!("{}/portal/?tab={}", self.base_url, kind.portal_tab())
    }
}

/// Raw listing record assembled from the portal's section payload.
///
/// Field names mirror the upstream API, every value may be absent. The
/// upstream spells the reference field "Refference"; the corrected spelling
/// is tolerated as an alias.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawOpportunity {
    #[serde(rename = "Status", default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(
        rename = "Refference",
        alias = "Reference",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub reference: Option<String>,
    #[serde(rename = "Project Name", default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(rename = "Closed Date", default, skip_serializing_if = "Option::is_none")]
    pub closed_date: Option<String>,
    #[serde(
        rename = "Number of days Left",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub days_left: Option<i64>,
}

/// Structured deadline. When the raw string is missing or unparseable the
/// derived sub-fields stay `None`; bad dates never fail normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Deadline {
    pub raw: Option<String>,
    pub iso_format: Option<String>,
    pub readable: Option<String>,
    pub has_passed: Option<bool>,
}

impl Deadline {
    /// Parse a `YYYY-MM-DD HH:MM:SS` deadline against the evaluation time.
    ///
    /// `has_passed` is strict: a deadline exactly equal to `now` has not
    /// passed.
    pub fn parse(raw: Option<&str>, now: NaiveDateTime) -> Self {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return Self::default();
        };

        match NaiveDateTime::parse_from_str(raw, DEADLINE_FORMAT) {
            Ok(dt) => Self {
                raw: Some(raw.to_string()),
                iso_format: Some(dt.format(ISO_FORMAT).to_string()),
                readable: Some(dt.format("%B %d, %Y at %I:%M %p").to_string()),
                has_passed: Some(dt < now),
            },
            Err(_) => Self {
                raw: Some(raw.to_string()),
                ..Self::default()
            },
        }
    }
}

/// Where and how a vendor applies for an opportunity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationInstructions {
    pub url: String,
    pub method: String,
}

/// Canonical, storage-ready opportunity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub organization_name: String,
    pub bidding_id: Option<String>,
    pub opportunity_name: String,
    pub description: String,
    pub application_instructions: ApplicationInstructions,
    pub deadline: Deadline,
    pub status: Option<String>,
    pub days_remaining: Option<i64>,
    #[serde(rename = "_document_id")]
    pub document_id: String,
    #[serde(rename = "_source_url")]
    pub source_url: String,
    #[serde(rename = "_scraped_at")]
    pub scraped_at: String,
    #[serde(rename = "_opportunity_type")]
    pub opportunity_type: OpportunityType,
}

/// Deterministic upsert key over (organization, bidding id, section).
///
/// A missing bidding id falls back to the empty string, which collapses
/// uniqueness across such records for the same agency and section.
pub fn document_id(
    organization_name: &str,
    bidding_id: Option<&str>,
    kind: OpportunityType,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(organization_name.trim().to_lowercase().as_bytes());
    hasher.update([0x1f]);
    hasher.update(bidding_id.unwrap_or("").trim().to_lowercase().as_bytes());
    hasher.update([0x1f]);
    hasher.update(kind.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

/// Replace the HTML entities the portal is known to emit in project names.
pub fn clean_html_entities(text: &str) -> String {
    const REPLACEMENTS: [(&str, &str); 7] = [
        ("&amp;", "&"),
        ("&lt;", "<"),
        ("&gt;", ">"),
        ("&quot;", "\""),
        ("&#39;", "'"),
        ("&#8211;", "\u{2013}"),
        ("&nbsp;", " "),
    ];

    let mut out = text.to_string();
    for (entity, replacement) in REPLACEMENTS {
        if out.contains(entity) {
            out = out.replace(entity, replacement);
        }
    }
    out.trim().to_string()
}

/// Map a raw listing into the canonical record shape.
///
/// Pure over its inputs: `now` is the evaluation timestamp used for the
/// `has_passed` flag and the `_scraped_at` provenance field. No detail page
/// is fetched, so the listing name stands in for the description.
pub fn normalize(
    raw: &RawOpportunity,
    agency: &Agency,
    kind: OpportunityType,
    now: NaiveDateTime,
) -> Opportunity {
    let bidding_id = raw
        .reference
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string);
    let opportunity_name = clean_html_entities(raw.project_name.as_deref().unwrap_or(""));

    Opportunity {
        organization_name: agency.display_name.clone(),
        document_id: document_id(&agency.display_name, bidding_id.as_deref(), kind),
        description: opportunity_name.clone(),
        opportunity_name,
        application_instructions: ApplicationInstructions {
            url: agency.portal_tab_url(kind),
            method: kind.submission_method().to_string(),
        },
        deadline: Deadline::parse(raw.closed_date.as_deref(), now),
        status: raw.status.clone(),
        days_remaining: raw.days_left,
        bidding_id,
        source_url: agency.base_url.clone(),
        scraped_at: now.format(ISO_FORMAT).to_string(),
        opportunity_type: kind,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    fn dart() -> Agency {
        Agency {
            id: "dart.bonfirehub.com".to_string(),
            display_name: "Dallas Area Rapid Transit".to_string(),
            base_url: "https://dart.bonfirehub.com".to_string(),
            source_letter: 'D',
        }
    }

    #[test]
    fn deadline_parse_round_trips_to_same_timestamp() {
        let now = at(2025, 1, 1, 0, 0, 0);
        let deadline = Deadline::parse(Some("2025-12-11 20:00:00"), now);

        let iso = deadline.iso_format.as_deref().unwrap();
        let reparsed = NaiveDateTime::parse_from_str(iso, "%Y-%m-%dT%H:%M:%S").unwrap();
        assert_eq!(reparsed, at(2025, 12, 11, 20, 0, 0));
        assert_eq!(
            deadline.readable.as_deref(),
            Some("December 11, 2025 at 08:00 PM")
        );
        assert_eq!(deadline.has_passed, Some(false));
    }

    #[test]
    fn deadline_exactly_now_has_not_passed() {
        let now = at(2025, 12, 11, 20, 0, 0);
        let deadline = Deadline::parse(Some("2025-12-11 20:00:00"), now);
        assert_eq!(deadline.has_passed, Some(false));

        let just_after = at(2025, 12, 11, 20, 0, 1);
        let deadline = Deadline::parse(Some("2025-12-11 20:00:00"), just_after);
        assert_eq!(deadline.has_passed, Some(true));
    }

    #[test]
    fn unparseable_deadline_degrades_to_nulls() {
        let now = at(2025, 1, 1, 0, 0, 0);
        let deadline = Deadline::parse(Some("next Tuesday"), now);
        assert_eq!(deadline.raw.as_deref(), Some("next Tuesday"));
        assert!(deadline.iso_format.is_none());
        assert!(deadline.readable.is_none());
        assert!(deadline.has_passed.is_none());

        let missing = Deadline::parse(None, now);
        assert_eq!(missing, Deadline::default());
    }

    #[test]
    fn document_id_is_deterministic_and_input_sensitive() {
        let a = document_id("Dallas Area Rapid Transit", Some("2096154"), OpportunityType::Open);
        let b = document_id("Dallas Area Rapid Transit", Some("2096154"), OpportunityType::Open);
        assert_eq!(a, b);

        let other_org = document_id("Denton County", Some("2096154"), OpportunityType::Open);
        let other_bid =
            document_id("Dallas Area Rapid Transit", Some("2096155"), OpportunityType::Open);
        let other_kind =
            document_id("Dallas Area Rapid Transit", Some("2096154"), OpportunityType::Past);
        assert_ne!(a, other_org);
        assert_ne!(a, other_bid);
        assert_ne!(a, other_kind);
    }

    #[test]
    fn document_id_ignores_case_and_padding() {
        let a = document_id("Dallas Area Rapid Transit", Some("AB-12"), OpportunityType::Open);
        let b = document_id("  dallas area rapid transit ", Some(" ab-12 "), OpportunityType::Open);
        assert_eq!(a, b);
    }

    #[test]
    fn missing_bidding_id_falls_back_to_empty_string() {
        let with_none = document_id("Garland ISD", None, OpportunityType::Past);
        let with_empty = document_id("Garland ISD", Some(""), OpportunityType::Past);
        assert_eq!(with_none, with_empty);
    }

    #[test]
    fn normalize_tolerates_missing_fields() {
        let raw = RawOpportunity::default();
        let opp = normalize(&raw, &dart(), OpportunityType::Open, at(2025, 6, 1, 12, 0, 0));

        assert!(opp.bidding_id.is_none());
        assert_eq!(opp.deadline, Deadline::default());
        assert!(opp.status.is_none());
        assert!(opp.days_remaining.is_none());
        assert_eq!(opp.opportunity_name, "");
        assert!(!opp.document_id.is_empty());
    }

    #[test]
    fn normalize_dart_bolt_listing() {
        let raw: RawOpportunity = serde_json::from_value(serde_json::json!({
            "Status": "Open",
            "Refference": "2096154",
            "Project Name": "BOLT, 1/2-13 X 4, GRADE 8",
            "Closed Date": "2025-12-11 20:00:00",
            "Number of days Left": 5
        }))
        .unwrap();

        let opp = normalize(&raw, &dart(), OpportunityType::Open, at(2025, 12, 6, 20, 0, 0));

        assert_eq!(opp.organization_name, "Dallas Area Rapid Transit");
        assert_eq!(opp.bidding_id.as_deref(), Some("2096154"));
        assert_eq!(opp.opportunity_name, "BOLT, 1/2-13 X 4, GRADE 8");
        assert_eq!(opp.description, opp.opportunity_name);
        assert_eq!(
            opp.application_instructions.url,
            "https://dart.bonfirehub.com/portal/?tab=openOpportunities"
        );
        assert_eq!(
            opp.deadline.iso_format.as_deref(),
            Some("2025-12-11T20:00:00")
        );
        assert_eq!(opp.status.as_deref(), Some("Open"));
        assert_eq!(opp.days_remaining, Some(5));
        assert_eq!(opp.opportunity_type, OpportunityType::Open);
        assert_eq!(opp.source_url, "https://dart.bonfirehub.com");
    }

    #[test]
    fn normalize_cleans_html_entities_in_names() {
        let raw: RawOpportunity = serde_json::from_value(serde_json::json!({
            "Project Name": "Paving &amp; Drainage &#39;24  "
        }))
        .unwrap();
        let opp = normalize(&raw, &dart(), OpportunityType::Past, at(2025, 1, 1, 0, 0, 0));
        assert_eq!(opp.opportunity_name, "Paving & Drainage '24");
    }

    #[test]
    fn raw_opportunity_accepts_corrected_reference_spelling() {
        let raw: RawOpportunity =
            serde_json::from_value(serde_json::json!({ "Reference": "77" })).unwrap();
        assert_eq!(raw.reference.as_deref(), Some("77"));
    }

    #[test]
    fn opportunity_serializes_metadata_with_underscore_keys() {
        let raw = RawOpportunity::default();
        let opp = normalize(&raw, &dart(), OpportunityType::Open, at(2025, 6, 1, 0, 0, 0));
        let value = serde_json::to_value(&opp).unwrap();

        assert!(value.get("_document_id").is_some());
        assert!(value.get("_source_url").is_some());
        assert!(value.get("_scraped_at").is_some());
        assert_eq!(value["_opportunity_type"], "open");
    }
}
