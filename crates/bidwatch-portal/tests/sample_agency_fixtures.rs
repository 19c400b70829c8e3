//! Runs captured portal responses through the full parse path: section
//! payload -> raw rows -> normalized records.

use std::fs;
use std::path::Path;

use bidwatch_core::{normalize, Agency, OpportunityType};
use bidwatch_portal::{extract_projects, raw_from_project, DirectoryEntry, LetterBuckets};
use chrono::NaiveDateTime;
use serde_json::Value as JsonValue;

fn load_fixture(name: &str) -> JsonValue {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures/sample-agency")
        .join(name);
    let body = fs::read_to_string(&path)
        .unwrap_or_else(|err| panic!("read {}: {err}", path.display()));
    serde_json::from_str(&body).expect("fixture is valid JSON")
}

fn now() -> NaiveDateTime {
    NaiveDateTime::parse_from_str("2025-06-01 12:00:00", "%Y-%m-%d %H:%M:%S").unwrap()
}

fn dart() -> Agency {
    Agency {
        id: "dallas-area-rapid-transit".to_string(),
        display_name: "Dallas Area Rapid Transit".to_string(),
        base_url: "https://dart.procure.example.com".to_string(),
        source_letter: 'D',
    }
}

#[test]
fn directory_page_fills_letter_buckets_in_api_order() {
    let page = load_fixture("organizations_page.json");
    let rows = page.as_array().expect("directory page is an array");

    let mut buckets = LetterBuckets::new(&['D', 'G', 'J', 'L'], 5);
    for row in rows {
        let entry: DirectoryEntry = serde_json::from_value(row.clone()).unwrap();
        buckets.offer(&entry);
    }

    let agencies = buckets.into_agencies();
    let names: Vec<&str> = agencies.iter().map(|a| a.display_name.as_str()).collect();
    // Austin Community College has no configured letter and is dropped.
    assert_eq!(
        names,
        vec![
            "Dallas Area Rapid Transit",
            "Denton County Transportation Authority",
            "Garland Independent School District",
            "Jefferson County Water District",
            "Lubbock Power and Light",
        ]
    );
    // Trailing slash on DCTA's domain is stripped.
    assert_eq!(agencies[1].base_url, "https://dcta.procure.example.com");
}

#[test]
fn open_section_fixture_normalizes_end_to_end() {
    let payload = load_fixture("open_section.json");
    let projects = extract_projects(&payload).expect("projects container present");
    assert_eq!(projects.len(), 2);

    let agency = dart();
    let records: Vec<_> = projects
        .iter()
        .map(|p| normalize(&raw_from_project(p, OpportunityType::Open, now()), &agency, OpportunityType::Open, now()))
        .collect();

    let shelter = records
        .iter()
        .find(|r| r.bidding_id.as_deref() == Some("P25-0142"))
        .expect("shelter listing present");
    assert_eq!(
        shelter.opportunity_name,
        "Bus Shelter & Bench Maintenance Services"
    );
    assert_eq!(shelter.status.as_deref(), Some("Open"));
    assert_eq!(shelter.deadline.iso_format.as_deref(), Some("2025-06-15T17:00:00"));
    assert_eq!(shelter.deadline.has_passed, Some(false));
    assert_eq!(
        shelter.application_instructions.url,
        "https://dart.procure.example.com/portal/?tab=openOpportunities"
    );

    let tires = records
        .iter()
        .find(|r| r.bidding_id.as_deref() == Some("250198"))
        .expect("numeric reference stringified");
    assert_eq!(tires.opportunity_name, "Fleet Tire Supply");
}

#[test]
fn past_section_fixture_maps_statuses_and_marks_passed() {
    let payload = load_fixture("past_section.json");
    let projects = extract_projects(&payload).expect("projects container present");
    assert_eq!(projects.len(), 3);

    let agency = dart();
    let records: Vec<_> = projects
        .iter()
        .map(|p| normalize(&raw_from_project(p, OpportunityType::Past, now()), &agency, OpportunityType::Past, now()))
        .collect();

    let by_id = |id: &str| {
        records
            .iter()
            .find(|r| r.bidding_id.as_deref() == Some(id))
            .unwrap_or_else(|| panic!("{id} present"))
    };

    assert_eq!(by_id("P24-0871").status.as_deref(), Some("Awarded"));
    assert_eq!(by_id("P24-0902").status.as_deref(), Some("Closed"));
    assert_eq!(by_id("P24-0933").status.as_deref(), Some("Cancelled"));

    for record in &records {
        assert_eq!(record.deadline.has_passed, Some(true));
        assert_eq!(record.opportunity_type, OpportunityType::Past);
        assert!(record
            .application_instructions
            .url
            .ends_with("/portal/?tab=pastOpportunities"));
    }
    // The en-dash entity in the janitorial listing survives as text.
    assert_eq!(
        by_id("P24-0902").opportunity_name,
        "Janitorial Services – Operations Center"
    );
}

#[test]
fn document_ids_are_stable_across_sections() {
    let payload = load_fixture("open_section.json");
    let projects = extract_projects(&payload).unwrap();
    let agency = dart();

    let first = normalize(
        &raw_from_project(projects[0], OpportunityType::Open, now()),
        &agency,
        OpportunityType::Open,
        now(),
    );
    let later = NaiveDateTime::parse_from_str("2025-06-02 09:30:00", "%Y-%m-%d %H:%M:%S").unwrap();
    let second = normalize(
        &raw_from_project(projects[0], OpportunityType::Open, later),
        &agency,
        OpportunityType::Open,
        later,
    );
    assert_eq!(first.document_id, second.document_id);
    assert_ne!(first.scraped_at, second.scraped_at);
}
