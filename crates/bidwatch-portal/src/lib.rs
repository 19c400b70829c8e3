//! Portal data-plane fetchers: the agency directory search and the per-agency
//! opportunity section endpoints, plus the pure record builders that turn
//! endpoint payloads into [`RawOpportunity`] rows.

use std::collections::HashMap;

use bidwatch_client::{FetchError, PortalSession};
use bidwatch_core::{Agency, OpportunityType, RawOpportunity};
use chrono::NaiveDateTime;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "bidwatch-portal";

pub const OPEN_SECTION_PATH: &str = "/PublicPortal/getOpenPublicOpportunitiesSectionData";
pub const PAST_SECTION_PATH: &str = "/PublicPortal/getPastPublicOpportunitiesSectionData";

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory search page {page}: {source}")]
    Fetch {
        page: u64,
        #[source]
        source: FetchError,
    },
    #[error("directory search page {page}: unexpected payload shape")]
    UnexpectedPayload { page: u64 },
}

#[derive(Debug, Error)]
pub enum OpportunityFetchError {
    #[error("section fetch for {agency}: {source}")]
    Fetch {
        agency: String,
        #[source]
        source: FetchError,
    },
}

/// One row of the organizations search response.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryEntry {
    #[serde(rename = "OrganizationName")]
    pub organization_name: String,
    #[serde(rename = "Domain")]
    pub domain: String,
}

/// Per-letter selection state for the directory walk. Letters keep their
/// configured order; agencies keep API order within a letter. Matching is
/// case-insensitive on the first character of the organization name.
#[derive(Debug)]
pub struct LetterBuckets {
    letters: Vec<char>,
    cap: usize,
    buckets: HashMap<char, Vec<Agency>>,
}

impl LetterBuckets {
    pub fn new(letters: &[char], cap: usize) -> Self {
        let letters: Vec<char> = letters
            .iter()
            .map(|c| c.to_ascii_uppercase())
            .collect();
        let buckets = letters.iter().map(|&c| (c, Vec::new())).collect();
        Self {
            letters,
            cap,
            buckets,
        }
    }

    /// Offer a directory entry; returns true when it was kept.
    pub fn offer(&mut self, entry: &DirectoryEntry) -> bool {
        let Some(first) = entry.organization_name.trim().chars().next() else {
            return false;
        };
        let letter = first.to_ascii_uppercase();
        let Some(bucket) = self.buckets.get_mut(&letter) else {
            return false;
        };
        if bucket.len() >= self.cap {
            return false;
        }
        let base_url = entry.domain.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return false;
        }
        bucket.push(Agency {
            id: slugify(&entry.organization_name),
            display_name: entry.organization_name.trim().to_string(),
            base_url,
            source_letter: letter,
        });
        true
    }

    /// Configured letters whose bucket stayed empty.
    pub fn empty_letters(&self) -> Vec<char> {
        self.letters
            .iter()
            .copied()
            .filter(|c| self.buckets.get(c).map(Vec::is_empty).unwrap_or(true))
            .collect()
    }

    pub fn all_full(&self) -> bool {
        self.letters
            .iter()
            .all(|c| self.buckets.get(c).map(Vec::len).unwrap_or(0) >= self.cap)
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flatten in configured letter order, preserving API order within each
    /// letter.
    pub fn into_agencies(mut self) -> Vec<Agency> {
        let mut out = Vec::with_capacity(self.len());
        for letter in &self.letters {
            if let Some(bucket) = self.buckets.remove(letter) {
                out.extend(bucket);
            }
        }
        out
    }
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Walks the paginated organizations search until every letter bucket fills
/// or the directory runs out.
#[derive(Debug)]
pub struct DirectoryFetcher {
    search_url: String,
    page_limit: u64,
}

impl DirectoryFetcher {
    pub fn new(search_url: impl Into<String>, page_limit: u64) -> Self {
        Self {
            search_url: search_url.into(),
            page_limit,
        }
    }

    fn page_url(&self, page: u64) -> String {
        let sep = if self.search_url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}page={}&limit={}",
            self.search_url, sep, page, self.page_limit
        )
    }

    pub async fn collect(
        &self,
        session: &PortalSession,
        letters: &[char],
        cap: usize,
    ) -> Result<Vec<Agency>, DirectoryError> {
        let mut buckets = LetterBuckets::new(letters, cap);
        let mut page = 1u64;

        loop {
            let url = self.page_url(page);
            let payload = session
                .get_json(&url)
                .await
                .map_err(|source| DirectoryError::Fetch { page, source })?;

            // The search endpoint answers a JSON array of organizations, or a
            // `{"message": ...}` object once past the last page.
            let entries = match payload {
                JsonValue::Array(items) => items,
                JsonValue::Object(obj) if obj.contains_key("message") => {
                    debug!(page, "directory search exhausted");
                    break;
                }
                _ => return Err(DirectoryError::UnexpectedPayload { page }),
            };
            if entries.is_empty() {
                break;
            }

            let mut kept = 0usize;
            let total = entries.len();
            for item in entries {
                let entry: DirectoryEntry = match serde_json::from_value(item) {
                    Ok(entry) => entry,
                    Err(err) => {
                        warn!(page, error = %err, "skipping malformed directory row");
                        continue;
                    }
                };
                if buckets.offer(&entry) {
                    kept += 1;
                }
            }
            debug!(page, total, kept, "directory search page processed");

            if buckets.all_full() {
                break;
            }
            page += 1;
        }

        for letter in buckets.empty_letters() {
            warn!(%letter, "no agencies found for letter");
        }
        info!(agencies = buckets.len(), "agency directory collected");
        Ok(buckets.into_agencies())
    }
}

/// Fetches an agency's open or past opportunity section and shapes each
/// project into a [`RawOpportunity`].
#[derive(Debug, Default)]
pub struct OpportunityFetcher;

impl OpportunityFetcher {
    pub fn section_url(agency: &Agency, kind: OpportunityType) -> String {
        let path = match kind {
            OpportunityType::Open => OPEN_SECTION_PATH,
            OpportunityType::Past => PAST_SECTION_PATH,
        };
        format!("{}{}", agency.base_url, path)
    }

    /// Fetch one section. `now` anchors the open-listing days-left math so a
    /// whole run computes against a single clock reading.
    pub async fn fetch_section(
        &self,
        session: &PortalSession,
        agency: &Agency,
        kind: OpportunityType,
        now: NaiveDateTime,
    ) -> Result<Vec<RawOpportunity>, OpportunityFetchError> {
        let url = Self::section_url(agency, kind);
        let payload =
            session
                .get_json(&url)
                .await
                .map_err(|source| OpportunityFetchError::Fetch {
                    agency: agency.display_name.clone(),
                    source,
                })?;

        if extract_projects(&payload).is_none() {
            debug!(
                agency = %agency.display_name,
                %kind,
                "section payload has no projects container, treating as empty listing"
            );
        }
        let records = section_records(&payload, kind, now);
        debug!(
            agency = %agency.display_name,
            kind = %kind,
            count = records.len(),
            "section fetched"
        );
        Ok(records)
    }
}

/// Pull the projects container out of a section payload. The endpoint nests
/// it at `payload.projects` and serves either a keyed map or a plain list;
/// an empty container is a valid no-listings answer.
pub fn extract_projects(payload: &JsonValue) -> Option<Vec<&JsonValue>> {
    match &payload["payload"]["projects"] {
        JsonValue::Object(map) => Some(map.values().collect()),
        JsonValue::Array(items) => Some(items.iter().collect()),
        _ => None,
    }
}

/// Shape a whole section payload into raw rows. A payload without the
/// projects container counts as an empty listing, which agencies that have
/// never posted to a section do send.
pub fn section_records(
    payload: &JsonValue,
    kind: OpportunityType,
    now: NaiveDateTime,
) -> Vec<RawOpportunity> {
    extract_projects(payload)
        .unwrap_or_default()
        .into_iter()
        .map(|project| raw_from_project(project, kind, now))
        .collect()
}

/// Shape one project object into a raw listing row. Open listings get a
/// literal "Open" status and a computed days-left count; past listings map
/// their sub-status code to a label.
pub fn raw_from_project(
    project: &JsonValue,
    kind: OpportunityType,
    now: NaiveDateTime,
) -> RawOpportunity {
    let reference = json_str(project, "ReferenceID");
    let name = json_str(project, "ProjectName");
    let closed_date = json_str(project, "DateClose");

    match kind {
        OpportunityType::Open => RawOpportunity {
            status: Some("Open".to_string()),
            reference,
            project_name: name,
            closed_date: closed_date.clone(),
            days_left: Some(days_remaining(closed_date.as_deref(), now)),
        },
        OpportunityType::Past => RawOpportunity {
            status: Some(past_status_label(project).to_string()),
            reference,
            project_name: name,
            closed_date,
            days_left: None,
        },
    }
}

/// Read a field as a string, accepting either a JSON string or a number.
/// ReferenceID in particular shows up as both across agencies.
fn json_str(value: &JsonValue, key: &str) -> Option<String> {
    match &value[key] {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn past_status_label(project: &JsonValue) -> &'static str {
    match project["ProjectSubStatusID"].as_i64() {
        Some(1) => "Closed",
        Some(2) => "Cancelled",
        Some(3) => "Awarded",
        _ => "Unknown",
    }
}

/// Whole days from `now` until the deadline, clamped at zero for passed or
/// unparseable deadlines.
pub fn days_remaining(deadline: Option<&str>, now: NaiveDateTime) -> i64 {
    let Some(raw) = deadline else { return 0 };
    let Ok(dt) = NaiveDateTime::parse_from_str(raw.trim(), bidwatch_core::DEADLINE_FORMAT) else {
        return 0;
    };
    (dt - now).num_days().max(0)
}
