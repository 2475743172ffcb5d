//! Date-window and attribute filtering of canonical permits.

use chrono::Utc;
use permx_adapters::DateWindow;
use permx_core::normalize::{parse_date_str, parse_window_bound, Bound};
use permx_core::{CanonicalPermit, DatePolicy, Jurisdiction, SearchResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterCriteria {
    pub window: DateWindow,
    pub status: Option<String>,
    pub category: Option<String>,
    pub permit_type: Option<String>,
}

impl FilterCriteria {
    pub fn new(window: DateWindow) -> Self {
        Self {
            window,
            status: None,
            category: None,
            permit_type: None,
        }
    }

    /// Blank criteria are dropped so they pass everything.
    pub fn with_attributes(mut self, status: Option<&str>, category: Option<&str>, permit_type: Option<&str>) -> Self {
        self.status = non_blank(status);
        self.category = non_blank(category);
        self.permit_type = non_blank(permit_type);
        self
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

/// Expands optional `start`/`end` inputs into an inclusive window; a missing
/// start is the epoch, a missing end is `now_ms`.
pub fn resolve_window(start: Option<&str>, end: Option<&str>, now_ms: i64) -> Result<DateWindow, String> {
    let bound = |input: Option<&str>, which: Bound, label: &str, default: i64| match non_blank(input) {
        None => Ok(default),
        Some(text) => parse_window_bound(&text, which).ok_or_else(|| format!("invalid {label} `{text}`")),
    };
    let window = DateWindow {
        start_ms: bound(start, Bound::Start, "startDate", 0)?,
        end_ms: bound(end, Bound::End, "endDate", now_ms)?,
    };
    if window.start_ms > window.end_ms {
        return Err("startDate is after endDate".to_string());
    }
    Ok(window)
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn eq_ci(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

fn attributes_match(permit: &CanonicalPermit, criteria: &FilterCriteria) -> bool {
    let status_ok = criteria.status.as_deref().map_or(true, |s| eq_ci(&permit.status, s));
    let category_ok = criteria
        .category
        .as_deref()
        .map_or(true, |c| eq_ci(&permit.category, c) || eq_ci(&permit.super_category, c));
    let type_ok = criteria.permit_type.as_deref().map_or(true, |t| {
        let field = if permit.permit_type.is_empty() {
            &permit.category
        } else {
            &permit.permit_type
        };
        eq_ci(field, t)
    });
    status_ok && category_ok && type_ok
}

fn city_matches(permit: &CanonicalPermit, jurisdiction: Jurisdiction) -> bool {
    permit.city.trim().is_empty() || eq_ci(&permit.city, jurisdiction.display_name())
}

/// Whether a single permit passes the filter under `policy`.
pub fn permit_matches(
    permit: &CanonicalPermit,
    criteria: &FilterCriteria,
    jurisdiction: Jurisdiction,
    policy: DatePolicy,
) -> bool {
    if !city_matches(permit, jurisdiction) {
        return false;
    }
    let date_ok = match policy {
        DatePolicy::IssuedThenApplied => {
            let selected = permit.selected_date();
            selected != 0 && criteria.window.contains(selected)
        }
        DatePolicy::CityMatchOnly => true,
    };
    date_ok && attributes_match(permit, criteria)
}

/// Stable filter using the jurisdiction's own date policy.
pub fn filter_by_window(
    records: Vec<CanonicalPermit>,
    criteria: &FilterCriteria,
    jurisdiction: Jurisdiction,
) -> Vec<CanonicalPermit> {
    filter_with_policy(records, criteria, jurisdiction, jurisdiction.date_policy())
}

pub fn filter_with_policy(
    records: Vec<CanonicalPermit>,
    criteria: &FilterCriteria,
    jurisdiction: Jurisdiction,
    policy: DatePolicy,
) -> Vec<CanonicalPermit> {
    records
        .into_iter()
        .filter(|p| permit_matches(p, criteria, jurisdiction, policy))
        .collect()
}

/// Drops enriched results whose detail summary carries a parseable `label`
/// date outside the window. Results without that date are kept.
pub fn retain_summary_window(results: &mut Vec<SearchResult>, label: &str, window: DateWindow) {
    results.retain(|r| match r.scraped_details.summary.get(label).and_then(parse_date_str) {
        Some(ms) => window.contains(ms),
        None => true,
    });
}
