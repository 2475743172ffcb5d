//! Core domain model for permx: canonical permits, detail bundles and search results.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod normalize;

pub const CRATE_NAME: &str = "permx-core";

/// Maximum characters kept from a scraped permit description.
pub const DESCRIPTION_LIMIT: usize = 30_000;

/// The municipal permitting authorities permx knows how to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Jurisdiction {
    Bellevue,
    Bothell,
    Kirkland,
    Burien,
}

/// How the filter engine selects records for a jurisdiction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatePolicy {
    /// Issued date, falling back to applied date when issued is unknown.
    IssuedThenApplied,
    /// No date filtering; records are matched on city name only.
    CityMatchOnly,
}

impl Jurisdiction {
    pub const ALL: [Jurisdiction; 4] = [
        Jurisdiction::Bellevue,
        Jurisdiction::Bothell,
        Jurisdiction::Kirkland,
        Jurisdiction::Burien,
    ];

    pub fn display_name(self) -> &'static str {
        match self {
            Jurisdiction::Bellevue => "Bellevue",
            Jurisdiction::Bothell => "Bothell",
            Jurisdiction::Kirkland => "Kirkland",
            Jurisdiction::Burien => "Burien",
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            Jurisdiction::Bellevue => "bellevue",
            Jurisdiction::Bothell => "bothell",
            Jurisdiction::Kirkland => "kirkland",
            Jurisdiction::Burien => "burien",
        }
    }

    /// Case-insensitive lookup by display name.
    pub fn parse(input: &str) -> Option<Self> {
        let needle = input.trim();
        Self::ALL
            .into_iter()
            .find(|j| j.display_name().eq_ignore_ascii_case(needle))
    }

    /// Bothell publishes project events rather than dated permits, so its
    /// records are never filtered by date.
    pub fn date_policy(self) -> DatePolicy {
        match self {
            Jurisdiction::Bothell => DatePolicy::CityMatchOnly,
            _ => DatePolicy::IssuedThenApplied,
        }
    }
}

impl fmt::Display for Jurisdiction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Normalized permit record produced by a provider adapter.
///
/// Text fields a provider does not supply are empty strings; dates are epoch
/// milliseconds where `0` means unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalPermit {
    pub permit_number: String,
    pub jurisdiction: Jurisdiction,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub super_category: String,
    #[serde(default)]
    pub permit_type: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub parcel: String,
    #[serde(default)]
    pub applied_date: i64,
    #[serde(default)]
    pub issued_date: i64,
    #[serde(default)]
    pub detail_url: String,
    #[serde(default)]
    pub source_layer: String,
}

impl CanonicalPermit {
    pub fn new(jurisdiction: Jurisdiction, permit_number: impl Into<String>) -> Self {
        Self {
            permit_number: permit_number.into(),
            jurisdiction,
            city: String::new(),
            status: String::new(),
            category: String::new(),
            super_category: String::new(),
            permit_type: String::new(),
            address: String::new(),
            parcel: String::new(),
            applied_date: 0,
            issued_date: 0,
            detail_url: String::new(),
            source_layer: String::new(),
        }
    }

    /// Issued date when known, otherwise applied date (possibly 0).
    pub fn selected_date(&self) -> i64 {
        if self.issued_date != 0 {
            self.issued_date
        } else {
            self.applied_date
        }
    }

    pub fn is_enrichable(&self) -> bool {
        !self.permit_number.trim().is_empty()
    }

    pub fn permit_ref(&self) -> PermitRef {
        PermitRef {
            permit_number: self.permit_number.clone(),
            detail_url: self.detail_url.clone(),
        }
    }
}

/// Back-reference from enrichment output to the permit that owns it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermitRef {
    pub permit_number: String,
    pub detail_url: String,
}

/// Ordered string-to-string mapping whose keys are discovered at runtime.
///
/// Insertion order is preserved so header unions can be built in first-seen
/// order; inserting an existing key replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    cells: Vec<(String, String)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.cells.iter_mut().find(|(k, _)| *k == key) {
            return Some(std::mem::replace(&mut slot.1, value));
        }
        self.cells.push((key, value));
        None
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cells.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (k, v) in iter {
            row.insert(k, v);
        }
        row
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.cells.len()))?;
        for (k, v) in &self.cells {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Row {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RowVisitor;

        impl<'de> Visitor<'de> for RowVisitor {
            type Value = Row;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of string keys to string values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Row, A::Error> {
                let mut row = Row::new();
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    row.insert(k, v);
                }
                Ok(row)
            }
        }

        deserializer.deserialize_map(RowVisitor)
    }
}

/// Two-column key/value section scraped from a permit details page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub left: Row,
    pub right: Row,
}

impl Summary {
    /// Looks a label up in the left column first, then the right.
    pub fn get(&self, label: &str) -> Option<&str> {
        self.left.get(label).or_else(|| self.right.get(label))
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty() && self.right.is_empty()
    }
}

/// The six per-permit sub-resources, in workbook sheet order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubTableKind {
    People,
    Fees,
    Reviews,
    Inspections,
    RelatedPermits,
    Conditions,
}

impl SubTableKind {
    pub const ALL: [SubTableKind; 6] = [
        SubTableKind::People,
        SubTableKind::Fees,
        SubTableKind::Reviews,
        SubTableKind::Inspections,
        SubTableKind::RelatedPermits,
        SubTableKind::Conditions,
    ];

    pub fn sheet_name(self) -> &'static str {
        match self {
            SubTableKind::People => "People",
            SubTableKind::Fees => "Fees",
            SubTableKind::Reviews => "Reviews",
            SubTableKind::Inspections => "Inspections",
            SubTableKind::RelatedPermits => "RelatedPermits",
            SubTableKind::Conditions => "Conditions",
        }
    }

    /// Tab name used by the permit-detail JSON endpoints and page sections.
    pub fn api_tab(self) -> &'static str {
        match self {
            SubTableKind::People => "PeopleData",
            SubTableKind::Fees => "PermitFeeData",
            SubTableKind::Reviews => "ReviewsAndActivity",
            SubTableKind::Inspections => "PermitInspections",
            SubTableKind::RelatedPermits => "PermitsForParcelData",
            SubTableKind::Conditions => "PermitConditionsData",
        }
    }
}

/// Enrichment result for one permit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailBundle {
    pub owner: PermitRef,
    #[serde(default)]
    pub summary: Summary,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub people: Vec<Row>,
    #[serde(default)]
    pub fees: Vec<Row>,
    #[serde(default)]
    pub reviews: Vec<Row>,
    #[serde(default)]
    pub inspections: Vec<Row>,
    #[serde(default)]
    pub conditions: Vec<Row>,
    #[serde(default)]
    pub related_permits: Vec<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DetailBundle {
    pub fn empty(owner: PermitRef) -> Self {
        Self {
            owner,
            ..Self::default()
        }
    }

    pub fn failed(owner: PermitRef, error: impl Into<String>) -> Self {
        Self {
            owner,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn table(&self, kind: SubTableKind) -> &[Row] {
        match kind {
            SubTableKind::People => &self.people,
            SubTableKind::Fees => &self.fees,
            SubTableKind::Reviews => &self.reviews,
            SubTableKind::Inspections => &self.inspections,
            SubTableKind::RelatedPermits => &self.related_permits,
            SubTableKind::Conditions => &self.conditions,
        }
    }

    pub fn table_mut(&mut self, kind: SubTableKind) -> &mut Vec<Row> {
        match kind {
            SubTableKind::People => &mut self.people,
            SubTableKind::Fees => &mut self.fees,
            SubTableKind::Reviews => &mut self.reviews,
            SubTableKind::Inspections => &mut self.inspections,
            SubTableKind::RelatedPermits => &mut self.related_permits,
            SubTableKind::Conditions => &mut self.conditions,
        }
    }

    pub fn set_description(&mut self, text: &str) {
        self.description = normalize::truncate_chars(text.trim(), DESCRIPTION_LIMIT, "");
    }
}

/// One enriched permit, positioned by its index in the filtered input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub index: usize,
    pub permit_number: String,
    pub detail_page_url: String,
    pub identity: CanonicalPermit,
    pub scraped_details: DetailBundle,
}

impl SearchResult {
    pub fn new(index: usize, identity: CanonicalPermit, scraped_details: DetailBundle) -> Self {
        Self {
            index,
            permit_number: identity.permit_number.clone(),
            detail_page_url: identity.detail_url.clone(),
            identity,
            scraped_details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jurisdiction_parse_is_case_insensitive() {
        assert_eq!(Jurisdiction::parse("burien"), Some(Jurisdiction::Burien));
        assert_eq!(Jurisdiction::parse("  KIRKLAND "), Some(Jurisdiction::Kirkland));
        assert_eq!(Jurisdiction::parse("Seattle"), None);
        assert_eq!(Jurisdiction::Bothell.date_policy(), DatePolicy::CityMatchOnly);
        assert_eq!(Jurisdiction::Bellevue.date_policy(), DatePolicy::IssuedThenApplied);
    }

    #[test]
    fn selected_date_prefers_issued() {
        let mut permit = CanonicalPermit::new(Jurisdiction::Bellevue, "BLD24-00001");
        permit.applied_date = 10;
        assert_eq!(permit.selected_date(), 10);
        permit.issued_date = 20;
        assert_eq!(permit.selected_date(), 20);
        assert!(permit.is_enrichable());
        assert!(!CanonicalPermit::new(Jurisdiction::Burien, "  ").is_enrichable());
    }

    #[test]
    fn row_keeps_insertion_order_and_replaces_in_place() {
        let mut row = Row::new();
        row.insert("Name", "Ada");
        row.insert("Role", "Owner");
        assert_eq!(row.insert("Name", "Grace"), Some("Ada".to_string()));
        assert_eq!(row.keys().collect::<Vec<_>>(), vec!["Name", "Role"]);
        assert_eq!(row.get("Name"), Some("Grace"));

        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"{"Name":"Grace","Role":"Owner"}"#);
        let back: Row = serde_json::from_str(&json).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn bundle_tables_are_addressable_by_kind() {
        let owner = PermitRef {
            permit_number: "BLD24-00001".into(),
            detail_url: "https://example.test/BLD24-00001".into(),
        };
        let mut bundle = DetailBundle::empty(owner.clone());
        bundle
            .table_mut(SubTableKind::Fees)
            .push(Row::from_iter([("Fee", "Plan review")]));
        assert_eq!(bundle.table(SubTableKind::Fees).len(), 1);
        assert!(bundle.table(SubTableKind::People).is_empty());
        assert!(!bundle.is_failed());
        assert!(DetailBundle::failed(owner, "boom").is_failed());
    }

    #[test]
    fn description_is_truncated() {
        let mut bundle = DetailBundle::default();
        bundle.set_description(&"x".repeat(DESCRIPTION_LIMIT + 50));
        assert_eq!(bundle.description.chars().count(), DESCRIPTION_LIMIT);
    }

    #[test]
    fn search_result_copies_envelope_from_identity() {
        let mut permit = CanonicalPermit::new(Jurisdiction::Burien, "PLN24-0042");
        permit.detail_url = "https://example.test/PLN24-0042".into();
        let result = SearchResult::new(3, permit.clone(), DetailBundle::empty(permit.permit_ref()));
        assert_eq!(result.permit_number, "PLN24-0042");
        assert_eq!(result.detail_page_url, "https://example.test/PLN24-0042");
        assert_eq!(result.scraped_details.owner.permit_number, "PLN24-0042");
    }
}
