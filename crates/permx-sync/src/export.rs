//! Flattening of search results into a multi-sheet xlsx workbook.

use std::collections::HashSet;

use permx_core::normalize::{format_canonical_date, truncate_chars, value_to_cell, TRUNCATION_MARKER};
use permx_core::{Jurisdiction, Row, SearchResult, SubTableKind};
use rust_xlsxwriter::{Format, Workbook, XlsxError};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const MASTER_SHEET: &str = "Permits";
pub const CELL_LIMIT: usize = 32_000;
pub const MAX_SHEET_ROWS: usize = 100_000;
pub const XLSX_CONTENT_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

const PERMIT_NUMBER: &str = "PermitNumber";
const DETAIL_PAGE_URL: &str = "DetailPageUrl";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("xlsx serialization failed: {0}")]
    Xlsx(#[from] XlsxError),
    #[error("flattening permit identity failed: {0}")]
    Identity(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetPlan {
    pub name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkbookPlan {
    pub sheets: Vec<SheetPlan>,
}

impl WorkbookPlan {
    pub fn sheet(&self, name: &str) -> Option<&SheetPlan> {
        self.sheets.iter().find(|s| s.name == name)
    }
}

/// First-seen ordered union of column names.
#[derive(Debug, Default)]
struct HeaderUnion {
    headers: Vec<String>,
    seen: HashSet<String>,
}

impl HeaderUnion {
    fn observe(&mut self, row: &Row) {
        for key in row.keys() {
            if self.seen.insert(key.to_string()) {
                self.headers.push(key.to_string());
            }
        }
    }
}

fn sheet_from_rows(name: &str, rows: Vec<Row>) -> SheetPlan {
    let mut union = HeaderUnion::default();
    for row in &rows {
        union.observe(row);
    }
    if rows.len() > MAX_SHEET_ROWS {
        warn!(sheet = name, rows = rows.len(), kept = MAX_SHEET_ROWS, "sheet row limit reached; dropping excess rows");
    }
    let cells = rows
        .iter()
        .take(MAX_SHEET_ROWS)
        .map(|row| {
            union
                .headers
                .iter()
                .map(|h| truncate_chars(row.get(h).unwrap_or(""), CELL_LIMIT, TRUNCATION_MARKER))
                .collect()
        })
        .collect();
    SheetPlan {
        name: name.to_string(),
        headers: union.headers,
        rows: cells,
    }
}

/// Flattens `value` into `out`: nested object keys are dot-joined, arrays and
/// scalars become cell text.
pub fn flatten_json(prefix: &str, value: &JsonValue, out: &mut Row) {
    match value {
        JsonValue::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_json(&path, child, out);
            }
        }
        other => {
            out.insert(prefix, value_to_cell(other));
        }
    }
}

fn master_row(result: &SearchResult) -> Result<Row, ExportError> {
    let mut row = Row::new();
    row.insert(PERMIT_NUMBER, result.permit_number.as_str());
    row.insert(DETAIL_PAGE_URL, result.detail_page_url.as_str());
    flatten_json("", &serde_json::to_value(&result.identity)?, &mut row);
    row.insert("appliedDate", format_canonical_date(result.identity.applied_date));
    row.insert("issuedDate", format_canonical_date(result.identity.issued_date));
    let details = &result.scraped_details;
    row.insert("description", details.description.as_str());
    for (label, value) in details.summary.left.iter() {
        row.insert(format!("summary.left.{label}"), value);
    }
    for (label, value) in details.summary.right.iter() {
        row.insert(format!("summary.right.{label}"), value);
    }
    Ok(row)
}

fn sub_table_rows(results: &[SearchResult], kind: SubTableKind) -> Vec<Row> {
    let mut rows = Vec::new();
    for result in results {
        let owner = &result.scraped_details.owner;
        let permit_number = if owner.permit_number.is_empty() {
            &result.permit_number
        } else {
            &owner.permit_number
        };
        let detail_url = if owner.detail_url.is_empty() {
            &result.detail_page_url
        } else {
            &owner.detail_url
        };
        for source in result.scraped_details.table(kind) {
            let mut row = Row::new();
            row.insert(PERMIT_NUMBER, permit_number.as_str());
            row.insert(DETAIL_PAGE_URL, detail_url.as_str());
            for (key, value) in source.iter() {
                if key == PERMIT_NUMBER || key == DETAIL_PAGE_URL {
                    // The owner columns stay the parent link; the row's own value moves aside.
                    row.insert(format!("Row.{key}"), value);
                } else {
                    row.insert(key, value);
                }
            }
            rows.push(row);
        }
    }
    rows
}

/// Lays out every sheet in memory. The master sheet is always present; a
/// sub-table sheet only when some permit has rows for it.
pub fn plan_workbook(results: &[SearchResult]) -> Result<WorkbookPlan, ExportError> {
    let master_rows = results.iter().map(master_row).collect::<Result<Vec<_>, _>>()?;
    let mut sheets = vec![sheet_from_rows(MASTER_SHEET, master_rows)];
    for kind in SubTableKind::ALL {
        let rows = sub_table_rows(results, kind);
        if rows.is_empty() {
            debug!(sheet = kind.sheet_name(), "no rows; sheet omitted");
            continue;
        }
        sheets.push(sheet_from_rows(kind.sheet_name(), rows));
    }
    Ok(WorkbookPlan { sheets })
}

pub fn render_workbook(plan: &WorkbookPlan) -> Result<Vec<u8>, ExportError> {
    let mut workbook = Workbook::new();
    let header_format = Format::new().set_bold();
    for sheet in &plan.sheets {
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(sheet.name.as_str())?;
        for (col, header) in sheet.headers.iter().enumerate() {
            worksheet.write_string_with_format(0, col as u16, header.as_str(), &header_format)?;
        }
        for (r, cells) in sheet.rows.iter().enumerate() {
            for (col, value) in cells.iter().enumerate() {
                if value.is_empty() {
                    continue;
                }
                worksheet.write_string(r as u32 + 1, col as u16, value.as_str())?;
            }
        }
    }
    Ok(workbook.save_to_buffer()?)
}

pub fn build_workbook(results: &[SearchResult]) -> Result<Vec<u8>, ExportError> {
    render_workbook(&plan_workbook(results)?)
}

pub fn workbook_file_name(jurisdiction: Jurisdiction) -> String {
    format!("{}_permits.xlsx", jurisdiction.slug())
}

#[cfg(test)]
mod tests {
    use super::*;
    use permx_core::{CanonicalPermit, DetailBundle};
    use serde_json::json;

    fn result(index: usize, number: &str, fees: Vec<Row>) -> SearchResult {
        let mut permit = CanonicalPermit::new(Jurisdiction::Burien, number);
        permit.detail_url = format!("https://example.test/{number}");
        permit.applied_date = 1_710_460_800_000;
        let mut bundle = DetailBundle::empty(permit.permit_ref());
        bundle.fees = fees;
        SearchResult::new(index, permit, bundle)
    }

    #[test]
    fn fee_headers_are_the_first_seen_union() {
        let results = vec![
            result(0, "A-1", vec![Row::from_iter([("A", "1"), ("B", "2")])]),
            result(1, "A-2", vec![Row::from_iter([("C", "3"), ("D", "4")])]),
        ];
        let plan = plan_workbook(&results).unwrap();
        let fees = plan.sheet("Fees").unwrap();
        assert_eq!(fees.headers, vec!["PermitNumber", "DetailPageUrl", "A", "B", "C", "D"]);
        assert_eq!(fees.rows[0][2..], ["1", "2", "", ""]);
        assert_eq!(fees.rows[1][2..], ["", "", "3", "4"]);
        assert_eq!(fees.rows[1][0], "A-2");
    }

    #[test]
    fn sub_table_rows_keep_the_owner_link() {
        let mut owner = result(0, "PLN24-0042", vec![]);
        owner.scraped_details.related_permits.push(Row::from_iter([
            ("PermitNumber", "BLD23-0001"),
            ("Status", "Finaled"),
        ]));
        let plan = plan_workbook(&[owner]).unwrap();
        let related = plan.sheet(SubTableKind::RelatedPermits.sheet_name()).unwrap();
        assert_eq!(related.headers, vec!["PermitNumber", "DetailPageUrl", "Row.PermitNumber", "Status"]);
        assert_eq!(
            related.rows[0],
            vec!["PLN24-0042", "https://example.test/PLN24-0042", "BLD23-0001", "Finaled"]
        );
    }

    #[test]
    fn empty_sub_tables_produce_no_sheet() {
        let plan = plan_workbook(&[result(0, "A-1", vec![])]).unwrap();
        let names: Vec<_> = plan.sheets.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Permits"]);
    }

    #[test]
    fn master_sheet_keeps_result_order_and_flattens_identity() {
        let mut first = result(0, "A-1", vec![]);
        first.scraped_details.summary.left.insert("Applied Date", "03/15/2024");
        first.scraped_details.summary.right.insert("Status", "Issued");
        let results = vec![first, result(1, "A-2", vec![]), result(2, "A-3", vec![])];
        let plan = plan_workbook(&results).unwrap();
        let master = plan.sheet(MASTER_SHEET).unwrap();

        assert_eq!(master.headers[..2], ["PermitNumber", "DetailPageUrl"]);
        let col = |name: &str| master.headers.iter().position(|h| h == name).unwrap();
        let numbers: Vec<_> = master.rows.iter().map(|r| r[0].as_str()).collect();
        assert_eq!(numbers, vec!["A-1", "A-2", "A-3"]);
        assert_eq!(master.rows[0][col("jurisdiction")], "burien");
        assert_eq!(master.rows[0][col("appliedDate")], "2024-03-15");
        assert_eq!(master.rows[0][col("issuedDate")], "");
        assert_eq!(master.rows[0][col("summary.left.Applied Date")], "03/15/2024");
        assert_eq!(master.rows[0][col("summary.right.Status")], "Issued");
        assert_eq!(master.rows[1][col("summary.right.Status")], "");
    }

    #[test]
    fn nested_values_are_dot_joined_and_arrays_joined() {
        let mut row = Row::new();
        flatten_json(
            "",
            &json!({"a": {"b": {"c": 1}}, "tags": ["x", "y"], "mixed": [{"k": 1}], "none": null}),
            &mut row,
        );
        assert_eq!(row.get("a.b.c"), Some("1"));
        assert_eq!(row.get("tags"), Some("x; y"));
        assert_eq!(row.get("mixed"), Some(r#"[{"k":1}]"#));
        assert_eq!(row.get("none"), Some(""));
    }

    #[test]
    fn oversized_cells_are_truncated_with_marker() {
        let long = "z".repeat(CELL_LIMIT + 10);
        let plan = plan_workbook(&[result(0, "A-1", vec![Row::from_iter([("Notes", long.as_str())])])]).unwrap();
        let cell = &plan.sheet("Fees").unwrap().rows[0][2];
        assert_eq!(cell.chars().count(), CELL_LIMIT);
        assert!(cell.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn rendered_workbook_is_an_xlsx_archive() {
        let bytes = build_workbook(&[result(0, "A-1", vec![Row::from_iter([("Fee", "Plan review")])])]).unwrap();
        assert_eq!(&bytes[..2], b"PK");
        assert_eq!(workbook_file_name(Jurisdiction::Burien), "burien_permits.xlsx");
    }
}
