//! Field extraction from fetched observation pages.
//!
//! A fetched page is pre-parsed once into cell grids, concatenated script
//! text, and flattened body text. Extraction then runs an ordered list of
//! strategies over that structure — first success wins, and a later
//! strategy never overwrites an earlier one:
//!
//! 1. exact-slot scan: a row whose date/time cells equal the target
//!    verbatim, fields read from fixed column positions;
//! 2. latest-unseen scan: newest row (across all qualifying tables) whose
//!    timestamp is not already archived and whose primary field is
//!    plausible;
//! 3. script-embedded series: label-anchored numeric arrays inside the
//!    page's chart scripts;
//! 4. free-text fallback: label-anchored single numbers over the
//!    flattened document text.

use std::collections::BTreeMap;

use chrono::{NaiveDateTime, NaiveTime};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::reconcile::Slot;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to parse selector: {0}")]
    Selector(String),
}

// ---------------------------------------------------------------------------
// Pre-parsed document
// ---------------------------------------------------------------------------

/// One `<table>` as a grid of trimmed cell texts (`th` and `td` alike).
#[derive(Debug, Clone)]
pub struct Table {
    pub rows: Vec<Vec<String>>,
}

/// A fetched page, parsed once and shared by all strategies.
#[derive(Debug, Clone)]
pub struct Document {
    pub tables: Vec<Table>,
    pub script_text: String,
    pub body_text: String,
}

impl Document {
    pub fn parse(html: &str) -> Result<Document, ExtractError> {
        let parsed = Html::parse_document(html);
        let table_sel = selector("table")?;
        let row_sel = selector("tr")?;
        let cell_sel = selector("th, td")?;
        let script_sel = selector("script")?;

        let mut tables = Vec::new();
        for table in parsed.select(&table_sel) {
            let rows: Vec<Vec<String>> = table
                .select(&row_sel)
                .map(|row| {
                    row.select(&cell_sel)
                        .map(|cell| cell.text().collect::<String>().trim().to_string())
                        .collect()
                })
                .collect();
            tables.push(Table { rows });
        }

        let script_text: String = parsed
            .select(&script_sel)
            .map(|s| s.text().collect::<String>())
            .collect::<Vec<_>>()
            .join("\n");

        let body_text = parsed
            .root_element()
            .text()
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");

        Ok(Document {
            tables,
            script_text,
            body_text,
        })
    }
}

fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector(format!("{:?}", e)))
}

// ---------------------------------------------------------------------------
// Table layout
// ---------------------------------------------------------------------------

/// Fixed column layout of one source endpoint's observation table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableLayout {
    /// A table qualifies only if its header row contains this text.
    /// `None` scans every table.
    pub header_anchor: Option<String>,
    /// Date column, `YYYY/MM/DD`. Rows with a time-only cell inherit the
    /// target slot's date.
    pub date_column: Option<usize>,
    /// Time column, `HH:MM`.
    pub time_column: usize,
    pub fields: Vec<FieldSpec>,
}

/// One extractable field: its key, fixed column position, and the label
/// anchoring the script and free-text strategies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub column: usize,
    pub label: String,
}

impl FieldSpec {
    pub fn new(name: &str, column: usize, label: &str) -> FieldSpec {
        FieldSpec {
            name: name.to_string(),
            column,
            label: label.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Extraction output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    ExactSlot,
    LatestUnseen,
    ScriptSeries,
    FreeText,
}

/// One field's accepted reading plus, when the source exposed it, the
/// chronologically previous value used for change derivation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSample {
    pub latest: f64,
    pub previous: Option<f64>,
}

/// The winning strategy's output for one source document.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldCandidates {
    pub strategy: Strategy,
    /// The accepted row's own timestamp, when one exists. Script and
    /// free-text extraction carry no row timestamp.
    pub row_time: Option<NaiveDateTime>,
    pub values: BTreeMap<String, FieldSample>,
}

// ---------------------------------------------------------------------------
// Strategy driver
// ---------------------------------------------------------------------------

/// Runs the ordered strategies over a parsed document.
///
/// `already_archived` is the idempotency-key lookup used by the
/// latest-unseen scan; `in_range` pre-screens that scan's primary field so
/// a reference line or garbage row is never adopted as "latest".
pub fn extract(
    doc: &Document,
    layout: &TableLayout,
    slot: &Slot,
    already_archived: &dyn Fn(NaiveDateTime) -> bool,
    in_range: &dyn Fn(&str, f64) -> bool,
) -> Option<FieldCandidates> {
    let exact = || exact_slot(doc, layout, slot);
    let unseen = || latest_unseen(doc, layout, slot, already_archived, in_range);
    let script = || script_series(doc, layout);
    let text = || free_text(doc, layout);

    let strategies: [(&str, &dyn Fn() -> Option<FieldCandidates>); 4] = [
        ("exact_slot", &exact),
        ("latest_unseen", &unseen),
        ("script_series", &script),
        ("free_text", &text),
    ];

    for (name, strategy) in strategies {
        if let Some(candidates) = strategy() {
            if candidates.strategy == Strategy::ExactSlot {
                debug!(strategy = name, fields = candidates.values.len(), "extraction hit");
            } else {
                warn!(
                    strategy = name,
                    fields = candidates.values.len(),
                    "exact slot missing, fell back"
                );
            }
            return Some(candidates);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// (a) exact-slot scan
// ---------------------------------------------------------------------------

fn exact_slot(doc: &Document, layout: &TableLayout, slot: &Slot) -> Option<FieldCandidates> {
    let date_s = slot.date_str();
    let time_s = slot.time_str();
    for table in qualifying(doc, layout) {
        for (i, cells) in table.rows.iter().enumerate() {
            let time_ok = cells.get(layout.time_column) == Some(&time_s);
            if !time_ok {
                continue;
            }
            let date_ok = match layout.date_column {
                Some(col) => cells.get(col) == Some(&date_s),
                None => true,
            };
            if !date_ok {
                continue;
            }
            let previous = previous_data_row(&table.rows, i, layout, slot);
            let values = collect_fields(cells, previous, layout);
            if values.is_empty() {
                // The slot row exists but every cell is a gap marker.
                continue;
            }
            return Some(FieldCandidates {
                strategy: Strategy::ExactSlot,
                row_time: Some(slot.naive()),
                values,
            });
        }
    }
    None
}

// ---------------------------------------------------------------------------
// (b) latest-unseen-row scan
// ---------------------------------------------------------------------------

fn latest_unseen(
    doc: &Document,
    layout: &TableLayout,
    slot: &Slot,
    already_archived: &dyn Fn(NaiveDateTime) -> bool,
    in_range: &dyn Fn(&str, f64) -> bool,
) -> Option<FieldCandidates> {
    let primary = layout.fields.first()?;
    let mut best: Option<(NaiveDateTime, FieldCandidates)> = None;

    for table in qualifying(doc, layout) {
        // Reverse chronological: the newest acceptable row per table.
        for i in (0..table.rows.len()).rev() {
            let cells = &table.rows[i];
            let Some(row_time) = parse_row_time(cells, layout, slot) else {
                continue;
            };
            if already_archived(row_time) {
                debug!(%row_time, "row already archived, skipping");
                continue;
            }
            let Some(value) = cells.get(primary.column).and_then(|c| parse_number(c)) else {
                continue;
            };
            if !in_range(&primary.name, value) {
                continue;
            }
            let previous = previous_data_row(&table.rows, i, layout, slot);
            let values = collect_fields(cells, previous, layout);
            if values.is_empty() {
                continue;
            }
            let newer = best.as_ref().map(|(t, _)| row_time > *t).unwrap_or(true);
            if newer {
                best = Some((
                    row_time,
                    FieldCandidates {
                        strategy: Strategy::LatestUnseen,
                        row_time: Some(row_time),
                        values,
                    },
                ));
            }
            break;
        }
    }
    best.map(|(_, candidates)| candidates)
}

// ---------------------------------------------------------------------------
// (c) script-embedded series
// ---------------------------------------------------------------------------

fn script_series(doc: &Document, layout: &TableLayout) -> Option<FieldCandidates> {
    let mut values = BTreeMap::new();
    for spec in &layout.fields {
        if let Some(series) = label_series(&doc.script_text, &spec.label) {
            if let Some(&latest) = series.last() {
                let previous = series
                    .len()
                    .checked_sub(2)
                    .map(|i| series[i]);
                values.insert(spec.name.clone(), FieldSample { latest, previous });
            }
        }
    }
    if values.is_empty() {
        None
    } else {
        Some(FieldCandidates {
            strategy: Strategy::ScriptSeries,
            row_time: None,
            values,
        })
    }
}

/// Finds the first numeric array following `label` in script text, e.g.
/// `"貯水位" ... [36.70, 36.72, 36.74]`.
fn label_series(script: &str, label: &str) -> Option<Vec<f64>> {
    let at = script.find(label)?;
    let rest = &script[at + label.len()..];
    let open = rest.find('[')?;
    let close = rest[open..].find(']')? + open;
    let inner = &rest[open + 1..close];
    let series: Vec<f64> = inner
        .split(',')
        .filter_map(|v| v.trim().parse::<f64>().ok())
        .collect();
    if series.is_empty() { None } else { Some(series) }
}

// ---------------------------------------------------------------------------
// (d) free-text fallback
// ---------------------------------------------------------------------------

fn free_text(doc: &Document, layout: &TableLayout) -> Option<FieldCandidates> {
    let mut values = BTreeMap::new();
    for spec in &layout.fields {
        if let Some(latest) = label_number(&doc.body_text, &spec.label) {
            values.insert(
                spec.name.clone(),
                FieldSample {
                    latest,
                    previous: None,
                },
            );
        }
    }
    if values.is_empty() {
        None
    } else {
        Some(FieldCandidates {
            strategy: Strategy::FreeText,
            row_time: None,
            values,
        })
    }
}

/// First number within a short window after `label` in flattened text.
fn label_number(text: &str, label: &str) -> Option<f64> {
    let at = text.find(label)?;
    let window: String = text[at + label.len()..].chars().take(40).collect();
    first_number(&window)
}

fn first_number(text: &str) -> Option<f64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let digits: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    digits.parse::<f64>().ok()
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn qualifying<'a>(
    doc: &'a Document,
    layout: &'a TableLayout,
) -> impl Iterator<Item = &'a Table> {
    doc.tables.iter().filter(move |table| match &layout.header_anchor {
        Some(anchor) => table
            .rows
            .first()
            .map(|row| row.iter().any(|cell| cell.contains(anchor.as_str())))
            .unwrap_or(false),
        None => true,
    })
}

/// The chronologically previous data row, used for change derivation.
fn previous_data_row<'a>(
    rows: &'a [Vec<String>],
    index: usize,
    layout: &TableLayout,
    slot: &Slot,
) -> Option<&'a Vec<String>> {
    let row = rows.get(index.checked_sub(1)?)?;
    parse_row_time(row, layout, slot).map(|_| row)
}

fn collect_fields(
    cells: &[String],
    previous: Option<&Vec<String>>,
    layout: &TableLayout,
) -> BTreeMap<String, FieldSample> {
    let mut values = BTreeMap::new();
    for spec in &layout.fields {
        let Some(latest) = cells.get(spec.column).and_then(|c| parse_number(c)) else {
            continue;
        };
        let previous_value = previous
            .and_then(|p| p.get(spec.column))
            .and_then(|c| parse_number(c));
        values.insert(
            spec.name.clone(),
            FieldSample {
                latest,
                previous: previous_value,
            },
        );
    }
    values
}

/// Parses a row's own timestamp from its date/time cells. A time-only row
/// inherits the target slot's date; the Japanese `24:00` convention maps
/// to midnight of the following day.
pub(crate) fn parse_row_time(
    cells: &[String],
    layout: &TableLayout,
    slot: &Slot,
) -> Option<NaiveDateTime> {
    let time_text = cells.get(layout.time_column)?.as_str();
    let mut date = match layout.date_column.and_then(|col| cells.get(col)) {
        Some(cell) => parse_row_date(cell, slot),
        None => slot.date(),
    };
    let time = if time_text == "24:00" {
        date = date.succ_opt()?;
        NaiveTime::from_hms_opt(0, 0, 0)?
    } else {
        NaiveTime::parse_from_str(time_text, "%H:%M").ok()?
    };
    Some(NaiveDateTime::new(date, time))
}

fn parse_row_date(cell: &str, slot: &Slot) -> chrono::NaiveDate {
    use chrono::{Datelike, NaiveDate};
    if let Ok(date) = NaiveDate::parse_from_str(cell, "%Y/%m/%d") {
        return date;
    }
    // Some layouts render month/day only.
    let with_year = format!("{}/{}", slot.date().year(), cell);
    NaiveDate::parse_from_str(&with_year, "%Y/%m/%d").unwrap_or_else(|_| slot.date())
}

/// Strict numeric cell parse: trims, strips thousands separators, and
/// rejects anything that is not a plain decimal. Gap markers such as
/// `欠測` or `--` come back as `None`.
pub fn parse_number(text: &str) -> Option<f64> {
    let cleaned = text.trim().replace(',', "");
    if cleaned.is_empty() {
        return None;
    }
    let body = cleaned.strip_prefix('-').unwrap_or(cleaned.as_str());
    if body.is_empty()
        || !body.chars().all(|c| c.is_ascii_digit() || c == '.')
        || body.chars().filter(|c| *c == '.').count() > 1
    {
        return None;
    }
    cleaned.parse::<f64>().ok()
}
