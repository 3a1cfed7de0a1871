//! PDF text, table and metadata extraction.
//!
//! Page text comes from `pdf-extract`; document metadata and page count from
//! `lopdf`. Tables are detected from page text: a run of at least two lines
//! that each split into two or more cells on wide gaps. The first line of a
//! run is its header.

use std::sync::LazyLock;

use lopdf::{Dictionary, Document, Object};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use snowcrawl_core::error::AppError;
use snowcrawl_core::models::PdfOptions;

/// Metadata keys reported, as (output name, PDF Info key).
const INFO_FIELDS: [(&str, &[u8]); 7] = [
    ("title", b"Title"),
    ("author", b"Author"),
    ("subject", b"Subject"),
    ("creator", b"Creator"),
    ("producer", b"Producer"),
    ("creation_date", b"CreationDate"),
    ("modification_date", b"ModDate"),
];

// Cells are separated by a tab or by two or more spaces.
static CELL_GAP: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\t+| {2,}").ok());

/// A parsed PDF.
#[derive(Debug, Clone)]
pub struct PdfDocument {
    pages: Vec<String>,
    metadata: Map<String, Value>,
}

/// A table found on a page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PdfTable {
    pub page: usize,
    pub table_index: usize,
    pub headers: Vec<String>,
    /// Data rows keyed by header; `column_N` where a header is missing.
    pub rows: Vec<Map<String, Value>>,
    /// Every line of the table, header included, as cells.
    pub raw: Vec<Vec<String>>,
}

impl PdfDocument {
    pub fn parse(bytes: &[u8]) -> Result<Self, AppError> {
        let doc = Document::load_mem(bytes)
            .map_err(|e| AppError::Extraction(format!("unreadable PDF: {e}")))?;
        let page_count = doc.get_pages().len();

        let mut pages = match pdf_extract::extract_text_from_mem_by_pages(bytes) {
            Ok(pages) => pages,
            Err(e) => {
                tracing::warn!(error = %e, "PDF text extraction failed, continuing without text");
                Vec::new()
            }
        };
        pages.resize(page_count.max(pages.len()), String::new());

        let mut metadata = info_fields(&doc);
        metadata.insert("page_count".into(), Value::from(pages.len()));

        Ok(Self { pages, metadata })
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Text of the selected pages, joined by blank lines; `None` when the
    /// range selects no page.
    pub fn text(&self, options: Option<&PdfOptions>) -> Option<String> {
        let range = options.cloned().unwrap_or_default().pages(self.page_count())?;
        Some(
            self.pages[range]
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join("\n\n"),
        )
    }

    pub fn tables(&self, options: Option<&PdfOptions>) -> Vec<PdfTable> {
        let Some(range) = options.cloned().unwrap_or_default().pages(self.page_count()) else {
            return Vec::new();
        };
        range
            .flat_map(|page| detect_tables(page, &self.pages[page]))
            .collect()
    }

    pub fn metadata(&self) -> Value {
        Value::Object(self.metadata.clone())
    }
}

/// Shape the tables of a `pdf_table` query.
///
/// `table_index` selects one table when in range; otherwise a lone table is
/// returned as is and several tables as a list. `flatten` returns only data
/// rows. An expression picks that column from the rows of a single table.
pub fn select_tables(tables: Vec<PdfTable>, expression: &str, options: Option<&PdfOptions>) -> TableSelection {
    let options = options.cloned().unwrap_or_default();
    let mut tables = tables;

    let single = match options.table_index {
        Some(i) if i < tables.len() => Some(tables.swap_remove(i)),
        _ if tables.len() == 1 => tables.pop(),
        _ => None,
    };

    if options.flatten {
        let rows: Vec<Value> = match single {
            Some(t) => t.rows.into_iter().map(Value::Object).collect(),
            None => tables
                .into_iter()
                .flat_map(|t| t.rows)
                .map(Value::Object)
                .collect(),
        };
        return TableSelection::Rows(rows);
    }

    match single {
        Some(table) if !expression.is_empty() => TableSelection::Column(
            table
                .rows
                .into_iter()
                .filter_map(|mut row| row.remove(expression))
                .collect(),
        ),
        Some(table) => TableSelection::Table(to_value(&table)),
        None if tables.is_empty() => TableSelection::Empty,
        None => TableSelection::Tables(tables.iter().map(to_value).collect()),
    }
}

/// What a `pdf_table` query produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TableSelection {
    Empty,
    Table(Value),
    Tables(Vec<Value>),
    Rows(Vec<Value>),
    Column(Vec<Value>),
}

fn to_value(table: &PdfTable) -> Value {
    serde_json::to_value(table).unwrap_or(Value::Null)
}

/// Find tables in the text of one page.
pub fn detect_tables(page: usize, text: &str) -> Vec<PdfTable> {
    let mut tables = Vec::new();
    let mut run: Vec<Vec<String>> = Vec::new();

    for line in text.lines().chain(std::iter::once("")) {
        let cells = split_cells(line);
        if cells.len() >= 2 {
            run.push(cells);
            continue;
        }
        if run.len() >= 2 {
            tables.push(build_table(page, tables.len(), std::mem::take(&mut run)));
        }
        run.clear();
    }
    tables
}

fn split_cells(line: &str) -> Vec<String> {
    let Some(gap) = CELL_GAP.as_ref() else {
        return Vec::new();
    };
    gap.split(line.trim())
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

fn build_table(page: usize, table_index: usize, raw: Vec<Vec<String>>) -> PdfTable {
    let headers = raw.first().cloned().unwrap_or_default();
    let rows = raw
        .iter()
        .skip(1)
        .map(|cells| {
            cells
                .iter()
                .enumerate()
                .map(|(i, cell)| {
                    let key = headers
                        .get(i)
                        .map(|h| h.replace('\n', " ").trim().to_string())
                        .filter(|h| !h.is_empty())
                        .unwrap_or_else(|| format!("column_{i}"));
                    (key, Value::String(cell.clone()))
                })
                .collect()
        })
        .collect();
    PdfTable {
        page,
        table_index,
        headers,
        rows,
        raw,
    }
}

fn info_fields(doc: &Document) -> Map<String, Value> {
    let info = doc
        .trailer
        .get(b"Info")
        .ok()
        .and_then(|obj| match obj {
            Object::Reference(id) => doc.get_object(*id).ok(),
            other => Some(other),
        })
        .and_then(|obj| obj.as_dict().ok());

    INFO_FIELDS
        .iter()
        .map(|(name, key)| {
            let value = info.and_then(|d| info_string(d, key)).unwrap_or_default();
            (name.to_string(), Value::String(value))
        })
        .collect()
}

fn info_string(dict: &Dictionary, key: &[u8]) -> Option<String> {
    match dict.get(key).ok()? {
        Object::String(bytes, _) => Some(decode_pdf_string(bytes)),
        Object::Name(name) => Some(String::from_utf8_lossy(name).into_owned()),
        _ => None,
    }
}

/// PDF text strings are UTF-16BE with a byte-order mark, or a Latin-1
/// superset otherwise.
fn decode_pdf_string(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    bytes.iter().map(|&b| char::from(b)).collect()
}
