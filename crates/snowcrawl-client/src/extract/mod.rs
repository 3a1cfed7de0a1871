//! Query extraction engine.
//!
//! Runs a batch of validated queries against one fetched document. The
//! document is parsed at most once per batch and format: one HTML tree for
//! every XPath query, one JSON value for every JSONPath query, one PDF for
//! every PDF query. A query that fails or does not apply to the content
//! yields `None` without affecting the others.

pub mod jsonpath;
pub mod pattern;
pub mod pdf;
pub mod xpath;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use snowcrawl_core::error::AppError;
use snowcrawl_core::models::{ExtractionMap, ExtractionResult, Query, QueryType, is_pdf};
use snowcrawl_core::traits::Extractor;

use self::pdf::{PdfDocument, TableSelection};
use self::xpath::XPathDocument;

/// Default wall-clock budget for a single regex query.
pub const DEFAULT_REGEX_BUDGET: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct QueryEngine {
    regex_budget: Duration,
}

impl Default for QueryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryEngine {
    pub fn new() -> Self {
        Self {
            regex_budget: DEFAULT_REGEX_BUDGET,
        }
    }

    pub fn with_regex_budget(mut self, budget: Duration) -> Self {
        self.regex_budget = budget;
        self
    }

    async fn extract_text(&self, content: &[u8], queries: &[Query]) -> ExtractionMap {
        let text: Arc<str> = Arc::from(String::from_utf8_lossy(content));
        let mut xpath_results = evaluate_xpaths(&text, queries).into_iter();
        let mut json: Option<Result<Value, String>> = None;
        let mut out = ExtractionMap::new();

        for query in queries {
            let result = match query.query_type {
                QueryType::Xpath => xpath_results
                    .next()
                    .unwrap_or_else(|| Err(AppError::Extraction("missing XPath result".into())))
                    .map(|m| ExtractionResult::from_strings(m, query.join)),
                QueryType::Regex => self
                    .run_regex(Arc::clone(&text), query)
                    .await,
                QueryType::Jsonpath => {
                    let parsed = json.get_or_insert_with(|| {
                        serde_json::from_str(&text).map_err(|e| e.to_string())
                    });
                    match parsed {
                        Ok(doc) => jsonpath::evaluate(doc, &query.expression)
                            .map(|m| ExtractionResult::from_matches(m, query.join)),
                        Err(e) => Err(AppError::Extraction(format!("content is not JSON: {e}"))),
                    }
                }
                QueryType::PdfText | QueryType::PdfTable | QueryType::PdfMetadata => {
                    tracing::warn!(query = %query.name, kind = query.query_type.as_str(), "PDF query on non-PDF content");
                    Ok(None)
                }
                QueryType::Unknown => {
                    tracing::warn!(query = %query.name, "Unknown query type");
                    Ok(None)
                }
            };
            out.insert(query.name.clone(), settle(query, result));
        }
        out
    }

    async fn extract_pdf(&self, content: &[u8], queries: &[Query]) -> ExtractionMap {
        let bytes = content.to_vec();
        // pdf-extract can panic on malformed input; a blocking task contains it.
        let doc = match tokio::task::spawn_blocking(move || PdfDocument::parse(&bytes)).await {
            Ok(Ok(doc)) => Ok(doc),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(AppError::Extraction(format!("PDF parsing aborted: {e}"))),
        };
        if let Err(e) = &doc {
            tracing::warn!(error = %e, "Could not parse PDF");
        }

        let mut out = ExtractionMap::new();
        for query in queries {
            let result = match (&doc, query.query_type) {
                (_, QueryType::Xpath | QueryType::Jsonpath) => {
                    tracing::warn!(query = %query.name, kind = query.query_type.as_str(), "Query type does not apply to PDF content");
                    Ok(None)
                }
                (_, QueryType::Unknown) => {
                    tracing::warn!(query = %query.name, "Unknown query type");
                    Ok(None)
                }
                (Err(e), _) => Err(AppError::Extraction(e.to_string())),
                (Ok(doc), QueryType::Regex) => match doc.text(None) {
                    Some(text) => self.run_regex(Arc::from(text), query).await,
                    None => Ok(None),
                },
                (Ok(doc), QueryType::PdfText) => self.pdf_text(doc, query).await,
                (Ok(doc), QueryType::PdfTable) => Ok(pdf_table(doc, query)),
                (Ok(doc), QueryType::PdfMetadata) => {
                    Ok(Some(ExtractionResult::Structured(doc.metadata())))
                }
            };
            out.insert(query.name.clone(), settle(query, result));
        }
        out
    }

    async fn run_regex(&self, text: Arc<str>, query: &Query) -> Result<Option<ExtractionResult>, AppError> {
        let matches = pattern::find_all(text, &query.expression, self.regex_budget).await?;
        Ok(ExtractionResult::from_matches(matches, query.join))
    }

    async fn pdf_text(&self, doc: &PdfDocument, query: &Query) -> Result<Option<ExtractionResult>, AppError> {
        let Some(text) = doc.text(query.pdf.as_ref()) else {
            return Ok(None);
        };
        if query.expression.is_empty() {
            return Ok((!text.trim().is_empty()).then(|| ExtractionResult::Structured(Value::String(text))));
        }
        self.run_regex(Arc::from(text), query).await
    }
}

impl Extractor for QueryEngine {
    async fn extract(
        &self,
        content: &[u8],
        content_type: Option<&str>,
        queries: &[Query],
    ) -> ExtractionMap {
        if is_pdf(content, content_type) {
            self.extract_pdf(content, queries).await
        } else {
            self.extract_text(content, queries).await
        }
    }
}

/// Evaluate every XPath query of the batch against one parsed tree.
///
/// Synchronous: the tree is not `Send` and must not live across an await.
fn evaluate_xpaths(html: &str, queries: &[Query]) -> Vec<Result<Vec<String>, AppError>> {
    let expressions: Vec<&str> = queries
        .iter()
        .filter(|q| q.query_type == QueryType::Xpath)
        .map(|q| q.expression.as_str())
        .collect();
    if expressions.is_empty() {
        return Vec::new();
    }
    let doc = XPathDocument::parse(html);
    expressions.into_iter().map(|e| doc.evaluate(e)).collect()
}

fn pdf_table(doc: &PdfDocument, query: &Query) -> Option<ExtractionResult> {
    let tables = doc.tables(query.pdf.as_ref());
    match pdf::select_tables(tables, &query.expression, query.pdf.as_ref()) {
        TableSelection::Empty => None,
        TableSelection::Table(table) => Some(ExtractionResult::Structured(table)),
        TableSelection::Tables(tables) => Some(ExtractionResult::Structured(Value::Array(tables))),
        TableSelection::Rows(rows) if rows.is_empty() => None,
        TableSelection::Rows(rows) => Some(ExtractionResult::Structured(Value::Array(rows))),
        TableSelection::Column(values) => ExtractionResult::from_matches(values, query.join),
    }
}

/// Log a per-query failure and turn it into a null result.
fn settle(query: &Query, result: Result<Option<ExtractionResult>, AppError>) -> Option<ExtractionResult> {
    result.unwrap_or_else(|e| {
        tracing::warn!(query = %query.name, kind = query.query_type.as_str(), error = %e, "Query failed");
        None
    })
}
