use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::escalation::EscalationAttempt;
use crate::tier::Tier;

/// The kind of engine a query runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Xpath,
    Regex,
    Jsonpath,
    PdfText,
    PdfTable,
    PdfMetadata,
    /// Any type name this build does not know. Rejected by validation and
    /// yields a null result if it reaches the extraction engine.
    #[serde(other)]
    Unknown,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Xpath => "xpath",
            QueryType::Regex => "regex",
            QueryType::Jsonpath => "jsonpath",
            QueryType::PdfText => "pdf_text",
            QueryType::PdfTable => "pdf_table",
            QueryType::PdfMetadata => "pdf_metadata",
            QueryType::Unknown => "unknown",
        }
    }

    pub fn is_pdf(&self) -> bool {
        matches!(
            self,
            QueryType::PdfText | QueryType::PdfTable | QueryType::PdfMetadata
        )
    }
}

/// Options that only apply to PDF queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdfOptions {
    /// `[start, end]` zero-based inclusive page indices, or `[page]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_range: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_index: Option<usize>,
    #[serde(default)]
    pub flatten: bool,
}

impl PdfOptions {
    /// Resolve the configured range against a document of `page_count` pages.
    ///
    /// Returns `None` when the range selects nothing.
    pub fn pages(&self, page_count: usize) -> Option<std::ops::RangeInclusive<usize>> {
        if page_count == 0 {
            return None;
        }
        let last = page_count - 1;
        let (start, end) = match self.page_range.as_deref() {
            None | Some([]) => (0, last),
            Some([page]) => (*page, *page),
            Some([start, end, ..]) => (*start, (*end).min(last)),
        };
        (start <= end && start <= last).then_some(start..=end)
    }
}

/// A named extraction query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub name: String,
    #[serde(rename = "type")]
    pub query_type: QueryType,
    /// XPath / regex / JSONPath expression. Optional for PDF queries, where
    /// it is a regex filter (`pdf_text`) or a column name (`pdf_table`).
    #[serde(default, alias = "query", alias = "selector")]
    pub expression: String,
    #[serde(default)]
    pub join: bool,
    #[serde(default, alias = "pdf_config", skip_serializing_if = "Option::is_none")]
    pub pdf: Option<PdfOptions>,
}

impl Query {
    pub fn new(name: impl Into<String>, query_type: QueryType, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            query_type,
            expression: expression.into(),
            join: false,
            pdf: None,
        }
    }

    pub fn joined(mut self) -> Self {
        self.join = true;
        self
    }

    pub fn with_pdf(mut self, pdf: PdfOptions) -> Self {
        self.pdf = Some(pdf);
        self
    }
}

/// The value extracted for one query.
///
/// Always a list of matches unless the query asked for `join`, in which case
/// matches are concatenated with `|`. PDF tables and metadata are structured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtractionResult {
    Joined(String),
    Matches(Vec<serde_json::Value>),
    Structured(serde_json::Value),
}

impl ExtractionResult {
    /// Build a result from raw matches; `None` when nothing matched.
    pub fn from_matches(matches: Vec<serde_json::Value>, join: bool) -> Option<Self> {
        if matches.is_empty() {
            return None;
        }
        if join {
            let joined = matches
                .iter()
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join("|");
            return Some(ExtractionResult::Joined(joined));
        }
        Some(ExtractionResult::Matches(matches))
    }

    pub fn from_strings(matches: Vec<String>, join: bool) -> Option<Self> {
        Self::from_matches(
            matches.into_iter().map(serde_json::Value::String).collect(),
            join,
        )
    }
}

/// Query name to its result; `None` means no match or a per-query failure.
pub type ExtractionMap = BTreeMap<String, Option<ExtractionResult>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlStatus {
    Success,
    Error,
}

/// Per-URL state reported to the progress sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlStatus {
    Processing,
    Finished,
    Error,
}

/// Per-URL outcome of a crawl.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlResult {
    pub url: String,
    pub status: CrawlStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default)]
    pub data: ExtractionMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier_used: Option<Tier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub escalation_log: Vec<EscalationAttempt>,
    /// SHA-256 of the fetched body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub crawled_at: DateTime<Utc>,
}

impl CrawlResult {
    pub fn failed(url: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: CrawlStatus::Error,
            http_code: None,
            content_type: None,
            data: ExtractionMap::new(),
            error: Some(error.into()),
            tier_used: None,
            escalation_log: Vec::new(),
            content_hash: None,
            crawled_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CrawlStatus::Success
    }
}

/// Job progress counters, persisted at a fixed cadence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub percentage: f64,
}

impl JobProgress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    pub fn record(&mut self, success: bool) {
        self.processed += 1;
        if !success {
            self.failed += 1;
        }
        self.percentage = if self.total == 0 {
            100.0
        } else {
            (self.processed as f64 / self.total as f64 * 10000.0).round() / 100.0
        };
    }
}

/// A page returned by a tier strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    /// URL after redirects.
    pub final_url: String,
}

impl FetchedPage {
    pub fn html(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: Some("text/html; charset=utf-8".into()),
            body: body.into().into_bytes(),
            final_url: String::new(),
        }
    }

    pub fn is_pdf(&self) -> bool {
        is_pdf(&self.body, self.content_type.as_deref())
    }

    /// `application/json` and `+json` media types.
    pub fn is_json(&self) -> bool {
        self.content_type.as_deref().is_some_and(|ct| {
            let media = ct.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
            media == "application/json" || media.ends_with("+json")
        })
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// PDF detection by Content-Type or the `%PDF-` magic bytes.
pub fn is_pdf(body: &[u8], content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("application/pdf"))
        || body.starts_with(b"%PDF-")
}

/// Compute a SHA-256 hash of some content, returned as 64-char hex.
pub fn compute_hash(content: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_ref());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_compute_hash_consistency() {
        let h1 = compute_hash("hello world");
        let h2 = compute_hash(b"hello world".to_vec());
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(compute_hash("hello"), compute_hash("world"));
    }

    #[test]
    fn test_query_accepts_aliases() {
        let q: Query = serde_json::from_value(json!({
            "name": "title",
            "type": "xpath",
            "query": "//h1/text()",
            "join": true
        }))
        .unwrap();
        assert_eq!(q.query_type, QueryType::Xpath);
        assert_eq!(q.expression, "//h1/text()");
        assert!(q.join);

        let q: Query = serde_json::from_value(json!({
            "name": "rows",
            "type": "pdf_table",
            "pdf_config": {"page_range": [0, 2], "flatten": true}
        }))
        .unwrap();
        assert_eq!(q.expression, "");
        assert!(q.pdf.unwrap().flatten);
    }

    #[test]
    fn test_unknown_query_type_deserializes() {
        let q: Query =
            serde_json::from_value(json!({"name": "x", "type": "css", "query": "div"})).unwrap();
        assert_eq!(q.query_type, QueryType::Unknown);
    }

    #[test]
    fn test_join_flag_must_be_boolean() {
        let res = serde_json::from_value::<Query>(
            json!({"name": "x", "type": "regex", "query": "a", "join": "yes"}),
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_extraction_result_join() {
        let joined = ExtractionResult::from_strings(
            vec!["Feature 1".into(), "Feature 2".into(), "Feature 3".into()],
            true,
        );
        assert_eq!(
            joined,
            Some(ExtractionResult::Joined("Feature 1|Feature 2|Feature 3".into()))
        );
        assert_eq!(ExtractionResult::from_strings(vec![], true), None);
        assert_eq!(ExtractionResult::from_strings(vec![], false), None);
    }

    #[test]
    fn test_single_match_stays_a_list() {
        let res = ExtractionResult::from_strings(vec!["only".into()], false).unwrap();
        assert_eq!(serde_json::to_value(&res).unwrap(), json!(["only"]));
    }

    #[test]
    fn test_pdf_page_range() {
        let all = PdfOptions::default();
        assert_eq!(all.pages(3), Some(0..=2));
        assert_eq!(all.pages(0), None);

        let single = PdfOptions {
            page_range: Some(vec![1]),
            ..Default::default()
        };
        assert_eq!(single.pages(3), Some(1..=1));

        let clamped = PdfOptions {
            page_range: Some(vec![1, 10]),
            ..Default::default()
        };
        assert_eq!(clamped.pages(3), Some(1..=2));

        let outside = PdfOptions {
            page_range: Some(vec![5, 6]),
            ..Default::default()
        };
        assert_eq!(outside.pages(3), None);
    }

    #[test]
    fn test_progress_percentage() {
        let mut p = JobProgress::new(3);
        p.record(true);
        p.record(false);
        assert_eq!(p.processed, 2);
        assert_eq!(p.failed, 1);
        assert_eq!(p.percentage, 66.67);
        p.record(true);
        assert_eq!(p.percentage, 100.0);
    }

    #[test]
    fn test_is_pdf_detection() {
        assert!(is_pdf(b"%PDF-1.7 ...", None));
        assert!(is_pdf(b"", Some("Application/PDF")));
        assert!(!is_pdf(b"<html>", Some("text/html")));
    }
}
