use std::net::IpAddr;

use thiserror::Error;

/// Application-wide error types for snowcrawl.
#[derive(Error, Debug)]
pub enum AppError {
    /// The URL failed SSRF / syntax validation and was never fetched.
    #[error("URL validation failed: {0}")]
    InvalidUrl(#[from] UrlError),

    /// A query expression was rejected before execution.
    #[error("Query rejected: {0}")]
    UnsafeQuery(#[from] QueryError),

    /// A tier returned a page carrying bot-protection indicators.
    #[error("Tier {tier} blocked: {}", indicators.join(", "))]
    BlockingDetected { tier: u8, indicators: Vec<String> },

    /// The tier strategy is not configured or not implemented.
    #[error("Tier {tier} not available: {reason}")]
    TierUnavailable { tier: u8, reason: String },

    /// Escalation ran out of tiers; carries the last failure.
    #[error("Scraping failed at Tier {tier}: {reason}")]
    TiersExhausted { tier: u8, reason: String },

    /// HTTP request failed (fetching a page).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Proxy rejected or failed to relay the request.
    #[error("Proxy error: {0}")]
    ProxyError(String),

    /// The job ran past its time budget.
    #[error("Job timed out after {0} seconds")]
    JobTimeout(u64),

    #[error("Job cancelled")]
    JobCancelled,

    /// The job's input lists were rejected as a whole.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid job or runtime configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Content could not be parsed for extraction.
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying within a tier.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::ProxyError(_) => true,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }
}

/// Reasons a URL is refused by the URL safety validator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UrlError {
    #[error("URL must be a non-empty string")]
    Empty,

    #[error("invalid URL format: {0}")]
    Malformed(String),

    #[error("URL scheme '{0}' is not allowed (only http/https)")]
    SchemeNotAllowed(String),

    #[error("URL must contain a valid hostname")]
    MissingHost,

    #[error("URLs targeting localhost are not allowed")]
    Localhost,

    #[error("could not resolve hostname '{host}': {reason}")]
    Unresolvable { host: String, reason: String },

    #[error("SSRF blocked: {host} resolves to private/reserved IP {ip}")]
    Blocked { host: String, ip: IpAddr },
}

/// Reasons a query is refused by the query safety validator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("{0} must be a non-empty string")]
    Empty(&'static str),

    #[error("{what} exceeds maximum length of {max}")]
    TooLong { what: &'static str, max: usize },

    #[error("invalid query name '{0}': only letters, numbers, underscores and hyphens are allowed")]
    InvalidName(String),

    #[error("duplicate query name: {0}")]
    DuplicateName(String),

    #[error("query type must be one of: xpath, regex, jsonpath, pdf_text, pdf_table, pdf_metadata")]
    UnknownType,

    #[error("query '{0}' requires an expression")]
    MissingExpression(String),

    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("XPath function '{0}' is not allowed")]
    FunctionNotAllowed(String),

    #[error("excessive nesting depth {depth} (max {max} levels)")]
    ExcessiveNesting { depth: usize, max: usize },

    #[error("pattern may cause catastrophic backtracking ({0})")]
    BacktrackingRisk(&'static str),

    #[error("pattern is too complex ({found} quantifiers, maximum is {max})")]
    TooComplex { found: usize, max: usize },

    #[error("job must define between 1 and {0} queries")]
    QueryCount(usize),
}
