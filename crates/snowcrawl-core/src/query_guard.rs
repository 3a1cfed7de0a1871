//! Static safety checks for user-supplied query expressions.
//!
//! Every query is validated before it can run: XPath function calls are
//! whitelisted, regexes are screened for backtracking-prone shapes and
//! complexity, JSONPath is shape-checked. The matching engine in
//! `snowcrawl-client` is linear-time and additionally guarded by a time
//! budget, so these checks are a first line of defence, not the only one.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::QueryError;
use crate::models::{Query, QueryType};

pub const MAX_XPATH_LENGTH: usize = 1000;
pub const MAX_XPATH_DEPTH: usize = 20;
pub const MAX_REGEX_LENGTH: usize = 500;
pub const MAX_REGEX_QUANTIFIERS: usize = 5;
pub const MAX_JSONPATH_LENGTH: usize = 1000;
pub const MAX_QUERY_NAME_LENGTH: usize = 100;
pub const MAX_QUERIES_PER_JOB: usize = 50;

/// XPath 1.0 functions and node tests that are safe to evaluate.
pub const ALLOWED_XPATH_FUNCTIONS: &[&str] = &[
    "text",
    "contains",
    "starts-with",
    "ends-with",
    "normalize-space",
    "position",
    "last",
    "count",
    "string-length",
    "concat",
    "substring",
    "substring-before",
    "substring-after",
    "not",
    "and",
    "or",
    "true",
    "false",
    "string",
    "number",
    "boolean",
    "translate",
    "sum",
    "local-name",
    "name",
    "namespace-uri",
    "comment",
    "processing-instruction",
    "node",
];

static XPATH_CALL: LazyLock<Regex> = LazyLock::new(|| static_regex(r"(\w[\w-]*)\s*\("));
static QUERY_NAME: LazyLock<Regex> = LazyLock::new(|| static_regex(r"^[A-Za-z0-9_-]+$"));
static NESTED_QUANTIFIER: LazyLock<Regex> =
    LazyLock::new(|| static_regex(r"\([^)]*[*+]\)[*+]"));
static ALTERNATION_GROUP: LazyLock<Regex> =
    LazyLock::new(|| static_regex(r"\(([^()]*\|[^()]*)\)"));
static QUANTIFIED_ALTERNATION: LazyLock<Regex> =
    LazyLock::new(|| static_regex(r"\([^)]*[*+][^)]*\|[^)]*\)[*+]"));
static QUANTIFIER_CHARS: LazyLock<Regex> = LazyLock::new(|| static_regex(r"[*+?{}\[\]]"));

// Only called with the literals above; `test_static_patterns_compile` forces each one.
fn static_regex(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static pattern compiles")
}

/// Validate an XPath expression. Returns it trimmed.
pub fn validate_xpath(xpath: &str) -> Result<&str, QueryError> {
    let xpath = xpath.trim();
    if xpath.is_empty() {
        return Err(QueryError::Empty("XPath expression"));
    }
    if xpath.chars().count() > MAX_XPATH_LENGTH {
        return Err(QueryError::TooLong {
            what: "XPath expression",
            max: MAX_XPATH_LENGTH,
        });
    }

    let code = strip_string_literals(xpath)?;

    for cap in XPATH_CALL.captures_iter(&code) {
        let func = &cap[1];
        if !ALLOWED_XPATH_FUNCTIONS.contains(&func) {
            return Err(QueryError::FunctionNotAllowed(func.to_string()));
        }
    }

    let depth = bracket_depth(&code, &[('[', ']'), ('(', ')')])?;
    if depth > MAX_XPATH_DEPTH {
        return Err(QueryError::ExcessiveNesting {
            depth,
            max: MAX_XPATH_DEPTH,
        });
    }

    Ok(xpath)
}

/// Validate a regex pattern. Returns it trimmed.
pub fn validate_regex(pattern: &str) -> Result<&str, QueryError> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return Err(QueryError::Empty("regex pattern"));
    }
    if pattern.chars().count() > MAX_REGEX_LENGTH {
        return Err(QueryError::TooLong {
            what: "regex pattern",
            max: MAX_REGEX_LENGTH,
        });
    }

    Regex::new(pattern).map_err(|e| QueryError::Syntax(e.to_string()))?;

    if NESTED_QUANTIFIER.is_match(pattern) {
        return Err(QueryError::BacktrackingRisk("nested quantifiers"));
    }

    for cap in ALTERNATION_GROUP.captures_iter(pattern) {
        let alternatives: Vec<String> = cap[1]
            .split('|')
            .map(|alt| QUANTIFIER_CHARS.replace_all(alt, "").trim().to_string())
            .collect();
        for (i, a) in alternatives.iter().enumerate() {
            for b in &alternatives[i + 1..] {
                if !a.is_empty() && !b.is_empty() && (a.starts_with(b.as_str()) || b.starts_with(a.as_str())) {
                    return Err(QueryError::BacktrackingRisk(
                        "alternation with overlapping patterns",
                    ));
                }
            }
        }
    }

    if QUANTIFIED_ALTERNATION.is_match(pattern) {
        return Err(QueryError::BacktrackingRisk(
            "quantified group with quantified alternation",
        ));
    }

    let found = count_quantifiers(pattern);
    if found > MAX_REGEX_QUANTIFIERS {
        return Err(QueryError::TooComplex {
            found,
            max: MAX_REGEX_QUANTIFIERS,
        });
    }

    Ok(pattern)
}

/// Validate a JSONPath expression. Returns it trimmed.
pub fn validate_jsonpath(path: &str) -> Result<&str, QueryError> {
    let path = path.trim();
    if path.is_empty() {
        return Err(QueryError::Empty("JSONPath expression"));
    }
    if path.chars().count() > MAX_JSONPATH_LENGTH {
        return Err(QueryError::TooLong {
            what: "JSONPath expression",
            max: MAX_JSONPATH_LENGTH,
        });
    }
    if !path.starts_with(['$', '@']) {
        return Err(QueryError::Syntax(
            "JSONPath expression must start with '$' or '@'".into(),
        ));
    }
    let code = strip_string_literals(path)?;
    bracket_depth(&code, &[('[', ']'), ('(', ')')])?;
    Ok(path)
}

/// Validate a whole query: its name, its type and its expression.
///
/// Returns the query as it must be run, with its expression trimmed. The
/// name is checked as given, so padded names are rejected rather than
/// silently renamed.
pub fn validate_query(query: &Query) -> Result<Query, QueryError> {
    let name = query.name.as_str();
    if name.trim().is_empty() {
        return Err(QueryError::Empty("query name"));
    }
    if name.chars().count() > MAX_QUERY_NAME_LENGTH {
        return Err(QueryError::TooLong {
            what: "query name",
            max: MAX_QUERY_NAME_LENGTH,
        });
    }
    if !QUERY_NAME.is_match(name) {
        return Err(QueryError::InvalidName(name.to_string()));
    }

    let expr = query.expression.trim();
    let expr = match query.query_type {
        QueryType::Unknown => return Err(QueryError::UnknownType),
        t if !t.is_pdf() && expr.is_empty() => {
            return Err(QueryError::MissingExpression(name.to_string()));
        }
        QueryType::Xpath => validate_xpath(expr)?,
        QueryType::Regex => validate_regex(expr)?,
        QueryType::Jsonpath => validate_jsonpath(expr)?,
        // Optional post-filter over the extracted text.
        QueryType::PdfText if !expr.is_empty() => validate_regex(expr)?,
        // Optional column name.
        QueryType::PdfTable if expr.chars().count() > MAX_JSONPATH_LENGTH => {
            return Err(QueryError::TooLong {
                what: "column name",
                max: MAX_JSONPATH_LENGTH,
            });
        }
        QueryType::PdfText | QueryType::PdfTable | QueryType::PdfMetadata => expr,
    };

    Ok(Query {
        expression: expr.to_string(),
        ..query.clone()
    })
}

/// Validate the query list of a job: count bounds, each query, unique names.
///
/// Returns the validated queries in order; only these may be executed.
pub fn validate_queries(queries: &[Query]) -> Result<Vec<Query>, QueryError> {
    if queries.is_empty() || queries.len() > MAX_QUERIES_PER_JOB {
        return Err(QueryError::QueryCount(MAX_QUERIES_PER_JOB));
    }
    let mut seen = HashSet::with_capacity(queries.len());
    let mut validated = Vec::with_capacity(queries.len());
    for query in queries {
        let query = validate_query(query)?;
        if !seen.insert(query.name.clone()) {
            return Err(QueryError::DuplicateName(query.name));
        }
        validated.push(query);
    }
    Ok(validated)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Blank out the contents of quoted literals so that brackets and names
/// inside strings are not mistaken for syntax.
fn strip_string_literals(expr: &str) -> Result<String, QueryError> {
    let mut out = String::with_capacity(expr.len());
    let mut quote: Option<char> = None;
    for c in expr.chars() {
        match quote {
            Some(q) if c == q => {
                quote = None;
                out.push(c);
            }
            Some(_) => {}
            None => {
                if c == '\'' || c == '"' {
                    quote = Some(c);
                }
                out.push(c);
            }
        }
    }
    if quote.is_some() {
        return Err(QueryError::Syntax("unterminated string literal".into()));
    }
    Ok(out)
}

/// Check that every pair is balanced and properly nested; returns the
/// maximum combined nesting depth.
fn bracket_depth(expr: &str, pairs: &[(char, char)]) -> Result<usize, QueryError> {
    let mut stack: Vec<char> = Vec::new();
    let mut max_depth = 0;
    for c in expr.chars() {
        if let Some(&(_, close)) = pairs.iter().find(|(open, _)| *open == c) {
            stack.push(close);
            max_depth = max_depth.max(stack.len());
        } else if pairs.iter().any(|(_, close)| *close == c) && stack.pop() != Some(c) {
            return Err(QueryError::Syntax("unbalanced brackets or parentheses".into()));
        }
    }
    if !stack.is_empty() {
        return Err(QueryError::Syntax("unbalanced brackets or parentheses".into()));
    }
    Ok(max_depth)
}

/// Count `*`, `+`, `?` and `{n}` / `{n,m}` quantifiers, ignoring escaped
/// characters, character-class contents and `(?` group modifiers.
fn count_quantifiers(pattern: &str) -> usize {
    let chars: Vec<char> = pattern.chars().collect();
    let mut count = 0;
    let mut in_class = false;
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 1,
            '[' if !in_class => in_class = true,
            ']' if in_class => in_class = false,
            _ if in_class => {}
            '*' | '+' => count += 1,
            '?' if i == 0 || chars[i - 1] != '(' => count += 1,
            '{' => {
                let rest = &chars[i + 1..];
                if let Some(end) = rest.iter().position(|&c| c == '}') {
                    let body = &rest[..end];
                    if !body.is_empty() && body.iter().all(|c| c.is_ascii_digit() || *c == ',') {
                        count += 1;
                        i += end + 1;
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }
    count
}
