//! Regex queries with an execution-time budget.
//!
//! `regex` matches in linear time, so the static backtracking checks done at
//! validation are a second line. The budget bounds the remaining cost of
//! very large inputs.

use std::sync::Arc;
use std::time::Duration;

use regex::{Regex, RegexBuilder};
use serde_json::Value;
use snowcrawl_core::error::AppError;

/// Cap on the compiled program size.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

pub fn compile(pattern: &str) -> Result<Regex, AppError> {
    RegexBuilder::new(pattern)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|e| AppError::Extraction(format!("invalid regex: {e}")))
}

/// All matches of `pattern` in `text`, on a blocking thread, within `budget`.
///
/// Without capture groups each match is the matched text; with one group it
/// is that group; with several it is an array of the groups.
pub async fn find_all(text: Arc<str>, pattern: &str, budget: Duration) -> Result<Vec<Value>, AppError> {
    let re = compile(pattern)?;
    with_budget(budget, move || collect_matches(&re, &text)).await
}

/// Run blocking work on the blocking pool, giving up after `budget`.
///
/// A task that overruns keeps its thread until it finishes; its result is
/// discarded.
pub async fn with_budget<T, F>(budget: Duration, work: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match tokio::time::timeout(budget, tokio::task::spawn_blocking(work)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(AppError::Extraction(format!("regex task failed: {e}"))),
        Err(_) => Err(AppError::Timeout(budget.as_secs())),
    }
}

fn collect_matches(re: &Regex, text: &str) -> Vec<Value> {
    let group = |m: Option<regex::Match<'_>>| Value::String(m.map_or("", |m| m.as_str()).to_string());

    match re.captures_len() - 1 {
        0 => re
            .find_iter(text)
            .map(|m| Value::String(m.as_str().to_string()))
            .collect(),
        1 => re.captures_iter(text).map(|c| group(c.get(1))).collect(),
        n => re
            .captures_iter(text)
            .map(|c| Value::Array((1..=n).map(|i| group(c.get(i))).collect()))
            .collect(),
    }
}
