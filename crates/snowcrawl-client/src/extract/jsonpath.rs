use serde_json::Value;
use serde_json_path::JsonPath;
use snowcrawl_core::error::AppError;

/// Evaluate a JSONPath expression, returning the matched values in order.
///
/// A relative `@` root is treated as `$`.
pub fn evaluate(doc: &Value, expression: &str) -> Result<Vec<Value>, AppError> {
    let expression = match expression.strip_prefix('@') {
        Some(rest) => format!("${rest}"),
        None => expression.to_string(),
    };
    let path = JsonPath::parse(&expression)
        .map_err(|e| AppError::Extraction(format!("invalid JSONPath: {e}")))?;
    Ok(path.query(doc).all().into_iter().cloned().collect())
}
