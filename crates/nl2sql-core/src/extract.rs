//! Isolates a single candidate statement from raw model output.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref SQL_TAG: Regex = Regex::new(r"(?is)<SQL>\s*(.*?)\s*</SQL>").unwrap();
    static ref CODE_FENCE: Regex = Regex::new(r"(?is)```(?:sql)?\s*(.*?)\s*```").unwrap();
    static ref MARKUP_TAG: Regex = Regex::new(r"<[^>]+>").unwrap();
    static ref LEADING_STATEMENT: Regex = Regex::new(r"(?is)\b(?:SELECT|WITH)\b.*?;").unwrap();
}

/// Pulls the most likely SQL statement out of `raw`.
///
/// Preference order, first hit wins: an explicit `<SQL>…</SQL>` wrapper, a
/// fenced code block, the first `SELECT`/`WITH` statement up to its `;` once
/// markup is stripped, and finally the whole text trimmed. The last step may
/// hand prose to the validator; rejecting it is the validator's job.
pub fn extract_sql(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }

    let text = html_escape::decode_html_entities(raw);

    if let Some(inner) = SQL_TAG.captures(&text).and_then(|caps| caps.get(1)) {
        return inner.as_str().trim().to_string();
    }

    if let Some(inner) = CODE_FENCE.captures(&text).and_then(|caps| caps.get(1)) {
        return inner.as_str().trim().to_string();
    }

    let stripped = MARKUP_TAG.replace_all(&text, " ");
    if let Some(statement) = LEADING_STATEMENT.find(&stripped) {
        return statement.as_str().trim().to_string();
    }

    text.trim().to_string()
}
