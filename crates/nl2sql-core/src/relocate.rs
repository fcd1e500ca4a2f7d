//! Moves JOIN clauses that a model emitted after `WHERE` back in front of it.
//!
//! Detection is a small lexical scan rather than a parse: the input is by
//! definition not valid SQL yet. The scanner works on bare words, skips quoted
//! regions, and ignores words glued to a `.` (`t.join` is a column, not a
//! keyword). A JOIN clause runs from its keyword, including any modifier chain
//! such as `LEFT OUTER`, up to the next JOIN clause or the end of the segment.

use std::{collections::HashSet, ops::Range};

use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

lazy_static! {
    static ref BLANK_LINES: Regex = Regex::new(r"\n\s*\n+").unwrap();
}

const JOIN_MODIFIERS: &[&str] = &["LEFT", "RIGHT", "INNER", "OUTER", "CROSS", "FULL", "NATURAL"];

/// A bare word outside quotes, with the parenthesis depth it was found at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Word {
    start: usize,
    end: usize,
    depth: i32,
    qualified: bool,
}

fn is_word_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte >= 0x80
}

fn scan_words(text: &str) -> Vec<Word> {
    let bytes = text.as_bytes();
    let mut words = Vec::new();
    let mut depth = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"' | b'`') => {
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b'(' => {
                depth += 1;
                i += 1;
            }
            b')' => {
                depth -= 1;
                i += 1;
            }
            byte if is_word_byte(byte) => {
                let start = i;
                while i < bytes.len() && is_word_byte(bytes[i]) {
                    i += 1;
                }
                let qualified =
                    (start > 0 && bytes[start - 1] == b'.') || bytes.get(i) == Some(&b'.');
                words.push(Word {
                    start,
                    end: i,
                    depth,
                    qualified,
                });
            }
            _ => i += 1,
        }
    }

    words
}

fn is_keyword(text: &str, word: &Word, keyword: &str) -> bool {
    !word.qualified && text[word.start..word.end].eq_ignore_ascii_case(keyword)
}

/// Byte offset of the first `WHERE` keyword. The first textual occurrence is
/// taken as the main predicate.
fn find_where(text: &str) -> Option<usize> {
    scan_words(text)
        .iter()
        .find(|word| is_keyword(text, word, "WHERE"))
        .map(|word| word.start)
}

/// Spans of every top-level JOIN clause in `segment`, in textual order.
/// JOINs nested in parentheses opened inside the segment belong to a
/// subquery and are left alone.
pub(crate) fn join_clause_spans(segment: &str) -> Vec<Range<usize>> {
    let words = scan_words(segment);
    let mut starts = Vec::new();

    for (index, word) in words.iter().enumerate() {
        if word.depth > 0 || !is_keyword(segment, word, "JOIN") {
            continue;
        }

        let mut start = word.start;
        for prev in words[..index].iter().rev() {
            let is_modifier = !prev.qualified
                && prev.depth == word.depth
                && JOIN_MODIFIERS
                    .iter()
                    .any(|modifier| segment[prev.start..prev.end].eq_ignore_ascii_case(modifier));
            if !is_modifier || !segment[prev.end..start].trim().is_empty() {
                break;
            }
            start = prev.start;
        }
        starts.push(start);
    }

    starts
        .iter()
        .enumerate()
        .map(|(i, &start)| start..starts.get(i + 1).copied().unwrap_or(segment.len()))
        .collect()
}

fn normalize_clause(clause: &str) -> String {
    collapse_whitespace(clause).to_lowercase()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Rewrites `sql` so every JOIN clause precedes the main `WHERE`.
///
/// Relocated clauses keep their exact text and relative order; a clause whose
/// normalized form already appears before `WHERE` (or was already moved) is
/// dropped from the tail instead of being inserted twice. The result always
/// ends with a single `;`, however many the input carried. Blank input (or
/// nothing but terminators) yields an empty string.
pub fn move_joins_before_where(sql: &str) -> String {
    let body = sql.trim_end_matches(|c: char| c == ';' || c.is_whitespace()).trim_start();
    if body.is_empty() {
        return String::new();
    }

    let Some(where_at) = find_where(body) else {
        return format!("{body};");
    };

    let before = body[..where_at].trim_end();
    let after = body[where_at..].trim_start();

    let mut seen: HashSet<String> = join_clause_spans(before)
        .into_iter()
        .map(|span| normalize_clause(&before[span]))
        .collect();

    let spans = join_clause_spans(after);
    let mut moved: Vec<&str> = Vec::new();
    for span in &spans {
        let clause = &after[span.clone()];
        if seen.insert(normalize_clause(clause)) {
            moved.push(clause.trim());
        }
    }

    // Cut by scanned offsets so identical text inside literals stays put.
    let mut remainder = after.to_string();
    for span in spans.into_iter().rev() {
        remainder.replace_range(span, " ");
    }
    let remainder = collapse_whitespace(&remainder);

    if !moved.is_empty() {
        debug!(count = moved.len(), "relocating JOIN clauses ahead of WHERE");
    }

    let corrected = if moved.is_empty() {
        format!("{before} {remainder}")
    } else {
        format!("{before} {} {remainder}", moved.join(" "))
    };
    let corrected = BLANK_LINES.replace_all(&corrected, " ");

    format!("{};", corrected.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statement_without_where_is_only_terminated() {
        assert_eq!(move_joins_before_where("  SELECT a FROM t  "), "SELECT a FROM t;");
        assert_eq!(move_joins_before_where("SELECT a FROM t ;"), "SELECT a FROM t;");
        assert_eq!(
            move_joins_before_where("SELECT a FROM t1 JOIN t2 ON t2.id = t1.id"),
            "SELECT a FROM t1 JOIN t2 ON t2.id = t1.id;"
        );
    }

    #[test]
    fn blank_input_stays_blank() {
        assert_eq!(move_joins_before_where(""), "");
        assert_eq!(move_joins_before_where(" \n\t"), "");
        assert_eq!(move_joins_before_where(" ; ;"), "");
    }

    #[test]
    fn repeated_terminators_collapse_to_one() {
        assert_eq!(move_joins_before_where("SELECT a FROM t;;"), "SELECT a FROM t;");
        assert_eq!(
            move_joins_before_where("SELECT a FROM t1 WHERE x = 1 JOIN t2 ON t2.id = t1.id ; ;\n"),
            "SELECT a FROM t1 JOIN t2 ON t2.id = t1.id WHERE x = 1;"
        );
    }

    #[test]
    fn literal_matching_a_moved_join_is_left_intact() {
        let sql = "SELECT a FROM t1 WHERE note = 'JOIN t2 ON t2.id = t1.id' JOIN t2 ON t2.id = t1.id";
        let fixed = move_joins_before_where(sql);
        assert_eq!(
            fixed,
            "SELECT a FROM t1 JOIN t2 ON t2.id = t1.id WHERE note = 'JOIN t2 ON t2.id = t1.id';"
        );

        let where_at = fixed.find("WHERE").unwrap();
        assert_eq!(fixed[where_at..].matches("JOIN").count(), 1);
    }

    #[test]
    fn trailing_join_moves_ahead_of_where() {
        let fixed = move_joins_before_where("SELECT a FROM t1 WHERE x=1 JOIN t2 ON t2.id=t1.id");
        assert_eq!(fixed, "SELECT a FROM t1 JOIN t2 ON t2.id=t1.id WHERE x=1;");

        let where_at = fixed.find("WHERE").unwrap();
        assert!(fixed[..where_at].contains("JOIN t2 ON t2.id=t1.id"));
        assert!(!fixed[where_at..].contains("JOIN"));
    }

    #[test]
    fn several_joins_keep_their_order_and_text() {
        let sql = "SELECT o.id, c.name FROM orders o WHERE o.total > 10 \
                   LEFT JOIN customers c ON c.id = o.customer_id \
                   INNER JOIN regions r ON r.id = c.region_id;";
        assert_eq!(
            move_joins_before_where(sql),
            "SELECT o.id, c.name FROM orders o \
             LEFT JOIN customers c ON c.id = o.customer_id \
             INNER JOIN regions r ON r.id = c.region_id \
             WHERE o.total > 10;"
        );
    }

    #[test]
    fn join_already_before_where_is_not_duplicated() {
        let sql = "SELECT a FROM t1 JOIN t2 ON t2.id = t1.id WHERE x = 1 join  t2 on t2.id = t1.id";
        let fixed = move_joins_before_where(sql);
        assert_eq!(fixed, "SELECT a FROM t1 JOIN t2 ON t2.id = t1.id WHERE x = 1;");
        assert_eq!(fixed.to_lowercase().matches("join").count(), 1);
    }

    #[test]
    fn repeated_trailing_join_is_moved_once() {
        let sql = "SELECT a FROM t1 WHERE x = 1 JOIN t2 ON t2.id = t1.id JOIN t2 ON t2.id = t1.id";
        assert_eq!(
            move_joins_before_where(sql),
            "SELECT a FROM t1 JOIN t2 ON t2.id = t1.id WHERE x = 1;"
        );
    }

    #[test]
    fn multiline_statement_is_flattened_around_where() {
        let sql = "SELECT a\nFROM t1\nWHERE x = 1\n  JOIN t2 ON t2.id = t1.id\n;";
        assert_eq!(
            move_joins_before_where(sql),
            "SELECT a\nFROM t1 JOIN t2 ON t2.id = t1.id WHERE x = 1;"
        );
        assert_eq!(
            move_joins_before_where("SELECT a\n\nFROM t WHERE b = 1"),
            "SELECT a FROM t WHERE b = 1;"
        );
    }

    #[test]
    fn join_like_identifiers_and_literals_are_ignored() {
        let sql = "SELECT a FROM t WHERE t.join_date > '2024-01-01 join x' AND x.join = 1";
        assert_eq!(move_joins_before_where(sql), format!("{sql};"));
    }

    #[test]
    fn subquery_joins_stay_in_place() {
        let sql = "SELECT a FROM t WHERE id IN (SELECT b FROM u JOIN v ON v.id = u.id)";
        assert_eq!(move_joins_before_where(sql), format!("{sql};"));
    }

    #[test]
    fn spans_include_modifier_chains() {
        let segment = "WHERE a = 1 LEFT OUTER JOIN b ON b.x = a.x natural join c";
        let spans: Vec<&str> = join_clause_spans(segment)
            .into_iter()
            .map(|span| &segment[span])
            .collect();
        assert_eq!(spans, vec!["LEFT OUTER JOIN b ON b.x = a.x ", "natural join c"]);
    }
}
