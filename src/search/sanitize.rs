//! Query text normalization for the shadow full-text index.

/// The bare wildcard. Not a valid match expression on its own, so it
/// stands for "nothing to match".
pub const WILDCARD: &str = "*";

/// Characters a bareword may hold besides letters and digits.
fn is_term_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '+' | '*')
}
const OPERATORS: [&str; 4] = ["AND", "OR", "NOT", "NEAR"];

fn sanitize_term(term: &str) -> Option<String> {
    if OPERATORS.contains(&term) {
        return Some(term.to_lowercase());
    }

    let prefix = term.ends_with('*');
    let mut cleaned = String::with_capacity(term.len());
    for c in term.chars() {
        match c {
            '*' => {}
            '-' | '+' => {
                if !cleaned.ends_with('+') {
                    cleaned.push('+');
                }
            }
            other => cleaned.push(other),
        }
    }

    let trimmed = cleaned.trim_end_matches('+');
    if !trimmed.chars().any(char::is_alphanumeric) {
        return None;
    }
    let mut sanitized = trimmed.to_string();
    if prefix {
        sanitized.push('*');
    }
    Some(sanitized)
}

/// Rewrites free text into a match expression the shadow index accepts.
///
/// Anything a bareword cannot hold (quotes, brackets, punctuation such as
/// `.` or `@`) becomes a separator, `-` joins words like `+`, a `*`
/// survives only at the end of a term, upper-case operators are neutralized
/// and terms without any word characters are dropped. Returns [`WILDCARD`]
/// when nothing searchable is left.
pub fn sanitize_fts_query(raw: &str) -> String {
    let spaced: String = raw
        .chars()
        .map(|c| if is_term_char(c) { c } else { ' ' })
        .collect();

    let terms: Vec<String> = spaced.split_whitespace().filter_map(sanitize_term).collect();
    if terms.is_empty() {
        return WILDCARD.to_string();
    }
    terms.join(" ")
}
