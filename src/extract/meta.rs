//! Value grammar for doctest `key: value` metadata lines.
//!
//! Three forms are accepted:
//!
//! - bare text: taken verbatim after trimming surrounding whitespace
//! - single-quoted: `'...'` with `\n`, `\r`, `\t`, `\\` and `\'` escapes
//! - double-quoted: a strict JSON string, delegated to serde_json
//!
//! The quoted forms exist so expectations can embed literal newlines. A
//! malformed quoted value yields `None` and the metadata line is ignored,
//! matching the extractor's leniency toward malformed doctests.

/// Parses one metadata value. Returns `None` when the value is malformed.
pub fn parse_value(raw: &str) -> Option<String> {
    let trimmed = raw.trim();

    if trimmed.starts_with('\'') {
        return parse_single_quoted(trimmed);
    }
    if trimmed.starts_with('"') {
        return serde_json::from_str::<String>(trimmed).ok();
    }

    Some(trimmed.to_string())
}

fn parse_single_quoted(s: &str) -> Option<String> {
    let inner = s.strip_prefix('\'')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();

    loop {
        match chars.next()? {
            '\'' => {
                // Closing quote must end the value.
                return if chars.as_str().trim().is_empty() {
                    Some(out)
                } else {
                    None
                };
            }
            '\\' => match chars.next()? {
                'n' => out.push('\n'),
                'r' => out.push('\r'),
                't' => out.push('\t'),
                '\\' => out.push('\\'),
                '\'' => out.push('\''),
                _ => return None,
            },
            c => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_value_is_trimmed() {
        assert_eq!(parse_value("  3 4  "), Some("3 4".to_string()));
        assert_eq!(parse_value(""), Some(String::new()));
    }

    #[test]
    fn test_single_quoted_escapes() {
        assert_eq!(parse_value("'3\\n4\\n'"), Some("3\n4\n".to_string()));
        assert_eq!(parse_value("'a\\tb'"), Some("a\tb".to_string()));
        assert_eq!(parse_value("'it\\'s'"), Some("it's".to_string()));
        assert_eq!(parse_value("'back\\\\slash'"), Some("back\\slash".to_string()));
    }

    #[test]
    fn test_single_quoted_rejects_unknown_escape() {
        assert_eq!(parse_value("'\\x41'"), None);
    }

    #[test]
    fn test_single_quoted_rejects_unterminated() {
        assert_eq!(parse_value("'no end"), None);
        assert_eq!(parse_value("'trailing' junk"), None);
    }

    #[test]
    fn test_double_quoted_json_string() {
        assert_eq!(parse_value("\"7\\n\""), Some("7\n".to_string()));
        assert_eq!(parse_value("\"uni\\u0041\""), Some("uniA".to_string()));
    }

    #[test]
    fn test_double_quoted_rejects_invalid_json() {
        assert_eq!(parse_value("\"unterminated"), None);
        assert_eq!(parse_value("\"bad\\q\""), None);
    }
}
