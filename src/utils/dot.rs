//! DOT format utilities for graph visualization.
//!
//! Used by [`AbstractInterpreter::to_dot`](crate::analysis::AbstractInterpreter::to_dot)
//! to render analysed offsets and their successor edges with Graphviz.

/// Escapes a string for safe use in DOT format labels and identifiers.
///
/// Handles quotes, backslashes, newlines, angle brackets and the braces and
/// pipes that record-shaped nodes interpret.
///
/// # Arguments
///
/// * `s` - The string to escape
///
/// # Returns
///
/// A new string with all special characters escaped.
///
/// # Examples
///
/// ```rust
/// use jitscope::utils::escape_dot;
///
/// assert_eq!(escape_dot("f<x>"), "f\\<x\\>");
/// assert_eq!(escape_dot("{s1}"), "\\{s1\\}");
/// ```
#[must_use]
pub fn escape_dot(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            '<' | '>' | '{' | '}' | '|' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_dot_basic() {
        assert_eq!(escape_dot("LOAD_FAST 0"), "LOAD_FAST 0");
    }

    #[test]
    fn test_escape_dot_quotes() {
        assert_eq!(escape_dot("say \"hello\""), "say \\\"hello\\\"");
    }

    #[test]
    fn test_escape_dot_backslash() {
        assert_eq!(escape_dot("a\\b"), "a\\\\b");
    }

    #[test]
    fn test_escape_dot_newlines() {
        assert_eq!(escape_dot("line1\nline2"), "line1\\nline2");
        assert_eq!(escape_dot("line1\r\nline2"), "line1\\nline2");
    }

    #[test]
    fn test_escape_dot_record_chars() {
        assert_eq!(escape_dot("[Float{3}|Any]"), "[Float\\{3\\}\\|Any]");
    }
}
