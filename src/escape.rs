//! Markup escaping for text embedded in the reader page.
//!
//! Encodes the five markup-significant characters (`&`, `<`, `>`, `"`, `'`).
//! Everything else, including non-ASCII text, passes through unchanged since
//! the page is served as UTF-8.

use std::borrow::Cow;

/// Escape `input` for safe embedding in HTML. Borrows when nothing needs
/// escaping.
pub fn escape_html(input: &str) -> Cow<'_, str> {
    let first = match input.find(is_markup) {
        Some(pos) => pos,
        None => return Cow::Borrowed(input),
    };

    let mut out = String::with_capacity(input.len() + 16);
    out.push_str(&input[..first]);

    for c in input[first..].chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            _ => out.push(c),
        }
    }

    Cow::Owned(out)
}

fn is_markup(c: char) -> bool {
    matches!(c, '&' | '<' | '>' | '"' | '\'')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_borrowed() {
        let escaped = escape_html("Hello, Kindle!");
        assert!(matches!(escaped, Cow::Borrowed(_)));
        assert_eq!(escaped, "Hello, Kindle!");
    }

    #[test]
    fn test_tags_escaped() {
        assert_eq!(escape_html("<b>bold</b>"), "&lt;b&gt;bold&lt;/b&gt;");
    }

    #[test]
    fn test_quotes_and_ampersand() {
        assert_eq!(
            escape_html(r#"Tom & "Jerry's""#),
            "Tom &amp; &quot;Jerry&#039;s&quot;"
        );
    }

    #[test]
    fn test_single_pass() {
        let once = escape_html("a < b");
        assert_eq!(once, "a &lt; b");
        // A second pass escapes the entity itself, so callers must escape once.
        assert_eq!(escape_html(&once), "a &amp;lt; b");
    }

    #[test]
    fn test_non_ascii_passthrough() {
        assert_eq!(escape_html("café <ü>"), "café &lt;ü&gt;");
    }
}
