//! Markup Sanitizer - Strip unsupported inline markup from transcripts
//!
//! Transcripts produced by LLMs often carry stray tags (`<emphasis>`, `<scratchpad>`,
//! half-written HTML). Providers reject unknown markup, so everything outside a small
//! SSML whitelist and the speaker tags is removed. Speaker tags left open are closed.

use regex::Regex;
use std::collections::HashSet;

/// SSML tags understood by every supported provider
pub const SUPPORTED_SSML_TAGS: &[&str] = &[
    "speak", "break", "lang", "p", "phoneme", "s", "say-as", "sub",
];

/// Speaker tags preserved by default
pub const DEFAULT_PRESERVED_TAGS: &[&str] = &["Person1", "Person2"];

/// Removes unsupported tags while keeping speech markup and speaker tags
pub struct MarkupSanitizer {
    whitelist: HashSet<String>,
    tag_regex: Regex,
    blank_lines: Regex,
    /// Matches an opening preserved tag; `None` when nothing is preserved
    opening_regex: Option<Regex>,
}

impl MarkupSanitizer {
    /// Create a sanitizer preserving `preserved_tags` on top of the SSML whitelist
    pub fn new<S: AsRef<str>>(preserved_tags: &[S]) -> Self {
        let mut whitelist: HashSet<String> =
            SUPPORTED_SSML_TAGS.iter().map(|t| t.to_string()).collect();
        let preserved: Vec<String> = preserved_tags
            .iter()
            .map(|t| t.as_ref().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        whitelist.extend(preserved.iter().cloned());

        let opening_regex = if preserved.is_empty() {
            None
        } else {
            let names: Vec<String> = preserved.iter().map(|t| regex::escape(t)).collect();
            Some(
                Regex::new(&format!("<({})>", names.join("|")))
                    .expect("escaped tag names form a valid pattern"),
            )
        };

        Self {
            whitelist,
            tag_regex: Regex::new(r"</?([^>]+)>").expect("static pattern"),
            blank_lines: Regex::new(r"\n\s*\n").expect("static pattern"),
            opening_regex,
        }
    }

    /// Sanitize transcript text
    ///
    /// Never fails: malformed tags are simply deleted. Passes repeat until the
    /// text stops changing, since an inserted closer can complete a stray `<`
    /// into a tag that the next strip removes. Each extra pass consumes such a
    /// stray `<`, so the loop ends.
    pub fn sanitize(&self, text: &str) -> String {
        let mut current = self.pass(text);
        loop {
            let next = self.pass(&current);
            if next == current {
                return current;
            }
            current = next;
        }
    }

    fn pass(&self, text: &str) -> String {
        let stripped = self.tag_regex.replace_all(text, |caps: &regex::Captures| {
            let inner = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            if self.whitelist.contains(tag_name(inner)) {
                caps[0].to_string()
            } else {
                String::new()
            }
        });

        let collapsed = self.blank_lines.replace_all(&stripped, "\n");
        let closed = self.close_preserved(&collapsed);

        closed.trim().to_string()
    }

    /// Insert closers for preserved tags that are still open when the next
    /// preserved tag opens (or the text ends)
    fn close_preserved(&self, text: &str) -> String {
        let Some(opening) = &self.opening_regex else {
            return text.to_string();
        };

        let opens: Vec<(usize, usize, &str)> = opening
            .captures_iter(text)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let name = caps.get(1)?;
                Some((whole.start(), whole.end(), name.as_str()))
            })
            .collect();

        let mut out = String::with_capacity(text.len() + opens.len() * 12);
        let mut cursor = 0;

        for (i, &(_, open_end, name)) in opens.iter().enumerate() {
            let span_end = opens.get(i + 1).map(|next| next.0).unwrap_or(text.len());
            let span = &text[open_end..span_end];
            let closer = format!("</{}>", name);

            out.push_str(&text[cursor..open_end]);
            if span.contains(&closer) {
                out.push_str(span);
            } else {
                let body = span.trim_end();
                out.push_str(body);
                out.push_str(&closer);
                out.push_str(&span[body.len()..]);
            }
            cursor = span_end;
        }

        out.push_str(&text[cursor..]);
        out
    }
}

impl Default for MarkupSanitizer {
    fn default() -> Self {
        Self::new(DEFAULT_PRESERVED_TAGS)
    }
}

/// Leading tag name of a tag body such as `break time="1s"/`
fn tag_name(inner: &str) -> &str {
    let end = inner
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        .unwrap_or(inner.len());
    &inner[..end]
}

/// Convenience wrapper: sanitize with the given preserved tags
pub fn sanitize<S: AsRef<str>>(text: &str, preserved_tags: &[S]) -> String {
    MarkupSanitizer::new(preserved_tags).sanitize(text)
}
