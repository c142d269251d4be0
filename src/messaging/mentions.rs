use std::collections::HashSet;
use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;

static MENTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[^\w@])@([A-Za-z0-9_.]{2,30})").expect("mention pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    pub handle: String,
    /// Byte range of `@handle` within the text.
    pub span: Range<usize>,
}

/// Finds `@handle` mentions, unique by handle (case-insensitive), first seen wins.
pub fn extract_mentions(text: &str) -> Vec<Mention> {
    let mut seen = HashSet::new();
    let mut mentions = Vec::new();
    for captures in MENTION.captures_iter(text) {
        let Some(handle) = captures.get(1) else {
            continue;
        };
        // Longer than the handle limit; only trailing punctuation may follow.
        let mut overflow = text[handle.end()..].chars().take_while(|c| is_handle_char(*c));
        if !overflow.all(|c| c == '.') {
            continue;
        }
        let trimmed = handle.as_str().trim_end_matches('.');
        if trimmed.len() < 2 {
            continue;
        }
        if !seen.insert(trimmed.to_lowercase()) {
            continue;
        }
        let start = handle.start() - 1;
        mentions.push(Mention {
            handle: trimmed.to_string(),
            span: start..handle.start() + trimmed.len(),
        });
    }
    mentions
}

fn is_handle_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handles(text: &str) -> Vec<String> {
        extract_mentions(text).into_iter().map(|m| m.handle).collect()
    }

    #[test]
    fn finds_unique_mentions_in_order() {
        assert_eq!(
            handles("@luna and @Sol_99, thanks @luna and @LUNA!"),
            vec!["luna", "Sol_99"]
        );
    }

    #[test]
    fn ignores_emails_and_short_handles() {
        assert!(handles("write to booking@akasha.tv or @x").is_empty());
    }

    #[test]
    fn rejects_handles_over_thirty_characters() {
        let long = "a".repeat(31);
        assert!(handles(&format!("hi @{long} there")).is_empty());

        let limit = "b".repeat(30);
        let text = format!("hi @{limit}.");
        let mentions = extract_mentions(&text);
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].handle, limit);
        assert_eq!(&text[mentions[0].span.clone()], format!("@{limit}"));
    }

    #[test]
    fn trailing_period_is_not_part_of_handle() {
        let text = "see you @dj.kalu.";
        let mentions = extract_mentions(text);
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].handle, "dj.kalu");
        assert_eq!(&text[mentions[0].span.clone()], "@dj.kalu");
    }
}
