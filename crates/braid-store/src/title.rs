use braid_core::messages::{text_content, Part};

pub const TITLE_MAX_WORDS: usize = 8;
pub const TITLE_MAX_CHARS: usize = 60;

const QUOTE_CHARS: &[char] = &[
    '"', '\'', '`', '\u{201C}', '\u{201D}', '\u{2018}', '\u{2019}', '\u{00AB}', '\u{00BB}',
];

/// Short session title from a user node's text parts: first non-empty line,
/// quoting punctuation stripped, capped at a word and character limit.
pub fn derive_title(parts: &[Part]) -> Option<String> {
    let text = text_content(parts);
    let line = text.lines().map(str::trim).find(|l| !l.is_empty())?;

    let words: Vec<String> = line
        .split_whitespace()
        .map(|w| {
            w.trim_matches(QUOTE_CHARS)
                .replace(['"', '`', '\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "")
        })
        .filter(|w| !w.is_empty())
        .take(TITLE_MAX_WORDS)
        .collect();

    let mut title = String::new();
    for word in words {
        let extra = if title.is_empty() { 0 } else { 1 };
        if title.chars().count() + extra + word.chars().count() > TITLE_MAX_CHARS {
            if title.is_empty() {
                title = word.chars().take(TITLE_MAX_CHARS).collect();
            }
            break;
        }
        if extra == 1 {
            title.push(' ');
        }
        title.push_str(&word);
    }

    (!title.is_empty()).then_some(title)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn title(text: &str) -> Option<String> {
        derive_title(&[Part::text(text)])
    }

    #[test]
    fn strips_quotes_and_keeps_first_line() {
        assert_eq!(
            title("\"Plan a trip\" to Lisbon\nwith details below").as_deref(),
            Some("Plan a trip to Lisbon")
        );
    }

    #[test]
    fn keeps_inner_apostrophes() {
        assert_eq!(title("don't 'panic'").as_deref(), Some("don't panic"));
    }

    #[test]
    fn truncates_to_word_limit() {
        let t = title("one two three four five six seven eight nine ten").unwrap();
        assert_eq!(t, "one two three four five six seven eight");
    }

    #[test]
    fn truncates_to_char_limit() {
        let long_word = "x".repeat(100);
        assert_eq!(title(&long_word).unwrap().chars().count(), TITLE_MAX_CHARS);

        let text = format!("{} {} {} dddd", "a".repeat(19), "b".repeat(19), "c".repeat(19));
        let t = title(&text).unwrap();
        assert_eq!(t.chars().count(), 59);
        assert!(t.ends_with(&"c".repeat(19)));
    }

    #[test]
    fn skips_leading_blank_lines() {
        assert_eq!(title("\n\n  hello there\nsecond").as_deref(), Some("hello there"));
    }

    #[test]
    fn empty_or_quote_only_text_has_no_title() {
        assert_eq!(title(""), None);
        assert_eq!(title("\"\" ''"), None);
        assert_eq!(derive_title(&[]), None);
    }
}
