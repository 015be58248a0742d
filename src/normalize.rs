use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

const EDGE_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', '"', '\''];

/// Folds a typed answer into its comparison form:
/// lowercase, diacritics removed, curly quotes straightened, surrounding
/// punctuation trimmed, internal whitespace collapsed.
///
/// `"  Café  Society. "` and `"cafe society"` normalize to the same string.
/// No spelling correction is attempted.
pub fn normalize(input: &str) -> String {
    let folded: String = input
        .to_lowercase()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' | '\u{02BC}' => '\'',
            '\u{201C}' | '\u{201D}' => '"',
            '\u{2013}' | '\u{2014}' => '-',
            _ => c,
        })
        .collect();

    let collapsed = folded.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_matches(|c: char| EDGE_PUNCTUATION.contains(&c) || c.is_whitespace())
        .to_string()
}

/// True when the input carries nothing gradable.
pub fn is_blank(input: &str) -> bool {
    normalize(input).is_empty()
}

/// Drops a plural suffix from the final word. Used only when plural tolerance
/// is enabled in the grading settings.
pub fn singularize_last_word(normalized: &str) -> String {
    let (head, last) = match normalized.rsplit_once(' ') {
        Some((h, l)) => (Some(h), l),
        None => (None, normalized),
    };
    let stem = if last.len() > 4 && last.ends_with("ies") {
        format!("{}y", &last[..last.len() - 3])
    } else if last.len() > 3
        && (last.ends_with("ches")
            || last.ends_with("shes")
            || last.ends_with("xes")
            || last.ends_with("sses"))
    {
        last[..last.len() - 2].to_string()
    } else if last.len() > 3 && last.ends_with('s') && !last.ends_with("ss") {
        last[..last.len() - 1].to_string()
    } else {
        last.to_string()
    };
    match head {
        Some(h) => format!("{} {}", h, stem),
        None => stem,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_collapses_whitespace() {
        assert_eq!(normalize("  Earth   Summit "), "earth summit");
        assert_eq!(normalize("Scientists "), "scientists");
    }

    #[test]
    fn strips_diacritics_and_edge_punctuation() {
        assert_eq!(normalize("Café."), "cafe");
        assert_eq!(normalize("\u{201C}naïve\u{201D}"), "naive");
        assert_eq!(normalize("co-operation"), "co-operation");
    }

    #[test]
    fn keeps_internal_apostrophes() {
        assert_eq!(normalize("Children\u{2019}s Hospital"), "children's hospital");
    }

    #[test]
    fn blank_detection() {
        assert!(is_blank(""));
        assert!(is_blank("   \t"));
        assert!(is_blank(" . "));
        assert!(!is_blank("b"));
    }

    #[test]
    fn singularize_only_touches_last_word() {
        assert_eq!(singularize_last_word("tabloid newspapers"), "tabloid newspaper");
        assert_eq!(singularize_last_word("boxes"), "box");
        assert_eq!(singularize_last_word("factories"), "factory");
        assert_eq!(singularize_last_word("glass"), "glass");
        assert_eq!(singularize_last_word("bus"), "bus");
    }
}
