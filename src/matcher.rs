use crate::normalize::{normalize, singularize_last_word};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;

/// Optional groups beyond this make an alternative malformed; each group
/// doubles the variant count.
const MAX_OPTIONAL_GROUPS: usize = 6;

const LABEL_ABBREVIATIONS: &[(&str, &str)] = &[
    ("t", "true"),
    ("f", "false"),
    ("ng", "not given"),
    ("y", "yes"),
    ("n", "no"),
];

/// The authoritative answer for one question key.
///
/// Anything that is not a string, a number, or a list of those deserializes
/// to `Unmatchable`, so a single bad entry never poisons a whole answer key.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CanonicalAnswer {
    Text(String),
    Options(Vec<String>),
    Unmatchable,
}

impl CanonicalAnswer {
    pub fn from_value(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::String(s) => Self::Text(s.clone()),
            serde_json::Value::Number(n) => Self::Text(n.to_string()),
            serde_json::Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        serde_json::Value::String(s) => out.push(s.clone()),
                        serde_json::Value::Number(n) => out.push(n.to_string()),
                        _ => return Self::Unmatchable,
                    }
                }
                if out.is_empty() {
                    Self::Unmatchable
                } else {
                    Self::Options(out)
                }
            }
            _ => Self::Unmatchable,
        }
    }

    /// Human-readable form for review screens.
    pub fn display(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Options(list) => list.join(", "),
            Self::Unmatchable => String::new(),
        }
    }
}

impl<'de> Deserialize<'de> for CanonicalAnswer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = serde_json::Value::deserialize(deserializer)?;
        Ok(Self::from_value(&v))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchOptions {
    pub plural_tolerance: bool,
    pub label_abbreviations: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            plural_tolerance: false,
            label_abbreviations: false,
        }
    }
}

pub fn is_group_key(key: &str) -> bool {
    key.contains('&')
}

pub fn group_parts(key: &str) -> Vec<&str> {
    key.split('&')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// First question number in a key; `"30&31&32"` sorts as 30.
pub fn first_question_number(key: &str) -> Option<u32> {
    let digits: String = key
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// All normalized strings accepted for a canonical text.
///
/// `/` at the top level and a standalone ` OR ` separate alternatives.
/// Parenthesized segments are optional; a `/` inside them lists optional
/// alternatives. Malformed alternatives contribute nothing, so a canonical
/// with no well-formed alternative accepts nothing.
pub fn accepted_variants(canonical: &str) -> Vec<String> {
    let mut accepted: BTreeSet<String> = BTreeSet::new();
    for part in canonical.split(" OR ") {
        for alternative in split_top_level(part) {
            let Some(expanded) = expand_optional(&alternative) else {
                continue;
            };
            for v in expanded {
                let n = normalize(&v);
                if !n.is_empty() {
                    accepted.insert(n);
                }
            }
        }
    }
    accepted.into_iter().collect()
}

fn split_top_level(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut depth: usize = 0;
    for c in s.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            '/' if depth == 0 => out.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    out.push(current);
    out
}

enum Segment {
    Literal(String),
    Optional(Vec<String>),
}

fn expand_optional(alternative: &str) -> Option<Vec<String>> {
    let mut segments: Vec<Segment> = Vec::new();
    let mut literal = String::new();
    let mut chars = alternative.chars();

    while let Some(c) = chars.next() {
        match c {
            '(' => {
                let mut inner = String::new();
                let mut closed = false;
                for ic in chars.by_ref() {
                    match ic {
                        ')' => {
                            closed = true;
                            break;
                        }
                        '(' => return None,
                        _ => inner.push(ic),
                    }
                }
                if !closed {
                    return None;
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                let mut choices: Vec<String> = inner.split('/').map(|s| s.to_string()).collect();
                choices.push(String::new());
                segments.push(Segment::Optional(choices));
            }
            ')' => return None,
            _ => literal.push(c),
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }

    let optional_count = segments
        .iter()
        .filter(|s| matches!(s, Segment::Optional(_)))
        .count();
    if optional_count > MAX_OPTIONAL_GROUPS {
        return None;
    }

    let mut variants: Vec<String> = vec![String::new()];
    for seg in &segments {
        match seg {
            Segment::Literal(text) => {
                for v in variants.iter_mut() {
                    v.push_str(text);
                }
            }
            Segment::Optional(choices) => {
                let mut next = Vec::with_capacity(variants.len() * choices.len());
                for v in &variants {
                    for choice in choices {
                        next.push(format!("{}{}", v, choice));
                    }
                }
                variants = next;
            }
        }
    }
    Some(variants)
}

fn expand_label(user: &str, accepted: &[String]) -> Option<&'static str> {
    let full = LABEL_ABBREVIATIONS
        .iter()
        .find(|(abbr, _)| *abbr == user)
        .map(|(_, full)| *full)?;
    if accepted.iter().any(|a| a == full) {
        Some(full)
    } else {
        None
    }
}

fn text_matches(user: &str, canonical: &str, opts: MatchOptions) -> bool {
    let user = normalize(user);
    if user.is_empty() {
        return false;
    }
    let accepted = accepted_variants(canonical);
    if accepted.is_empty() {
        return false;
    }

    if accepted.iter().any(|a| *a == user) {
        return true;
    }
    if opts.label_abbreviations && expand_label(&user, &accepted).is_some() {
        return true;
    }
    if opts.plural_tolerance {
        let user_stem = singularize_last_word(&user);
        return accepted
            .iter()
            .any(|a| singularize_last_word(a) == user_stem);
    }
    false
}

/// Splits a selection typed or serialized as text: `"B, D"`, `"B D"`, `"B&D"`.
pub fn parse_selection(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c == ';' || c == '&' || c == '/' || c.is_whitespace())
        .map(normalize)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Canonical option set of a multi-select group, normalized and de-duplicated
/// in key order. `None` when the canonical cannot describe a set.
pub fn group_options(canonical: &CanonicalAnswer) -> Option<Vec<String>> {
    let raw: Vec<String> = match canonical {
        CanonicalAnswer::Options(list) => list.iter().map(|s| normalize(s)).collect(),
        CanonicalAnswer::Text(s) => parse_selection(s),
        CanonicalAnswer::Unmatchable => return None,
    };
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for opt in raw {
        if opt.is_empty() {
            return None;
        }
        if seen.insert(opt.clone()) {
            out.push(opt);
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Points earned by a selection: one per distinct selected option that is in
/// the canonical set. Sessions refuse selections larger than the set.
pub fn selection_points(selected: &[String], options: &[String]) -> usize {
    let distinct: BTreeSet<String> = selected
        .iter()
        .map(|s| normalize(s))
        .filter(|s| !s.is_empty())
        .collect();
    distinct
        .iter()
        .filter(|s| options.contains(s))
        .count()
}

/// Correctness of a single typed answer against its canonical answer.
///
/// Never panics and never errors: blank input and unmatchable canonicals are
/// simply wrong. For a group key the answer is read as a selection and is
/// correct only when it earns every slot.
pub fn is_correct(
    user_answer: &str,
    canonical: &CanonicalAnswer,
    question_key: &str,
    opts: MatchOptions,
) -> bool {
    if normalize(user_answer).is_empty() {
        return false;
    }
    if is_group_key(question_key) {
        let Some(options) = group_options(canonical) else {
            return false;
        };
        let selected = parse_selection(user_answer);
        return selection_points(&selected, &options) == options.len();
    }
    match canonical {
        CanonicalAnswer::Text(c) => text_matches(user_answer, c, opts),
        CanonicalAnswer::Options(list) => list.iter().any(|c| text_matches(user_answer, c, opts)),
        CanonicalAnswer::Unmatchable => false,
    }
}
