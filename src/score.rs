use crate::band::{to_band_score, ModuleKind};
use crate::matcher::{
    first_question_number, group_options, group_parts, is_correct, is_group_key, parse_selection,
    selection_points, CanonicalAnswer, MatchOptions,
};
use crate::normalize::{is_blank, normalize};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

pub type AnswerKey = BTreeMap<String, CanonicalAnswer>;
pub type UserAnswers = BTreeMap<String, UserAnswer>;

/// What the test-taker entered for one key: typed text, or the option
/// letters picked in a multi-select group.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum UserAnswer {
    Text(String),
    Selected(Vec<String>),
}

impl UserAnswer {
    pub fn from_value(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::String(s) => Self::Text(s.clone()),
            serde_json::Value::Number(n) => Self::Text(n.to_string()),
            serde_json::Value::Array(items) => Self::Selected(
                items
                    .iter()
                    .filter_map(|i| match i {
                        serde_json::Value::String(s) => Some(s.clone()),
                        serde_json::Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .collect(),
            ),
            _ => Self::Text(String::new()),
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            Self::Text(s) => is_blank(s),
            Self::Selected(list) => list.iter().all(|s| is_blank(s)),
        }
    }

    fn selections(&self) -> Vec<String> {
        match self {
            Self::Text(s) => parse_selection(s),
            Self::Selected(list) => list
                .iter()
                .map(|s| normalize(s))
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    fn as_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Selected(list) => list.join(", "),
        }
    }
}

impl<'de> Deserialize<'de> for UserAnswer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = serde_json::Value::deserialize(deserializer)?;
        Ok(Self::from_value(&v))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreResult {
    pub raw_correct_count: u32,
    pub total_questions: u32,
    pub percentage: u32,
    pub band_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewItem {
    pub question_key: String,
    pub user_answer: String,
    pub correct_answer: String,
    pub is_correct: bool,
    pub points: u32,
    pub slots: u32,
}

/// Keys in question order: by first question number, then lexically for
/// keys without a leading number.
pub fn ordered_keys(answer_key: &AnswerKey) -> Vec<&String> {
    let mut keys: Vec<&String> = answer_key.keys().collect();
    keys.sort_by(|a, b| {
        let na = first_question_number(a).unwrap_or(u32::MAX);
        let nb = first_question_number(b).unwrap_or(u32::MAX);
        na.cmp(&nb).then_with(|| a.cmp(b))
    });
    keys
}

/// Selections for a group key, read from the group key itself or, when that
/// is absent, gathered from its part keys. Also returns the text shown on
/// review screens.
pub fn group_selections(key: &str, answers: &UserAnswers) -> (Vec<String>, String) {
    if let Some(a) = answers.get(key) {
        return (a.selections(), a.as_text());
    }
    let mut selected = Vec::new();
    let mut shown = Vec::new();
    for part in group_parts(key) {
        if let Some(a) = answers.get(part) {
            selected.extend(a.selections());
            if !a.is_blank() {
                shown.push(a.as_text().trim().to_string());
            }
        }
    }
    (selected, shown.join(", "))
}

/// Scoring slots of a group: one per canonical option, or one per `&` part
/// when the canonical cannot describe an option set.
pub fn group_slots(key: &str, canonical: &CanonicalAnswer) -> usize {
    match group_options(canonical) {
        Some(options) => options.len(),
        None => group_parts(key).len().max(1),
    }
}

fn grade_key(
    key: &str,
    canonical: &CanonicalAnswer,
    answers: &UserAnswers,
    opts: MatchOptions,
) -> ReviewItem {
    if is_group_key(key) {
        let (selected, shown) = group_selections(key, answers);
        let slots = group_slots(key, canonical);
        let points = group_options(canonical)
            .map(|options| selection_points(&selected, &options))
            .unwrap_or(0);
        return ReviewItem {
            question_key: key.to_string(),
            user_answer: shown,
            correct_answer: canonical.display(),
            is_correct: points == slots,
            points: points as u32,
            slots: slots as u32,
        };
    }

    let user = answers.get(key).map(|a| a.as_text()).unwrap_or_default();
    let correct = is_correct(&user, canonical, key, opts);
    ReviewItem {
        question_key: key.to_string(),
        user_answer: user,
        correct_answer: canonical.display(),
        is_correct: correct,
        points: u32::from(correct),
        slots: 1,
    }
}

/// Per-key grading in question order, for the answer-review screen.
pub fn review(answer_key: &AnswerKey, answers: &UserAnswers, opts: MatchOptions) -> Vec<ReviewItem> {
    ordered_keys(answer_key)
        .into_iter()
        .map(|k| grade_key(k, &answer_key[k], answers, opts))
        .collect()
}

pub fn percentage(raw_correct: u32, total: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    ((raw_correct as f64) * 100.0 / (total as f64)).round() as u32
}

pub fn summarize(items: &[ReviewItem], kind: ModuleKind) -> ScoreResult {
    let raw_correct_count: u32 = items.iter().map(|i| i.points).sum();
    let total_questions: u32 = items.iter().map(|i| i.slots).sum();
    ScoreResult {
        raw_correct_count,
        total_questions,
        percentage: percentage(raw_correct_count, total_questions),
        band_score: to_band_score(raw_correct_count as i64, kind),
    }
}

/// Grades every key of `answer_key`. Keys in `answers` that the key map does
/// not name are ignored.
pub fn score(
    answer_key: &AnswerKey,
    answers: &UserAnswers,
    kind: ModuleKind,
    opts: MatchOptions,
) -> ScoreResult {
    summarize(&review(answer_key, answers, opts), kind)
}

/// Builds an answer key from arbitrary JSON, keeping malformed entries as
/// unmatchable rather than rejecting the whole map.
pub fn answer_key_from_value(v: &serde_json::Value) -> Option<AnswerKey> {
    let obj = v.as_object()?;
    Some(
        obj.iter()
            .map(|(k, v)| (k.trim().to_string(), CanonicalAnswer::from_value(v)))
            .collect(),
    )
}

pub fn user_answers_from_value(v: &serde_json::Value) -> Option<UserAnswers> {
    if v.is_null() {
        return Some(UserAnswers::new());
    }
    let obj = v.as_object()?;
    Some(
        obj.iter()
            .map(|(k, v)| (k.trim().to_string(), UserAnswer::from_value(v)))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(v: serde_json::Value) -> AnswerKey {
        answer_key_from_value(&v).expect("answer key object")
    }

    fn answers(v: serde_json::Value) -> UserAnswers {
        user_answers_from_value(&v).expect("answers object")
    }

    #[test]
    fn simple_key_scores_both_questions() {
        let k = key(json!({ "1": "scientists", "9": "B" }));
        let a = answers(json!({ "1": "Scientists ", "9": "b" }));
        let r = score(&k, &a, ModuleKind::Reading, MatchOptions::default());
        assert_eq!(r.raw_correct_count, 2);
        assert_eq!(r.total_questions, 2);
        assert_eq!(r.percentage, 100);
    }

    #[test]
    fn group_awards_per_correct_option() {
        let k = key(json!({ "30&31&32": ["B", "C", "E"] }));
        let a = answers(json!({ "30&31&32": ["B", "D"] }));
        let r = score(&k, &a, ModuleKind::Listening, MatchOptions::default());
        assert_eq!(r.raw_correct_count, 1);
        assert_eq!(r.total_questions, 3);
        assert_eq!(r.percentage, 33);
    }

    #[test]
    fn group_selections_can_come_from_part_keys() {
        let k = key(json!({ "20&21": ["A", "D"] }));
        let a = answers(json!({ "20": "d", "21": "A" }));
        let items = review(&k, &a, MatchOptions::default());
        assert_eq!(items[0].points, 2);
        assert!(items[0].is_correct);
        assert_eq!(items[0].user_answer, "d, A");
    }

    #[test]
    fn group_over_selection_never_over_awards() {
        let k = key(json!({ "21&22": "B, E" }));
        let a = answers(json!({ "21&22": "A B C D E" }));
        let r = score(&k, &a, ModuleKind::Reading, MatchOptions::default());
        assert_eq!(r.raw_correct_count, 2);
        assert_eq!(r.total_questions, 2);
    }

    #[test]
    fn malformed_entries_are_unmatchable_not_fatal() {
        let k = key(json!({ "1": null, "2": "river", "3&4": {"x": 1} }));
        let a = answers(json!({ "1": "anything", "2": "River", "3&4": ["A", "B"] }));
        let items = review(&k, &a, MatchOptions::default());
        let r = summarize(&items, ModuleKind::Reading);
        assert_eq!(r.raw_correct_count, 1);
        assert_eq!(r.total_questions, 4);
    }

    #[test]
    fn no_answers_scores_floor_band() {
        let mut map = serde_json::Map::new();
        for q in 1..=40 {
            map.insert(q.to_string(), json!("x"));
        }
        let k = key(serde_json::Value::Object(map));
        let r = score(&k, &UserAnswers::new(), ModuleKind::Listening, MatchOptions::default());
        assert_eq!(r.raw_correct_count, 0);
        assert_eq!(r.total_questions, 40);
        assert_eq!(r.percentage, 0);
        assert_eq!(r.band_score, to_band_score(0, ModuleKind::Listening));
    }

    #[test]
    fn scoring_is_deterministic() {
        let k = key(json!({ "1": "(the) harbour", "2": "C", "5&6": ["A", "E"] }));
        let a = answers(json!({ "1": "harbour", "2": "c", "5&6": ["E"] }));
        let first = score(&k, &a, ModuleKind::Reading, MatchOptions::default());
        let second = score(&k, &a, ModuleKind::Reading, MatchOptions::default());
        assert_eq!(first, second);
        assert_eq!(first.band_score.to_bits(), second.band_score.to_bits());
        assert_eq!(first.raw_correct_count, 3);
    }

    #[test]
    fn review_orders_by_question_number() {
        let k = key(json!({ "10": "a", "2": "b", "30&31": ["A", "B"], "9": "c" }));
        let items = review(&k, &UserAnswers::new(), MatchOptions::default());
        let order: Vec<&str> = items.iter().map(|i| i.question_key.as_str()).collect();
        assert_eq!(order, vec!["2", "9", "10", "30&31"]);
        assert!(items.iter().all(|i| !i.is_correct));
    }

    #[test]
    fn extra_answer_keys_are_ignored() {
        let k = key(json!({ "1": "dock" }));
        let a = answers(json!({ "1": "dock", "77": "stray" }));
        let r = score(&k, &a, ModuleKind::Reading, MatchOptions::default());
        assert_eq!((r.raw_correct_count, r.total_questions), (1, 1));
    }

    #[test]
    fn percentage_rounds_half_up_and_handles_empty() {
        assert_eq!(percentage(0, 0), 0);
        assert_eq!(percentage(1, 8), 13);
        assert_eq!(percentage(39, 40), 98);
    }
}
