//! Test session controller: NotStarted -> InProgress -> Submitted, with an
//! explicit reset back to NotStarted.
//!
//! All state lives in one serializable struct per session. Time is always
//! passed in, so expiry is driven by whoever calls with the clock.

use crate::band::ModuleKind;
use crate::catalog::TestDefinition;
use crate::matcher::{group_parts, is_group_key, MatchOptions};
use crate::score::{
    group_selections, group_slots, review, summarize, ReviewItem, ScoreResult, UserAnswer,
    UserAnswers,
};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session has not been started")]
    NotStarted,

    #[error("session already started")]
    AlreadyStarted,

    #[error("session already submitted")]
    Submitted,

    #[error("session has not been submitted")]
    NotSubmitted,

    #[error("question {0} is not part of this test")]
    UnknownQuestion(String),

    #[error("question {key} allows at most {limit} selections")]
    TooManySelections { key: String, limit: usize },
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::NotStarted => "session_not_started",
            Self::AlreadyStarted => "session_already_started",
            Self::Submitted => "session_submitted",
            Self::NotSubmitted => "session_not_submitted",
            Self::UnknownQuestion(_) => "unknown_question",
            Self::TooManySelections { .. } => "too_many_selections",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    NotStarted,
    InProgress,
    Submitted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitReason {
    Manual,
    Timeout,
}

impl SubmitReason {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Self::Manual),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Timeout => "timeout",
        }
    }
}

/// Where the best-effort save of a submitted result stands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum Persistence {
    NotAttempted,
    Saved {
        #[serde(rename = "resultId")]
        result_id: String,
    },
    Failed {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSession {
    pub id: String,
    /// Fresh for every run of the session; a reset starts a new attempt.
    pub attempt_id: String,
    pub test_id: String,
    pub module: ModuleKind,
    pub duration_seconds: i64,
    pub status: SessionStatus,
    pub answers: UserAnswers,
    pub started_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub submit_reason: Option<SubmitReason>,
    pub result: Option<ScoreResult>,
    pub persistence: Persistence,
}

/// Result of a submit call. `first_submission` is false when the session was
/// already submitted and the stored result is being returned again.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubmitOutcome {
    pub result: ScoreResult,
    pub first_submission: bool,
}

impl TestSession {
    pub fn new(id: String, test: &TestDefinition) -> Self {
        Self {
            id,
            attempt_id: Uuid::new_v4().to_string(),
            test_id: test.id.clone(),
            module: test.module,
            duration_seconds: test.duration_seconds,
            status: SessionStatus::NotStarted,
            answers: UserAnswers::new(),
            started_at: None,
            submitted_at: None,
            submit_reason: None,
            result: None,
            persistence: Persistence::NotAttempted,
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), SessionError> {
        match self.status {
            SessionStatus::NotStarted => {
                self.status = SessionStatus::InProgress;
                self.started_at = Some(now);
                Ok(())
            }
            SessionStatus::InProgress => Err(SessionError::AlreadyStarted),
            SessionStatus::Submitted => Err(SessionError::Submitted),
        }
    }

    /// `None` before start, or when the duration cannot be represented.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        let started = self.started_at?;
        let span = TimeDelta::try_seconds(self.duration_seconds)?;
        started.checked_add_signed(span)
    }

    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        if self.status != SessionStatus::InProgress {
            return None;
        }
        self.deadline()
            .map(|d| (d - now).num_seconds().max(0))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::InProgress
            && self.deadline().map(|d| now >= d).unwrap_or(false)
    }

    /// Auto-submits when the countdown has run out. Returns the outcome only
    /// for the call that performed the submission.
    pub fn expire_if_due(
        &mut self,
        test: &TestDefinition,
        opts: MatchOptions,
        now: DateTime<Utc>,
    ) -> Option<SubmitOutcome> {
        if !self.is_expired(now) {
            return None;
        }
        self.submit(test, opts, now, SubmitReason::Timeout).ok()
    }

    pub fn set_answer(
        &mut self,
        test: &TestDefinition,
        question_key: &str,
        answer: UserAnswer,
    ) -> Result<(), SessionError> {
        match self.status {
            SessionStatus::NotStarted => return Err(SessionError::NotStarted),
            SessionStatus::Submitted => return Err(SessionError::Submitted),
            SessionStatus::InProgress => {}
        }
        let key = question_key.trim();
        let Some(owner) = owning_key(test, key) else {
            return Err(SessionError::UnknownQuestion(key.to_string()));
        };
        if is_group_key(owner) {
            let limit = group_slots(owner, &test.answer_key[owner]);
            let mut preview = self.answers.clone();
            store_answer(&mut preview, key, answer.clone());
            let (selected, _) = group_selections(owner, &preview);
            let distinct: BTreeSet<String> = selected.into_iter().collect();
            if distinct.len() > limit {
                return Err(SessionError::TooManySelections {
                    key: owner.to_string(),
                    limit,
                });
            }
        }
        store_answer(&mut self.answers, key, answer);
        Ok(())
    }

    /// Grades and freezes the session. Safe to call repeatedly: only the
    /// first call grades, later calls hand back the stored result.
    pub fn submit(
        &mut self,
        test: &TestDefinition,
        opts: MatchOptions,
        now: DateTime<Utc>,
        reason: SubmitReason,
    ) -> Result<SubmitOutcome, SessionError> {
        match self.status {
            SessionStatus::NotStarted => Err(SessionError::NotStarted),
            SessionStatus::Submitted => {
                let result = self.result.ok_or(SessionError::NotSubmitted)?;
                Ok(SubmitOutcome {
                    result,
                    first_submission: false,
                })
            }
            SessionStatus::InProgress => {
                let items = review(&test.answer_key, &self.answers, opts);
                let result = summarize(&items, test.module);
                // A late-detected expiry is stamped at the deadline.
                let submitted_at = match (reason, self.deadline()) {
                    (SubmitReason::Timeout, Some(d)) if d < now => d,
                    _ => now,
                };
                self.status = SessionStatus::Submitted;
                self.submitted_at = Some(submitted_at);
                self.submit_reason = Some(reason);
                self.result = Some(result);
                Ok(SubmitOutcome {
                    result,
                    first_submission: true,
                })
            }
        }
    }

    pub fn review(
        &self,
        test: &TestDefinition,
        opts: MatchOptions,
    ) -> Result<Vec<ReviewItem>, SessionError> {
        if self.status != SessionStatus::Submitted {
            return Err(SessionError::NotSubmitted);
        }
        Ok(review(&test.answer_key, &self.answers, opts))
    }

    pub fn reset(&mut self) {
        self.attempt_id = Uuid::new_v4().to_string();
        self.status = SessionStatus::NotStarted;
        self.answers.clear();
        self.started_at = None;
        self.submitted_at = None;
        self.submit_reason = None;
        self.result = None;
        self.persistence = Persistence::NotAttempted;
    }

    /// Whole seconds between start and submission.
    pub fn time_taken_seconds(&self) -> Option<i64> {
        let started = self.started_at?;
        let submitted = self.submitted_at?;
        Some((submitted - started).num_seconds().max(0))
    }

    pub fn needs_save(&self) -> bool {
        self.status == SessionStatus::Submitted
            && !matches!(self.persistence, Persistence::Saved { .. })
    }
}

/// The answer-key entry a submitted key belongs to: the key itself, or the
/// group it is one part of.
fn owning_key<'a>(test: &'a TestDefinition, key: &str) -> Option<&'a str> {
    if let Some((k, _)) = test.answer_key.get_key_value(key) {
        return Some(k.as_str());
    }
    test.answer_key
        .keys()
        .find(|k| group_parts(k).iter().any(|p| *p == key))
        .map(|k| k.as_str())
}

fn store_answer(answers: &mut UserAnswers, key: &str, answer: UserAnswer) {
    if answer.is_blank() {
        answers.remove(key);
    } else {
        answers.insert(key.to_string(), answer);
    }
}

/// Live sessions owned by the sidecar process.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, TestSession>,
}

impl SessionRegistry {
    pub fn create(&mut self, test: &TestDefinition) -> &TestSession {
        let id = Uuid::new_v4().to_string();
        self.sessions
            .entry(id.clone())
            .or_insert_with(|| TestSession::new(id, test))
    }

    pub fn get(&self, id: &str) -> Result<&TestSession, SessionError> {
        self.sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut TestSession, SessionError> {
        self.sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<&TestSession> {
        let mut out: Vec<&TestSession> = self.sessions.values().collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::parse_definition;
    use crate::settings::GradingSettings;
    use serde_json::json;

    fn test_def() -> TestDefinition {
        parse_definition(
            &json!({
                "book": "13",
                "module": "listening",
                "testNumber": 1,
                "durationSeconds": 1800,
                "answerKey": { "1": "scientists", "9": "B", "30&31&32": ["B", "C", "E"] }
            }),
            &GradingSettings::default(),
        )
        .expect("definition")
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T09:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn lifecycle_start_answer_submit() {
        let test = test_def();
        let mut s = TestSession::new("s1".into(), &test);
        assert_eq!(
            s.set_answer(&test, "1", UserAnswer::Text("x".into())),
            Err(SessionError::NotStarted)
        );
        s.start(t0()).expect("start");
        assert_eq!(s.start(t0()), Err(SessionError::AlreadyStarted));
        s.set_answer(&test, "1", UserAnswer::Text("Scientists".into()))
            .expect("answer 1");
        s.set_answer(&test, "9", UserAnswer::Text("b".into()))
            .expect("answer 9");
        s.set_answer(&test, "31", UserAnswer::Text("C".into()))
            .expect("group part key");
        assert!(matches!(
            s.set_answer(&test, "40", UserAnswer::Text("x".into())),
            Err(SessionError::UnknownQuestion(_))
        ));

        let out = s
            .submit(&test, MatchOptions::default(), t0() + TimeDelta::seconds(600), SubmitReason::Manual)
            .expect("submit");
        assert!(out.first_submission);
        assert_eq!(out.result.raw_correct_count, 3);
        assert_eq!(out.result.total_questions, 5);
        assert_eq!(s.time_taken_seconds(), Some(600));
        assert_eq!(
            s.set_answer(&test, "1", UserAnswer::Text("y".into())),
            Err(SessionError::Submitted)
        );
    }

    #[test]
    fn double_submit_returns_stored_result() {
        let test = test_def();
        let mut s = TestSession::new("s2".into(), &test);
        s.start(t0()).expect("start");
        s.set_answer(&test, "1", UserAnswer::Text("scientists".into()))
            .expect("answer");
        let first = s
            .submit(&test, MatchOptions::default(), t0(), SubmitReason::Timeout)
            .expect("first");
        s.answers.insert("9".into(), UserAnswer::Text("B".into()));
        let second = s
            .submit(&test, MatchOptions::default(), t0(), SubmitReason::Manual)
            .expect("second");
        assert!(first.first_submission);
        assert!(!second.first_submission);
        assert_eq!(first.result, second.result);
        assert_eq!(s.submit_reason, Some(SubmitReason::Timeout));
    }

    #[test]
    fn expiry_auto_submits_once_at_deadline() {
        let test = test_def();
        let mut s = TestSession::new("s3".into(), &test);
        s.start(t0()).expect("start");
        assert!(s
            .expire_if_due(&test, MatchOptions::default(), t0() + TimeDelta::seconds(1799))
            .is_none());
        assert_eq!(s.remaining_seconds(t0() + TimeDelta::seconds(1799)), Some(1));

        let late = t0() + TimeDelta::seconds(4000);
        let out = s
            .expire_if_due(&test, MatchOptions::default(), late)
            .expect("auto submit");
        assert!(out.first_submission);
        assert_eq!(s.status, SessionStatus::Submitted);
        assert_eq!(s.submit_reason, Some(SubmitReason::Timeout));
        assert_eq!(s.time_taken_seconds(), Some(1800));
        assert!(s.expire_if_due(&test, MatchOptions::default(), late).is_none());
    }

    #[test]
    fn reset_discards_answers() {
        let test = test_def();
        let mut s = TestSession::new("s4".into(), &test);
        s.start(t0()).expect("start");
        s.set_answer(&test, "1", UserAnswer::Text("scientists".into()))
            .expect("answer");
        s.submit(&test, MatchOptions::default(), t0(), SubmitReason::Manual)
            .expect("submit");
        s.persistence = Persistence::Failed {
            message: "offline".into(),
        };
        s.reset();
        assert_eq!(s.status, SessionStatus::NotStarted);
        assert!(s.answers.is_empty());
        assert!(s.result.is_none());
        assert_eq!(s.persistence, Persistence::NotAttempted);
        assert_eq!(
            s.submit(&test, MatchOptions::default(), t0(), SubmitReason::Manual)
                .unwrap_err(),
            SessionError::NotStarted
        );
    }

    #[test]
    fn reset_starts_a_new_attempt() {
        let test = test_def();
        let mut s = TestSession::new("s8".into(), &test);
        let first_attempt = s.attempt_id.clone();
        s.start(t0()).expect("start");
        s.submit(&test, MatchOptions::default(), t0(), SubmitReason::Manual)
            .expect("submit");
        s.reset();
        assert_eq!(s.id, "s8");
        assert_ne!(s.attempt_id, first_attempt);
    }

    #[test]
    fn unrepresentable_duration_has_no_deadline() {
        let test = test_def();
        let mut s = TestSession::new("s9".into(), &test);
        s.duration_seconds = i64::MAX;
        s.start(t0()).expect("start");
        assert_eq!(s.deadline(), None);
        assert!(!s.is_expired(t0() + TimeDelta::seconds(86_400)));
        assert_eq!(s.remaining_seconds(t0()), None);
    }

    #[test]
    fn group_selection_is_capped_at_slot_count() {
        let test = test_def();
        let mut s = TestSession::new("s10".into(), &test);
        s.start(t0()).expect("start");
        let everything = UserAnswer::Selected(
            ["A", "B", "C", "D", "E"].iter().map(|v| v.to_string()).collect(),
        );
        assert_eq!(
            s.set_answer(&test, "30&31&32", everything),
            Err(SessionError::TooManySelections {
                key: "30&31&32".into(),
                limit: 3
            })
        );
        assert!(s.answers.is_empty());

        s.set_answer(&test, "30&31&32", UserAnswer::Text("b, b, C, e".into()))
            .expect("duplicates count once");

        let mut p = TestSession::new("s11".into(), &test);
        p.start(t0()).expect("start");
        p.set_answer(&test, "30", UserAnswer::Text("A".into())).expect("30");
        p.set_answer(&test, "31", UserAnswer::Text("B C".into())).expect("31");
        let e = p
            .set_answer(&test, "32", UserAnswer::Text("D".into()))
            .unwrap_err();
        assert_eq!(e.code(), "too_many_selections");
        assert!(!p.answers.contains_key("32"));
    }

    #[test]
    fn review_requires_submission() {
        let test = test_def();
        let mut s = TestSession::new("s5".into(), &test);
        assert_eq!(
            s.review(&test, MatchOptions::default()).unwrap_err(),
            SessionError::NotSubmitted
        );
        s.start(t0()).expect("start");
        s.submit(&test, MatchOptions::default(), t0(), SubmitReason::Manual)
            .expect("submit");
        let items = s.review(&test, MatchOptions::default()).expect("review");
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn blank_answer_clears_slot() {
        let test = test_def();
        let mut s = TestSession::new("s6".into(), &test);
        s.start(t0()).expect("start");
        s.set_answer(&test, "1", UserAnswer::Text("x".into()))
            .expect("answer");
        s.set_answer(&test, "1", UserAnswer::Text("  ".into()))
            .expect("clear");
        assert!(s.answers.is_empty());
    }

    #[test]
    fn session_state_serializes_camel_case() {
        let test = test_def();
        let s = TestSession::new("s7".into(), &test);
        let v = serde_json::to_value(&s).expect("serialize");
        assert_eq!(v["status"], "notStarted");
        assert_eq!(v["testId"], "book13-test1-listening");
        assert_eq!(v["persistence"]["state"], "notAttempted");
        let back: TestSession = serde_json::from_value(v).expect("deserialize");
        assert_eq!(back.status, SessionStatus::NotStarted);
    }
}
