use crate::band::ModuleKind;
use crate::catalog::TestDefinition;
use crate::score::{user_answers_from_value, UserAnswers};
use crate::session::{SubmitReason, TestSession};
use anyhow::{anyhow, Context};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

/// The record handed to the result store for one submitted session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub book: String,
    pub module: ModuleKind,
    pub test_number: i64,
    pub score: u32,
    pub total_questions: u32,
    pub percentage: u32,
    pub ielts_band_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_taken: Option<i64>,
}

pub fn record_for(test: &TestDefinition, session: &TestSession) -> Option<ResultRecord> {
    let result = session.result?;
    Some(ResultRecord {
        book: test.book.clone(),
        module: test.module,
        test_number: test.test_number,
        score: result.raw_correct_count,
        total_questions: result.total_questions,
        percentage: result.percentage,
        ielts_band_score: result.band_score,
        time_taken: session.time_taken_seconds(),
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredResult {
    pub id: String,
    pub session_id: String,
    pub attempt_id: String,
    pub test_id: String,
    pub book: String,
    pub module: String,
    pub test_number: i64,
    pub score: i64,
    pub total_questions: i64,
    pub percentage: i64,
    pub ielts_band_score: f64,
    pub time_taken: Option<i64>,
    pub submit_reason: String,
    pub key_hash: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultStats {
    pub attempts: i64,
    pub best_band: Option<f64>,
    pub average_band: Option<f64>,
    pub average_percentage: Option<f64>,
}

const RESULT_COLUMNS: &str = "id, session_id, attempt_id, test_id, book, module, test_number,
     score, total_questions, percentage, ielts_band_score, time_taken, submit_reason, key_hash,
     created_at";

fn row_to_stored(r: &rusqlite::Row<'_>) -> rusqlite::Result<StoredResult> {
    Ok(StoredResult {
        id: r.get(0)?,
        session_id: r.get(1)?,
        attempt_id: r.get(2)?,
        test_id: r.get(3)?,
        book: r.get(4)?,
        module: r.get(5)?,
        test_number: r.get(6)?,
        score: r.get(7)?,
        total_questions: r.get(8)?,
        percentage: r.get(9)?,
        ielts_band_score: r.get(10)?,
        time_taken: r.get(11)?,
        submit_reason: r.get(12)?,
        key_hash: r.get(13)?,
        created_at: r.get(14)?,
    })
}

/// Stores the result of a submitted session attempt and returns its result id.
///
/// At most one row exists per attempt: saving again returns the id of the
/// row already stored. A reset session is a new attempt and gets its own row.
pub fn save_result(
    conn: Option<&Connection>,
    test: &TestDefinition,
    session: &TestSession,
    now: DateTime<Utc>,
) -> anyhow::Result<String> {
    let conn = conn.ok_or_else(|| anyhow!("no workspace selected"))?;
    let record =
        record_for(test, session).ok_or_else(|| anyhow!("session {} has no result", session.id))?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM results WHERE attempt_id = ?",
            [&session.attempt_id],
            |r| r.get(0),
        )
        .optional()
        .context("failed to look up existing result")?;
    if let Some(id) = existing {
        return Ok(id);
    }

    let id = Uuid::new_v4().to_string();
    let answers_json =
        serde_json::to_string(&session.answers).context("failed to serialize answers")?;
    let reason = session.submit_reason.unwrap_or(SubmitReason::Manual);
    conn.execute(
        "INSERT INTO results(
            id, session_id, attempt_id, test_id, book, module, test_number, score,
            total_questions, percentage, ielts_band_score, time_taken, answers_json, key_hash,
            submit_reason, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            session.id,
            session.attempt_id,
            test.id,
            record.book,
            record.module.as_str(),
            record.test_number,
            record.score,
            record.total_questions,
            record.percentage,
            record.ielts_band_score,
            record.time_taken,
            answers_json,
            test.key_hash,
            reason.as_str(),
            now.to_rfc3339_opts(SecondsFormat::Millis, true),
        ],
    )
    .context("failed to insert result")?;
    Ok(id)
}

pub fn list_results(
    conn: &Connection,
    module: Option<ModuleKind>,
    book: Option<&str>,
    limit: i64,
) -> anyhow::Result<Vec<StoredResult>> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    if let Some(m) = module {
        clauses.push("module = ?");
        bind_values.push(Value::Text(m.as_str().to_string()));
    }
    if let Some(b) = book {
        clauses.push("book = ?");
        bind_values.push(Value::Text(b.to_string()));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    bind_values.push(Value::Integer(limit));

    let sql = format!(
        "SELECT {} FROM results {} ORDER BY created_at DESC, rowid DESC LIMIT ?",
        RESULT_COLUMNS, where_sql
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(bind_values), row_to_stored)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// A stored result with the answers it was graded from.
pub fn get_result(
    conn: &Connection,
    result_id: &str,
) -> anyhow::Result<Option<(StoredResult, UserAnswers)>> {
    let sql = format!("SELECT {}, answers_json FROM results WHERE id = ?", RESULT_COLUMNS);
    let row: Option<(StoredResult, String)> = conn
        .query_row(&sql, [result_id], |r| Ok((row_to_stored(r)?, r.get(15)?)))
        .optional()?;
    let Some((stored, answers_json)) = row else {
        return Ok(None);
    };
    let raw: serde_json::Value =
        serde_json::from_str(&answers_json).context("stored answers are not valid JSON")?;
    let answers = user_answers_from_value(&raw).unwrap_or_default();
    Ok(Some((stored, answers)))
}

pub fn result_stats(conn: &Connection, module: Option<ModuleKind>) -> anyhow::Result<ResultStats> {
    let (sql, bind_values) = match module {
        Some(m) => (
            "SELECT COUNT(*), MAX(ielts_band_score), AVG(ielts_band_score), AVG(percentage)
             FROM results WHERE module = ?",
            vec![Value::Text(m.as_str().to_string())],
        ),
        None => (
            "SELECT COUNT(*), MAX(ielts_band_score), AVG(ielts_band_score), AVG(percentage)
             FROM results",
            Vec::new(),
        ),
    };
    let stats = conn.query_row(sql, params_from_iter(bind_values), |r| {
        Ok(ResultStats {
            attempts: r.get(0)?,
            best_band: r.get(1)?,
            average_band: r.get(2)?,
            average_percentage: r.get(3)?,
        })
    })?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::parse_definition;
    use crate::db::open_db;
    use crate::matcher::MatchOptions;
    use crate::score::UserAnswer;
    use crate::settings::GradingSettings;
    use serde_json::json;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    fn submitted_session(test: &TestDefinition, id: &str) -> TestSession {
        let now = Utc::now();
        let mut s = TestSession::new(id.to_string(), test);
        s.start(now).expect("start");
        s.set_answer(test, "1", UserAnswer::Text("harbour".into()))
            .expect("answer");
        s.submit(test, MatchOptions::default(), now, SubmitReason::Manual)
            .expect("submit");
        s
    }

    fn reading_test() -> TestDefinition {
        parse_definition(
            &json!({ "book": "8", "module": "reading", "testNumber": 3,
                "answerKey": { "1": "harbour", "2": "C" } }),
            &GradingSettings::default(),
        )
        .expect("definition")
    }

    #[test]
    fn save_without_workspace_fails_cleanly() {
        let test = reading_test();
        let s = submitted_session(&test, "no-ws");
        let e = save_result(None, &test, &s, Utc::now()).unwrap_err();
        assert!(e.to_string().contains("no workspace"));
    }

    #[test]
    fn save_is_idempotent_per_attempt_and_round_trips() {
        let ws = temp_dir("ieltsd-results-unit");
        let conn = open_db(&ws).expect("open db");
        let test = reading_test();
        let s = submitted_session(&test, "sess-1");

        let id1 = save_result(Some(&conn), &test, &s, Utc::now()).expect("save");
        let id2 = save_result(Some(&conn), &test, &s, Utc::now()).expect("save again");
        assert_eq!(id1, id2);

        let listed = list_results(&conn, None, None, 50).expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].score, 1);
        assert_eq!(listed[0].total_questions, 2);
        assert_eq!(listed[0].percentage, 50);
        assert_eq!(listed[0].module, "reading");

        let (stored, answers) = get_result(&conn, &id1).expect("get").expect("row");
        assert_eq!(stored.session_id, "sess-1");
        assert_eq!(answers.get("1"), Some(&UserAnswer::Text("harbour".into())));

        let stats = result_stats(&conn, Some(ModuleKind::Reading)).expect("stats");
        assert_eq!(stats.attempts, 1);
        let empty = result_stats(&conn, Some(ModuleKind::Listening)).expect("stats");
        assert_eq!(empty.attempts, 0);
        assert_eq!(empty.best_band, None);

        drop(conn);
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn reset_attempt_is_stored_as_a_new_row() {
        let ws = temp_dir("ieltsd-results-reset");
        let conn = open_db(&ws).expect("open db");
        let test = reading_test();
        let mut s = submitted_session(&test, "sess-2");
        let first = save_result(Some(&conn), &test, &s, Utc::now()).expect("save first");

        let now = Utc::now();
        s.reset();
        s.start(now).expect("restart");
        s.set_answer(&test, "1", UserAnswer::Text("harbour".into()))
            .expect("answer 1");
        s.set_answer(&test, "2", UserAnswer::Text("c".into()))
            .expect("answer 2");
        s.submit(&test, MatchOptions::default(), now, SubmitReason::Manual)
            .expect("resubmit");
        let second = save_result(Some(&conn), &test, &s, Utc::now()).expect("save second");
        assert_ne!(first, second);

        let listed = list_results(&conn, None, None, 50).expect("list");
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|r| r.session_id == "sess-2"));
        let mut scores: Vec<i64> = listed.iter().map(|r| r.score).collect();
        scores.sort();
        assert_eq!(scores, vec![1, 2]);

        drop(conn);
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn record_requires_a_result() {
        let test = reading_test();
        let s = TestSession::new("fresh".into(), &test);
        assert!(record_for(&test, &s).is_none());
    }
}
