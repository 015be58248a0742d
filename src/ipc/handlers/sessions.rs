use crate::catalog::TestDefinition;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::param_str;
use crate::ipc::types::{AppState, Request};
use crate::matcher::MatchOptions;
use crate::results;
use crate::score::UserAnswer;
use crate::session::{Persistence, SessionError, SessionStatus, SubmitReason, TestSession};
use crate::settings;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use serde_json::json;

fn session_err(req: &Request, e: SessionError) -> serde_json::Value {
    err(&req.id, e.code(), e.to_string(), None)
}

fn session_view(session: &TestSession, now: DateTime<Utc>) -> serde_json::Value {
    let mut v = json!(session);
    v["remainingSeconds"] = json!(session.remaining_seconds(now));
    v["deadline"] = json!(session
        .deadline()
        .map(|d| d.to_rfc3339_opts(SecondsFormat::Secs, true)));
    v["timeTaken"] = json!(session.time_taken_seconds());
    v
}

/// Best-effort save. A failure is logged and recorded on the session; the
/// caller still reports the computed result.
fn persist(db: Option<&Connection>, test: &TestDefinition, session: &mut TestSession) -> bool {
    match results::save_result(db, test, session, Utc::now()) {
        Ok(result_id) => {
            tracing::info!(session = %session.id, result = %result_id, "result persisted");
            session.persistence = Persistence::Saved { result_id };
            true
        }
        Err(e) => {
            let message = format!("{e:#}");
            tracing::warn!(session = %session.id, error = %message, "result not persisted");
            session.persistence = Persistence::Failed { message };
            false
        }
    }
}

/// Performs the single automatic submit once the countdown has run out.
fn expire_if_due(
    state: &mut AppState,
    session_id: &str,
    opts: MatchOptions,
    now: DateTime<Utc>,
) -> Result<bool, SessionError> {
    let session = state.sessions.get_mut(session_id)?;
    let Ok(test) = state.catalog.get(&session.test_id) else {
        return Ok(false);
    };
    if session.expire_if_due(test, opts, now).is_none() {
        return Ok(false);
    }
    tracing::info!(session = %session.id, "countdown expired, auto-submitted");
    persist(state.db.as_ref(), test, session);
    Ok(true)
}

fn handle_session_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(test_id) = param_str(req, "testId") else {
        return err(&req.id, "bad_params", "missing testId", None);
    };
    let test = match state.catalog.get(test_id) {
        Ok(t) => t,
        Err(e) => return err(&req.id, e.code(), e.to_string(), None),
    };
    let session = state.sessions.create(test);
    tracing::info!(session = %session.id, test = %test.id, "session created");
    ok(
        &req.id,
        json!({ "session": session_view(session, Utc::now()) }),
    )
}

fn handle_session_start(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(session_id) = param_str(req, "sessionId") else {
        return err(&req.id, "bad_params", "missing sessionId", None);
    };
    let now = Utc::now();
    let session = match state.sessions.get_mut(session_id) {
        Ok(s) => s,
        Err(e) => return session_err(req, e),
    };
    if let Err(e) = session.start(now) {
        return session_err(req, e);
    }
    ok(&req.id, json!({ "session": session_view(session, now) }))
}

fn handle_session_answer(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(session_id) = param_str(req, "sessionId") else {
        return err(&req.id, "bad_params", "missing sessionId", None);
    };
    let Some(question_key) = param_str(req, "questionKey") else {
        return err(&req.id, "bad_params", "missing questionKey", None);
    };
    let answer = UserAnswer::from_value(req.params.get("answer").unwrap_or(&json!(null)));
    let now = Utc::now();
    let opts = settings::match_options_or_default(state.db.as_ref());

    match expire_if_due(state, session_id, opts, now) {
        Ok(true) => {
            return err(
                &req.id,
                SessionError::Submitted.code(),
                "time is up; the session was submitted automatically",
                Some(json!({ "autoSubmitted": true })),
            )
        }
        Ok(false) => {}
        Err(e) => return session_err(req, e),
    }

    let session = match state.sessions.get_mut(session_id) {
        Ok(s) => s,
        Err(e) => return session_err(req, e),
    };
    let test = match state.catalog.get(&session.test_id) {
        Ok(t) => t,
        Err(e) => return err(&req.id, e.code(), e.to_string(), None),
    };
    if let Err(e) = session.set_answer(test, question_key, answer) {
        return session_err(req, e);
    }
    ok(
        &req.id,
        json!({
            "answered": session.answers.len(),
            "remainingSeconds": session.remaining_seconds(now)
        }),
    )
}

fn handle_session_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(session_id) = param_str(req, "sessionId") else {
        return err(&req.id, "bad_params", "missing sessionId", None);
    };
    let requested = match param_str(req, "reason") {
        None => SubmitReason::Manual,
        Some(raw) => match SubmitReason::parse(raw) {
            Some(r) => r,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "reason must be 'manual' or 'timeout'",
                    None,
                )
            }
        },
    };
    let now = Utc::now();
    let opts = settings::match_options_or_default(state.db.as_ref());

    let session = match state.sessions.get_mut(session_id) {
        Ok(s) => s,
        Err(e) => return session_err(req, e),
    };
    let test = match state.catalog.get(&session.test_id) {
        Ok(t) => t,
        Err(e) => return err(&req.id, e.code(), e.to_string(), None),
    };
    let reason = if session.is_expired(now) {
        SubmitReason::Timeout
    } else {
        requested
    };
    let outcome = match session.submit(test, opts, now, reason) {
        Ok(o) => o,
        Err(e) => return session_err(req, e),
    };

    let persisted = if outcome.first_submission {
        tracing::info!(
            session = %session.id,
            raw = outcome.result.raw_correct_count,
            band = outcome.result.band_score,
            reason = reason.as_str(),
            "session submitted"
        );
        persist(state.db.as_ref(), test, session)
    } else {
        matches!(session.persistence, Persistence::Saved { .. })
    };

    ok(
        &req.id,
        json!({
            "session": session_view(session, now),
            "result": outcome.result,
            "record": results::record_for(test, session),
            "persisted": persisted,
            "alreadySubmitted": !outcome.first_submission
        }),
    )
}

fn handle_session_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(session_id) = param_str(req, "sessionId") else {
        return err(&req.id, "bad_params", "missing sessionId", None);
    };
    let now = Utc::now();
    let opts = settings::match_options_or_default(state.db.as_ref());
    let auto_submitted = match expire_if_due(state, session_id, opts, now) {
        Ok(v) => v,
        Err(e) => return session_err(req, e),
    };
    match state.sessions.get(session_id) {
        Ok(session) => ok(
            &req.id,
            json!({
                "session": session_view(session, now),
                "autoSubmitted": auto_submitted
            }),
        ),
        Err(e) => session_err(req, e),
    }
}

fn handle_session_review(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(session_id) = param_str(req, "sessionId") else {
        return err(&req.id, "bad_params", "missing sessionId", None);
    };
    let opts = settings::match_options_or_default(state.db.as_ref());
    let session = match state.sessions.get(session_id) {
        Ok(s) => s,
        Err(e) => return session_err(req, e),
    };
    let test = match state.catalog.get(&session.test_id) {
        Ok(t) => t,
        Err(e) => return err(&req.id, e.code(), e.to_string(), None),
    };
    match session.review(test, opts) {
        Ok(items) => ok(
            &req.id,
            json!({ "items": items, "result": session.result }),
        ),
        Err(e) => session_err(req, e),
    }
}

fn handle_session_reset(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(session_id) = param_str(req, "sessionId") else {
        return err(&req.id, "bad_params", "missing sessionId", None);
    };
    let session = match state.sessions.get_mut(session_id) {
        Ok(s) => s,
        Err(e) => return session_err(req, e),
    };
    session.reset();
    tracing::info!(session = %session.id, "session reset");
    ok(
        &req.id,
        json!({ "session": session_view(session, Utc::now()) }),
    )
}

fn handle_session_retry_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(session_id) = param_str(req, "sessionId") else {
        return err(&req.id, "bad_params", "missing sessionId", None);
    };
    let session = match state.sessions.get_mut(session_id) {
        Ok(s) => s,
        Err(e) => return session_err(req, e),
    };
    if session.status != SessionStatus::Submitted {
        return session_err(req, SessionError::NotSubmitted);
    }
    let test = match state.catalog.get(&session.test_id) {
        Ok(t) => t,
        Err(e) => return err(&req.id, e.code(), e.to_string(), None),
    };
    let persisted = if session.needs_save() {
        persist(state.db.as_ref(), test, session)
    } else {
        true
    };
    ok(
        &req.id,
        json!({ "persisted": persisted, "persistence": session.persistence }),
    )
}

fn handle_session_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let sessions: Vec<serde_json::Value> = state
        .sessions
        .list()
        .into_iter()
        .map(|s| {
            json!({
                "id": s.id,
                "testId": s.test_id,
                "status": s.status,
                "startedAt": s.started_at
            })
        })
        .collect();
    ok(&req.id, json!({ "sessions": sessions }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "session.create" => Some(handle_session_create(state, req)),
        "session.start" => Some(handle_session_start(state, req)),
        "session.answer" => Some(handle_session_answer(state, req)),
        "session.submit" => Some(handle_session_submit(state, req)),
        "session.get" => Some(handle_session_get(state, req)),
        "session.review" => Some(handle_session_review(state, req)),
        "session.reset" => Some(handle_session_reset(state, req)),
        "session.retrySave" => Some(handle_session_retry_save(state, req)),
        "session.list" => Some(handle_session_list(state, req)),
        _ => None,
    }
}
