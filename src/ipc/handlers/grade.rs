use crate::band::{to_band_score, ModuleKind};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{param_module, param_str};
use crate::ipc::types::{AppState, Request};
use crate::matcher::{is_correct, CanonicalAnswer};
use crate::score::{
    answer_key_from_value, review, score, user_answers_from_value, AnswerKey, UserAnswer,
    UserAnswers,
};
use crate::settings;
use serde_json::json;

fn key_and_answers(req: &Request) -> Result<(AnswerKey, UserAnswers), serde_json::Value> {
    let Some(answer_key) = req.params.get("answerKey").and_then(answer_key_from_value) else {
        return Err(err(&req.id, "bad_params", "answerKey must be an object", None));
    };
    let raw_answers = req.params.get("answers").unwrap_or(&serde_json::Value::Null);
    let Some(answers) = user_answers_from_value(raw_answers) else {
        return Err(err(&req.id, "bad_params", "answers must be an object", None));
    };
    Ok((answer_key, answers))
}

fn handle_grade_check(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(canonical_raw) = req.params.get("canonical") else {
        return err(&req.id, "bad_params", "missing canonical", None);
    };
    let canonical = CanonicalAnswer::from_value(canonical_raw);
    let user = match req.params.get("userAnswer").map(UserAnswer::from_value) {
        Some(UserAnswer::Text(s)) => s,
        Some(UserAnswer::Selected(list)) => list.join(", "),
        None => String::new(),
    };
    let question_key = param_str(req, "questionKey").unwrap_or("");
    let opts = settings::match_options_or_default(state.db.as_ref());
    let correct = is_correct(&user, &canonical, question_key, opts);
    ok(&req.id, json!({ "isCorrect": correct }))
}

fn handle_grade_score(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (answer_key, answers) = match key_and_answers(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let module = match param_module(req, "module") {
        Ok(m) => m.unwrap_or(ModuleKind::Reading),
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let opts = settings::match_options_or_default(state.db.as_ref());
    let result = score(&answer_key, &answers, module, opts);
    ok(&req.id, json!(result))
}

fn handle_grade_review(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (answer_key, answers) = match key_and_answers(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let opts = settings::match_options_or_default(state.db.as_ref());
    let items = review(&answer_key, &answers, opts);
    ok(&req.id, json!({ "items": items }))
}

fn handle_grade_band(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(raw) = req.params.get("rawCorrect").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "rawCorrect must be an integer", None);
    };
    let module = match param_module(req, "module") {
        Ok(Some(m)) => m,
        Ok(None) => return err(&req.id, "bad_params", "missing module", None),
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    ok(
        &req.id,
        json!({ "bandScore": to_band_score(raw, module), "module": module }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grade.check" => Some(handle_grade_check(state, req)),
        "grade.score" => Some(handle_grade_score(state, req)),
        "grade.review" => Some(handle_grade_review(state, req)),
        "grade.band" => Some(handle_grade_band(state, req)),
        _ => None,
    }
}
