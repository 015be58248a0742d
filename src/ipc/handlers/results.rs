use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{param_module, param_str};
use crate::ipc::types::{AppState, Request};
use crate::results;
use crate::score::review;
use crate::settings;
use serde_json::json;

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 500;

fn handle_results_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "results": [] }));
    };
    let module = match param_module(req, "module") {
        Ok(m) => m,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let limit = match req.params.get("limit") {
        None => DEFAULT_LIST_LIMIT,
        Some(v) if v.is_null() => DEFAULT_LIST_LIMIT,
        Some(v) => match v.as_i64() {
            Some(n) if (1..=MAX_LIST_LIMIT).contains(&n) => n,
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("limit must be in 1..={}", MAX_LIST_LIMIT),
                    None,
                )
            }
        },
    };
    match results::list_results(conn, module, param_str(req, "book"), limit) {
        Ok(rows) => ok(&req.id, json!({ "results": rows })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_results_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(result_id) = param_str(req, "resultId") else {
        return err(&req.id, "bad_params", "missing resultId", None);
    };
    let found = match results::get_result(conn, result_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((stored, answers)) = found else {
        return err(&req.id, "not_found", "result not found", None);
    };

    // Review is recomputed from the stored answers against the key loaded now.
    let (items, key_changed) = match state.catalog.get(&stored.test_id) {
        Ok(test) => {
            let opts = settings::match_options_or_default(Some(conn));
            (
                Some(review(&test.answer_key, &answers, opts)),
                Some(test.key_hash != stored.key_hash),
            )
        }
        Err(_) => (None, None),
    };

    ok(
        &req.id,
        json!({
            "result": stored,
            "answers": answers,
            "review": items,
            "keyChanged": key_changed
        }),
    )
}

fn handle_results_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let module = match param_module(req, "module") {
        Ok(m) => m,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    match results::result_stats(conn, module) {
        Ok(stats) => ok(&req.id, json!({ "stats": stats })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.list" => Some(handle_results_list(state, req)),
        "results.get" => Some(handle_results_get(state, req)),
        "results.stats" => Some(handle_results_stats(state, req)),
        _ => None,
    }
}
