use crate::catalog::{self, TestDefinition};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{param_module, param_str};
use crate::ipc::types::{AppState, Request};
use crate::settings::{self, GradingSettings};
use serde_json::json;
use std::path::PathBuf;

fn grading(state: &AppState, req: &Request) -> Result<GradingSettings, serde_json::Value> {
    settings::load_grading(state.db.as_ref())
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
}

fn register(state: &mut AppState, defs: Vec<TestDefinition>) -> Vec<serde_json::Value> {
    let mut out = Vec::with_capacity(defs.len());
    for def in defs {
        let summary = def.summary();
        let replaced = state.catalog.insert(def);
        tracing::info!(test = %summary.id, replaced, "test definition registered");
        out.push(json!({ "test": summary, "replaced": replaced }));
    }
    out
}

fn handle_tests_load(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(path) = param_str(req, "path").map(PathBuf::from) else {
        return err(&req.id, "bad_params", "missing path", None);
    };
    let settings = match grading(state, req) {
        Ok(s) => s,
        Err(resp) => return resp,
    };

    if path.is_dir() {
        let report = match catalog::load_dir(&path, &settings) {
            Ok(r) => r,
            Err(e) => return err(&req.id, "io_failed", e.to_string(), None),
        };
        let failures: Vec<serde_json::Value> = report
            .failures
            .iter()
            .map(|(p, e)| {
                json!({
                    "path": p.to_string_lossy(),
                    "code": e.code(),
                    "message": e.to_string()
                })
            })
            .collect();
        let loaded = register(state, report.loaded);
        return ok(&req.id, json!({ "loaded": loaded, "failures": failures }));
    }

    match catalog::load_file(&path, &settings) {
        Ok(def) => {
            let loaded = register(state, vec![def]);
            ok(&req.id, json!({ "loaded": loaded, "failures": [] }))
        }
        Err(e) => err(
            &req.id,
            e.code(),
            e.to_string(),
            Some(json!({ "path": path.to_string_lossy() })),
        ),
    }
}

fn handle_tests_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(raw) = req.params.get("definition") else {
        return err(&req.id, "bad_params", "missing definition", None);
    };
    let settings = match grading(state, req) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    match catalog::parse_definition(raw, &settings) {
        Ok(def) => {
            let mut registered = register(state, vec![def]);
            ok(&req.id, registered.pop().unwrap_or_default())
        }
        Err(e) => err(&req.id, e.code(), e.to_string(), None),
    }
}

fn handle_tests_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let module = match param_module(req, "module") {
        Ok(m) => m,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let book = param_str(req, "book");
    ok(
        &req.id,
        json!({ "tests": state.catalog.list(module, book) }),
    )
}

fn handle_tests_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(test_id) = param_str(req, "testId") else {
        return err(&req.id, "bad_params", "missing testId", None);
    };
    match state.catalog.get(test_id) {
        Ok(def) => ok(&req.id, json!({ "test": def })),
        Err(e) => err(&req.id, e.code(), e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "tests.load" => Some(handle_tests_load(state, req)),
        "tests.register" => Some(handle_tests_register(state, req)),
        "tests.list" => Some(handle_tests_list(state, req)),
        "tests.get" => Some(handle_tests_get(state, req)),
        _ => None,
    }
}
