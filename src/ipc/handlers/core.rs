use crate::catalog;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::param_str;
use crate::ipc::types::{AppState, Request};
use crate::settings;
use serde_json::json;
use std::path::{Path, PathBuf};

pub const WORKSPACE_TESTS_DIR: &str = "tests";

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "testsLoaded": state.catalog.len()
        }),
    )
}

/// Opens the workspace database and picks up bundled test definitions.
/// Definition loading is best-effort and never prevents the workspace from opening.
pub fn select_workspace(state: &mut AppState, path: &Path) -> anyhow::Result<usize> {
    let conn = db::open_db(path)?;
    let grading = settings::load_grading(Some(&conn))?;

    let mut loaded = 0;
    let tests_dir = path.join(WORKSPACE_TESTS_DIR);
    if tests_dir.is_dir() {
        match catalog::load_dir(&tests_dir, &grading) {
            Ok(report) => {
                loaded = report.loaded.len();
                for def in report.loaded {
                    state.catalog.insert(def);
                }
            }
            Err(e) => {
                tracing::warn!(dir = %tests_dir.display(), error = %e, "could not scan test definitions");
            }
        }
    }

    state.workspace = Some(path.to_path_buf());
    state.db = Some(conn);
    tracing::info!(workspace = %path.display(), tests = loaded, "workspace selected");
    Ok(loaded)
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(path) = param_str(req, "path").map(PathBuf::from) else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match select_workspace(state, &path) {
        Ok(loaded) => ok(
            &req.id,
            json!({
                "workspacePath": path.to_string_lossy(),
                "testsLoaded": loaded
            }),
        ),
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
