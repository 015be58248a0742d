//! Declarative test definitions: metadata plus the answer key for one
//! book/test/module, loaded from JSON files or registered inline.

use crate::band::ModuleKind;
use crate::score::{answer_key_from_value, AnswerKey};
use crate::settings::GradingSettings;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("definition must be a JSON object")]
    NotAnObject,

    #[error("missing or invalid field: {0}")]
    BadField(&'static str),

    #[error("unknown module: {0}")]
    UnknownModule(String),

    #[error("answer key must not be empty")]
    EmptyKey,

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },

    #[error("test not found: {0}")]
    NotFound(String),
}

impl CatalogError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotAnObject | Self::BadField(_) | Self::UnknownModule(_) | Self::EmptyKey => {
                "bad_definition"
            }
            Self::Io { .. } => "io_failed",
            Self::Json { .. } => "bad_json",
            Self::NotFound(_) => "not_found",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestDefinition {
    pub id: String,
    pub title: String,
    pub book: String,
    pub module: ModuleKind,
    pub test_number: i64,
    pub duration_seconds: i64,
    pub answer_key: AnswerKey,
    pub key_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSummary {
    pub id: String,
    pub title: String,
    pub book: String,
    pub module: ModuleKind,
    pub test_number: i64,
    pub duration_seconds: i64,
    pub question_keys: usize,
    pub key_hash: String,
}

impl TestDefinition {
    pub fn summary(&self) -> TestSummary {
        TestSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            book: self.book.clone(),
            module: self.module,
            test_number: self.test_number,
            duration_seconds: self.duration_seconds,
            question_keys: self.answer_key.len(),
            key_hash: self.key_hash.clone(),
        }
    }
}

/// Longest countdown a definition may ask for, matching the 240-minute cap
/// on the configured module durations.
pub const MAX_DURATION_SECONDS: i64 = 4 * 60 * 60;

/// SHA-256 over the answer key exactly as written, serialized with sorted
/// keys. Malformed entries hash by their raw content.
pub fn key_hash(raw_key: &Value) -> String {
    let canonical = serde_json::to_string(raw_key).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn string_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) => {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn parse_definition(
    raw: &Value,
    settings: &GradingSettings,
) -> Result<TestDefinition, CatalogError> {
    let obj = raw.as_object().ok_or(CatalogError::NotAnObject)?;

    let book = string_field(obj, "book").ok_or(CatalogError::BadField("book"))?;
    let module_raw = obj
        .get("module")
        .and_then(|v| v.as_str())
        .ok_or(CatalogError::BadField("module"))?;
    let module = ModuleKind::parse(module_raw)
        .ok_or_else(|| CatalogError::UnknownModule(module_raw.to_string()))?;
    let test_number = obj
        .get("testNumber")
        .and_then(|v| v.as_i64())
        .filter(|n| *n > 0)
        .ok_or(CatalogError::BadField("testNumber"))?;

    let raw_key = obj.get("answerKey").ok_or(CatalogError::BadField("answerKey"))?;
    let answer_key = answer_key_from_value(raw_key).ok_or(CatalogError::BadField("answerKey"))?;
    if answer_key.is_empty() {
        return Err(CatalogError::EmptyKey);
    }

    let duration_seconds = match obj.get("durationSeconds") {
        None | Some(Value::Null) => settings.default_duration_seconds(module),
        Some(v) => v
            .as_i64()
            .filter(|n| (1..=MAX_DURATION_SECONDS).contains(n))
            .ok_or(CatalogError::BadField("durationSeconds"))?,
    };

    let id = string_field(obj, "id")
        .unwrap_or_else(|| format!("book{}-test{}-{}", book, test_number, module.as_str()));
    let title = string_field(obj, "title").unwrap_or_else(|| {
        let module_title = match module {
            ModuleKind::Reading => "Reading",
            ModuleKind::Listening => "Listening",
        };
        format!("Book {} Test {} {}", book, test_number, module_title)
    });

    let key_hash = key_hash(raw_key);
    Ok(TestDefinition {
        id,
        title,
        book,
        module,
        test_number,
        duration_seconds,
        answer_key,
        key_hash,
        source_path: None,
    })
}

pub fn load_file(path: &Path, settings: &GradingSettings) -> Result<TestDefinition, CatalogError> {
    let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_string_lossy().to_string(),
        source,
    })?;
    let raw: Value = serde_json::from_str(&text).map_err(|source| CatalogError::Json {
        path: path.to_string_lossy().to_string(),
        source,
    })?;
    let mut def = parse_definition(&raw, settings)?;
    def.source_path = Some(path.to_string_lossy().to_string());
    Ok(def)
}

#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<TestDefinition>,
    pub failures: Vec<(PathBuf, CatalogError)>,
}

/// Loads every `*.json` directly inside `dir`, in file-name order. A bad file
/// is reported and skipped.
pub fn load_dir(dir: &Path, settings: &GradingSettings) -> anyhow::Result<LoadReport> {
    let mut paths: Vec<PathBuf> = Vec::new();
    for ent in std::fs::read_dir(dir)? {
        let p = ent?.path();
        if !p.is_file() {
            continue;
        }
        let is_json = p
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json {
            paths.push(p);
        }
    }
    paths.sort();

    let mut report = LoadReport::default();
    for p in paths {
        match load_file(&p, settings) {
            Ok(def) => report.loaded.push(def),
            Err(e) => {
                tracing::warn!(path = %p.display(), error = %e, "skipping test definition");
                report.failures.push((p, e));
            }
        }
    }
    Ok(report)
}

/// In-memory registry of definitions keyed by test id. Re-registering an id
/// replaces the earlier definition.
#[derive(Debug, Default)]
pub struct Catalog {
    tests: BTreeMap<String, TestDefinition>,
}

impl Catalog {
    pub fn insert(&mut self, def: TestDefinition) -> bool {
        self.tests.insert(def.id.clone(), def).is_some()
    }

    pub fn get(&self, id: &str) -> Result<&TestDefinition, CatalogError> {
        self.tests
            .get(id)
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    pub fn list(&self, module: Option<ModuleKind>, book: Option<&str>) -> Vec<TestSummary> {
        let mut out: Vec<TestSummary> = self
            .tests
            .values()
            .filter(|t| module.map(|m| t.module == m).unwrap_or(true))
            .filter(|t| book.map(|b| t.book.eq_ignore_ascii_case(b)).unwrap_or(true))
            .map(|t| t.summary())
            .collect();
        out.sort_by(|a, b| {
            book_order(&a.book)
                .cmp(&book_order(&b.book))
                .then_with(|| a.book.cmp(&b.book))
                .then_with(|| a.module.as_str().cmp(b.module.as_str()))
                .then_with(|| a.test_number.cmp(&b.test_number))
        });
        out
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }
}

fn book_order(book: &str) -> i64 {
    book.trim().parse::<i64>().unwrap_or(i64::MAX)
}
