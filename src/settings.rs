use crate::band::ModuleKind;
use crate::db;
use crate::matcher::MatchOptions;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const GRADING_KEY: &str = "setup.grading";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingSettings {
    pub plural_tolerance: bool,
    pub label_abbreviations: bool,
    pub reading_minutes: i64,
    pub listening_minutes: i64,
}

impl Default for GradingSettings {
    fn default() -> Self {
        Self {
            plural_tolerance: false,
            label_abbreviations: false,
            reading_minutes: 60,
            listening_minutes: 30,
        }
    }
}

impl GradingSettings {
    pub fn match_options(&self) -> MatchOptions {
        MatchOptions {
            plural_tolerance: self.plural_tolerance,
            label_abbreviations: self.label_abbreviations,
        }
    }

    pub fn default_duration_seconds(&self, kind: ModuleKind) -> i64 {
        let minutes = match kind {
            ModuleKind::Reading => self.reading_minutes,
            ModuleKind::Listening => self.listening_minutes,
        };
        minutes * 60
    }

    /// Applies a partial update. Unknown fields and out-of-range values are
    /// rejected without touching `self`.
    pub fn merge_patch(&mut self, patch: &Map<String, Value>) -> Result<(), String> {
        let mut next = *self;
        for (k, v) in patch {
            match k.as_str() {
                "pluralTolerance" => next.plural_tolerance = parse_bool(v, k)?,
                "labelAbbreviations" => next.label_abbreviations = parse_bool(v, k)?,
                "readingMinutes" => next.reading_minutes = parse_i64_range(v, k, 1, 240)?,
                "listeningMinutes" => next.listening_minutes = parse_i64_range(v, k, 1, 240)?,
                _ => return Err(format!("unknown grading field: {}", k)),
            }
        }
        *self = next;
        Ok(())
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

/// Saved settings merged over defaults. Without a workspace the defaults apply.
pub fn load_grading(conn: Option<&Connection>) -> anyhow::Result<GradingSettings> {
    let mut current = GradingSettings::default();
    let Some(conn) = conn else {
        return Ok(current);
    };
    if let Some(saved) = db::settings_get_json(conn, GRADING_KEY)? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: a malformed historical value must not block grading.
            if let Err(e) = current.merge_patch(saved_obj) {
                tracing::warn!(error = %e, "ignoring saved grading settings");
            }
        }
    }
    Ok(current)
}

/// Match options from the saved settings. A settings read failure falls back
/// to the defaults so grading never stops on it.
pub fn match_options_or_default(conn: Option<&Connection>) -> MatchOptions {
    match load_grading(conn) {
        Ok(s) => s.match_options(),
        Err(e) => {
            tracing::warn!(error = %e, "falling back to default grading settings");
            MatchOptions::default()
        }
    }
}

pub fn save_grading(conn: &Connection, settings: &GradingSettings) -> anyhow::Result<()> {
    db::settings_set_json(conn, GRADING_KEY, &serde_json::to_value(settings)?)
}
