use serde::{Deserialize, Serialize};

pub const MAX_RAW_SCORE: i64 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    Reading,
    Listening,
}

impl ModuleKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reading" => Some(Self::Reading),
            "listening" => Some(Self::Listening),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reading => "reading",
            Self::Listening => "listening",
        }
    }
}

// (minimum raw score, band), highest threshold first.
const LISTENING_TABLE: &[(i64, f64)] = &[
    (39, 9.0),
    (37, 8.5),
    (35, 8.0),
    (32, 7.5),
    (30, 7.0),
    (26, 6.5),
    (23, 6.0),
    (18, 5.5),
    (16, 5.0),
    (13, 4.5),
    (10, 4.0),
    (8, 3.5),
    (6, 3.0),
    (4, 2.5),
    (2, 2.0),
    (1, 1.0),
    (0, 0.0),
];

// Academic reading.
const READING_TABLE: &[(i64, f64)] = &[
    (39, 9.0),
    (37, 8.5),
    (35, 8.0),
    (33, 7.5),
    (30, 7.0),
    (27, 6.5),
    (23, 6.0),
    (19, 5.5),
    (15, 5.0),
    (13, 4.5),
    (10, 4.0),
    (8, 3.5),
    (6, 3.0),
    (4, 2.5),
    (2, 2.0),
    (1, 1.0),
    (0, 0.0),
];

fn table(kind: ModuleKind) -> &'static [(i64, f64)] {
    match kind {
        ModuleKind::Reading => READING_TABLE,
        ModuleKind::Listening => LISTENING_TABLE,
    }
}

/// Band for a raw correct count. Counts outside 0..=40 clamp to the ends.
pub fn to_band_score(raw_correct: i64, kind: ModuleKind) -> f64 {
    let raw = raw_correct.clamp(0, MAX_RAW_SCORE);
    table(kind)
        .iter()
        .find(|(min, _)| raw >= *min)
        .map(|(_, band)| *band)
        .unwrap_or(0.0)
}
