//! Coarse progress extraction from container output.
//!
//! Algorithm engines print wildly different progress formats; we only try
//! to recognize the common ones. Unparsable lines are ignored and never
//! fail the run. Extracted values feed a monotonic per-stage tracker so a
//! noisy engine cannot make progress go backwards.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use regex::Regex;

fn percent_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)\s*%").unwrap())
}

fn fraction_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d+)\s*(?:of|/)\s*(\d+)").unwrap())
}

/// Extracts a progress percentage (0-100) from a log line.
///
/// Recognized patterns: direct percentages ("75.5%") and fractions
/// ("25/50", "25 of 50"). Returns `None` for everything else.
pub fn extract_progress(line: &str) -> Option<f64> {
    if let Some(caps) = percent_re().captures(line) {
        return caps[1].parse::<f64>().ok().filter(|p| *p <= 100.0);
    }
    if let Some(caps) = fraction_re().captures(line) {
        let current: f64 = caps[1].parse().ok()?;
        let total: f64 = caps[2].parse().ok()?;
        if total > 0.0 && current <= total {
            return Some(current / total * 100.0);
        }
    }
    None
}

/// Monotonic per-stage progress values.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    values: Mutex<HashMap<String, f64>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a progress value; updates only ever increase.
    pub fn update(&self, stage: &str, value: f64) {
        let mut values = self.values.lock().unwrap();
        let entry = values.entry(stage.to_string()).or_insert(0.0);
        if value > *entry {
            *entry = value;
        }
    }

    /// Latest progress for a stage, if any line has matched yet.
    pub fn get(&self, stage: &str) -> Option<f64> {
        self.values.lock().unwrap().get(stage).copied()
    }

    /// Feeds one output line; returns the extracted value, if any.
    pub fn observe_line(&self, stage: &str, line: &str) -> Option<f64> {
        let value = extract_progress(line)?;
        self.update(stage, value);
        Some(value)
    }
}
