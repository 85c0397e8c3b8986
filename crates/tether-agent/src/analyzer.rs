//! Pattern analysis of a single log file.
//!
//! Each named pattern is matched case-insensitively line by line. The report
//! counts every matching line but lists at most [`MAX_MATCH_LINES`] of them.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value, json};

pub const ANALYSIS_TOPIC: &str = "analysis_report";
pub const DEFAULT_MAX_FILE_SIZE_MB: u64 = 100;
pub const MAX_MATCH_LINES: usize = 10;

const DEFAULT_PATTERNS: &[(&str, &str)] = &[
    ("error", r"\b(ERROR|FATAL|CRITICAL)\b"),
    ("warning", r"\b(WARN|WARNING)\b"),
    ("info", r"\b(INFO|INFORMATION)\b"),
    ("debug", r"\b(DEBUG|TRACE)\b"),
];

/// Matches of these patterns add to `total_errors_found`.
const ERROR_PATTERNS: &[&str] = &["error", "fatal"];

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("file too large: {path} is {size} bytes, limit is {limit}")]
    TooLarge { path: String, size: u64, limit: u64 },

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid pattern {name}: {source}")]
    Pattern {
        name: String,
        #[source]
        source: regex::Error,
    },
}

pub struct Pattern {
    name: String,
    regex: Regex,
}

/// Defaults, replaced or extended by `overrides` (name to regex string).
/// Non-string values are skipped.
pub fn compile_patterns(overrides: &Map<String, Value>) -> Result<Vec<Pattern>, AnalysisError> {
    let mut sources: BTreeMap<String, String> = DEFAULT_PATTERNS
        .iter()
        .map(|(name, pattern)| (name.to_string(), pattern.to_string()))
        .collect();
    for (name, value) in overrides {
        match value.as_str() {
            Some(pattern) => {
                sources.insert(name.clone(), pattern.to_string());
            }
            None => tracing::warn!(%name, "Ignoring non-string analysis pattern"),
        }
    }

    let mut patterns = Vec::with_capacity(sources.len());
    for (name, source) in sources {
        match RegexBuilder::new(&source).case_insensitive(true).build() {
            Ok(regex) => patterns.push(Pattern { name, regex }),
            Err(source) => return Err(AnalysisError::Pattern { name, source }),
        }
    }
    Ok(patterns)
}

/// Running totals across every analyzed file.
#[derive(Debug, Default)]
pub struct AnalysisStats {
    files_processed: AtomicU64,
    lines_analyzed: AtomicU64,
    errors_found: AtomicU64,
    last_analysis: Mutex<Option<DateTime<Utc>>>,
}

impl AnalysisStats {
    fn record(&self, lines: u64, errors: u64, at: DateTime<Utc>) {
        self.files_processed.fetch_add(1, Ordering::Relaxed);
        self.lines_analyzed.fetch_add(lines, Ordering::Relaxed);
        self.errors_found.fetch_add(errors, Ordering::Relaxed);
        *self
            .last_analysis
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(at);
    }

    pub fn files_processed(&self) -> u64 {
        self.files_processed.load(Ordering::Relaxed)
    }

    /// Adds the `total_*` counters and `last_analysis_time` (null until the
    /// first analysis).
    pub fn write_status(&self, status: &mut Map<String, Value>) {
        let last = *self
            .last_analysis
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        status.insert("total_files_processed".to_string(), json!(self.files_processed()));
        status.insert(
            "total_lines_analyzed".to_string(),
            json!(self.lines_analyzed.load(Ordering::Relaxed)),
        );
        status.insert(
            "total_errors_found".to_string(),
            json!(self.errors_found.load(Ordering::Relaxed)),
        );
        status.insert(
            "last_analysis_time".to_string(),
            json!(last.map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true))),
        );
    }
}

/// Read `path` (at most `max_bytes`), match every pattern and update `stats`.
pub fn analyze_file(
    path: &Path,
    patterns: &[Pattern],
    max_bytes: u64,
    stats: &AnalysisStats,
) -> Result<Map<String, Value>, AnalysisError> {
    let display = path.display().to_string();
    let metadata = std::fs::metadata(path).map_err(|source| match source.kind() {
        std::io::ErrorKind::NotFound => AnalysisError::NotFound(display.clone()),
        _ => AnalysisError::Io {
            path: display.clone(),
            source,
        },
    })?;
    if metadata.len() > max_bytes {
        return Err(AnalysisError::TooLarge {
            path: display,
            size: metadata.len(),
            limit: max_bytes,
        });
    }
    let bytes = std::fs::read(path).map_err(|source| AnalysisError::Io {
        path: display.clone(),
        source,
    })?;
    let content = String::from_utf8_lossy(&bytes);

    let now = Utc::now();
    let (report, lines, errors) = analyze_content(&display, &content, patterns, now);
    stats.record(lines, errors, now);
    let file_path = &display;
    tracing::info!(file_path = %file_path, lines, errors, "Analyzed log file");
    Ok(report)
}

fn analyze_content(
    file_path: &str,
    content: &str,
    patterns: &[Pattern],
    now: DateTime<Utc>,
) -> (Map<String, Value>, u64, u64) {
    let lines: Vec<&str> = content.split('\n').collect();
    let mut errors = 0;
    let mut pattern_matches = Map::new();

    for pattern in patterns {
        let mut count = 0u64;
        let mut matches = Vec::new();
        for (index, line) in lines.iter().enumerate() {
            if !pattern.regex.is_match(line) {
                continue;
            }
            count += 1;
            if matches.len() < MAX_MATCH_LINES {
                matches.push(json!({"line_number": index + 1, "content": line.trim()}));
            }
        }
        if ERROR_PATTERNS.contains(&pattern.name.as_str()) {
            errors += count;
        }
        pattern_matches.insert(
            pattern.name.clone(),
            json!({"count": count, "matches": matches}),
        );
    }

    let mut report = Map::new();
    report.insert("file_path".to_string(), json!(file_path));
    report.insert(
        "timestamp".to_string(),
        json!(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    report.insert(
        "basic_stats".to_string(),
        json!({"total_lines": lines.len(), "file_size": content.len()}),
    );
    report.insert("pattern_matches".to_string(), Value::Object(pattern_matches));
    (report, lines.len() as u64, errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Vec<Pattern> {
        compile_patterns(&Map::new()).unwrap()
    }

    fn write_log(dir: &tempfile::TempDir, text: &str) -> std::path::PathBuf {
        let path = dir.path().join("app.log");
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn default_patterns_are_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(
            &dir,
            "2024 INFO started\n2024 error: disk\n2024 Warning slow\nfatal crash\n",
        );
        let stats = AnalysisStats::default();
        let report = analyze_file(&path, &defaults(), 1024, &stats).unwrap();

        let matches = &report["pattern_matches"];
        assert_eq!(matches["error"]["count"], json!(2));
        assert_eq!(matches["warning"]["count"], json!(1));
        assert_eq!(matches["info"]["count"], json!(1));
        assert_eq!(matches["debug"]["count"], json!(0));
        assert_eq!(
            matches["error"]["matches"][0],
            json!({"line_number": 2, "content": "2024 error: disk"})
        );
        // Trailing newline yields an empty last line.
        assert_eq!(report["basic_stats"]["total_lines"], json!(5));
        assert_eq!(report["file_path"], json!(path.display().to_string()));
    }

    #[test]
    fn listed_matches_are_capped_but_counted() {
        let dir = tempfile::tempdir().unwrap();
        let text: String = (0..25).map(|n| format!("ERROR number {n}\n")).collect();
        let path = write_log(&dir, &text);
        let report = analyze_file(&path, &defaults(), 1 << 20, &AnalysisStats::default()).unwrap();

        let error = &report["pattern_matches"]["error"];
        assert_eq!(error["count"], json!(25));
        assert_eq!(error["matches"].as_array().unwrap().len(), MAX_MATCH_LINES);
    }

    #[test]
    fn overrides_replace_and_extend_defaults() {
        let overrides = json!({"error": "boom", "timeout": r"timed?\s*out", "bad": 3});
        let patterns = compile_patterns(overrides.as_object().unwrap()).unwrap();
        let names: Vec<&str> = patterns.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["debug", "error", "info", "timeout", "warning"]);

        let dir = tempfile::tempdir().unwrap();
        let path = write_log(&dir, "ERROR plain\nBOOM\nrequest timed out");
        let stats = AnalysisStats::default();
        let report = analyze_file(&path, &patterns, 1024, &stats).unwrap();
        assert_eq!(report["pattern_matches"]["error"]["count"], json!(1));
        assert_eq!(report["pattern_matches"]["timeout"]["count"], json!(1));

        let mut status = Map::new();
        stats.write_status(&mut status);
        assert_eq!(status["total_errors_found"], json!(1));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let overrides = json!({"broken": "(unclosed"});
        let err = compile_patterns(overrides.as_object().unwrap())
            .err()
            .unwrap();
        assert!(matches!(err, AnalysisError::Pattern { ref name, .. } if name == "broken"));
    }

    #[test]
    fn missing_and_oversized_files_fail() {
        let dir = tempfile::tempdir().unwrap();
        let stats = AnalysisStats::default();
        let missing = dir.path().join("nope.log");
        assert!(matches!(
            analyze_file(&missing, &defaults(), 1024, &stats),
            Err(AnalysisError::NotFound(_))
        ));

        let path = write_log(&dir, "ERROR x\n");
        assert!(matches!(
            analyze_file(&path, &defaults(), 4, &stats),
            Err(AnalysisError::TooLarge { size: 8, limit: 4, .. })
        ));
        assert_eq!(stats.files_processed(), 0);
    }

    #[test]
    fn stats_accumulate_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let stats = AnalysisStats::default();
        let mut status = Map::new();
        stats.write_status(&mut status);
        assert_eq!(status["last_analysis_time"], Value::Null);

        let path = write_log(&dir, "ERROR a\nok");
        analyze_file(&path, &defaults(), 1024, &stats).unwrap();
        analyze_file(&path, &defaults(), 1024, &stats).unwrap();

        stats.write_status(&mut status);
        assert_eq!(status["total_files_processed"], json!(2));
        assert_eq!(status["total_lines_analyzed"], json!(4));
        assert_eq!(status["total_errors_found"], json!(2));
        assert!(status["last_analysis_time"].is_string());
    }
}
