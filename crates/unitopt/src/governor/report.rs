//! Human-readable diagnostic dump written on emergency shutdown.

use std::backtrace::Backtrace;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::metrics::MetricsSnapshot;
use crate::persist;

use super::state::OptimizerState;

pub const REPORT_DIR: &str = "crash-reports";

#[derive(Debug, Clone)]
pub struct DiagnosticReport {
    pub reason: String,
    pub state: OptimizerState,
    pub written_at_ms: u64,
    pub started_at_ms: u64,
    pub metrics: Option<MetricsSnapshot>,
    pub disabled_passes: Vec<String>,
    pub blacklist: Vec<String>,
    /// (age, description), oldest first.
    pub cascade_window: Vec<(Duration, String)>,
    pub resident_bytes: Option<u64>,
    pub threads: Vec<String>,
    /// Stack of the thread that triggered the shutdown; symbols are
    /// resolved when the report is rendered.
    pub backtrace: Arc<Backtrace>,
}

impl DiagnosticReport {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "unitopt diagnostic report");
        let _ = writeln!(out, "reason:      {}", self.reason);
        let _ = writeln!(out, "state:       {}", self.state);
        let _ = writeln!(out, "written at:  {} ms", self.written_at_ms);
        let _ = writeln!(out, "started at:  {} ms", self.started_at_ms);
        match self.resident_bytes {
            Some(bytes) => {
                let _ = writeln!(out, "resident:    {bytes} bytes");
            }
            None => {
                let _ = writeln!(out, "resident:    unknown");
            }
        }

        let _ = writeln!(out, "\n[counters]");
        match &self.metrics {
            Some(snapshot) => match serde_json::to_string_pretty(snapshot) {
                Ok(json) => out.push_str(&json),
                Err(err) => {
                    let _ = write!(out, "unavailable: {err}");
                }
            },
            None => out.push_str("unavailable"),
        }
        out.push('\n');

        let _ = writeln!(out, "\n[disabled passes]");
        for pass in &self.disabled_passes {
            let _ = writeln!(out, "{pass}");
        }
        let _ = writeln!(out, "\n[blacklist]");
        for unit in &self.blacklist {
            let _ = writeln!(out, "{unit}");
        }
        let _ = writeln!(out, "\n[cascade window]");
        for (age, what) in &self.cascade_window {
            let _ = writeln!(out, "-{:>6} ms  {what}", age.as_millis());
        }
        let _ = writeln!(out, "\n[threads]");
        for name in &self.threads {
            let _ = writeln!(out, "{name}");
        }
        let _ = writeln!(out, "\n[backtrace]\n{}", self.backtrace);
        out
    }

    /// Write under `data_dir/crash-reports` and return the file path.
    pub fn write(&self, data_dir: &Path) -> std::io::Result<PathBuf> {
        let dir = data_dir.join(REPORT_DIR);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("crash-report-{}.txt", self.written_at_ms));
        persist::write_atomic(&path, self.render().as_bytes())?;
        Ok(path)
    }
}

/// Reports in `data_dir`, oldest first.
pub fn list_reports(data_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let dir = data_dir.join(REPORT_DIR);
    let mut reports = match fs::read_dir(&dir) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "txt"))
            .collect::<Vec<_>>(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(err),
    };
    reports.sort();
    Ok(reports)
}

/// Resident set size from `/proc/self/statm`, where available.
pub fn resident_bytes() -> Option<u64> {
    let statm = fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    pages.checked_mul(4096)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> DiagnosticReport {
        DiagnosticReport {
            reason: "cascade: 10 failures in 5000 ms".into(),
            state: OptimizerState::Active,
            written_at_ms: 1_700_000_000_000,
            started_at_ms: 1_699_999_990_000,
            metrics: None,
            disabled_passes: vec!["inlining".into()],
            blacklist: vec!["com/acme/Bad".into()],
            cascade_window: vec![(Duration::from_millis(1200), "verify com/acme/Bad".into())],
            resident_bytes: Some(4096),
            threads: vec!["unitopt-worker-0".into()],
            backtrace: Arc::new(Backtrace::force_capture()),
        }
    }

    #[test]
    fn render_has_every_section() {
        let text = report().render();
        for needle in [
            "state:       ACTIVE",
            "[disabled passes]\ninlining",
            "[blacklist]\ncom/acme/Bad",
            "verify com/acme/Bad",
            "unitopt-worker-0",
            "[backtrace]",
        ] {
            assert!(text.contains(needle), "missing {needle:?}");
        }
    }

    #[test]
    fn write_creates_report_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_reports(dir.path()).unwrap().is_empty());
        let path = report().write(dir.path()).unwrap();
        assert!(path.ends_with("crash-reports/crash-report-1700000000000.txt"));
        assert_eq!(list_reports(dir.path()).unwrap(), vec![path]);
    }
}
