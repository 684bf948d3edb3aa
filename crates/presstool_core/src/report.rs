use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use similar::{ChangeTag, TextDiff};
use tracing::warn;

use crate::mapper::Anomaly;

const CSV_HEADER: &str = "original_id,post_id,state,title,before,after,detail,dry_run";
const DRY_RUN_PREFIX: &str = "[dry-run] ";
const EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Pending,
    Skipped,
    Transformed,
    Written,
    Marked,
    Failed,
}

impl RecordState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Skipped => "skipped",
            Self::Transformed => "transformed",
            Self::Written => "written",
            Self::Marked => "marked",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub pending: usize,
    pub skipped: usize,
    pub transformed: usize,
    pub written: usize,
    pub marked: usize,
    pub failed: usize,
}

impl Tally {
    pub fn add(&mut self, state: RecordState) {
        let slot = match state {
            RecordState::Pending => &mut self.pending,
            RecordState::Skipped => &mut self.skipped,
            RecordState::Transformed => &mut self.transformed,
            RecordState::Written => &mut self.written,
            RecordState::Marked => &mut self.marked,
            RecordState::Failed => &mut self.failed,
        };
        *slot += 1;
    }

    pub fn total(&self) -> usize {
        self.pending + self.skipped + self.transformed + self.written + self.marked + self.failed
    }
}

/// One line of the log and one row of the QA file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    pub original_id: String,
    pub post_id: Option<i64>,
    pub state: Option<RecordState>,
    pub title: String,
    pub before: String,
    pub after: String,
    pub detail: String,
}

impl ReportEntry {
    pub fn new(original_id: impl Into<String>, state: RecordState) -> Self {
        Self {
            original_id: original_id.into(),
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn with_state(mut self, state: RecordState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn post(mut self, post_id: Option<i64>) -> Self {
        self.post_id = post_id;
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn change(mut self, before: &str, after: &str) -> Self {
        self.before = excerpt(before);
        self.after = excerpt(after);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    fn state_label(&self) -> &'static str {
        self.state.map_or("note", RecordState::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct ReportOptions {
    pub command: String,
    /// Directory for the `.log` file; `None` keeps the log in memory only.
    pub log_dir: Option<PathBuf>,
    /// Write the CSV QA file next to the log.
    pub csv: bool,
    /// Explicit CSV path, overriding the default name.
    pub csv_path: Option<PathBuf>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub command: String,
    pub dry_run: bool,
    pub tally: Tally,
    pub anomalies: usize,
    pub write_failures: usize,
    pub log_path: Option<PathBuf>,
    pub csv_path: Option<PathBuf>,
}

/// Append-only run log plus optional CSV QA file.
///
/// Never returns errors: a failed write is counted and warned about once, and
/// the run carries on.
#[derive(Debug)]
pub struct Reporter {
    command: String,
    dry_run: bool,
    log: Option<File>,
    csv: Option<File>,
    log_path: Option<PathBuf>,
    csv_path: Option<PathBuf>,
    /// Kept only by in-memory reporters; file-backed runs stream to disk.
    lines: Option<Vec<String>>,
    tally: Tally,
    anomalies: usize,
    write_failures: usize,
}

impl Reporter {
    pub fn open(options: ReportOptions) -> Self {
        let mut reporter = Self {
            command: options.command.clone(),
            dry_run: options.dry_run,
            log: None,
            csv: None,
            log_path: None,
            csv_path: None,
            lines: None,
            tally: Tally::default(),
            anomalies: 0,
            write_failures: 0,
        };

        let stamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let base_name = format!("{}-{stamp}", options.command);
        if let Some(dir) = options.log_dir.as_deref() {
            let path = dir.join(format!("{base_name}.log"));
            match open_append(&path) {
                Ok(file) => {
                    reporter.log = Some(file);
                    reporter.log_path = Some(path);
                }
                Err(error) => reporter.failed_write(&path, &error),
            }
        }

        let csv_path = options.csv_path.clone().or_else(|| {
            options
                .csv
                .then(|| options.log_dir.as_deref().map(|dir| dir.join(format!("{base_name}.csv"))))
                .flatten()
        });
        if let Some(path) = csv_path {
            match open_csv(&path) {
                Ok(file) => {
                    reporter.csv = Some(file);
                    reporter.csv_path = Some(path);
                }
                Err(error) => reporter.failed_write(&path, &error),
            }
        }
        reporter
    }

    /// In-memory reporter with no files, for previews.
    pub fn in_memory(command: &str, dry_run: bool) -> Self {
        let mut reporter = Self::open(ReportOptions {
            command: command.to_string(),
            log_dir: None,
            csv: false,
            csv_path: None,
            dry_run,
        });
        reporter.lines = Some(Vec::new());
        reporter
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn record(&mut self, entry: &ReportEntry) {
        if let Some(state) = entry.state {
            self.tally.add(state);
        }
        self.write_line(&entry.original_id, entry.state_label(), &entry.detail);

        if self.csv.is_some() {
            let row = [
                csv_field(&entry.original_id),
                entry.post_id.map(|id| id.to_string()).unwrap_or_default(),
                entry.state_label().to_string(),
                csv_field(&entry.title),
                csv_field(&entry.before),
                csv_field(&entry.after),
                csv_field(&entry.detail),
                if self.dry_run { "yes" } else { "no" }.to_string(),
            ]
            .join(",");
            let result = self
                .csv
                .as_mut()
                .map_or(Ok(()), |file| writeln!(file, "{row}"));
            if let Err(error) = result {
                let path = self.csv_path.clone().unwrap_or_default();
                self.failed_write(&path, &error);
                self.csv = None;
            }
        }
    }

    pub fn anomaly(&mut self, anomaly: &Anomaly) {
        self.anomalies += 1;
        self.write_line(&anomaly.record_id, "anomaly", &anomaly.reason);
    }

    /// Free-form line not tied to a record state.
    pub fn note(&mut self, record_id: &str, message: &str) {
        self.write_line(record_id, "note", message);
    }

    pub fn tally(&self) -> &Tally {
        &self.tally
    }

    pub fn write_failures(&self) -> usize {
        self.write_failures
    }

    /// Log lines written so far, without their timestamps. Empty unless in-memory.
    pub fn lines(&self) -> &[String] {
        self.lines.as_deref().unwrap_or_default()
    }

    pub fn finish(mut self) -> ReportSummary {
        for file in [self.log.as_mut(), self.csv.as_mut()].into_iter().flatten() {
            if let Err(error) = file.flush() {
                self.write_failures += 1;
                warn!(command = %self.command, "failed to flush report: {error}");
            }
        }
        ReportSummary {
            command: self.command,
            dry_run: self.dry_run,
            tally: self.tally,
            anomalies: self.anomalies,
            write_failures: self.write_failures,
            log_path: self.log_path,
            csv_path: self.csv_path,
        }
    }

    fn write_line(&mut self, record_id: &str, state: &str, detail: &str) {
        let prefix = if self.dry_run { DRY_RUN_PREFIX } else { "" };
        let detail = detail.split_whitespace().collect::<Vec<_>>().join(" ");
        let body = format!("{prefix}{record_id} {state} {detail}").trim_end().to_string();
        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        let result = self
            .log
            .as_mut()
            .map_or(Ok(()), |file| writeln!(file, "{timestamp} {body}"));
        if let Some(lines) = self.lines.as_mut() {
            lines.push(body);
        }
        if let Err(error) = result {
            let path = self.log_path.clone().unwrap_or_default();
            self.failed_write(&path, &error);
            self.log = None;
        }
    }

    fn failed_write(&mut self, path: &Path, error: &io::Error) {
        self.write_failures += 1;
        if self.write_failures == 1 {
            warn!(
                command = %self.command,
                path = %path.display(),
                "report output unavailable, continuing without it: {error}"
            );
        }
    }
}

/// Line-level summary of a content rewrite, e.g. `+3 -1 lines`.
pub fn change_summary(before: &str, after: &str) -> String {
    if before == after {
        return "unchanged".to_string();
    }
    let diff = TextDiff::from_lines(before, after);
    let mut inserted = 0usize;
    let mut deleted = 0usize;
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => inserted += 1,
            ChangeTag::Delete => deleted += 1,
            ChangeTag::Equal => {}
        }
    }
    format!("+{inserted} -{deleted} lines")
}

fn excerpt(value: &str) -> String {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= EXCERPT_CHARS {
        return collapsed;
    }
    let mut cut = collapsed.chars().take(EXCERPT_CHARS).collect::<String>();
    cut.push_str("...");
    cut
}

/// Quotes when needed and defuses cells a spreadsheet would read as a formula.
fn csv_field(value: &str) -> String {
    let value = if value.starts_with(['=', '+', '-', '@', '\t', '\r']) {
        format!("'{value}")
    } else {
        value.to_string()
    };
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn open_csv(path: &Path) -> io::Result<File> {
    let mut file = open_append(path)?;
    if file.metadata()?.len() == 0 {
        writeln!(file, "{CSV_HEADER}")?;
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(dir: &Path, dry_run: bool) -> ReportOptions {
        ReportOptions {
            command: "convert-shortcodes".to_string(),
            log_dir: Some(dir.to_path_buf()),
            csv: true,
            csv_path: None,
            dry_run,
        }
    }

    #[test]
    fn writes_log_and_csv_with_timestamped_names() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut reporter = Reporter::open(options(temp.path(), false));
        reporter.record(
            &ReportEntry::new("12", RecordState::Marked)
                .post(Some(12))
                .title("Gallery, with comma")
                .change("[gallery ids=\"1,2\"]", "<!-- wp:gallery -->")
                .detail("converted 1 shortcode"),
        );
        reporter.anomaly(&Anomaly::new("13", "bad date"));
        let summary = reporter.finish();

        assert_eq!(summary.tally.marked, 1);
        assert_eq!(summary.anomalies, 1);
        assert_eq!(summary.write_failures, 0);
        let log_path = summary.log_path.expect("log path");
        let name = log_path.file_name().and_then(|n| n.to_str()).expect("name");
        assert!(name.starts_with("convert-shortcodes-"));
        assert!(name.ends_with(".log"));

        let log = fs::read_to_string(&log_path).expect("log");
        assert!(log.contains(" 12 marked converted 1 shortcode"));
        assert!(log.contains(" 13 anomaly bad date"));

        let csv = fs::read_to_string(summary.csv_path.expect("csv path")).expect("csv");
        let mut rows = csv.lines();
        assert_eq!(rows.next(), Some(CSV_HEADER));
        assert_eq!(
            rows.next(),
            Some(
                "12,12,marked,\"Gallery, with comma\",\"[gallery ids=\"\"1,2\"\"]\",<!-- wp:gallery -->,converted 1 shortcode,no"
            )
        );
    }

    #[test]
    fn dry_run_only_adds_annotation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let entry = ReportEntry::new("5", RecordState::Marked).detail("converted");
        let mut live = Reporter::open(options(&temp.path().join("live"), false));
        let mut dry = Reporter::open(options(&temp.path().join("dry"), true));
        live.record(&entry);
        dry.record(&entry);
        assert!(live.lines().is_empty());

        let live = live.finish();
        let dry = dry.finish();
        let log_body = |summary: &ReportSummary| {
            let log = fs::read_to_string(summary.log_path.as_ref().expect("log")).expect("read");
            let line = log.lines().next().expect("line").to_string();
            line.split_once(' ').expect("timestamp").1.to_string()
        };
        assert_eq!(log_body(&dry), format!("{DRY_RUN_PREFIX}{}", log_body(&live)));
        let csv = fs::read_to_string(dry.csv_path.expect("csv")).expect("read");
        assert!(csv.lines().nth(1).expect("row").ends_with(",yes"));
    }

    #[test]
    fn formula_like_cells_are_neutralised() {
        assert_eq!(csv_field("=HYPERLINK(\"x\")"), "\"'=HYPERLINK(\"\"x\"\")\"");
        assert_eq!(csv_field("+1 -2 lines"), "'+1 -2 lines");
        assert_eq!(csv_field("-5"), "'-5");
        assert_eq!(csv_field("@SUM(A1)"), "'@SUM(A1)");
        assert_eq!(csv_field("plain, text"), "\"plain, text\"");
        assert_eq!(csv_field("a-1"), "a-1");
    }

    #[test]
    fn only_in_memory_reporters_buffer_lines() {
        let mut reporter = Reporter::in_memory("split-bylines", false);
        reporter.note("7", "checked");
        assert_eq!(reporter.lines(), ["7 note checked".to_string()]);
    }

    #[test]
    fn unwritable_log_dir_is_counted_not_raised() {
        let temp = tempfile::tempdir().expect("tempdir");
        let blocker = temp.path().join("blocker");
        fs::write(&blocker, "file, not a dir").expect("write");
        let mut reporter = Reporter::open(options(&blocker.join("logs"), false));
        reporter.record(&ReportEntry::new("1", RecordState::Written));
        let summary = reporter.finish();
        assert_eq!(summary.tally.written, 1);
        assert_eq!(summary.write_failures, 2);
        assert!(summary.log_path.is_none());
    }

    #[test]
    fn change_summary_counts_lines() {
        assert_eq!(change_summary("a\nb\n", "a\nb\n"), "unchanged");
        assert_eq!(change_summary("a\nb\n", "a\nc\nd\n"), "+2 -1 lines");
    }

    #[test]
    fn tally_totals_every_state() {
        let mut tally = Tally::default();
        for state in [RecordState::Skipped, RecordState::Failed, RecordState::Marked] {
            tally.add(state);
        }
        assert_eq!(tally.total(), 3);
        assert_eq!(tally.failed, 1);
    }
}
