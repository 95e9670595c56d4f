//! The analysis tool collaborator: describes data files and runs generated
//! analysis code.
//!
//! [`ProcessAnalysisTool`] runs code with a Python interpreter in a child
//! process inside a temporary directory. [`StaticAnalysisTool`] returns canned
//! results and records what it was asked to run.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hitl_types::{HitlError, Result};

/// Text summary of a data file.
#[derive(Debug, Clone, PartialEq)]
pub struct DataProfile {
    pub summary: String,
    pub preview: String,
}

/// Outcome of one code run. A failing script is not an error: its output is
/// reported with `success == false`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub success: bool,
    pub output: String,
    /// Image files the run produced.
    pub images: Vec<String>,
}

impl ExecutionReport {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            images: Vec::new(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            images: Vec::new(),
        }
    }

    pub fn with_images<I, S>(mut self, images: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.images = images.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
pub trait AnalysisTool: Send + Sync {
    async fn describe(&self, file: &Path) -> Result<DataProfile>;

    async fn execute(&self, code: &str, file: Option<&Path>) -> Result<ExecutionReport>;
}

// ---------------------------------------------------------------------------
// AnalysisConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub python: String,
    /// Where runs save their images; each run gets its own subdirectory.
    pub output_dir: PathBuf,
    pub timeout: Duration,
    /// Rows shown in a file preview.
    pub preview_rows: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            python: "python3".into(),
            output_dir: PathBuf::from("visualizations"),
            timeout: Duration::from_secs(120),
            preview_rows: 20,
        }
    }
}

impl AnalysisConfig {
    /// `HITL_PYTHON`, `HITL_ANALYSIS_OUTPUT_DIR`, `HITL_ANALYSIS_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(python) = std::env::var("HITL_PYTHON") {
            config.python = python;
        }
        if let Ok(dir) = std::env::var("HITL_ANALYSIS_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }
        if let Ok(raw) = std::env::var("HITL_ANALYSIS_TIMEOUT_SECS") {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                HitlError::Other(format!("HITL_ANALYSIS_TIMEOUT_SECS must be a number, got '{raw}'"))
            })?;
            config.timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// ProcessAnalysisTool
// ---------------------------------------------------------------------------

/// Loads the data file as `df` (when pandas is available) and exposes
/// `save_visualization(fig, filename)` writing into the run's output folder.
const PRELUDE: &str = r#"import os
DATA_FILE = os.environ.get("HITL_DATA_FILE") or None
OUTPUT_DIR = os.environ["HITL_OUTPUT_DIR"]
try:
    import matplotlib
    matplotlib.use("Agg")
except Exception:
    pass
try:
    import pandas as pd
    df = pd.read_csv(DATA_FILE) if DATA_FILE else None
except Exception:
    df = None

def save_visualization(fig, filename):
    if not filename.endswith(".png"):
        filename += ".png"
    path = os.path.join(OUTPUT_DIR, os.path.basename(filename))
    fig.savefig(path)
    return path

"#;

pub struct ProcessAnalysisTool {
    config: AnalysisConfig,
}

impl ProcessAnalysisTool {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }
}

#[async_trait]
impl AnalysisTool for ProcessAnalysisTool {
    async fn describe(&self, file: &Path) -> Result<DataProfile> {
        let text = tokio::fs::read_to_string(file).await.map_err(|e| HitlError::ToolError {
            tool: "describe".into(),
            message: format!("cannot read {}: {e}", file.display()),
        })?;
        profile_csv(&text, self.config.preview_rows)
    }

    async fn execute(&self, code: &str, file: Option<&Path>) -> Result<ExecutionReport> {
        let workdir = tempfile::tempdir()?;
        let script = workdir.path().join("analysis.py");
        tokio::fs::write(&script, format!("{PRELUDE}{code}\n")).await?;

        let run_dir = self.config.output_dir.join(uuid::Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&run_dir).await?;
        let run_dir = tokio::fs::canonicalize(&run_dir).await?;
        let data_file = match file {
            Some(f) => tokio::fs::canonicalize(f).await?,
            None => PathBuf::new(),
        };

        let child = tokio::process::Command::new(&self.config.python)
            .arg(&script)
            .current_dir(workdir.path())
            .env("HITL_DATA_FILE", &data_file)
            .env("HITL_OUTPUT_DIR", &run_dir)
            .env("MPLBACKEND", "Agg")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HitlError::ToolError {
                tool: self.config.python.clone(),
                message: format!("failed to start interpreter: {e}"),
            })?;

        let output = match tokio::time::timeout(self.config.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                tracing::warn!(timeout_s = self.config.timeout.as_secs(), "Analysis code timed out");
                return Ok(ExecutionReport::failed(format!(
                    "Execution timed out after {}s",
                    self.config.timeout.as_secs()
                )));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let mut parts = Vec::new();
        if !stdout.is_empty() {
            parts.push(stdout);
        }
        if !stderr.is_empty() {
            parts.push(format!("Warnings/Errors:\n{stderr}"));
        }
        let text = if parts.is_empty() {
            "Code executed successfully (no output).".to_string()
        } else {
            parts.join("\n")
        };

        let images = list_images(&run_dir).await?;
        tracing::debug!(
            success = output.status.success(),
            images = images.len(),
            "Analysis code finished"
        );
        let report = if output.status.success() {
            ExecutionReport::ok(text)
        } else {
            ExecutionReport::failed(text)
        };
        Ok(report.with_images(images))
    }
}

async fn list_images(dir: &Path) -> Result<Vec<String>> {
    let mut images = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "png") {
            images.push(path.display().to_string());
        }
    }
    images.sort();
    Ok(images)
}

/// Row and column counts plus the first `rows` records. Quoted fields are
/// parsed as CSV, so a quoted header may contain commas.
pub fn profile_csv(text: &str, rows: usize) -> Result<DataProfile> {
    let csv_error = |e: csv::Error| HitlError::ToolError {
        tool: "describe".into(),
        message: format!("malformed CSV: {e}"),
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let header = reader.headers().map_err(csv_error)?.clone();
    let columns: Vec<&str> = header.iter().filter(|c| !c.is_empty()).collect();

    let mut preview = csv::WriterBuilder::new()
        .flexible(true)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    if !header.is_empty() {
        preview.write_record(&header).map_err(csv_error)?;
    }
    let mut count = 0usize;
    for record in reader.records() {
        let record = record.map_err(csv_error)?;
        if count < rows {
            preview.write_record(&record).map_err(csv_error)?;
        }
        count += 1;
    }
    let preview = preview.into_inner().map_err(|e| HitlError::ToolError {
        tool: "describe".into(),
        message: e.to_string(),
    })?;

    Ok(DataProfile {
        summary: format!(
            "Shape: {count} rows, {} columns\nColumns: {}",
            columns.len(),
            columns.join(", ")
        ),
        preview: String::from_utf8_lossy(&preview).trim_end().to_string(),
    })
}

// ---------------------------------------------------------------------------
// StaticAnalysisTool
// ---------------------------------------------------------------------------

/// Returns fixed results. Every executed script is recorded.
#[derive(Clone)]
pub struct StaticAnalysisTool {
    profile: DataProfile,
    report: ExecutionReport,
    executed: Arc<Mutex<Vec<String>>>,
}

impl Default for StaticAnalysisTool {
    fn default() -> Self {
        Self {
            profile: DataProfile {
                summary: "Shape: 3 rows, 2 columns\nColumns: year, price".into(),
                preview: "year,price\n2020,10\n2021,12\n2022,15".into(),
            },
            report: ExecutionReport::ok("mean price: 12.33").with_images(["chart.png"]),
            executed: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl StaticAnalysisTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, profile: DataProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_report(mut self, report: ExecutionReport) -> Self {
        self.report = report;
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AnalysisTool for StaticAnalysisTool {
    async fn describe(&self, _file: &Path) -> Result<DataProfile> {
        Ok(self.profile.clone())
    }

    async fn execute(&self, code: &str, _file: Option<&Path>) -> Result<ExecutionReport> {
        if let Ok(mut executed) = self.executed.lock() {
            executed.push(code.to_string());
        }
        Ok(self.report.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_counts_rows_and_columns() {
        let profile = profile_csv("year, price\n2020,10\n\n2021,12\n2022,15\n", 2).unwrap();
        assert_eq!(profile.summary, "Shape: 3 rows, 2 columns\nColumns: year, price");
        assert_eq!(profile.preview, "year,price\n2020,10\n2021,12");
    }

    #[test]
    fn profile_keeps_quoted_header_fields_whole() {
        let profile = profile_csv("\"city, state\",population\n\"Austin, TX\",961855\n", 5).unwrap();
        assert_eq!(
            profile.summary,
            "Shape: 1 rows, 2 columns\nColumns: city, state, population"
        );
        assert_eq!(profile.preview, "\"city, state\",population\n\"Austin, TX\",961855");
    }

    #[test]
    fn profile_of_empty_file() {
        let profile = profile_csv("", 5).unwrap();
        assert!(profile.summary.starts_with("Shape: 0 rows, 0 columns"));
    }

    #[tokio::test]
    async fn describe_missing_file_is_tool_error() {
        let tool = ProcessAnalysisTool::new(AnalysisConfig::default());
        let err = tool.describe(Path::new("/definitely/not/here.csv")).await.unwrap_err();
        assert!(matches!(err, HitlError::ToolError { .. }));
    }

    #[tokio::test]
    async fn describe_reads_csv() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cars.csv");
        tokio::fs::write(&file, "make,price\nford,100\n").await.unwrap();
        let tool = ProcessAnalysisTool::new(AnalysisConfig::default());
        let profile = tool.describe(&file).await.unwrap();
        assert!(profile.summary.contains("1 rows, 2 columns"));
    }

    #[tokio::test]
    async fn missing_interpreter_is_tool_error() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ProcessAnalysisTool::new(AnalysisConfig {
            python: "hitl-no-such-interpreter".into(),
            output_dir: dir.path().to_path_buf(),
            ..AnalysisConfig::default()
        });
        let err = tool.execute("print(1)", None).await.unwrap_err();
        assert!(matches!(err, HitlError::ToolError { .. }));
    }

    #[tokio::test]
    async fn static_tool_records_code() {
        let tool = StaticAnalysisTool::new().with_report(ExecutionReport::failed("boom"));
        let report = tool.execute("print(1)", None).await.unwrap();
        assert!(!report.success);
        assert_eq!(tool.executed(), vec!["print(1)"]);
    }
}
