//! Request/response envelope definitions and output parsing
//!
//! A `Request` describes one linting or formatting operation against a single
//! document. The tool answers with a JSON aggregate over one or more files
//! which is parsed back into a typed `Response` of the same kind.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;

/// Operation a request asks the tool to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportKind {
    /// Lint the document and report findings
    Diagnostic,
    /// Produce the edits fixing a single finding
    CodeAction,
    /// Format the whole document or a range of it
    Format,
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportKind::Diagnostic => f.write_str("Diagnostic"),
            ReportKind::CodeAction => f.write_str("CodeAction"),
            ReportKind::Format => f.write_str("Format"),
        }
    }
}

/// Zero-based line/character position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    pub fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

/// Half-open range between two positions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

/// Coding standard selection
///
/// `Disabled` skips execution entirely and `Default` lets the tool pick its
/// own standard, so `--standard` is omitted from the arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Standard {
    Disabled,
    #[default]
    Default,
    Named(String),
}

impl From<String> for Standard {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Disabled" => Standard::Disabled,
            "Default" | "" => Standard::Default,
            _ => Standard::Named(value),
        }
    }
}

impl From<&str> for Standard {
    fn from(value: &str) -> Self {
        Standard::from(value.to_string())
    }
}

impl From<Standard> for String {
    fn from(value: Standard) -> Self {
        match value {
            Standard::Disabled => "Disabled".to_string(),
            Standard::Default => "Default".to_string(),
            Standard::Named(name) => name,
        }
    }
}

/// How the external tool is invoked for a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOptions {
    /// Executable, possibly followed by quoted prefix arguments
    pub executable: String,
    /// Active coding standard
    pub standard: Standard,
    /// Value passed to `--report=`
    pub report: String,
}

/// Kind-specific request payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestData {
    Diagnostic,
    CodeAction {
        /// Sniff code of the finding to fix
        code: String,
        /// Position of the finding in the document
        position: Position,
    },
    Format {
        start: Option<Position>,
        end: Option<Position>,
    },
}

impl RequestData {
    pub fn kind(&self) -> ReportKind {
        match self {
            RequestData::Diagnostic => ReportKind::Diagnostic,
            RequestData::CodeAction { .. } => ReportKind::CodeAction,
            RequestData::Format { .. } => ReportKind::Format,
        }
    }

    /// Payload sent to the tool alongside the document
    pub fn payload(&self) -> Option<serde_json::Value> {
        match self {
            RequestData::Diagnostic => None,
            RequestData::CodeAction { code, position } => Some(serde_json::json!({
                "code": code,
                "position": position,
            })),
            RequestData::Format { start, end } => {
                let mut data = serde_json::Map::new();
                if let Some(start) = start {
                    data.insert("start".to_string(), serde_json::json!(start));
                }
                if let Some(end) = end {
                    data.insert("end".to_string(), serde_json::json!(end));
                }
                Some(serde_json::Value::Object(data))
            }
        }
    }
}

/// A single linting or formatting operation
#[derive(Debug, Clone)]
pub struct Request {
    pub data: RequestData,
    /// Working directory for the tool process
    pub working_directory: Option<PathBuf>,
    /// Logical path of the document, used by path-dependent rules
    pub file_path: Option<PathBuf>,
    /// Full document text
    pub content: String,
    pub options: ToolOptions,
}

impl Request {
    pub fn new(data: RequestData, content: impl Into<String>, options: ToolOptions) -> Self {
        Self {
            data,
            working_directory: None,
            file_path: None,
            content: content.into(),
            options,
        }
    }

    pub fn diagnostic(content: impl Into<String>, options: ToolOptions) -> Self {
        Self::new(RequestData::Diagnostic, content, options)
    }

    pub fn code_action(
        content: impl Into<String>,
        options: ToolOptions,
        code: impl Into<String>,
        position: Position,
    ) -> Self {
        let data = RequestData::CodeAction {
            code: code.into(),
            position,
        };
        Self::new(data, content, options)
    }

    pub fn format(
        content: impl Into<String>,
        options: ToolOptions,
        start: Option<Position>,
        end: Option<Position>,
    ) -> Self {
        Self::new(RequestData::Format { start, end }, content, options)
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn kind(&self) -> ReportKind {
        self.data.kind()
    }

    /// Whether running the tool can be skipped because it cannot report anything
    pub fn should_skip(&self) -> bool {
        self.options.standard == Standard::Disabled || self.content.is_empty()
    }
}

/// Finding severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

impl Severity {
    /// Maps the tool's numeric severity; anything else is unrecognized
    fn from_wire(value: &serde_json::Value) -> Option<Self> {
        match value.as_u64() {
            Some(0) => Some(Severity::Error),
            Some(1) => Some(Severity::Warning),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub code: String,
    pub message: String,
    pub range: Range,
    pub severity: Severity,
}

/// Quick fix offered for a diagnostic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeAction {
    pub title: String,
    pub kind: String,
    /// Index into the report's `diagnostics`
    pub diagnostic: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextEdit {
    pub range: Range,
    pub new_text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticReport {
    pub diagnostics: Vec<Diagnostic>,
    pub code_actions: Vec<CodeAction>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeActionReport {
    pub edits: Vec<TextEdit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatReport {
    /// Replacement text for the requested range
    pub content: String,
}

/// Typed result of a request; `None` means there is nothing to report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "report")]
pub enum Response {
    Diagnostic(Option<DiagnosticReport>),
    CodeAction(Option<CodeActionReport>),
    Format(Option<FormatReport>),
}

impl Response {
    pub fn empty(kind: ReportKind) -> Self {
        match kind {
            ReportKind::Diagnostic => Response::Diagnostic(None),
            ReportKind::CodeAction => Response::CodeAction(None),
            ReportKind::Format => Response::Format(None),
        }
    }

    pub fn kind(&self) -> ReportKind {
        match self {
            Response::Diagnostic(_) => ReportKind::Diagnostic,
            Response::CodeAction(_) => ReportKind::CodeAction,
            Response::Format(_) => ReportKind::Format,
        }
    }

    pub fn has_report(&self) -> bool {
        match self {
            Response::Diagnostic(report) => report.is_some(),
            Response::CodeAction(report) => report.is_some(),
            Response::Format(report) => report.is_some(),
        }
    }

    /// Parse raw tool output into a response of the given kind
    ///
    /// Text surrounding the outermost JSON object is ignored. Empty output
    /// means the tool had nothing to report.
    pub fn parse(
        kind: ReportKind,
        file_path: Option<&Path>,
        output: &str,
    ) -> Result<Self, WorkerError> {
        if output.trim().is_empty() {
            return Ok(Response::empty(kind));
        }

        let json = extract_json(output).ok_or_else(|| WorkerError::InvalidOutput {
            reason: "no JSON object found in tool output".to_string(),
        })?;

        let report: RawReport =
            serde_json::from_str(json).map_err(|e| WorkerError::InvalidOutput {
                reason: format!("Failed to parse tool output: {}", e),
            })?;

        let Some(file) = report.select(file_path) else {
            return Ok(Response::empty(kind));
        };

        Ok(match kind {
            ReportKind::Diagnostic => Response::Diagnostic(file.into_diagnostic_report()),
            ReportKind::CodeAction => {
                let edits = file.text_edits.unwrap_or_default();
                Response::CodeAction((!edits.is_empty()).then_some(CodeActionReport { edits }))
            }
            ReportKind::Format => {
                Response::Format(file.content.map(|content| FormatReport { content }))
            }
        })
    }
}

static JSON_OBJECT: LazyLock<Regex> = LazyLock::new(|| {
    // Greedy on purpose: the payload is the outermost object in the output
    Regex::new(r"(?s)\{.*\}").expect("valid JSON object pattern")
});

/// Strip banner text or trailing noise around the JSON payload
pub fn extract_json(output: &str) -> Option<&str> {
    JSON_OBJECT.find(output).map(|m| m.as_str())
}

#[derive(Debug, Deserialize)]
struct RawReport {
    #[serde(default)]
    files: Vec<RawFile>,
}

impl RawReport {
    fn select(self, file_path: Option<&Path>) -> Option<RawFile> {
        let mut files = self.files;
        let position = file_path.and_then(|path| {
            files
                .iter()
                .position(|file| file.filename.as_deref().map(Path::new) == Some(path))
        });
        match position {
            Some(index) => Some(files.swap_remove(index)),
            None if files.is_empty() => None,
            None => Some(files.swap_remove(0)),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFile {
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    diagnostics: Option<Vec<RawDiagnostic>>,
    #[serde(default)]
    code_actions: Option<Vec<RawCodeAction>>,
    #[serde(default)]
    text_edits: Option<Vec<TextEdit>>,
    #[serde(default)]
    content: Option<String>,
}

impl RawFile {
    fn into_diagnostic_report(self) -> Option<DiagnosticReport> {
        let raw = self.diagnostics.unwrap_or_default();

        // Dropping a diagnostic shifts the ones after it, so quick fixes are
        // re-pointed through this table.
        let mut remap = Vec::with_capacity(raw.len());
        let mut diagnostics = Vec::with_capacity(raw.len());
        for diagnostic in raw {
            match Severity::from_wire(&diagnostic.severity) {
                Some(severity) => {
                    remap.push(Some(diagnostics.len()));
                    diagnostics.push(Diagnostic {
                        code: diagnostic.code,
                        message: diagnostic.message,
                        range: diagnostic.range,
                        severity,
                    });
                }
                None => remap.push(None),
            }
        }

        let code_actions: Vec<CodeAction> = self
            .code_actions
            .unwrap_or_default()
            .into_iter()
            .filter_map(|action| {
                let index = remap.get(action.diagnostic).copied().flatten()?;
                Some(CodeAction {
                    title: action.title,
                    kind: action.kind,
                    diagnostic: index,
                })
            })
            .collect();

        if diagnostics.is_empty() && code_actions.is_empty() {
            return None;
        }

        Some(DiagnosticReport {
            diagnostics,
            code_actions,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawDiagnostic {
    code: String,
    message: String,
    range: Range,
    severity: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RawCodeAction {
    title: String,
    #[serde(default)]
    kind: String,
    diagnostic: usize,
}

/// Errors produced by workers, the pool and the pending registry
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The operation was cancelled through its cancellation token
    #[error("Operation was cancelled")]
    Cancelled,

    /// A newer wait was registered under the same key
    #[error("Pending request '{key}' was replaced by a newer request")]
    Replaced { key: String },

    /// The configured executable does not exist
    #[error("Executable '{program}' was not found; check the configured executable path")]
    ExecutableNotFound { program: String },

    /// The tool process could not be started
    #[error("Failed to spawn '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },

    /// The tool exited with a non-zero status
    #[error("Tool exited with code {code:?}: {stderr}")]
    ToolFailed {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// The tool produced output that could not be parsed
    #[error("Tool returned invalid output: {reason}")]
    InvalidOutput { reason: String },

    /// The configured executable string could not be tokenized
    #[error("Invalid executable: {reason}")]
    InvalidExecutable { reason: String },

    /// stdin/stdout/stderr handling failed
    #[error("Worker I/O error: {reason}")]
    Io { reason: String },

    /// `execute` was called on a worker that is already running a request
    #[error("Worker {worker} is already busy")]
    Busy { worker: usize },
}

impl WorkerError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, WorkerError::Cancelled)
    }

    pub fn is_replaced(&self) -> bool {
        matches!(self, WorkerError::Replaced { .. })
    }
}
