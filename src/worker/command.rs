//! Translation of a request into a tool process invocation

use crate::worker::schema::{ReportKind, Request, Standard, WorkerError};
use serde::Serialize;
use std::path::PathBuf;

/// Environment variable carrying the request envelope
pub const INPUT_ENV_VAR: &str = "TOOL_INPUT";

/// Version of the envelope written to [`INPUT_ENV_VAR`]
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Envelope the tool reads from [`INPUT_ENV_VAR`] to validate compatibility
#[derive(Debug, Serialize)]
pub struct ToolInput {
    pub version: &'static str,
    #[serde(rename = "type")]
    pub kind: ReportKind,
    pub data: Option<serde_json::Value>,
}

/// Everything needed to spawn the tool for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_directory: Option<PathBuf>,
    /// Line written to stdin ahead of the document
    pub input_header: Option<String>,
}

impl Invocation {
    pub fn from_request(request: &Request) -> Result<Self, WorkerError> {
        let mut tokens = split_command_line(&request.options.executable)?.into_iter();
        let program = tokens.next().ok_or_else(|| WorkerError::InvalidExecutable {
            reason: "executable is empty".to_string(),
        })?;

        let mut args: Vec<String> = tokens.collect();
        args.extend(tool_arguments(&request.options.report, &request.options.standard));

        let input = ToolInput {
            version: PROTOCOL_VERSION,
            kind: request.kind(),
            data: request.data.payload(),
        };
        let input = serde_json::to_string(&input).map_err(|e| WorkerError::Io {
            reason: format!("Failed to serialize tool input: {}", e),
        })?;

        let input_header = request
            .file_path
            .as_ref()
            .map(|path| format!("input_file: {}\n", path.display()));

        Ok(Self {
            program,
            args,
            env: vec![(INPUT_ENV_VAR.to_string(), input)],
            working_directory: request.working_directory.clone(),
            input_header,
        })
    }
}

/// Fixed tool flags followed by the optional standard and the stdin marker
pub fn tool_arguments(report: &str, standard: &Standard) -> Vec<String> {
    let mut args = vec![
        "-q".to_string(),
        format!("--report={}", report),
        "--runtime-set".to_string(),
        "ignore_warnings_on_exit".to_string(),
        "1".to_string(),
        "--runtime-set".to_string(),
        "ignore_errors_on_exit".to_string(),
        "1".to_string(),
    ];

    if let Standard::Named(name) = standard {
        args.push(format!("--standard={}", name));
    }

    args.push("-".to_string());
    args
}

/// Split an executable string into tokens, honouring `'`, `"` and `` ` `` quoting
///
/// Quotes are removed and a quoted segment joins any text directly next to
/// it, so `"C:\Program Files\php.exe" -d "memory_limit=1G"` yields three
/// tokens.
pub fn split_command_line(command: &str) -> Result<Vec<String>, WorkerError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in command.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '"' | '\'' | '`' => {
                    quote = Some(c);
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                c => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }

    if let Some(q) = quote {
        return Err(WorkerError::InvalidExecutable {
            reason: format!("unterminated {} quote in '{}'", q, command),
        });
    }

    if in_token {
        tokens.push(current);
    }

    if tokens.is_empty() {
        return Err(WorkerError::InvalidExecutable {
            reason: "executable is empty".to_string(),
        });
    }

    Ok(tokens)
}
