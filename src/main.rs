use clap::Parser;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use sniff_pool::config;
use sniff_pool::worker::{Position, Request, RequestData, WorkerPool};

#[derive(Parser, Debug)]
#[command(name = "sniff-pool")]
#[command(about = "Lint and format files through a pool of code sniffer processes", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Report findings for each file
    Diagnose {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Produce the edits fixing one finding
    Fix {
        file: PathBuf,
        /// Sniff code of the finding
        #[arg(long)]
        code: String,
        /// Zero-based line of the finding
        #[arg(long)]
        line: u32,
        /// Zero-based character of the finding
        #[arg(long, default_value_t = 0)]
        character: u32,
    },
    /// Format a file, optionally limited to a line range
    Format {
        file: PathBuf,
        /// Zero-based first line to format
        #[arg(long)]
        start_line: Option<u32>,
        /// Zero-based line to stop formatting at
        #[arg(long)]
        end_line: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("sniff_pool={log_level}").parse()?),
        )
        .init();

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            config::load_from_path(path)?
        }
        None => config::load_from_env_or_file()?,
    };
    debug!(?config, "Configuration loaded");

    let pool = WorkerPool::new(config.pool_size);
    let options = config.invocation_options();

    // Ctrl-C cancels every outstanding request
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let jobs: Vec<(PathBuf, RequestData)> = match args.command {
        Command::Diagnose { files } => unique_files(files)
            .into_iter()
            .map(|file| (file, RequestData::Diagnostic))
            .collect(),
        Command::Fix {
            file,
            code,
            line,
            character,
        } => {
            let position = Position::new(line, character);
            vec![(file, RequestData::CodeAction { code, position })]
        }
        Command::Format {
            file,
            start_line,
            end_line,
        } => {
            let start = start_line.map(|line| Position::new(line, 0));
            let end = end_line.map(|line| Position::new(line, 0));
            vec![(file, RequestData::Format { start, end })]
        }
    };

    let mut handles: Vec<(PathBuf, JoinHandle<sniff_pool::error::Result<String>>)> =
        Vec::with_capacity(jobs.len());
    for (file, data) in jobs {
        let pool = pool.clone();
        let options = options.clone();
        let working_directory = config.working_directory.clone();
        let cancel = cancel.child_token();
        let task_file = file.clone();
        handles.push((
            file,
            tokio::spawn(async move {
                let content = read_document(&task_file).await?;
                let mut request = Request::new(data, content, options).with_file_path(&task_file);
                if let Some(dir) = working_directory {
                    request = request.with_working_directory(dir);
                }

                let key = task_file.display().to_string();
                let lease = pool.wait_for_available(key, Some(cancel.clone())).await?;
                let response = lease.execute(request, Some(cancel)).await?;

                let output = serde_json::json!({
                    "file": task_file,
                    "response": response,
                });
                Ok(serde_json::to_string_pretty(&output)?)
            }),
        ));
    }

    let total = handles.len();
    let mut failed = 0;
    for (file, handle) in handles {
        match handle.await? {
            Ok(output) => println!("{output}"),
            Err(e) => {
                failed += 1;
                error!(file = %file.display(), error = %e, "Request failed");
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {total} requests failed");
    }
    Ok(())
}

async fn read_document(path: &Path) -> sniff_pool::error::Result<String> {
    let content = tokio::fs::read_to_string(path).await?;
    debug!(file = %path.display(), bytes = content.len(), "Read document");
    Ok(content)
}

/// Drop repeated paths, keeping the first occurrence
///
/// Waits are keyed by path, so a repeated file would replace its own twin.
fn unique_files(files: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    files
        .into_iter()
        .filter(|file| seen.insert(file.clone()))
        .collect()
}
