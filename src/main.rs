//! Purpose: `colserve` CLI entry point: serve a data directory over HTTP or run one query locally.
//! Role: Binary crate root; parses args, dispatches commands, maps errors to exit codes.
//! Invariants: Errors go to stderr (text on a terminal, JSON otherwise).
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Binary Parquet output is never written to an interactive terminal.
#![allow(clippy::result_large_err)]
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use std::error::Error as StdError;

mod data_paths;
mod serve;

use colserve::api::{
    CancelFlag, DEFAULT_BATCH_SIZE, EncodeCompression, EncodeOptions, Error, ErrorKind,
    QueryOptions, QueryParams, ScanOptions, execute_query_with, to_exit_code,
};
use data_paths::default_data_dir;

const DEFAULT_BIND: &str = "127.0.0.1:5000";
const DEFAULT_MAX_CONCURRENT_QUERIES: usize = 32;

struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Run `colserve --help` for usage."));
            }
        },
    };

    let result = match cli.command {
        Command::Serve(args) => run_serve(args),
        Command::Query(args) => run_query(args),
    };
    result.map(|()| RunOutcome::ok())
}

#[derive(Parser)]
#[command(
    name = "colserve",
    version,
    about = "Serve Parquet tables over HTTP with column projection and numeric filters",
    long_about = None,
    after_help = r#"EXAMPLES
  $ colserve serve --data-dir /storage/catalogs
  $ curl 'http://127.0.0.1:5000/gaia/Npix=754.parquet?cols=ra,dec&query=ra>=30.1,dec<=-30.3' -o out.parquet
  $ colserve query ./Npix=754.parquet --cols ra,dec --query 'ra>=30.1' --out out.parquet"#,
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Serve Parquet files under a data directory over HTTP (loopback default)",
        after_help = r#"EXAMPLES
  $ colserve serve
  $ colserve serve --data-dir /storage/catalogs --bind 127.0.0.1:8080

NOTES
  - GET /<path>?cols=a,b&query=a>1,b<=2&exclude_cols=c returns Parquet bytes
  - Filtered responses never include the _hipscat_index column
  - Non-loopback binds require --allow-non-loopback
  - Set RUST_LOG to adjust log verbosity (default: info)"#
    )]
    Serve(ServeArgs),
    #[command(
        arg_required_else_help = true,
        about = "Run one query against a local Parquet file",
        after_help = r#"EXAMPLES
  $ colserve query data.parquet --cols ra,dec --out subset.parquet
  $ colserve query data.parquet --query 'mag_r<18.5' > bright.parquet"#
    )]
    Query(QueryArgs),
}

#[derive(Args)]
struct ServeArgs {
    #[arg(
        long,
        value_name = "DIR",
        help = "Directory whose files are served (default: current directory)",
        value_hint = ValueHint::DirPath
    )]
    data_dir: Option<PathBuf>,
    #[arg(long, default_value = DEFAULT_BIND, help = "Bind address", help_heading = "Connection")]
    bind: String,
    #[arg(
        long,
        help = "Allow non-loopback binds (no authentication is performed)",
        help_heading = "Safety"
    )]
    allow_non_loopback: bool,
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_CONCURRENT_QUERIES,
        help = "Max queries executing at once",
        help_heading = "Safety"
    )]
    max_concurrent_queries: usize,
    #[arg(
        long,
        default_value_t = DEFAULT_BATCH_SIZE,
        help = "Rows per record batch while scanning",
        help_heading = "Tuning"
    )]
    batch_size: usize,
}

#[derive(Args)]
struct QueryArgs {
    #[arg(help = "Parquet file to query", value_hint = ValueHint::FilePath)]
    file: PathBuf,
    #[arg(long, value_name = "COLS", help = "Comma-separated columns to return, in order")]
    cols: Option<String>,
    #[arg(long, value_name = "EXPR", help = "Comma-separated filters, e.g. 'ra>=30.1,dec<=-30.3'")]
    query: Option<String>,
    #[arg(long, value_name = "COLS", help = "Comma-separated columns to leave out")]
    exclude_cols: Option<String>,
    #[arg(
        long,
        short = 'o',
        value_name = "PATH",
        help = "Write output here instead of stdout",
        value_hint = ValueHint::FilePath
    )]
    out: Option<PathBuf>,
    #[arg(long, value_enum, default_value = "none", help = "Output compression")]
    compression: CompressionCli,
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE, help = "Rows per record batch while scanning")]
    batch_size: usize,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum CompressionCli {
    None,
    Snappy,
    Zstd,
}

impl From<CompressionCli> for EncodeCompression {
    fn from(value: CompressionCli) -> Self {
        match value {
            CompressionCli::None => EncodeCompression::None,
            CompressionCli::Snappy => EncodeCompression::Snappy,
            CompressionCli::Zstd => EncodeCompression::Zstd,
        }
    }
}

fn run_serve(args: ServeArgs) -> Result<(), Error> {
    let bind: SocketAddr = args.bind.parse().map_err(|_| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid bind address")
            .with_hint("Use a host:port value like 127.0.0.1:5000.")
    })?;
    let config = serve::ServeConfig {
        bind,
        data_dir: args.data_dir.unwrap_or_else(default_data_dir),
        allow_non_loopback: args.allow_non_loopback,
        batch_size: args.batch_size,
        max_concurrent_queries: args.max_concurrent_queries,
    };
    let runtime = tokio::runtime::Runtime::new().map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to start runtime")
            .with_source(err)
    })?;
    runtime.block_on(serve::serve(config))
}

fn run_query(args: QueryArgs) -> Result<(), Error> {
    if args.batch_size == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--batch-size must be greater than zero")
            .with_hint("Use a positive value like 8192."));
    }
    if args.out.is_none() && io::stdout().is_terminal() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("refusing to write binary parquet to a terminal")
            .with_hint("Pass --out <PATH> or redirect stdout."));
    }
    if !args.file.is_file() {
        return Err(Error::new(ErrorKind::NotFound)
            .with_message("file not found")
            .with_path(&args.file));
    }

    let params = QueryParams {
        cols: args.cols,
        query: args.query,
        exclude_cols: args.exclude_cols,
    };
    let options = QueryOptions {
        scan: ScanOptions {
            batch_size: args.batch_size,
        },
        encode: EncodeOptions {
            compression: args.compression.into(),
        },
    };
    let bytes = execute_query_with(&args.file, &params, options, &CancelFlag::new())?;

    match args.out {
        Some(path) => {
            std::fs::write(&path, &bytes).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to write output")
                    .with_path(&path)
                    .with_source(err)
            })?;
            println!(
                "{}",
                json!({ "path": path.display().to_string(), "bytes": bytes.len() })
            );
        }
        None => {
            let mut stdout = io::stdout().lock();
            stdout
                .write_all(&bytes)
                .and_then(|()| stdout.flush())
                .map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write output")
                        .with_source(err)
                })?;
        }
    }
    Ok(())
}

fn clap_error_summary(err: &clap::Error) -> String {
    let rendered = err.to_string();
    rendered
        .lines()
        .next()
        .unwrap_or("invalid arguments")
        .trim_start_matches("error: ")
        .to_string()
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::InvalidPredicateSyntax => "invalid query expression".to_string(),
        ErrorKind::UnknownColumn => "unknown column".to_string(),
        ErrorKind::SourceUnreadable => "source is unreadable".to_string(),
        ErrorKind::Busy => "resource is busy".to_string(),
        ErrorKind::Cancelled => "cancelled".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(segment) = err.segment() {
        inner.insert("segment".to_string(), json!(segment));
    }
    if let Some(column) = err.column() {
        inner.insert("column".to_string(), json!(column));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(segment) = err.segment() {
        lines.push(format!("segment: {segment}"));
    }
    if let Some(column) = err.column() {
        lines.push(format!("column: {column}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    for cause in error_causes(err) {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}
