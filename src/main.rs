//! Purpose: `threadctl` CLI entry point.
//! Role: Binary crate root; parses args, scans the process, emits JSON on stdout.
//! Invariants: The report is a pretty-printed JSON array on stdout.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `to_exit_code`.
use std::io;
use std::path::PathBuf;

use clap::{CommandFactory, Parser, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

use threadctl::core::dylib::Dylib;
use threadctl::{Error, ErrorKind, info, to_exit_code};

#[derive(Parser)]
#[command(
    name = "threadctl",
    version,
    about = "Inspect the thread pools of BLAS and OpenMP libraries loaded in a process",
    help_template = r#"{about-with-newline}
USAGE
  {usage}

OPTIONS
{options}

{after-help}
"#,
    after_help = r#"EXAMPLES
  $ threadctl
  $ threadctl --load /usr/lib/x86_64-linux-gnu/libopenblas.so
  $ RUST_LOG=debug threadctl"#
)]
struct Cli {
    #[arg(
        short = 'l',
        long,
        value_name = "PATH",
        help = "Shared library to load before scanning (repeatable)"
    )]
    load: Vec<PathBuf>,

    #[arg(long, value_name = "SHELL", help = "Generate shell completions and exit")]
    completions: Option<Shell>,
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<i32, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                return Ok(0);
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage).with_message(err.to_string()));
            }
        },
    };

    if let Some(shell) = cli.completions {
        let mut cmd = Cli::command();
        clap_complete::aot::generate(shell, &mut cmd, "threadctl", &mut io::stdout());
        return Ok(0);
    }

    // Handles stay alive until after the scan so the preloaded libraries are
    // still mapped when the report is taken.
    let mut preloaded = Vec::with_capacity(cli.load.len());
    for path in &cli.load {
        match Dylib::load(path) {
            Ok(handle) => preloaded.push(handle),
            Err(err) => eprintln!("WARNING: could not load {}: {err}", path.display()),
        }
    }

    let report = info();
    let json = serde_json::to_string_pretty(&report).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode report")
            .with_source(err)
    })?;
    println!("{json}");
    drop(preloaded);
    Ok(0)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn emit_error(err: &Error) {
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(err.to_string()));
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(symbol) = err.symbol() {
        inner.insert("symbol".to_string(), json!(symbol));
    }
    if let Some(backend) = err.backend() {
        inner.insert("backend".to_string(), json!(backend));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}
