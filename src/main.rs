//! Purpose: `tenzir-client` CLI entry point.
//! Role: Binary crate root; parses args, builds a client, runs one command.
//! Invariants: Command results are JSON on stdout; exports print one object per line.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Logs go to stderr so stdout stays machine-readable.
#![allow(clippy::result_large_err)]
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::time::Duration;

use clap::{
    CommandFactory, Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind,
};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tenzir_client::api::{
    Client, ClientConfig, Encoding, Error, ErrorKind, ExportMode, to_exit_code,
};
use tenzir_client::core::endpoint::{DEFAULT_HOST, DEFAULT_PORT};
use tenzir_client::core::invocation::DEFAULT_PROGRAM;
use tracing_subscriber::EnvFilter;

mod analyze;
mod command_dispatch;

#[derive(Copy, Clone, Debug)]
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
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
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
                let message = clap_error_summary(&err);
                let hint = clap_error_hint(&err);
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(message)
                        .with_hint(hint),
                    ColorMode::Auto,
                ));
            }
        },
    };

    init_tracing();
    let color_mode = cli.color;
    let settings = ClientSettings {
        endpoint: cli.endpoint,
        program: cli.program,
        timeout: cli.timeout_ms.map(Duration::from_millis),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            (
                Error::new(ErrorKind::Internal)
                    .with_message("failed to start runtime")
                    .with_source(err),
                color_mode,
            )
        })?;
    let result = runtime.block_on(command_dispatch::dispatch_command(
        cli.command,
        &settings,
        color_mode,
    ));
    // Give dropped sessions a chance to finish tearing their engines down.
    runtime.shutdown_timeout(tenzir_client::api::DEFAULT_GRACE_PERIOD);

    result
        .map_err(add_engine_hint)
        .map_err(add_internal_hint)
        .map_err(|err| (err, color_mode))
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

#[derive(Parser)]
#[command(
    name = "tenzir-client",
    version,
    about = "Query a Tenzir node from the command line",
    help_template = r#"{about-with-newline}
{before-help}USAGE
  {usage}

COMMANDS
{subcommands}

OPTIONS
{options}

{after-help}
"#,
    long_about = None,
    before_help = r#"Runs tenzir-ctl against a node and prints results as JSON.

Mental model:
  - `probe` checks that the node answers
  - `count` counts matching events
  - `export` streams matching events, one JSON object per line
"#,
    after_help = r#"EXAMPLES
  $ tenzir-client probe
  $ tenzir-client count ':ip == 147.32.84.165'
  $ tenzir-client export --max-events 10 '#schema == "suricata.alert"'
  $ tenzir-client export --mode continuous --encoding arrow
  $ echo '{"dataType":"ip","data":"10.0.0.1","config":{}}' | tenzir-client analyze

LEARN MORE
  $ tenzir-client <command> --help"#,
    arg_required_else_help = true,
    disable_help_subcommand = false
)]
struct Cli {
    #[arg(
        long,
        env = "TENZIR_ENDPOINT",
        default_value = "localhost:5158",
        help = "Node endpoint as host:port"
    )]
    endpoint: String,
    #[arg(
        long,
        env = "TENZIR_CTL",
        default_value = DEFAULT_PROGRAM,
        value_hint = ValueHint::CommandName,
        help = "Control program used to reach the node"
    )]
    program: PathBuf,
    #[arg(
        long = "timeout-ms",
        value_name = "MS",
        help = "Bound for probe, status, and count in milliseconds"
    )]
    timeout_ms: Option<u64>,
    #[arg(
        long,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics and force pretty-printed JSON: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ModeCli {
    Historical,
    Continuous,
    Unified,
}

impl From<ModeCli> for ExportMode {
    fn from(value: ModeCli) -> Self {
        match value {
            ModeCli::Historical => ExportMode::Historical,
            ModeCli::Continuous => ExportMode::Continuous,
            ModeCli::Unified => ExportMode::Unified,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum EncodingCli {
    Json,
    Arrow,
}

impl From<EncodingCli> for Encoding {
    fn from(value: EncodingCli) -> Self {
        match value {
            EncodingCli::Json => Encoding::Json,
            EncodingCli::Arrow => Encoding::Arrow,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Check that the node answers",
        long_about = r#"Runs `status` against the node within the timeout.

Prints {"connected": true|false}. Exits 0 when connected and 3 otherwise."#
    )]
    Probe,
    #[command(about = "Print the node status document")]
    Status,
    #[command(
        about = "Count events matching an expression",
        after_help = r#"EXAMPLES
  $ tenzir-client count
  $ tenzir-client count ':ip in 10.0.0.0/8'"#
    )]
    Count {
        #[arg(help = "Query expression (omit to count everything)")]
        expr: Option<String>,
    },
    #[command(
        about = "Stream events matching an expression",
        long_about = r#"Streams matching events as JSON lines: {"schema": ..., "data": {...}}.

Historical exports end when the node has replayed all matches. Continuous and
unified exports run until Ctrl-C or until --max-events is reached."#,
        after_help = r#"EXAMPLES
  $ tenzir-client export --max-events 5
  $ tenzir-client export --encoding arrow '#schema == "suricata.dns"'
  $ tenzir-client export --mode unified ':ip == 10.0.0.1'"#
    )]
    Export {
        #[arg(help = "Query expression (omit to export everything)")]
        expr: Option<String>,
        #[arg(
            long,
            value_enum,
            default_value = "historical",
            help = "historical|continuous|unified"
        )]
        mode: ModeCli,
        #[arg(
            long,
            value_enum,
            default_value = "json",
            help = "Wire encoding requested from the node"
        )]
        encoding: EncodingCli,
        #[arg(long = "max-events", value_name = "N", help = "Stop after N events")]
        max_events: Option<u64>,
    },
    #[command(
        about = "Run a Cortex analyzer job read from stdin",
        long_about = r#"Reads a Cortex job {"dataType", "data", "config": {"endpoint", "max_events"}}
from stdin, looks up the observable, and prints the Cortex report on stdout.

Supported data types: ip, subnet, hash, domain."#
    )]
    Analyze,
    #[command(about = "Print version info")]
    Version,
    #[command(
        arg_required_else_help = true,
        about = "Generate shell completions",
        after_help = r#"EXAMPLES
  $ tenzir-client completion bash > ~/.local/share/bash-completion/completions/tenzir-client
  $ tenzir-client completion zsh > ~/.zfunc/_tenzir-client
  $ tenzir-client completion fish > ~/.config/fish/completions/tenzir-client.fish"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

/// Connection settings shared by every command.
struct ClientSettings {
    endpoint: String,
    program: PathBuf,
    timeout: Option<Duration>,
}

impl ClientSettings {
    fn config(&self) -> ClientConfig {
        let mut config = ClientConfig::new().with_program(&self.program);
        if let Some(timeout) = self.timeout {
            config = config
                .with_probe_timeout(timeout)
                .with_count_timeout(timeout);
        }
        config
    }

    fn client(&self) -> Result<Client, Error> {
        self.client_for(&self.endpoint)
    }

    fn client_for(&self, endpoint: &str) -> Result<Client, Error> {
        Ok(Client::new(endpoint)?.with_config(self.config()))
    }
}

fn add_engine_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Unreachable => err.with_hint(format!(
            "Check that a node listens on the endpoint (default {DEFAULT_HOST}:{DEFAULT_PORT}) or pass --endpoint."
        )),
        ErrorKind::Timeout => err.with_hint(
            "The node did not answer in time. Raise --timeout-ms or check node load.",
        ),
        ErrorKind::Execution => err.with_hint(
            "The engine rejected the command. Check the query expression and the stderr above.",
        ),
        ErrorKind::Io => err.with_hint("I/O error while talking to the engine process."),
        _ => err,
    }
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with RUST_LOG=debug and share command/context if it persists.",
    )
}

fn emit_version_output(color_mode: ColorMode) {
    if io::stdout().is_terminal() {
        println!("tenzir-client {}", env!("CARGO_PKG_VERSION"));
    } else {
        emit_json(
            json!({
                "name": "tenzir-client",
                "version": env!("CARGO_PKG_VERSION"),
            }),
            color_mode,
        );
    }
}

fn emit_json(value: Value, color_mode: ColorMode) {
    let is_tty = io::stdout().is_terminal();
    let pretty = is_tty || matches!(color_mode, ColorMode::Always);
    let json = if pretty {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
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
        ErrorKind::Unreachable => "engine unreachable".to_string(),
        ErrorKind::Execution => "engine command failed".to_string(),
        ErrorKind::Protocol => "unexpected engine output".to_string(),
        ErrorKind::Timeout => "engine timed out".to_string(),
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
    if let Some(code) = err.exit_code() {
        inner.insert("exit_code".to_string(), json!(code));
    }
    if let Some(input) = err.input() {
        inner.insert("input".to_string(), json!(input));
    }
    if let Some(stderr) = err.stderr() {
        inner.insert("stderr".to_string(), json!(stderr.trim()));
    }
    if let Some(raw) = err.raw_preview() {
        inner.insert("raw".to_string(), json!(raw));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    ));

    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(input) = err.input() {
        lines.push(format!(
            "{} {input}",
            colorize_label("input:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(stderr) = err.stderr() {
        lines.push(format!(
            "{} {}",
            colorize_label("stderr:", use_color, AnsiColor::Yellow),
            stderr.trim()
        ));
    }
    if let Some(raw) = err.raw_preview() {
        lines.push(format!(
            "{} {raw:?}",
            colorize_label("raw:", use_color, AnsiColor::Yellow)
        ));
    }

    let causes = error_causes(err);
    if let Some(cause) = causes.first() {
        lines.push(format!(
            "{} {cause}",
            colorize_label("caused by:", use_color, AnsiColor::Yellow)
        ));
    }

    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn clap_error_hint(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let usage = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: "))
        .map(str::trim);

    let Some(usage) = usage else {
        return "Try `tenzir-client --help`.".to_string();
    };

    let tokens: Vec<&str> = usage.split_whitespace().collect();
    let Some(pos) = tokens.iter().position(|t| *t == "tenzir-client") else {
        return "Try `tenzir-client --help`.".to_string();
    };

    let parts: Vec<&str> = tokens
        .iter()
        .skip(pos + 1)
        .take_while(|token| {
            !(token.starts_with('-') || token.starts_with('<') || token.starts_with('['))
        })
        .copied()
        .collect();

    if parts.is_empty() {
        return "Try `tenzir-client --help`.".to_string();
    }
    format!("Try `tenzir-client {} --help`.", parts.join(" "))
}
