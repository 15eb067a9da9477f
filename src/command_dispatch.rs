//! Purpose: Hold top-level CLI command dispatch for `tenzir-client`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Export output is flushed per record so continuous results show up live.
//! Invariants: Ctrl-C and a closed stdout cancel a running export before exit.

use super::*;
use std::io::Write;
use tenzir_client::api::{ExportRequest, ExportSession, Query, Record};
use tokio::io::AsyncReadExt;
use tracing::info;

pub(super) async fn dispatch_command(
    command: Command,
    settings: &ClientSettings,
    color_mode: ColorMode,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "tenzir-client", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Version => {
            emit_version_output(color_mode);
            Ok(RunOutcome::ok())
        }
        Command::Probe => {
            let connected = settings.client()?.test_connection().await;
            emit_json(json!({ "connected": connected }), color_mode);
            if connected {
                Ok(RunOutcome::ok())
            } else {
                Ok(RunOutcome::with_code(to_exit_code(ErrorKind::Unreachable)))
            }
        }
        Command::Status => {
            let status = settings.client()?.status().await?;
            emit_json(status, color_mode);
            Ok(RunOutcome::ok())
        }
        Command::Count { expr } => {
            let query = Query::new(expr.unwrap_or_default());
            let count = settings.client()?.count(&query).await?;
            emit_json(json!({ "count": count }), color_mode);
            Ok(RunOutcome::ok())
        }
        Command::Export {
            expr,
            mode,
            encoding,
            max_events,
        } => {
            let mut request = ExportRequest::new(expr.unwrap_or_default())
                .mode(mode.into())
                .encoding(encoding.into());
            if let Some(max_events) = max_events {
                request = request.max_events(max_events);
            }
            let session = settings.client()?.export(request);
            stream_export(session).await
        }
        Command::Analyze => {
            let mut input = String::new();
            tokio::io::stdin()
                .read_to_string(&mut input)
                .await
                .map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to read job from stdin")
                        .with_source(err)
                })?;
            let outcome = analyze::run_job(&input, settings).await;
            emit_json(outcome.report, color_mode);
            if outcome.success {
                Ok(RunOutcome::ok())
            } else {
                Ok(RunOutcome::with_code(1))
            }
        }
    }
}

async fn stream_export(mut session: ExportSession) -> Result<RunOutcome, Error> {
    let stdout = io::stdout();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let next = tokio::select! {
            biased;
            _ = &mut ctrl_c => {
                info!("interrupted; cancelling export");
                session.cancel().await?;
                return Ok(RunOutcome::ok());
            }
            next = session.next_record() => next?,
        };
        let Some(record) = next else {
            return Ok(RunOutcome::ok());
        };
        match write_record(&stdout, &record) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                info!("stdout closed; cancelling export");
                session.cancel().await?;
                return Ok(RunOutcome::ok());
            }
            Err(err) => {
                return Err(Error::new(ErrorKind::Io)
                    .with_message("failed to write record")
                    .with_source(err));
            }
        }
    }
}

fn write_record(stdout: &io::Stdout, record: &Record) -> io::Result<()> {
    let mut out = stdout.lock();
    serde_json::to_writer(&mut out, &record.to_json()).map_err(io::Error::from)?;
    out.write_all(b"\n")?;
    out.flush()
}
