//! isolator-worker: executes one isolated request.
//!
//! Reads the request payload from stdin until EOF, runs it, and writes the
//! response to stderr. Failures before a response exists are printed as
//! `Fatal error: ...` so the orchestrator can still recover them.

mod bundles;

use std::io::{self, Write};

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use isolator::WorkerContext;

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("ISOLATOR_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("info") => "info",
            Ok("error") => "error",
            Ok("off") => "off",
            _ => "warn",
        };

        EnvFilter::new(format!(
            "isolator={level},isolator_worker={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    // Logs share stderr with the response; anything before the separator is tolerated.
    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_ansi(false).with_writer(io::stderr));
        let _ = subscriber.try_init();
    }
}

fn run() -> anyhow::Result<i32> {
    let mut ctx = WorkerContext::new(bundles::builtin());
    let mut stdin = io::stdin().lock();
    let mut stderr = io::stderr();

    let code = isolator::worker::execute_from(&mut ctx, &mut stdin, &mut stderr)
        .context("worker could not produce a response")?;
    Ok(code)
}

fn main() {
    init_tracing();

    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            tracing::debug!(error = %e, "Worker failed before responding");
            let mut stderr = io::stderr();
            let _ = writeln!(stderr, "Fatal error: {e:#}");
            let _ = stderr.flush();
            1
        }
    };

    let _ = io::stdout().flush();
    std::process::exit(code);
}
