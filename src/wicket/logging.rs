use std::{io, path::Path};

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::wicket::config;

/// Keeps the non-blocking writer's worker thread alive; dropping it flushes
/// and stops log output.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

pub fn init(cfg: &config::LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    // RUST_LOG wins over the config file when set.
    let filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => EnvFilter::try_new(filter_directive(&cfg.level)).context("logging: filter")?,
    };

    let (writer, guard) = writer_for(cfg.output.trim())?;
    let json = cfg.format.trim().eq_ignore_ascii_case("json");

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(!json)
        .with_target(true)
        .with_file(cfg.add_source)
        .with_line_number(cfg.add_source);
    let layer = if json { layer.json().boxed() } else { layer.boxed() };

    tracing_subscriber::registry().with(filter).with(layer).init();

    Ok(LoggingRuntime { _guard: guard })
}

fn filter_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        // Unknown levels fall back rather than erroring out at startup.
        _ => "info",
    }
}

fn writer_for(output: &str) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    match output {
        "" | "stderr" => Ok(tracing_appender::non_blocking(io::stderr())),
        "stdout" => Ok(tracing_appender::non_blocking(io::stdout())),
        "discard" => Ok(tracing_appender::non_blocking(io::sink())),
        path => {
            let path = Path::new(path);
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("logging: create {}", dir.display()))?;
            }
            let file = std::fs::File::options()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("logging: open {}", path.display()))?;
            Ok(tracing_appender::non_blocking(file))
        }
    }
}
