use std::fs;
use std::sync::OnceLock;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{KvError, Result};

static INIT: OnceLock<()> = OnceLock::new();

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init(config: &LoggingConfig) -> Result<()> {
    if INIT.get().is_some() {
        return Ok(());
    }

    let file_layer = match &config.directory {
        Some(dir) => {
            fs::create_dir_all(dir)
                .map_err(|e| KvError::config(format!("Failed to create log directory: {}", e)))?;

            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("shardkv")
                .filename_suffix("log")
                .build(dir)
                .map_err(|e| KvError::config(format!("Failed to create file appender: {}", e)))?;

            Some(
                fmt::Layer::new()
                    .json()
                    .with_writer(appender)
                    .with_file(true)
                    .with_line_number(true)
                    .with_thread_ids(true)
                    .with_target(true)
                    .with_ansi(false)
                    .with_filter(filter(&config.level)),
            )
        }
        None => None,
    };

    let subscriber = tracing_subscriber::registry()
        .with(
            fmt::Layer::new()
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(true)
                .with_target(true)
                .with_filter(filter(&config.level)),
        )
        .with(file_layer);

    // Another subscriber may already be installed, e.g. by test-log
    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        let _ = tracing_log::LogTracer::init();
    }
    let _ = INIT.set(());
    Ok(())
}
