use std::{fs::File, io, path::PathBuf, sync::Arc};

use tracing::{subscriber, trace, Level};
use tracing_subscriber::{
    fmt::{
        format::{Compact, DefaultFields, Format, Json, JsonFields, Pretty},
        SubscriberBuilder,
    },
    EnvFilter, FmtSubscriber,
};

use crate::LogMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Info,
    Debug,
    Trace,
}

impl From<u8> for Verbosity {
    fn from(v: u8) -> Self {
        match v {
            0 => Verbosity::Info,
            1 => Verbosity::Debug,
            _ => Verbosity::Trace,
        }
    }
}

impl From<Verbosity> for Level {
    fn from(v: Verbosity) -> Self {
        match v {
            Verbosity::Info => Level::INFO,
            Verbosity::Debug => Level::DEBUG,
            Verbosity::Trace => Level::TRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    Full,
    Json,
    Compact,
}

impl From<LogMode> for LoggingMode {
    fn from(mode: LogMode) -> Self {
        match mode {
            LogMode::Full => LoggingMode::Full,
            LogMode::Json => LoggingMode::Json,
            LogMode::Compact => LoggingMode::Compact,
        }
    }
}

fn standard_fmt(level: Level) -> SubscriberBuilder {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_line_number(true)
        .with_file(true)
}

fn compact_fmt(level: Level) -> SubscriberBuilder<DefaultFields, Format<Compact>> {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
}

fn full_fmt(level: Level) -> SubscriberBuilder<Pretty, Format<Pretty>> {
    standard_fmt(level).pretty()
}

fn json_fmt(level: Level) -> SubscriberBuilder<JsonFields, Format<Json>> {
    standard_fmt(level).json().flatten_event(true)
}

/// Finishes `$builder` writing into `$file` when one could be created, and
/// into stderr otherwise so stdout stays free for reports.
macro_rules! install {
    ($builder:expr, $file:expr) => {{
        let builder = $builder;
        match $file {
            Some(file) => subscriber::set_global_default(
                builder.with_ansi(false).with_writer(file).finish(),
            ),
            None => subscriber::set_global_default(builder.with_writer(io::stderr).finish()),
        }
    }};
}

pub fn log(
    verbosity: Verbosity,
    mode: LoggingMode,
    log_file: Option<&PathBuf>,
) -> anyhow::Result<()> {
    let level: Level = verbosity.into();
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env()?;

    let file = match log_file.map(File::create) {
        Some(Ok(file)) => Some(Arc::new(file)),
        Some(Err(err)) => {
            eprintln!("Failed to create log file {:?}: {err}", log_file);
            None
        }
        None => None,
    };

    match mode {
        LoggingMode::Compact => install!(compact_fmt(level).with_env_filter(env_filter), file)?,
        LoggingMode::Json => install!(json_fmt(level).with_env_filter(env_filter), file)?,
        LoggingMode::Full => install!(full_fmt(level).with_env_filter(env_filter), file)?,
    }
    trace!(set_level = %level, "log level set");

    Ok(())
}
