use crate::Cli;

pub mod logger;

/// Installs the global tracing subscriber from the `-d`, `--log-mode` and
/// `--log-file` options.
pub fn start(cli: &Cli) -> anyhow::Result<()> {
    logger::log(
        cli.debug.into(),
        cli.log_mode.unwrap_or_default().into(),
        cli.log_file.as_ref(),
    )
}
