use std::{env, path::Path, time::SystemTime};

use courier_models::errors::SendableError;
use log::{LevelFilter, info};

/// Installs the process-wide logger. Output always goes to stdout and is
/// mirrored to `log_file` when one is supplied.
pub fn setup_logger(level: LevelFilter, log_file: Option<&Path>) -> Result<(), SendableError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339_seconds(SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .level_for("aws_smithy_runtime", LevelFilter::Warn)
        .level_for("aws_config", LevelFilter::Warn)
        .level_for("hyper", LevelFilter::Warn)
        .chain(std::io::stdout());

    if let Some(path) = log_file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}

pub fn parse_level(value: &str) -> LevelFilter {
    value.parse().unwrap_or(LevelFilter::Info)
}

pub fn print_env() -> std::io::Result<()> {
    let path = env::current_dir()?;
    info!("The current directory is {}", path.display());
    Ok(())
}
