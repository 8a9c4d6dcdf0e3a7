use std::path::PathBuf;

use courier_models::errors::SendableError;
use log::info;

use crate::logger::{self, print_env};

#[derive(Debug, Clone, Default)]
pub struct StartupOptions {
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

pub fn startup(name: &str, options: &StartupOptions) -> Result<(), SendableError> {
    logger::setup_logger(
        logger::parse_level(&options.log_level),
        options.log_file.as_deref(),
    )?;
    log_panics::init();

    info!("--- {} ---", name);
    print_env()?;

    Ok(())
}
