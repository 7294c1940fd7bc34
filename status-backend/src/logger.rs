use std::{error::Error, fs::File, path::Path, str::FromStr, sync::Arc};
use tracing_subscriber::{
    filter::{self, LevelFilter},
    fmt::writer::BoxMakeWriter,
    prelude::*,
};

/// Dependencies whose own logs only drown the test traffic.
const QUIET_TARGETS: &[&str] = &["tungstenite", "reqwest", "hyper", "rustls", "mio", "want"];

fn is_loud(target: &str) -> bool {
    QUIET_TARGETS.iter().any(|prefix| target.starts_with(prefix))
}

/// Install the global subscriber: stdout, plus `log_file` when given.
pub fn setup_logger(log_level: LevelFilter, log_file: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let file_log = match log_file {
        Some(path) => {
            let file = File::create(path)?;
            let writer = BoxMakeWriter::new(Arc::new(file));
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_file(false),
            )
        }
        None => None,
    };

    let stdout_log = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(false);

    tracing_subscriber::registry()
        .with(
            stdout_log
                .and_then(file_log)
                .with_filter(log_level)
                .with_filter(filter::filter_fn(|metadata| !is_loud(metadata.target()))),
        )
        .try_init()?;

    Ok(())
}

/// Parse LOG_LEVEL environment variable.
pub fn parse_log_level() -> Result<Option<LevelFilter>, Box<dyn Error>> {
    if let Ok(l) = std::env::var("LOG_LEVEL") {
        Ok(Some(LevelFilter::from_str(&l)?))
    } else {
        Ok(None)
    }
}
