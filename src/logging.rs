// src/logging.rs

use std::env;
use tracing_subscriber::EnvFilter;

/// Setting this to `json` switches the subscriber to one JSON object per line.
pub const FORMAT_VARIABLE: &str = "UNLOCK_LOG_FORMAT";

/// Maps the `-v` count minus the `-q` count onto a default filter.
pub fn level_for(verbosity: i8) -> &'static str {
    match verbosity {
        i8::MIN..=-2 => "error",
        -1 => "warn",
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides the verbosity flags.
pub fn init(verbosity: i8) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for(verbosity)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match env::var(FORMAT_VARIABLE).as_deref() {
        Ok("json") => builder.json().try_init(),
        _ => builder.try_init(),
    }
}
