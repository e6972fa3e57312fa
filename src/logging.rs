//! Log routing
//!
//! Every subsystem logs under its own target so that the `logging` section
//! of the settings can tune them independently. Context such as the ship,
//! container or image being worked on is carried by spans, so nested events
//! are rendered with it.

use crate::settings::{LogFormat, LoggingSettings};
use tracing_subscriber::EnvFilter;

/// Container lifecycle events
pub const CONTAINER: &str = "dominator::container";
/// Image bookkeeping events
pub const IMAGE: &str = "dominator::image";
/// Pull progress reported by the engine
pub const DOCKER_PULL: &str = "dominator::docker::pull";
/// Push progress reported by the engine
pub const DOCKER_PUSH: &str = "dominator::docker::push";
/// Build output reported by the engine
pub const DOCKER_BUILD: &str = "dominator::docker::build";
/// Output relayed from remote ambassador containers
pub const DOCKER_LOGS: &str = "dominator::docker::logs";

/// Build the filter directives from settings and the CLI level
///
/// The CLI level wins over `logging.level`; per-target levels are appended
/// so they override the base.
pub fn directives(settings: &LoggingSettings, cli_level: Option<&str>) -> String {
    let base = cli_level
        .or(settings.level.as_deref())
        .unwrap_or("warn")
        .to_lowercase();
    let base = match base.as_str() {
        "warning" => "warn",
        "critical" | "fatal" => "error",
        other => other,
    }
    .to_string();

    let mut parts = vec![base];
    for (target, level) in &settings.targets {
        parts.push(format!("{}={}", target, level.to_lowercase()));
    }
    parts.join(",")
}

/// Install the global subscriber. `RUST_LOG` overrides everything.
pub fn init(settings: &LoggingSettings, cli_level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives(settings, cli_level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(settings.ansi.unwrap_or(true));

    let result = match settings.format {
        LogFormat::Full => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    if let Err(e) = result {
        eprintln!("logging already initialized: {}", e);
    }
}
