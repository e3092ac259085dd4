//! Tracing subscriber setup for the server binary.

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit one JSON object per event instead of compact text.
    pub json: bool,
    /// Forces `debug` for this crate regardless of `level`.
    pub debug: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig { level: "info".into(), json: false, debug: false }
    }
}

impl LogConfig {
    /// The directive the subscriber is built from when `RUST_LOG` is not set.
    pub fn directive(&self) -> String {
        if self.debug {
            format!("{},starberry_as=debug", self.level)
        } else {
            self.level.clone()
        }
    }
}

/// Installs the global subscriber. Fails if one is already set.
pub fn init(config: &LogConfig) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.directive()));
    let registry = tracing_subscriber::registry().with(filter);

    if config.json {
        registry.with(fmt::layer().json().with_target(true)).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    }
}
