//! Tracing subscriber setup

use std::io::IsTerminal;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use modal_core::{ModalError, ModalResult};

use crate::LogConfig;

/// Install the global subscriber
///
/// `RUST_LOG` takes precedence over `config.filter`. Fails if a subscriber
/// is already installed.
pub fn init_tracing(config: &LogConfig) -> ModalResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| ModalError::InvalidConfig(format!("log filter: {e}")))?;

    let result = if config.json {
        Registry::default()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        Registry::default()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_ansi(std::io::stderr().is_terminal())
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };

    result.map_err(|e| ModalError::InvalidConfig(format!("tracing: {e}")))
}
