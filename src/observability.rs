//! Tracing bootstrap for embedding hosts.
//!
//! The runtime only *emits* `tracing` events; it never requires this
//! installer. Hosts that already run their own subscriber skip it and the
//! events flow there instead.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::types::LogFormat;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Install the crate's default subscriber once for the process, in the
/// format configured by [`Config::log_format`](crate::Config). The filter
/// comes from `RUST_LOG` and defaults to `info`.
pub fn init_tracing(format: LogFormat) {
    TRACING_INIT.get_or_init(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);
        let result = match format {
            LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
            LogFormat::Text => registry
                .with(fmt::layer().with_target(false).compact())
                .try_init(),
        };
        if let Err(err) = result {
            // The host beat us to it; its subscriber receives our events.
            eprintln!("tracing init skipped: {err}");
        }
    });
}
