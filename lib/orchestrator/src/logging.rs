// SPDX-License-Identifier: Apache-2.0

//! Logging setup for orchestrator processes.
//!
//! Filters are configured with the `STASH_LOG` environment variable using the
//! usual comma-separated `target=level` directives. The default level is
//! `info`.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// ENV used to set the log filter
const FILTER_ENV: &str = "STASH_LOG";

/// Default log level
const DEFAULT_FILTER_LEVEL: &str = "info";

/// Once instance to ensure the subscriber is only installed once
static INIT: Once = Once::new();

/// Install the global tracing subscriber. Safe to call more than once; only
/// the first call has any effect.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(FILTER_ENV)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER_LEVEL));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    });
}
