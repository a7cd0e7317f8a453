//! Log output for the smoke run. Events go to stderr so the window dump on
//! stdout stays readable.

use std::{env, io};

use tracing_subscriber::EnvFilter;

const FALLBACK_DIRECTIVES: &str = "info,sync_smoke=debug,sync_gateway=debug,sync_core=debug";

/// Consulted after `RUST_LOG`, most specific first.
const FILTER_VARS: [&str; 2] = ["CHATSYNC_SMOKE_LOG", "CHATSYNC_LOG"];

pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives(|key| env::var(key).ok())));
    let _ = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_target(true)
        .with_env_filter(filter)
        .try_init();
}

/// First non-blank, parseable value among [`FILTER_VARS`].
fn directives(lookup: impl Fn(&str) -> Option<String>) -> String {
    FILTER_VARS
        .iter()
        .filter_map(|key| lookup(*key))
        .map(|value| value.trim().to_owned())
        .find(|value| !value.is_empty() && EnvFilter::try_new(value).is_ok())
        .unwrap_or_else(|| FALLBACK_DIRECTIVES.to_owned())
}
