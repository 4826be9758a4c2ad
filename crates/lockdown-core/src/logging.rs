//! Tracing subscriber setup for hosts that do not install their own.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "lockdown_core=info";

/// Install a registry with an env filter and a fmt layer.
///
/// `RUST_LOG` wins over `filter`; an unparsable filter falls back to
/// [`DEFAULT_FILTER`]. Returns `false` when a global subscriber was already
/// set, which is not an error.
pub fn init(filter: Option<&str>) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(filter.unwrap_or(DEFAULT_FILTER)).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_harmless() {
        init(Some("lockdown_core=debug"));
        assert!(!init(None));
        tracing::debug!("still logging");
    }
}
